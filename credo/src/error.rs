//! The error taxonomy surfaced by credentials and discovery

use std::{error::Error as StdError, fmt, sync::Arc, time::Duration};

use credo_jose::error::VerifyError;
use thiserror::Error;

type Source = Arc<dyn StdError + Send + Sync + 'static>;

/// An error raised while constructing, discovering, or refreshing a credential
///
/// Errors are cheap to clone so that every caller waiting on a shared refresh
/// receives the same outcome.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Configuration is malformed or missing a required field
    #[error("invalid credential configuration: {message}")]
    Configuration {
        /// What was wrong with the configuration
        message: String,
        /// The underlying cause
        #[source]
        source: Option<Source>,
    },

    /// The probed environment does not provide this kind of credential
    #[error("credential unavailable: {message}")]
    Unavailable {
        /// Why the credential is unavailable
        message: String,
        /// The underlying cause
        #[source]
        source: Option<Source>,
    },

    /// The token endpoint could not be reached or rejected the request
    #[error("token exchange with {endpoint} failed{}", describe_status(*status, body))]
    TokenExchange {
        /// The endpoint that was called
        endpoint: String,
        /// The response status, if a response was received
        status: Option<u16>,
        /// The response body, if a response was received
        body: String,
        /// The underlying cause
        #[source]
        source: Option<Source>,
    },

    /// The endpoint reported success but the body could not be used
    #[error("malformed response from {endpoint}: {message}")]
    MalformedResponse {
        /// The endpoint that was called
        endpoint: String,
        /// What was wrong with the response
        message: String,
        /// The underlying cause
        #[source]
        source: Option<Source>,
    },

    /// A token failed verification
    #[error("verification failed: {}", VerifyError::cause(.0))]
    Verification(#[source] Arc<VerifyError>),

    /// A refresh did not complete within its time bound
    #[error("token refresh did not complete within {timeout:?}")]
    LockTimeout {
        /// The bound that was exceeded
        timeout: Duration,
    },
}

fn describe_status(status: Option<u16>, body: &str) -> String {
    match (status, body.is_empty()) {
        (Some(status), true) => format!(" with status {status}"),
        (Some(status), false) => format!(" with status {status}: {body}"),
        (None, false) => format!(": {body}"),
        (None, true) => String::new(),
    }
}

/// The broad category of an [`Error`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::Configuration`]
    Configuration,
    /// See [`Error::Unavailable`]
    Unavailable,
    /// See [`Error::TokenExchange`]
    TokenExchange,
    /// See [`Error::MalformedResponse`]
    MalformedResponse,
    /// See [`Error::Verification`]
    Verification,
    /// See [`Error::LockTimeout`]
    LockTimeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Configuration => "configuration",
            Self::Unavailable => "unavailable",
            Self::TokenExchange => "token exchange",
            Self::MalformedResponse => "malformed response",
            Self::Verification => "verification",
            Self::LockTimeout => "lock timeout",
        })
    }
}

impl Error {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn configuration_by(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Configuration {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    pub(crate) fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn unavailable_by(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    pub(crate) fn rejected(endpoint: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self::TokenExchange {
            endpoint: endpoint.into(),
            status: Some(status),
            body: body.into(),
            source: None,
        }
    }

    pub(crate) fn failed(endpoint: impl Into<String>, body: impl Into<String>) -> Self {
        Self::TokenExchange {
            endpoint: endpoint.into(),
            status: None,
            body: body.into(),
            source: None,
        }
    }

    pub(crate) fn unreachable(
        endpoint: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::TokenExchange {
            endpoint: endpoint.into(),
            status: None,
            body: String::new(),
            source: Some(Arc::new(source)),
        }
    }

    pub(crate) fn malformed(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            endpoint: endpoint.into(),
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn malformed_by(
        endpoint: impl Into<String>,
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::MalformedResponse {
            endpoint: endpoint.into(),
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    pub(crate) fn lock_timeout(timeout: Duration) -> Self {
        Self::LockTimeout { timeout }
    }

    /// The category of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Unavailable { .. } => ErrorKind::Unavailable,
            Self::TokenExchange { .. } => ErrorKind::TokenExchange,
            Self::MalformedResponse { .. } => ErrorKind::MalformedResponse,
            Self::Verification(_) => ErrorKind::Verification,
            Self::LockTimeout { .. } => ErrorKind::LockTimeout,
        }
    }

    /// Whether retrying the same operation later may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::TokenExchange | ErrorKind::LockTimeout)
    }

    /// The verification failure, if this is a verification error
    #[must_use]
    pub fn verify_error(&self) -> Option<&VerifyError> {
        match self {
            Self::Verification(e) => Some(e),
            _ => None,
        }
    }

    /// A stable process exit code for this error, following `sysexits.h`
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Configuration => 78,
            ErrorKind::Unavailable => 69,
            ErrorKind::TokenExchange | ErrorKind::LockTimeout => 75,
            ErrorKind::MalformedResponse => 76,
            ErrorKind::Verification => 77,
        }
    }
}

impl From<VerifyError> for Error {
    fn from(e: VerifyError) -> Self {
        Self::Verification(Arc::new(e))
    }
}
