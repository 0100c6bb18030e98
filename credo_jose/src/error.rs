//! Common errors

use std::error::Error as StdError;

use thiserror::Error;

use crate::jwa;

/// The key material could not be loaded
#[derive(Debug, Error)]
#[error("key rejected: {reason}")]
pub struct KeyRejected {
    reason: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl KeyRejected {
    /// Why the key was rejected
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

pub(crate) fn key_rejected(reason: impl Into<String>) -> KeyRejected {
    KeyRejected {
        reason: reason.into(),
        source: None,
    }
}

pub(crate) fn key_rejected_by(
    reason: impl Into<String>,
    source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
) -> KeyRejected {
    KeyRejected {
        reason: reason.into(),
        source: Some(source.into()),
    }
}

/// An error occurring while creating a signature
#[derive(Debug, Error)]
pub enum SigningError {
    /// The key cannot produce signatures with this algorithm
    #[error("key incompatible with algorithm '{0}'")]
    IncompatibleAlgorithm(jwa::Algorithm),

    /// The underlying cryptographic provider failed
    #[error("signature could not be produced")]
    Unexpected,
}

/// An error occurring while building a JWT
#[derive(Debug, Error)]
pub enum EncodeError {
    /// A claim required for encoding is missing or inconsistent
    #[error("invalid claims: {0}")]
    InvalidClaims(&'static str),

    /// The header or payload could not be serialized
    #[error("unable to serialize token section")]
    Serialization(#[from] serde_json::Error),

    /// The signer failed
    #[error(transparent)]
    Signing(#[from] SigningError),
}

/// An error occurring while verifying a JWT
///
/// Every variant is a rejection; verification fails closed.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The token is not a well-formed compact JWT
    #[error("malformed token: {0}")]
    Malformed(&'static str),

    /// The token header does not name a key
    #[error("token header has no key id")]
    MissingKeyId,

    /// The token names a key that is not in the key set
    #[error("unknown key id '{0}'")]
    UnknownKeyId(String),

    /// The key cannot verify signatures made with the token's algorithm
    #[error("algorithm '{0}' not supported by the selected key")]
    UnsupportedAlgorithm(jwa::Algorithm),

    /// The signature does not match the token contents
    #[error("bad signature")]
    BadSignature,

    /// The token's `exp` claim has passed
    #[error("token expired")]
    Expired,

    /// The token's `iat` claim is in the future
    #[error("token not yet valid")]
    NotYetValid,

    /// The token's `aud` claim does not contain the expected audience
    #[error("wrong audience")]
    WrongAudience,

    /// The token's `iss` claim does not match the expected issuer
    #[error("wrong issuer")]
    WrongIssuer,
}

impl VerifyError {
    /// A short, stable name for the rejection cause
    #[must_use]
    pub fn cause(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed token",
            Self::MissingKeyId => "missing key id",
            Self::UnknownKeyId(_) => "unknown key id",
            Self::UnsupportedAlgorithm(_) => "unsupported algorithm",
            Self::BadSignature => "bad signature",
            Self::Expired => "expired",
            Self::NotYetValid => "not yet valid",
            Self::WrongAudience => "wrong audience",
            Self::WrongIssuer => "wrong issuer",
        }
    }

    /// Whether the error is due to a signature mismatch
    #[must_use]
    pub fn is_signature_mismatch(&self) -> bool {
        matches!(self, Self::BadSignature)
    }
}
