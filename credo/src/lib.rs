//! Credential lifecycle management and token exchange for cloud service clients
//!
//! A [`Credential`] wraps one of several kinds of identity (a service account
//! key, an end user's OAuth2 grant, an API key, the identity of a compute
//! instance, a federated third-party identity, or an impersonated service
//! account) and keeps itself supplied with a valid [`Token`].
//!
//! Tokens are checked against a [`Clock`][credo_clock::Clock] with a skew
//! tolerance before use. An expired or missing token is refreshed through the
//! credential's issuing authority, with at most one refresh in flight per
//! credential: concurrent callers wait on the same refresh and all receive
//! its outcome.
//!
//! Credentials can be constructed directly, loaded from a credential file
//! with [`Credential::from_json`], or found in the environment with
//! [`discover`].
//!
//! ```
//! use credo::{ApiKey, Context, Credential};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), credo::Error> {
//! let credential = Credential::new(ApiKey::new("my-api-key")?, Context::default())
//!     .with_quota_project("billing-project");
//!
//! let headers = credential.headers().await?;
//! assert_eq!(headers["x-goog-api-key"], "my-api-key");
//! assert_eq!(headers["x-goog-user-project"], "billing-project");
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! * `reqwest` (default): provides [`ReqwestTransport`], the default
//!   [`Context`], and [`discover`].
//! * `rustls-tls` (default) or `native-tls`: selects the TLS implementation
//!   used by `reqwest`.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
mod context;
mod coordinator;
mod credential;
pub mod discovery;
mod env;
mod error;
pub mod sources;
mod token;
pub mod transport;

#[cfg(test)]
pub(crate) mod test;

pub use braids::*;
pub use context::Context;
pub use coordinator::RefreshOptions;
pub use credential::{
    Credential, CredentialKind, CredentialVariant, RefreshContext, QUOTA_PROJECT_HEADER,
};
#[cfg(feature = "reqwest")]
pub use discovery::discover;
pub use discovery::{discover_with, DiscoveryOptions, Probe};
pub use env::{Env, MapEnv, ProcessEnv};
pub use error::{Error, ErrorKind};
pub use sources::{
    verify_id_token, ApiKey, ClientAuth, ComputeMetadata, ExternalAccount, IdTokenCredential,
    Impersonated, ServiceAccount, UserAccount, UserAccountConfig,
};
pub use token::{Token, TokenKind};
#[cfg(feature = "reqwest")]
pub use transport::ReqwestTransport;
