//! Compact JSON Web Token signing and verification
//!
//! This crate provides the JWT pieces needed by a credential engine:
//!
//! * building and signing a claim set into a compact token ([`jwt::encode`]),
//! * inspecting a token without trusting it ([`jwt::decode_unverified`]),
//! * verifying a token against a set of public keys ([`jwt::verify`]).
//!
//! Signing and verification are expressed through the [`jws::Signer`] and
//! [`jws::Verifier`] traits, so callers can bring their own key material.
//! Implementations backed by [`ring`] are provided for RS256, ES256, and HS256.
//!
//! # Example
//!
//! ```
//! use credo_clock::{TestClock, UnixTime};
//! use credo_jose::{jwk, jwt, Hmac, PublicKeys};
//!
//! let key = Hmac::new(b"a shared secret of reasonable length".to_vec());
//! let claims = jwt::Claims::new("issuer", "subject", "my_api", UnixTime(100), UnixTime(200));
//!
//! let token = jwt::encode(&claims, &key, Some(jwk::KeyIdRef::from_str("k1"))).unwrap();
//!
//! let mut keys = PublicKeys::default();
//! keys.insert(jwk::KeyId::from_static("k1"), key);
//!
//! let validation = jwt::Validation::new(jwt::Audience::from_static("my_api"));
//! let verified = jwt::verify(&token, &keys, &validation, &TestClock::new(UnixTime(150))).unwrap();
//! assert_eq!(verified.claims(), &claims);
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod error;
pub mod jwa;
pub mod jwk;
pub mod jws;
pub mod jwt;
mod keys;

#[cfg(test)]
pub(crate) mod test;

#[doc(inline)]
pub use jwk::PublicKeys;
#[doc(inline)]
pub use jwt::{Jwt, JwtRef};
pub use keys::{EcdsaPrivateKey, EcdsaPublicKey, Hmac, RsaPrivateKey, RsaPublicKey};
