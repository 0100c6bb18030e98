//! Signature primitives
//!
//! The engine never touches key bytes directly; it asks a [`Signer`] for a
//! signature over the encoded header and payload, and asks a [`Verifier`]
//! whether a signature matches.

use crate::{error, jwa};

/// A JWS signer
pub trait Signer: Send + Sync {
    /// The algorithm this signer produces signatures with
    fn algorithm(&self) -> jwa::Algorithm;

    /// Signs `data`, returning the raw signature bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying key cannot produce a signature.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, error::SigningError>;
}

/// A JWS verifier
pub trait Verifier: Send + Sync {
    /// Whether the specific algorithm provided is compatible
    /// with this verifier
    fn can_verify(&self, alg: jwa::Algorithm) -> bool;

    /// Verifies `signature` over `data` using the specified algorithm
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::UnsupportedAlgorithm`][error::VerifyError::UnsupportedAlgorithm]
    /// if the algorithm is incompatible with the key, or
    /// [`VerifyError::BadSignature`][error::VerifyError::BadSignature] if the signature
    /// does not match.
    fn verify(
        &self,
        alg: jwa::Algorithm,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), error::VerifyError>;
}

impl<T: Signer + ?Sized> Signer for &T {
    fn algorithm(&self) -> jwa::Algorithm {
        T::algorithm(self)
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, error::SigningError> {
        T::sign(self, data)
    }
}

impl<T: Signer + ?Sized> Signer for std::sync::Arc<T> {
    fn algorithm(&self) -> jwa::Algorithm {
        T::algorithm(self)
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, error::SigningError> {
        T::sign(self, data)
    }
}

impl<T: Verifier + ?Sized> Verifier for std::sync::Arc<T> {
    fn can_verify(&self, alg: jwa::Algorithm) -> bool {
        T::can_verify(self, alg)
    }

    fn verify(
        &self,
        alg: jwa::Algorithm,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), error::VerifyError> {
        T::verify(self, alg, data, signature)
    }
}
