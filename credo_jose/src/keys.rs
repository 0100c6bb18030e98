use std::{fmt, io::BufReader, sync::Arc};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ring::{
    rand::SystemRandom,
    signature::{self, KeyPair},
};

use crate::{error, jwa, jws};

/// An RSA private key used for RS256 signatures
#[derive(Clone)]
#[must_use]
pub struct RsaPrivateKey {
    key_pair: Arc<signature::RsaKeyPair>,
}

impl fmt::Debug for RsaPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RsaPrivateKey")
            .field("modulus_bits", &(self.key_pair.public().modulus_len() * 8))
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl RsaPrivateKey {
    /// Imports an RSA key pair from a PEM document
    ///
    /// Both PKCS#8 (`BEGIN PRIVATE KEY`) and PKCS#1 (`BEGIN RSA PRIVATE KEY`)
    /// encodings are accepted.
    ///
    /// # Errors
    ///
    /// The document holds no RSA private key, or the key is unusable.
    pub fn from_pem(pem: &str) -> Result<Self, error::KeyRejected> {
        let mut reader = BufReader::new(pem.as_bytes());
        loop {
            let item = rustls_pemfile::read_one(&mut reader)
                .map_err(|e| error::key_rejected_by("unreadable PEM document", e))?;
            match item {
                Some(rustls_pemfile::Item::Pkcs8Key(key)) => {
                    return Self::from_pkcs8_der(key.secret_pkcs8_der());
                }
                Some(rustls_pemfile::Item::Pkcs1Key(key)) => {
                    let key_pair = signature::RsaKeyPair::from_der(key.secret_pkcs1_der())
                        .map_err(|e| error::key_rejected(e.to_string()))?;
                    return Ok(Self {
                        key_pair: Arc::new(key_pair),
                    });
                }
                Some(_) => continue,
                None => return Err(error::key_rejected("no RSA private key in PEM document")),
            }
        }
    }

    /// Imports an RSA key pair from PKCS#8 DER bytes
    ///
    /// # Errors
    ///
    /// The bytes are not a usable RSA key.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, error::KeyRejected> {
        let key_pair =
            signature::RsaKeyPair::from_pkcs8(der).map_err(|e| error::key_rejected(e.to_string()))?;
        Ok(Self {
            key_pair: Arc::new(key_pair),
        })
    }

    /// The public half of this key pair
    pub fn public_key(&self) -> RsaPublicKey {
        RsaPublicKey {
            der: self.key_pair.public_key().as_ref().to_vec(),
        }
    }
}

impl jws::Signer for RsaPrivateKey {
    fn algorithm(&self) -> jwa::Algorithm {
        jwa::Algorithm::RS256
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, error::SigningError> {
        let mut sig = vec![0; self.key_pair.public().modulus_len()];
        self.key_pair
            .sign(
                &signature::RSA_PKCS1_SHA256,
                &SystemRandom::new(),
                data,
                &mut sig,
            )
            .map_err(|_| error::SigningError::Unexpected)?;
        Ok(sig)
    }
}

/// An RSA public key used to verify RS256 signatures
#[derive(Clone, PartialEq, Eq)]
#[must_use]
pub struct RsaPublicKey {
    /// DER-encoded `RSAPublicKey`
    der: Vec<u8>,
}

impl fmt::Debug for RsaPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RsaPublicKey")
            .field("der_len", &self.der.len())
            .finish()
    }
}

impl RsaPublicKey {
    /// Constructs a public key from the base64url-encoded modulus and exponent,
    /// as found in a JWK
    ///
    /// # Errors
    ///
    /// The components are not valid base64url or the modulus is too short.
    pub fn from_components(modulus: &str, exponent: &str) -> Result<Self, error::KeyRejected> {
        let n = URL_SAFE_NO_PAD
            .decode(modulus)
            .map_err(|e| error::key_rejected_by("modulus is not base64url", e))?;
        let e = URL_SAFE_NO_PAD
            .decode(exponent)
            .map_err(|e| error::key_rejected_by("exponent is not base64url", e))?;

        if n.len() < 256 {
            return Err(error::key_rejected("key modulus must be at least 2048 bits"));
        }

        Ok(Self {
            der: der_rsa_public_key(&n, &e),
        })
    }
}

impl jws::Verifier for RsaPublicKey {
    fn can_verify(&self, alg: jwa::Algorithm) -> bool {
        alg == jwa::Algorithm::RS256
    }

    fn verify(
        &self,
        alg: jwa::Algorithm,
        data: &[u8],
        sig: &[u8],
    ) -> Result<(), error::VerifyError> {
        if !self.can_verify(alg) {
            return Err(error::VerifyError::UnsupportedAlgorithm(alg));
        }

        signature::UnparsedPublicKey::new(&signature::RSA_PKCS1_2048_8192_SHA256, &self.der)
            .verify(data, sig)
            .map_err(|_| error::VerifyError::BadSignature)
    }
}

/// Encodes an `RSAPublicKey ::= SEQUENCE { modulus INTEGER, publicExponent INTEGER }`
fn der_rsa_public_key(n: &[u8], e: &[u8]) -> Vec<u8> {
    fn integer(bytes: &[u8]) -> Vec<u8> {
        let trimmed = match bytes.iter().position(|&b| b != 0) {
            Some(idx) => &bytes[idx..],
            None => &[0u8][..],
        };
        let mut content = Vec::with_capacity(trimmed.len() + 1);
        if trimmed[0] & 0x80 != 0 {
            content.push(0);
        }
        content.extend_from_slice(trimmed);
        tagged(0x02, &content)
    }

    fn tagged(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        let len = content.len();
        if len < 0x80 {
            out.push(len as u8);
        } else {
            let len_bytes: Vec<u8> = len
                .to_be_bytes()
                .iter()
                .copied()
                .skip_while(|&b| b == 0)
                .collect();
            out.push(0x80 | len_bytes.len() as u8);
            out.extend_from_slice(&len_bytes);
        }
        out.extend_from_slice(content);
        out
    }

    let mut body = integer(n);
    body.extend(integer(e));
    tagged(0x30, &body)
}

/// A P-256 ECDSA private key used for ES256 signatures
#[must_use]
pub struct EcdsaPrivateKey {
    key_pair: signature::EcdsaKeyPair,
    rng: SystemRandom,
}

impl fmt::Debug for EcdsaPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("EcdsaPrivateKey { private_key: <redacted> }")
    }
}

impl EcdsaPrivateKey {
    /// Generates a new P-256 key pair
    ///
    /// # Errors
    ///
    /// The random number generator failed.
    pub fn generate() -> Result<Self, error::KeyRejected> {
        let rng = SystemRandom::new();
        let pkcs8 = signature::EcdsaKeyPair::generate_pkcs8(
            &signature::ECDSA_P256_SHA256_FIXED_SIGNING,
            &rng,
        )
        .map_err(|_| error::key_rejected("unable to generate key"))?;
        Self::from_pkcs8_der(pkcs8.as_ref())
    }

    /// Imports a P-256 key pair from PKCS#8 DER bytes
    ///
    /// # Errors
    ///
    /// The bytes are not a usable P-256 key.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, error::KeyRejected> {
        let rng = SystemRandom::new();
        let key_pair = signature::EcdsaKeyPair::from_pkcs8(
            &signature::ECDSA_P256_SHA256_FIXED_SIGNING,
            der,
            &rng,
        )
        .map_err(|e| error::key_rejected(e.to_string()))?;
        Ok(Self { key_pair, rng })
    }

    /// The public half of this key pair
    pub fn public_key(&self) -> EcdsaPublicKey {
        EcdsaPublicKey {
            point: self.key_pair.public_key().as_ref().to_vec(),
        }
    }
}

impl jws::Signer for EcdsaPrivateKey {
    fn algorithm(&self) -> jwa::Algorithm {
        jwa::Algorithm::ES256
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, error::SigningError> {
        let sig = self
            .key_pair
            .sign(&self.rng, data)
            .map_err(|_| error::SigningError::Unexpected)?;
        Ok(sig.as_ref().to_vec())
    }
}

/// A P-256 ECDSA public key, as an uncompressed curve point
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use]
pub struct EcdsaPublicKey {
    point: Vec<u8>,
}

impl EcdsaPublicKey {
    /// Constructs a public key from an uncompressed SEC1 point
    pub fn from_uncompressed_point(point: impl Into<Vec<u8>>) -> Self {
        Self {
            point: point.into(),
        }
    }
}

impl jws::Verifier for EcdsaPublicKey {
    fn can_verify(&self, alg: jwa::Algorithm) -> bool {
        alg == jwa::Algorithm::ES256
    }

    fn verify(
        &self,
        alg: jwa::Algorithm,
        data: &[u8],
        sig: &[u8],
    ) -> Result<(), error::VerifyError> {
        if !self.can_verify(alg) {
            return Err(error::VerifyError::UnsupportedAlgorithm(alg));
        }

        signature::UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_FIXED, &self.point)
            .verify(data, sig)
            .map_err(|_| error::VerifyError::BadSignature)
    }
}

/// An HMAC secret, usable both to sign and verify HS256 signatures
#[derive(Clone)]
#[must_use]
pub struct Hmac {
    key: ring::hmac::Key,
}

impl fmt::Debug for Hmac {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Hmac { secret }")
    }
}

impl Hmac {
    /// HMAC using the provided secret
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: ring::hmac::Key::new(ring::hmac::HMAC_SHA256, secret.as_ref()),
        }
    }
}

impl jws::Signer for Hmac {
    fn algorithm(&self) -> jwa::Algorithm {
        jwa::Algorithm::HS256
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, error::SigningError> {
        Ok(ring::hmac::sign(&self.key, data).as_ref().to_vec())
    }
}

impl jws::Verifier for Hmac {
    fn can_verify(&self, alg: jwa::Algorithm) -> bool {
        alg == jwa::Algorithm::HS256
    }

    fn verify(
        &self,
        alg: jwa::Algorithm,
        data: &[u8],
        sig: &[u8],
    ) -> Result<(), error::VerifyError> {
        if !self.can_verify(alg) {
            return Err(error::VerifyError::UnsupportedAlgorithm(alg));
        }

        ring::hmac::verify(&self.key, data, sig).map_err(|_| error::VerifyError::BadSignature)
    }
}
