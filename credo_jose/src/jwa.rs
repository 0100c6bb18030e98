//! JSON Web Algorithms supported for signing and verification

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// A JWS signing algorithm
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
#[non_exhaustive]
pub enum Algorithm {
    /// RSASSA-PKCS1-v1_5 using SHA-256
    RS256,
    /// ECDSA using P-256 and SHA-256
    ES256,
    /// HMAC using SHA-256
    HS256,
}

impl Algorithm {
    /// The algorithm's name as it appears in a JWT header
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RS256 => "RS256",
            Self::ES256 => "ES256",
            Self::HS256 => "HS256",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The provided name does not match a supported algorithm
#[derive(Debug, thiserror::Error)]
#[error("'{0}' does not match supported algorithms")]
pub struct UnknownAlgorithm(String);

impl FromStr for Algorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RS256" => Ok(Self::RS256),
            "ES256" => Ok(Self::ES256),
            "HS256" => Ok(Self::HS256),
            _ => Err(UnknownAlgorithm(s.to_owned())),
        }
    }
}
