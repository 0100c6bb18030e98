//! Key identifiers and public key sets

use std::{collections::HashMap, fmt, sync::Arc};

use aliri_braid::braid;
use serde::Deserialize;

use crate::{error, jws, RsaPublicKey};

/// An identifier for a key, as carried in the `kid` header
#[braid(serde, ref_doc = "A borrowed reference to a [`KeyId`]")]
pub struct KeyId;

/// A set of verification keys indexed by key id
#[derive(Clone, Default)]
pub struct PublicKeys {
    keys: HashMap<KeyId, Arc<dyn jws::Verifier>>,
}

impl fmt::Debug for PublicKeys {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PublicKeys")
            .field("kids", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PublicKeys {
    /// Adds a key to the set, replacing any key with the same id
    pub fn insert(&mut self, kid: KeyId, key: impl jws::Verifier + 'static) {
        self.keys.insert(kid, Arc::new(key));
    }

    /// Looks up a key by id
    #[must_use]
    pub fn get(&self, kid: &KeyIdRef) -> Option<&dyn jws::Verifier> {
        self.keys.get(kid).map(|k| &**k)
    }

    /// The number of keys in the set
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set holds no keys
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Parses the RSA signing keys out of a JSON Web Key Set document
    ///
    /// Keys of other types, or without a `kid`, are skipped.
    ///
    /// # Errors
    ///
    /// The document is not a key set, or one of its RSA keys is invalid.
    pub fn from_jwks_json(json: &[u8]) -> Result<Self, error::KeyRejected> {
        let jwks: JwksDto = serde_json::from_slice(json)
            .map_err(|e| error::key_rejected_by("malformed key set", e))?;

        let mut keys = Self::default();
        for jwk in jwks.keys {
            match jwk {
                JwkDto {
                    kty,
                    kid: Some(kid),
                    n: Some(n),
                    e: Some(e),
                } if kty == "RSA" => {
                    keys.insert(kid, RsaPublicKey::from_components(&n, &e)?);
                }
                other => {
                    tracing::trace!(kty = %other.kty, "skipping unsupported key in key set");
                }
            }
        }
        Ok(keys)
    }
}

#[derive(Deserialize)]
struct JwksDto {
    keys: Vec<JwkDto>,
}

#[derive(Deserialize)]
struct JwkDto {
    kty: String,
    #[serde(default)]
    kid: Option<KeyId>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}
