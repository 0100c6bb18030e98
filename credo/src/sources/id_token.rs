//! Identity tokens minted for a specific audience

use std::sync::Arc;

use async_trait::async_trait;
use credo_clock::{Clock, UnixTime};
use credo_jose::{error::VerifyError, jwt, PublicKeys};

use super::non_empty;
use crate::{
    Credential, CredentialKind, CredentialVariant, Error, RefreshContext, Token, TokenKind,
};

/// A credential producing signed identity assertions for one audience
///
/// The assertion is obtained through a service account, the compute
/// metadata server, or impersonation of a service account.
#[derive(Debug)]
pub struct IdTokenCredential {
    audience: String,
    source: Arc<CredentialKind>,
}

impl IdTokenCredential {
    /// Constructs an ID token credential minting tokens through `source`
    ///
    /// # Errors
    ///
    /// The audience is empty, or `source` cannot mint ID tokens.
    pub fn new(source: &Credential, audience: impl Into<String>) -> Result<Self, Error> {
        let audience = audience.into();
        non_empty(&audience, "audience")?;
        match source.kind() {
            CredentialKind::ServiceAccount(_)
            | CredentialKind::ComputeMetadata(_)
            | CredentialKind::Impersonated(_) => {}
            other => {
                return Err(Error::configuration(format!(
                    "{} cannot mint ID tokens",
                    other.describe()
                )))
            }
        }
        Ok(Self {
            audience,
            source: source.kind_arc(),
        })
    }

    /// The audience tokens are minted for
    pub fn audience(&self) -> &str {
        &self.audience
    }
}

#[async_trait]
impl CredentialVariant for IdTokenCredential {
    async fn do_refresh(&self, rc: &RefreshContext<'_>) -> Result<Token, Error> {
        match &*self.source {
            CredentialKind::ServiceAccount(account) => {
                account.fetch_id_token(rc, &self.audience).await
            }
            CredentialKind::ComputeMetadata(metadata) => {
                metadata.fetch_id_token(rc, &self.audience).await
            }
            CredentialKind::Impersonated(impersonated) => {
                impersonated.fetch_id_token(rc, &self.audience).await
            }
            other => Err(Error::configuration(format!(
                "{} cannot mint ID tokens",
                other.describe()
            ))),
        }
    }

    fn describe(&self) -> String {
        format!("ID token for {} via {}", self.audience, self.source.describe())
    }
}

impl Credential {
    /// A credential minting ID tokens for `audience` through this credential
    ///
    /// # Errors
    ///
    /// The audience is empty, or this kind of credential cannot mint ID
    /// tokens.
    pub fn id_token(&self, audience: impl Into<String>) -> Result<Credential, Error> {
        let variant = IdTokenCredential::new(self, audience)?;
        Ok(Credential::new(variant, self.context().clone()))
    }
}

/// Wraps a compact JWT returned by `endpoint` as an ID token
///
/// The expiry is read from the token's `exp` claim without verification;
/// it is used only to schedule the next refresh.
pub(crate) fn token_from_jwt(raw: String, endpoint: &str, now: UnixTime) -> Result<Token, Error> {
    let raw = raw.trim().to_owned();
    let (expiry, email) = {
        let decoded = jwt::decode_unverified(jwt::JwtRef::from_str(&raw))
            .map_err(|e| Error::malformed_by(endpoint, "ID token is not a JWT", e))?;
        let claims = decoded.untrusted_claims();
        let email = claims
            .claim("email")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned);
        (claims.expiry(), email)
    };

    let token = Token::id(raw, now, expiry);
    Ok(match email {
        Some(email) => token.with_principal(email),
        None => token,
    })
}

/// Verifies an ID token's signature and claims
///
/// # Errors
///
/// The token is not an ID token, or fails verification.
pub fn verify_id_token<C: Clock + ?Sized>(
    token: &Token,
    keys: &PublicKeys,
    validation: &jwt::Validation,
    clock: &C,
) -> Result<jwt::Claims, Error> {
    if token.kind() != TokenKind::Id {
        return Err(VerifyError::Malformed("not an ID token").into());
    }
    let verified = jwt::verify(
        jwt::JwtRef::from_str(token.value().as_str()),
        keys,
        validation,
        clock,
    )?;
    Ok(verified.into_claims())
}
