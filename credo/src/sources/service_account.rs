//! Service accounts that sign their own token requests

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use credo_clock::{DurationSecs, UnixTime};
use credo_jose::{jwk, jws, jwt, RsaPrivateKey};

use super::{dto, id_token, non_empty, DEFAULT_SCOPE, DEFAULT_TOKEN_URI};
use crate::{
    transport::{self, HttpRequest},
    CredentialVariant, Error, Principal, PrincipalRef, RefreshContext, Token,
};

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// How long a self-signed assertion remains acceptable to the token endpoint
const ASSERTION_LIFETIME: DurationSecs = DurationSecs(3600);

/// A service account holding its own private key
///
/// Tokens are obtained by signing a JWT assertion with the key and trading it
/// at the token endpoint using the JWT bearer grant.
pub struct ServiceAccount {
    client_email: Principal,
    key_id: Option<jwk::KeyId>,
    signer: Arc<dyn jws::Signer>,
    token_uri: String,
    project_id: Option<String>,
}

impl fmt::Debug for ServiceAccount {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServiceAccount")
            .field("client_email", &self.client_email)
            .field("key_id", &self.key_id)
            .field("algorithm", &self.signer.algorithm())
            .field("token_uri", &self.token_uri)
            .field("project_id", &self.project_id)
            .finish()
    }
}

impl ServiceAccount {
    /// Constructs a service account that signs with `signer`
    ///
    /// # Errors
    ///
    /// The client email or token endpoint is empty.
    pub fn new(
        client_email: impl Into<Principal>,
        signer: impl jws::Signer + 'static,
        token_uri: impl Into<String>,
    ) -> Result<Self, Error> {
        let client_email = client_email.into();
        let token_uri = token_uri.into();
        non_empty(client_email.as_str(), "client_email")?;
        non_empty(&token_uri, "token_uri")?;
        Ok(Self {
            client_email,
            key_id: None,
            signer: Arc::new(signer),
            token_uri,
            project_id: None,
        })
    }

    /// Constructs a service account from a PEM-encoded RSA private key
    ///
    /// # Errors
    ///
    /// The key cannot be parsed, or a required field is empty.
    pub fn from_pem(
        client_email: impl Into<Principal>,
        private_key_pem: &str,
        token_uri: impl Into<String>,
    ) -> Result<Self, Error> {
        let key = RsaPrivateKey::from_pem(private_key_pem)
            .map_err(|e| Error::configuration_by("invalid service account private key", e))?;
        Self::new(client_email, key, token_uri)
    }

    /// Names the key in the header of signed assertions
    #[must_use]
    pub fn with_key_id(mut self, key_id: impl Into<jwk::KeyId>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    /// Records the project the service account belongs to
    #[must_use]
    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub(crate) fn from_file(file: dto::ServiceAccountFile) -> Result<Self, Error> {
        non_empty(&file.private_key, "private_key")?;
        let token_uri = file.token_uri.unwrap_or_else(|| DEFAULT_TOKEN_URI.to_owned());
        let mut account = Self::from_pem(file.client_email, &file.private_key, token_uri)?;
        if let Some(key_id) = file.private_key_id.filter(|k| !k.is_empty()) {
            account = account.with_key_id(key_id);
        }
        if let Some(project_id) = file.project_id {
            account = account.with_project_id(project_id);
        }
        Ok(account)
    }

    /// The service account's identity
    pub fn client_email(&self) -> &PrincipalRef {
        &self.client_email
    }

    /// The token endpoint
    pub fn token_uri(&self) -> &str {
        &self.token_uri
    }

    /// The project the service account belongs to, if known
    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    /// Signs an assertion for the token endpoint carrying one extra claim
    fn assertion(
        &self,
        now: UnixTime,
        subject: Option<&str>,
        claim: &str,
        value: String,
    ) -> Result<jwt::Jwt, Error> {
        let claims = jwt::Claims::new(
            self.client_email.as_str(),
            subject.unwrap_or(self.client_email.as_str()),
            self.token_uri.as_str(),
            now,
            now + ASSERTION_LIFETIME,
        )
        .with_claim(claim, value);

        jwt::encode(&claims, &*self.signer, self.key_id.as_deref())
            .map_err(|e| Error::configuration_by("unable to sign token assertion", e))
    }

    async fn exchange_assertion<T: serde::de::DeserializeOwned>(
        &self,
        rc: &RefreshContext<'_>,
        assertion: &jwt::JwtRef,
    ) -> Result<T, Error> {
        let request = HttpRequest::post(&self.token_uri)
            .with_timeout(rc.request_timeout())
            .with_form([
                ("grant_type", JWT_BEARER_GRANT),
                ("assertion", assertion.as_str()),
            ]);
        transport::exchange(rc.transport(), request).await
    }

    /// Obtains an ID token for `audience`
    #[tracing::instrument(
        err,
        skip(self, rc),
        fields(client_email = %self.client_email, token_uri = %self.token_uri),
    )]
    pub(crate) async fn fetch_id_token(
        &self,
        rc: &RefreshContext<'_>,
        audience: &str,
    ) -> Result<Token, Error> {
        let now = rc.now();
        let assertion = self.assertion(now, None, "target_audience", audience.to_owned())?;
        let response: dto::IdTokenResponse = self.exchange_assertion(rc, &assertion).await?;
        id_token::token_from_jwt(response.id_token, &self.token_uri, now)
    }
}

#[async_trait]
impl CredentialVariant for ServiceAccount {
    #[tracing::instrument(
        err,
        skip(self, rc),
        fields(client_email = %self.client_email, token_uri = %self.token_uri),
    )]
    async fn do_refresh(&self, rc: &RefreshContext<'_>) -> Result<Token, Error> {
        let now = rc.now();
        let scope = rc.scopes_or(DEFAULT_SCOPE).join(" ");
        let assertion = self.assertion(now, rc.subject(), "scope", scope)?;
        let response: dto::TokenResponse = self.exchange_assertion(rc, &assertion).await?;
        Ok(response
            .into_token(now)
            .with_principal(self.client_email.clone()))
    }

    fn describe(&self) -> String {
        format!("service account {}", self.client_email)
    }

    fn supports_subject(&self) -> bool {
        true
    }
}
