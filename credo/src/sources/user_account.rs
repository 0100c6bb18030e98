//! End-user credentials renewed through the refresh token grant

use std::sync::Mutex;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use credo_clock::UnixTime;
use http::header;

use super::{dto, non_empty, DEFAULT_TOKEN_URI};
use crate::{
    transport::{self, HttpRequest},
    AccessToken, ClientId, ClientSecret, CredentialVariant, Error, RefreshContext, RefreshToken,
    Token,
};

/// How client credentials are presented to the token endpoint
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientAuth {
    /// As `client_id` and `client_secret` form fields
    #[default]
    Body,
    /// As an HTTP Basic `Authorization` header
    Basic,
}

/// The configuration of a [`UserAccount`]
#[derive(Debug, Default)]
pub struct UserAccountConfig {
    /// The token endpoint; defaults to [`DEFAULT_TOKEN_URI`]
    pub token_uri: Option<String>,
    /// The OAuth2 client the grant was issued to
    pub client_id: Option<ClientId>,
    /// The secret of that client
    pub client_secret: Option<ClientSecret>,
    /// How the client credentials are presented
    pub client_auth: ClientAuth,
    /// A refresh token for renewing access
    pub refresh_token: Option<RefreshToken>,
    /// An access token usable before the first refresh
    pub access_token: Option<AccessToken>,
    /// When `access_token` expires, if known
    pub expiry: Option<UnixTime>,
}

/// An end user's OAuth2 grant
///
/// If the token endpoint rotates the refresh token, the new one replaces the
/// stored one for later refreshes.
#[derive(Debug)]
pub struct UserAccount {
    token_uri: String,
    client_id: Option<ClientId>,
    client_secret: Option<ClientSecret>,
    client_auth: ClientAuth,
    refresh_token: Mutex<Option<RefreshToken>>,
    initial: Option<(AccessToken, Option<UnixTime>)>,
    audience: Option<String>,
    token_info_url: Option<String>,
}

impl UserAccount {
    /// Constructs a user credential
    ///
    /// # Errors
    ///
    /// Neither an access token nor a refresh token is present, or a refresh
    /// token is present without a client ID while client credentials are
    /// sent in the request body.
    pub fn new(config: UserAccountConfig) -> Result<Self, Error> {
        let token_uri = config
            .token_uri
            .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_owned());
        non_empty(&token_uri, "token_uri")?;

        let refresh_token = config.refresh_token.filter(|t| !t.as_str().is_empty());
        let access_token = config.access_token.filter(|t| !t.as_str().is_empty());

        if refresh_token.is_none() && access_token.is_none() {
            return Err(Error::configuration(
                "a user credential needs an access token or a refresh token",
            ));
        }
        if config.client_auth == ClientAuth::Body
            && refresh_token.is_some()
            && config.client_id.is_none()
        {
            return Err(Error::configuration(
                "a refresh token requires a `client_id`",
            ));
        }

        let initial = access_token.map(|value| (value, config.expiry));

        Ok(Self {
            token_uri,
            client_id: config.client_id,
            client_secret: config.client_secret,
            client_auth: config.client_auth,
            refresh_token: Mutex::new(refresh_token),
            initial,
            audience: None,
            token_info_url: None,
        })
    }

    pub(crate) fn from_file(file: dto::AuthorizedUserFile) -> Result<Self, Error> {
        non_empty(file.client_id.as_str(), "client_id")?;
        non_empty(file.refresh_token.as_str(), "refresh_token")?;
        Self::new(UserAccountConfig {
            token_uri: file.token_uri,
            client_id: Some(file.client_id),
            client_secret: Some(file.client_secret),
            client_auth: ClientAuth::Body,
            refresh_token: Some(file.refresh_token),
            ..UserAccountConfig::default()
        })
    }

    pub(crate) fn from_external_file(file: dto::ExternalAuthorizedUserFile) -> Result<Self, Error> {
        non_empty(&file.audience, "audience")?;
        non_empty(file.refresh_token.as_str(), "refresh_token")?;
        let mut account = Self::new(UserAccountConfig {
            token_uri: Some(file.token_url),
            client_id: file.client_id,
            client_secret: file.client_secret,
            client_auth: ClientAuth::Basic,
            refresh_token: Some(file.refresh_token),
            ..UserAccountConfig::default()
        })?;
        account.audience = Some(file.audience);
        account.token_info_url = file.token_info_url;
        Ok(account)
    }

    /// The token endpoint
    pub fn token_uri(&self) -> &str {
        &self.token_uri
    }

    /// The workforce pool audience, for externally federated users
    pub fn audience(&self) -> Option<&str> {
        self.audience.as_deref()
    }

    /// The token introspection endpoint, for externally federated users
    pub fn token_info_url(&self) -> Option<&str> {
        self.token_info_url.as_deref()
    }

    fn current_refresh_token(&self) -> Option<RefreshToken> {
        match self.refresh_token.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn rotate_refresh_token(&self, refresh_token: RefreshToken) {
        let mut guard = match self.refresh_token.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(refresh_token);
    }
}

/// Client credentials as an HTTP Basic `Authorization` value
pub(crate) fn basic_auth(client_id: &str, secret: &str) -> Result<http::HeaderValue, Error> {
    let encoded = STANDARD.encode(format!("{client_id}:{secret}"));
    let mut value = transport::header_value(&format!("Basic {encoded}"), "client credentials")?;
    value.set_sensitive(true);
    Ok(value)
}

#[async_trait]
impl CredentialVariant for UserAccount {
    #[tracing::instrument(
        err,
        skip(self, rc),
        fields(
            token_uri = %self.token_uri,
            client_id = self.client_id.as_ref().map(|c| c.as_str()),
        ),
    )]
    async fn do_refresh(&self, rc: &RefreshContext<'_>) -> Result<Token, Error> {
        let refresh_token = self.current_refresh_token().ok_or_else(|| {
            Error::configuration("the access token expired and no refresh token is available")
        })?;

        let now = rc.now();
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];
        let mut request = HttpRequest::post(&self.token_uri).with_timeout(rc.request_timeout());

        match self.client_auth {
            ClientAuth::Body => {
                if let Some(client_id) = &self.client_id {
                    form.push(("client_id", client_id.as_str()));
                }
                if let Some(secret) = &self.client_secret {
                    form.push(("client_secret", secret.as_str()));
                }
            }
            ClientAuth::Basic => {
                // Federated users may hold no client of their own
                if let (Some(id), Some(secret)) = (&self.client_id, &self.client_secret) {
                    let basic = basic_auth(id.as_str(), secret.as_str())?;
                    request = request.with_header(header::AUTHORIZATION, basic);
                }
            }
        }

        let mut response: dto::TokenResponse =
            transport::exchange(rc.transport(), request.with_form(form)).await?;

        if let Some(rotated) = response.refresh_token.take() {
            tracing::info!("received new refresh token");
            self.rotate_refresh_token(rotated);
        }

        Ok(response.into_token(now))
    }

    fn describe(&self) -> String {
        match (&self.audience, &self.client_id) {
            (Some(audience), _) => format!("federated user of {audience}"),
            (None, Some(client_id)) => format!("user credential for client {client_id}"),
            (None, None) => "user credential".to_owned(),
        }
    }

    fn initial_token(&self, now: UnixTime) -> Option<Token> {
        self.initial
            .as_ref()
            .map(|(value, expiry)| Token::access(value.clone(), now, *expiry))
    }
}
