//! Wire and file shapes

use std::collections::HashMap;

use credo_clock::{DurationSecs, UnixTime};
use serde::{Deserialize, Serialize};

use crate::{AccessToken, ClientId, ClientSecret, Principal, RefreshToken, Token};

/// The lifetime assumed when an issuer omits `expires_in`
pub(crate) const ASSUMED_LIFETIME: DurationSecs = DurationSecs(3600);

/// A response from an OAuth2 token endpoint
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: AccessToken,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<RefreshToken>,
    #[serde(default)]
    pub issued_token_type: Option<String>,
}

impl TokenResponse {
    pub(crate) fn into_token(self, issued_at: UnixTime) -> Token {
        let lifetime = match self.expires_in {
            Some(secs) => DurationSecs(secs),
            None => {
                tracing::debug!(
                    assumed = ASSUMED_LIFETIME.0,
                    "token response has no lifetime"
                );
                ASSUMED_LIFETIME
            }
        };
        let token = Token::access_for(self.access_token, issued_at, lifetime);
        match self.token_type {
            Some(token_type) => token.with_token_type(token_type),
            None => token,
        }
    }
}

/// A response from an OAuth2 token endpoint asked for an ID token
#[derive(Debug, Deserialize)]
pub(crate) struct IdTokenResponse {
    pub id_token: String,
}

/// A `service_account` key file
#[derive(Debug, Deserialize)]
pub(crate) struct ServiceAccountFile {
    pub client_email: Principal,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub quota_project_id: Option<String>,
}

/// An `authorized_user` file
#[derive(Debug, Deserialize)]
pub(crate) struct AuthorizedUserFile {
    pub client_id: ClientId,
    pub client_secret: ClientSecret,
    pub refresh_token: RefreshToken,
    #[serde(default)]
    pub token_uri: Option<String>,
    #[serde(default)]
    pub quota_project_id: Option<String>,
}

/// An `external_account_authorized_user` file
#[derive(Debug, Deserialize)]
pub(crate) struct ExternalAuthorizedUserFile {
    pub audience: String,
    pub token_url: String,
    #[serde(default)]
    pub token_info_url: Option<String>,
    pub refresh_token: RefreshToken,
    #[serde(default)]
    pub client_id: Option<ClientId>,
    #[serde(default)]
    pub client_secret: Option<ClientSecret>,
    #[serde(default)]
    pub quota_project_id: Option<String>,
}

/// An `external_account` file
#[derive(Debug, Deserialize)]
pub(crate) struct ExternalAccountFile {
    pub audience: String,
    pub subject_token_type: String,
    pub token_url: String,
    pub credential_source: CredentialSourceFile,
    #[serde(default, alias = "impersonation_url")]
    pub service_account_impersonation_url: Option<String>,
    #[serde(default)]
    pub service_account_impersonation: Option<ImpersonationOptions>,
    #[serde(default)]
    pub client_id: Option<ClientId>,
    #[serde(default)]
    pub client_secret: Option<ClientSecret>,
    #[serde(default)]
    pub quota_project_id: Option<String>,
    #[serde(default)]
    pub workforce_pool_user_project: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ImpersonationOptions {
    #[serde(default)]
    pub token_lifetime_seconds: Option<u64>,
}

/// Where an external account finds its subject token
///
/// Every field is optional here; exactly one kind of source must be present.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct CredentialSourceFile {
    #[serde(default)]
    pub environment_id: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub format: Option<FormatFile>,
    #[serde(default)]
    pub executable: Option<ExecutableFile>,
    #[serde(default)]
    pub region_url: Option<String>,
    #[serde(default)]
    pub regional_cred_verification_url: Option<String>,
    #[serde(default)]
    pub imdsv2_session_token_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FormatFile {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub subject_token_field_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExecutableFile {
    pub command: String,
    #[serde(default)]
    pub timeout_millis: Option<u64>,
    #[serde(default)]
    pub output_file: Option<String>,
}

/// An `impersonated_service_account` file
#[derive(Debug, Deserialize)]
pub(crate) struct ImpersonatedFile {
    #[serde(alias = "impersonation_url")]
    pub service_account_impersonation_url: String,
    #[serde(default)]
    pub delegates: Vec<String>,
    pub source_credentials: serde_json::Value,
    #[serde(default)]
    pub quota_project_id: Option<String>,
}

/// A request to mint an access token for a service account
#[derive(Debug, Serialize)]
pub(crate) struct GenerateAccessTokenRequest<'a> {
    pub scope: &'a [&'a str],
    pub lifetime: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateAccessTokenResponse {
    pub access_token: AccessToken,
    pub expire_time: String,
}

/// A request to mint an ID token for a service account
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateIdTokenRequest<'a> {
    pub audience: &'a str,
    pub include_email: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GenerateIdTokenResponse {
    pub token: String,
}

/// What an executable credential source prints
#[derive(Debug, Deserialize)]
pub(crate) struct ExecutableResponse {
    pub version: u32,
    pub success: bool,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expiration_time: Option<u64>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub saml_response: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct AwsSecurityCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub token: Option<String>,
}
