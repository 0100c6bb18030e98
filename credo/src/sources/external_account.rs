//! Third-party identities traded for access tokens at a security token service

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use credo_clock::DurationSecs;
use http::{HeaderMap, HeaderName};

use super::{dto, impersonated, non_empty, DEFAULT_SCOPE};
use crate::{
    transport::{self, HttpRequest},
    ClientId, ClientSecret, Context, CredentialVariant, Env, Error, Principal, PrincipalRef,
    RefreshContext, SubjectToken, Token,
};

mod aws;
mod executable;

pub use aws::AwsSource;
pub use executable::{ExecutableSource, ALLOW_EXECUTABLES_VAR};

const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

/// How a subject token is carried in the bytes a source produces
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum SubjectTokenFormat {
    /// The whole content, less surrounding whitespace
    #[default]
    Text,
    /// A string field of a JSON object
    Json {
        /// The name of the field holding the token
        field: String,
    },
}

impl SubjectTokenFormat {
    /// Extracts the subject token, or describes why it could not be found
    fn extract(&self, raw: &[u8]) -> Result<SubjectToken, String> {
        let token = match self {
            Self::Text => std::str::from_utf8(raw)
                .map_err(|_| "subject token is not UTF-8".to_owned())?
                .trim()
                .to_owned(),
            Self::Json { field } => {
                let value: serde_json::Value = serde_json::from_slice(raw)
                    .map_err(|e| format!("subject token is not valid JSON: {e}"))?;
                value
                    .get(field)
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| format!("subject token has no string field `{field}`"))?
                    .to_owned()
            }
        };

        if token.is_empty() {
            Err("subject token is empty".to_owned())
        } else {
            Ok(SubjectToken::from(token))
        }
    }

    fn from_file(format: Option<dto::FormatFile>) -> Result<Self, Error> {
        let Some(format) = format else {
            return Ok(Self::Text);
        };
        match format.kind.as_deref() {
            None | Some("text") => Ok(Self::Text),
            Some("json") => {
                let field = format.subject_token_field_name.ok_or_else(|| {
                    Error::configuration("JSON subject token format requires `subject_token_field_name`")
                })?;
                non_empty(&field, "subject_token_field_name")?;
                Ok(Self::Json { field })
            }
            Some(other) => Err(Error::configuration(format!(
                "unsupported subject token format `{other}`"
            ))),
        }
    }
}

/// Where a subject token is obtained from
#[derive(Clone, Debug)]
pub enum CredentialSource {
    /// An environment variable
    Environment {
        /// The variable's name
        variable: String,
        /// How the token is carried in the variable
        format: SubjectTokenFormat,
    },
    /// A file, re-read on every refresh
    File {
        /// The file's path
        path: PathBuf,
        /// How the token is carried in the file
        format: SubjectTokenFormat,
    },
    /// An HTTP endpoint, such as a workload identity metadata service
    Url {
        /// The endpoint's URL
        url: String,
        /// Headers sent with the request
        headers: HeaderMap,
        /// How the token is carried in the response body
        format: SubjectTokenFormat,
    },
    /// A local program printing the token
    Executable(ExecutableSource),
    /// A signed AWS `GetCallerIdentity` request
    Aws(AwsSource),
}

impl CredentialSource {
    fn from_file(mut file: dto::CredentialSourceFile) -> Result<Self, Error> {
        let active = [
            file.environment_id.is_some(),
            file.environment.is_some(),
            file.file.is_some(),
            file.url.is_some() && file.environment_id.is_none(),
            file.executable.is_some(),
        ]
        .into_iter()
        .filter(|&set| set)
        .count();

        if active != 1 {
            return Err(Error::configuration(
                "`credential_source` must name exactly one of `environment_id`, `environment`, `file`, `url`, or `executable`",
            ));
        }

        if let Some(environment_id) = file.environment_id.take() {
            return Ok(Self::Aws(AwsSource::from_file(&environment_id, file)?));
        }

        if let Some(executable) = file.executable {
            return Ok(Self::Executable(ExecutableSource::from_file(executable)?));
        }

        let format = SubjectTokenFormat::from_file(file.format)?;
        if let Some(variable) = file.environment {
            non_empty(&variable, "credential_source.environment")?;
            Ok(Self::Environment { variable, format })
        } else if let Some(path) = file.file {
            non_empty(&path, "credential_source.file")?;
            Ok(Self::File {
                path: PathBuf::from(path),
                format,
            })
        } else if let Some(url) = file.url {
            non_empty(&url, "credential_source.url")?;
            let mut headers = HeaderMap::new();
            for (name, value) in &file.headers {
                let name = HeaderName::try_from(name.as_str()).map_err(|e| {
                    Error::configuration_by(format!("invalid header name `{name}`"), e)
                })?;
                headers.insert(name, transport::header_value(value, "credential source header")?);
            }
            Ok(Self::Url {
                url,
                headers,
                format,
            })
        } else {
            Err(Error::configuration("`credential_source` names no source"))
        }
    }
}

/// The family of identity provider an external account trusts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternalAccountFlavor {
    /// Amazon Web Services, through signed caller identity requests
    Aws,
    /// Microsoft Azure, through its instance metadata service
    Azure,
    /// Any other OpenID Connect or SAML identity provider
    Oidc,
}

#[derive(Clone, Debug)]
struct ImpersonationHop {
    endpoint: String,
    target: Principal,
    lifetime: DurationSecs,
}

/// A third-party identity traded for an access token
///
/// Each refresh obtains a fresh subject token from the configured source,
/// exchanges it at the token service, and, when configured, trades the
/// result for a token belonging to a service account.
#[derive(Debug)]
pub struct ExternalAccount {
    audience: String,
    subject_token_type: String,
    token_url: String,
    source: CredentialSource,
    client: Option<(ClientId, Option<ClientSecret>)>,
    impersonation: Option<ImpersonationHop>,
    workforce_pool_user_project: Option<String>,
    env: Arc<dyn Env>,
}

impl ExternalAccount {
    /// Constructs an external account exchanging subject tokens from `source`
    ///
    /// # Errors
    ///
    /// The audience, subject token type, or token URL is empty.
    pub fn new(
        audience: impl Into<String>,
        subject_token_type: impl Into<String>,
        token_url: impl Into<String>,
        source: CredentialSource,
        ctx: &Context,
    ) -> Result<Self, Error> {
        let audience = audience.into();
        let subject_token_type = subject_token_type.into();
        let token_url = token_url.into();
        non_empty(&audience, "audience")?;
        non_empty(&subject_token_type, "subject_token_type")?;
        non_empty(&token_url, "token_url")?;

        if let CredentialSource::Executable(executable) = &source {
            executable.check_token_type(&subject_token_type)?;
        }

        Ok(Self {
            audience,
            subject_token_type,
            token_url,
            source,
            client: None,
            impersonation: None,
            workforce_pool_user_project: None,
            env: ctx.env_arc(),
        })
    }

    /// Authenticates to the token service with client credentials
    #[must_use]
    pub fn with_client(mut self, id: ClientId, secret: Option<ClientSecret>) -> Self {
        self.client = Some((id, secret));
        self
    }

    /// Trades each exchanged token for one belonging to a service account
    ///
    /// `url` is the `generateAccessToken` URL of the service account.
    ///
    /// # Errors
    ///
    /// The URL does not name a service account, or the lifetime is out of
    /// range.
    pub fn with_impersonation(mut self, url: &str, lifetime: DurationSecs) -> Result<Self, Error> {
        let (endpoint, target) = impersonated::parse_impersonation_url(url)?;
        self.impersonation = Some(ImpersonationHop {
            endpoint,
            target,
            lifetime: impersonated::checked_lifetime(lifetime)?,
        });
        Ok(self)
    }

    /// Bills a workforce pool's usage to a project
    ///
    /// # Errors
    ///
    /// The audience does not name a workforce pool.
    pub fn with_workforce_pool_user_project(mut self, project: impl Into<String>) -> Result<Self, Error> {
        if !self.is_workforce_pool() {
            return Err(Error::configuration(
                "`workforce_pool_user_project` is only valid for workforce pool audiences",
            ));
        }
        self.workforce_pool_user_project = Some(project.into());
        Ok(self)
    }

    pub(crate) fn from_file(file: dto::ExternalAccountFile, ctx: &Context) -> Result<Self, Error> {
        let source = CredentialSource::from_file(file.credential_source)?;
        let mut account = Self::new(
            file.audience,
            file.subject_token_type,
            file.token_url,
            source,
            ctx,
        )?;

        if let Some(id) = file.client_id {
            account = account.with_client(id, file.client_secret);
        }

        if let Some(url) = file.service_account_impersonation_url {
            let lifetime = file
                .service_account_impersonation
                .and_then(|o| o.token_lifetime_seconds)
                .map_or(impersonated::MAX_LIFETIME, DurationSecs);
            account = account.with_impersonation(&url, lifetime)?;
        }

        if let Some(project) = file.workforce_pool_user_project {
            account = account.with_workforce_pool_user_project(project)?;
        }

        Ok(account)
    }

    /// The audience presented to the token service
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Where subject tokens come from
    pub fn source(&self) -> &CredentialSource {
        &self.source
    }

    /// The service account exchanged tokens are traded for, if any
    pub fn impersonation_target(&self) -> Option<&PrincipalRef> {
        self.impersonation.as_ref().map(|hop| &*hop.target)
    }

    /// The family of identity provider this account trusts
    pub fn flavor(&self) -> ExternalAccountFlavor {
        match &self.source {
            CredentialSource::Aws(_) => ExternalAccountFlavor::Aws,
            CredentialSource::Url { url, .. } if url.contains("/metadata/identity/oauth2/token") => {
                ExternalAccountFlavor::Azure
            }
            _ => ExternalAccountFlavor::Oidc,
        }
    }

    fn is_workforce_pool(&self) -> bool {
        self.audience.contains("/locations/global/workforcePools/")
    }

    #[tracing::instrument(level = "debug", err, skip(self, rc))]
    async fn subject_token(&self, rc: &RefreshContext<'_>) -> Result<SubjectToken, Error> {
        match &self.source {
            CredentialSource::Environment { variable, format } => {
                let raw = self.env.var(variable).ok_or_else(|| {
                    Error::configuration(format!("environment variable `{variable}` is not set"))
                })?;
                format.extract(raw.as_bytes()).map_err(Error::configuration)
            }
            CredentialSource::File { path, format } => {
                let raw = tokio::fs::read(path).await.map_err(|e| {
                    Error::configuration_by(
                        format!("unable to read subject token from {}", path.display()),
                        e,
                    )
                })?;
                format.extract(&raw).map_err(Error::configuration)
            }
            CredentialSource::Url {
                url,
                headers,
                format,
            } => {
                let mut request = HttpRequest::get(url).with_timeout(rc.request_timeout());
                request.headers = headers.clone();
                let (endpoint, body) = transport::exchange_raw(rc.transport(), request).await?;
                format
                    .extract(&body)
                    .map_err(|message| Error::malformed(endpoint, message))
            }
            CredentialSource::Executable(executable) => {
                executable
                    .subject_token(rc, &*self.env, &self.audience, &self.subject_token_type)
                    .await
            }
            CredentialSource::Aws(aws) => aws.subject_token(rc, &*self.env, &self.audience).await,
        }
    }

    async fn exchange(&self, rc: &RefreshContext<'_>, subject: &SubjectToken) -> Result<Token, Error> {
        let scope = if self.impersonation.is_some() {
            DEFAULT_SCOPE.to_owned()
        } else {
            rc.scopes_or(DEFAULT_SCOPE).join(" ")
        };

        let options = match (&self.workforce_pool_user_project, &self.client) {
            (Some(project), None) => Some(serde_json::json!({ "userProject": project }).to_string()),
            _ => None,
        };

        let mut form = vec![
            ("grant_type", TOKEN_EXCHANGE_GRANT),
            ("audience", self.audience.as_str()),
            ("scope", scope.as_str()),
            ("requested_token_type", ACCESS_TOKEN_TYPE),
            ("subject_token", subject.as_str()),
            ("subject_token_type", self.subject_token_type.as_str()),
        ];
        if let Some(options) = &options {
            form.push(("options", options.as_str()));
        }

        let mut request = HttpRequest::post(&self.token_url)
            .with_timeout(rc.request_timeout())
            .with_form(form);
        if let Some((id, secret)) = &self.client {
            let basic = super::user_account::basic_auth(
                id.as_str(),
                secret.as_ref().map_or("", |s| s.as_str()),
            )?;
            request = request.with_header(http::header::AUTHORIZATION, basic);
        }

        let now = rc.now();
        let response: dto::TokenResponse = transport::exchange(rc.transport(), request).await?;
        Ok(response.into_token(now))
    }
}

#[async_trait]
impl CredentialVariant for ExternalAccount {
    #[tracing::instrument(err, skip(self, rc), fields(audience = %self.audience, flavor = ?self.flavor()))]
    async fn do_refresh(&self, rc: &RefreshContext<'_>) -> Result<Token, Error> {
        let subject = self.subject_token(rc).await?;
        let federated = self.exchange(rc, &subject).await?;

        match &self.impersonation {
            None => Ok(federated),
            Some(hop) => {
                impersonated::generate_access_token(
                    rc,
                    &hop.endpoint,
                    &hop.target,
                    federated.value().as_str(),
                    &rc.scopes_or(DEFAULT_SCOPE),
                    hop.lifetime,
                )
                .await
            }
        }
    }

    fn describe(&self) -> String {
        let flavor = match self.flavor() {
            ExternalAccountFlavor::Aws => "AWS",
            ExternalAccountFlavor::Azure => "Azure",
            ExternalAccountFlavor::Oidc => "OIDC",
        };
        match &self.impersonation {
            Some(hop) => format!("{flavor} external account impersonating {}", hop.target),
            None => format!("{flavor} external account for {}", self.audience),
        }
    }
}
