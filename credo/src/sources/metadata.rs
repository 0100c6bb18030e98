//! The identity attached to a compute instance, served by its metadata server

use async_trait::async_trait;
use http::{HeaderName, HeaderValue};

use super::{dto, id_token};
use crate::{
    transport::{self, HttpRequest, TransportErrorKind},
    CredentialVariant, Env, Error, RefreshContext, Token,
};

/// The default metadata server
pub const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";

/// Overrides the metadata server's host
pub const METADATA_HOST_VAR: &str = "GCE_METADATA_HOST";

const METADATA_FLAVOR: HeaderName = HeaderName::from_static("metadata-flavor");
const GOOGLE: HeaderValue = HeaderValue::from_static("Google");

/// The identity of the compute instance this process runs on
///
/// An unreachable metadata server means the process is not running on such
/// an instance, and is reported as [`Error::Unavailable`].
#[derive(Clone, Debug)]
pub struct ComputeMetadata {
    base_url: String,
    account: String,
}

impl Default for ComputeMetadata {
    fn default() -> Self {
        Self::with_host(DEFAULT_METADATA_HOST)
    }
}

impl ComputeMetadata {
    /// Uses the metadata server at `host`
    pub fn with_host(host: &str) -> Self {
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_owned()
        } else {
            format!("http://{host}")
        };
        Self {
            base_url,
            account: "default".to_owned(),
        }
    }

    /// Uses the metadata server named by the environment, or the default
    pub fn from_env(env: &dyn Env) -> Self {
        env.var(METADATA_HOST_VAR)
            .map_or_else(Self::default, |host| Self::with_host(&host))
    }

    /// Uses a service account other than the instance's default
    #[must_use]
    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = account.into();
        self
    }

    fn account_url(&self, leaf: &str) -> String {
        format!(
            "{}/computeMetadata/v1/instance/service-accounts/{}/{leaf}",
            self.base_url, self.account
        )
    }

    fn request(url: String, rc: &RefreshContext<'_>) -> HttpRequest {
        HttpRequest::get(url)
            .with_timeout(rc.request_timeout())
            .with_header(METADATA_FLAVOR, GOOGLE)
    }

    async fn fetch(&self, request: HttpRequest, rc: &RefreshContext<'_>) -> Result<(String, Vec<u8>), Error> {
        let endpoint = request.endpoint().to_owned();
        let response = rc.transport().send(request).await.map_err(|e| match e.kind() {
            TransportErrorKind::Connect | TransportErrorKind::Timeout => {
                Error::unavailable_by("metadata server is unreachable", e)
            }
            TransportErrorKind::Other => Error::unreachable(&endpoint, e),
        })?;
        let body = transport::success_body(&endpoint, response)?;
        Ok((endpoint, body))
    }

    /// Checks whether a metadata server answers within `timeout`
    ///
    /// # Errors
    ///
    /// [`Error::Unavailable`] if nothing answers, or the answer does not come
    /// from a metadata server.
    #[tracing::instrument(level = "debug", err, skip(self, transport))]
    pub async fn probe(
        &self,
        transport: &dyn transport::Transport,
        timeout: std::time::Duration,
    ) -> Result<(), Error> {
        let request = HttpRequest::get(format!("{}/computeMetadata/v1/", self.base_url))
            .with_timeout(timeout)
            .with_header(METADATA_FLAVOR, GOOGLE);

        let response = tokio::time::timeout(timeout, transport.send(request))
            .await
            .map_err(|_| Error::unavailable("metadata server did not answer in time"))?
            .map_err(|e| Error::unavailable_by("metadata server is unreachable", e))?;

        if response.headers.get(&METADATA_FLAVOR) == Some(&GOOGLE) {
            Ok(())
        } else {
            Err(Error::unavailable(
                "response did not come from a metadata server",
            ))
        }
    }

    #[tracing::instrument(err, skip(self, rc), fields(base_url = %self.base_url))]
    pub(crate) async fn fetch_id_token(
        &self,
        rc: &RefreshContext<'_>,
        audience: &str,
    ) -> Result<Token, Error> {
        let now = rc.now();
        let mut url = url::Url::parse(&self.account_url("identity"))
            .map_err(|e| Error::configuration_by("invalid metadata server URL", e))?;
        url.query_pairs_mut()
            .append_pair("audience", audience)
            .append_pair("format", "full");

        let (endpoint, body) = self.fetch(Self::request(url.into(), rc), rc).await?;
        let raw = String::from_utf8(body)
            .map_err(|e| Error::malformed_by(&endpoint, "ID token is not UTF-8", e))?;
        id_token::token_from_jwt(raw, &endpoint, now)
    }
}

#[async_trait]
impl CredentialVariant for ComputeMetadata {
    #[tracing::instrument(err, skip(self, rc), fields(base_url = %self.base_url))]
    async fn do_refresh(&self, rc: &RefreshContext<'_>) -> Result<Token, Error> {
        let now = rc.now();
        let mut url = url::Url::parse(&self.account_url("token"))
            .map_err(|e| Error::configuration_by("invalid metadata server URL", e))?;
        if !rc.scopes().is_empty() {
            url.query_pairs_mut()
                .append_pair("scopes", &rc.scopes().join(","));
        }

        let (endpoint, body) = self.fetch(Self::request(url.into(), rc), rc).await?;
        let response: dto::TokenResponse = transport::parse_json(&endpoint, &body)?;
        Ok(response.into_token(now))
    }

    fn describe(&self) -> String {
        format!("compute metadata account {} at {}", self.account, self.base_url)
    }
}
