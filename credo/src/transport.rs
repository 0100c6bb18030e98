//! The request/response capability used to reach token endpoints
//!
//! Every network exchange a credential performs goes through a [`Transport`],
//! so callers choose the HTTP stack (and tests substitute a fake). With the
//! `reqwest` feature enabled, [`ReqwestTransport`] is provided.

use std::{error::Error as StdError, fmt, time::Duration};

use async_trait::async_trait;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::Error;

/// A request to a token endpoint
#[derive(Clone, Debug)]
pub struct HttpRequest {
    /// The request method
    pub method: Method,
    /// The absolute URL to call
    pub url: String,
    /// Request headers
    pub headers: HeaderMap,
    /// The request body, possibly empty
    pub body: Vec<u8>,
    /// How long to wait for a response
    pub timeout: Duration,
}

impl HttpRequest {
    /// The default time bound for a single request
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Constructs a request with no headers and no body
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Vec::new(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Constructs a `GET` request
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// Constructs a `POST` request
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    /// Adds a header to the request
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Bounds how long to wait for a response
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the body to URL-encoded form data
    #[must_use]
    pub fn with_form<'a>(mut self, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        self.body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish()
            .into_bytes();
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        self
    }

    /// Sets the body to a JSON document
    pub fn with_json<T: Serialize>(mut self, payload: &T) -> Result<Self, Error> {
        self.body = serde_json::to_vec(payload)
            .map_err(|e| Error::configuration_by("unable to encode request body", e))?;
        self.headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(self)
    }

    /// The URL without its query string, suitable for logs and errors
    pub fn endpoint(&self) -> &str {
        endpoint_of(&self.url)
    }
}

pub(crate) fn endpoint_of(url: &str) -> &str {
    url.split_once('?').map_or(url, |(endpoint, _)| endpoint)
}

/// A response from a token endpoint
#[derive(Clone, Debug)]
pub struct HttpResponse {
    /// The response status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// The response body
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Constructs a response with no headers
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Adds a header to the response
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// The broad cause of a [`TransportError`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// No connection could be established
    Connect,
    /// The request did not complete within its time bound
    Timeout,
    /// Any other failure to complete the exchange
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connection failed",
            Self::Timeout => "request timed out",
            Self::Other => "request failed",
        })
    }
}

/// A failure to complete a request/response exchange
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl TransportError {
    /// Constructs a new transport error
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attaches the underlying cause
    #[must_use]
    pub fn with_source(mut self, source: impl Into<Box<dyn StdError + Send + Sync + 'static>>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// The broad cause of the failure
    #[must_use]
    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }
}

/// Sends requests to token endpoints
#[async_trait]
pub trait Transport: fmt::Debug + Send + Sync {
    /// Performs a single request/response exchange
    ///
    /// Non-success statuses are responses, not errors.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Sends a request and decodes a successful JSON response
///
/// Transport failures and non-success statuses become token exchange
/// errors. A success status with an unusable body is a malformed response.
#[tracing::instrument(
    level = "debug",
    err,
    skip(transport, request),
    fields(method = %request.method, endpoint = %request.endpoint()),
)]
pub(crate) async fn exchange<T: DeserializeOwned>(
    transport: &dyn Transport,
    request: HttpRequest,
) -> Result<T, Error> {
    let (endpoint, body) = exchange_raw(transport, request).await?;
    parse_json(&endpoint, &body)
}

/// Sends a request and returns the endpoint and body of a successful response
pub(crate) async fn exchange_raw(
    transport: &dyn Transport,
    request: HttpRequest,
) -> Result<(String, Vec<u8>), Error> {
    let endpoint = request.endpoint().to_owned();
    tracing::trace!("sending request to token endpoint");

    let response = transport
        .send(request)
        .await
        .map_err(|e| Error::unreachable(&endpoint, e))?;

    tracing::debug!(
        response.status = response.status.as_u16(),
        "received response from token endpoint"
    );

    let body = success_body(&endpoint, response)?;
    Ok((endpoint, body))
}

pub(crate) fn success_body(endpoint: &str, response: HttpResponse) -> Result<Vec<u8>, Error> {
    if !response.status.is_success() {
        let body = String::from_utf8_lossy(&response.body).into_owned();
        return Err(Error::rejected(endpoint, response.status.as_u16(), body));
    }
    Ok(response.body)
}

pub(crate) fn parse_json<T: DeserializeOwned>(endpoint: &str, body: &[u8]) -> Result<T, Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::malformed(endpoint, "empty response body"));
    }
    serde_json::from_slice(body)
        .map_err(|e| Error::malformed_by(endpoint, "unable to decode response body", e))
}

pub(crate) fn header_value(value: &str, what: &str) -> Result<HeaderValue, Error> {
    HeaderValue::from_str(value)
        .map_err(|e| Error::configuration_by(format!("{what} is not a valid header value"), e))
}

pub(crate) fn bearer(token: &str) -> Result<HeaderValue, Error> {
    let mut value = header_value(&format!("Bearer {token}"), "bearer token")?;
    value.set_sensitive(true);
    Ok(value)
}

#[cfg(feature = "reqwest")]
pub use self::reqwest_transport::ReqwestTransport;

#[cfg(feature = "reqwest")]
mod reqwest_transport {
    use async_trait::async_trait;

    use super::{HttpRequest, HttpResponse, Transport, TransportError, TransportErrorKind};

    /// A [`Transport`] backed by a [`reqwest::Client`]
    #[cfg_attr(docsrs, doc(cfg(feature = "reqwest")))]
    #[derive(Clone, Debug, Default)]
    pub struct ReqwestTransport {
        client: reqwest::Client,
    }

    impl ReqwestTransport {
        /// Wraps an existing client
        pub fn new(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    fn classify(error: reqwest::Error) -> TransportError {
        let kind = if error.is_timeout() {
            TransportErrorKind::Timeout
        } else if error.is_connect() {
            TransportErrorKind::Connect
        } else {
            TransportErrorKind::Other
        };
        TransportError::new(kind, error.to_string()).with_source(error)
    }

    #[async_trait]
    impl Transport for ReqwestTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            let response = self
                .client
                .request(request.method, &request.url)
                .headers(request.headers)
                .body(request.body)
                .timeout(request.timeout)
                .send()
                .await
                .map_err(classify)?;

            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(classify)?;

            Ok(HttpResponse {
                status,
                headers,
                body: body.to_vec(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;
    use serde::Deserialize;

    use super::*;
    use crate::{test::FakeTransport, ErrorKind};

    #[derive(Debug, Deserialize)]
    struct Body {
        value: u32,
    }

    #[test]
    fn form_body_is_url_encoded() {
        let req = HttpRequest::post("https://oauth2.example/token")
            .with_form([("grant_type", "refresh_token"), ("scope", "a b")]);
        assert_eq!(req.body, b"grant_type=refresh_token&scope=a+b");
        assert_eq!(
            req.headers[header::CONTENT_TYPE],
            "application/x-www-form-urlencoded"
        );
    }

    #[test]
    fn endpoint_omits_query() {
        let req = HttpRequest::get("http://metadata/token?scopes=a,b");
        assert_eq!(req.endpoint(), "http://metadata/token");
    }

    #[tokio::test]
    async fn success_is_decoded() {
        let transport = FakeTransport::new(|_| Ok(HttpResponse::new(StatusCode::OK, r#"{"value": 7}"#)));
        let body: Body = exchange(&transport, HttpRequest::get("https://x.example/")).await.unwrap();
        assert_eq!(body.value, 7);
    }

    #[tokio::test]
    async fn rejection_preserves_status_and_body() {
        let transport = FakeTransport::new(|_| {
            Ok(HttpResponse::new(StatusCode::BAD_REQUEST, "invalid_grant"))
        });
        let err = exchange::<Body>(&transport, HttpRequest::get("https://x.example/t?q=1"))
            .await
            .unwrap_err();
        match err {
            Error::TokenExchange { endpoint, status, body, .. } => {
                assert_eq!(endpoint, "https://x.example/t");
                assert_eq!(status, Some(400));
                assert_eq!(body, "invalid_grant");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn transport_failure_is_retryable_exchange_error() {
        let transport = FakeTransport::unreachable();
        let err = exchange::<Body>(&transport, HttpRequest::get("https://x.example/"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TokenExchange);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn empty_success_body_is_malformed() {
        let transport = FakeTransport::new(|_| Ok(HttpResponse::new(StatusCode::OK, "  ")));
        let err = exchange::<Body>(&transport, HttpRequest::get("https://x.example/"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn unparseable_success_body_is_malformed() {
        let transport = FakeTransport::new(|_| Ok(HttpResponse::new(StatusCode::OK, "<html>")));
        let err = exchange::<Body>(&transport, HttpRequest::get("https://x.example/"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    }

    #[test]
    fn bearer_header_is_sensitive() {
        let value = bearer("abc").unwrap();
        assert!(value.is_sensitive());
        assert_eq!(value, "Bearer abc");
    }
}
