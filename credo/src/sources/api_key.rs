use async_trait::async_trait;
use credo_clock::UnixTime;
use http::{HeaderMap, HeaderName};

use super::non_empty;
use crate::{
    transport, ApiKeyValue, CredentialVariant, Error, RefreshContext, Token,
};

/// The header an API key is sent in
pub const API_KEY_HEADER: HeaderName = HeaderName::from_static("x-goog-api-key");

/// A static API key
///
/// The key never expires and is never refreshed. It is sent in the
/// [`API_KEY_HEADER`] rather than as a bearer token.
#[derive(Debug)]
pub struct ApiKey {
    key: ApiKeyValue,
}

impl ApiKey {
    /// Constructs an API key credential
    ///
    /// # Errors
    ///
    /// The key is empty.
    pub fn new(key: impl Into<ApiKeyValue>) -> Result<Self, Error> {
        let key = key.into();
        non_empty(key.as_str(), "api_key")?;
        Ok(Self { key })
    }
}

#[async_trait]
impl CredentialVariant for ApiKey {
    async fn do_refresh(&self, rc: &RefreshContext<'_>) -> Result<Token, Error> {
        Ok(Token::api_key(self.key.as_str(), rc.now()))
    }

    fn apply(&self, token: &Token, headers: &mut HeaderMap) -> Result<(), Error> {
        let mut value = transport::header_value(token.value().as_str(), "API key")?;
        value.set_sensitive(true);
        headers.insert(API_KEY_HEADER, value);
        Ok(())
    }

    fn describe(&self) -> String {
        "API key".to_owned()
    }

    fn initial_token(&self, now: UnixTime) -> Option<Token> {
        Some(Token::api_key(self.key.as_str(), now))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use credo_clock::DurationSecs;
    use http::header;

    use super::*;
    use crate::{
        test::{self, FakeTransport},
        Credential, ErrorKind,
    };

    #[tokio::test]
    async fn never_refreshes_and_sets_key_header() {
        let transport = Arc::new(FakeTransport::unreachable());
        let (ctx, clock) = test::context(transport.clone());
        let credential = Credential::new(ApiKey::new("AIza-fixture").unwrap(), ctx);

        clock.advance(DurationSecs(10 * 365 * 24 * 3600));
        let token = credential.ensure_valid().await.unwrap();
        assert_eq!(token.expiry(), None);
        assert_eq!(transport.calls(), 0);

        let headers = credential.apply(http::HeaderMap::new()).unwrap();
        assert_eq!(headers[API_KEY_HEADER], "AIza-fixture");
        assert!(headers.get(header::AUTHORIZATION).is_none());
    }

    #[test]
    fn apply_needs_no_prior_refresh() {
        let (ctx, _) = test::context(Arc::new(FakeTransport::unreachable()));
        let credential = Credential::new(ApiKey::new("AIza-fixture").unwrap(), ctx)
            .with_quota_project("billing");
        let headers = credential.apply(http::HeaderMap::new()).unwrap();
        assert_eq!(headers[API_KEY_HEADER], "AIza-fixture");
        assert_eq!(headers[crate::QUOTA_PROJECT_HEADER], "billing");
    }

    #[test]
    fn key_is_issued_at_the_context_clock() {
        let (ctx, clock) = test::context(Arc::new(FakeTransport::unreachable()));
        let credential = Credential::new(ApiKey::new("AIza-fixture").unwrap(), ctx);
        assert_eq!(credential.cached_token().unwrap().issued_at(), test::NOW);

        clock.advance(DurationSecs(30));
        let scoped = credential.with_scopes(["unused"]);
        assert_eq!(scoped.cached_token().unwrap().issued_at(), test::NOW + DurationSecs(30));
    }

    #[test]
    fn empty_key_is_rejected() {
        assert_eq!(ApiKey::new("").unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[test]
    fn debug_hides_key() {
        let key = ApiKey::new("AIza-fixture").unwrap();
        assert!(!format!("{:?}", key).contains("AIza"));
    }
}
