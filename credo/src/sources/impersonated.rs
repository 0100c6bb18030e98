//! Acting as a service account through a chain of token exchanges

use std::collections::HashSet;

use async_trait::async_trait;
use credo_clock::{DurationSecs, UnixTime};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use super::{dto, id_token, non_empty, DEFAULT_SCOPE};
use crate::{
    transport::{self, HttpRequest},
    AccessToken, Context, Credential, CredentialKind, CredentialVariant, Error, Principal,
    PrincipalRef, RefreshContext, Token,
};

/// The longest lifetime that may be requested for an impersonated token
pub const MAX_LIFETIME: DurationSecs = DurationSecs(3600);

/// The most principals a delegation chain may name, including its target
pub const MAX_CHAIN_LENGTH: usize = 10;

/// The default IAM credentials endpoint
pub const DEFAULT_IAM_ENDPOINT: &str = "https://iamcredentials.googleapis.com/v1";

const SERVICE_ACCOUNTS_PATH: &str = "/projects/-/serviceAccounts/";

/// A service account acted as through another credential
///
/// Each refresh walks the delegation chain from the source credential's
/// token: every delegate in turn trades the previous token for its own, and
/// the last delegate's token is traded for one belonging to the target.
/// Intermediate tokens are never cached.
#[derive(Debug)]
pub struct Impersonated {
    source: Credential,
    target: Principal,
    delegates: Vec<Principal>,
    endpoint: String,
    lifetime: DurationSecs,
}

impl Impersonated {
    /// Impersonates `target` using the tokens of `source`
    ///
    /// # Errors
    ///
    /// The target is empty, or `source` is itself impersonated.
    pub fn new(source: &Credential, target: impl Into<Principal>) -> Result<Self, Error> {
        let target = target.into();
        non_empty(target.as_str(), "target principal")?;
        if let CredentialKind::Impersonated(_) = source.kind() {
            return Err(Error::configuration(
                "an impersonated credential cannot be the source of another",
            ));
        }
        Ok(Self {
            source: source.with_scopes([DEFAULT_SCOPE]),
            target,
            delegates: Vec::new(),
            endpoint: DEFAULT_IAM_ENDPOINT.to_owned(),
            lifetime: MAX_LIFETIME,
        })
    }

    /// Sets the principals walked through before the target
    ///
    /// # Errors
    ///
    /// A delegate is empty or repeated, or the chain would exceed
    /// [`MAX_CHAIN_LENGTH`].
    pub fn with_delegates<I, P>(mut self, delegates: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = P>,
        P: Into<Principal>,
    {
        let delegates: Vec<Principal> = delegates.into_iter().map(Into::into).collect();
        if delegates.len() + 1 > MAX_CHAIN_LENGTH {
            return Err(Error::configuration(format!(
                "a delegation chain may name at most {MAX_CHAIN_LENGTH} principals"
            )));
        }

        let mut seen = HashSet::new();
        for principal in delegates.iter().chain(std::iter::once(&self.target)) {
            non_empty(principal.as_str(), "delegate")?;
            if !seen.insert(principal.as_str()) {
                return Err(Error::configuration(format!(
                    "principal {principal} appears more than once in the delegation chain"
                )));
            }
        }

        self.delegates = delegates;
        Ok(self)
    }

    /// Sets the lifetime requested for impersonated tokens
    ///
    /// # Errors
    ///
    /// The lifetime is zero or longer than [`MAX_LIFETIME`].
    pub fn with_lifetime(mut self, lifetime: DurationSecs) -> Result<Self, Error> {
        self.lifetime = checked_lifetime(lifetime)?;
        Ok(self)
    }

    /// Sets the IAM credentials endpoint
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_owned();
        self
    }

    pub(crate) fn from_file(file: dto::ImpersonatedFile, ctx: &Context) -> Result<Self, Error> {
        let (endpoint, target) = parse_impersonation_url(&file.service_account_impersonation_url)?;

        let source_type = file
            .source_credentials
            .get("type")
            .and_then(serde_json::Value::as_str);
        if source_type == Some("impersonated_service_account") {
            return Err(Error::configuration(
                "nested impersonated credentials are not supported",
            ));
        }

        let source = super::from_value(file.source_credentials, ctx)?;
        let delegates = file
            .delegates
            .iter()
            .map(|d| Principal::from(normalize_principal(d)));

        Ok(Self::new(&source, target)?
            .with_endpoint(endpoint)
            .with_delegates(delegates)?)
    }

    /// The principal tokens are issued for
    pub fn target(&self) -> &PrincipalRef {
        &self.target
    }

    /// The principals walked through before the target
    pub fn delegates(&self) -> &[Principal] {
        &self.delegates
    }

    /// The lifetime requested for impersonated tokens
    pub fn lifetime(&self) -> DurationSecs {
        self.lifetime
    }

    /// The credential whose tokens start the chain
    pub fn source(&self) -> &Credential {
        &self.source
    }

    /// Walks the delegates, returning the token of the last one, or the
    /// source token when there are none
    async fn walk_delegates(&self, rc: &RefreshContext<'_>) -> Result<AccessToken, Error> {
        let source_token = self.source.ensure_valid().await?;
        let mut bearer = source_token.value().to_owned();

        for delegate in &self.delegates {
            let hop = generate_access_token(
                rc,
                &self.endpoint,
                delegate,
                bearer.as_str(),
                &[DEFAULT_SCOPE],
                self.lifetime,
            )
            .await?;
            bearer = hop.value().to_owned();
        }

        Ok(bearer)
    }

    #[tracing::instrument(err, skip(self, rc), fields(target = %self.target))]
    pub(crate) async fn fetch_id_token(
        &self,
        rc: &RefreshContext<'_>,
        audience: &str,
    ) -> Result<Token, Error> {
        let bearer = self.walk_delegates(rc).await?;
        let now = rc.now();

        let request = HttpRequest::post(service_account_url(
            &self.endpoint,
            &self.target,
            "generateIdToken",
        ))
        .with_timeout(rc.request_timeout())
        .with_header(http::header::AUTHORIZATION, transport::bearer(bearer.as_str())?)
        .with_json(&dto::GenerateIdTokenRequest {
            audience,
            include_email: true,
        })?;

        let endpoint = request.endpoint().to_owned();
        let response: dto::GenerateIdTokenResponse =
            transport::exchange(rc.transport(), request).await?;
        id_token::token_from_jwt(response.token, &endpoint, now)
    }
}

#[async_trait]
impl CredentialVariant for Impersonated {
    #[tracing::instrument(
        err,
        skip(self, rc),
        fields(target = %self.target, hops = self.delegates.len() + 1),
    )]
    async fn do_refresh(&self, rc: &RefreshContext<'_>) -> Result<Token, Error> {
        let bearer = self.walk_delegates(rc).await?;
        generate_access_token(
            rc,
            &self.endpoint,
            &self.target,
            bearer.as_str(),
            &rc.scopes_or(DEFAULT_SCOPE),
            self.lifetime,
        )
        .await
    }

    fn describe(&self) -> String {
        format!(
            "impersonated service account {} via {}",
            self.target,
            self.source.describe()
        )
    }
}

pub(crate) fn checked_lifetime(lifetime: DurationSecs) -> Result<DurationSecs, Error> {
    if lifetime == DurationSecs::ZERO || lifetime > MAX_LIFETIME {
        Err(Error::configuration(format!(
            "token lifetime must be between 1s and {MAX_LIFETIME}, not {lifetime}"
        )))
    } else {
        Ok(lifetime)
    }
}

fn normalize_principal(principal: &str) -> &str {
    principal
        .strip_prefix(&SERVICE_ACCOUNTS_PATH[1..])
        .unwrap_or(principal)
}

fn service_account_url(endpoint: &str, principal: &PrincipalRef, method: &str) -> String {
    format!("{endpoint}{SERVICE_ACCOUNTS_PATH}{principal}:{method}")
}

/// Splits a `generateAccessToken` URL into the IAM endpoint and the target
pub(crate) fn parse_impersonation_url(url: &str) -> Result<(String, Principal), Error> {
    let invalid = || Error::configuration(format!("invalid impersonation URL `{url}`"));

    let (endpoint, rest) = url.split_once(SERVICE_ACCOUNTS_PATH).ok_or_else(invalid)?;
    let target = rest
        .strip_suffix(":generateAccessToken")
        .filter(|t| !t.is_empty() && !t.contains('/'))
        .ok_or_else(invalid)?;
    if endpoint.is_empty() {
        return Err(invalid());
    }
    Ok((endpoint.to_owned(), Principal::from(target)))
}

/// Trades `bearer` for an access token belonging to `principal`
#[tracing::instrument(err, skip(rc, bearer, scopes))]
pub(crate) async fn generate_access_token(
    rc: &RefreshContext<'_>,
    endpoint: &str,
    principal: &PrincipalRef,
    bearer: &str,
    scopes: &[&str],
    lifetime: DurationSecs,
) -> Result<Token, Error> {
    let now = rc.now();
    let request = HttpRequest::post(service_account_url(endpoint, principal, "generateAccessToken"))
        .with_timeout(rc.request_timeout())
        .with_header(http::header::AUTHORIZATION, transport::bearer(bearer)?)
        .with_json(&dto::GenerateAccessTokenRequest {
            scope: scopes,
            lifetime: format!("{}s", lifetime.0),
        })?;

    let url = request.endpoint().to_owned();
    let response: dto::GenerateAccessTokenResponse =
        transport::exchange(rc.transport(), request).await?;
    let expiry = parse_expire_time(&url, &response.expire_time)?;

    Ok(Token::access(response.access_token, now, Some(expiry)).with_principal(principal))
}

fn parse_expire_time(url: &str, raw: &str) -> Result<UnixTime, Error> {
    let parsed = OffsetDateTime::parse(raw, &Rfc3339)
        .map_err(|e| Error::malformed_by(url, "invalid `expireTime`", e))?;
    u64::try_from(parsed.unix_timestamp())
        .map(UnixTime)
        .map_err(|e| Error::malformed_by(url, "`expireTime` precedes the Unix epoch", e))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{
        test::{self, FakeTransport, NOW},
        ErrorKind, ServiceAccount,
    };

    const SA_TOKEN_URI: &str = "https://oauth2.example/token";

    fn iam_response(token: &str) -> crate::transport::HttpResponse {
        test::ok_json(json!({
            "accessToken": token,
            "expireTime": "2023-11-14T23:13:20Z",
        }))
    }

    /// Answers the source's token request and each IAM hop with a token
    /// naming the principal it was minted for
    fn chain_transport() -> Arc<FakeTransport> {
        Arc::new(FakeTransport::new(|req| {
            if req.url == SA_TOKEN_URI {
                return Ok(test::access_token_response("source-token", 3600));
            }
            let principal = req
                .url
                .rsplit('/')
                .next()
                .and_then(|s| s.strip_suffix(":generateAccessToken"))
                .unwrap();
            Ok(iam_response(&format!("token-for-{principal}")))
        }))
    }

    fn source(ctx: &Context) -> Credential {
        let account = ServiceAccount::from_pem(
            "source@fixture-project.iam.gserviceaccount.com",
            test::PRIVATE_KEY_PEM,
            SA_TOKEN_URI,
        )
        .unwrap();
        Credential::new(account, ctx.clone())
    }

    #[tokio::test]
    async fn chain_hops_use_previous_token() {
        let transport = chain_transport();
        let (ctx, _) = test::context(transport.clone());
        let impersonated = Impersonated::new(&source(&ctx), "sa2")
            .unwrap()
            .with_delegates(["sa1"])
            .unwrap();
        let credential = Credential::new(impersonated, ctx).with_scopes(["narrow-scope"]);

        let token = credential.ensure_valid().await.unwrap();
        assert_eq!(token.principal().map(PrincipalRef::as_str), Some("sa2"));
        assert_eq!(token.value().as_str(), "token-for-sa2");
        assert_eq!(token.expiry(), Some(UnixTime(1_700_003_600)));

        let iam: Vec<_> = transport
            .requests()
            .into_iter()
            .filter(|r| r.url != SA_TOKEN_URI)
            .collect();
        assert_eq!(iam.len(), 2);

        assert_eq!(
            iam[0].url,
            "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/sa1:generateAccessToken"
        );
        assert_eq!(test::authorization(&iam[0]), Some("Bearer source-token"));
        assert_eq!(
            test::json_body(&iam[0]),
            json!({"scope": [DEFAULT_SCOPE], "lifetime": "3600s"})
        );

        assert!(iam[1].url.ends_with("/sa2:generateAccessToken"));
        assert_eq!(test::authorization(&iam[1]), Some("Bearer token-for-sa1"));
        assert_eq!(
            test::json_body(&iam[1]),
            json!({"scope": ["narrow-scope"], "lifetime": "3600s"})
        );
    }

    #[tokio::test]
    async fn pre_epoch_expire_time_is_malformed() {
        let transport = Arc::new(FakeTransport::new(|req| {
            Ok(if req.url == SA_TOKEN_URI {
                test::access_token_response("source-token", 3600)
            } else {
                test::ok_json(json!({
                    "accessToken": "target-token",
                    "expireTime": "1960-01-01T00:00:00Z",
                }))
            })
        }));
        let (ctx, _) = test::context(transport);
        let credential = Credential::new(Impersonated::new(&source(&ctx), "sa2").unwrap(), ctx);

        let err = credential.ensure_valid().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn intermediate_tokens_are_not_cached() {
        let transport = chain_transport();
        let (ctx, clock) = test::context(transport.clone());
        let impersonated = Impersonated::new(&source(&ctx), "sa2")
            .unwrap()
            .with_delegates(["sa1"])
            .unwrap();
        let credential = Credential::new(impersonated, ctx);

        credential.ensure_valid().await.unwrap();
        clock.set(UnixTime(1_700_003_600));
        credential.ensure_valid().await.unwrap();

        let hops = transport
            .requests()
            .iter()
            .filter(|r| r.url.ends_with(":generateAccessToken"))
            .count();
        assert_eq!(hops, 4);
    }

    #[test]
    fn lifetime_above_cap_is_rejected() {
        let (ctx, _) = test::context(Arc::new(FakeTransport::unreachable()));
        let err = Impersonated::new(&source(&ctx), "sa2")
            .unwrap()
            .with_lifetime(DurationSecs(3601))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn chain_length_and_repeats_are_checked() {
        let (ctx, _) = test::context(Arc::new(FakeTransport::unreachable()));
        let base = || Impersonated::new(&source(&ctx), "target").unwrap();

        let too_long: Vec<String> = (0..MAX_CHAIN_LENGTH).map(|i| format!("sa{i}")).collect();
        assert!(base().with_delegates(too_long).is_err());
        assert!(base().with_delegates(["sa1", "sa1"]).is_err());
        assert!(base().with_delegates(["target"]).is_err());
        assert!(base().with_delegates(["sa1", "sa2"]).is_ok());
    }

    #[test]
    fn impersonation_url_is_split() {
        let (endpoint, target) = parse_impersonation_url(
            "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/sa@p.iam.gserviceaccount.com:generateAccessToken",
        )
        .unwrap();
        assert_eq!(endpoint, "https://iamcredentials.googleapis.com/v1");
        assert_eq!(target.as_str(), "sa@p.iam.gserviceaccount.com");

        assert!(parse_impersonation_url("https://example.com/token").is_err());
        assert!(parse_impersonation_url(
            "https://iam.example/v1/projects/-/serviceAccounts/:generateAccessToken"
        )
        .is_err());
    }

    #[tokio::test]
    async fn loads_from_file_and_rejects_nesting() {
        let transport = chain_transport();
        let (ctx, _) = test::context(transport.clone());
        let file = json!({
            "type": "impersonated_service_account",
            "service_account_impersonation_url": "https://iam.example/v1/projects/-/serviceAccounts/sa2:generateAccessToken",
            "delegates": ["projects/-/serviceAccounts/sa1"],
            "source_credentials": test::service_account_json(SA_TOKEN_URI),
        });
        let credential = Credential::from_json(file.to_string().as_bytes(), &ctx).unwrap();
        match credential.kind() {
            CredentialKind::Impersonated(imp) => {
                assert_eq!(imp.target().as_str(), "sa2");
                assert_eq!(imp.delegates(), &[Principal::from("sa1")]);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        let token = credential.ensure_valid().await.unwrap();
        assert_eq!(token.value().as_str(), "token-for-sa2");

        let nested = json!({
            "type": "impersonated_service_account",
            "impersonation_url": "https://iam.example/v1/projects/-/serviceAccounts/sa3:generateAccessToken",
            "source_credentials": file,
        });
        let err = Credential::from_json(nested.to_string().as_bytes(), &ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn id_token_walks_delegates_first() {
        let key = credo_jose::RsaPrivateKey::from_pem(test::PRIVATE_KEY_PEM).unwrap();
        let claims = credo_jose::jwt::Claims::new("iss", "sub", "aud", NOW, NOW + DurationSecs(3600));
        let id_token = credo_jose::jwt::encode(&claims, &key, None).unwrap().as_str().to_owned();

        let transport = {
            let id_token = id_token.clone();
            Arc::new(FakeTransport::new(move |req| {
                if req.url == SA_TOKEN_URI {
                    Ok(test::access_token_response("source-token", 3600))
                } else if req.url.ends_with(":generateIdToken") {
                    Ok(test::ok_json(json!({ "token": id_token })))
                } else {
                    Ok(iam_response("token-for-sa1"))
                }
            }))
        };
        let (ctx, _) = test::context(transport.clone());
        let impersonated = Impersonated::new(&source(&ctx), "sa2")
            .unwrap()
            .with_delegates(["sa1"])
            .unwrap();
        let credential = Credential::new(impersonated, ctx).id_token("aud").unwrap();

        let token = credential.ensure_valid().await.unwrap();
        assert_eq!(token.value().as_str(), id_token);

        let last = transport.requests().pop().unwrap();
        assert!(last.url.ends_with("/sa2:generateIdToken"));
        assert_eq!(test::authorization(&last), Some("Bearer token-for-sa1"));
        assert_eq!(
            test::json_body(&last),
            json!({"audience": "aud", "includeEmail": true})
        );
    }
}
