use http::{HeaderName, HeaderValue, Method};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use ring::{digest, hmac};
use serde::Serialize;
use time::OffsetDateTime;

use credo_clock::UnixTime;

use crate::{
    sources::{dto, non_empty},
    transport::{self, HttpRequest},
    Env, Error, RefreshContext, SubjectToken,
};

const SIGNING_ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "sts";
const TARGET_RESOURCE_HEADER: &str = "x-goog-cloud-target-resource";
const SESSION_TOKEN_HEADER: HeaderName = HeaderName::from_static("x-aws-ec2-metadata-token");
const SESSION_TTL_HEADER: HeaderName =
    HeaderName::from_static("x-aws-ec2-metadata-token-ttl-seconds");

/// Characters left unescaped in canonical query strings
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// An AWS identity proven by a signed `GetCallerIdentity` request
///
/// Region and security credentials come from the standard AWS environment
/// variables when set, and otherwise from the instance metadata service.
#[derive(Clone, Debug)]
pub struct AwsSource {
    verification_url: String,
    region_url: Option<String>,
    credentials_url: Option<String>,
    session_token_url: Option<String>,
}

struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env(env: &dyn Env) -> Option<Self> {
        Some(Self {
            access_key_id: env.var("AWS_ACCESS_KEY_ID")?,
            secret_access_key: env.var("AWS_SECRET_ACCESS_KEY")?,
            session_token: env.var("AWS_SESSION_TOKEN"),
        })
    }
}

fn region_from_env(env: &dyn Env) -> Option<String> {
    env.var("AWS_REGION").or_else(|| env.var("AWS_DEFAULT_REGION"))
}

impl AwsSource {
    /// Signs requests against `verification_url`
    ///
    /// A `{region}` placeholder in the URL is replaced with the region the
    /// workload runs in.
    ///
    /// # Errors
    ///
    /// The URL is empty.
    pub fn new(verification_url: impl Into<String>) -> Result<Self, Error> {
        let verification_url = verification_url.into();
        non_empty(&verification_url, "regional_cred_verification_url")?;
        Ok(Self {
            verification_url,
            region_url: None,
            credentials_url: None,
            session_token_url: None,
        })
    }

    /// Reads the availability zone from `url` when the region is not set in
    /// the environment
    #[must_use]
    pub fn with_region_url(mut self, url: impl Into<String>) -> Self {
        self.region_url = Some(url.into());
        self
    }

    /// Reads the instance role's credentials from `url` when they are not
    /// set in the environment
    #[must_use]
    pub fn with_credentials_url(mut self, url: impl Into<String>) -> Self {
        self.credentials_url = Some(url.into());
        self
    }

    /// Obtains an IMDSv2 session token from `url` before reading metadata
    #[must_use]
    pub fn with_session_token_url(mut self, url: impl Into<String>) -> Self {
        self.session_token_url = Some(url.into());
        self
    }

    pub(crate) fn from_file(
        environment_id: &str,
        file: dto::CredentialSourceFile,
    ) -> Result<Self, Error> {
        let version = environment_id
            .strip_prefix("aws")
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| {
                Error::configuration(format!("unsupported environment `{environment_id}`"))
            })?;
        if version != 1 {
            return Err(Error::configuration(format!(
                "unsupported AWS environment version {version}"
            )));
        }

        let verification_url = file.regional_cred_verification_url.ok_or_else(|| {
            Error::configuration("AWS sources require `regional_cred_verification_url`")
        })?;

        let mut source = Self::new(verification_url)?;
        source.region_url = file.region_url;
        source.credentials_url = file.url;
        source.session_token_url = file.imdsv2_session_token_url;
        Ok(source)
    }

    #[tracing::instrument(level = "debug", err, skip_all)]
    pub(crate) async fn subject_token(
        &self,
        rc: &RefreshContext<'_>,
        env: &dyn Env,
        audience: &str,
    ) -> Result<SubjectToken, Error> {
        let region = region_from_env(env);
        let credentials = AwsCredentials::from_env(env);

        let session = match &self.session_token_url {
            Some(url) if region.is_none() || credentials.is_none() => {
                Some(self.session_token(rc, url).await?)
            }
            _ => None,
        };

        let region = match region {
            Some(region) => region,
            None => self.metadata_region(rc, session.as_ref()).await?,
        };
        let credentials = match credentials {
            Some(credentials) => credentials,
            None => self.metadata_credentials(rc, session.as_ref()).await?,
        };

        let signed = sign_caller_identity(
            &self.verification_url,
            &region,
            &credentials,
            audience,
            rc.now(),
        )?;
        let json = serde_json::to_string(&signed)
            .map_err(|e| Error::configuration_by("unable to serialize signed request", e))?;

        Ok(SubjectToken::from(
            url::form_urlencoded::byte_serialize(json.as_bytes()).collect::<String>(),
        ))
    }

    async fn session_token(&self, rc: &RefreshContext<'_>, url: &str) -> Result<HeaderValue, Error> {
        let request = HttpRequest::new(Method::PUT, url)
            .with_timeout(rc.request_timeout())
            .with_header(SESSION_TTL_HEADER, HeaderValue::from_static("300"));
        let token = metadata_text(rc, request).await?;
        let mut value = transport::header_value(&token, "IMDSv2 session token")?;
        value.set_sensitive(true);
        Ok(value)
    }

    async fn metadata_region(
        &self,
        rc: &RefreshContext<'_>,
        session: Option<&HeaderValue>,
    ) -> Result<String, Error> {
        let url = self.region_url.as_deref().ok_or_else(|| {
            Error::configuration("AWS region is not set and no `region_url` is configured")
        })?;
        let zone = metadata_text(rc, metadata_get(rc, url, session)).await?;

        // The zone is the region with a trailing letter, as in `us-east-1b`
        let mut region = zone;
        region.pop();
        if region.is_empty() {
            return Err(Error::malformed(
                transport::endpoint_of(url),
                "availability zone is empty",
            ));
        }
        Ok(region)
    }

    async fn metadata_credentials(
        &self,
        rc: &RefreshContext<'_>,
        session: Option<&HeaderValue>,
    ) -> Result<AwsCredentials, Error> {
        let url = self.credentials_url.as_deref().ok_or_else(|| {
            Error::configuration("AWS credentials are not set and no `url` is configured")
        })?;
        let url = url.trim_end_matches('/');

        let role = metadata_text(rc, metadata_get(rc, url, session)).await?;
        if role.is_empty() {
            return Err(Error::malformed(
                transport::endpoint_of(url),
                "no role is attached to the instance",
            ));
        }

        let request = metadata_get(rc, &format!("{url}/{role}"), session);
        let credentials: dto::AwsSecurityCredentials =
            transport::exchange(rc.transport(), request).await?;

        Ok(AwsCredentials {
            access_key_id: credentials.access_key_id,
            secret_access_key: credentials.secret_access_key,
            session_token: credentials.token,
        })
    }
}

fn metadata_get(rc: &RefreshContext<'_>, url: &str, session: Option<&HeaderValue>) -> HttpRequest {
    let request = HttpRequest::get(url).with_timeout(rc.request_timeout());
    match session {
        Some(session) => request.with_header(SESSION_TOKEN_HEADER, session.clone()),
        None => request,
    }
}

async fn metadata_text(rc: &RefreshContext<'_>, request: HttpRequest) -> Result<String, Error> {
    let (endpoint, body) = transport::exchange_raw(rc.transport(), request).await?;
    let text = String::from_utf8(body)
        .map_err(|e| Error::malformed_by(endpoint, "response is not UTF-8", e))?;
    Ok(text.trim().to_owned())
}

#[derive(Debug, Serialize)]
struct SignedRequest {
    url: String,
    method: &'static str,
    headers: Vec<SignedHeader>,
}

#[derive(Debug, Serialize)]
struct SignedHeader {
    key: String,
    value: String,
}

/// Builds a SigV4-signed `GetCallerIdentity` request without sending it
fn sign_caller_identity(
    verification_url: &str,
    region: &str,
    credentials: &AwsCredentials,
    audience: &str,
    now: UnixTime,
) -> Result<SignedRequest, Error> {
    let url_string = verification_url.replace("{region}", region);
    let url = url::Url::parse(&url_string).map_err(|e| {
        Error::configuration_by(format!("invalid verification URL `{url_string}`"), e)
    })?;
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_owned(),
        (None, _) => {
            return Err(Error::configuration(format!(
                "verification URL `{url_string}` has no host"
            )))
        }
    };

    let timestamp = i64::try_from(now.0)
        .ok()
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
        .ok_or_else(|| Error::configuration(format!("time {now} is out of range")))?;
    let date = format!(
        "{:04}{:02}{:02}",
        timestamp.year(),
        u8::from(timestamp.month()),
        timestamp.day()
    );
    let amz_date = format!(
        "{date}T{:02}{:02}{:02}Z",
        timestamp.hour(),
        timestamp.minute(),
        timestamp.second()
    );

    let mut headers = vec![("host", host), ("x-amz-date", amz_date.clone())];
    if let Some(token) = &credentials.session_token {
        headers.push(("x-amz-security-token", token.clone()));
    }
    headers.push((TARGET_RESOURCE_HEADER, audience.to_owned()));

    let mut query: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            (
                utf8_percent_encode(&k, UNRESERVED).to_string(),
                utf8_percent_encode(&v, UNRESERVED).to_string(),
            )
        })
        .collect();
    query.sort();
    let canonical_query = query
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{}\n", value.trim()))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "POST\n{}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{}",
        url.path(),
        hex::encode(digest::digest(&digest::SHA256, b""))
    );

    let scope = format!("{date}/{region}/{SERVICE}/aws4_request");
    let string_to_sign = format!(
        "{SIGNING_ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex::encode(digest::digest(&digest::SHA256, canonical_request.as_bytes()))
    );

    let key = [date.as_str(), region, SERVICE, "aws4_request"].iter().fold(
        format!("AWS4{}", credentials.secret_access_key).into_bytes(),
        |key, part| sign(&key, part.as_bytes()),
    );
    let signature = hex::encode(sign(&key, string_to_sign.as_bytes()));

    let authorization = format!(
        "{SIGNING_ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        credentials.access_key_id
    );

    let mut signed_headers = vec![SignedHeader {
        key: "Authorization".to_owned(),
        value: authorization,
    }];
    signed_headers.extend(headers.into_iter().map(|(name, value)| SignedHeader {
        key: name.to_owned(),
        value,
    }));

    Ok(SignedRequest {
        url: url_string,
        method: "POST",
        headers: signed_headers,
    })
}

fn sign(key: &[u8], data: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::sign(&key, data).as_ref().to_vec()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http::StatusCode;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{
        test::{self, FakeTransport, NOW},
        transport::HttpResponse,
        Credential, MapEnv,
    };

    const VERIFICATION_URL: &str =
        "https://sts.{region}.amazonaws.com?Action=GetCallerIdentity&Version=2011-06-15";
    const AUDIENCE: &str =
        "//iam.googleapis.com/projects/123/locations/global/workloadIdentityPools/pool/providers/aws";
    const STS_URL: &str = "https://sts.googleapis.com/v1/token";
    const SECRET: &str = "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY";

    fn credentials(session_token: Option<&str>) -> AwsCredentials {
        AwsCredentials {
            access_key_id: "AKIDEXAMPLE".to_owned(),
            secret_access_key: SECRET.to_owned(),
            session_token: session_token.map(str::to_owned),
        }
    }

    fn header<'a>(request: &'a SignedRequest, key: &str) -> Option<&'a str> {
        request
            .headers
            .iter()
            .find(|h| h.key == key)
            .map(|h| h.value.as_str())
    }

    #[test]
    fn signs_caller_identity_request() {
        let signed =
            sign_caller_identity(VERIFICATION_URL, "us-east-1", &credentials(None), AUDIENCE, NOW)
                .unwrap();

        assert_eq!(
            signed.url,
            "https://sts.us-east-1.amazonaws.com?Action=GetCallerIdentity&Version=2011-06-15"
        );
        assert_eq!(signed.method, "POST");
        assert_eq!(header(&signed, "host"), Some("sts.us-east-1.amazonaws.com"));
        assert_eq!(header(&signed, "x-amz-date"), Some("20231114T221320Z"));
        assert_eq!(header(&signed, TARGET_RESOURCE_HEADER), Some(AUDIENCE));
        assert_eq!(header(&signed, "x-amz-security-token"), None);
        assert_eq!(
            header(&signed, "Authorization"),
            Some(
                "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20231114/us-east-1/sts/aws4_request, \
                 SignedHeaders=host;x-amz-date;x-goog-cloud-target-resource, \
                 Signature=9a99ec67a9e65e3b9bb537436941b5caa7e6b8d5b2612efecd42f662f33abe11"
            )
        );
    }

    #[test]
    fn session_token_is_signed() {
        let signed = sign_caller_identity(
            VERIFICATION_URL,
            "us-east-1",
            &credentials(Some("session-token")),
            AUDIENCE,
            NOW,
        )
        .unwrap();

        assert_eq!(header(&signed, "x-amz-security-token"), Some("session-token"));
        assert_eq!(
            header(&signed, "Authorization"),
            Some(
                "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20231114/us-east-1/sts/aws4_request, \
                 SignedHeaders=host;x-amz-date;x-amz-security-token;x-goog-cloud-target-resource, \
                 Signature=2a43726e427d5f9bf9c8ae4538bf498062596bc501b3c65d35aba16ebc9cb174"
            )
        );
    }

    fn decode_subject(subject: &str) -> serde_json::Value {
        let decoded: String = url::form_urlencoded::parse(format!("t={subject}").as_bytes())
            .map(|(_, v)| v.into_owned())
            .next()
            .unwrap();
        serde_json::from_str(&decoded).unwrap()
    }

    fn file(source: serde_json::Value) -> Vec<u8> {
        json!({
            "type": "external_account",
            "audience": AUDIENCE,
            "subject_token_type": "urn:ietf:params:aws:token-type:aws4_request",
            "token_url": STS_URL,
            "credential_source": source,
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn uses_environment_credentials_without_metadata() {
        let transport = Arc::new(FakeTransport::new(|_| {
            Ok(test::access_token_response("federated-token", 3600))
        }));
        let (ctx, _) = test::context(transport.clone());
        let ctx = ctx.with_env(
            MapEnv::default()
                .with("AWS_REGION", "us-east-1")
                .with("AWS_ACCESS_KEY_ID", "AKIDEXAMPLE")
                .with("AWS_SECRET_ACCESS_KEY", SECRET),
        );
        let credential = Credential::from_json(
            &file(json!({
                "environment_id": "aws1",
                "region_url": "http://169.254.169.254/latest/meta-data/placement/availability-zone",
                "url": "http://169.254.169.254/latest/meta-data/iam/security-credentials",
                "regional_cred_verification_url": VERIFICATION_URL,
            })),
            &ctx,
        )
        .unwrap();

        credential.ensure_valid().await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        let subject = decode_subject(&test::form(&requests[0])["subject_token"]);
        assert_eq!(
            subject["url"],
            "https://sts.us-east-1.amazonaws.com?Action=GetCallerIdentity&Version=2011-06-15"
        );
        assert_eq!(subject["method"], "POST");
        assert_eq!(subject["headers"][0]["key"], "Authorization");
    }

    #[tokio::test]
    async fn reads_region_and_role_from_metadata_with_session() {
        let transport = Arc::new(FakeTransport::new(|req| {
            let ok = |body: &str| Ok(HttpResponse::new(StatusCode::OK, body.to_owned()));
            match (req.method.as_str(), req.url.as_str()) {
                ("PUT", "http://169.254.169.254/latest/api/token") => ok("imds-session"),
                (_, "http://169.254.169.254/latest/meta-data/placement/availability-zone") => {
                    ok("us-west-2b")
                }
                (_, "http://169.254.169.254/latest/meta-data/iam/security-credentials") => {
                    ok("my-role\n")
                }
                (_, "http://169.254.169.254/latest/meta-data/iam/security-credentials/my-role") => {
                    Ok(test::ok_json(json!({
                        "AccessKeyId": "AKIDEXAMPLE",
                        "SecretAccessKey": SECRET,
                        "Token": "session-token",
                    })))
                }
                _ => Ok(test::access_token_response("federated-token", 3600)),
            }
        }));
        let (ctx, _) = test::context(transport.clone());
        let credential = Credential::from_json(
            &file(json!({
                "environment_id": "aws1",
                "region_url": "http://169.254.169.254/latest/meta-data/placement/availability-zone",
                "url": "http://169.254.169.254/latest/meta-data/iam/security-credentials",
                "imdsv2_session_token_url": "http://169.254.169.254/latest/api/token",
                "regional_cred_verification_url": VERIFICATION_URL,
            })),
            &ctx,
        )
        .unwrap();

        credential.ensure_valid().await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 5);
        assert_eq!(requests[0].headers[&SESSION_TTL_HEADER], "300");
        for metadata in &requests[1..4] {
            assert_eq!(metadata.headers[&SESSION_TOKEN_HEADER], "imds-session");
        }

        let subject = decode_subject(&test::form(&requests[4])["subject_token"]);
        assert_eq!(
            subject["url"],
            "https://sts.us-west-2.amazonaws.com?Action=GetCallerIdentity&Version=2011-06-15"
        );
        let headers = subject["headers"].as_array().unwrap();
        assert!(headers
            .iter()
            .any(|h| h["key"] == "x-amz-security-token" && h["value"] == "session-token"));
    }

    #[test]
    fn rejects_unknown_environment_version() {
        let (ctx, _) = test::context(Arc::new(FakeTransport::unreachable()));
        let err = Credential::from_json(
            &file(json!({
                "environment_id": "aws2",
                "regional_cred_verification_url": VERIFICATION_URL,
            })),
            &ctx,
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }
}
