use std::{fmt, sync::Arc};

use async_trait::async_trait;
use credo_clock::{Clock, DurationSecs, UnixTime};
use http::{header, HeaderMap, HeaderName};

use crate::{
    coordinator::{RefreshOptions, TokenSlot},
    sources::{
        ApiKey, ComputeMetadata, ExternalAccount, IdTokenCredential, Impersonated,
        ServiceAccount, UserAccount,
    },
    transport::{self, Transport},
    Context, Error, Token,
};

/// The header carrying the project billed for quota
pub const QUOTA_PROJECT_HEADER: HeaderName = HeaderName::from_static("x-goog-user-project");

/// What a credential variant is given when asked to refresh
#[derive(Debug)]
pub struct RefreshContext<'a> {
    ctx: &'a Context,
    scopes: &'a [String],
    subject: Option<&'a str>,
}

impl<'a> RefreshContext<'a> {
    pub(crate) fn new(ctx: &'a Context, scopes: &'a [String], subject: Option<&'a str>) -> Self {
        Self {
            ctx,
            scopes,
            subject,
        }
    }

    /// The transport to reach token endpoints with
    pub fn transport(&self) -> &'a dyn Transport {
        self.ctx.transport()
    }

    /// The current time
    pub fn now(&self) -> UnixTime {
        self.ctx.clock().now()
    }

    /// The scopes requested for the token
    pub fn scopes(&self) -> &'a [String] {
        self.scopes
    }

    /// The requested scopes, or `default` when none were requested
    pub fn scopes_or(&self, default: &'a str) -> Vec<&'a str> {
        if self.scopes.is_empty() {
            vec![default]
        } else {
            self.scopes.iter().map(String::as_str).collect()
        }
    }

    /// The user to act on behalf of, if any
    pub fn subject(&self) -> Option<&'a str> {
        self.subject
    }

    /// The collaborators of the credential being refreshed
    pub fn context(&self) -> &'a Context {
        self.ctx
    }

    /// The bound on each request made while refreshing
    pub fn request_timeout(&self) -> std::time::Duration {
        self.ctx.refresh_options().timeout()
    }
}

/// The capabilities every kind of credential provides
#[async_trait]
pub trait CredentialVariant: fmt::Debug + Send + Sync {
    /// Obtains a new token from the issuing authority
    async fn do_refresh(&self, rc: &RefreshContext<'_>) -> Result<Token, Error>;

    /// Attaches `token` to outbound request headers
    ///
    /// The default sets `Authorization` to the token as a bearer value.
    fn apply(&self, token: &Token, headers: &mut HeaderMap) -> Result<(), Error> {
        headers.insert(header::AUTHORIZATION, transport::bearer(token.value().as_str())?);
        Ok(())
    }

    /// A non-secret summary for logs
    fn describe(&self) -> String;

    /// A token the credential holds before its first refresh, as seen at `now`
    fn initial_token(&self, _now: UnixTime) -> Option<Token> {
        None
    }

    /// Whether the credential can act on behalf of a delegated user
    fn supports_subject(&self) -> bool {
        false
    }
}

/// Every kind of credential
#[derive(Debug)]
pub enum CredentialKind {
    /// A service account holding its own signing key
    ServiceAccount(ServiceAccount),
    /// An end user's OAuth2 grant
    UserAccount(UserAccount),
    /// A static API key
    ApiKey(ApiKey),
    /// The attached identity of a compute instance
    ComputeMetadata(ComputeMetadata),
    /// A third-party identity traded for an access token
    ExternalAccount(ExternalAccount),
    /// Another credential acting as a different service account
    Impersonated(Impersonated),
    /// An identity token minted for a specific audience
    IdToken(IdTokenCredential),
}

macro_rules! dispatch {
    ($self:ident, $v:ident => $e:expr) => {
        match $self {
            CredentialKind::ServiceAccount($v) => $e,
            CredentialKind::UserAccount($v) => $e,
            CredentialKind::ApiKey($v) => $e,
            CredentialKind::ComputeMetadata($v) => $e,
            CredentialKind::ExternalAccount($v) => $e,
            CredentialKind::Impersonated($v) => $e,
            CredentialKind::IdToken($v) => $e,
        }
    };
}

macro_rules! kind_from {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for CredentialKind {
                fn from(v: $ty) -> Self {
                    Self::$variant(v)
                }
            }
        )*
    };
}

kind_from!(
    ServiceAccount(ServiceAccount),
    UserAccount(UserAccount),
    ApiKey(ApiKey),
    ComputeMetadata(ComputeMetadata),
    ExternalAccount(ExternalAccount),
    Impersonated(Impersonated),
    IdToken(IdTokenCredential),
);

#[async_trait]
impl CredentialVariant for CredentialKind {
    async fn do_refresh(&self, rc: &RefreshContext<'_>) -> Result<Token, Error> {
        dispatch!(self, v => v.do_refresh(rc).await)
    }

    fn apply(&self, token: &Token, headers: &mut HeaderMap) -> Result<(), Error> {
        dispatch!(self, v => v.apply(token, headers))
    }

    fn describe(&self) -> String {
        dispatch!(self, v => v.describe())
    }

    fn initial_token(&self, now: UnixTime) -> Option<Token> {
        dispatch!(self, v => v.initial_token(now))
    }

    fn supports_subject(&self) -> bool {
        dispatch!(self, v => v.supports_subject())
    }
}

/// A credential that keeps itself supplied with a valid token
///
/// Clones share the same token. The `with_*` methods instead produce a new
/// credential that shares configuration but keeps its own token.
#[derive(Clone)]
pub struct Credential {
    kind: Arc<CredentialKind>,
    scopes: Arc<[String]>,
    subject: Option<Arc<str>>,
    quota_project: Option<Arc<str>>,
    ctx: Context,
    slot: Arc<TokenSlot>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credential")
            .field("kind", &self.kind)
            .field("scopes", &self.scopes)
            .field("subject", &self.subject)
            .field("quota_project", &self.quota_project)
            .field("expiry", &self.cached_token().and_then(|t| t.expiry()))
            .finish()
    }
}

impl Credential {
    /// Constructs a credential of the given kind
    pub fn new(kind: impl Into<CredentialKind>, ctx: Context) -> Self {
        let kind = kind.into();
        let slot = Arc::new(TokenSlot::new(kind.initial_token(ctx.clock().now())));
        Self {
            kind: Arc::new(kind),
            scopes: Arc::from(Vec::new()),
            subject: None,
            quota_project: None,
            ctx,
            slot,
        }
    }

    fn derive(&self) -> Self {
        Self {
            slot: Arc::new(TokenSlot::new(
                self.kind.initial_token(self.ctx.clock().now()),
            )),
            ..self.clone()
        }
    }

    /// A credential requesting tokens for `scopes`
    #[must_use]
    pub fn with_scopes<I, S>(&self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scopes: scopes.into_iter().map(Into::into).collect(),
            ..self.derive()
        }
    }

    /// A credential acting on behalf of `subject`
    ///
    /// # Errors
    ///
    /// Only service accounts can act on behalf of another user.
    pub fn with_subject(&self, subject: impl Into<String>) -> Result<Self, Error> {
        if !self.kind.supports_subject() {
            return Err(Error::configuration(format!(
                "{} cannot act on behalf of a subject",
                self.kind.describe()
            )));
        }
        let subject = subject.into();
        if subject.is_empty() {
            return Err(Error::configuration("subject must not be empty"));
        }
        Ok(Self {
            subject: Some(Arc::from(subject)),
            ..self.derive()
        })
    }

    /// A credential billing quota to `project`
    #[must_use]
    pub fn with_quota_project(&self, project: impl Into<String>) -> Self {
        let project: String = project.into();
        Self {
            quota_project: Some(Arc::from(project)),
            ..self.derive()
        }
    }

    /// A credential using different refresh options
    #[must_use]
    pub fn with_refresh_options(&self, options: RefreshOptions) -> Self {
        Self {
            ctx: self.ctx.clone().with_refresh_options(options),
            ..self.derive()
        }
    }

    /// The kind of credential
    pub fn kind(&self) -> &CredentialKind {
        &self.kind
    }

    pub(crate) fn kind_arc(&self) -> Arc<CredentialKind> {
        Arc::clone(&self.kind)
    }

    /// The requested scopes
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// The user the credential acts on behalf of, if any
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// The project billed for quota, if any
    pub fn quota_project(&self) -> Option<&str> {
        self.quota_project.as_deref()
    }

    /// The collaborators the credential relies on
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// A non-secret summary for logs
    pub fn describe(&self) -> String {
        let mut description = self.kind.describe();
        if let Some(subject) = &self.subject {
            description.push_str(" for ");
            description.push_str(subject);
        }
        description
    }

    /// The most recently obtained token, even if it is no longer valid
    pub fn cached_token(&self) -> Option<Arc<Token>> {
        self.slot.current()
    }

    /// Returns a valid token, refreshing it first if needed
    ///
    /// Concurrent callers share a single refresh. On failure the previous
    /// token stays available through [`cached_token`][Self::cached_token]
    /// and the next call tries again.
    #[tracing::instrument(
        level = "debug",
        err,
        skip(self),
        fields(credential = %self.describe()),
    )]
    pub async fn ensure_valid(&self) -> Result<Arc<Token>, Error> {
        let options = self.ctx.refresh_options();
        self.slot
            .ensure_valid(self.ctx.clock(), options, || async {
                let rc = RefreshContext::new(&self.ctx, &self.scopes, self.subject.as_deref());
                let token = self.kind.do_refresh(&rc).await?;
                tracing::info!(
                    kind = %token.kind(),
                    expiry = token.expiry().map(|e| e.0),
                    lifetime = token.expiry().map(|e| (e - rc.now()).0),
                    "obtained new token"
                );
                Ok(token)
            })
            .await
    }

    /// Returns a valid token; an alias for [`ensure_valid`][Self::ensure_valid]
    pub async fn token(&self) -> Result<Arc<Token>, Error> {
        self.ensure_valid().await
    }

    /// Attaches the cached token, and the quota project if any, to `headers`
    ///
    /// This performs no I/O. Call [`ensure_valid`][Self::ensure_valid] first.
    ///
    /// # Errors
    ///
    /// No unexpired token is cached.
    pub fn apply(&self, mut headers: HeaderMap) -> Result<HeaderMap, Error> {
        let now = self.ctx.clock().now();
        let token = self
            .cached_token()
            .filter(|t| t.is_valid_at(now, DurationSecs::ZERO))
            .ok_or_else(|| Error::unavailable("no unexpired token is cached"))?;
        self.apply_token(&token, &mut headers)?;
        Ok(headers)
    }

    /// Ensures the token is valid and returns headers carrying it
    pub async fn headers(&self) -> Result<HeaderMap, Error> {
        let token = self.ensure_valid().await?;
        let mut headers = HeaderMap::new();
        self.apply_token(&token, &mut headers)?;
        Ok(headers)
    }

    fn apply_token(&self, token: &Token, headers: &mut HeaderMap) -> Result<(), Error> {
        self.kind.apply(token, headers)?;
        if let Some(project) = &self.quota_project {
            headers.insert(
                QUOTA_PROJECT_HEADER,
                transport::header_value(project, "quota project")?,
            );
        }
        Ok(())
    }
}
