use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use credo_clock::UnixTime;

use crate::{
    sources::{dto, non_empty},
    transport, Env, Error, RefreshContext, SubjectToken,
};

/// Must be set to `1` before any executable source is run
pub const ALLOW_EXECUTABLES_VAR: &str = "GOOGLE_EXTERNAL_ACCOUNT_ALLOW_EXECUTABLES";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_TIMEOUT: Duration = Duration::from_secs(120);

const SUPPORTED_TOKEN_TYPES: [&str; 3] = [
    "urn:ietf:params:oauth:token-type:jwt",
    "urn:ietf:params:oauth:token-type:id_token",
    "urn:ietf:params:oauth:token-type:saml2",
];

/// A local program that prints a subject token as JSON
///
/// The command line is split on whitespace and run without a shell. When an
/// output file is configured, an unexpired response cached there is used
/// instead of running the program.
#[derive(Clone, Debug)]
pub struct ExecutableSource {
    command: String,
    timeout: Duration,
    output_file: Option<PathBuf>,
}

impl ExecutableSource {
    /// Runs `command` to obtain subject tokens
    ///
    /// # Errors
    ///
    /// The command is empty.
    pub fn new(command: impl Into<String>) -> Result<Self, Error> {
        let command = command.into();
        non_empty(&command, "credential_source.executable.command")?;
        Ok(Self {
            command,
            timeout: DEFAULT_TIMEOUT,
            output_file: None,
        })
    }

    /// Bounds how long the program may run
    ///
    /// # Errors
    ///
    /// The timeout is outside 5 to 120 seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, Error> {
        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&timeout) {
            return Err(Error::configuration(format!(
                "executable timeout must be between {MIN_TIMEOUT:?} and {MAX_TIMEOUT:?}, not {timeout:?}"
            )));
        }
        self.timeout = timeout;
        Ok(self)
    }

    /// Uses and announces a file where the program caches its response
    #[must_use]
    pub fn with_output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    pub(crate) fn from_file(file: dto::ExecutableFile) -> Result<Self, Error> {
        let mut source = Self::new(file.command)?;
        if let Some(millis) = file.timeout_millis {
            source = source.with_timeout(Duration::from_millis(millis))?;
        }
        Ok(match file.output_file {
            Some(path) => source.with_output_file(path),
            None => source,
        })
    }

    pub(crate) fn check_token_type(&self, token_type: &str) -> Result<(), Error> {
        if SUPPORTED_TOKEN_TYPES.contains(&token_type) {
            Ok(())
        } else {
            Err(Error::configuration(format!(
                "executable sources cannot provide `{token_type}` subject tokens"
            )))
        }
    }

    fn origin(&self) -> String {
        format!("executable `{}`", self.command)
    }

    pub(crate) async fn subject_token(
        &self,
        rc: &RefreshContext<'_>,
        env: &dyn Env,
        audience: &str,
        token_type: &str,
    ) -> Result<SubjectToken, Error> {
        if env.var(ALLOW_EXECUTABLES_VAR).as_deref() != Some("1") {
            return Err(Error::configuration(format!(
                "executable credential sources are disabled; set {ALLOW_EXECUTABLES_VAR}=1 to allow them"
            )));
        }

        let now = rc.now();
        if let Some(path) = &self.output_file {
            if let Some(token) = self.cached(path, token_type, now).await {
                tracing::debug!(path = %path.display(), "using cached executable response");
                return Ok(token);
            }
        }

        let origin = self.origin();
        let stdout = self.run(&origin, audience, token_type).await?;
        let response: dto::ExecutableResponse = transport::parse_json(&origin, &stdout)?;
        self.interpret(response, &origin, token_type, now)
    }

    async fn cached(&self, path: &Path, token_type: &str, now: UnixTime) -> Option<SubjectToken> {
        let raw = tokio::fs::read(path).await.ok()?;
        if raw.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        let origin = format!("cached response in {}", path.display());
        let interpreted = serde_json::from_slice(&raw)
            .map_err(|e| Error::malformed_by(&origin, "unable to decode cached response", e))
            .and_then(|response| self.interpret(response, &origin, token_type, now));
        match interpreted {
            Ok(token) => Some(token),
            Err(error) => {
                tracing::debug!(%error, "ignoring cached executable response");
                None
            }
        }
    }

    #[tracing::instrument(level = "debug", err, skip(self, audience, token_type), fields(timeout = ?self.timeout))]
    async fn run(&self, origin: &str, audience: &str, token_type: &str) -> Result<Vec<u8>, Error> {
        let mut parts = self.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::configuration("executable command is empty"))?;

        let mut command = tokio::process::Command::new(program);
        command
            .args(parts)
            .env("GOOGLE_EXTERNAL_ACCOUNT_AUDIENCE", audience)
            .env("GOOGLE_EXTERNAL_ACCOUNT_TOKEN_TYPE", token_type)
            .env("GOOGLE_EXTERNAL_ACCOUNT_INTERACTIVE", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = &self.output_file {
            command.env("GOOGLE_EXTERNAL_ACCOUNT_OUTPUT_FILE", path);
        }

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|e| Error::unreachable(origin, e))?
            .map_err(|e| Error::configuration_by(format!("unable to run `{program}`"), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::failed(
                origin,
                format!("{} {}", output.status, stderr.trim()),
            ));
        }

        Ok(output.stdout)
    }

    fn interpret(
        &self,
        response: dto::ExecutableResponse,
        origin: &str,
        token_type: &str,
        now: UnixTime,
    ) -> Result<SubjectToken, Error> {
        if response.version != 1 {
            return Err(Error::malformed(
                origin,
                format!("unsupported response version {}", response.version),
            ));
        }

        if !response.success {
            return Err(Error::failed(
                origin,
                format!(
                    "{}: {}",
                    response.code.as_deref().unwrap_or("unknown"),
                    response.message.as_deref().unwrap_or("no message")
                ),
            ));
        }

        if response.token_type.as_deref() != Some(token_type) {
            return Err(Error::malformed(
                origin,
                format!("expected a `{token_type}` token"),
            ));
        }

        match response.expiration_time {
            Some(expiry) if UnixTime(expiry) <= now => {
                return Err(Error::malformed(origin, "token has already expired"));
            }
            None if self.output_file.is_some() => {
                return Err(Error::malformed(
                    origin,
                    "`expiration_time` is required when an output file is configured",
                ));
            }
            _ => {}
        }

        let token = if token_type.ends_with(":saml2") {
            response.saml_response
        } else {
            response.id_token
        };
        token
            .filter(|t| !t.is_empty())
            .map(SubjectToken::from)
            .ok_or_else(|| Error::malformed(origin, "response carries no token"))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{os::unix::fs::PermissionsExt, sync::Arc};

    use serde_json::json;

    use super::*;
    use crate::{
        sources::{CredentialSource, ExternalAccount},
        test::{self, FakeTransport},
        Context, Credential, ErrorKind, MapEnv,
    };

    const STS_URL: &str = "https://sts.example/v1/token";
    const JWT_TYPE: &str = "urn:ietf:params:oauth:token-type:jwt";

    fn script(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("token.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn credential(source: ExecutableSource, allow: bool) -> (Credential, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::new(|_| {
            Ok(test::access_token_response("federated-token", 3600))
        }));
        let (ctx, _) = test::context(transport.clone());
        let env = if allow {
            MapEnv::default().with(ALLOW_EXECUTABLES_VAR, "1")
        } else {
            MapEnv::default()
        };
        let ctx: Context = ctx.with_env(env);
        let account = ExternalAccount::new(
            "//iam.googleapis.com/projects/1/locations/global/workloadIdentityPools/p/providers/x",
            JWT_TYPE,
            STS_URL,
            CredentialSource::Executable(source),
            &ctx,
        )
        .unwrap();
        (Credential::new(account, ctx), transport)
    }

    #[tokio::test]
    async fn refuses_to_run_unless_allowed() {
        let (credential, transport) = credential(ExecutableSource::new("/bin/true").unwrap(), false);
        let err = credential.ensure_valid().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn runs_program_with_context_in_environment() {
        let dir = tempfile::tempdir().unwrap();
        let command = script(
            &dir,
            r#"printf '{"version":1,"success":true,"token_type":"%s","expiration_time":1700003600,"id_token":"interactive-%s"}' "$GOOGLE_EXTERNAL_ACCOUNT_TOKEN_TYPE" "$GOOGLE_EXTERNAL_ACCOUNT_INTERACTIVE""#,
        );
        let (credential, transport) = credential(ExecutableSource::new(command).unwrap(), true);

        credential.ensure_valid().await.unwrap();
        let form = test::form(&transport.requests()[0]);
        assert_eq!(form["subject_token"], "interactive-0");
    }

    #[tokio::test]
    async fn unsuccessful_response_is_token_exchange_error() {
        let dir = tempfile::tempdir().unwrap();
        let command = script(
            &dir,
            r#"echo '{"version":1,"success":false,"code":"401","message":"not signed in"}'"#,
        );
        let (credential, transport) = credential(ExecutableSource::new(command).unwrap(), true);

        let err = credential.ensure_valid().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TokenExchange);
        assert!(err.to_string().contains("not signed in"), "{err}");
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn non_zero_exit_is_token_exchange_error() {
        let dir = tempfile::tempdir().unwrap();
        let command = script(&dir, "echo boom >&2\nexit 3");
        let (credential, _) = credential(ExecutableSource::new(command).unwrap(), true);

        let err = credential.ensure_valid().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TokenExchange);
        assert!(err.to_string().contains("boom"), "{err}");
    }

    #[tokio::test]
    async fn unexpired_cached_response_skips_program() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache.json");
        std::fs::write(
            &cache,
            json!({
                "version": 1,
                "success": true,
                "token_type": JWT_TYPE,
                "expiration_time": 1_700_003_600,
                "id_token": "cached-token",
            })
            .to_string(),
        )
        .unwrap();

        let source = ExecutableSource::new("/nonexistent/program")
            .unwrap()
            .with_output_file(&cache);
        let (credential, transport) = credential(source, true);

        credential.ensure_valid().await.unwrap();
        let form = test::form(&transport.requests()[0]);
        assert_eq!(form["subject_token"], "cached-token");
    }

    #[test]
    fn timeout_is_bounded() {
        let source = || ExecutableSource::new("/bin/true").unwrap();
        assert!(source().with_timeout(Duration::from_secs(1)).is_err());
        assert!(source().with_timeout(Duration::from_secs(121)).is_err());
        assert!(source().with_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn expired_response_is_rejected() {
        let source = ExecutableSource::new("/bin/true").unwrap();
        let response = dto::ExecutableResponse {
            version: 1,
            success: true,
            token_type: Some(JWT_TYPE.to_owned()),
            expiration_time: Some(test::NOW.0),
            id_token: Some("t".to_owned()),
            saml_response: None,
            code: None,
            message: None,
        };
        let err = source
            .interpret(response, "test", JWT_TYPE, test::NOW)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    }
}
