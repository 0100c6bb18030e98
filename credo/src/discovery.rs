//! Resolving the ambient credential of the running process
//!
//! Discovery tries an ordered list of [`Probe`]s and returns the first
//! credential found. A probe that finds nothing reports
//! [`Error::Unavailable`] and the next probe runs; any other error stops
//! discovery immediately.

use std::{fmt, io, path::PathBuf, time::Duration};

use crate::{sources::ComputeMetadata, Context, Credential, Error};

/// Names a credential file to use instead of searching
pub const CREDENTIALS_VAR: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Overrides the quota project of the discovered credential
pub const QUOTA_PROJECT_VAR: &str = "GOOGLE_CLOUD_QUOTA_PROJECT";

/// Overrides the directory holding the well-known credential file
pub const CLOUDSDK_CONFIG_VAR: &str = "CLOUDSDK_CONFIG";

/// How long the metadata server is given to answer a probe by default
pub const DEFAULT_METADATA_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

const WELL_KNOWN_FILE: &str = "application_default_credentials.json";

/// A place a credential may be found
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Probe {
    /// The file named by [`CREDENTIALS_VAR`]
    OverridePath,
    /// The application default credentials file written by `gcloud`
    WellKnownFile,
    /// The metadata server of a compute instance
    ComputeMetadata,
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::OverridePath => "override path",
            Self::WellKnownFile => "well-known file",
            Self::ComputeMetadata => "compute metadata",
        })
    }
}

/// How discovery searches for a credential
#[derive(Clone, Debug)]
pub struct DiscoveryOptions {
    probes: Vec<Probe>,
    metadata_timeout: Duration,
    well_known_path: Option<PathBuf>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            probes: vec![
                Probe::OverridePath,
                Probe::WellKnownFile,
                Probe::ComputeMetadata,
            ],
            metadata_timeout: DEFAULT_METADATA_PROBE_TIMEOUT,
            well_known_path: None,
        }
    }
}

impl DiscoveryOptions {
    /// Replaces the probes tried, in order
    #[must_use]
    pub fn with_probes(mut self, probes: impl IntoIterator<Item = Probe>) -> Self {
        self.probes = probes.into_iter().collect();
        self
    }

    /// Sets how long the metadata server is given to answer
    #[must_use]
    pub fn with_metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = timeout;
        self
    }

    /// Looks for the well-known credential file at `path`
    #[must_use]
    pub fn with_well_known_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.well_known_path = Some(path.into());
        self
    }

    /// The probes tried, in order
    pub fn probes(&self) -> &[Probe] {
        &self.probes
    }

    /// How long the metadata server is given to answer
    pub fn metadata_timeout(&self) -> Duration {
        self.metadata_timeout
    }

    fn well_known_path(&self, ctx: &Context) -> Option<PathBuf> {
        if let Some(path) = &self.well_known_path {
            return Some(path.clone());
        }
        if let Some(dir) = ctx.env().var(CLOUDSDK_CONFIG_VAR) {
            return Some(PathBuf::from(dir).join(WELL_KNOWN_FILE));
        }
        let config_dir = if cfg!(windows) {
            dirs::config_dir()
        } else {
            dirs::home_dir().map(|home| home.join(".config"))
        };
        config_dir.map(|dir| dir.join("gcloud").join(WELL_KNOWN_FILE))
    }
}

/// Discovers the ambient credential using the default transport, clock,
/// environment, and probes
///
/// # Errors
///
/// See [`discover_with`].
#[cfg(feature = "reqwest")]
#[cfg_attr(docsrs, doc(cfg(feature = "reqwest")))]
pub async fn discover() -> Result<Credential, Error> {
    discover_with(&Context::default(), &DiscoveryOptions::default()).await
}

/// Discovers the ambient credential
///
/// The quota project override is read once, before any probe runs, and
/// applied to whichever credential is found.
///
/// # Errors
///
/// * [`Error::Unavailable`] if no probe finds a credential
/// * any other error raised by a probe, such as [`Error::Configuration`] for
///   an override path that cannot be read or parsed
#[tracing::instrument(skip_all, fields(probes = ?options.probes))]
pub async fn discover_with(ctx: &Context, options: &DiscoveryOptions) -> Result<Credential, Error> {
    let quota_project = ctx.env().var(QUOTA_PROJECT_VAR);
    let mut misses = Vec::with_capacity(options.probes.len());

    for &probe in &options.probes {
        match run_probe(probe, ctx, options).await {
            Ok(credential) => {
                tracing::info!(%probe, credential = %credential.describe(), "discovered credential");
                return Ok(match quota_project {
                    Some(project) => credential.with_quota_project(project),
                    None => credential,
                });
            }
            Err(Error::Unavailable { message, .. }) => {
                tracing::debug!(%probe, %message, "probe found no credential");
                misses.push(format!("{probe}: {message}"));
            }
            Err(error) => {
                tracing::warn!(%probe, %error, "probe failed");
                return Err(error);
            }
        }
    }

    Err(Error::unavailable(format!(
        "no credential found ({})",
        misses.join("; ")
    )))
}

async fn run_probe(probe: Probe, ctx: &Context, options: &DiscoveryOptions) -> Result<Credential, Error> {
    match probe {
        Probe::OverridePath => {
            let path = ctx
                .env()
                .var(CREDENTIALS_VAR)
                .ok_or_else(|| Error::unavailable(format!("{CREDENTIALS_VAR} is not set")))?;
            let contents = tokio::fs::read(&path).await.map_err(|e| {
                Error::configuration_by(format!("unable to read {CREDENTIALS_VAR} file {path}"), e)
            })?;
            Credential::from_json(&contents, ctx)
        }
        Probe::WellKnownFile => {
            let path = options
                .well_known_path(ctx)
                .ok_or_else(|| Error::unavailable("no home directory to search"))?;
            let contents = match tokio::fs::read(&path).await {
                Ok(contents) => contents,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(Error::unavailable(format!("{} does not exist", path.display())))
                }
                Err(e) => {
                    return Err(Error::configuration_by(
                        format!("unable to read {}", path.display()),
                        e,
                    ))
                }
            };
            Credential::from_json(&contents, ctx)
        }
        Probe::ComputeMetadata => {
            let metadata = ComputeMetadata::from_env(ctx.env());
            metadata
                .probe(ctx.transport(), options.metadata_timeout)
                .await?;
            Ok(Credential::new(metadata, ctx.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, sync::Arc};

    use color_eyre::Result;
    use http::{HeaderName, HeaderValue, StatusCode};
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        test::{self, FakeTransport},
        transport::HttpResponse,
        CredentialKind, ErrorKind, MapEnv,
    };

    fn metadata_server() -> Arc<FakeTransport> {
        Arc::new(FakeTransport::new(|_| {
            Ok(HttpResponse::new(StatusCode::OK, "").with_header(
                HeaderName::from_static("metadata-flavor"),
                HeaderValue::from_static("Google"),
            ))
        }))
    }

    fn credential_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let json = test::service_account_json("https://oauth2.example/token");
        write!(file, "{json}").unwrap();
        file
    }

    fn options(dir: &tempfile::TempDir) -> DiscoveryOptions {
        DiscoveryOptions::default().with_well_known_path(dir.path().join(WELL_KNOWN_FILE))
    }

    #[tokio::test]
    async fn override_path_wins() -> Result<()> {
        let file = credential_file();
        let transport = metadata_server();
        let (ctx, _) = test::context(transport.clone());
        let ctx = ctx.with_env(
            MapEnv::default().with(CREDENTIALS_VAR, file.path().display().to_string()),
        );
        let dir = tempfile::tempdir()?;

        let credential = discover_with(&ctx, &options(&dir)).await?;
        assert!(matches!(credential.kind(), CredentialKind::ServiceAccount(_)));
        assert_eq!(transport.calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_override_path_does_not_fall_through() -> Result<()> {
        let transport = metadata_server();
        let (ctx, _) = test::context(transport.clone());
        let dir = tempfile::tempdir()?;
        let missing = dir.path().join("missing.json");
        let ctx = ctx.with_env(MapEnv::default().with(CREDENTIALS_VAR, missing.display().to_string()));

        let err = discover_with(&ctx, &options(&dir)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(transport.calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn unparseable_override_path_is_fatal() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, "not json")?;
        let transport = metadata_server();
        let (ctx, _) = test::context(transport.clone());
        let ctx = ctx.with_env(
            MapEnv::default().with(CREDENTIALS_VAR, file.path().display().to_string()),
        );
        let dir = tempfile::tempdir()?;

        let err = discover_with(&ctx, &options(&dir)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(transport.calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn well_known_file_is_used_when_present() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(WELL_KNOWN_FILE);
        std::fs::write(
            &path,
            serde_json::json!({
                "type": "authorized_user",
                "client_id": "cid",
                "client_secret": "secret",
                "refresh_token": "rt",
            })
            .to_string(),
        )?;
        let transport = metadata_server();
        let (ctx, _) = test::context(transport.clone());

        let credential = discover_with(&ctx, &options(&dir)).await?;
        assert!(matches!(credential.kind(), CredentialKind::UserAccount(_)));
        assert_eq!(transport.calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn cloudsdk_config_locates_well_known_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join(WELL_KNOWN_FILE),
            test::service_account_json("https://oauth2.example/token").to_string(),
        )?;
        let (ctx, _) = test::context(metadata_server());
        let ctx = ctx.with_env(
            MapEnv::default().with(CLOUDSDK_CONFIG_VAR, dir.path().display().to_string()),
        );

        let credential = discover_with(&ctx, &DiscoveryOptions::default()).await?;
        assert!(matches!(credential.kind(), CredentialKind::ServiceAccount(_)));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn falls_back_to_metadata_server() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let transport = metadata_server();
        let (ctx, _) = test::context(transport.clone());
        let ctx = ctx.with_env(MapEnv::default().with(QUOTA_PROJECT_VAR, "billing"));

        let credential = discover_with(&ctx, &options(&dir)).await?;
        assert!(matches!(credential.kind(), CredentialKind::ComputeMetadata(_)));
        assert_eq!(credential.quota_project(), Some("billing"));
        assert_eq!(transport.calls(), 1);
        assert!(logs_contain("probe found no credential"));
        assert!(logs_contain("discovered credential"));
        Ok(())
    }

    #[tokio::test]
    async fn nothing_found_is_unavailable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (ctx, _) = test::context(Arc::new(FakeTransport::unreachable()));

        let err = discover_with(&ctx, &options(&dir)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        let message = err.to_string();
        assert!(message.contains("override path"), "{message}");
        assert!(message.contains("compute metadata"), "{message}");
        Ok(())
    }

    #[tokio::test]
    async fn slow_metadata_server_is_unavailable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let transport = Arc::new(
            FakeTransport::new(|_| Ok(HttpResponse::new(StatusCode::OK, "")))
                .with_latency(Duration::from_secs(5)),
        );
        let (ctx, _) = test::context(transport);
        let options = options(&dir).with_metadata_timeout(Duration::from_millis(20));

        let err = discover_with(&ctx, &options).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        Ok(())
    }

    #[tokio::test]
    async fn probe_order_is_configurable() -> Result<()> {
        let file = credential_file();
        let transport = metadata_server();
        let (ctx, _) = test::context(transport.clone());
        let ctx = ctx.with_env(
            MapEnv::default().with(CREDENTIALS_VAR, file.path().display().to_string()),
        );
        let options = DiscoveryOptions::default()
            .with_probes([Probe::ComputeMetadata, Probe::OverridePath]);

        let credential = discover_with(&ctx, &options).await?;
        assert!(matches!(credential.kind(), CredentialKind::ComputeMetadata(_)));
        assert_eq!(options.probes(), &[Probe::ComputeMetadata, Probe::OverridePath]);
        Ok(())
    }
}
