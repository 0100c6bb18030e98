use std::{path::PathBuf, process::ExitCode, time::Duration};

use clap::Parser;
use credo::{discovery, Context, Credential, DiscoveryOptions, Probe, RefreshOptions};
use credo_clock::{Clock, DurationSecs, System};

#[derive(Debug, Parser)]
struct Opts {
    /// A credential file to load instead of discovering one
    #[arg(short, long, env = "CREDO_CREDENTIALS_FILE")]
    file: Option<PathBuf>,

    /// Scopes to request
    #[arg(short, long = "scope", env = "CREDO_SCOPES", value_delimiter = ',')]
    scopes: Vec<String>,

    /// Mint an ID token for this audience instead of an access token
    #[arg(short, long, env = "CREDO_AUDIENCE")]
    audience: Option<String>,

    /// Skip probing the metadata server during discovery
    #[arg(long)]
    no_metadata: bool,

    /// How long to wait for a refresh, in seconds
    #[arg(short, long, default_value_t = 30)]
    timeout: u64,

    /// Print the full token instead of a redacted form
    #[arg(long)]
    reveal: bool,
}

async fn load(opts: &Opts, ctx: &Context) -> Result<Credential, credo::Error> {
    let credential = match &opts.file {
        Some(path) => {
            let contents = tokio::fs::read(path).await.map_err(|e| {
                credo::Error::Configuration {
                    message: format!("unable to read {}", path.display()),
                    source: Some(std::sync::Arc::new(e)),
                }
            })?;
            Credential::from_json(&contents, ctx)?
        }
        None => {
            let mut options = DiscoveryOptions::default();
            if opts.no_metadata {
                options = options.with_probes([Probe::OverridePath, Probe::WellKnownFile]);
            }
            discovery::discover_with(ctx, &options).await?
        }
    };

    let credential = credential
        .with_scopes(opts.scopes.iter().cloned())
        .with_refresh_options(
            RefreshOptions::default().with_timeout(Duration::from_secs(opts.timeout)),
        );

    match &opts.audience {
        Some(audience) => credential.id_token(audience.clone()),
        None => Ok(credential),
    }
}

async fn run(opts: Opts) -> Result<(), credo::Error> {
    let ctx = Context::default();
    let credential = load(&opts, &ctx).await?;
    tracing::info!(credential = %credential.describe(), "loaded credential");

    let token = credential.ensure_valid().await?;
    let remaining = token
        .remaining_at(System.now())
        .map_or_else(|| "never".to_owned(), |r: DurationSecs| format!("in {r}"));

    println!("credential: {}", credential.describe());
    println!("kind:       {}", token.kind());
    if let Some(principal) = token.principal() {
        println!("principal:  {principal}");
    }
    println!("expires:    {remaining}");
    if opts.reveal {
        println!("token:      {:#}", token.value());
    } else {
        println!("token:      {}", token.value());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> color_eyre::Result<ExitCode> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opts = Opts::parse();

    match run(opts).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(error) => {
            tracing::error!(kind = %error.kind(), retryable = error.is_retryable(), "{error}");
            eprintln!("error: {error}");
            let code = u8::try_from(error.exit_code()).unwrap_or(1);
            Ok(ExitCode::from(code))
        }
    }
}
