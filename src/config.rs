use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub staging_dir: String,
    pub database_url: String,
    pub remote: RemoteConfig,
    pub pin: PinConfig,
}

/// Where finished assets are shipped to.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub batch_token: String,
    pub timeout: Duration,
}

/// Pin worker scheduling knobs.
#[derive(Debug, Clone)]
pub struct PinConfig {
    pub sweep_interval: Duration,
    pub retry_backoff: Duration,
    /// 0 disables the cap.
    pub max_attempts: u32,
    pub concurrency: usize,
    pub queue_capacity: usize,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(600),
            retry_backoff: Duration::from_secs(60),
            max_attempts: 0,
            concurrency: 1,
            queue_capacity: 1024,
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked upload gateway with deferred remote pinning")]
pub struct Args {
    /// Host to bind to (overrides GATEWAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides GATEWAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where chunks are staged (overrides GATEWAY_STAGING_DIR)
    #[arg(long)]
    pub staging_dir: Option<String>,

    /// Database URL (overrides GATEWAY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Remote store base URL (overrides GATEWAY_REMOTE_URL)
    #[arg(long)]
    pub remote_url: Option<String>,

    /// Batch/voucher token sent with every upload (overrides GATEWAY_BATCH_TOKEN)
    #[arg(long)]
    pub batch_token: Option<String>,

    /// Seconds between synthetic sweep signals (overrides GATEWAY_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("GATEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("GATEWAY_PORT", 3000u16)?;
        let env_staging =
            env::var("GATEWAY_STAGING_DIR").unwrap_or_else(|_| "./data/staging".into());
        let env_db = env::var("GATEWAY_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/gateway.db".into());
        let env_remote =
            env::var("GATEWAY_REMOTE_URL").unwrap_or_else(|_| "http://127.0.0.1:1633".into());
        let env_token = env::var("GATEWAY_BATCH_TOKEN").unwrap_or_default();
        let env_interval = env_or("GATEWAY_SWEEP_INTERVAL_SECS", 600u64)?;

        let pin = PinConfig {
            sweep_interval: Duration::from_secs(args.sweep_interval_secs.unwrap_or(env_interval)),
            retry_backoff: Duration::from_secs(env_or("GATEWAY_RETRY_BACKOFF_SECS", 60u64)?),
            max_attempts: env_or("GATEWAY_MAX_PIN_ATTEMPTS", 0u32)?,
            concurrency: env_or("GATEWAY_PIN_CONCURRENCY", 1usize)?.max(1),
            queue_capacity: env_or("GATEWAY_SIGNAL_QUEUE_CAPACITY", 1024usize)?.max(1),
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            staging_dir: args.staging_dir.unwrap_or(env_staging),
            database_url: args.database_url.unwrap_or(env_db),
            remote: RemoteConfig {
                base_url: args.remote_url.unwrap_or(env_remote),
                batch_token: args.batch_token.unwrap_or(env_token),
                timeout: Duration::from_secs(env_or("GATEWAY_REMOTE_TIMEOUT_SECS", 300u64)?),
            },
            pin,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read and parse an env var, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
