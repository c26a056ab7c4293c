use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use bucketeer::config::{BucketeerConfig, LogFormat, LoggingConfig, StoreBackend};
use bucketeer::store::{BucketStore, InMemoryStore, RedisStore};
use bucketeer::RateLimiter;

/// Token bucket rate limiter with minimum spacing between actions.
#[derive(Debug, Parser)]
#[command(name = "bucketeer", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "BUCKETEER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Decide whether actions for an identifier are permitted
    Decide {
        /// Bucket identifier; empty for the global bucket
        #[arg(default_value = "")]
        identifier: String,

        /// Number of consecutive decisions to make
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
    /// Print the stored bucket state for an identifier
    Inspect {
        #[arg(default_value = "")]
        identifier: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = BucketeerConfig::load(cli.config.as_deref())?;

    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Bucketeer");
    match &cli.config {
        Some(path) => info!(path = %path.display(), "Loaded configuration"),
        None => info!("No configuration file, using defaults and environment"),
    }

    let store = connect_store(&config).await?;
    let mut limiter = RateLimiter::new(config.policy()?, store);
    if let Some(namespace) = &config.limit.namespace {
        limiter = limiter.with_namespace(namespace.clone());
    }

    info!(
        namespace = %limiter.namespace(),
        capacity = limiter.policy().capacity(),
        window = ?limiter.policy().window(),
        min_difference_ms = limiter.policy().min_difference_ms(),
        "Rate limiter initialized"
    );

    match cli.command {
        Command::Decide { identifier, count } => {
            for _ in 0..count {
                let decision = limiter.decide(&identifier).await?;
                println!("{}", serde_json::to_string(&decision)?);
            }
        }
        Command::Inspect { identifier } => {
            let state = limiter.inspect(&identifier).await?;
            println!("{}", serde_json::to_string(&state)?);
        }
    }

    Ok(())
}

/// Initialize tracing, preferring `RUST_LOG` over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Pretty => builder.with_thread_ids(true).init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Open the configured bucket state store.
async fn connect_store(config: &BucketeerConfig) -> anyhow::Result<Arc<dyn BucketStore>> {
    let store: Arc<dyn BucketStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(InMemoryStore::new()),
        StoreBackend::Redis => {
            info!(url = %config.store.url, "Connecting to Redis");
            let redis = RedisStore::connect(&config.store.url)
                .await?
                .with_max_cas_attempts(config.store.max_cas_attempts);
            Arc::new(redis)
        }
    };
    Ok(store)
}
