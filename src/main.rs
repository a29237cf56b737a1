use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{StoreBackend, TurnstileConfig};
use turnstile::grpc::GrpcServer;
use turnstile::ratelimit::{
    validate_descriptors, BucketStore, DynamicConfiguration, DynamicConfigurationManager, For,
    InMemoryBucketStore, RateLimiters, RateLimitersOptions, RedisBucketStore, SystemClock,
};

/// How often expired buckets are dropped from the in-memory store.
const MEMORY_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about = "Leaky-bucket admission control service")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the admission gRPC server (default)
    Serve,
    /// Validate the configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting Turnstile Admission Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TurnstileConfig::load(cli.config.as_deref()).context("loading configuration")?;
    info!(
        grpc_addr = %config.server.grpc_addr,
        backend = ?config.store.backend,
        static_limits = config.rate_limiting.limits.len(),
        "Configuration loaded"
    );

    match cli.command.unwrap_or(Command::Serve) {
        Command::CheckConfig => check_config(&config).await,
        Command::Serve => serve(config).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Build the registry against a throwaway store so every descriptor and
/// override is checked without touching Redis.
async fn check_config(config: &TurnstileConfig) -> anyhow::Result<()> {
    let dynamic = load_dynamic_configuration(config).await?;
    let rate_limiters = RateLimiters::create_and_validate(
        &config.rate_limiting.limits,
        dynamic,
        Arc::new(InMemoryBucketStore::new()),
        RateLimitersOptions::default(),
    )
    .context("validating rate limiters")?;

    info!(limiters = rate_limiters.len(), "Configuration is valid");
    Ok(())
}

async fn serve(config: TurnstileConfig) -> anyhow::Result<()> {
    // Reject a bad static config before any network I/O.
    validate_descriptors(&For::ALL, &config.rate_limiting.limits)
        .context("validating rate limiters")?;
    let dynamic = load_dynamic_configuration(&config).await?;

    let store = build_store(&config).await?;
    let refresher = config.rate_limiting.dynamic_config_path.clone().map(|path| {
        dynamic.spawn_file_refresher(path, config.rate_limiting.dynamic_reload_interval)
    });

    let rate_limiters = RateLimiters::create_and_validate(
        &config.rate_limiting.limits,
        dynamic,
        store,
        RateLimitersOptions {
            clock: Arc::new(SystemClock),
            timeout: config.store.timeout,
        },
    )
    .context("validating rate limiters")?;
    info!(limiters = rate_limiters.len(), "Rate limiters initialized");

    let grpc_server = GrpcServer::new(config.server.grpc_addr, Arc::new(rate_limiters));

    info!("Starting gRPC server on {}", config.server.grpc_addr);

    grpc_server.serve_with_shutdown(shutdown_signal()).await?;

    if let Some(handle) = refresher {
        handle.abort();
    }

    info!("Turnstile Admission Service stopped");
    Ok(())
}

async fn build_store(config: &TurnstileConfig) -> anyhow::Result<Arc<dyn BucketStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory bucket store; limits are not shared between instances");
            let store = Arc::new(InMemoryBucketStore::new());
            spawn_memory_purge(store.clone());
            Ok(store)
        }
        StoreBackend::Redis if config.store.cluster => {
            let store = RedisBucketStore::connect_cluster(&config.store.urls)
                .await
                .context("connecting to Redis cluster")?;
            info!(nodes = config.store.urls.len(), "Connected to Redis cluster");
            Ok(Arc::new(store))
        }
        StoreBackend::Redis => {
            let url = config
                .store
                .urls
                .first()
                .context("store.urls must name at least one Redis URL")?;
            let store = RedisBucketStore::connect(url)
                .await
                .context("connecting to Redis")?;
            info!("Connected to Redis");
            Ok(Arc::new(store))
        }
    }
}

fn spawn_memory_purge(store: Arc<InMemoryBucketStore>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MEMORY_PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            store.purge_expired(Utc::now());
        }
    });
}

async fn load_dynamic_configuration(
    config: &TurnstileConfig,
) -> anyhow::Result<DynamicConfigurationManager> {
    let initial = match &config.rate_limiting.dynamic_config_path {
        Some(path) => DynamicConfiguration::load(path)
            .await
            .with_context(|| format!("loading dynamic configuration from {}", path.display()))?,
        None => DynamicConfiguration::default(),
    };
    Ok(DynamicConfigurationManager::new(initial))
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
