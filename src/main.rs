//! tunwarden - CLI entry point

// Use mimalloc as global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tunwarden::config::LogFormat;
use tunwarden::{Config, Supervisor, VERSION};

#[derive(Parser, Debug)]
#[command(name = "tunwarden")]
#[command(author = "Tsang")]
#[command(version = VERSION)]
#[command(about = "Self-healing VPN client orchestrator")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (overrides config)
    #[arg(long = "log-level")]
    log_level: Option<String>,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .thread_name("tunwarden-worker")
        .build()?;

    runtime.block_on(async_main())
}

fn init_logging(level: &str, format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(format!("tunwarden={}", level).parse()?);
    let (text, json) = match format {
        LogFormat::Text => (Some(tracing_subscriber::fmt::layer()), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };

    tracing_subscriber::registry().with(filter).with(text).with(json).init();
    Ok(())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logging settings come from the config, so load it first and report failures afterwards
    let loaded = Config::load_async(&args.config).await;
    let level = args
        .log_level
        .clone()
        .or_else(|| loaded.as_ref().ok().map(|c| c.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let format = loaded.as_ref().map(|c| c.log_format).unwrap_or_default();
    init_logging(&level, format)?;

    info!("tunwarden v{}", VERSION);
    info!("Loading configuration from: {}", args.config.display());

    let config = match loaded {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if args.test {
        info!("Configuration test passed");
        return Ok(());
    }

    let supervisor = match Supervisor::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to initialize: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = supervisor.run().await {
        error!("Supervisor error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
