use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use siem_event_processor::config::LoggingConfig;
use siem_event_processor::{Pipeline, PipelineConfig};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ConfigFormat {
    Yaml,
    Toml,
}

#[derive(Parser)]
#[command(name = "siem-event-processor")]
#[command(about = "OCSF event ingestion gateway and processor chain", version)]
struct Cli {
    /// Path to a YAML, TOML or JSON configuration file
    #[arg(short, long, env = "SIEM_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long, value_enum)]
    print_config: Option<ConfigFormat>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("siem_event_processor={},tower_http=info", logging.level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = PipelineConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;

    if let Some(format) = cli.print_config {
        let rendered = match format {
            ConfigFormat::Yaml => serde_yaml::to_string(&config)?,
            ConfigFormat::Toml => toml::to_string_pretty(&config)?,
        };
        print!("{}", rendered);
        return Ok(());
    }
    if cli.check {
        println!("Configuration OK ({} processors)", config.processors.len());
        return Ok(());
    }

    init_tracing(&config.logging);
    info!("Starting {} v{}", siem_event_processor::NAME, siem_event_processor::VERSION);
    info!("Server will listen on: {}", config.server.bind_address);

    let pipeline = Pipeline::build(config).context("Failed to build pipeline")?;
    pipeline
        .run(shutdown_signal())
        .await
        .context("Pipeline terminated with an error")?;

    Ok(())
}
