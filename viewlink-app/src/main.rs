use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use viewlink_app::{console, ConsoleRenderer};
use viewlink_engine::{load_engine_config, CommandEngine, EngineConfig, WsConnector};

const DEFAULT_CONFIG_PATH: &str = "viewlink.yaml";

fn init_logging() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn load_config(path: &str) -> anyhow::Result<EngineConfig> {
    if Path::new(path).exists() {
        return load_engine_config(path).with_context(|| format!("Failed to load {}", path));
    }
    tracing::info!("No config at {}, using defaults", path);
    let mut config = EngineConfig::default();
    config.apply_env();
    config.validate().context("Invalid default configuration")?;
    Ok(config)
}

fn print_usage() {
    println!("Usage: viewlink [CONFIG]");
    println!();
    println!("  CONFIG   YAML engine configuration (default: {})", DEFAULT_CONFIG_PATH);
    println!();
    println!("Environment:");
    println!("  VIEWLINK_ENDPOINT   override the server endpoint");
    println!("  RUST_LOG            log filter (default: info)");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().skip(1).any(|a| a == "-h" || a == "--help") {
        print_usage();
        return Ok(());
    }

    init_logging();

    let config_path = args.get(1).map(String::as_str).unwrap_or(DEFAULT_CONFIG_PATH);
    let config = load_config(config_path)?;

    println!("viewlink console, server {}", config.endpoint);

    let renderer = Arc::new(ConsoleRenderer::new());
    let engine = CommandEngine::start(config, Arc::new(WsConnector::new()), renderer)
        .context("Failed to start the command engine")?;

    let mut statuses = engine.subscribe_status();
    tokio::spawn(async move {
        loop {
            match statuses.recv().await {
                Ok(status) => println!("\n[connection {}]", status),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut reports = engine.subscribe_reports();
    tokio::spawn(async move {
        loop {
            match reports.recv().await {
                Ok(report) => {
                    if let Err(e) = &report.local {
                        println!("\n{} failed locally: {}", report.command.kind, e);
                    } else if !report.assumed_success() {
                        println!("\n{} rejected by the server", report.command.kind);
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Err(e) = engine.connect().await {
        println!("Could not connect ({}); commands run locally while reconnecting", e);
    }

    console::run(Arc::clone(&engine))
        .await
        .context("Console input failed")?;

    engine.shutdown();
    println!("Goodbye");
    Ok(())
}
