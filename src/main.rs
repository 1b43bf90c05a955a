use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info};

use plugin_pipeline::bus::{InMemoryBus, MessageBus, NameResolver, Properties, StaticResolver};
use plugin_pipeline::commands;
use plugin_pipeline::config::{self, Config};
use plugin_pipeline::engine::Pipeline;
use plugin_pipeline::error::Result;
use plugin_pipeline::plugin::FactoryRegistry;

#[derive(Parser, Debug)]
#[command(name = "plugin-pipeline")]
#[command(about = "Message-driven pipeline of hot-reloadable transform plugins", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Also read control documents from stdin
    #[arg(long, global = true)]
    stdio: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the pipeline (default)
    Run,
    /// Check configuration and persisted descriptors
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("plugin_pipeline={log_level}")));
    if args.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            config::load_from_path(path).await.map_err(|e| {
                error!("Failed to load configuration from {}: {}", path.display(), e);
                e
            })?
        }
        None => {
            info!("Loading configuration from default locations");
            config::load_from_env_or_file().await.map_err(|e| {
                error!("Failed to load configuration: {}", e);
                e
            })?
        }
    };

    match args.command.unwrap_or(Command::Run) {
        Command::Check => commands::run_config_check(config).await,
        Command::Run => run(config, args.stdio).await,
    }
}

async fn run(config: Config, stdio: bool) -> Result<()> {
    info!("Starting plugin pipeline");

    let bus = Arc::new(InMemoryBus::new());
    let resolver: Arc<dyn NameResolver> = Arc::new(StaticResolver::new(
        config.destinations.clone(),
        config.strict_destinations,
    ));
    let pipeline = Arc::new(Pipeline::new(
        &config,
        bus.clone(),
        resolver.clone(),
        FactoryRegistry::with_builtins(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let engine = pipeline.clone();
    let mut engine_handle = tokio::spawn(async move { engine.run(shutdown_rx).await });

    let stdin_handle = if stdio {
        let control = resolver.resolve(&config.engine.control_destination)?;
        let bus = bus.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = feed_stdin(bus, control).await {
                error!("Control input error: {}", e);
            }
        }))
    } else {
        None
    };

    let finished = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutting down plugin pipeline");
            None
        }
        joined = &mut engine_handle => Some(joined),
    };
    match pipeline.snapshot_json() {
        Ok(state) => debug!("Pipeline state at shutdown:\n{}", state),
        Err(e) => error!("Failed to render pipeline state: {}", e),
    }
    let _ = shutdown_tx.send(());
    if let Some(handle) = stdin_handle {
        handle.abort();
    }

    let joined = match finished {
        Some(joined) => joined,
        None => match tokio::time::timeout(tokio::time::Duration::from_secs(30), engine_handle).await {
            Ok(joined) => joined,
            Err(_) => {
                error!("Shutdown timeout exceeded, forcing exit");
                std::process::exit(1);
            }
        },
    };
    let result = joined.unwrap_or_else(|e| {
        error!("Pipeline task failed: {}", e);
        Ok(())
    });

    info!(
        "Processed {} control message(s)\n{}",
        pipeline.message_count(),
        pipeline.render_metrics()
    );
    bus.close();
    result
}

/// Publish each control document read from stdin. A document ends at a line
/// ending in `</plugin>`.
async fn feed_stdin(bus: Arc<InMemoryBus>, control: plugin_pipeline::bus::Destination) -> Result<()> {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut document = String::new();
    while let Some(line) = lines.next_line().await? {
        document.push_str(&line);
        document.push('\n');
        if line.trim_end().ends_with("</plugin>") {
            bus.publish(&control, std::mem::take(&mut document), Properties::new())
                .await?;
        }
    }
    if !document.trim().is_empty() {
        tracing::warn!("Discarding incomplete control document at end of input");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
