use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use flow_guard::config::{FlowGuardConfig, LogFormat, LoggingConfig};
use flow_guard::ratelimit::AdmissionController;
use flow_guard::store;

#[derive(Debug, Parser)]
#[command(name = "flow-guard", version, about = "Distributed sliding-window admission control")]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, default_value = "flow-guard.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run admission checks for a path and print each decision
    Check {
        path: String,

        /// Give this caller its own budget under the matched rule
        #[arg(long)]
        caller: Option<String>,

        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Pause between checks, in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
    /// Load and validate the configuration
    Validate,
    /// Check that the store is reachable
    Ping,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config)?;
    init_tracing(&config.logging);

    info!("Starting Flow Guard");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        rules = config.rules.len(),
        mode = ?config.store.mode,
        shards = config.limiter.shard_count,
        "Configuration loaded"
    );

    match cli.command {
        Command::Validate => {
            config.rule_table()?;
            println!("configuration ok: {} rule(s)", config.rules.len());
        }
        Command::Ping => {
            let store = store::connect(&config.store).await?;
            store.ping().await?;
            println!("store ok");
        }
        Command::Check {
            path,
            caller,
            count,
            interval_ms,
        } => {
            let store = store::connect(&config.store).await?;
            let controller = AdmissionController::from_config(&config, store)?;

            tokio::select! {
                _ = run_checks(&controller, &path, caller.as_deref(), count, interval_ms) => {}
                _ = shutdown_signal() => {}
            }
        }
    }

    info!("Flow Guard stopped");
    Ok(())
}

/// Load configuration under a scoped stderr subscriber, so loading is logged before the
/// configured subscriber exists.
fn load_config(path: &Path) -> flow_guard::error::Result<FlowGuardConfig> {
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(log_filter("info"))
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::with_default(bootstrap, || FlowGuardConfig::from_file(path))
}

/// `RUST_LOG` takes precedence over `level`; an unparsable level falls back to `info`.
fn log_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global fmt subscriber.
fn init_tracing(logging: &LoggingConfig) {
    let filter = log_filter(&logging.level);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn run_checks(
    controller: &AdmissionController,
    path: &str,
    caller: Option<&str>,
    count: u32,
    interval_ms: u64,
) {
    for i in 1..=count {
        let decision = controller.is_allowed(path, caller).await;
        let verdict = if decision.allowed { "allow" } else { "deny" };
        println!(
            "{:>4} {:<5} reason={:?} rule={} count={} limit={}",
            i,
            verdict,
            decision.reason,
            decision.rule.as_deref().unwrap_or("-"),
            decision.count.map_or("-".to_string(), |c| c.to_string()),
            decision.limit.map_or("-".to_string(), |l| l.to_string()),
        );
        if let Some(err) = &decision.error {
            error!(error = %err, "Store failure during check");
        }

        if interval_ms > 0 && i < count {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
