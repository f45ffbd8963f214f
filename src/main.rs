use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use streamprobe::config::Config;
use streamprobe::output::DatasetWriter;
use streamprobe::peer::EchoPeer;
use streamprobe::runner::Runner;

/// Delivery reliability and latency benchmark for high-rate message streams.
#[derive(Parser)]
#[command(name = "streamprobe", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error). Overrides
    /// the config file's log_level.
    #[arg(long)]
    log_level: Option<String>,

    /// Directory the CSV datasets are written to. Overrides output.dir.
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the benchmark (default).
    Run,
    /// Reflect udp/uds traffic back to a running benchmark.
    Echo,
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via env at build time.
mod version {
    /// Release version string.
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("streamprobe {}", version::full());
        return Ok(());
    }

    // Config is required for both run and echo.
    let config_path = cli
        .config
        .as_ref()
        .context("--config is required (use --help for usage)")?;

    let mut cfg = Config::load(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    if let Some(dir) = &cli.output {
        cfg.output.dir = dir.clone();
    }

    // Initialize tracing.
    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting streamprobe",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Some(Command::Echo) => rt.block_on(echo(cfg)),
        _ => rt.block_on(run(cfg)),
    }
}

/// Cancel `cancel` on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to register SIGTERM handler");
                        let _ = ctrl_c.await;
                        tracing::info!("received SIGINT, shutting down");
                        cancel.cancel();
                        return;
                    }
                };

            tokio::select! {
                _ = ctrl_c => {
                    tracing::info!("received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            tracing::info!("received SIGINT, shutting down");
        }

        cancel.cancel();
    });
}

async fn run(cfg: Config) -> Result<()> {
    let writer = DatasetWriter::new(&cfg.output.dir);

    let runner = Runner::new(cfg)?;
    spawn_signal_handler(runner.cancel_token());

    let outcome = runner.run().await?;

    writer
        .write_all(&outcome.report, &outcome.resource_trace)
        .context("writing datasets")?;

    // Datasets are written even when the emitter was halted.
    if let Some(e) = outcome.emit_error {
        return Err(e).context("run halted by transport error");
    }

    tracing::info!("streamprobe finished");

    Ok(())
}

async fn echo(cfg: Config) -> Result<()> {
    let peer = EchoPeer::open(&cfg.transport).context("opening echo peer")?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let stats = tokio::task::spawn_blocking(move || peer.run(&cancel))
        .await
        .context("echo thread panicked")?;

    tracing::info!(forwarded = stats.forwarded, "echo peer finished");

    Ok(())
}
