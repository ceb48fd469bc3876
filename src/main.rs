#![forbid(unsafe_code)]

//! `recipe-agent`: host agent binary.
//!
//! Loads configuration, starts the execution thread, and keeps a session
//! with the control plane open until SIGINT or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use recipe_agent::agent::Agent;
use recipe_agent::config::GlobalConfig;
use recipe_agent::executor::AbortMode;
use recipe_agent::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "recipe-agent", about = "Recipe execution agent", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "/etc/recipe-agent/agent.toml")]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Log at debug level unless RUST_LOG is set.
    #[arg(long, short, conflicts_with = "quiet")]
    verbose: bool,

    /// Log errors only unless RUST_LOG is set.
    #[arg(long, short)]
    quiet: bool,

    /// What to do with the running recipe on shutdown.
    #[arg(long, value_enum, default_value_t = AbortMode::AfterStep)]
    halt: AbortMode,
}

impl Cli {
    fn default_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            "info"
        }
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format, args.default_level())?;
    info!("recipe-agent bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = GlobalConfig::load_from_path(&args.config)?;
    info!(config = %args.config.display(), "configuration loaded");

    let agent = Arc::new(Agent::start(config)?);

    let session_loop = {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move { agent.run().await })
    };

    shutdown_signal().await;
    info!(mode = ?args.halt, "shutdown signal received");

    let halting = {
        let agent = Arc::clone(&agent);
        let mode = args.halt;
        tokio::spawn(async move { agent.shutdown(mode).await })
    };

    tokio::select! {
        joined = halting => {
            if let Err(err) = joined {
                error!(%err, "shutdown task failed");
            }
        }
        () = shutdown_signal() => {
            warn!("second signal received, stopping now");
            agent.shutdown(AbortMode::Now).await;
        }
    }

    if let Err(err) = session_loop.await {
        error!(%err, "session loop task failed");
    }
    info!("recipe-agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat, default_level: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = fmt().with_env_filter(env_filter).with_thread_names(true);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
