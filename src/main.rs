//! sandtrap: an SSH-style honeypot that binds every attacker session to a
//! disposable, resource-limited Docker sandbox and records the whole
//! session as an asciicast transcript.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

mod commands;
mod config;
mod sandbox;
mod server;
mod session;
mod templates;

use config::{Config, LogFormat, LoggingConfig};

#[derive(Parser)]
#[command(name = "sandtrap")]
#[command(
    author,
    version,
    about = "Honeypot that traps every session in a disposable Docker sandbox"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "SANDTRAP_CONFIG",
        default_value = config::CONFIG_FILE
    )]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the honeypot and serve until interrupted
    Serve,

    /// Write a default configuration and sandbox Dockerfile
    Init {
        /// Force overwrite existing files
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the configuration and check Docker
    Check {
        /// Skip the Docker connectivity and image checks
        #[arg(long)]
        offline: bool,
    },

    /// Replay a recorded session transcript
    Replay {
        /// Transcript file (.cast)
        file: PathBuf,

        /// Playback speed multiplier
        #[arg(short, long, default_value = "1.0")]
        speed: f64,

        /// Cap pauses between output at this many seconds
        #[arg(long)]
        max_idle: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => {
            let config = Config::load(&cli.config)?;
            let _guard = init_logging(&config.logging, cli.verbose)?;
            commands::serve::run(config).await?;
        }
        Commands::Check { offline } => {
            let config = Config::load(&cli.config)?;
            let _guard = init_logging(&config.logging, cli.verbose)?;
            commands::check::run(&cli.config, &config, offline).await?;
        }
        Commands::Init { force } => {
            let _guard = init_logging(&LoggingConfig::default(), cli.verbose)?;
            commands::init::run(&cli.config, force)?;
        }
        Commands::Replay {
            file,
            speed,
            max_idle,
        } => {
            let _guard = init_logging(&LoggingConfig::default(), cli.verbose)?;
            commands::replay::run(&file, speed, max_idle).await?;
        }
    }

    Ok(())
}

/// Install the global subscriber. Console logs go to stderr so command
/// output on stdout stays clean. The returned guard flushes the file sink
/// on drop and must live until exit.
fn init_logging(config: &LoggingConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
    let level = if verbose { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::try_new(format!("sandtrap={level}"))
        .with_context(|| format!("Invalid log level: {level}"))?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let console = fmt::layer().with_writer(std::io::stderr);
    layers.push(match config.format {
        LogFormat::Text => console.boxed(),
        LogFormat::Json => console.json().boxed(),
    });

    let guard = match &config.output_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "sandtrap.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .json()
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .init();

    Ok(guard)
}
