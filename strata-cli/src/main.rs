//! Strata CLI

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use strata_config::{load_config, Config};
use strata_core::{handler_fn, Context, Error, Method};
use strata_middleware::Layer;
use strata_runtime::{init_tracing, Runtime, SignalHandler};

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Layered middleware pipeline with automatic error recovery", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Path to configuration file
        #[arg(short, long, default_value = "strata.yaml")]
        config: PathBuf,
    },

    /// Run one synthetic failing request through the pipeline and print the recovery outcome
    Simulate {
        /// Path to configuration file (defaults are used when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Comma-separated layers to compile
        #[arg(short, long, default_value = "global,group,route,controller", value_delimiter = ',')]
        layers: Vec<String>,

        /// Error message raised by the terminal handler
        #[arg(short, long)]
        error: String,

        /// Raise a typed error instead of a plain message
        #[arg(short, long, value_enum)]
        kind: Option<ErrorKind>,

        /// Emit logs while simulating
        #[arg(short, long)]
        verbose: bool,
    },

    /// Start the runtime maintenance loops and wait for a shutdown signal
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "strata.yaml", env = "STRATA_CONFIG")]
        config: PathBuf,
    },

    /// Show version information
    Version,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ErrorKind {
    Timeout,
    Network,
    Database,
    Validation,
    Authentication,
    RateLimit,
    Business,
    External,
    Panic,
}

impl ErrorKind {
    fn raise(self, message: String) -> Error {
        match self {
            ErrorKind::Timeout => Error::Timeout(message),
            ErrorKind::Network => Error::Network(message),
            ErrorKind::Database => Error::Database(message),
            ErrorKind::Validation => Error::Validation(message),
            ErrorKind::Authentication => Error::Authentication(message),
            ErrorKind::RateLimit => Error::RateLimited(message),
            ErrorKind::Business => Error::Business(message),
            ErrorKind::External => Error::External(message),
            ErrorKind::Panic => Error::Panic(message),
        }
    }
}

/// Untyped error, classified by its message alone
#[derive(Debug)]
struct SimulatedError(String);

impl fmt::Display for SimulatedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for SimulatedError {}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            init_tracing(&Default::default())?;

            tracing::info!("Validating configuration: {}", config.display());

            match load_config(&config) {
                Ok(cfg) => {
                    tracing::info!("✓ Configuration is valid");
                    tracing::info!("  Middleware: {}", cfg.middleware.len());
                    tracing::info!("  Strategies: {}", cfg.recovery.strategies.len());
                    tracing::info!("  Learned rules: {}", cfg.recovery.learned_rules.len());
                    tracing::info!("  Breaker boundaries: {}", cfg.circuit_breaker.boundaries.len());
                    Ok(())
                }
                Err(e) => {
                    tracing::error!("✗ Configuration validation failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Simulate {
            config,
            layers,
            error,
            kind,
            verbose,
        } => {
            let config = load_optional(config.as_deref())?;
            if verbose {
                init_tracing(&config.logging)?;
            }
            simulate(config, &layers, error, kind)
        }

        Commands::Run { config } => {
            let config = load_config(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            init_tracing(&config.logging)?;

            tracing::info!(
                middleware = config.middleware.len(),
                recovery = config.recovery.enabled,
                "Configuration loaded"
            );

            let runtime = Runtime::from_config(config)?;

            let shutdown_signal = runtime.shutdown_signal();
            tokio::spawn(async move {
                let handler = SignalHandler::new(shutdown_signal);
                handler.run().await;
            });

            runtime.run().await?;

            let stats = serde_json::to_string(&runtime.stats())?;
            tracing::info!(stats = %stats, "Final statistics");
            Ok(())
        }

        Commands::Version => {
            println!("Strata");
            println!("Version: {}", env!("CARGO_PKG_VERSION"));
            println!("Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
            Ok(())
        }
    }
}

fn load_optional(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_config(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn simulate(config: Config, layers: &[String], message: String, kind: Option<ErrorKind>) -> Result<()> {
    let mut layers = layers
        .iter()
        .map(|l| Layer::from_str(l.trim()))
        .collect::<strata_core::Result<Vec<_>>>()?;
    if !layers.contains(&Layer::Controller) {
        layers.push(Layer::Controller);
    }

    let runtime = Runtime::from_config(config)?;
    runtime.manager().use_handler(
        Layer::Controller,
        "simulated_endpoint",
        handler_fn(move |ctx: &mut Context| match kind {
            Some(kind) => ctx.push_error(kind.raise(message.clone())),
            None => ctx.push_error(SimulatedError(message.clone())),
        }),
        i32::MAX,
    )?;

    let chain = runtime.manager().get_compiled_chain(&layers)?;
    let mut ctx = Context::request(Method::GET, "/simulate");
    let results = runtime.handle(&mut ctx, &layers)?;

    let report = serde_json::json!({
        "chain_id": chain.id(),
        "chain": chain.handler_names(),
        "status": ctx.status().map(|s| s.as_u16()),
        "recovery": results.iter().map(|r| r.summary()).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
