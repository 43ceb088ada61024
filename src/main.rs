// Admission Gate - Main Entry Point
//
// Operator CLI for the admission controller:
// - Probe admission for a principal
// - Release a ticket
// - Show effective configuration
// - Serve Prometheus metrics

use admission_gate::admission::{AdmissionController, AdmissionMode, AdmissionRequest, AdmissionTicket};
use admission_gate::config::Config;
use admission_gate::metrics_server;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// Admission Gate: distributed admission control
#[derive(Parser, Debug)]
#[command(name = "admission-gate")]
#[command(author = "Admission Gate Contributors")]
#[command(version)]
#[command(about = "Distributed admission control for LLM-backed services", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (defaults to the XDG config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check admission for a principal and print the result as JSON
    Check {
        /// Principal (user) identity
        #[arg(long)]
        principal: String,

        /// enforce or shadow (defaults to the configured mode)
        #[arg(long)]
        mode: Option<AdmissionMode>,

        /// Estimated tool calls for the request (negative counts as zero)
        #[arg(long, allow_negative_numbers = true)]
        tool_calls: Option<i64>,

        /// Release the ticket right after printing it
        #[arg(long)]
        release: bool,
    },
    /// Release a ticket previously printed by `check`
    Release {
        /// Ticket JSON
        #[arg(long)]
        ticket: String,
    },
    /// Print the effective configuration
    Config,
    /// Serve Prometheus metrics
    ServeMetrics {
        /// Port to listen on (defaults to the configured port)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    init_tracing(&config, args.verbose)?;

    info!("Admission gate v{} starting...", env!("CARGO_PKG_VERSION"));

    match args.command {
        Some(Commands::Check {
            principal,
            mode,
            tool_calls,
            release,
        }) => {
            let controller = AdmissionController::new(config.admission);
            let mut request = AdmissionRequest::new(principal);
            request.mode = mode;
            request.estimated_tool_calls = tool_calls;

            let result = controller.check_and_acquire(&request).await;
            println!("{}", serde_json::to_string_pretty(&result)?);

            if release {
                controller.release(result.ticket.as_ref()).await;
            }
        }
        Some(Commands::Release { ticket }) => {
            let ticket: AdmissionTicket =
                serde_json::from_str(&ticket).context("Failed to parse ticket JSON")?;
            let controller = AdmissionController::new(config.admission);
            controller.release(Some(&ticket)).await;
            println!("released {}", ticket.ticket_id);
        }
        Some(Commands::Config) => {
            let redacted = Config {
                admission: config.admission.redacted(),
                ..config
            };
            print!("{}", toml::to_string_pretty(&redacted)?);
        }
        Some(Commands::ServeMetrics { port }) => {
            metrics_server::start_metrics_server(port.unwrap_or(config.metrics.port)).await?;
        }
        None => {
            info!("No command specified. Use \"admission-gate --help\" for usage.");
        }
    }

    Ok(())
}

/// Initialize tracing from the logging configuration
fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        config.log_level()?
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    // Logs go to stderr so command output stays parseable
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }

    Ok(())
}
