//! Driver-side CLI for a quiesce bridge host.
//!
//! Every command connects to a running application process, so UI state is
//! only ever read or changed once the application has gone idle.
//!
//! # Usage
//!
//! ```bash
//! # Check the host is up
//! quiesce ping
//!
//! # Call a method on a root object (arguments are JSON, bare words are strings)
//! quiesce invoke app set_label "Signed in"
//! quiesce invoke app start_request 1500
//!
//! # Give the app at most 2s to settle before the call
//! quiesce invoke app get_label --timeout 2000
//!
//! # Wait for the app to go idle, or show what keeps it busy
//! quiesce wait-idle -o 10000
//! quiesce busy
//!
//! # Machine-readable output, other port
//! quiesce --format json --port 7400 busy
//! ```

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use quiesce_core::bridge::{BridgeClient, BridgeClientConfig, BridgeError, RemoteValue};
use quiesce_core::config::SyncConfig;
use quiesce_core::idling::BusyResource;
use quiesce_core::synchronizer::SyncError;
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Driver-side CLI for a quiesce bridge host.
#[derive(Parser)]
#[command(name = "quiesce")]
#[command(about = "Drive an application through its quiesce bridge, waiting for idle first")]
#[command(version)]
struct Cli {
    /// Bridge host address (defaults to the config file)
    #[arg(long)]
    host: Option<String>,

    /// Bridge host port (defaults to the config file)
    #[arg(short, long, env = "QUIESCE_PORT")]
    port: Option<u16>,

    /// Output format: text or json
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Check that the host answers
    Ping,

    /// Invoke a method on a root object
    Invoke {
        /// Root object name
        object: String,
        /// Method name
        method: String,
        /// Arguments as JSON values; anything that is not JSON is a string
        args: Vec<String>,
        /// Synchronization timeout in milliseconds
        #[arg(short = 'o', long, env = "QUIESCE_TIMEOUT")]
        timeout: Option<u64>,
    },

    /// Wait until the application is idle
    WaitIdle {
        /// Timeout in milliseconds
        #[arg(short = 'o', long, env = "QUIESCE_TIMEOUT")]
        timeout: Option<u64>,
    },

    /// List what keeps the application busy
    Busy,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

#[derive(Debug)]
enum CliError {
    Connection(String),
    ActionFailed(String),
    Protocol(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Connection(_) => ExitCode::from(2),
            CliError::ActionFailed(_) => ExitCode::from(1),
            CliError::Protocol(_) => ExitCode::from(3),
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Connection(msg) => write!(f, "Connection error: {}", msg),
            CliError::ActionFailed(msg) => write!(f, "Action failed: {}", msg),
            CliError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

fn map_bridge_error(err: BridgeError) -> CliError {
    match err {
        BridgeError::TransportUnavailable(_) | BridgeError::Io(_) => CliError::Connection(err.to_string()),
        BridgeError::Protocol(_) | BridgeError::BadRequest(_) => CliError::Protocol(err.to_string()),
        other => CliError::ActionFailed(other.to_string()),
    }
}

/// Effective config: file values overridden by flags.
fn effective_config(cli: &Cli) -> SyncConfig {
    let mut config = SyncConfig::load();
    if let Some(host) = &cli.host {
        config.bridge_host = host.clone();
    }
    if let Some(port) = cli.port {
        config.bridge_port = port;
    }
    config
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = effective_config(&cli);

    if let Command::Config = cli.command {
        let json = serde_json::to_string_pretty(&config).map_err(|e| CliError::Protocol(e.to_string()))?;
        println!("{json}");
        return Ok(());
    }

    debug!(addr = %config.bridge_addr(), "connecting to bridge host");
    let client = BridgeClient::connect(config.bridge_addr(), BridgeClientConfig::from(&config))
        .await
        .map_err(|e| CliError::Connection(format!("Failed to reach {}: {}", config.bridge_addr(), e)))?;

    match cli.command {
        Command::Ping => {
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::json!({ "ok": true })),
                OutputFormat::Text => println!("pong from {}", client.addr()),
            }
            Ok(())
        }
        Command::Invoke {
            object,
            method,
            args,
            timeout,
        } => {
            let proxy = client.root(&object).await.map_err(map_bridge_error)?;
            let args = args.iter().map(|raw| parse_arg(raw)).collect();
            let value = match timeout {
                Some(ms) => proxy.invoke_with_timeout(&method, args, Duration::from_millis(ms)).await,
                None => proxy.invoke(&method, args).await,
            }
            .map_err(map_bridge_error)?;
            print_value(&value, cli.format);
            Ok(())
        }
        Command::WaitIdle { timeout } => {
            match client.wait_for_idle(timeout.map(Duration::from_millis)).await {
                Ok(()) => {
                    match cli.format {
                        OutputFormat::Json => println!("{}", serde_json::json!({ "idle": true })),
                        OutputFormat::Text => println!("idle"),
                    }
                    Ok(())
                }
                Err(BridgeError::Synchronization(SyncError::SynchronizationTimeout { waited, busy })) => {
                    if cli.format == OutputFormat::Json {
                        println!("{}", serde_json::json!({ "idle": false, "busy": busy }));
                    } else {
                        print_busy(&busy);
                    }
                    Err(CliError::ActionFailed(format!(
                        "still busy after {}ms",
                        waited.as_millis()
                    )))
                }
                Err(e) => Err(map_bridge_error(e)),
            }
        }
        Command::Busy => {
            let busy = client.busy_resources().await.map_err(map_bridge_error)?;
            match cli.format {
                OutputFormat::Json => {
                    let json = serde_json::to_string(&busy).map_err(|e| CliError::Protocol(e.to_string()))?;
                    println!("{json}");
                }
                OutputFormat::Text if busy.is_empty() => println!("idle"),
                OutputFormat::Text => print_busy(&busy),
            }
            Ok(())
        }
        Command::Config => Ok(()),
    }
}

/// JSON if it parses, otherwise the raw text as a string.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_value(value: &RemoteValue, format: OutputFormat) {
    match (format, value) {
        (OutputFormat::Json, _) => println!("{}", value.to_json()),
        (OutputFormat::Text, RemoteValue::Null) => {}
        (OutputFormat::Text, RemoteValue::Data(Value::String(s))) => println!("{s}"),
        (OutputFormat::Text, RemoteValue::Data(other)) => println!("{other}"),
        (OutputFormat::Text, RemoteValue::Object(object)) => {
            println!("<{} {}>", object.class_name, object.id)
        }
    }
}

fn print_busy(busy: &[BusyResource]) {
    for resource in busy {
        println!("{}\t{}", resource.name, resource.kind);
    }
}
