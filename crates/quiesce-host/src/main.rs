use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

mod app;
use app::{DemoApp, Diagnostics};

use quiesce_core::bridge::{BridgeHost, Dispatch, ObjectTable};
use quiesce_core::config::{logs_dir, SyncConfig};
use quiesce_core::engine::SyncEngine;
use quiesce_core::idling::{CountingResource, TimedResource};

#[derive(Parser)]
#[command(name = "quiesce-host")]
#[command(about = "Demo application process serving distant objects over a quiesce bridge")]
struct Args {
    /// Port to listen on (defaults to the config file)
    #[arg(short, long, env = "QUIESCE_PORT")]
    port: Option<u16>,

    /// Address to bind (defaults to the config file)
    #[arg(long)]
    bind: Option<String>,

    /// Idle poll interval in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging: stderr plus a log file when the home directory is usable
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = logs_dir().ok().map(|dir| {
        tracing_subscriber::fmt::layer()
            .with_writer(tracing_appender::rolling::never(dir, "quiesce-host.log"))
            .with_ansi(false)
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    let mut config = SyncConfig::load();
    if let Some(port) = args.port {
        config.bridge_port = port;
    }
    if let Some(bind) = args.bind {
        config.bridge_host = bind;
    }
    if let Some(ms) = args.poll_interval_ms {
        config.poll_interval_ms = ms;
    }
    let addr = config.bridge_addr();

    info!(%addr, "Starting quiesce-host");

    let engine = SyncEngine::start(config)?;
    let network = Arc::new(CountingResource::new("network"));
    let animation = Arc::new(TimedResource::with_kind("animation", "animation"));
    engine.register_idling_resource(&network);
    engine.register_idling_resource(&animation);

    let table = Arc::new(ObjectTable::new());
    table.publish_root(
        "app",
        Arc::new(DemoApp::new(
            engine.ui(),
            engine.tracker().clone(),
            network.clone(),
            animation.clone(),
        )),
        Dispatch::UiThread,
    );
    table.publish_root(
        "diagnostics",
        Arc::new(Diagnostics::new(engine.synchronizer().app_state().clone())),
        Dispatch::Background,
    );

    let handle = BridgeHost::new(table.clone(), engine.synchronizer().clone())
        .bind(&addr)
        .await?;
    info!(addr = %handle.local_addr(), "Listening");

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
    }

    info!("Cleaning up");
    handle.stop().await;
    if !engine.is_idle() {
        warn!(busy = ?engine.currently_busy_resources(), "Shutting down while busy");
    }
    table.clear();
    engine.shutdown();
    info!("Host stopped");

    Ok(())
}
