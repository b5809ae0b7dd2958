//! Marshal: run scheduler master.
//!
//! Serves two ports:
//! - control: submit/pause/resume/delete runs, read and write the stores
//! - notify: Server-Sent Events streams replicating every published topic

use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use miette::Result;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marshal_master::{
    DEFAULT_HISTORY_CAPACITY, Master, MasterConfig, command_executor, noop_executor,
};
use marshal_web::{AppState, create_control_router, create_notify_router};

#[derive(Parser)]
#[command(name = "marshal")]
#[command(about = "Run scheduler master with live state replication", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "MARSHAL_BIND", default_value = "::1")]
    bind: IpAddr,

    /// Port for control requests
    #[arg(long, env = "MARSHAL_PORT_CONTROL", default_value = "8888")]
    port_control: u16,

    /// Port for notification streams
    #[arg(long, env = "MARSHAL_PORT_NOTIFY", default_value = "8887")]
    port_notify: u16,

    /// Device database file
    #[arg(long, env = "MARSHAL_DEVICE_DB", default_value = "ddb.json")]
    device_db: PathBuf,

    /// Parameter database file
    #[arg(long, env = "MARSHAL_PARAMETER_DB", default_value = "pdb.json")]
    parameter_db: PathBuf,

    /// Number of parameter writes kept in history
    #[arg(long, env = "MARSHAL_HISTORY_CAPACITY", default_value_t = DEFAULT_HISTORY_CAPACITY)]
    history_capacity: usize,

    /// Command executing run phases, invoked as `<cmd> <phase>`
    #[arg(long, env = "MARSHAL_WORKER_CMD")]
    worker_cmd: Option<String>,

    /// Longest idle sleep of the scheduler in seconds
    #[arg(long, env = "MARSHAL_MAX_SLEEP_SECS", default_value = "60")]
    max_sleep_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "marshal=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = MasterConfig {
        device_db: cli.device_db,
        parameter_db: cli.parameter_db,
        history_capacity: cli.history_capacity,
        max_sleep: Duration::from_secs(cli.max_sleep_secs.max(1)),
    };

    let executor = match cli.worker_cmd {
        Some(cmd) => {
            info!(worker = %cmd, "run phases execute through worker command");
            command_executor(cmd)
        }
        None => {
            warn!("no worker command configured, run phases complete immediately");
            noop_executor()
        }
    };

    let (master, handle) =
        Master::open(&config, executor).map_err(|e| miette::miette!("{}", e))?;
    let master_task = master.spawn();

    let state = Arc::new(AppState::new(handle.clone()));
    let control = create_control_router(Arc::clone(&state));
    let notify = create_notify_router(state);

    let control_addr = SocketAddr::new(cli.bind, cli.port_control);
    let notify_addr = SocketAddr::new(cli.bind, cli.port_notify);
    let control_listener = TcpListener::bind(control_addr)
        .await
        .map_err(|e| miette::miette!("failed to bind {}: {}", control_addr, e))?;
    let notify_listener = TcpListener::bind(notify_addr)
        .await
        .map_err(|e| miette::miette!("failed to bind {}: {}", notify_addr, e))?;
    info!("control listening on http://{}", control_addr);
    info!("notify listening on http://{}", notify_addr);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal = async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        // Stopping the master ends every notify stream
        handle.shutdown().await;
        let _ = shutdown_tx.send(true);
    };

    let (control_result, notify_result, ()) = tokio::join!(
        axum::serve(control_listener, control)
            .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()))
            .into_future(),
        axum::serve(notify_listener, notify)
            .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
            .into_future(),
        signal,
    );
    control_result.map_err(|e| miette::miette!("control server: {}", e))?;
    notify_result.map_err(|e| miette::miette!("notify server: {}", e))?;

    master_task
        .await
        .map_err(|e| miette::miette!("master task: {}", e))?;
    info!("marshal shut down gracefully");
    Ok(())
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
