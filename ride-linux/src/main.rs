// GroupRide Linux: discovery, datagram transport and intent console around ride-core.

mod config;
mod console;
mod discovery;
mod node;
mod transport;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use ride_core::{CoreEvent, RideCore};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ride-linux", version, about = "GroupRide daemon")]
struct Args {
    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Display name (overrides config and GROUPRIDE_DISPLAY_NAME)
    #[arg(long)]
    name: Option<String>,
    /// Config file instead of the default search path
    #[arg(long)]
    config: Option<PathBuf>,
    /// Run without the stdin console (until Ctrl+C)
    #[arg(long)]
    headless: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut cfg = match &args.config {
        Some(path) => config::load_path(path)?,
        None => config::load(),
    };
    if let Some(name) = args.name {
        cfg.display_name = name;
    }

    let core = RideCore::new(&cfg.display_name, cfg.to_core_config());
    let me = core.peer_id();
    tracing::info!(peer = %me, name = %cfg.display_name, "ride-linux v{} starting", env!("CARGO_PKG_VERSION"));

    let book = transport::AddressBook::default();
    let (inputs, inbox) = node::inbox();
    let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cfg.transport_port));
    let channel = transport::bind(bind, book.clone(), inputs.clone())
        .await
        .with_context(|| format!("binding transport on {bind}"))?;
    let (handle, node_task) = node::RideNode::spawn(core, channel, cfg.tick(), inputs.clone(), inbox);

    let display_name = cfg.display_name.clone();
    let (disc_port, transport_port) = (cfg.discovery_port, cfg.transport_port);
    tokio::spawn(async move {
        if let Err(e) = discovery::run_discovery(
            me,
            display_name,
            disc_port,
            transport_port,
            book,
            inputs,
        )
        .await
        {
            tracing::error!(error = %e, "discovery stopped");
        }
    });

    tokio::spawn(print_alerts(handle.subscribe()));

    if args.headless {
        shutdown_signal().await?;
    } else {
        tokio::select! {
            res = console::run_console(handle.clone()) => res.context("console")?,
            res = shutdown_signal() => res?,
        }
    }

    tracing::info!("shutting down");
    if let Err(e) = handle.leave_group().await {
        tracing::debug!(error = %e, "leave on shutdown failed");
    }
    drop(handle);
    node_task.abort();
    Ok(())
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    // RUST_LOG wins over -v.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Surface SOS and forced ride changes on the console.
async fn print_alerts(mut events: broadcast::Receiver<CoreEvent>) {
    loop {
        match events.recv().await {
            Ok(CoreEvent::Sos { from, note }) => {
                println!("!! SOS from {} {}", from.short(), note.unwrap_or_default());
            }
            Ok(CoreEvent::HostLost) => println!("!! host lost"),
            Ok(CoreEvent::RemovedFromGroup) => println!("!! removed from group"),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!(skipped = n, "alert printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
