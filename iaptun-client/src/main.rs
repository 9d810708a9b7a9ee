//! iaptun - Tunnel client.
//!
//! Opens local TCP ports that lead to remote instances through an
//! identity-aware relay.

mod config;
mod probe;
mod shutdown;

use anyhow::Result;
use clap::Parser;
use config::ClientConfig;
use iaptun_core::{TunnelDestination, TunnelManager, TunnelStatus};
use shutdown::ShutdownSignal;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse configuration
    let config = ClientConfig::parse();

    // Initialize logging
    let _ = FmtSubscriber::builder()
        .with_max_level(if config.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .init();

    info!("Starting iaptun v{}", env!("CARGO_PKG_VERSION"));
    info!("Tunneler: {:?}, interface: {}", config.tunneler, config.interface);

    let manager = Arc::new(config.build_manager()?);
    let destinations = config.destinations();

    if config.probe {
        return run_probe(&manager, &destinations, config.timeout()).await;
    }

    let signal = ShutdownSignal::new(config.shutdown_timeout_secs);
    tokio::spawn({
        let signal = signal.clone();
        async move {
            shutdown::wait_for_signal().await;
            signal.initiate_shutdown();
        }
    });

    let result = run_tunnels(&config, manager.clone(), &destinations, &signal).await;

    shutdown::close_all(&manager, &signal).await;
    let stats = manager.stats();
    info!(
        "Shutdown complete ({} tunnel(s) created, {} reused)",
        stats.created, stats.reused
    );
    result
}

async fn run_probe(
    manager: &TunnelManager,
    destinations: &[TunnelDestination],
    timeout: Duration,
) -> Result<()> {
    let mut failed = 0;
    for destination in destinations {
        let result = probe::probe_destination(manager, destination, timeout).await;
        println!("{}", result);
        if !result.is_reachable() {
            failed += 1;
        }
    }

    if failed > 0 {
        return Err(anyhow::anyhow!(
            "{} of {} target(s) not reachable",
            failed,
            destinations.len()
        ));
    }
    Ok(())
}

/// Open every tunnel, then keep them open until shutdown.
async fn run_tunnels(
    config: &ClientConfig,
    manager: Arc<TunnelManager>,
    destinations: &[TunnelDestination],
    signal: &ShutdownSignal,
) -> Result<()> {
    let opened = open_tunnels(&manager, destinations, config.timeout(), signal).await;
    if signal.is_shutting_down() {
        return Ok(());
    }
    if opened == 0 {
        return Err(anyhow::anyhow!("No tunnel could be opened"));
    }

    for tunnel in manager.tunnels() {
        match probe::verify_local_port(tunnel.local_port, Duration::from_secs(1)).await {
            Ok(_) => println!("{} -> localhost:{}", tunnel.destination, tunnel.local_port),
            Err(e) => warn!("Tunnel to {} is not accepting: {}", tunnel.destination, e),
        }
    }

    if config.watch_interval_secs == 0 {
        signal.cancelled().await;
        return Ok(());
    }

    let mut interval = tokio::time::interval(Duration::from_secs(config.watch_interval_secs));
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = signal.cancelled() => return Ok(()),
        }

        let dropped: Vec<TunnelDestination> = destinations
            .iter()
            .filter(|d| !manager.is_connected(d))
            .cloned()
            .collect();
        if dropped.is_empty() {
            debug!("All {} tunnel(s) alive", destinations.len());
            continue;
        }

        for destination in &dropped {
            match manager.status(destination) {
                Some(TunnelStatus::Failed(err)) => {
                    warn!("Tunnel to {} failed: {}; reopening", destination, err)
                }
                _ => warn!("Tunnel to {} went away, reopening", destination),
            }
        }
        open_tunnels(&manager, &dropped, config.timeout(), signal).await;
    }
}

/// Open tunnels concurrently. Returns how many succeeded.
///
/// Stops waiting once shutdown starts. Creations still in flight keep their
/// connect guards, so the shutdown drain waits for them.
async fn open_tunnels(
    manager: &Arc<TunnelManager>,
    destinations: &[TunnelDestination],
    timeout: Duration,
    signal: &ShutdownSignal,
) -> usize {
    let mut tasks = JoinSet::new();
    for destination in destinations {
        let Some(guard) = signal.register_connect() else {
            break;
        };
        let manager = manager.clone();
        let destination = destination.clone();
        tasks.spawn(async move {
            let _guard = guard;
            let result = manager.connect(&destination, timeout).await;
            (destination, result)
        });
    }

    let mut opened = 0;
    loop {
        let joined = tokio::select! {
            joined = tasks.join_next() => joined,
            _ = signal.cancelled() => {
                debug!("Shutdown with {} tunnel creation(s) in flight", tasks.len());
                tasks.detach_all();
                break;
            }
        };
        let Some(joined) = joined else {
            break;
        };
        match joined {
            Ok((destination, Ok(port))) => {
                info!("Tunnel to {} listening on port {}", destination, port);
                opened += 1;
            }
            Ok((destination, Err(e))) => {
                error!("Failed to open tunnel to {}: {}", destination, e);
            }
            Err(e) => error!("Connect task failed: {}", e),
        }
    }
    opened
}
