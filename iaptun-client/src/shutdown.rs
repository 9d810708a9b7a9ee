//! Shutdown handling: stop on Ctrl+C or SIGTERM, close tunnels and wait for
//! tunnel creations that are still in flight.

use iaptun_core::TunnelManager;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Shutdown signal that can be shared across tasks.
#[derive(Clone)]
pub struct ShutdownSignal {
    is_shutting_down: Arc<AtomicBool>,
    notify: broadcast::Sender<()>,
    /// Tunnel creations in flight.
    active_connects: Arc<AtomicUsize>,
    timeout: Duration,
}

impl ShutdownSignal {
    pub fn new(timeout_secs: u64) -> Self {
        let (notify, _) = broadcast::channel(1);
        Self {
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            notify,
            active_connects: Arc::new(AtomicUsize::new(0)),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    pub fn initiate_shutdown(&self) {
        if !self.is_shutting_down.swap(true, Ordering::SeqCst) {
            let _ = self.notify.send(());
            info!("Shutdown initiated");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }

    /// Resolves once shutdown has been initiated.
    pub async fn cancelled(&self) {
        let mut rx = self.subscribe();
        if self.is_shutting_down() {
            return;
        }
        let _ = rx.recv().await;
    }

    /// Track a tunnel creation. Returns `None` once shutting down.
    pub fn register_connect(&self) -> Option<ConnectGuard> {
        if self.is_shutting_down() {
            debug!("Rejecting new connect during shutdown");
            return None;
        }
        self.active_connects.fetch_add(1, Ordering::SeqCst);
        Some(ConnectGuard {
            counter: self.active_connects.clone(),
        })
    }

    pub fn active_connect_count(&self) -> usize {
        self.active_connects.load(Ordering::SeqCst)
    }

    /// Wait for in-flight creations with timeout.
    pub async fn wait_for_drain(&self) -> bool {
        let drain_future = async {
            loop {
                let count = self.active_connect_count();
                if count == 0 {
                    return true;
                }
                debug!("Waiting for {} connects to finish", count);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };

        match timeout(self.timeout, drain_future).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Shutdown timeout reached with {} connects still in flight",
                    self.active_connect_count()
                );
                false
            }
        }
    }
}

/// Decrements the in-flight counter when dropped.
pub struct ConnectGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Wait for Ctrl+C or SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, closing tunnels"),
        _ = terminate => info!("Received SIGTERM, closing tunnels"),
    }
}

/// Close every tunnel and wait for creations still in flight.
///
/// Tunnels whose creation finishes during the wait are closed as well.
pub async fn close_all(manager: &TunnelManager, signal: &ShutdownSignal) -> bool {
    signal.initiate_shutdown();
    manager.close_tunnels();
    let drained = signal.wait_for_drain().await;
    manager.close_tunnels();
    drained
}

#[cfg(test)]
mod tests {
    use super::*;
    use iaptun_core::HelperCommand;

    #[tokio::test]
    async fn test_shutdown_signal() {
        let signal = ShutdownSignal::new(5);
        assert!(!signal.is_shutting_down());

        let guard = signal.register_connect();
        assert!(guard.is_some());
        assert_eq!(signal.active_connect_count(), 1);

        signal.initiate_shutdown();
        assert!(signal.is_shutting_down());
        assert!(signal.register_connect().is_none());

        drop(guard);
        assert_eq!(signal.active_connect_count(), 0);
        assert!(signal.wait_for_drain().await);
    }

    #[tokio::test]
    async fn test_cancelled_after_shutdown() {
        let signal = ShutdownSignal::new(5);
        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.cancelled().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.initiate_shutdown();
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();

        // Already shut down: returns immediately.
        timeout(Duration::from_secs(1), signal.cancelled()).await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_times_out() {
        let signal = ShutdownSignal::new(0);
        let _guard = signal.register_connect();
        assert!(!signal.wait_for_drain().await);
    }

    #[tokio::test]
    async fn test_close_all_is_idempotent() {
        let manager = TunnelManager::helper(HelperCommand::default());
        let signal = ShutdownSignal::new(1);
        assert!(close_all(&manager, &signal).await);
        assert!(close_all(&manager, &signal).await);
        assert!(manager.tunnels().is_empty());
    }
}
