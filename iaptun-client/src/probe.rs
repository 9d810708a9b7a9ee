//! Reachability checks for targets and local tunnel ports.

use iaptun_core::{ErrorKind, TunnelDestination, TunnelError, TunnelManager};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Outcome of a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Reachable,
    /// The relay or helper rejected the credential.
    Denied,
    Unreachable,
}

impl std::fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeStatus::Reachable => write!(f, "reachable"),
            ProbeStatus::Denied => write!(f, "denied"),
            ProbeStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Result of probing one destination.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub destination: TunnelDestination,
    pub status: ProbeStatus,
    pub latency: Option<Duration>,
    pub error: Option<String>,
}

impl ProbeResult {
    fn from_outcome(
        destination: &TunnelDestination,
        outcome: Result<(), TunnelError>,
        elapsed: Duration,
    ) -> Self {
        match outcome {
            Ok(()) => ProbeResult {
                destination: destination.clone(),
                status: ProbeStatus::Reachable,
                latency: Some(elapsed),
                error: None,
            },
            Err(e) => {
                let status = if e.kind == ErrorKind::Unauthorized {
                    ProbeStatus::Denied
                } else {
                    ProbeStatus::Unreachable
                };
                ProbeResult {
                    destination: destination.clone(),
                    status,
                    latency: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.status == ProbeStatus::Reachable
    }
}

impl std::fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.latency, &self.error) {
            (Some(latency), _) => write!(
                f,
                "{} is {} (latency: {:?})",
                self.destination, self.status, latency
            ),
            (None, Some(err)) => write!(f, "{} is {}: {}", self.destination, self.status, err),
            (None, None) => write!(f, "{} is {}", self.destination, self.status),
        }
    }
}

/// Check that a destination can be reached without keeping a tunnel open.
pub async fn probe_destination(
    manager: &TunnelManager,
    destination: &TunnelDestination,
    deadline: Duration,
) -> ProbeResult {
    debug!("Probing {}", destination);
    let start = Instant::now();
    let outcome = manager.test_connection(destination, deadline).await;
    let result = ProbeResult::from_outcome(destination, outcome, start.elapsed());

    match result.status {
        ProbeStatus::Reachable => info!("{}", result),
        ProbeStatus::Denied | ProbeStatus::Unreachable => error!("{}", result),
    }
    result
}

/// Verify that a local tunnel port accepts connections.
pub async fn verify_local_port(port: u16, deadline: Duration) -> Result<Duration, String> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let start = Instant::now();

    match timeout(deadline, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => {
            let latency = start.elapsed();
            debug!("Local port {} accepted a connection ({:?})", port, latency);
            Ok(latency)
        }
        Ok(Err(e)) => {
            warn!("Local port {} is not reachable: {}", port, e);
            Err(format!("Connection failed: {}", e))
        }
        Err(_) => {
            warn!("Local port {} did not answer within {:?}", port, deadline);
            Err("Connection timeout".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iaptun_core::InstanceLocator;
    use tokio::net::TcpListener;

    fn destination() -> TunnelDestination {
        TunnelDestination::new(InstanceLocator::new("my-project", "zone-a", "vm-1"), 22)
    }

    #[test]
    fn test_probe_status_display() {
        assert_eq!(ProbeStatus::Reachable.to_string(), "reachable");
        assert_eq!(ProbeStatus::Denied.to_string(), "denied");
        assert_eq!(ProbeStatus::Unreachable.to_string(), "unreachable");
    }

    #[test]
    fn test_result_classification() {
        let ok = ProbeResult::from_outcome(&destination(), Ok(()), Duration::from_millis(7));
        assert!(ok.is_reachable());
        assert_eq!(ok.latency, Some(Duration::from_millis(7)));

        let denied = ProbeResult::from_outcome(
            &destination(),
            Err(TunnelError::unauthorized("permission denied")),
            Duration::ZERO,
        );
        assert_eq!(denied.status, ProbeStatus::Denied);
        assert!(denied.to_string().contains("permission denied"));

        let closed = ProbeResult::from_outcome(
            &destination(),
            Err(TunnelError::network_closed("connection lost")),
            Duration::ZERO,
        );
        assert_eq!(closed.status, ProbeStatus::Unreachable);
        assert!(closed.latency.is_none());
    }

    #[tokio::test]
    async fn test_verify_local_port() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(verify_local_port(port, Duration::from_secs(1)).await.is_ok());

        drop(listener);
        assert!(verify_local_port(port, Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_probe_malformed_destination() {
        let manager = TunnelManager::helper(iaptun_core::HelperCommand::default());
        let bad = TunnelDestination::new(InstanceLocator::new("Bad Project", "zone", "vm"), 22);
        let result = probe_destination(&manager, &bad, Duration::from_secs(1)).await;
        assert_eq!(result.status, ProbeStatus::Unreachable);
        assert!(manager.tunnels().is_empty());
    }
}
