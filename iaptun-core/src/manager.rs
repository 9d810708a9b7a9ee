//! Process-wide tunnel management.
//!
//! A [`TunnelManager`] hands out local ports for destinations, creating
//! tunnels on demand. Two implementations share one contract: `Direct`
//! speaks the relay protocol itself, `Helper` delegates to an external
//! helper process.

use crate::auth::Credential;
use crate::endpoint::{EndpointResolver, TunnelDestination};
use crate::error::{TunnelError, TunnelResult};
use crate::helper::{HelperCommand, HelperTunnel};
use crate::policy::StreamConfig;
use crate::registry::{Registry, RegistryStats, TunnelHandle};
use crate::stream::RelayConnector;
use crate::tunnel::{Tunnel, TunnelStatus};
use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// An active tunnel as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub destination: TunnelDestination,
    pub local_port: u16,
}

impl TunnelHandle for Tunnel {
    fn local_port(&self) -> u16 {
        Tunnel::local_port(self)
    }

    fn is_alive(&self) -> bool {
        Tunnel::is_alive(self)
    }

    fn status(&self) -> TunnelStatus {
        Tunnel::status(self)
    }

    fn close(&self) {
        Tunnel::close(self)
    }
}

impl TunnelHandle for HelperTunnel {
    fn local_port(&self) -> u16 {
        HelperTunnel::local_port(self)
    }

    fn is_alive(&self) -> bool {
        HelperTunnel::is_alive(self)
    }

    fn status(&self) -> TunnelStatus {
        HelperTunnel::status(self)
    }

    fn close(&self) {
        HelperTunnel::close(self)
    }
}

/// Run `attempt`; if the relay rejected the credential, refresh it once and
/// run `attempt` again.
///
/// Both attempts and the refresh share one `timeout`. Each attempt is given
/// the time left.
async fn with_reauthorization<T, F, Fut>(
    credential: &Arc<dyn Credential>,
    destination: &TunnelDestination,
    timeout: Duration,
    mut attempt: F,
) -> TunnelResult<T>
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = TunnelResult<T>>,
{
    let deadline = Instant::now() + timeout;
    match attempt(timeout).await {
        Err(err) if err.needs_reauthorization() => {
            warn!(
                "Relay rejected credential for {}, re-authorizing: {}",
                destination, err
            );
            let expired = || {
                TunnelError::timeout(format!("Re-authorization did not finish within {:?}", timeout))
                    .with_context("destination", destination.to_string())
            };
            tokio::time::timeout_at(deadline, credential.refresh())
                .await
                .map_err(|_| expired())??;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(expired());
            }
            attempt(remaining).await
        }
        other => other,
    }
}

/// Tunnels that speak the relay protocol directly.
pub struct DirectTunnels {
    resolver: EndpointResolver,
    config: StreamConfig,
    registry: Registry<Tunnel>,
}

impl DirectTunnels {
    pub fn new(resolver: EndpointResolver, config: StreamConfig) -> Self {
        Self {
            resolver,
            config,
            registry: Registry::new(),
        }
    }

    fn connector(&self, destination: &TunnelDestination) -> TunnelResult<RelayConnector> {
        let endpoint = self.resolver.resolve(destination)?;
        Ok(RelayConnector::new(endpoint, self.config.clone()))
    }

    async fn connect(&self, destination: &TunnelDestination, timeout: Duration) -> TunnelResult<u16> {
        let connector = self.connector(destination)?;
        let credential = self.resolver.credential().clone();
        let target = destination.clone();

        let tunnel = self
            .registry
            .get_or_create(destination, move || -> BoxFuture<'static, TunnelResult<Tunnel>> {
                Box::pin(async move {
                    with_reauthorization(&credential, &target, timeout, |remaining| {
                        Tunnel::open(connector.clone(), remaining)
                    })
                    .await
                })
            })
            .await?;
        Ok(tunnel.local_port())
    }

    async fn test_connection(
        &self,
        destination: &TunnelDestination,
        timeout: Duration,
    ) -> TunnelResult<()> {
        let connector = self.connector(destination)?;
        with_reauthorization(self.resolver.credential(), destination, timeout, |remaining| {
            connector.test_connection(remaining)
        })
        .await
    }
}

/// Tunnels served by helper processes.
pub struct HelperTunnels {
    command: HelperCommand,
    registry: Registry<HelperTunnel>,
}

impl HelperTunnels {
    pub fn new(command: HelperCommand) -> Self {
        Self {
            command,
            registry: Registry::new(),
        }
    }

    async fn connect(&self, destination: &TunnelDestination, timeout: Duration) -> TunnelResult<u16> {
        let command = self.command.clone();
        let target = destination.clone();

        let tunnel = self
            .registry
            .get_or_create(destination, move || -> BoxFuture<'static, TunnelResult<HelperTunnel>> {
                Box::pin(async move { HelperTunnel::launch(&command, &target, timeout).await })
            })
            .await?;
        Ok(tunnel.local_port())
    }

    async fn test_connection(
        &self,
        destination: &TunnelDestination,
        timeout: Duration,
    ) -> TunnelResult<()> {
        let tunnel = HelperTunnel::launch(&self.command, destination, timeout).await?;
        tunnel.close();
        Ok(())
    }
}

/// Creates, tracks and closes tunnels.
pub enum TunnelManager {
    Direct(DirectTunnels),
    Helper(HelperTunnels),
}

impl TunnelManager {
    pub fn direct(resolver: EndpointResolver, config: StreamConfig) -> Self {
        TunnelManager::Direct(DirectTunnels::new(resolver, config))
    }

    pub fn helper(command: HelperCommand) -> Self {
        TunnelManager::Helper(HelperTunnels::new(command))
    }

    /// Local port of the tunnel to `destination`, creating the tunnel if
    /// there is no live one.
    ///
    /// Concurrent calls for the same destination share one creation.
    pub async fn connect(
        &self,
        destination: &TunnelDestination,
        timeout: Duration,
    ) -> TunnelResult<u16> {
        match self {
            TunnelManager::Direct(direct) => direct.connect(destination, timeout).await,
            TunnelManager::Helper(helper) => helper.connect(destination, timeout).await,
        }
    }

    /// Whether a live tunnel to `destination` exists.
    pub fn is_connected(&self, destination: &TunnelDestination) -> bool {
        match self {
            TunnelManager::Direct(direct) => direct.registry.is_live(destination),
            TunnelManager::Helper(helper) => helper.registry.is_live(destination),
        }
    }

    /// Status of the most recent tunnel to `destination`, if one was created.
    ///
    /// A tunnel that went away reports `Failed` with the cause until it is
    /// replaced by the next `connect`.
    pub fn status(&self, destination: &TunnelDestination) -> Option<TunnelStatus> {
        match self {
            TunnelManager::Direct(direct) => direct.registry.latest(destination).map(|t| t.status()),
            TunnelManager::Helper(helper) => helper.registry.latest(destination).map(|t| t.status()),
        }
    }

    /// Close every tunnel. Safe to call any number of times.
    pub fn close_tunnels(&self) {
        let closed = match self {
            TunnelManager::Direct(direct) => direct.registry.close_all(),
            TunnelManager::Helper(helper) => helper.registry.close_all(),
        };
        if closed > 0 {
            info!("Closed {} tunnel(s)", closed);
        }
    }

    /// Active tunnels, ordered by destination.
    pub fn tunnels(&self) -> Vec<TunnelInfo> {
        let mut tunnels: Vec<TunnelInfo> = match self {
            TunnelManager::Direct(direct) => info_of(direct.registry.snapshot()),
            TunnelManager::Helper(helper) => info_of(helper.registry.snapshot()),
        };
        tunnels.sort_by_key(|t| t.destination.to_string());
        tunnels
    }

    /// Check that `destination` is reachable without registering a tunnel.
    pub async fn test_connection(
        &self,
        destination: &TunnelDestination,
        timeout: Duration,
    ) -> TunnelResult<()> {
        match self {
            TunnelManager::Direct(direct) => direct.test_connection(destination, timeout).await,
            TunnelManager::Helper(helper) => helper.test_connection(destination, timeout).await,
        }
    }

    pub fn stats(&self) -> RegistryStats {
        match self {
            TunnelManager::Direct(direct) => direct.registry.stats(),
            TunnelManager::Helper(helper) => helper.registry.stats(),
        }
    }
}

fn info_of<T: TunnelHandle>(snapshot: Vec<(TunnelDestination, Arc<T>)>) -> Vec<TunnelInfo> {
    snapshot
        .into_iter()
        .map(|(destination, tunnel)| TunnelInfo {
            destination,
            local_port: tunnel.local_port(),
        })
        .collect()
}
