//! Client configuration.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use iaptun_core::helper::DEFAULT_HELPER_COMMAND;
use iaptun_core::{
    CommandToken, Credential, EndpointResolver, HelperCommand, InstanceLocator,
    NetworkInterface, StaticToken, StreamConfig, TunnelDestination, TunnelManager,
};
use std::sync::Arc;
use std::time::Duration;

/// Port used when a target names none (remote desktop).
pub const DEFAULT_REMOTE_PORT: u16 = 3389;

/// A remote target given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub instance: InstanceLocator,
    pub port: u16,
}

impl Target {
    pub fn destination(&self) -> TunnelDestination {
        TunnelDestination::new(self.instance.clone(), self.port)
    }
}

impl std::str::FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Format: "project/zone/instance" or "project/zone/instance:port".
        // Domain-scoped projects ("example.com:project") carry a colon of
        // their own, so only a colon in the instance segment starts a port.
        let instance_start = s.rfind('/').map_or(0, |i| i + 1);
        match s[instance_start..].rfind(':') {
            Some(offset) => {
                let colon = instance_start + offset;
                let (instance, port_str) = (&s[..colon], &s[colon + 1..]);
                let port = port_str
                    .parse::<u16>()
                    .ok()
                    .filter(|port| *port != 0)
                    .ok_or_else(|| format!("Invalid port number: {}", port_str))?;
                Ok(Target {
                    instance: instance.parse()?,
                    port,
                })
            }
            None => Ok(Target {
                instance: s.parse()?,
                port: DEFAULT_REMOTE_PORT,
            }),
        }
    }
}

fn parse_target(s: &str) -> Result<Target, String> {
    s.parse()
}

fn parse_interface(s: &str) -> Result<NetworkInterface, String> {
    s.parse()
}

/// How tunnels are provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Tunneler {
    /// Speak the relay protocol directly.
    Direct,
    /// Run an external helper command per tunnel.
    Helper,
}

/// iaptun - Reach remote instances through an identity-aware relay.
#[derive(Parser, Debug, Clone)]
#[command(name = "iaptun")]
#[command(author, version, about, long_about = None)]
pub struct ClientConfig {
    /// Instances to tunnel to.
    /// Format: PROJECT/ZONE/INSTANCE or PROJECT/ZONE/INSTANCE:PORT (default port 3389)
    /// Examples: --target my-project/us-central1-a/vm-1 --target my-project/us-central1-a/db:5432
    #[arg(short = 'T', long = "target", required = true, value_parser = parse_target)]
    pub targets: Vec<Target>,

    /// Network interface of the instance
    #[arg(short, long, env = "IAPTUN_INTERFACE", default_value = "nic0", value_parser = parse_interface)]
    pub interface: NetworkInterface,

    /// Bearer token presented to the relay
    #[arg(short, long, env = "IAPTUN_TOKEN", conflicts_with = "token_command")]
    pub token: Option<String>,

    /// Command that prints a bearer token; re-run when the relay rejects it
    #[arg(
        long,
        env = "IAPTUN_TOKEN_COMMAND",
        default_value = "gcloud auth print-access-token"
    )]
    pub token_command: String,

    /// Relay base URL
    #[arg(long, env = "IAPTUN_RELAY_URL")]
    pub relay_url: Option<String>,

    /// Tunnel provider
    #[arg(long, env = "IAPTUN_TUNNELER", value_enum, default_value = "direct")]
    pub tunneler: Tunneler,

    /// Helper command template used with --tunneler helper
    #[arg(long, env = "IAPTUN_HELPER_COMMAND", default_value = DEFAULT_HELPER_COMMAND)]
    pub helper_command: String,

    /// Seconds to wait for a tunnel to open
    #[arg(long, env = "IAPTUN_TIMEOUT", default_value = "30")]
    pub timeout_secs: u64,

    /// Consecutive reconnect attempts before a stream fails (0 disables reconnecting)
    #[arg(long, env = "IAPTUN_MAX_RECONNECTS", default_value = "5")]
    pub max_reconnects: u32,

    /// Delay before the second reconnect attempt in milliseconds; doubles per attempt
    #[arg(long, env = "IAPTUN_RECONNECT_BACKOFF_MS", default_value = "200")]
    pub reconnect_backoff_ms: u64,

    /// Rolling window for reconnect limiting in seconds
    #[arg(long, env = "IAPTUN_RECONNECT_WINDOW", default_value = "60")]
    pub reconnect_window_secs: u64,

    /// Reconnects allowed per window
    #[arg(long, env = "IAPTUN_MAX_RECONNECTS_PER_WINDOW", default_value = "20")]
    pub max_reconnects_per_window: u32,

    /// Unacknowledged bytes kept for replay after a reconnect
    #[arg(long, env = "IAPTUN_MAX_UNACKED_BYTES", default_value = "8388608")]
    pub max_unacked_bytes: usize,

    /// Seconds between checks that reopen tunnels which went away (0 to disable)
    #[arg(long, env = "IAPTUN_WATCH_INTERVAL", default_value = "10")]
    pub watch_interval_secs: u64,

    /// Seconds to wait for in-flight connects on shutdown
    #[arg(long, env = "IAPTUN_SHUTDOWN_TIMEOUT", default_value = "5")]
    pub shutdown_timeout_secs: u64,

    /// Only check that the targets are reachable, then exit
    #[arg(long)]
    pub probe: bool,

    /// Enable debug logging
    #[arg(long, env = "IAPTUN_DEBUG")]
    pub debug: bool,
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn destinations(&self) -> Vec<TunnelDestination> {
        self.targets.iter().map(Target::destination).collect()
    }

    /// Relay stream limits.
    pub fn stream_config(&self) -> StreamConfig {
        let defaults = StreamConfig::default();
        StreamConfig {
            max_unacked_bytes: self.max_unacked_bytes,
            max_reconnect_attempts: self.max_reconnects,
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms),
            max_reconnect_backoff: defaults
                .max_reconnect_backoff
                .max(Duration::from_millis(self.reconnect_backoff_ms)),
            reconnect_window: Duration::from_secs(self.reconnect_window_secs),
            max_reconnects_per_window: self.max_reconnects_per_window,
            ..defaults
        }
    }

    /// The credential used for the relay.
    pub fn credential(&self) -> Result<Arc<dyn Credential>> {
        match &self.token {
            Some(token) => Ok(Arc::new(StaticToken::new(token.clone()))),
            None => {
                let command = CommandToken::from_command_line(&self.token_command)
                    .context("Invalid token command")?;
                Ok(Arc::new(command))
            }
        }
    }

    pub fn build_manager(&self) -> Result<TunnelManager> {
        match self.tunneler {
            Tunneler::Direct => {
                let mut resolver =
                    EndpointResolver::new(self.credential()?).with_interface(self.interface.clone());
                if let Some(url) = &self.relay_url {
                    resolver = resolver
                        .with_relay_url(url)
                        .with_context(|| format!("Invalid relay URL: {}", url))?;
                }
                Ok(TunnelManager::direct(resolver, self.stream_config()))
            }
            Tunneler::Helper => {
                let command = HelperCommand::new(&self.helper_command)
                    .context("Invalid helper command")?
                    .with_interface(self.interface.clone());
                Ok(TunnelManager::helper(command))
            }
        }
    }
}
