//! Core of the iaptun relay tunnel client.
//!
//! This crate speaks the relay's framing protocol over WebSocket, keeps relay
//! streams alive across network failures, exposes them as local TCP ports and
//! tracks those tunnels per destination.

pub mod auth;
mod cmdline;
pub mod endpoint;
pub mod error;
pub mod helper;
pub mod manager;
pub mod policy;
pub mod protocol;
mod retransmit;
pub mod registry;
pub mod stream;
pub mod tunnel;

#[cfg(test)]
mod testing;

pub use auth::{CommandToken, Credential, StaticToken};
pub use endpoint::{EndpointResolver, InstanceLocator, NetworkInterface, TunnelDestination};
pub use error::{ErrorKind, TunnelError, TunnelResult};
pub use helper::HelperCommand;
pub use manager::{TunnelInfo, TunnelManager};
pub use policy::StreamConfig;
pub use stream::{RelayConnector, RelayStream, StreamPhase};
pub use tunnel::{Tunnel, TunnelStatus};
