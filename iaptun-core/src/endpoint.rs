//! Target references and relay endpoint resolution.
//!
//! An [`EndpointResolver`] turns a [`TunnelDestination`] into a
//! [`RelayEndpoint`]: the relay URLs for connecting and reconnecting plus the
//! headers carrying the bearer token. Requests are built on every attempt so
//! that a refreshed token is always the one presented.

use crate::auth::Credential;
use crate::error::{ErrorKind, ResultExt, TunnelError, TunnelResult};
use crate::protocol::SUBPROTOCOL;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{
    HeaderValue, AUTHORIZATION, ORIGIN, SEC_WEBSOCKET_PROTOCOL, USER_AGENT,
};
use url::Url;

/// Default relay service URL.
pub const DEFAULT_RELAY_URL: &str = "wss://tunnel.cloudproxy.app/v4";

/// Origin presented to the relay.
pub const RELAY_ORIGIN: &str = "bot:iap-tunneler";

const USER_AGENT_VALUE: &str = concat!("iaptun/", env!("CARGO_PKG_VERSION"));

/// Identifies a VM instance: project, zone and instance name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceLocator {
    pub project: String,
    pub zone: String,
    pub name: String,
}

impl InstanceLocator {
    pub fn new(
        project: impl Into<String>,
        zone: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
            name: name.into(),
        }
    }

    /// Check that all parts are well-formed identifiers.
    ///
    /// Well-formed but nonexistent names pass; the relay rejects those.
    pub fn validate(&self) -> TunnelResult<()> {
        for (field, value) in [
            ("project", &self.project),
            ("zone", &self.zone),
            ("instance", &self.name),
        ] {
            let valid = !value.is_empty()
                && value.len() <= 255
                && value.chars().all(|c| {
                    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '.' | ':')
                });
            if !valid {
                return Err(TunnelError::connection_failed(format!(
                    "Invalid {} name '{}'",
                    field, value
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for InstanceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.zone, self.name)
    }
}

impl FromStr for InstanceLocator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Format: "project/zone/instance"
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [project, zone, name] => Ok(InstanceLocator::new(*project, *zone, *name)),
            _ => Err(format!(
                "Invalid instance '{}', expected project/zone/instance",
                s
            )),
        }
    }
}

/// A remote TCP endpoint: an instance and a port on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelDestination {
    pub instance: InstanceLocator,
    pub port: u16,
}

impl TunnelDestination {
    pub fn new(instance: InstanceLocator, port: u16) -> Self {
        Self { instance, port }
    }
}

impl fmt::Display for TunnelDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.instance, self.port)
    }
}

/// Which network interface of the instance to reach.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum NetworkInterface {
    /// The primary interface, `nic0`.
    #[default]
    Default,
    /// A named interface such as `nic1`.
    Named(String),
}

impl NetworkInterface {
    pub fn as_str(&self) -> &str {
        match self {
            NetworkInterface::Default => "nic0",
            NetworkInterface::Named(name) => name,
        }
    }
}

impl FromStr for NetworkInterface {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "default" | "nic0" => Ok(NetworkInterface::Default),
            name if name.chars().all(|c| c.is_ascii_alphanumeric()) => {
                Ok(NetworkInterface::Named(name.to_string()))
            }
            other => Err(format!("Invalid network interface '{}'", other)),
        }
    }
}

impl fmt::Display for NetworkInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps destinations to relay endpoints.
#[derive(Clone)]
pub struct EndpointResolver {
    credential: Arc<dyn Credential>,
    relay_url: Url,
    interface: NetworkInterface,
}

impl EndpointResolver {
    /// Create a resolver for the default relay and interface.
    pub fn new(credential: Arc<dyn Credential>) -> Self {
        Self {
            credential,
            relay_url: Url::parse(DEFAULT_RELAY_URL).expect("default relay URL is valid"),
            interface: NetworkInterface::Default,
        }
    }

    /// Use a different relay base URL.
    pub fn with_relay_url(mut self, relay_url: &str) -> TunnelResult<Self> {
        let url = Url::parse(relay_url).with_context(
            ErrorKind::ConnectionFailed,
            "relay_url",
            relay_url,
        )?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TunnelError::connection_failed(format!(
                "Relay URL must use ws:// or wss://, got '{}'",
                relay_url
            )));
        }
        self.relay_url = url;
        Ok(self)
    }

    /// Target a specific network interface.
    pub fn with_interface(mut self, interface: NetworkInterface) -> Self {
        self.interface = interface;
        self
    }

    /// The credential presented on every request.
    pub fn credential(&self) -> &Arc<dyn Credential> {
        &self.credential
    }

    /// Resolve a destination to a relay endpoint.
    pub fn resolve(&self, destination: &TunnelDestination) -> TunnelResult<RelayEndpoint> {
        destination.instance.validate()?;
        if destination.port == 0 {
            return Err(TunnelError::connection_failed("Port 0 is not a valid destination port"));
        }

        Ok(RelayEndpoint {
            destination: destination.clone(),
            interface: self.interface.clone(),
            relay_url: self.relay_url.clone(),
            credential: self.credential.clone(),
        })
    }
}

/// A resolved relay target for one destination.
#[derive(Clone)]
pub struct RelayEndpoint {
    destination: TunnelDestination,
    interface: NetworkInterface,
    relay_url: Url,
    credential: Arc<dyn Credential>,
}

impl fmt::Debug for RelayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayEndpoint")
            .field("destination", &self.destination)
            .field("interface", &self.interface)
            .field("relay_url", &self.relay_url.as_str())
            .finish()
    }
}

impl RelayEndpoint {
    pub fn destination(&self) -> &TunnelDestination {
        &self.destination
    }

    fn url_for(&self, path: &str, params: &[(&str, String)]) -> Url {
        let mut url = self.relay_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(path);
        }
        url.query_pairs_mut()
            .clear()
            .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())));
        url
    }

    /// URL for the initial connect.
    pub fn connect_url(&self) -> Url {
        let instance = &self.destination.instance;
        self.url_for(
            "connect",
            &[
                ("project", instance.project.clone()),
                ("zone", instance.zone.clone()),
                ("instance", instance.name.clone()),
                ("interface", self.interface.as_str().to_string()),
                ("port", self.destination.port.to_string()),
                ("newWebsocket", "true".to_string()),
            ],
        )
    }

    /// URL for resuming a session, acknowledging `ack` received bytes.
    pub fn reconnect_url(&self, sid: &str, ack: u64) -> Url {
        self.url_for(
            "reconnect",
            &[
                ("sid", sid.to_string()),
                ("ack", ack.to_string()),
                ("zone", self.destination.instance.zone.clone()),
                ("newWebsocket", "true".to_string()),
            ],
        )
    }

    /// Build the handshake request for the initial connect.
    pub async fn connect_request(&self) -> TunnelResult<Request> {
        let token = self.credential.access_token().await?;
        build_request(&self.connect_url(), &token)
    }

    /// Build the handshake request for a reconnect.
    pub async fn reconnect_request(&self, sid: &str, ack: u64) -> TunnelResult<Request> {
        let token = self.credential.access_token().await?;
        build_request(&self.reconnect_url(sid, ack), &token)
    }
}

fn build_request(url: &Url, token: &str) -> TunnelResult<Request> {
    let mut request = url
        .as_str()
        .into_client_request()
        .with_kind(ErrorKind::ConnectionFailed)?;

    let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| TunnelError::unauthorized("Access token contains invalid characters"))?;

    let headers = request.headers_mut();
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(ORIGIN, HeaderValue::from_static(RELAY_ORIGIN));
    headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

    Ok(request)
}
