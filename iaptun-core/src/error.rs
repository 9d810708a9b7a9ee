//! Error types for relay streams, tunnels and tunnel managers.
//!
//! Every failure surfaced to callers is a [`TunnelError`] carrying an
//! [`ErrorKind`]. The kind tells the caller whether the failure was already
//! retried internally (`NetworkClosed`) or needs corrective action first
//! (`Unauthorized`).

use std::fmt;
use std::sync::Arc;

/// Error kinds surfaced by the tunnel client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad or expired credential, or no permission on the target.
    Unauthorized,
    /// Transport failure after in-protocol reconnection was exhausted.
    NetworkClosed,
    /// Operation on a stream or tunnel that is already closed.
    Closed,
    /// Malformed or out-of-order frame from the relay.
    ProtocolViolation,
    /// The target or relay request could not be resolved.
    ConnectionFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Unauthorized => write!(f, "unauthorized"),
            ErrorKind::NetworkClosed => write!(f, "network_closed"),
            ErrorKind::Closed => write!(f, "closed"),
            ErrorKind::ProtocolViolation => write!(f, "protocol_violation"),
            ErrorKind::ConnectionFailed => write!(f, "connection_failed"),
        }
    }
}

/// A tunnel error with kind and context.
///
/// Cloneable so that one failure can be handed to every task waiting on the
/// same stream or tunnel.
#[derive(Debug, Clone)]
pub struct TunnelError {
    /// The error kind.
    pub kind: ErrorKind,
    /// A human-readable message.
    pub message: String,
    /// Whether the failure was caused by a deadline expiring.
    pub timed_out: bool,
    /// The underlying cause, if any.
    pub cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
    /// Additional context as key-value pairs.
    pub context: Vec<(String, String)>,
}

impl TunnelError {
    /// Create a new tunnel error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timed_out: false,
            cause: None,
            context: Vec::new(),
        }
    }

    /// Add an underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Add context to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.push((key.into(), value.into()));
        self
    }

    /// Transient failures are the only ones retried inside a relay stream.
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::NetworkClosed
    }

    /// Whether this failure came from a timeout.
    pub fn is_timeout(&self) -> bool {
        self.timed_out
    }

    /// Whether the caller should re-authorize before retrying.
    pub fn needs_reauthorization(&self) -> bool {
        self.kind == ErrorKind::Unauthorized
    }
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;

        if !self.context.is_empty() {
            write!(f, " (")?;
            for (i, (k, v)) in self.context.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}={}", k, v)?;
            }
            write!(f, ")")?;
        }

        if let Some(ref cause) = self.cause {
            write!(f, ": {}", cause)?;
        }

        Ok(())
    }
}

impl std::error::Error for TunnelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// Convenience constructors
impl TunnelError {
    /// Create an authorization error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    /// Create a network-closed error.
    pub fn network_closed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkClosed, message)
    }

    /// Create a timeout error. Timeouts are network failures.
    pub fn timeout(message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::NetworkClosed, message);
        err.timed_out = true;
        err
    }

    /// Create a closed error.
    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Closed, message)
    }

    /// Create a protocol violation error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolViolation, message)
    }

    /// Create a connection-failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionFailed, message)
    }
}

impl From<crate::protocol::ProtocolError> for TunnelError {
    fn from(err: crate::protocol::ProtocolError) -> Self {
        TunnelError::protocol(err.to_string()).with_cause(err)
    }
}

/// Result type using TunnelError.
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Helper trait for adding context to errors.
pub trait ResultExt<T> {
    /// Wrap the error as a `TunnelError` of the given kind.
    fn with_kind(self, kind: ErrorKind) -> Result<T, TunnelError>;

    /// Wrap the error as a `TunnelError` of the given kind and attach context.
    fn with_context(
        self,
        kind: ErrorKind,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<T, TunnelError>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for Result<T, E> {
    fn with_kind(self, kind: ErrorKind) -> Result<T, TunnelError> {
        self.map_err(|e| TunnelError::new(kind, e.to_string()).with_cause(e))
    }

    fn with_context(
        self,
        kind: ErrorKind,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<T, TunnelError> {
        self.map_err(|e| {
            TunnelError::new(kind, e.to_string())
                .with_cause(e)
                .with_context(key, value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TunnelError::unauthorized("Relay rejected credential")
            .with_context("instance", "vm-1")
            .with_context("port", "3389");

        let display = err.to_string();
        assert!(display.contains("[unauthorized]"));
        assert!(display.contains("Relay rejected credential"));
        assert!(display.contains("instance=vm-1"));
        assert!(display.contains("port=3389"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(TunnelError::network_closed("test").is_retryable());
        assert!(TunnelError::timeout("test").is_retryable());
        assert!(!TunnelError::unauthorized("test").is_retryable());
        assert!(!TunnelError::protocol("test").is_retryable());
        assert!(!TunnelError::closed("test").is_retryable());
    }

    #[test]
    fn test_timeout_is_network_closed() {
        let err = TunnelError::timeout("handshake");
        assert_eq!(err.kind, ErrorKind::NetworkClosed);
        assert!(err.is_timeout());
        assert!(!TunnelError::network_closed("reset").is_timeout());
    }

    #[test]
    fn test_result_ext_keeps_cause() {
        let io: Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        let err = io
            .with_context(ErrorKind::NetworkClosed, "phase", "connecting")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NetworkClosed);
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("phase=connecting"));
    }
}
