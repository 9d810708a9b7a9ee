//! Credentials presented to the relay.
//!
//! Token acquisition is external to the tunnel client. A [`Credential`]
//! hands out the current bearer token and can be asked to re-authorize after
//! the relay rejected it.

use crate::cmdline::split_command_line;
use crate::error::{ErrorKind, ResultExt, TunnelError, TunnelResult};
use futures_util::future::BoxFuture;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Source of bearer tokens.
pub trait Credential: Send + Sync {
    /// Get the current access token.
    fn access_token(&self) -> BoxFuture<'_, TunnelResult<String>>;

    /// Re-authorize so that the next `access_token` returns a fresh token.
    fn refresh(&self) -> BoxFuture<'_, TunnelResult<()>>;
}

/// A fixed token supplied on the command line or through the environment.
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticToken").field("token", &"<redacted>").finish()
    }
}

impl Credential for StaticToken {
    fn access_token(&self) -> BoxFuture<'_, TunnelResult<String>> {
        Box::pin(async move { Ok(self.token.clone()) })
    }

    fn refresh(&self) -> BoxFuture<'_, TunnelResult<()>> {
        // Nothing to refresh; a rejected static token stays rejected.
        Box::pin(async { Ok(()) })
    }
}

/// A token printed by an external command, e.g.
/// `gcloud auth print-access-token`.
///
/// The token is fetched on first use and re-fetched on every refresh.
pub struct CommandToken {
    program: String,
    args: Vec<String>,
    cached: RwLock<Option<String>>,
}

impl CommandToken {
    /// Create from a command line; quotes group words containing spaces.
    pub fn from_command_line(command_line: &str) -> TunnelResult<Self> {
        let mut words = split_command_line(command_line)?.into_iter();
        let program = words
            .next()
            .ok_or_else(|| TunnelError::connection_failed("Empty token command"))?;
        Ok(Self {
            program,
            args: words.collect(),
            cached: RwLock::new(None),
        })
    }

    async fn fetch(&self) -> TunnelResult<String> {
        debug!("Fetching access token from `{}`", self.program);

        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(ErrorKind::Unauthorized, "command", self.program.clone())?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TunnelError::unauthorized(format!(
                "Token command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(TunnelError::unauthorized("Token command printed no token"));
        }
        Ok(token)
    }
}

impl std::fmt::Debug for CommandToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandToken")
            .field("program", &self.program)
            .field("args", &self.args)
            .finish()
    }
}

impl Credential for CommandToken {
    fn access_token(&self) -> BoxFuture<'_, TunnelResult<String>> {
        Box::pin(async move {
            if let Some(token) = self.cached.read().await.as_ref() {
                return Ok(token.clone());
            }

            let mut cached = self.cached.write().await;
            if let Some(token) = cached.as_ref() {
                return Ok(token.clone());
            }
            let token = self.fetch().await?;
            *cached = Some(token.clone());
            Ok(token)
        })
    }

    fn refresh(&self) -> BoxFuture<'_, TunnelResult<()>> {
        Box::pin(async move {
            let token = self.fetch().await?;
            *self.cached.write().await = Some(token);
            info!("Re-authorized using `{}`", self.program);
            Ok(())
        })
    }
}
