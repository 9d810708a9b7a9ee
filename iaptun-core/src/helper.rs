//! Tunnels provided by an external helper process.
//!
//! The helper (by default `gcloud compute start-iap-tunnel`) is started per
//! destination on a pre-selected free local port. The tunnel counts as open
//! once that port accepts connections and lives as long as the process.

use crate::cmdline::split_command_line;
use crate::endpoint::{NetworkInterface, TunnelDestination};
use crate::error::{ErrorKind, ResultExt, TunnelError, TunnelResult};
use crate::tunnel::TunnelStatus;
use std::net::Ipv4Addr;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default helper command line.
pub const DEFAULT_HELPER_COMMAND: &str = "gcloud compute start-iap-tunnel {instance} {port} \
     --local-host-port=localhost:{local_port} --zone={zone} --project={project} \
     --network-interface={interface}";

/// Stderr kept for error messages.
const STDERR_LIMIT: usize = 4096;

/// Phrases in helper output that indicate a credential or permission problem.
const AUTH_MARKERS: &[&str] = &[
    "permission denied",
    "permission_denied",
    "does not have permission",
    "not authorized",
    "unauthorized",
    "forbidden",
    "invalid credentials",
    "reauthentication",
    "refreshing your current auth tokens",
];

/// A helper command template.
///
/// Placeholders: `{project}`, `{zone}`, `{instance}`, `{port}`,
/// `{local_port}` and `{interface}`.
#[derive(Debug, Clone)]
pub struct HelperCommand {
    words: Vec<String>,
    interface: NetworkInterface,
    poll_interval: Duration,
}

impl HelperCommand {
    pub fn new(template: &str) -> TunnelResult<Self> {
        Ok(Self {
            words: split_command_line(template)?,
            interface: NetworkInterface::Default,
            poll_interval: Duration::from_millis(100),
        })
    }

    pub fn with_interface(mut self, interface: NetworkInterface) -> Self {
        self.interface = interface;
        self
    }

    /// How often to check whether the helper opened its port.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Program and arguments for one destination.
    pub fn render(&self, destination: &TunnelDestination, local_port: u16) -> (String, Vec<String>) {
        let instance = &destination.instance;
        let substitute = |word: &String| {
            word.replace("{project}", &instance.project)
                .replace("{zone}", &instance.zone)
                .replace("{instance}", &instance.name)
                .replace("{local_port}", &local_port.to_string())
                .replace("{port}", &destination.port.to_string())
                .replace("{interface}", self.interface.as_str())
        };

        let mut words = self.words.iter().map(substitute);
        let program = words.next().unwrap_or_default();
        (program, words.collect())
    }
}

impl Default for HelperCommand {
    fn default() -> Self {
        Self {
            words: DEFAULT_HELPER_COMMAND
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            interface: NetworkInterface::Default,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// A tunnel served by a running helper process.
pub struct HelperTunnel {
    destination: TunnelDestination,
    local_port: u16,
    child: Mutex<Child>,
    stderr: Arc<Mutex<String>>,
    closed: AtomicBool,
}

impl HelperTunnel {
    /// Start the helper and wait until its port accepts connections.
    pub async fn launch(
        command: &HelperCommand,
        destination: &TunnelDestination,
        timeout: Duration,
    ) -> TunnelResult<HelperTunnel> {
        destination.instance.validate()?;

        let local_port = free_local_port().await?;
        let (program, args) = command.render(destination, local_port);
        info!(
            "Starting helper `{}` for {} on port {}",
            program, destination, local_port
        );

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(ErrorKind::ConnectionFailed, "command", program.clone())?;
        let stderr = Arc::new(Mutex::new(String::new()));
        let collector = child
            .stderr
            .take()
            .map(|pipe| collect_stderr(pipe, stderr.clone()));

        let ready = tokio::time::timeout(
            timeout,
            wait_until_ready(&mut child, local_port, command.poll_interval),
        )
        .await;

        match ready {
            Ok(Ok(())) => {
                info!("Helper tunnel to {} ready on port {}", destination, local_port);
                Ok(HelperTunnel {
                    destination: destination.clone(),
                    local_port,
                    child: Mutex::new(child),
                    stderr,
                    closed: AtomicBool::new(false),
                })
            }
            Ok(Err(status)) => {
                if let Some(task) = collector {
                    let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
                }
                let output = lock(&stderr).clone();
                Err(exit_error(status, &output).with_context("destination", destination.to_string()))
            }
            Err(_) => {
                let _ = child.start_kill();
                Err(TunnelError::timeout(format!(
                    "Helper did not open port {} within {:?}",
                    local_port, timeout
                ))
                .with_context("destination", destination.to_string()))
            }
        }
    }

    pub fn destination(&self) -> &TunnelDestination {
        &self.destination
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn is_alive(&self) -> bool {
        self.status().is_alive()
    }

    /// `Failed` once the helper exited on its own, classified by its output.
    pub fn status(&self) -> TunnelStatus {
        if self.closed.load(Ordering::SeqCst) {
            return TunnelStatus::Closed;
        }
        let exited = lock(&self.child).try_wait();
        match exited {
            Ok(None) => TunnelStatus::Listening,
            Ok(Some(status)) => TunnelStatus::Failed(
                exit_error(Some(status), &lock(&self.stderr))
                    .with_context("destination", self.destination.to_string()),
            ),
            Err(e) => TunnelStatus::Failed(TunnelError::network_closed(format!(
                "Cannot query helper process: {}",
                e
            ))),
        }
    }

    /// Kill the helper. Returns immediately.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut child = lock(&self.child);
        if let Err(e) = child.start_kill() {
            debug!("Helper for {} already gone: {}", self.destination, e);
        }
    }
}

impl std::fmt::Debug for HelperTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperTunnel")
            .field("destination", &self.destination)
            .field("local_port", &self.local_port)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pick a port that is free right now.
async fn free_local_port() -> TunnelResult<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .with_kind(ErrorKind::ConnectionFailed)?;
    let port = listener
        .local_addr()
        .with_kind(ErrorKind::ConnectionFailed)?
        .port();
    Ok(port)
}

/// Poll until the port accepts connections. Returns the exit status if the
/// helper exits first.
async fn wait_until_ready(
    child: &mut Child,
    port: u16,
    interval: Duration,
) -> Result<(), Option<ExitStatus>> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Err(Some(status)),
            Ok(None) => {}
            Err(e) => {
                warn!("Cannot query helper process: {}", e);
                return Err(None);
            }
        }
        if TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.is_ok() {
            return Ok(());
        }
        tokio::time::sleep(interval).await;
    }
}

/// Log helper output and keep its head for error messages.
fn collect_stderr(stderr: ChildStderr, collected: Arc<Mutex<String>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("helper: {}", line);
            let mut collected = lock(&collected);
            if collected.len() < STDERR_LIMIT {
                collected.push_str(&line);
                collected.push('\n');
            }
        }
    })
}

fn exit_error(status: Option<ExitStatus>, stderr: &str) -> TunnelError {
    let status = status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown status".to_string());
    let message = format!("Helper exited with {}: {}", status, stderr.trim());

    let lowered = stderr.to_lowercase();
    if AUTH_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        TunnelError::unauthorized(message)
    } else {
        TunnelError::network_closed(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::InstanceLocator;

    fn destination() -> TunnelDestination {
        TunnelDestination::new(InstanceLocator::new("my-project", "zone-a", "vm-1"), 3389)
    }

    #[test]
    fn test_default_command_renders() {
        let command = HelperCommand::default().with_interface("nic1".parse().unwrap());
        let (program, args) = command.render(&destination(), 50001);

        assert_eq!(program, "gcloud");
        assert_eq!(
            args,
            vec![
                "compute",
                "start-iap-tunnel",
                "vm-1",
                "3389",
                "--local-host-port=localhost:50001",
                "--zone=zone-a",
                "--project=my-project",
                "--network-interface=nic1",
            ]
        );
    }

    #[test]
    fn test_exit_error_classification() {
        let err = exit_error(None, "ERROR: (gcloud) Permission denied on instance");
        assert_eq!(err.kind, ErrorKind::Unauthorized);

        let err = exit_error(None, "ERROR: connection refused");
        assert_eq!(err.kind, ErrorKind::NetworkClosed);
        assert!(err.message.contains("connection refused"));
    }

    #[test]
    fn test_exit_error_ignores_words_containing_markers() {
        for output in [
            "ERROR: oauth2 endpoint unreachable",
            "Testing if tunnel connection works on port 4030",
            "connection to 10.0.40.3 closed",
        ] {
            let err = exit_error(None, output);
            assert_eq!(err.kind, ErrorKind::NetworkClosed, "{}", output);
        }

        let err = exit_error(None, "The caller does not have permission");
        assert_eq!(err.kind, ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_malformed_destination_fails_before_spawning() {
        let command = HelperCommand::new("definitely-not-a-real-helper").unwrap();
        let bad = TunnelDestination::new(InstanceLocator::new("Bad", "zone", "vm"), 22);
        let err = HelperTunnel::launch(&command, &bad, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionFailed);
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let command = HelperCommand::new("/nonexistent/helper {instance}").unwrap();
        let err = HelperTunnel::launch(&command, &destination(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionFailed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_permission_error_is_unauthorized() {
        let command =
            HelperCommand::new("sh -c 'echo \"permission denied for {instance}\" >&2; exit 1'")
                .unwrap();
        let err = HelperTunnel::launch(&command, &destination(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthorized);
        assert!(err.message.contains("vm-1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_is_network_closed() {
        let command = HelperCommand::new("sh -c 'exit 3'").unwrap();
        let err = HelperTunnel::launch(&command, &destination(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NetworkClosed);
        assert!(!err.is_timeout());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_helper_that_never_listens_times_out() {
        let command = HelperCommand::new("sleep 30")
            .unwrap()
            .with_poll_interval(Duration::from_millis(20));
        let err = HelperTunnel::launch(&command, &destination(), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NetworkClosed);
        assert!(err.is_timeout());
    }

    #[cfg(unix)]
    fn running(script: &str) -> HelperTunnel {
        let mut child = Command::new("sh")
            .args(["-c", script])
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let stderr = Arc::new(Mutex::new(String::new()));
        collect_stderr(child.stderr.take().unwrap(), stderr.clone());
        HelperTunnel {
            destination: destination(),
            local_port: 1,
            child: Mutex::new(child),
            stderr,
            closed: AtomicBool::new(false),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_status_reports_why_helper_exited() {
        let tunnel = running("echo 'ERROR: permission denied' >&2; exit 1");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tunnel.status().is_alive() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Let the collector catch up with the exited process.
        tokio::time::sleep(Duration::from_millis(100)).await;

        match tunnel.status() {
            TunnelStatus::Failed(err) => {
                assert_eq!(err.kind, ErrorKind::Unauthorized);
                assert!(err.message.contains("permission denied"));
            }
            other => panic!("unexpected status {:?}", other),
        }
        assert!(!tunnel.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_status_of_running_and_closed_helper() {
        let tunnel = running("sleep 30");
        assert!(matches!(tunnel.status(), TunnelStatus::Listening));

        tunnel.close();
        assert!(matches!(tunnel.status(), TunnelStatus::Closed));
        assert!(!tunnel.is_alive());
    }
}
