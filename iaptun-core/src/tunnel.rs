//! Local TCP listeners spliced onto relay streams.
//!
//! A [`Tunnel`] owns a listener on `127.0.0.1` with an OS-assigned port and
//! serves one local client at a time. Every local client gets a relay stream
//! of its own: the stream opened with the tunnel goes to the first client,
//! later clients get a fresh one, so nothing queued for a previous client
//! reaches the next. A relay failure fails the whole tunnel.

use crate::endpoint::TunnelDestination;
use crate::error::{ErrorKind, ResultExt, TunnelError, TunnelResult};
use crate::protocol::MAX_DATA_FRAME_SIZE;
use crate::stream::{RelayConnector, RelayStream, StreamPhase};
use std::future::pending;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Lifecycle of a tunnel.
#[derive(Debug, Clone)]
pub enum TunnelStatus {
    /// Waiting for a local client.
    Listening,
    /// Splicing a local client onto the relay stream.
    Active,
    /// The relay stream failed; the listener is gone.
    Failed(TunnelError),
    /// Closed by its owner.
    Closed,
}

impl TunnelStatus {
    pub fn is_alive(&self) -> bool {
        matches!(self, TunnelStatus::Listening | TunnelStatus::Active)
    }
}

/// A relay stream exposed as a local TCP port.
pub struct Tunnel {
    destination: TunnelDestination,
    local_addr: SocketAddr,
    status: watch::Receiver<TunnelStatus>,
    shutdown: watch::Sender<bool>,
}

impl Tunnel {
    /// Connect the relay stream, then start listening.
    ///
    /// Relay failures during the handshake are returned as-is, so callers see
    /// `Unauthorized` for rejected targets before any port is bound.
    pub async fn open(connector: RelayConnector, timeout: Duration) -> TunnelResult<Tunnel> {
        let destination = connector.endpoint().destination().clone();
        let stream = connector.connect(timeout).await?;

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .with_context(ErrorKind::ConnectionFailed, "destination", destination.to_string())?;
        let local_addr = listener
            .local_addr()
            .with_kind(ErrorKind::ConnectionFailed)?;

        info!("Tunnel to {} listening on {}", destination, local_addr);

        let (status_tx, status_rx) = watch::channel(TunnelStatus::Listening);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = TunnelWorker {
            destination: destination.clone(),
            connector,
            timeout,
            listener,
            stream: Some(stream),
            status: status_tx,
        };
        tokio::spawn(worker.run(shutdown_rx));

        Ok(Tunnel {
            destination,
            local_addr,
            status: status_rx,
            shutdown: shutdown_tx,
        })
    }

    pub fn destination(&self) -> &TunnelDestination {
        &self.destination
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn status(&self) -> TunnelStatus {
        self.status.borrow().clone()
    }

    /// Subscribe to status changes.
    pub fn watch_status(&self) -> watch::Receiver<TunnelStatus> {
        self.status.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.status.borrow().is_alive()
    }

    /// Stop listening and close the relay stream. Returns immediately.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait until the tunnel has failed or closed.
    pub async fn stopped(&self) -> TunnelStatus {
        let mut status = self.status.clone();
        let result = status
            .wait_for(|status| !status.is_alive())
            .await
            .map(|status| (*status).clone());
        result.unwrap_or(TunnelStatus::Closed)
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("destination", &self.destination)
            .field("local_addr", &self.local_addr)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

enum SpliceOutcome {
    LocalClosed,
    RelayEnded,
    RelayFailed(TunnelError),
    Shutdown,
}

struct TunnelWorker {
    destination: TunnelDestination,
    connector: RelayConnector,
    timeout: Duration,
    listener: TcpListener,
    stream: Option<RelayStream>,
    status: watch::Sender<TunnelStatus>,
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closing| *closing).await;
}

async fn idle_stream_ended(stream: &Option<RelayStream>) -> StreamPhase {
    match stream {
        Some(stream) => stream.terminated().await,
        None => pending().await,
    }
}

impl TunnelWorker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let final_status = loop {
            let accepted = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break TunnelStatus::Closed,
                phase = idle_stream_ended(&self.stream) => {
                    match phase {
                        StreamPhase::Failed(err) => break TunnelStatus::Failed(err),
                        _ => {
                            debug!("Relay stream to {} ended while idle", self.destination);
                            self.stream = None;
                            continue;
                        }
                    }
                }
                accepted = self.listener.accept() => accepted,
            };

            let (socket, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed on tunnel to {}: {}", self.destination, e);
                    continue;
                }
            };
            info!("Local client {} connected to tunnel {}", peer, self.destination);

            if self.stream.is_none() {
                match self.connector.connect(self.timeout).await {
                    Ok(stream) => self.stream = Some(stream),
                    Err(err) => break TunnelStatus::Failed(err),
                }
            }

            self.status.send_replace(TunnelStatus::Active);
            match self.serve_client(socket, &mut shutdown).await {
                SpliceOutcome::LocalClosed => {
                    info!("Local client {} disconnected from tunnel {}", peer, self.destination);
                    if let Some(stream) = self.stream.take() {
                        stream.close();
                    }
                }
                SpliceOutcome::RelayEnded => {
                    info!("Relay ended the session for local client {}", peer);
                    self.stream = None;
                }
                SpliceOutcome::RelayFailed(err) => break TunnelStatus::Failed(err),
                SpliceOutcome::Shutdown => break TunnelStatus::Closed,
            }
            self.status.send_replace(TunnelStatus::Listening);
        };

        match &final_status {
            TunnelStatus::Failed(err) => {
                error!("Tunnel to {} failed: {}", self.destination, err)
            }
            _ => info!("Tunnel to {} closed", self.destination),
        }
        drop(self.listener);
        if let Some(stream) = self.stream.take() {
            stream.close();
        }
        self.status.send_replace(final_status);
    }

    /// Splice one local client, turning away everyone else meanwhile.
    async fn serve_client(
        &self,
        mut socket: TcpStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SpliceOutcome {
        let Some(stream) = self.stream.as_ref() else {
            return SpliceOutcome::RelayEnded;
        };
        let _ = socket.set_nodelay(true);

        let splice = splice(&mut socket, stream);
        tokio::pin!(splice);

        loop {
            tokio::select! {
                outcome = &mut splice => return outcome,
                _ = wait_for_shutdown(shutdown) => return SpliceOutcome::Shutdown,
                extra = self.listener.accept() => {
                    if let Ok((extra, peer)) = extra {
                        warn!(
                            "Refusing local client {}: tunnel to {} is in use",
                            peer, self.destination
                        );
                        drop(extra);
                    }
                }
            }
        }
    }
}

fn relay_outcome(stream: &RelayStream) -> SpliceOutcome {
    match stream.phase() {
        StreamPhase::Failed(err) => SpliceOutcome::RelayFailed(err),
        _ => SpliceOutcome::RelayEnded,
    }
}

async fn splice(socket: &mut TcpStream, stream: &RelayStream) -> SpliceOutcome {
    let (mut local_rx, mut local_tx) = socket.split();

    let upstream = async {
        let mut buf = vec![0u8; MAX_DATA_FRAME_SIZE];
        loop {
            match local_rx.read(&mut buf).await {
                Ok(0) => return SpliceOutcome::LocalClosed,
                Ok(n) => {
                    if stream.write(&buf[..n]).await.is_err() {
                        return relay_outcome(stream);
                    }
                }
                Err(e) => {
                    debug!("Local connection reset: {}", e);
                    return SpliceOutcome::LocalClosed;
                }
            }
        }
    };

    let downstream = async {
        loop {
            match stream.read().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = local_tx.write_all(&chunk).await {
                        debug!("Local connection write failed: {}", e);
                        return SpliceOutcome::LocalClosed;
                    }
                }
                Ok(None) => return SpliceOutcome::RelayEnded,
                Err(err) => return SpliceOutcome::RelayFailed(err),
            }
        }
    };

    tokio::select! {
        outcome = upstream => outcome,
        outcome = downstream => outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Behaviour, FakeRelay};

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn read_n(socket: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        tokio::time::timeout(TIMEOUT, socket.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_splices_local_client() {
        let relay = FakeRelay::start(Behaviour::Echo).await;
        let tunnel = Tunnel::open(relay.connector(), TIMEOUT).await.unwrap();
        assert!(tunnel.local_addr().ip().is_loopback());
        assert_ne!(tunnel.local_port(), 0);
        assert!(tunnel.is_alive());

        let mut client = TcpStream::connect(tunnel.local_addr()).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        assert_eq!(read_n(&mut client, 4).await, b"ping");
    }

    async fn wait_until_listening(tunnel: &Tunnel) {
        let mut status = tunnel.watch_status();
        tokio::time::timeout(
            TIMEOUT,
            status.wait_for(|status| matches!(status, TunnelStatus::Listening)),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_each_local_client_gets_fresh_stream() {
        let relay = FakeRelay::start(Behaviour::Echo).await;
        let tunnel = Tunnel::open(relay.connector(), TIMEOUT).await.unwrap();

        let mut first = TcpStream::connect(tunnel.local_addr()).await.unwrap();
        first.write_all(b"one").await.unwrap();
        assert_eq!(read_n(&mut first, 3).await, b"one");
        drop(first);
        wait_until_listening(&tunnel).await;

        let mut second = TcpStream::connect(tunnel.local_addr()).await.unwrap();
        second.write_all(b"two").await.unwrap();
        assert_eq!(read_n(&mut second, 3).await, b"two");

        assert_eq!(relay.state().connects(), 2);
        assert!(tunnel.is_alive());
    }

    #[tokio::test]
    async fn test_unread_reply_does_not_reach_next_client() {
        let relay = FakeRelay::start(Behaviour::Echo).await;
        let tunnel = Tunnel::open(relay.connector(), TIMEOUT).await.unwrap();

        let mut first = TcpStream::connect(tunnel.local_addr()).await.unwrap();
        first.write_all(b"one").await.unwrap();
        relay.state().wait_for_received(3, TIMEOUT).await;
        drop(first);
        wait_until_listening(&tunnel).await;

        let mut second = TcpStream::connect(tunnel.local_addr()).await.unwrap();
        second.write_all(b"two").await.unwrap();
        assert_eq!(read_n(&mut second, 3).await, b"two");
    }

    #[tokio::test]
    async fn test_second_client_is_refused_while_busy() {
        let relay = FakeRelay::start(Behaviour::Echo).await;
        let tunnel = Tunnel::open(relay.connector(), TIMEOUT).await.unwrap();

        let mut first = TcpStream::connect(tunnel.local_addr()).await.unwrap();
        first.write_all(b"a").await.unwrap();
        assert_eq!(read_n(&mut first, 1).await, b"a");

        let mut second = TcpStream::connect(tunnel.local_addr()).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(TIMEOUT, second.read(&mut buf))
            .await
            .unwrap();
        // Either an orderly close or a reset
        assert!(matches!(read, Ok(0) | Err(_)));

        first.write_all(b"b").await.unwrap();
        assert_eq!(read_n(&mut first, 1).await, b"b");
    }

    #[tokio::test]
    async fn test_relay_end_of_stream_gives_next_client_fresh_stream() {
        let relay = FakeRelay::start(Behaviour::SendThenClose(b"hi")).await;
        let tunnel = Tunnel::open(relay.connector(), TIMEOUT).await.unwrap();

        for expected_connects in [1, 2] {
            let mut client = TcpStream::connect(tunnel.local_addr()).await.unwrap();
            assert_eq!(read_n(&mut client, 2).await, b"hi");
            let mut buf = [0u8; 1];
            let read = tokio::time::timeout(TIMEOUT, client.read(&mut buf))
                .await
                .unwrap();
            assert!(matches!(read, Ok(0) | Err(_)));
            assert!(relay.state().connects() >= expected_connects);
        }
        assert!(tunnel.is_alive());
    }

    #[tokio::test]
    async fn test_relay_failure_fails_tunnel() {
        let relay = FakeRelay::start(Behaviour::CloseAfterConnect(4033)).await;
        let tunnel = Tunnel::open(relay.connector(), TIMEOUT).await.unwrap();

        let status = tokio::time::timeout(TIMEOUT, tunnel.stopped())
            .await
            .unwrap();
        match status {
            TunnelStatus::Failed(err) => assert_eq!(err.kind, ErrorKind::Unauthorized),
            other => panic!("unexpected status {:?}", other),
        }
        assert!(!tunnel.is_alive());
    }

    #[tokio::test]
    async fn test_open_fails_for_rejected_target() {
        let relay = FakeRelay::start(Behaviour::RejectHttp(403)).await;
        let err = Tunnel::open(relay.connector(), TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_close_stops_listener() {
        let relay = FakeRelay::start(Behaviour::Echo).await;
        let tunnel = Tunnel::open(relay.connector(), TIMEOUT).await.unwrap();
        let addr = tunnel.local_addr();

        tunnel.close();
        let status = tokio::time::timeout(TIMEOUT, tunnel.stopped())
            .await
            .unwrap();
        assert!(matches!(status, TunnelStatus::Closed));
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
