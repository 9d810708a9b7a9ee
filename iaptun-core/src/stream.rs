//! Relay streams: one logical byte channel to a remote endpoint.
//!
//! A [`RelayConnector`] performs the connect handshake and hands back a
//! [`RelayStream`]. The stream is a handle; a driver task owns the WebSocket
//! and the session state, moves bytes between the handle's queues and the
//! relay, and transparently resumes the session after transport failures.

use crate::endpoint::{RelayEndpoint, TunnelDestination};
use crate::error::{TunnelError, TunnelResult};
use crate::policy::{ReconnectGuard, StreamConfig};
use crate::protocol::{
    data_frames, CloseCode, CloseDisposition, Frame, MAX_DATA_FRAME_SIZE, MAX_FRAME_SIZE,
};
use crate::retransmit::RetransmitBuffer;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::{Message as WsMessage, WebSocketConfig};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Received bytes between two acknowledgements sent to the relay.
const ACK_THRESHOLD: u64 = 2 * MAX_DATA_FRAME_SIZE as u64;

/// Upper bound for sending our close frame on the way out.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection phase of a relay stream.
#[derive(Debug, Clone)]
pub enum StreamPhase {
    Connecting,
    Connected,
    Reconnecting,
    Failed(TunnelError),
    Closed,
}

impl StreamPhase {
    /// Whether the stream can no longer carry data.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamPhase::Failed(_) | StreamPhase::Closed)
    }
}

/// Byte counters of a relay session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub bytes_sent: u64,
    pub bytes_acked: u64,
    pub bytes_received: u64,
    pub reconnects: u32,
}

struct RelaySession {
    sid: String,
    bytes_received: u64,
    last_ack_sent: u64,
    reconnects: u32,
    retransmit: RetransmitBuffer,
}

impl RelaySession {
    fn new(sid: String) -> Self {
        Self {
            sid,
            bytes_received: 0,
            last_ack_sent: 0,
            reconnects: 0,
            retransmit: RetransmitBuffer::new(),
        }
    }

    /// Apply a cumulative acknowledgement from the relay.
    fn acknowledge(&mut self, ack: u64) -> TunnelResult<()> {
        let sent = self.retransmit.end_offset();
        if ack > sent {
            return Err(TunnelError::protocol(format!(
                "Relay acknowledged {} bytes but only {} were sent",
                ack, sent
            )));
        }
        self.retransmit.discard_until(ack);
        Ok(())
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            bytes_sent: self.retransmit.end_offset(),
            bytes_acked: self.retransmit.base_offset(),
            bytes_received: self.bytes_received,
            reconnects: self.reconnects,
        }
    }
}

type SharedSession = Arc<Mutex<RelaySession>>;

fn with_session<R>(session: &SharedSession, f: impl FnOnce(&mut RelaySession) -> R) -> R {
    let mut guard = session.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}

/// Why a relay connection stopped carrying data.
enum Interruption {
    /// Worth resuming the session.
    Transient(TunnelError),
    /// The session is over.
    Fatal(TunnelError),
}

impl Interruption {
    fn into_error(self) -> TunnelError {
        match self {
            Interruption::Transient(err) | Interruption::Fatal(err) => err,
        }
    }
}

impl From<TunnelError> for Interruption {
    fn from(err: TunnelError) -> Self {
        if err.is_retryable() {
            Interruption::Transient(err)
        } else {
            Interruption::Fatal(err)
        }
    }
}

fn handshake_failure(err: WsError) -> Interruption {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            let message = format!("Relay rejected handshake with HTTP {}", status);
            match status.as_u16() {
                401 | 403 | 404 => Interruption::Fatal(TunnelError::unauthorized(message)),
                429 | 500..=599 => Interruption::Transient(TunnelError::network_closed(message)),
                _ => Interruption::Fatal(TunnelError::connection_failed(message)),
            }
        }
        err @ WsError::Url(_) => Interruption::Fatal(
            TunnelError::connection_failed("Invalid relay URL").with_cause(err),
        ),
        other => transport_failure(other),
    }
}

fn transport_failure(err: WsError) -> Interruption {
    match err {
        err @ WsError::Capacity(_) => Interruption::Fatal(
            TunnelError::protocol("Relay sent an oversized message").with_cause(err),
        ),
        other => Interruption::Transient(
            TunnelError::network_closed("Relay connection failed").with_cause(other),
        ),
    }
}

/// Classify a close frame. `None` means a graceful end of stream.
fn close_interruption(frame: Option<CloseFrame<'_>>) -> Option<Interruption> {
    let frame = frame?;
    let code = CloseCode::from(u16::from(frame.code));
    let message = if frame.reason.is_empty() {
        format!("Relay closed the connection: {}", code)
    } else {
        format!("Relay closed the connection: {}: {}", code, frame.reason)
    };

    match code.disposition() {
        CloseDisposition::EndOfStream => None,
        CloseDisposition::Unauthorized => {
            Some(Interruption::Fatal(TunnelError::unauthorized(message)))
        }
        CloseDisposition::Terminal => {
            Some(Interruption::Fatal(TunnelError::network_closed(message)))
        }
        CloseDisposition::ProtocolViolation => {
            Some(Interruption::Fatal(TunnelError::protocol(message)))
        }
        CloseDisposition::Transient => {
            Some(Interruption::Transient(TunnelError::network_closed(message)))
        }
    }
}

async fn open(request: Request) -> Result<RelaySocket, Interruption> {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_FRAME_SIZE);
    config.max_frame_size = Some(MAX_FRAME_SIZE);

    let (socket, _response) = connect_async_with_config(request, Some(config), true)
        .await
        .map_err(handshake_failure)?;
    Ok(socket)
}

/// Wait for the first frame after an upgrade.
async fn next_control_frame(socket: &mut RelaySocket) -> Result<Frame, Interruption> {
    loop {
        match socket.next().await {
            Some(Ok(WsMessage::Binary(data))) => {
                return Frame::decode(&data).map_err(|e| Interruption::Fatal(e.into()))
            }
            Some(Ok(WsMessage::Close(frame))) => {
                return Err(close_interruption(frame).unwrap_or_else(|| {
                    Interruption::Transient(TunnelError::network_closed(
                        "Relay closed the connection during the handshake",
                    ))
                }))
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(transport_failure(err)),
            None => {
                return Err(Interruption::Transient(TunnelError::network_closed(
                    "Relay dropped the connection during the handshake",
                )))
            }
        }
    }
}

async fn send_frame(socket: &mut RelaySocket, frame: &Frame) -> Result<(), Interruption> {
    socket
        .send(WsMessage::Binary(frame.encode().to_vec()))
        .await
        .map_err(transport_failure)
}

async fn close_socket(socket: &mut RelaySocket) {
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, socket.close(None)).await;
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // A dropped handle counts as shutdown too.
    let _ = shutdown.wait_for(|closing| *closing).await;
}

/// Opens relay streams to one endpoint.
#[derive(Debug, Clone)]
pub struct RelayConnector {
    endpoint: RelayEndpoint,
    config: StreamConfig,
}

impl RelayConnector {
    pub fn new(endpoint: RelayEndpoint, config: StreamConfig) -> Self {
        Self { endpoint, config }
    }

    pub fn endpoint(&self) -> &RelayEndpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Perform the connect handshake and start the stream.
    ///
    /// A handshake that does not finish within `timeout` fails with a
    /// timeout-classified `NetworkClosed` error.
    pub async fn connect(&self, timeout: Duration) -> TunnelResult<RelayStream> {
        let destination = self.endpoint.destination().clone();
        debug!("Connecting to {} through relay", destination);

        let handshake = async {
            let request = self.endpoint.connect_request().await?;
            let mut socket = open(request).await.map_err(Interruption::into_error)?;
            match next_control_frame(&mut socket)
                .await
                .map_err(Interruption::into_error)?
            {
                Frame::ConnectSuccessSid(sid) => Ok::<_, TunnelError>((socket, sid)),
                other => Err(TunnelError::protocol(format!(
                    "Expected connect-success, got {:?} frame",
                    other.tag()
                ))),
            }
        };

        let (socket, sid) = match tokio::time::timeout(timeout, handshake).await {
            Ok(result) => {
                result.map_err(|e| e.with_context("destination", destination.to_string()))?
            }
            Err(_) => {
                return Err(TunnelError::timeout(format!(
                    "Relay handshake did not complete within {:?}",
                    timeout
                ))
                .with_context("destination", destination.to_string()))
            }
        };

        info!("Connected to {} through relay", destination);
        debug!("Relay session id {}", sid);
        Ok(RelayStream::spawn(self.clone(), socket, sid))
    }

    /// Check reachability and authorization without transferring data.
    pub async fn test_connection(&self, timeout: Duration) -> TunnelResult<()> {
        let stream = self.connect(timeout).await?;
        stream.close();
        Ok(())
    }
}

/// Handle to an established relay stream.
///
/// Reads and writes may run concurrently from different tasks. Dropping the
/// handle closes the stream.
pub struct RelayStream {
    destination: TunnelDestination,
    chunk_size: usize,
    writes: mpsc::Sender<Bytes>,
    reads: AsyncMutex<mpsc::Receiver<Bytes>>,
    phase: watch::Receiver<StreamPhase>,
    shutdown: watch::Sender<bool>,
    session: SharedSession,
}

impl RelayStream {
    fn spawn(connector: RelayConnector, socket: RelaySocket, sid: String) -> Self {
        let capacity = connector.config.queue_capacity.max(1);
        let (write_tx, write_rx) = mpsc::channel(capacity);
        let (read_tx, read_rx) = mpsc::channel(capacity);
        let (phase_tx, phase_rx) = watch::channel(StreamPhase::Connected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = Arc::new(Mutex::new(RelaySession::new(sid)));
        let destination = connector.endpoint.destination().clone();
        let chunk_size = connector.config.write_chunk_size();

        let driver = Driver {
            guard: ReconnectGuard::from_config(&connector.config),
            connector,
            session: session.clone(),
            phase: phase_tx,
            writes: write_rx,
            reads: read_tx,
        };
        tokio::spawn(driver.run(socket, shutdown_rx));

        Self {
            destination,
            chunk_size,
            writes: write_tx,
            reads: AsyncMutex::new(read_rx),
            phase: phase_rx,
            shutdown: shutdown_tx,
            session,
        }
    }

    pub fn destination(&self) -> &TunnelDestination {
        &self.destination
    }

    /// Current connection phase.
    pub fn phase(&self) -> StreamPhase {
        self.phase.borrow().clone()
    }

    /// Whether the stream still carries data, possibly after a reconnect.
    pub fn is_open(&self) -> bool {
        !self.phase.borrow().is_terminal()
    }

    pub fn stats(&self) -> SessionStats {
        with_session(&self.session, |s| s.stats())
    }

    /// Next chunk of bytes from the remote endpoint.
    ///
    /// Returns `Ok(None)` once the stream has ended gracefully.
    pub async fn read(&self) -> TunnelResult<Option<Bytes>> {
        let mut reads = self.reads.lock().await;
        match reads.recv().await {
            Some(chunk) => Ok(Some(chunk)),
            None => match &*self.phase.borrow() {
                StreamPhase::Failed(err) => Err(err.clone()),
                _ => Ok(None),
            },
        }
    }

    /// Queue bytes for the remote endpoint.
    ///
    /// Waits while the retransmission window is full.
    pub async fn write(&self, data: &[u8]) -> TunnelResult<()> {
        if !self.is_open() {
            return Err(self.closed_error());
        }
        let data = Bytes::copy_from_slice(data);
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + self.chunk_size).min(data.len());
            self.writes
                .send(data.slice(offset..end))
                .await
                .map_err(|_| self.closed_error())?;
            offset = end;
        }
        Ok(())
    }

    fn closed_error(&self) -> TunnelError {
        match &*self.phase.borrow() {
            StreamPhase::Failed(err) => {
                TunnelError::closed(format!("Relay stream failed: {}", err.message))
            }
            _ => TunnelError::closed("Relay stream is closed"),
        }
    }

    /// Close the stream. Does not wait for the close handshake.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait until the stream has closed or failed.
    pub async fn terminated(&self) -> StreamPhase {
        let mut phase = self.phase.clone();
        let result = phase
            .wait_for(StreamPhase::is_terminal)
            .await
            .map(|phase| (*phase).clone());
        result.unwrap_or(StreamPhase::Closed)
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RelayStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayStream")
            .field("destination", &self.destination)
            .field("phase", &*self.phase.borrow())
            .finish()
    }
}

enum Pump {
    Shutdown,
    EndOfStream,
    Interrupted(Interruption),
}

/// Owns the relay connection of one stream.
struct Driver {
    connector: RelayConnector,
    session: SharedSession,
    phase: watch::Sender<StreamPhase>,
    writes: mpsc::Receiver<Bytes>,
    reads: mpsc::Sender<Bytes>,
    guard: ReconnectGuard,
}

impl Driver {
    fn destination(&self) -> &TunnelDestination {
        self.connector.endpoint.destination()
    }

    fn finish(&self, phase: StreamPhase) {
        self.phase.send_replace(phase);
    }

    async fn run(mut self, mut socket: RelaySocket, mut shutdown: watch::Receiver<bool>) {
        loop {
            match self.pump(&mut socket, &mut shutdown).await {
                Pump::Shutdown => {
                    debug!("Closing relay stream to {}", self.destination());
                    close_socket(&mut socket).await;
                    self.finish(StreamPhase::Closed);
                    return;
                }
                Pump::EndOfStream => {
                    info!("Relay ended the stream to {}", self.destination());
                    close_socket(&mut socket).await;
                    self.finish(StreamPhase::Closed);
                    return;
                }
                Pump::Interrupted(Interruption::Fatal(err)) => {
                    warn!("Relay stream to {} failed: {}", self.destination(), err);
                    close_socket(&mut socket).await;
                    self.finish(StreamPhase::Failed(err));
                    return;
                }
                Pump::Interrupted(Interruption::Transient(err)) => {
                    warn!(
                        "Lost relay connection to {}, reconnecting: {}",
                        self.destination(),
                        err
                    );
                    self.phase.send_replace(StreamPhase::Reconnecting);

                    tokio::select! {
                        resumed = self.reconnect() => match resumed {
                            Ok(resumed) => {
                                socket = resumed;
                                self.phase.send_replace(StreamPhase::Connected);
                            }
                            Err(err) => {
                                warn!("Giving up on relay stream to {}: {}", self.destination(), err);
                                self.finish(StreamPhase::Failed(err));
                                return;
                            }
                        },
                        _ = wait_for_shutdown(&mut shutdown) => {
                            self.finish(StreamPhase::Closed);
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn pump(
        &mut self,
        socket: &mut RelaySocket,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Pump {
        let max_unacked = self.connector.config.max_unacked_bytes;
        let chunk_size = self.connector.config.write_chunk_size();
        loop {
            let window_open = with_session(&self.session, |s| {
                s.retransmit.is_empty() || s.retransmit.len() + chunk_size <= max_unacked
            });

            tokio::select! {
                _ = wait_for_shutdown(shutdown) => return Pump::Shutdown,
                write = self.writes.recv(), if window_open => match write {
                    Some(chunk) => {
                        if let Err(interruption) = self.send_data(socket, chunk).await {
                            return Pump::Interrupted(interruption);
                        }
                    }
                    None => return Pump::Shutdown,
                },
                message = socket.next() => {
                    if let Some(outcome) = self.handle_message(socket, message).await {
                        return outcome;
                    }
                }
            }
        }
    }

    async fn handle_message(
        &mut self,
        socket: &mut RelaySocket,
        message: Option<Result<WsMessage, WsError>>,
    ) -> Option<Pump> {
        let message = match message {
            Some(Ok(message)) => message,
            Some(Err(err)) => return Some(Pump::Interrupted(transport_failure(err))),
            None => {
                return Some(Pump::Interrupted(Interruption::Transient(
                    TunnelError::network_closed("Relay dropped the connection"),
                )))
            }
        };

        match message {
            WsMessage::Binary(data) => {
                let frame = match Frame::decode(&data) {
                    Ok(frame) => frame,
                    Err(err) => return Some(Pump::Interrupted(Interruption::Fatal(err.into()))),
                };
                match frame {
                    Frame::Data(payload) => self
                        .deliver(socket, payload)
                        .await
                        .err()
                        .map(Pump::Interrupted),
                    Frame::Ack(ack) => {
                        trace!("Relay acknowledged {} bytes", ack);
                        with_session(&self.session, |s| s.acknowledge(ack))
                            .err()
                            .map(|err| Pump::Interrupted(Interruption::Fatal(err)))
                    }
                    other => Some(Pump::Interrupted(Interruption::Fatal(
                        TunnelError::protocol(format!(
                            "Unexpected {:?} frame on an established stream",
                            other.tag()
                        )),
                    ))),
                }
            }
            WsMessage::Close(frame) => Some(match close_interruption(frame) {
                Some(interruption) => Pump::Interrupted(interruption),
                None => Pump::EndOfStream,
            }),
            WsMessage::Text(_) => Some(Pump::Interrupted(Interruption::Fatal(
                TunnelError::protocol("Relay sent a text message"),
            ))),
            _ => None,
        }
    }

    async fn deliver(&mut self, socket: &mut RelaySocket, payload: Bytes) -> Result<(), Interruption> {
        let len = payload.len() as u64;
        trace!("Received {} bytes from relay", len);

        // A dropped reader shows up as shutdown on the next poll.
        let _ = self.reads.send(payload).await;

        let ack = with_session(&self.session, |s| {
            s.bytes_received += len;
            if s.bytes_received - s.last_ack_sent >= ACK_THRESHOLD {
                s.last_ack_sent = s.bytes_received;
                Some(s.bytes_received)
            } else {
                None
            }
        });

        if let Some(ack) = ack {
            send_frame(socket, &Frame::Ack(ack)).await?;
        }
        Ok(())
    }

    async fn send_data(&mut self, socket: &mut RelaySocket, chunk: Bytes) -> Result<(), Interruption> {
        // Retain first so that a failed send is replayed after reconnecting.
        with_session(&self.session, |s| s.retransmit.push(chunk.clone()));
        for frame in data_frames(&chunk) {
            send_frame(socket, &frame).await?;
        }
        Ok(())
    }

    async fn reconnect(&mut self) -> TunnelResult<RelaySocket> {
        let config = self.connector.config.clone();
        let mut attempt = 0;

        loop {
            attempt += 1;
            if attempt > config.max_reconnect_attempts {
                return Err(TunnelError::network_closed(format!(
                    "Relay unreachable after {} reconnect attempts",
                    config.max_reconnect_attempts
                )));
            }
            if !self.guard.try_acquire() {
                return Err(TunnelError::network_closed(format!(
                    "More than {} reconnects within {:?}",
                    config.max_reconnects_per_window, config.reconnect_window
                )));
            }

            tokio::time::sleep(config.reconnect_delay(attempt)).await;

            let resumed = match tokio::time::timeout(config.handshake_timeout, self.resume()).await {
                Ok(result) => result,
                Err(_) => Err(Interruption::Transient(TunnelError::timeout(
                    "Reconnect handshake timed out",
                ))),
            };

            match resumed {
                Ok(socket) => {
                    let reconnects = with_session(&self.session, |s| {
                        s.reconnects += 1;
                        s.reconnects
                    });
                    info!(
                        "Resumed relay stream to {} (reconnect #{})",
                        self.destination(),
                        reconnects
                    );
                    return Ok(socket);
                }
                Err(Interruption::Transient(err)) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, err);
                }
                Err(Interruption::Fatal(err)) => return Err(err),
            }
        }
    }

    /// Resume the session on a new connection and replay unacknowledged bytes.
    async fn resume(&mut self) -> Result<RelaySocket, Interruption> {
        let (sid, received) = with_session(&self.session, |s| {
            s.last_ack_sent = s.bytes_received;
            (s.sid.clone(), s.bytes_received)
        });

        let request = self.connector.endpoint.reconnect_request(&sid, received).await?;
        let mut socket = open(request).await?;

        match next_control_frame(&mut socket).await? {
            Frame::ReconnectSuccessAck(ack) => {
                let pending = with_session(&self.session, |s| {
                    s.acknowledge(ack)?;
                    Ok::<_, TunnelError>(s.retransmit.chunks().cloned().collect::<Vec<_>>())
                })
                .map_err(Interruption::Fatal)?;

                debug!(
                    "Relay resumed at {} bytes, replaying {} chunks",
                    ack,
                    pending.len()
                );
                for chunk in &pending {
                    for frame in data_frames(chunk) {
                        send_frame(&mut socket, &frame).await?;
                    }
                }
                Ok(socket)
            }
            other => Err(Interruption::Fatal(TunnelError::protocol(format!(
                "Expected reconnect-success, got {:?} frame",
                other.tag()
            )))),
        }
    }
}
