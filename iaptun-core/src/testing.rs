//! In-process relay used by the tests of this crate.

use crate::auth::{Credential, StaticToken};
use crate::endpoint::{EndpointResolver, InstanceLocator, TunnelDestination};
use crate::error::TunnelResult;
use crate::policy::StreamConfig;
use crate::protocol::{Frame, SUBPROTOCOL};
use crate::stream::RelayConnector;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

pub const SESSION_ID: &str = "test-session";
pub const TOKEN: &str = "test-token";

/// How the relay treats connections.
#[derive(Debug, Clone, Copy)]
pub enum Behaviour {
    /// Echo data back and acknowledge everything received.
    Echo,
    /// Fail the upgrade with this HTTP status.
    RejectHttp(u16),
    /// Accept the upgrade, then close with this code instead of a session id.
    CloseWith(u16),
    /// Accept the upgrade and never answer.
    Silent,
    /// Acknowledge without echoing; drop the transport once, on the n-th
    /// data frame (1-based), before recording it.
    DropOnFrame(usize),
    /// Send a session id and this payload, then close normally.
    SendThenClose(&'static [u8]),
    /// Send a session id, then close with this code.
    CloseAfterConnect(u16),
    /// Like `Echo`, but answer 403 unless this bearer token is presented.
    RequireToken(&'static str),
    /// Send a session id and the first `n` bytes of the payload, then drop
    /// the transport. On reconnect, resume from the client's `ack` and send
    /// the rest before closing normally.
    StreamThenDrop(&'static [u8], usize),
    /// Send a session id, drop the transport, and refuse the reconnect with
    /// this close code.
    RejectReconnect(u16),
    /// Record data but never acknowledge it.
    NoAck,
}

/// What the relay has seen.
#[derive(Debug, Default)]
pub struct RelayState {
    connects: AtomicUsize,
    reconnects: AtomicUsize,
    data_frames: AtomicUsize,
    client_ack: AtomicU64,
    received: Mutex<Vec<u8>>,
    last_reconnect_query: Mutex<Option<String>>,
    last_authorization: Mutex<Option<String>>,
}

impl RelayState {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn data_frames(&self) -> usize {
        self.data_frames.load(Ordering::SeqCst)
    }

    pub fn client_ack(&self) -> u64 {
        self.client_ack.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }

    pub fn last_reconnect_query(&self) -> Option<String> {
        self.last_reconnect_query.lock().unwrap().clone()
    }

    pub fn last_authorization(&self) -> Option<String> {
        self.last_authorization.lock().unwrap().clone()
    }

    pub async fn wait_for_received(&self, len: usize, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.received.lock().unwrap().len() < len && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn append(&self, payload: &[u8]) -> u64 {
        let mut received = self.received.lock().unwrap();
        received.extend_from_slice(payload);
        received.len() as u64
    }
}

pub struct FakeRelay {
    url: String,
    state: Arc<RelayState>,
    task: JoinHandle<()>,
}

impl FakeRelay {
    pub async fn start(behaviour: Behaviour) -> FakeRelay {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(RelayState::default());

        let task_state = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                tokio::spawn(serve_connection(tcp, behaviour, task_state.clone()));
            }
        });

        FakeRelay {
            url: format!("ws://{}/v4", addr),
            state,
            task,
        }
    }

    pub fn state(&self) -> Arc<RelayState> {
        self.state.clone()
    }

    pub fn resolver(&self) -> EndpointResolver {
        self.resolver_with(Arc::new(StaticToken::new(TOKEN)))
    }

    pub fn resolver_with(&self, credential: Arc<dyn Credential>) -> EndpointResolver {
        EndpointResolver::new(credential)
            .with_relay_url(&self.url)
            .unwrap()
    }

    pub fn connector(&self) -> RelayConnector {
        self.connector_with(StreamConfig::default())
    }

    pub fn connector_with(&self, config: StreamConfig) -> RelayConnector {
        let endpoint = self.resolver().resolve(&destination()).unwrap();
        RelayConnector::new(endpoint, config)
    }
}

impl Drop for FakeRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn destination() -> TunnelDestination {
    TunnelDestination::new(InstanceLocator::new("test-project", "zone-a", "vm-1"), 3389)
}

/// Hands out a stale token until refreshed.
#[derive(Debug, Default)]
pub struct RotatingToken {
    refreshed: AtomicBool,
    refreshes: AtomicUsize,
}

impl RotatingToken {
    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

impl Credential for RotatingToken {
    fn access_token(&self) -> BoxFuture<'_, TunnelResult<String>> {
        Box::pin(async move {
            if self.refreshed.load(Ordering::SeqCst) {
                Ok("fresh".to_string())
            } else {
                Ok("stale".to_string())
            }
        })
    }

    fn refresh(&self) -> BoxFuture<'_, TunnelResult<()>> {
        Box::pin(async move {
            self.refreshed.store(true, Ordering::SeqCst);
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

fn close_frame(code: u16) -> CloseFrame<'static> {
    CloseFrame {
        code: WsCloseCode::from(code),
        reason: "".into(),
    }
}

async fn send(ws: &mut WebSocketStream<TcpStream>, frame: Frame) {
    let _ = ws.send(Message::Binary(frame.encode().to_vec())).await;
}

async fn drain(ws: &mut WebSocketStream<TcpStream>) {
    while let Some(Ok(_)) = ws.next().await {}
}

async fn close_with(ws: &mut WebSocketStream<TcpStream>, code: u16) {
    let _ = ws.close(Some(close_frame(code))).await;
    drain(ws).await;
}

/// The `ack` parameter of a reconnect request.
fn query_ack(uri: &str) -> usize {
    uri.split(['?', '&'])
        .find_map(|param| param.strip_prefix("ack="))
        .and_then(|ack| ack.parse().ok())
        .unwrap_or(0)
}

async fn serve_connection(tcp: TcpStream, behaviour: Behaviour, state: Arc<RelayState>) {
    let mut uri = String::new();
    let mut authorization = None;

    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        uri = request.uri().to_string();
        authorization = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let rejection = match behaviour {
            Behaviour::RejectHttp(status) => Some(status),
            Behaviour::RequireToken(token)
                if authorization.as_deref() != Some(format!("Bearer {}", token).as_str()) =>
            {
                Some(403)
            }
            _ => None,
        };
        if let Some(status) = rejection {
            let mut error = ErrorResponse::new(Some("rejected".to_string()));
            *error.status_mut() = StatusCode::from_u16(status).unwrap();
            return Err(error);
        }

        response
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
        Ok(response)
    };

    let Ok(mut ws) = accept_hdr_async(tcp, callback).await else {
        return;
    };
    *state.last_authorization.lock().unwrap() = authorization;

    if uri.contains("/reconnect") {
        state.reconnects.fetch_add(1, Ordering::SeqCst);
        *state.last_reconnect_query.lock().unwrap() = Some(uri.clone());
        match behaviour {
            Behaviour::RejectReconnect(code) => return close_with(&mut ws, code).await,
            Behaviour::StreamThenDrop(payload, _) => {
                let resume_at = query_ack(&uri).min(payload.len());
                send(&mut ws, Frame::ReconnectSuccessAck(0)).await;
                send(&mut ws, Frame::Data(payload[resume_at..].to_vec().into())).await;
                return close_with(&mut ws, 1000).await;
            }
            _ => {}
        }
        let ack = state.received.lock().unwrap().len() as u64;
        send(&mut ws, Frame::ReconnectSuccessAck(ack)).await;
    } else {
        state.connects.fetch_add(1, Ordering::SeqCst);
        match behaviour {
            Behaviour::CloseWith(code) => return close_with(&mut ws, code).await,
            Behaviour::Silent => return drain(&mut ws).await,
            _ => {}
        }

        send(&mut ws, Frame::ConnectSuccessSid(SESSION_ID.to_string())).await;

        match behaviour {
            Behaviour::SendThenClose(payload) => {
                send(&mut ws, Frame::Data(payload.to_vec().into())).await;
                return close_with(&mut ws, 1000).await;
            }
            Behaviour::CloseAfterConnect(code) => return close_with(&mut ws, code).await,
            Behaviour::StreamThenDrop(payload, split) => {
                send(&mut ws, Frame::Data(payload[..split].to_vec().into())).await;
                return;
            }
            Behaviour::RejectReconnect(_) => return,
            _ => {}
        }
    }

    while let Some(Ok(message)) = ws.next().await {
        let data = match message {
            Message::Binary(data) => data,
            Message::Close(_) => break,
            _ => continue,
        };

        match Frame::decode(&data) {
            Ok(Frame::Data(payload)) => {
                let count = state.data_frames.fetch_add(1, Ordering::SeqCst) + 1;
                if let Behaviour::DropOnFrame(n) = behaviour {
                    if count == n {
                        // Vanish without a close handshake.
                        return;
                    }
                }

                let total = state.append(&payload);
                if matches!(behaviour, Behaviour::Echo | Behaviour::RequireToken(_)) {
                    send(&mut ws, Frame::Data(payload)).await;
                }
                if !matches!(behaviour, Behaviour::NoAck) {
                    send(&mut ws, Frame::Ack(total)).await;
                }
            }
            Ok(Frame::Ack(ack)) => state.client_ack.store(ack, Ordering::SeqCst),
            _ => break,
        }
    }
}
