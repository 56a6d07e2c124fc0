//! Shared fixtures: an in-process relay, recording collaborators, and an
//! in-memory signal outbox for wiring negotiators back-to-back.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use url::Url;

use crate::model::{Screening, SeatPosition};
use crate::protocol::{ClientMessage, ServerMessage, SignalPayload};
use crate::session::SessionError;
use crate::session::seats::{
    JoinScreeningRequest, JoinScreeningResponse, ReleaseSeatResponse, SeatBackend,
    SelectSeatRequest, SelectSeatResponse,
};
use crate::sync::StreamingEngine;
use crate::transport::{SignalOutbox, TransportError};

pub(crate) use crate::session::identity::unsigned_token;

/// How the in-process relay behaves toward each websocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Accept, confirm authentication, then relay pushed frames.
    Normal,
    /// Accept but answer every authenticate with an error frame.
    RejectAuth,
    /// Accept the upgrade and drop the socket immediately.
    DropOnConnect,
}

#[derive(Clone)]
struct RelayState {
    mode: RelayMode,
    connections: Arc<AtomicUsize>,
    inbound: mpsc::UnboundedSender<ClientMessage>,
    outbound: broadcast::Sender<ServerMessage>,
}

/// A loopback relay good enough to drive the signaling channel: counts
/// connections, records every client frame, and lets tests push server
/// frames to all live sockets.
pub struct MockRelay {
    pub base_url: Url,
    pub connections: Arc<AtomicUsize>,
    pub received: tokio::sync::Mutex<mpsc::UnboundedReceiver<ClientMessage>>,
    outbound: broadcast::Sender<ServerMessage>,
    _server: tokio::task::JoinHandle<()>,
}

impl MockRelay {
    pub async fn spawn(mode: RelayMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
        let addr: SocketAddr = listener.local_addr().expect("relay addr");
        let connections = Arc::new(AtomicUsize::new(0));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, _) = broadcast::channel(64);

        let state = RelayState {
            mode,
            connections: Arc::clone(&connections),
            inbound: inbound_tx,
            outbound: outbound_tx.clone(),
        };
        let app = Router::new()
            .route("/ws/screenings/:id", get(ws_handler))
            .with_state(state);
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("relay serve");
        });

        Self {
            base_url: Url::parse(&format!("http://{addr}")).expect("relay url"),
            connections,
            received: tokio::sync::Mutex::new(inbound_rx),
            outbound: outbound_tx,
            _server: server,
        }
    }

    /// Push a server frame to every connected client.
    pub fn push(&self, message: ServerMessage) {
        let _ = self.outbound.send(message);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Wait (bounded) for the next client frame matching `pred`.
    pub async fn expect_frame<F>(&self, mut pred: F) -> ClientMessage
    where
        F: FnMut(&ClientMessage) -> bool,
    {
        let mut rx = self.received.lock().await;
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                let frame = rx.recv().await.expect("relay inbound closed");
                if pred(&frame) {
                    return frame;
                }
            }
        })
        .await
        .expect("timed out waiting for client frame")
    }
}

async fn ws_handler(State(state): State<RelayState>, upgrade: WebSocketUpgrade) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: RelayState) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    if state.mode == RelayMode::DropOnConnect {
        return;
    }
    let mut pushes = state.outbound.subscribe();
    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    let Ok(frame) = serde_json::from_str::<ClientMessage>(&text) else {
                        continue;
                    };
                    let reply = match (&frame, state.mode) {
                        (ClientMessage::Authenticate { .. }, RelayMode::Normal) => {
                            Some(ServerMessage::Authenticated { success: true })
                        }
                        (ClientMessage::Authenticate { .. }, RelayMode::RejectAuth) => {
                            Some(ServerMessage::Error {
                                message: "Invalid token".into(),
                            })
                        }
                        _ => None,
                    };
                    let _ = state.inbound.send(frame);
                    if let Some(reply) = reply {
                        let text = serde_json::to_string(&reply).expect("encode reply");
                        if socket.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
            push = pushes.recv() => match push {
                Ok(message) => {
                    let text = serde_json::to_string(&message).expect("encode push");
                    if socket.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
        }
    }
}

/// Seat backend that records call order instead of doing HTTP.
#[derive(Default)]
pub struct RecordingSeatBackend {
    pub ops: Mutex<Vec<String>>,
    pub fail_release: AtomicBool,
    pub fail_heartbeat: AtomicBool,
}

impl RecordingSeatBackend {
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }
}

#[async_trait]
impl SeatBackend for RecordingSeatBackend {
    async fn join_screening(
        &self,
        _base_url: &Url,
        request: &JoinScreeningRequest,
    ) -> Result<JoinScreeningResponse, SessionError> {
        self.ops.lock().push(format!("join {}", request.visitor_name));
        Ok(JoinScreeningResponse {
            token: unsigned_token("joined"),
            visitor_id: "joined".into(),
        })
    }

    async fn select_seat(
        &self,
        _base_url: &Url,
        _token: &str,
        _screening_id: &str,
        request: &SelectSeatRequest,
    ) -> Result<SelectSeatResponse, SessionError> {
        self.ops
            .lock()
            .push(format!("select {},{}", request.row_number, request.seat_number));
        Ok(SelectSeatResponse {
            success: true,
            seat: Some(SeatPosition {
                row: request.row_number,
                seat: request.seat_number,
                visitor_id: None,
            }),
        })
    }

    async fn release_seat(
        &self,
        _base_url: &Url,
        _token: &str,
        _screening_id: &str,
    ) -> Result<ReleaseSeatResponse, SessionError> {
        self.ops.lock().push("release".into());
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(SessionError::SeatAuthority { status: 500 });
        }
        Ok(ReleaseSeatResponse { success: true })
    }

    async fn heartbeat(
        &self,
        _base_url: &Url,
        _token: &str,
        _screening_id: &str,
    ) -> Result<(), SessionError> {
        self.ops.lock().push("heartbeat".into());
        if self.fail_heartbeat.load(Ordering::SeqCst) {
            return Err(SessionError::SeatAuthority { status: 503 });
        }
        Ok(())
    }

    async fn get_screening(
        &self,
        _base_url: &Url,
        _token: &str,
        screening_id: &str,
    ) -> Result<Screening, SessionError> {
        self.ops.lock().push("screening".into());
        Ok(Screening {
            id: screening_id.to_string(),
            title: "Test Feature".into(),
            magnet_link: "magnet:?xt=urn:btih:test".into(),
            seats: None,
        })
    }
}

/// Streaming engine that records every command issued to it.
pub struct RecordingEngine {
    position: Mutex<f64>,
    playing: Mutex<bool>,
    pub seeks: Mutex<Vec<f64>>,
    pub play_state_calls: AtomicUsize,
}

impl RecordingEngine {
    pub fn new(position: f64, playing: bool) -> Self {
        Self {
            position: Mutex::new(position),
            playing: Mutex::new(playing),
            seeks: Mutex::new(Vec::new()),
            play_state_calls: AtomicUsize::new(0),
        }
    }
}

impl StreamingEngine for RecordingEngine {
    fn position(&self) -> f64 {
        *self.position.lock()
    }

    fn playing(&self) -> bool {
        *self.playing.lock()
    }

    fn set_position(&self, seconds: f64) {
        *self.position.lock() = seconds;
        self.seeks.lock().push(seconds);
    }

    fn set_playing(&self, playing: bool) {
        *self.playing.lock() = playing;
        self.play_state_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Outbox that forwards `(target, signal)` pairs into a channel, letting
/// tests route signals between negotiators without a relay.
pub struct ChannelOutbox(pub mpsc::UnboundedSender<(String, SignalPayload)>);

#[async_trait]
impl SignalOutbox for ChannelOutbox {
    async fn send_signal(&self, target: &str, signal: SignalPayload) -> Result<(), TransportError> {
        self.0
            .send((target.to_string(), signal))
            .map_err(|_| TransportError::ChannelClosed)
    }
}
