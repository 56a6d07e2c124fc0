//! Control connection to the relay.
//!
//! One websocket carries every relay frame. On any closure, clean or not,
//! the channel schedules a full reconnect (including re-authentication)
//! after a fixed delay and retries forever; losing the relay is meant to be
//! transparent to the viewer. Established peer links keep working while the
//! relay is away, but new joins cannot be discovered.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use url::Url;

use crate::protocol::{ClientMessage, ServerMessage, SignalPayload};
use crate::transport::{SignalOutbox, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the exclusive consumer of [`SignalingChannel::events`] receives:
/// decoded relay frames plus connection edges so the session can observe
/// reconnects.
#[derive(Debug)]
pub enum SignalingEvent {
    Connected,
    Disconnected,
    Message(ServerMessage),
}

pub struct SignalingChannel {
    token: String,
    current: parking_lot::RwLock<Option<mpsc::UnboundedSender<ClientMessage>>>,
    closed: AtomicBool,
    events_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Open the control connection and queue the authentication frame.
    /// Resolves once the transport is open; the authentication outcome
    /// arrives later as a distinct `authenticated`/`error` relay message.
    pub async fn connect(
        base_url: &Url,
        screening_id: &str,
        token: String,
        reconnect_delay: Duration,
    ) -> Result<Arc<Self>, TransportError> {
        let ws_url = derive_websocket_url(base_url, screening_id)?;
        let (ws, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|err| TransportError::Setup(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "signaling", url = %ws_url, "relay websocket connected");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            token,
            current: parking_lot::RwLock::new(None),
            closed: AtomicBool::new(false),
            events_rx: AsyncMutex::new(Some(events_rx)),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        let supervisor = tokio::spawn(supervise(
            Arc::clone(&channel),
            ws_url,
            reconnect_delay,
            events_tx,
            ws,
        ));
        channel.tasks.lock().push(supervisor);
        Ok(channel)
    }

    /// Best-effort delivery of one control frame. Returns `ChannelClosed`
    /// (never silently drops) while the link is down.
    pub fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        let guard = self.current.read();
        match guard.as_ref() {
            Some(tx) => tx.send(message).map_err(|_| TransportError::ChannelClosed),
            None => {
                tracing::warn!(
                    target = "signaling",
                    "dropping outbound frame, relay link is down"
                );
                Err(TransportError::ChannelClosed)
            }
        }
    }

    /// Take the exclusive event stream. Can only be taken once.
    pub async fn events(&self) -> Result<mpsc::UnboundedReceiver<SignalingEvent>, TransportError> {
        self.events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| TransportError::Setup("signaling event stream already taken".into()))
    }

    pub fn is_connected(&self) -> bool {
        self.current.read().is_some()
    }

    /// Stop reconnecting and drop the link. Ends the event stream.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *self.current.write() = None;
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        tracing::debug!(target = "signaling", "signaling channel closed");
    }

    fn install_sender(&self, tx: mpsc::UnboundedSender<ClientMessage>) {
        *self.current.write() = Some(tx);
    }

    fn clear_sender(&self) {
        *self.current.write() = None;
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

#[async_trait]
impl SignalOutbox for SignalingChannel {
    async fn send_signal(&self, target: &str, signal: SignalPayload) -> Result<(), TransportError> {
        self.send(ClientMessage::WebrtcSignal {
            target: target.to_string(),
            signal,
        })
    }
}

async fn supervise(
    channel: Arc<SignalingChannel>,
    url: Url,
    reconnect_delay: Duration,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    first: WsStream,
) {
    let mut pending = Some(first);
    loop {
        if channel.closed.load(Ordering::SeqCst) {
            break;
        }
        let ws = match pending.take() {
            Some(ws) => ws,
            None => match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    tracing::info!(target = "signaling", "reconnected to relay");
                    ws
                }
                Err(err) => {
                    tracing::warn!(
                        target = "signaling",
                        error = %err,
                        delay = ?reconnect_delay,
                        "reconnect attempt failed, retrying"
                    );
                    tokio::time::sleep(reconnect_delay).await;
                    continue;
                }
            },
        };

        run_connection(&channel, ws, &events_tx).await;

        if channel.closed.load(Ordering::SeqCst) {
            break;
        }
        if events_tx.send(SignalingEvent::Disconnected).is_err() {
            break;
        }
        tracing::info!(
            target = "signaling",
            delay = ?reconnect_delay,
            "relay connection lost, scheduling reconnect"
        );
        tokio::time::sleep(reconnect_delay).await;
    }
}

/// Pump one websocket incarnation until it dies. Authenticates first, then
/// forwards decoded frames to the event stream.
async fn run_connection(
    channel: &Arc<SignalingChannel>,
    ws: WsStream,
    events_tx: &mpsc::UnboundedSender<SignalingEvent>,
) {
    let (mut ws_write, mut ws_read) = ws.split();
    let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();

    channel.install_sender(send_tx.clone());
    let _ = send_tx.send(ClientMessage::Authenticate {
        token: channel.token.clone(),
    });
    drop(send_tx);
    let _ = events_tx.send(SignalingEvent::Connected);

    let writer = tokio::spawn(async move {
        while let Some(message) = send_rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(text) => {
                    if ws_write.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        target = "signaling",
                        error = %err,
                        "failed to encode outbound frame"
                    );
                }
            }
        }
    });

    while let Some(msg) = ws_read.next().await {
        match msg {
            Ok(Message::Text(text)) => dispatch_frame(&text, events_tx),
            Ok(Message::Binary(data)) => {
                if let Ok(text) = String::from_utf8(data) {
                    dispatch_frame(&text, events_tx);
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(target = "signaling", error = %err, "relay websocket error");
                break;
            }
        }
    }

    channel.clear_sender();
    writer.abort();
}

fn dispatch_frame(text: &str, events_tx: &mpsc::UnboundedSender<SignalingEvent>) {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(message) => {
            let _ = events_tx.send(SignalingEvent::Message(message));
        }
        Err(err) => {
            tracing::warn!(
                target = "signaling",
                error = %err,
                "rejecting unknown or malformed relay frame"
            );
        }
    }
}

fn derive_websocket_url(base: &Url, screening_id: &str) -> Result<Url, TransportError> {
    let mut ws = base.clone();
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(TransportError::Setup(format!(
                "unsupported relay scheme: {other}"
            )));
        }
    };
    ws.set_scheme(scheme)
        .map_err(|_| TransportError::Setup("invalid websocket scheme".into()))?;
    ws.set_path(&format!("ws/screenings/{screening_id}"));
    ws.set_query(None);
    ws.set_fragment(None);
    Ok(ws)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_from_http_base() {
        let base = Url::parse("http://127.0.0.1:8080").unwrap();
        let ws = derive_websocket_url(&base, "feature-night").unwrap();
        assert_eq!(ws.as_str(), "ws://127.0.0.1:8080/ws/screenings/feature-night");
    }

    #[test]
    fn websocket_url_from_https_base() {
        let base = Url::parse("https://relay.example.com/").unwrap();
        let ws = derive_websocket_url(&base, "s1").unwrap();
        assert_eq!(ws.scheme(), "wss");
        assert_eq!(ws.path(), "/ws/screenings/s1");
    }
}
