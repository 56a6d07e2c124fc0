pub mod webrtc;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::SignalPayload;
use crate::protocol::peer::PeerMessage;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("peer link not connected")]
    NotConnected,
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Where a peer link hands locally produced offers/answers/candidates for
/// relay to the named peer. The session's signaling channel implements this;
/// tests wire links back-to-back with an in-memory pair.
#[async_trait]
pub trait SignalOutbox: Send + Sync {
    async fn send_signal(&self, target: &str, signal: SignalPayload) -> Result<(), TransportError>;
}

/// Notifications a peer link emits toward the session event loop.
#[derive(Debug)]
pub enum PeerEvent {
    /// A decoded data-channel message from the named peer.
    Message {
        peer_id: String,
        message: PeerMessage,
    },
    /// The peer's data channel became usable.
    ChannelOpen { peer_id: String },
    /// The underlying connection failed or closed; the link should be
    /// evicted and left for a future join/offer to re-establish.
    LinkFailed { peer_id: String },
}
