//! Ownership of peer links.
//!
//! Maps peer identity to its negotiator. Links are created when the relay
//! announces a join or when an unsolicited signal names an unknown peer,
//! and evicted when the peer leaves or the link dies. An identity is never
//! duplicated: creation happens under the write lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock as AsyncRwLock, mpsc};

use crate::protocol::peer::PeerMessage;
use crate::transport::webrtc::config::WebRtcConfig;
use crate::transport::webrtc::PeerNegotiator;
use crate::transport::{PeerEvent, SignalOutbox, TransportError};

pub struct PeerRegistry {
    local_id: String,
    webrtc: WebRtcConfig,
    outbox: Arc<dyn SignalOutbox>,
    events: mpsc::UnboundedSender<PeerEvent>,
    links: AsyncRwLock<HashMap<String, Arc<PeerNegotiator>>>,
}

impl PeerRegistry {
    pub fn new(
        local_id: String,
        webrtc: WebRtcConfig,
        outbox: Arc<dyn SignalOutbox>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            local_id,
            webrtc,
            outbox,
            events,
            links: AsyncRwLock::new(HashMap::new()),
        }
    }

    /// Create a link for a newly joined peer. Returns `None` for our own
    /// identity or an identity that already has a live link.
    pub async fn adopt_joined(
        &self,
        peer_id: &str,
    ) -> Result<Option<Arc<PeerNegotiator>>, TransportError> {
        if peer_id == self.local_id {
            return Ok(None);
        }
        let mut links = self.links.write().await;
        if links.contains_key(peer_id) {
            tracing::debug!(
                target = "session",
                peer_id = %peer_id,
                "join announced for an already-registered peer"
            );
            return Ok(None);
        }
        let link = PeerNegotiator::connect(
            peer_id.to_string(),
            &self.webrtc,
            self.outbox.clone(),
            self.events.clone(),
        )
        .await?;
        links.insert(peer_id.to_string(), Arc::clone(&link));
        Ok(Some(link))
    }

    /// Look up the link for `peer_id`, creating one on the fly for an
    /// unsolicited signal from an unknown peer.
    pub async fn ensure(&self, peer_id: &str) -> Result<Arc<PeerNegotiator>, TransportError> {
        {
            let links = self.links.read().await;
            if let Some(link) = links.get(peer_id) {
                return Ok(Arc::clone(link));
            }
        }
        let mut links = self.links.write().await;
        // Re-check under the write lock; a concurrent caller may have won.
        if let Some(link) = links.get(peer_id) {
            return Ok(Arc::clone(link));
        }
        let link = PeerNegotiator::connect(
            peer_id.to_string(),
            &self.webrtc,
            self.outbox.clone(),
            self.events.clone(),
        )
        .await?;
        links.insert(peer_id.to_string(), Arc::clone(&link));
        tracing::debug!(
            target = "session",
            peer_id = %peer_id,
            "peer link created for unsolicited signal"
        );
        Ok(link)
    }

    pub async fn get(&self, peer_id: &str) -> Option<Arc<PeerNegotiator>> {
        self.links.read().await.get(peer_id).cloned()
    }

    pub async fn remove(&self, peer_id: &str) -> Option<Arc<PeerNegotiator>> {
        self.links.write().await.remove(peer_id)
    }

    pub async fn len(&self) -> usize {
        self.links.read().await.len()
    }

    pub async fn contains(&self, peer_id: &str) -> bool {
        self.links.read().await.contains_key(peer_id)
    }

    /// Send one protocol message to every peer with an open channel. Links
    /// that are still negotiating are skipped silently; that is expected.
    pub async fn broadcast(&self, message: &PeerMessage) {
        let links: Vec<_> = {
            let guard = self.links.read().await;
            guard.values().cloned().collect()
        };
        for link in links {
            match link.send_message(message).await {
                Ok(()) => {}
                Err(TransportError::NotConnected) => {}
                Err(err) => {
                    tracing::debug!(
                        target = "session",
                        peer_id = %link.peer_id(),
                        error = %err,
                        "broadcast to peer failed"
                    );
                }
            }
        }
    }

    /// Close and evict every link.
    pub async fn close_all(&self) {
        let links: Vec<_> = {
            let mut guard = self.links.write().await;
            guard.drain().map(|(_, link)| link).collect()
        };
        for link in links {
            link.close().await;
        }
    }
}
