//! Per-peer connection negotiation.
//!
//! Each remote participant gets one [`PeerNegotiator`] driving the
//! offer/answer/ICE exchange for a single `RTCPeerConnection`. The newcomer
//! side of a join notification initiates; the side that receives an
//! unsolicited offer responds. Candidates that arrive before a remote
//! description exists are buffered and flushed in arrival order once one is
//! applied.

pub mod config;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, RwLock as AsyncRwLock, mpsc};
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::protocol::SignalPayload;
use crate::protocol::peer::PeerMessage;
use crate::transport::{PeerEvent, SignalOutbox, TransportError};

use config::WebRtcConfig;

/// Negotiation progress for one peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Offering,
    AwaitingAnswer,
    HasRemoteOffer,
    Answering,
    Connected,
    Closed,
}

struct NegotiationInner {
    state: NegotiationState,
    /// Candidates received before any remote description; flushed in
    /// arrival order once one is applied.
    pending_candidates: Vec<RTCIceCandidateInit>,
    remote_description_set: bool,
}

/// One remote participant's connection. Owned by the peer registry, looked
/// up by peer identity, never duplicated.
pub struct PeerNegotiator {
    peer_id: String,
    channel_label: String,
    ordered: bool,
    pc: Arc<RTCPeerConnection>,
    inner: AsyncMutex<NegotiationInner>,
    /// Explicit slot for the data channel, empty from creation until the
    /// channel opens.
    channel: AsyncRwLock<Option<Arc<RTCDataChannel>>>,
    outbox: Arc<dyn SignalOutbox>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerNegotiator {
    /// Create the peer connection and wire up candidate/channel callbacks.
    /// The link starts `Idle`; call [`initiate`](Self::initiate) on the
    /// initiator side or feed it remote signals on the responder side.
    pub async fn connect(
        peer_id: String,
        config: &WebRtcConfig,
        outbox: Arc<dyn SignalOutbox>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<Self>, TransportError> {
        let api = APIBuilder::new().build();
        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(to_setup_error)?,
        );

        let negotiator = Arc::new(Self {
            peer_id: peer_id.clone(),
            channel_label: config.channel_label.clone(),
            ordered: config.ordered,
            pc: pc.clone(),
            inner: AsyncMutex::new(NegotiationInner {
                state: NegotiationState::Idle,
                pending_candidates: Vec::new(),
                remote_description_set: false,
            }),
            channel: AsyncRwLock::new(None),
            outbox: outbox.clone(),
            events: events.clone(),
        });

        // Trickle every locally gathered candidate to the peer via the relay.
        let outbox_for_ice = outbox.clone();
        let ice_peer = peer_id.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let outbox = outbox_for_ice.clone();
            let peer_id = ice_peer.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(json) => {
                        let signal = SignalPayload::IceCandidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                        };
                        if let Err(err) = outbox.send_signal(&peer_id, signal).await {
                            tracing::warn!(
                                target = "webrtc",
                                peer_id = %peer_id,
                                error = %err,
                                "failed to relay local ice candidate"
                            );
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "webrtc",
                            peer_id = %peer_id,
                            error = %err,
                            "failed to serialize local ice candidate"
                        );
                    }
                }
            })
        }));

        // Responder side: adopt the channel the initiator created.
        let weak = Arc::downgrade(&negotiator);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(negotiator) = weak.upgrade() {
                    tracing::debug!(
                        target = "webrtc",
                        peer_id = %negotiator.peer_id,
                        label = dc.label(),
                        "remote data channel received"
                    );
                    negotiator.adopt_channel(dc).await;
                }
            })
        }));

        let state_peer = peer_id.clone();
        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let peer_id = state_peer.clone();
            let events = state_events.clone();
            Box::pin(async move {
                tracing::debug!(
                    target = "webrtc",
                    peer_id = %peer_id,
                    state = ?state,
                    "peer connection state changed"
                );
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    let _ = events.send(PeerEvent::LinkFailed { peer_id });
                }
            })
        }));

        Ok(negotiator)
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub async fn state(&self) -> NegotiationState {
        self.inner.lock().await.state
    }

    /// Initiator path: create the data channel, produce an offer, and hand
    /// it to the relay. `Idle -> Offering -> AwaitingAnswer`.
    pub async fn initiate(self: &Arc<Self>) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        if inner.state != NegotiationState::Idle {
            tracing::debug!(
                target = "webrtc",
                peer_id = %self.peer_id,
                state = ?inner.state,
                "initiate skipped, link already negotiating"
            );
            return Ok(());
        }

        let init = RTCDataChannelInit {
            ordered: Some(self.ordered),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(&self.channel_label, Some(init))
            .await
            .map_err(to_setup_error)?;
        self.adopt_channel(dc).await;

        let offer = self.pc.create_offer(None).await.map_err(to_setup_error)?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(to_setup_error)?;
        inner.state = NegotiationState::Offering;

        self.outbox
            .send_signal(&self.peer_id, SignalPayload::Offer { sdp })
            .await?;
        inner.state = NegotiationState::AwaitingAnswer;
        tracing::debug!(
            target = "webrtc",
            peer_id = %self.peer_id,
            "offer sent, awaiting answer"
        );
        Ok(())
    }

    /// Apply one remote signal. Failures are logged and leave the link in
    /// its current state; a stalled negotiation is only recovered by a
    /// peer-left/peer-joined cycle.
    pub async fn handle_signal(self: &Arc<Self>, signal: SignalPayload) {
        let mut inner = self.inner.lock().await;
        if inner.state == NegotiationState::Closed {
            tracing::debug!(
                target = "webrtc",
                peer_id = %self.peer_id,
                kind = signal.kind(),
                "ignoring signal for closed link"
            );
            return;
        }

        match signal {
            SignalPayload::Offer { sdp } => self.handle_remote_offer(&mut inner, sdp).await,
            SignalPayload::Answer { sdp } => self.handle_remote_answer(&mut inner, sdp).await,
            SignalPayload::IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                let init = RTCIceCandidateInit {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                    username_fragment: None,
                };
                if !inner.remote_description_set {
                    tracing::debug!(
                        target = "webrtc",
                        peer_id = %self.peer_id,
                        buffered = inner.pending_candidates.len() + 1,
                        "buffering candidate until a remote description exists"
                    );
                    inner.pending_candidates.push(init);
                    return;
                }
                if let Err(err) = self.pc.add_ice_candidate(init).await {
                    tracing::warn!(
                        target = "webrtc",
                        peer_id = %self.peer_id,
                        error = %err,
                        "remote ice candidate rejected"
                    );
                }
            }
        }
    }

    async fn handle_remote_offer(&self, inner: &mut NegotiationInner, sdp: String) {
        inner.state = NegotiationState::HasRemoteOffer;
        let offer = match RTCSessionDescription::offer(sdp) {
            Ok(desc) => desc,
            Err(err) => {
                tracing::warn!(
                    target = "webrtc",
                    peer_id = %self.peer_id,
                    error = %err,
                    "malformed remote offer"
                );
                return;
            }
        };
        if let Err(err) = self.pc.set_remote_description(offer).await {
            tracing::warn!(
                target = "webrtc",
                peer_id = %self.peer_id,
                error = %err,
                "remote offer rejected"
            );
            return;
        }
        inner.remote_description_set = true;
        self.flush_pending_candidates(inner).await;

        let answer = match self.pc.create_answer(None).await {
            Ok(answer) => answer,
            Err(err) => {
                tracing::warn!(
                    target = "webrtc",
                    peer_id = %self.peer_id,
                    error = %err,
                    "failed to create answer"
                );
                return;
            }
        };
        let sdp = answer.sdp.clone();
        if let Err(err) = self.pc.set_local_description(answer).await {
            tracing::warn!(
                target = "webrtc",
                peer_id = %self.peer_id,
                error = %err,
                "failed to apply local answer"
            );
            return;
        }
        inner.state = NegotiationState::Answering;

        if let Err(err) = self
            .outbox
            .send_signal(&self.peer_id, SignalPayload::Answer { sdp })
            .await
        {
            tracing::warn!(
                target = "webrtc",
                peer_id = %self.peer_id,
                error = %err,
                "failed to relay answer"
            );
        }
        // The local answer is applied; the link is usable as soon as the
        // channel opens.
        inner.state = NegotiationState::Connected;
        tracing::info!(
            target = "webrtc",
            peer_id = %self.peer_id,
            "peer link negotiated (responder)"
        );
    }

    async fn handle_remote_answer(&self, inner: &mut NegotiationInner, sdp: String) {
        if inner.state != NegotiationState::AwaitingAnswer {
            tracing::warn!(
                target = "webrtc",
                peer_id = %self.peer_id,
                state = ?inner.state,
                "unexpected answer"
            );
            return;
        }
        let answer = match RTCSessionDescription::answer(sdp) {
            Ok(desc) => desc,
            Err(err) => {
                tracing::warn!(
                    target = "webrtc",
                    peer_id = %self.peer_id,
                    error = %err,
                    "malformed remote answer"
                );
                return;
            }
        };
        if let Err(err) = self.pc.set_remote_description(answer).await {
            tracing::warn!(
                target = "webrtc",
                peer_id = %self.peer_id,
                error = %err,
                "remote answer rejected"
            );
            return;
        }
        inner.remote_description_set = true;
        self.flush_pending_candidates(inner).await;
        inner.state = NegotiationState::Connected;
        tracing::info!(
            target = "webrtc",
            peer_id = %self.peer_id,
            "peer link negotiated (initiator)"
        );
    }

    async fn flush_pending_candidates(&self, inner: &mut NegotiationInner) {
        if inner.pending_candidates.is_empty() {
            return;
        }
        let drained: Vec<_> = inner.pending_candidates.drain(..).collect();
        tracing::debug!(
            target = "webrtc",
            peer_id = %self.peer_id,
            count = drained.len(),
            "applying buffered candidates"
        );
        for init in drained {
            if let Err(err) = self.pc.add_ice_candidate(init).await {
                tracing::warn!(
                    target = "webrtc",
                    peer_id = %self.peer_id,
                    error = %err,
                    "buffered ice candidate rejected"
                );
            }
        }
    }

    async fn adopt_channel(self: &Arc<Self>, dc: Arc<RTCDataChannel>) {
        let peer_id = self.peer_id.clone();
        let events = self.events.clone();
        let open_peer = peer_id.clone();
        let open_events = events.clone();
        dc.on_open(Box::new(move || {
            let peer_id = open_peer.clone();
            let events = open_events.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", peer_id = %peer_id, "data channel open");
                let _ = events.send(PeerEvent::ChannelOpen { peer_id });
            })
        }));

        let close_peer = peer_id.clone();
        dc.on_close(Box::new(move || {
            let peer_id = close_peer.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", peer_id = %peer_id, "data channel closed");
            })
        }));

        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let peer_id = peer_id.clone();
            let events = events.clone();
            Box::pin(async move {
                match PeerMessage::decode(&msg.data) {
                    Ok(message) => {
                        let _ = events.send(PeerEvent::Message { peer_id, message });
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "webrtc",
                            peer_id = %peer_id,
                            error = %err,
                            frame_len = msg.data.len(),
                            "dropping undecodable data channel frame"
                        );
                    }
                }
            })
        }));

        *self.channel.write().await = Some(dc);
    }

    /// Send one protocol message over the data channel. Refused until the
    /// link is `Connected` and the channel is open.
    pub async fn send_message(&self, message: &PeerMessage) -> Result<(), TransportError> {
        {
            let inner = self.inner.lock().await;
            if inner.state != NegotiationState::Connected {
                return Err(TransportError::NotConnected);
            }
        }
        let guard = self.channel.read().await;
        let dc = guard.as_ref().ok_or(TransportError::NotConnected)?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(TransportError::NotConnected);
        }
        let payload = message
            .encode()
            .map_err(|err| TransportError::Encode(err.to_string()))?;
        dc.send(&Bytes::from(payload))
            .await
            .map(|_| ())
            .map_err(|err| TransportError::Setup(err.to_string()))
    }

    /// Release all resources and move to `Closed`. Idempotent.
    pub async fn close(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == NegotiationState::Closed {
                return;
            }
            inner.state = NegotiationState::Closed;
            inner.pending_candidates.clear();
        }
        if let Some(dc) = self.channel.write().await.take() {
            let _ = dc.close().await;
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(
                target = "webrtc",
                peer_id = %self.peer_id,
                error = %err,
                "peer connection close reported an error"
            );
        }
        tracing::debug!(target = "webrtc", peer_id = %self.peer_id, "peer link closed");
    }

    #[cfg(test)]
    pub(crate) async fn pending_candidates(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .pending_candidates
            .iter()
            .map(|init| init.candidate.clone())
            .collect()
    }
}

fn to_setup_error(err: webrtc::Error) -> TransportError {
    TransportError::Setup(err.to_string())
}
