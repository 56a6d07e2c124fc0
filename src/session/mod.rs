//! Session orchestration.
//!
//! [`SessionCoordinator`] owns the signaling channel, the peer registry and
//! the seat-lease heartbeat, routes every inbound relay message to the
//! right sub-component, and defines startup and teardown. No error in a
//! peer or heartbeat path ever aborts the session; only an authentication
//! rejection and an explicit screening end are terminal.

pub mod heartbeat;
pub mod identity;
pub mod registry;
pub mod seats;
pub mod signaling;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};

use crate::config::Config;
use crate::model::{
    ChatEntry, PlaybackSnapshot, SeatLease, SeatMap, SessionState, Visitor, VisitorPosition,
};
use crate::protocol::peer::PeerMessage;
use crate::protocol::{SCREENING_ENDED, ServerMessage};
use crate::sync::{PlaybackEvent, PlaybackSynchronizer, StreamingEngine};
use crate::transport::webrtc::config::WebRtcConfig;
use crate::transport::{PeerEvent, SignalOutbox, TransportError};
use crate::view::{ChatViewSink, PositionViewSink, SeatViewSink};

use heartbeat::SessionHeartbeat;
use identity::VisitorIdentity;
use registry::PeerRegistry;
use seats::{SeatAuthorityClient, SeatBackend};
use signaling::{SignalingChannel, SignalingEvent};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    #[error("authentication rejected by relay: {0}")]
    AuthRejected(String),
    #[error("seat authority returned status {status}")]
    SeatAuthority { status: u16 },
    #[error("seat request refused")]
    SeatRefused,
    #[error("http error: {0}")]
    Http(String),
    #[error("session closed")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Default)]
struct Observers {
    seat: Option<Arc<dyn SeatViewSink>>,
    chat: Option<Arc<dyn ChatViewSink>>,
    positions: Option<Arc<dyn PositionViewSink>>,
}

/// One viewer attending one screening.
pub struct SessionCoordinator {
    screening_id: String,
    identity: VisitorIdentity,
    signaling: Arc<SignalingChannel>,
    registry: Arc<PeerRegistry>,
    seats: SeatAuthorityClient,
    synchronizer: PlaybackSynchronizer,
    state: parking_lot::Mutex<SessionState>,
    /// At most one lease; the lock also serializes switch transitions so
    /// release-before-acquire is atomic from the caller's view.
    lease: AsyncMutex<Option<SeatLease>>,
    chat: parking_lot::Mutex<Vec<ChatEntry>>,
    positions: parking_lot::Mutex<HashMap<String, VisitorPosition>>,
    observers: parking_lot::RwLock<Observers>,
    heartbeat: parking_lot::Mutex<Option<SessionHeartbeat>>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SessionCoordinator {
    /// Join a screening: open and authenticate the signaling channel, spawn
    /// the dispatch loop, and start the seat-lease heartbeat. Resolves once
    /// the relay has confirmed authentication; a relay error before that is
    /// fatal to startup.
    pub async fn start(
        config: Config,
        screening_id: &str,
        token: &str,
        engine: Arc<dyn StreamingEngine>,
    ) -> Result<Arc<Self>, SessionError> {
        Self::start_inner(config, screening_id, token, engine, None).await
    }

    #[cfg(test)]
    pub(crate) async fn start_with_seat_backend(
        config: Config,
        screening_id: &str,
        token: &str,
        engine: Arc<dyn StreamingEngine>,
        backend: Arc<dyn SeatBackend>,
    ) -> Result<Arc<Self>, SessionError> {
        Self::start_inner(config, screening_id, token, engine, Some(backend)).await
    }

    async fn start_inner(
        config: Config,
        screening_id: &str,
        token: &str,
        engine: Arc<dyn StreamingEngine>,
        backend: Option<Arc<dyn SeatBackend>>,
    ) -> Result<Arc<Self>, SessionError> {
        let identity = VisitorIdentity::from_token(token)?;
        let base_url = config.relay_base_url()?;

        let signaling = SignalingChannel::connect(
            &base_url,
            screening_id,
            token.to_string(),
            config.reconnect_delay,
        )
        .await?;
        let relay_events = signaling.events().await?;

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let outbox: Arc<dyn SignalOutbox> = signaling.clone();
        let registry = Arc::new(PeerRegistry::new(
            identity.visitor_id.clone(),
            WebRtcConfig::default(),
            outbox,
            peer_tx.clone(),
        ));

        let seats = match backend {
            Some(backend) => SeatAuthorityClient::with_backend(
                base_url.clone(),
                screening_id.to_string(),
                token.to_string(),
                backend,
            ),
            None => SeatAuthorityClient::new(
                base_url.clone(),
                screening_id.to_string(),
                token.to_string(),
            )?,
        };

        let session = Arc::new(Self {
            screening_id: screening_id.to_string(),
            identity,
            signaling,
            registry,
            seats,
            synchronizer: PlaybackSynchronizer::new(engine),
            state: parking_lot::Mutex::new(SessionState::Connecting),
            lease: AsyncMutex::new(None),
            chat: parking_lot::Mutex::new(Vec::new()),
            positions: parking_lot::Mutex::new(HashMap::new()),
            observers: parking_lot::RwLock::new(Observers::default()),
            heartbeat: parking_lot::Mutex::new(None),
            peer_events: peer_tx,
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        let (auth_tx, auth_rx) = oneshot::channel();
        let loop_handle = tokio::spawn(Arc::clone(&session).run(relay_events, peer_rx, auth_tx));
        session.tasks.lock().push(loop_handle);

        match auth_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                session.teardown().await;
                return Err(err);
            }
            Err(_) => {
                session.teardown().await;
                return Err(SessionError::Closed);
            }
        }

        let heartbeat = SessionHeartbeat::start(
            config.heartbeat_interval,
            session.seats.clone(),
            Arc::clone(&session.signaling),
        );
        *session.heartbeat.lock() = Some(heartbeat);

        tracing::info!(
            target = "session",
            screening = %session.screening_id,
            visitor = %session.identity.visitor_id,
            "session active"
        );
        Ok(session)
    }

    pub fn visitor_id(&self) -> &str {
        &self.identity.visitor_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn chat_log(&self) -> Vec<ChatEntry> {
        self.chat.lock().clone()
    }

    pub fn remote_positions(&self) -> HashMap<String, VisitorPosition> {
        self.positions.lock().clone()
    }

    pub async fn seat_lease(&self) -> Option<SeatLease> {
        self.lease.lock().await.clone()
    }

    pub fn set_seat_view(&self, sink: Arc<dyn SeatViewSink>) {
        self.observers.write().seat = Some(sink);
    }

    pub fn set_chat_view(&self, sink: Arc<dyn ChatViewSink>) {
        self.observers.write().chat = Some(sink);
    }

    pub fn set_position_view(&self, sink: Arc<dyn PositionViewSink>) {
        self.observers.write().positions = Some(sink);
    }

    /// Claim a seat, releasing any currently held one first. Holding the
    /// lease lock across both calls makes the switch atomic for callers.
    pub async fn select_seat(&self, row: u32, seat: u32) -> Result<SeatLease, SessionError> {
        if self.state() == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        let mut lease = self.lease.lock().await;
        if lease.is_some() {
            self.seats.release().await?;
            *lease = None;
        }
        let response = self.seats.select(row, seat).await?;
        if !response.success {
            return Err(SessionError::SeatRefused);
        }
        let granted = SeatLease::new(row, seat);
        *lease = Some(granted.clone());
        tracing::info!(target = "session", row, seat, "seat lease acquired");
        Ok(granted)
    }

    /// Fetch the screening details (title, stream descriptor, seat grid)
    /// from the relay.
    pub async fn screening_details(&self) -> Result<crate::model::Screening, SessionError> {
        self.seats.screening().await
    }

    /// Give up the held seat, if any.
    pub async fn release_seat(&self) -> Result<(), SessionError> {
        let mut lease = self.lease.lock().await;
        if lease.is_none() {
            return Ok(());
        }
        self.seats.release().await?;
        *lease = None;
        tracing::info!(target = "session", "seat lease released");
        Ok(())
    }

    /// Append to the local chat log (synchronously, before any transmission,
    /// so local entries always precede later remote arrivals), then fan the
    /// message out to every connected peer.
    pub async fn send_chat(&self, text: &str) {
        let snapshot = {
            let mut log = self.chat.lock();
            log.push(ChatEntry::new(self.identity.visitor_id.clone(), text));
            log.clone()
        };
        self.notify_chat(&snapshot);
        self.registry
            .broadcast(&PeerMessage::Chat {
                text: text.to_string(),
            })
            .await;
    }

    /// Broadcast the viewer's pose. The local pose is not mirrored into the
    /// position map; that map tracks remote visitors only.
    pub async fn update_position(&self, position: [f64; 3], rotation: [f64; 3]) {
        self.registry
            .broadcast(&PeerMessage::Position { position, rotation })
            .await;
    }

    /// Called by the streaming engine collaborator on every local
    /// play/pause/seek; pushes the current snapshot to all peers. There is
    /// deliberately no periodic equivalent.
    pub async fn on_playback_event(&self, event: PlaybackEvent) {
        let snapshot = self.synchronizer.local_snapshot();
        tracing::debug!(
            target = "sync",
            event = ?event,
            position = snapshot.position,
            playing = snapshot.playing,
            "broadcasting local playback state"
        );
        self.registry
            .broadcast(&PeerMessage::Playback {
                position: snapshot.position,
                playing: snapshot.playing,
            })
            .await;
    }

    /// Tear the session down. Every step runs unconditionally: a failing
    /// seat release never blocks closing connections. Idempotent.
    pub async fn teardown(&self) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        tracing::info!(
            target = "session",
            screening = %self.screening_id,
            "tearing down session"
        );

        let had_lease = self.lease.lock().await.take().is_some();
        if had_lease {
            if let Err(err) = self.seats.release().await {
                tracing::warn!(
                    target = "session",
                    error = %err,
                    "seat release failed during teardown, continuing"
                );
            }
        }

        self.registry.close_all().await;
        self.signaling.close();
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.stop();
        }
    }

    async fn run(
        self: Arc<Self>,
        mut relay: mpsc::UnboundedReceiver<SignalingEvent>,
        mut peers: mpsc::UnboundedReceiver<PeerEvent>,
        auth_tx: oneshot::Sender<Result<(), SessionError>>,
    ) {
        let mut auth_tx = Some(auth_tx);
        loop {
            tokio::select! {
                event = relay.recv() => match event {
                    Some(event) => self.handle_relay_event(event, &mut auth_tx).await,
                    None => break,
                },
                event = peers.recv() => match event {
                    Some(event) => self.handle_peer_event(event).await,
                    None => break,
                },
            }
        }
        tracing::debug!(target = "session", "dispatch loop ended");
    }

    async fn handle_relay_event(
        &self,
        event: SignalingEvent,
        auth_tx: &mut Option<oneshot::Sender<Result<(), SessionError>>>,
    ) {
        match event {
            SignalingEvent::Connected => {
                tracing::debug!(target = "session", "relay link up");
            }
            SignalingEvent::Disconnected => {
                tracing::warn!(
                    target = "session",
                    "relay link lost; established peer links continue, reconnect scheduled"
                );
            }
            SignalingEvent::Message(message) => self.handle_relay_message(message, auth_tx).await,
        }
    }

    async fn handle_relay_message(
        &self,
        message: ServerMessage,
        auth_tx: &mut Option<oneshot::Sender<Result<(), SessionError>>>,
    ) {
        match message {
            ServerMessage::Authenticated { .. } => {
                {
                    let mut state = self.state.lock();
                    if *state == SessionState::Connecting {
                        *state = SessionState::Active;
                    }
                }
                tracing::debug!(target = "session", "relay authenticated");
                if let Some(tx) = auth_tx.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            ServerMessage::Error { message } => {
                if let Some(tx) = auth_tx.take() {
                    tracing::error!(
                        target = "session",
                        error = %message,
                        "relay rejected session startup"
                    );
                    let _ = tx.send(Err(SessionError::AuthRejected(message)));
                } else {
                    tracing::warn!(target = "session", error = %message, "relay error");
                }
            }
            ServerMessage::VisitorJoined { visitor } => self.handle_visitor_joined(visitor).await,
            ServerMessage::VisitorLeft { visitor_id } => {
                self.handle_visitor_left(&visitor_id).await;
            }
            ServerMessage::WebrtcSignal { from, signal } => {
                tracing::debug!(
                    target = "session",
                    peer_id = %from,
                    kind = signal.kind(),
                    "routing negotiation payload"
                );
                match self.registry.ensure(&from).await {
                    Ok(link) => link.handle_signal(signal).await,
                    Err(err) => {
                        tracing::warn!(
                            target = "session",
                            peer_id = %from,
                            error = %err,
                            "could not create peer link for signal"
                        );
                    }
                }
            }
            ServerMessage::SeatUpdate(map) => self.handle_seat_update(map).await,
            ServerMessage::ScreeningStatus { status } => {
                if status == SCREENING_ENDED {
                    tracing::info!(target = "session", "screening ended");
                    self.teardown().await;
                } else {
                    tracing::debug!(target = "session", status = %status, "screening status");
                }
            }
        }
    }

    async fn handle_visitor_joined(&self, visitor: Visitor) {
        tracing::info!(
            target = "session",
            peer_id = %visitor.id,
            name = %visitor.name,
            "visitor joined"
        );
        match self.registry.adopt_joined(&visitor.id).await {
            Ok(Some(link)) => {
                if let Err(err) = link.initiate().await {
                    tracing::warn!(
                        target = "session",
                        peer_id = %visitor.id,
                        error = %err,
                        "failed to initiate peer link"
                    );
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    target = "session",
                    peer_id = %visitor.id,
                    error = %err,
                    "failed to create peer link"
                );
            }
        }
    }

    async fn handle_visitor_left(&self, visitor_id: &str) {
        tracing::info!(target = "session", peer_id = %visitor_id, "visitor left");
        if let Some(link) = self.registry.remove(visitor_id).await {
            link.close().await;
        }
        let snapshot = {
            let mut positions = self.positions.lock();
            if positions.remove(visitor_id).is_none() {
                None
            } else {
                Some(positions.clone())
            }
        };
        if let Some(snapshot) = snapshot {
            self.notify_positions(&snapshot);
        }
    }

    async fn handle_seat_update(&self, map: SeatMap) {
        {
            let mut lease = self.lease.lock().await;
            if let Some(current) = lease.as_ref() {
                if !map.holds(&self.identity.visitor_id, current.row, current.seat) {
                    tracing::info!(
                        target = "session",
                        row = current.row,
                        seat = current.seat,
                        "seat lease no longer held according to relay, dropping it"
                    );
                    *lease = None;
                }
            }
        }
        let sink = self.observers.read().seat.clone();
        if let Some(sink) = sink {
            sink.seats_updated(&map);
        }
    }

    async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Message { peer_id, message } => match message {
                PeerMessage::Chat { text } => {
                    let snapshot = {
                        let mut log = self.chat.lock();
                        log.push(ChatEntry::new(peer_id, text));
                        log.clone()
                    };
                    self.notify_chat(&snapshot);
                }
                PeerMessage::Position { position, rotation } => {
                    let snapshot = {
                        let mut positions = self.positions.lock();
                        positions.insert(peer_id, VisitorPosition { position, rotation });
                        positions.clone()
                    };
                    self.notify_positions(&snapshot);
                }
                PeerMessage::Playback { position, playing } => {
                    self.synchronizer
                        .observe_remote(&peer_id, PlaybackSnapshot { position, playing });
                }
            },
            PeerEvent::ChannelOpen { peer_id } => {
                tracing::debug!(target = "session", peer_id = %peer_id, "peer channel open");
            }
            PeerEvent::LinkFailed { peer_id } => {
                if let Some(link) = self.registry.remove(&peer_id).await {
                    link.close().await;
                    tracing::info!(
                        target = "session",
                        peer_id = %peer_id,
                        "peer link evicted after transport failure"
                    );
                }
            }
        }
    }

    fn notify_chat(&self, log: &[ChatEntry]) {
        let sink = self.observers.read().chat.clone();
        if let Some(sink) = sink {
            sink.chat_updated(log);
        }
    }

    fn notify_positions(&self, positions: &HashMap<String, VisitorPosition>) {
        let sink = self.observers.read().positions.clone();
        if let Some(sink) = sink {
            sink.positions_updated(positions);
        }
    }

    #[cfg(test)]
    pub(crate) fn peer_event_sender(&self) -> mpsc::UnboundedSender<PeerEvent> {
        self.peer_events.clone()
    }

    #[cfg(test)]
    pub(crate) fn signaling(&self) -> &Arc<SignalingChannel> {
        &self.signaling
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    #[cfg(test)]
    pub(crate) fn heartbeat_stopped(&self) -> bool {
        self.heartbeat
            .lock()
            .as_ref()
            .map(|hb| hb.is_stopped())
            .unwrap_or(true)
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}
