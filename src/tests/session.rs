//! Session-level behavior: startup authentication, seat-switch atomicity,
//! heartbeat on both paths, chat ordering, lease reconciliation, and total
//! teardown.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::sleep;

use crate::config::Config;
use crate::model::{SeatMap, SeatPosition, SessionState};
use crate::protocol::peer::PeerMessage;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::{SessionCoordinator, SessionError};
use crate::sync::HeadlessScreen;
use crate::sync::StreamingEngine;
use crate::tests::support::{
    MockRelay, RecordingEngine, RecordingSeatBackend, RelayMode, unsigned_token,
};
use crate::transport::PeerEvent;
use crate::view::SeatViewSink;

fn test_config(relay: &MockRelay) -> Config {
    Config {
        relay_server: relay.base_url.to_string(),
        reconnect_delay: Duration::from_millis(50),
        heartbeat_interval: Duration::from_millis(50),
    }
}

async fn start_session(
    relay: &MockRelay,
    backend: Arc<RecordingSeatBackend>,
) -> Arc<SessionCoordinator> {
    SessionCoordinator::start_with_seat_backend(
        test_config(relay),
        "feature-night",
        &unsigned_token("v-self"),
        Arc::new(HeadlessScreen::new()),
        backend,
    )
    .await
    .expect("session start")
}

#[tokio::test]
async fn startup_fails_when_relay_rejects_authentication() {
    let relay = MockRelay::spawn(RelayMode::RejectAuth).await;
    let backend = Arc::new(RecordingSeatBackend::default());
    let result = SessionCoordinator::start_with_seat_backend(
        test_config(&relay),
        "feature-night",
        &unsigned_token("v-self"),
        Arc::new(HeadlessScreen::new()),
        backend,
    )
    .await;
    let err = match result {
        Ok(_) => panic!("expected auth rejection"),
        Err(err) => err,
    };
    match err {
        SessionError::AuthRejected(message) => assert_eq!(message, "Invalid token"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn seat_switch_releases_before_selecting() {
    let relay = MockRelay::spawn(RelayMode::Normal).await;
    let backend = Arc::new(RecordingSeatBackend::default());
    let session = start_session(&relay, Arc::clone(&backend)).await;

    session.select_seat(1, 1).await.expect("first seat");
    session.select_seat(2, 3).await.expect("second seat");

    let seat_ops: Vec<_> = backend
        .ops()
        .into_iter()
        .filter(|op| op != "heartbeat")
        .collect();
    assert_eq!(seat_ops, vec!["select 1,1", "release", "select 2,3"]);

    let lease = session.seat_lease().await.expect("lease");
    assert_eq!((lease.row, lease.seat), (2, 3));

    session.teardown().await;
}

#[tokio::test]
async fn heartbeat_fires_on_both_paths_and_survives_failures() {
    let relay = MockRelay::spawn(RelayMode::Normal).await;
    let backend = Arc::new(RecordingSeatBackend::default());
    backend.fail_heartbeat.store(true, Ordering::SeqCst);
    let session = start_session(&relay, Arc::clone(&backend)).await;

    // HTTP path keeps ticking even though every call fails.
    sleep(Duration::from_millis(400)).await;
    let http_beats = backend.ops().iter().filter(|op| *op == "heartbeat").count();
    assert!(http_beats >= 2, "expected repeated lease renewals, saw {http_beats}");

    // Signaling path delivers heartbeat frames too.
    relay
        .expect_frame(|frame| matches!(frame, ClientMessage::Heartbeat {}))
        .await;

    session.teardown().await;
}

#[tokio::test]
async fn chat_log_orders_local_sends_before_later_remote_arrivals() {
    let relay = MockRelay::spawn(RelayMode::Normal).await;
    let backend = Arc::new(RecordingSeatBackend::default());
    let session = start_session(&relay, backend).await;

    session.send_chat("hi").await;
    session
        .peer_event_sender()
        .send(PeerEvent::Message {
            peer_id: "v-other".into(),
            message: PeerMessage::Chat { text: "yo".into() },
        })
        .expect("inject remote chat");
    sleep(Duration::from_millis(100)).await;

    let log = session.chat_log();
    assert_eq!(log.len(), 2);
    assert_eq!((log[0].sender.as_str(), log[0].text.as_str()), ("v-self", "hi"));
    assert_eq!((log[1].sender.as_str(), log[1].text.as_str()), ("v-other", "yo"));
    assert!(log[0].received_at <= log[1].received_at);

    session.teardown().await;
}

#[derive(Default)]
struct RecordingSeatView {
    snapshots: Mutex<Vec<SeatMap>>,
}

impl SeatViewSink for RecordingSeatView {
    fn seats_updated(&self, seats: &SeatMap) {
        self.snapshots.lock().push(seats.clone());
    }
}

#[tokio::test]
async fn seat_update_reconciles_lease_and_feeds_the_view() {
    let relay = MockRelay::spawn(RelayMode::Normal).await;
    let backend = Arc::new(RecordingSeatBackend::default());
    let session = start_session(&relay, backend).await;
    let view = Arc::new(RecordingSeatView::default());
    session.set_seat_view(view.clone());

    session.select_seat(1, 1).await.expect("seat");

    // Occupancy still naming us keeps the lease.
    relay.push(ServerMessage::SeatUpdate(SeatMap {
        rows: 5,
        seats_per_row: 10,
        occupied: vec![SeatPosition {
            row: 1,
            seat: 1,
            visitor_id: Some("v-self".into()),
        }],
    }));
    sleep(Duration::from_millis(100)).await;
    assert!(session.seat_lease().await.is_some());

    // Relay-side expiry: the snapshot no longer shows our claim.
    relay.push(ServerMessage::SeatUpdate(SeatMap {
        rows: 5,
        seats_per_row: 10,
        occupied: vec![],
    }));
    sleep(Duration::from_millis(100)).await;
    assert!(session.seat_lease().await.is_none());

    assert_eq!(view.snapshots.lock().len(), 2);

    session.teardown().await;
}

#[tokio::test]
async fn teardown_is_total_even_when_seat_release_fails() {
    let relay = MockRelay::spawn(RelayMode::Normal).await;
    let backend = Arc::new(RecordingSeatBackend::default());
    let session = start_session(&relay, Arc::clone(&backend)).await;

    session.select_seat(0, 0).await.expect("seat");
    session
        .registry()
        .ensure("v-peer")
        .await
        .expect("peer link");
    assert_eq!(session.registry().len().await, 1);

    backend.fail_release.store(true, Ordering::SeqCst);
    session.teardown().await;

    // The failing release was attempted and did not stop the rest.
    assert!(backend.ops().iter().any(|op| op == "release"));
    assert_eq!(session.registry().len().await, 0);
    assert!(session.signaling().send(ClientMessage::Heartbeat {}).is_err());
    assert!(session.heartbeat_stopped());
    assert_eq!(session.state(), SessionState::Closed);

    // Teardown is idempotent.
    session.teardown().await;
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn screening_end_tears_the_session_down() {
    let relay = MockRelay::spawn(RelayMode::Normal).await;
    let backend = Arc::new(RecordingSeatBackend::default());
    let session = start_session(&relay, backend).await;

    relay.push(ServerMessage::ScreeningStatus {
        status: "ended".into(),
    });
    sleep(Duration::from_millis(200)).await;

    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.heartbeat_stopped());
}

#[tokio::test]
async fn remote_playback_corrections_avoid_redundant_play_calls() {
    let relay = MockRelay::spawn(RelayMode::Normal).await;
    let backend = Arc::new(RecordingSeatBackend::default());
    let engine = Arc::new(RecordingEngine::new(10.0, true));
    let session = SessionCoordinator::start_with_seat_backend(
        test_config(&relay),
        "feature-night",
        &unsigned_token("v-self"),
        engine.clone(),
        backend,
    )
    .await
    .expect("session start");

    // Drift below threshold: nothing happens.
    session
        .peer_event_sender()
        .send(PeerEvent::Message {
            peer_id: "v-other".into(),
            message: PeerMessage::Playback {
                position: 12.0,
                playing: true,
            },
        })
        .expect("inject");
    sleep(Duration::from_millis(100)).await;
    assert!(engine.seeks.lock().is_empty());

    // Past threshold with matching play state: seek only, no play/pause.
    session
        .peer_event_sender()
        .send(PeerEvent::Message {
            peer_id: "v-other".into(),
            message: PeerMessage::Playback {
                position: 16.1,
                playing: true,
            },
        })
        .expect("inject");
    sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.seeks.lock().clone(), vec![16.1]);
    assert_eq!(engine.play_state_calls.load(Ordering::SeqCst), 0);

    // Past threshold with a disagreeing flag reconciles it once.
    session
        .peer_event_sender()
        .send(PeerEvent::Message {
            peer_id: "v-other".into(),
            message: PeerMessage::Playback {
                position: 30.0,
                playing: false,
            },
        })
        .expect("inject");
    sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.play_state_calls.load(Ordering::SeqCst), 1);
    assert!(!engine.playing());

    session.teardown().await;
}
