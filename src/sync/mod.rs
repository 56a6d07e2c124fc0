//! Playback drift correction.
//!
//! Remote snapshots are compared against the local transport position; only
//! drift beyond a fixed threshold is corrected, so minor divergence never
//! causes visible jitter. There is no periodic playback broadcast: only
//! local play/pause/seek events push state to peers, so two idle viewers
//! can drift until one of them touches the controls.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::model::PlaybackSnapshot;

/// Drift beyond this many seconds triggers a correction.
pub const DRIFT_THRESHOLD_SECS: f64 = 5.0;

/// Local playback surface events that trigger an outbound state broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    Play,
    Pause,
    Seek,
}

/// The external streaming engine, reduced to the playback surface the core
/// needs: read position/flag, seek, and flip play/pause. Transfer,
/// buffering, and rendering live entirely on the other side of this trait.
pub trait StreamingEngine: Send + Sync {
    /// Point the engine at a stream descriptor (typically a magnet link).
    /// Fetching and rendering are the engine's business entirely.
    fn attach(&self, _descriptor: &str) {}
    fn position(&self) -> f64;
    fn playing(&self) -> bool;
    fn set_position(&self, seconds: f64);
    fn set_playing(&self, playing: bool);
}

pub struct PlaybackSynchronizer {
    engine: Arc<dyn StreamingEngine>,
}

impl PlaybackSynchronizer {
    pub fn new(engine: Arc<dyn StreamingEngine>) -> Self {
        Self { engine }
    }

    /// Apply a remote snapshot. Corrects position and reconciles the
    /// play/pause flag only when drift exceeds the threshold, and only
    /// flips play state when it actually disagrees.
    pub fn observe_remote(&self, peer_id: &str, snapshot: PlaybackSnapshot) {
        let local = self.engine.position();
        let drift = (local - snapshot.position).abs();
        if drift <= DRIFT_THRESHOLD_SECS {
            tracing::trace!(
                target = "sync",
                peer_id = %peer_id,
                drift,
                "drift within tolerance"
            );
            return;
        }
        tracing::info!(
            target = "sync",
            peer_id = %peer_id,
            local,
            remote = snapshot.position,
            "correcting playback drift"
        );
        self.engine.set_position(snapshot.position);
        if snapshot.playing != self.engine.playing() {
            self.engine.set_playing(snapshot.playing);
        }
    }

    /// Current local state, broadcast to peers on play/pause/seek.
    pub fn local_snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            position: self.engine.position(),
            playing: self.engine.playing(),
        }
    }
}

/// Playback surface for running without a real streaming engine attached:
/// tracks position/flag in memory and logs corrections.
pub struct HeadlessScreen {
    state: Mutex<PlaybackSnapshot>,
}

impl HeadlessScreen {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PlaybackSnapshot {
                position: 0.0,
                playing: false,
            }),
        }
    }
}

impl Default for HeadlessScreen {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingEngine for HeadlessScreen {
    fn attach(&self, descriptor: &str) {
        tracing::info!(target = "sync", descriptor, "stream descriptor attached");
    }

    fn position(&self) -> f64 {
        self.state.lock().position
    }

    fn playing(&self) -> bool {
        self.state.lock().playing
    }

    fn set_position(&self, seconds: f64) {
        self.state.lock().position = seconds;
        tracing::info!(target = "sync", position = seconds, "playback position set");
    }

    fn set_playing(&self, playing: bool) {
        self.state.lock().playing = playing;
        tracing::info!(target = "sync", playing, "playback state set");
    }
}
