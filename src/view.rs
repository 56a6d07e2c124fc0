//! Interfaces toward the UI collaborators.
//!
//! The core never reaches into UI-owned state; it pushes snapshots through
//! these sinks and reads nothing back. Sinks are registered explicitly on
//! the session, never through globally assigned hooks.

use std::collections::HashMap;

use crate::model::{ChatEntry, SeatMap, VisitorPosition};

/// Renders occupancy snapshots.
pub trait SeatViewSink: Send + Sync {
    fn seats_updated(&self, seats: &SeatMap);
}

/// Renders the chat log.
pub trait ChatViewSink: Send + Sync {
    fn chat_updated(&self, log: &[ChatEntry]);
}

/// Renders remote visitor positions.
pub trait PositionViewSink: Send + Sync {
    fn positions_updated(&self, positions: &HashMap<String, VisitorPosition>);
}
