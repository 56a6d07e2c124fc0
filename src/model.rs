use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A remote participant as announced by the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Visitor {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// One occupied (or occupiable) seat in the auditorium grid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeatPosition {
    pub row: u32,
    pub seat: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visitor_id: Option<String>,
}

/// Occupancy snapshot broadcast by the relay after every seat change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeatMap {
    pub rows: u32,
    pub seats_per_row: u32,
    #[serde(default)]
    pub occupied: Vec<SeatPosition>,
}

impl SeatMap {
    /// Whether `visitor_id` currently holds (`row`, `seat`) according to
    /// this snapshot.
    pub fn holds(&self, visitor_id: &str, row: u32, seat: u32) -> bool {
        self.occupied.iter().any(|pos| {
            pos.row == row && pos.seat == seat && pos.visitor_id.as_deref() == Some(visitor_id)
        })
    }
}

/// Screening details served by the relay. The magnet link is the stream
/// descriptor handed to the streaming engine; the core never touches the
/// content it names.
#[derive(Debug, Clone, Deserialize)]
pub struct Screening {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub magnet_link: String,
    #[serde(default)]
    pub seats: Option<SeatMap>,
}

/// The viewer's claim on one seat. At most one per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatLease {
    pub row: u32,
    pub seat: u32,
    pub held_since: OffsetDateTime,
}

impl SeatLease {
    pub fn new(row: u32, seat: u32) -> Self {
        Self {
            row,
            seat,
            held_since: OffsetDateTime::now_utc(),
        }
    }
}

/// One line of the session chat log. Timestamps are local receipt time,
/// never the sender's clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    pub sender: String,
    pub text: String,
    pub received_at: OffsetDateTime,
}

impl ChatEntry {
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
            received_at: OffsetDateTime::now_utc(),
        }
    }
}

/// A remote visitor's spatial pose inside the auditorium.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct VisitorPosition {
    pub position: [f64; 3],
    pub rotation: [f64; 3],
}

/// Transient playback state, one per peer plus one local. Always superseded
/// by the next snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackSnapshot {
    pub position: f64,
    pub playing: bool,
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}
