//! Wire types for the relay signaling channel.
//!
//! Every frame is a JSON envelope `{"type": ..., "data": ...}`. Both
//! directions are closed tagged unions; a frame whose tag is unknown fails
//! to decode and is rejected by the reader instead of falling through.

pub mod peer;

use serde::{Deserialize, Serialize};

use crate::model::{SeatMap, Visitor};

/// Screening status value that terminates the session.
pub const SCREENING_ENDED: &str = "ended";

/// Negotiation payload relayed verbatim between two peers. The relay never
/// inspects these; it only routes them by target identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    },
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::IceCandidate { .. } => "ice-candidate",
        }
    }
}

/// Frames the client sends to the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate {
        token: String,
    },
    WebrtcSignal {
        target: String,
        #[serde(flatten)]
        signal: SignalPayload,
    },
    Heartbeat {},
}

/// Frames the relay sends to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    VisitorJoined {
        visitor: Visitor,
    },
    VisitorLeft {
        visitor_id: String,
    },
    WebrtcSignal {
        from: String,
        #[serde(flatten)]
        signal: SignalPayload,
    },
    SeatUpdate(SeatMap),
    ScreeningStatus {
        status: String,
    },
    Authenticated {
        #[serde(default)]
        success: bool,
    },
    Error {
        message: String,
    },
}
