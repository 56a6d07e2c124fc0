//! Messages multiplexed over each peer's data channel.
//!
//! One reliable, ordered channel per peer link carries all three kinds as
//! JSON text frames. Delivery is ordered per channel only; nothing is
//! guaranteed across peers.

use serde::{Deserialize, Serialize};

/// Label of the single data channel opened per peer link.
pub const DATA_CHANNEL_LABEL: &str = "matinee-data";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    Chat {
        text: String,
    },
    /// Last-write-wins spatial update for the sending peer.
    Position {
        position: [f64; 3],
        rotation: [f64; 3],
    },
    Playback {
        position: f64,
        playing: bool,
    },
}

impl PeerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_frame_shape() {
        let value = serde_json::to_value(PeerMessage::Chat { text: "hi".into() }).unwrap();
        assert_eq!(value, json!({"type": "chat", "text": "hi"}));
    }

    #[test]
    fn playback_frame_roundtrip() {
        let msg = PeerMessage::Playback {
            position: 12.5,
            playing: true,
        };
        let decoded = PeerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn position_is_tagged() {
        let raw = json!({
            "type": "position",
            "position": [0.0, 1.5, -2.0],
            "rotation": [0.0, 90.0, 0.0]
        });
        let msg: PeerMessage = serde_json::from_value(raw).unwrap();
        assert!(matches!(msg, PeerMessage::Position { .. }));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let raw = json!({"type": "telemetry", "value": 1});
        assert!(serde_json::from_value::<PeerMessage>(raw).is_err());
    }
}
