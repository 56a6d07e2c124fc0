use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::protocol::peer::DATA_CHANNEL_LABEL;

/// Configuration for peer connection establishment.
#[derive(Clone)]
pub struct WebRtcConfig {
    /// ICE servers for connection establishment
    pub ice_servers: Vec<RTCIceServer>,
    /// Data channel label
    pub channel_label: String,
    /// Whether the data channel should be ordered (chat/position/playback
    /// traffic requires ordered, reliable delivery)
    pub ordered: bool,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                RTCIceServer {
                    urls: vec!["stun:stun.l.google.com:19302".to_string()],
                    ..Default::default()
                },
                RTCIceServer {
                    urls: vec!["stun:stun1.l.google.com:19302".to_string()],
                    ..Default::default()
                },
            ],
            channel_label: DATA_CHANNEL_LABEL.to_string(),
            ordered: true,
        }
    }
}

impl WebRtcConfig {
    /// Create a localhost-only configuration (no STUN/TURN)
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
            ..Default::default()
        }
    }
}
