//! Seat-lease keep-alive.
//!
//! Every interval, fire two independent signals: an HTTP call to the
//! lease-renewal endpoint and a `heartbeat` frame on the signaling channel.
//! Both are fire-and-forget; either path failing is logged and the ticker
//! keeps going. The session's usability never depends on a heartbeat
//! succeeding.

use std::sync::Arc;
use std::time::Duration;

use crate::protocol::ClientMessage;
use crate::session::seats::SeatAuthorityClient;
use crate::session::signaling::SignalingChannel;

pub struct SessionHeartbeat {
    handle: tokio::task::JoinHandle<()>,
}

impl SessionHeartbeat {
    pub fn start(
        interval: Duration,
        seats: SeatAuthorityClient,
        signaling: Arc<SignalingChannel>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Consume the immediate first tick; the first beat lands one
            // full interval after startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = seats.heartbeat().await {
                    tracing::warn!(
                        target = "heartbeat",
                        error = %err,
                        "lease renewal call failed"
                    );
                }
                if let Err(err) = signaling.send(ClientMessage::Heartbeat {}) {
                    tracing::warn!(
                        target = "heartbeat",
                        error = %err,
                        "signaling heartbeat not delivered"
                    );
                }
                tracing::trace!(target = "heartbeat", "keep-alive emitted");
            }
        });
        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }

    #[cfg(test)]
    pub(crate) fn is_stopped(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for SessionHeartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
