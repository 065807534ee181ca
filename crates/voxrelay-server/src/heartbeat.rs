//! Server-initiated liveness probe.

use crate::codec::ServerMessage;
use crate::error::RelayError;
use crate::session::{ClientSender, PumpExit};
use std::time::Duration;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatSettings {
    /// Time between probes.
    pub interval: Duration,
    /// How long the client socket may take to accept a probe.
    pub timeout: Duration,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Sends `heartbeat` every interval until cancelled. A probe the writer
/// cannot deliver within the timeout ends the session.
pub(crate) async fn heartbeat_loop(
    session_id: Uuid,
    client: ClientSender,
    settings: HeartbeatSettings,
    cancel: CancellationToken,
) -> Result<PumpExit, RelayError> {
    let mut ticker = interval_at(Instant::now() + settings.interval, settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(PumpExit::Cancelled),
            _ = ticker.tick() => {
                let delivery = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Ok(PumpExit::Cancelled),
                    delivery = timeout(settings.timeout, client.send_confirmed(ServerMessage::Heartbeat)) => delivery,
                };
                match delivery {
                    Ok(Ok(())) => tracing::trace!(session_id = %session_id, "heartbeat delivered"),
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        tracing::warn!(
                            session_id = %session_id,
                            timeout_ms = settings.timeout.as_millis() as u64,
                            "heartbeat not delivered in time"
                        );
                        return Err(RelayError::HeartbeatTimeout(settings.timeout));
                    }
                }
            }
        }
    }
}
