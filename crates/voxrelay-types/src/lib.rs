//! Shared types for the voxrelay workspace.
//!
//! This crate provides the domain types used across the relay crates:
//! audio frames and their format, the turn owner, the session connection
//! phase, and the payload-free control kinds exchanged with clients.
//!
//! Nothing in here performs I/O. The audio, engine and server crates depend
//! on `voxrelay-types` for cross-cutting definitions so none of them needs
//! to depend on another.

use serde::{Deserialize, Serialize};

mod audio;
pub use audio::{AudioFormat, AudioFrame, Direction, BYTES_PER_SAMPLE};

/// Which party currently holds the conversational floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnOwner {
    /// Neither side holds the floor (before activation, after teardown).
    #[default]
    None,
    /// The human may speak; client audio is forwarded upstream.
    Human,
    /// The engine is producing speech or text; client audio is dropped.
    Agent,
}

impl TurnOwner {
    /// Returns the string label for this owner.
    pub fn label(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Human => "HUMAN",
            Self::Agent => "AGENT",
        }
    }
}

impl std::fmt::Display for TurnOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Lifecycle phase of a relay session.
///
/// Phases only move forward: `Connecting -> Active -> Draining -> Closed`,
/// with `Closed` reachable from every phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ConnectionPhase {
    /// Client accepted, upstream engine connection being established.
    Connecting = 0,
    /// Both connections open and the pumps are running.
    Active = 1,
    /// Teardown has begun; pending client messages are being flushed.
    Draining = 2,
    /// All resources released.
    Closed = 3,
}

impl ConnectionPhase {
    /// Returns the numeric code for this phase.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Attempts to convert a numeric code to a `ConnectionPhase`.
    ///
    /// Returns `None` if the code does not correspond to a known phase.
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Connecting),
            1 => Some(Self::Active),
            2 => Some(Self::Draining),
            3 => Some(Self::Closed),
            _ => None,
        }
    }

    /// Returns the string label for this phase.
    pub fn label(self) -> &'static str {
        match self {
            Self::Connecting => "CONNECTING",
            Self::Active => "ACTIVE",
            Self::Draining => "DRAINING",
            Self::Closed => "CLOSED",
        }
    }
}

/// Payload-free control signals exchanged with the client.
///
/// `TEXT` and `ERROR` carry payloads and are modelled as their own message
/// variants by the codec; everything else is one of these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    /// Client asks to end the session.
    Stop,
    /// Client hint: the human is about to speak.
    StartListening,
    /// Client hint: the human has finished speaking.
    StopListening,
    /// Liveness probe.
    Heartbeat,
    /// Reply to a liveness probe.
    HeartbeatAck,
    /// The agent finished its turn.
    TurnComplete,
}

impl ControlKind {
    /// The `type` discriminant used on the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::StartListening => "start_listening",
            Self::StopListening => "stop_listening",
            Self::Heartbeat => "heartbeat",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::TurnComplete => "turn_complete",
        }
    }
}
