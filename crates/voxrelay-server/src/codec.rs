//! Client wire protocol: JSON envelopes tagged by `type`.
//!
//! Inbound audio arrives base64-encoded inside `audio_chunk` (or the legacy
//! `audio_continuous`) messages, or as raw PCM in binary frames. Every
//! payload is bounded by `max_payload_bytes`; the bound is checked against
//! the encoded length so no decode buffer is allocated for an oversized
//! message.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use voxrelay_types::ControlKind;

/// Room for the JSON envelope around a maximal payload.
const ENVELOPE_SLACK_BYTES: usize = 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed client message: {0}")]
    Decode(String),

    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    Oversize { size: usize, limit: usize },

    #[error("failed to encode server message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A decoded client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// One fragment of inbound PCM.
    AudioChunk(Bytes),
    /// One complete typed utterance.
    Text(String),
    Control(ControlKind),
}

/// A message for the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Text(String),
    /// One combined fragment of outbound PCM.
    Audio(Bytes),
    TurnComplete,
    Heartbeat,
    HeartbeatAck,
    Error(String),
}

impl ServerMessage {
    /// Wire `type` of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Text(_) => "text",
            ServerMessage::Audio(_) => "audio",
            ServerMessage::TurnComplete => ControlKind::TurnComplete.wire_name(),
            ServerMessage::Heartbeat => ControlKind::Heartbeat.wire_name(),
            ServerMessage::HeartbeatAck => ControlKind::HeartbeatAck.wire_name(),
            ServerMessage::Error(_) => "error",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IncomingFrame {
    Text {
        text: String,
    },
    #[serde(alias = "audio_continuous")]
    AudioChunk {
        data: String,
    },
    StartListening,
    StopListening,
    Stop,
    Heartbeat,
    HeartbeatAck,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutgoingFrame<'a> {
    Text { text: &'a str },
    Audio { data: String },
    TurnComplete,
    Heartbeat,
    HeartbeatAck,
    Error { message: &'a str },
}

/// Size-bounded decoder for client frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_payload_bytes: usize,
}

impl FrameCodec {
    pub fn new(max_payload_bytes: usize) -> Self {
        Self { max_payload_bytes }
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    /// Largest text frame that can carry a maximal payload. Used as the
    /// WebSocket message size limit.
    pub fn max_frame_bytes(&self) -> usize {
        // base64 grows 3 bytes into 4; round up to a whole quantum.
        self.max_payload_bytes
            .div_ceil(3)
            .saturating_mul(4)
            .saturating_add(ENVELOPE_SLACK_BYTES)
    }

    /// Decodes one JSON text frame.
    pub fn decode_client_message(&self, raw: &[u8]) -> Result<ClientMessage, CodecError> {
        let frame_limit = self.max_frame_bytes();
        if raw.len() > frame_limit {
            return Err(CodecError::Oversize {
                size: raw.len(),
                limit: frame_limit,
            });
        }

        let frame: IncomingFrame =
            serde_json::from_slice(raw).map_err(|e| CodecError::Decode(e.to_string()))?;

        Ok(match frame {
            IncomingFrame::Text { text } => {
                self.check_size(text.len())?;
                ClientMessage::Text(text)
            }
            IncomingFrame::AudioChunk { data } => {
                self.check_size(base64::decoded_len_estimate(data.len()))?;
                let pcm = STANDARD
                    .decode(data.as_bytes())
                    .map_err(|e| CodecError::Decode(format!("invalid base64 audio: {e}")))?;
                ClientMessage::AudioChunk(Bytes::from(pcm))
            }
            IncomingFrame::StartListening => ClientMessage::Control(ControlKind::StartListening),
            IncomingFrame::StopListening => ClientMessage::Control(ControlKind::StopListening),
            IncomingFrame::Stop => ClientMessage::Control(ControlKind::Stop),
            IncomingFrame::Heartbeat => ClientMessage::Control(ControlKind::Heartbeat),
            IncomingFrame::HeartbeatAck => ClientMessage::Control(ControlKind::HeartbeatAck),
        })
    }

    /// Treats a binary frame as raw inbound PCM.
    pub fn decode_binary(&self, payload: Bytes) -> Result<ClientMessage, CodecError> {
        self.check_size(payload.len())?;
        Ok(ClientMessage::AudioChunk(payload))
    }

    fn check_size(&self, size: usize) -> Result<(), CodecError> {
        if size > self.max_payload_bytes {
            return Err(CodecError::Oversize {
                size,
                limit: self.max_payload_bytes,
            });
        }
        Ok(())
    }
}

/// Encodes a server message as a JSON text frame.
pub fn encode_server_message(message: &ServerMessage) -> Result<String, CodecError> {
    let frame = match message {
        ServerMessage::Text(text) => OutgoingFrame::Text { text },
        ServerMessage::Audio(pcm) => OutgoingFrame::Audio {
            data: STANDARD.encode(pcm),
        },
        ServerMessage::TurnComplete => OutgoingFrame::TurnComplete,
        ServerMessage::Heartbeat => OutgoingFrame::Heartbeat,
        ServerMessage::HeartbeatAck => OutgoingFrame::HeartbeatAck,
        ServerMessage::Error(message) => OutgoingFrame::Error { message },
    };
    Ok(serde_json::to_string(&frame)?)
}
