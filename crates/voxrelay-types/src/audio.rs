//! Audio frame definitions.
//!
//! Every frame on the relay is 16-bit little-endian linear PCM. A frame is
//! a unit of transport: it carries whatever the sender happened to emit,
//! and nothing downstream assumes a frame lines up with a word or syllable.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Size of one PCM sample in bytes.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Which way a frame is travelling through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// From the client (microphone or browser) towards the engine.
    Inbound,
    /// From the engine towards the client.
    Outbound,
}

/// Sample rate and channel layout of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Samples per second per channel.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
}

impl AudioFormat {
    /// Mono PCM at the given rate.
    pub const fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }

    /// Bytes of PCM per second of audio.
    pub fn bytes_per_second(self) -> u64 {
        u64::from(self.sample_rate) * u64::from(self.channels) * BYTES_PER_SAMPLE as u64
    }

    /// MIME type understood by realtime speech engines.
    pub fn mime_type(self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// An immutable chunk of PCM audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    data: Bytes,
    format: AudioFormat,
    direction: Direction,
}

impl AudioFrame {
    pub fn new(data: impl Into<Bytes>, format: AudioFormat, direction: Direction) -> Self {
        Self {
            data: data.into(),
            format,
            direction,
        }
    }

    /// A frame received from the client.
    pub fn inbound(data: impl Into<Bytes>, format: AudioFormat) -> Self {
        Self::new(data, format, Direction::Inbound)
    }

    /// A frame produced by the engine.
    pub fn outbound(data: impl Into<Bytes>, format: AudioFormat) -> Self {
        Self::new(data, format, Direction::Outbound)
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Playback duration implied by the byte length and format.
    pub fn duration(&self) -> Duration {
        let bps = self.format.bytes_per_second();
        if bps == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.data.len() as u64 * 1_000_000 / bps)
    }

    /// Iterates the frame's samples. A trailing odd byte is ignored.
    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.data
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
    }
}
