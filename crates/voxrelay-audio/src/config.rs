use crate::error::AudioError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_flush_interval_ms() -> u64 {
    100
}

fn default_max_buffered_bytes() -> usize {
    // Two seconds of 24 kHz mono PCM.
    96_000
}

fn default_min_speech_bytes() -> usize {
    100
}

fn default_energy_threshold() -> f32 {
    0.01
}

fn default_silence_frame_ms() -> u64 {
    64
}

fn default_max_silence_ms() -> u64 {
    1_500
}

fn default_min_speech_frames() -> usize {
    1
}

/// Settings for the outbound combiner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinerConfig {
    /// Maximum time a queued frame waits before being flushed. Default: 100 ms.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Queue size that forces an early flush. Default: 96 000 bytes.
    #[serde(default = "default_max_buffered_bytes")]
    pub max_buffered_bytes: usize,
}

impl Default for CombinerConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            max_buffered_bytes: default_max_buffered_bytes(),
        }
    }
}

impl CombinerConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn validate(&self) -> Result<(), AudioError> {
        if self.flush_interval_ms == 0 {
            return Err(AudioError::Combiner(
                "flush_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_buffered_bytes == 0 {
            return Err(AudioError::Combiner(
                "max_buffered_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings for inbound voice activity detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VadConfig {
    /// Frames shorter than this are silence regardless of content.
    #[serde(default = "default_min_speech_bytes")]
    pub min_speech_bytes: usize,
    /// RMS level (samples normalized to [-1, 1]) below which a frame is silence.
    #[serde(default = "default_energy_threshold")]
    pub energy_threshold: f32,
    /// Nominal duration credited to the silence run per silent frame.
    #[serde(default = "default_silence_frame_ms")]
    pub silence_frame_ms: u64,
    /// Silence run that ends an utterance. Default: 1.5 s.
    #[serde(default = "default_max_silence_ms")]
    pub max_silence_ms: u64,
    /// Speech frames required since the last turn boundary before silence
    /// can end the utterance.
    #[serde(default = "default_min_speech_frames")]
    pub min_speech_frames: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            min_speech_bytes: default_min_speech_bytes(),
            energy_threshold: default_energy_threshold(),
            silence_frame_ms: default_silence_frame_ms(),
            max_silence_ms: default_max_silence_ms(),
            min_speech_frames: default_min_speech_frames(),
        }
    }
}

impl VadConfig {
    pub fn silence_frame_duration(&self) -> Duration {
        Duration::from_millis(self.silence_frame_ms)
    }

    pub fn max_silence(&self) -> Duration {
        Duration::from_millis(self.max_silence_ms)
    }

    pub fn validate(&self) -> Result<(), AudioError> {
        if !(0.0..=1.0).contains(&self.energy_threshold) {
            return Err(AudioError::Vad(format!(
                "energy_threshold must be within [0, 1], got {}",
                self.energy_threshold
            )));
        }
        if self.silence_frame_ms == 0 {
            return Err(AudioError::Vad(
                "silence_frame_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
