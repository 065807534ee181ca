//! Inbound voice activity detection.
//!
//! A deliberately cheap heuristic: browsers send short, near-empty frames
//! while the microphone hears nothing, so a frame is SILENCE when it is
//! shorter than `min_speech_bytes` or its RMS level is under
//! `energy_threshold`. Each silent frame credits a fixed nominal duration to
//! the silence run; any speech frame resets the run.
//!
//! Once the run exceeds `max_silence` after at least `min_speech_frames`
//! speech frames, [`VadEvent::EndOfUtterance`] fires. It fires at most once
//! between two calls to [`VoiceActivityDetector::reset`], which the relay
//! calls at every turn boundary.

use crate::config::VadConfig;
use std::time::Duration;
use voxrelay_types::AudioFrame;

/// Per-frame classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    Speech,
    Silence,
}

/// Events the detector raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// The human stopped talking.
    EndOfUtterance {
        /// Speech frames seen in the utterance.
        speech_frames: usize,
        /// Length of the silence run that closed it.
        silence: Duration,
    },
}

/// Result of feeding one frame to the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VadOutcome {
    pub decision: VadDecision,
    pub event: Option<VadEvent>,
}

#[derive(Debug)]
pub struct VoiceActivityDetector {
    config: VadConfig,
    speech_frames: usize,
    silence_run: Duration,
    fired: bool,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            speech_frames: 0,
            silence_run: Duration::ZERO,
            fired: false,
        }
    }

    /// Classifies a frame without touching detector state.
    pub fn classify(&self, frame: &AudioFrame) -> VadDecision {
        if frame.len() < self.config.min_speech_bytes {
            return VadDecision::Silence;
        }
        if rms_level(frame) < self.config.energy_threshold {
            VadDecision::Silence
        } else {
            VadDecision::Speech
        }
    }

    /// Feeds one inbound frame.
    pub fn process(&mut self, frame: &AudioFrame) -> VadOutcome {
        let decision = self.classify(frame);
        match decision {
            VadDecision::Speech => {
                self.speech_frames += 1;
                self.silence_run = Duration::ZERO;
                VadOutcome {
                    decision,
                    event: None,
                }
            }
            VadDecision::Silence => {
                self.silence_run += self.config.silence_frame_duration();
                VadOutcome {
                    decision,
                    event: self.check_end_of_utterance(),
                }
            }
        }
    }

    fn check_end_of_utterance(&mut self) -> Option<VadEvent> {
        if self.fired
            || self.silence_run <= self.config.max_silence()
            || self.speech_frames < self.config.min_speech_frames
        {
            return None;
        }

        let event = VadEvent::EndOfUtterance {
            speech_frames: self.speech_frames,
            silence: self.silence_run,
        };
        tracing::debug!(
            speech_frames = self.speech_frames,
            silence_ms = self.silence_run.as_millis() as u64,
            "end of utterance detected"
        );
        self.fired = true;
        self.speech_frames = 0;
        self.silence_run = Duration::ZERO;
        Some(event)
    }

    /// Marks a turn boundary: clears run-length counters and re-arms the
    /// end-of-utterance event.
    pub fn reset(&mut self) {
        self.speech_frames = 0;
        self.silence_run = Duration::ZERO;
        self.fired = false;
    }

    pub fn speech_frames(&self) -> usize {
        self.speech_frames
    }

    pub fn silence_run(&self) -> Duration {
        self.silence_run
    }

    /// Whether the current turn already produced its end-of-utterance.
    pub fn has_fired(&self) -> bool {
        self.fired
    }
}

/// RMS level of a PCM16 frame, normalized to [0, 1].
fn rms_level(frame: &AudioFrame) -> f32 {
    let mut count = 0u64;
    let mut sum = 0f64;
    for sample in frame.samples() {
        let s = f64::from(sample) / 32_768.0;
        sum += s * s;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    (sum / count as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxrelay_types::AudioFormat;

    fn pcm(samples: &[i16]) -> AudioFrame {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        AudioFrame::inbound(bytes, AudioFormat::mono(16_000))
    }

    fn loud() -> AudioFrame {
        pcm(&[8_000, -8_000].repeat(256))
    }

    fn quiet() -> AudioFrame {
        pcm(&[3, -3].repeat(256))
    }

    fn empty() -> AudioFrame {
        AudioFrame::inbound(Vec::new(), AudioFormat::mono(16_000))
    }

    #[test]
    fn classifies_by_length_and_energy() {
        let vad = VoiceActivityDetector::new(VadConfig::default());
        assert_eq!(vad.classify(&loud()), VadDecision::Speech);
        assert_eq!(vad.classify(&quiet()), VadDecision::Silence);
        assert_eq!(vad.classify(&empty()), VadDecision::Silence);
        // Loud but too short.
        assert_eq!(vad.classify(&pcm(&[20_000; 10])), VadDecision::Silence);
    }

    #[test]
    fn silence_without_speech_does_not_end_utterance() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        for _ in 0..100 {
            assert!(vad.process(&empty()).event.is_none());
        }
    }

    #[test]
    fn fires_once_after_max_silence() {
        let config = VadConfig {
            silence_frame_ms: 100,
            max_silence_ms: 500,
            ..VadConfig::default()
        };
        let mut vad = VoiceActivityDetector::new(config);
        for _ in 0..3 {
            vad.process(&loud());
        }

        let mut events = Vec::new();
        for _ in 0..30 {
            if let Some(event) = vad.process(&quiet()).event {
                events.push(event);
            }
        }

        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            VadEvent::EndOfUtterance {
                speech_frames: 3,
                silence: Duration::from_millis(600),
            }
        );
        assert!(vad.has_fired());
    }

    #[test]
    fn speech_resets_silence_run() {
        let config = VadConfig {
            silence_frame_ms: 100,
            max_silence_ms: 500,
            ..VadConfig::default()
        };
        let mut vad = VoiceActivityDetector::new(config);
        vad.process(&loud());
        for _ in 0..4 {
            vad.process(&quiet());
        }
        assert_eq!(vad.silence_run(), Duration::from_millis(400));
        vad.process(&loud());
        assert_eq!(vad.silence_run(), Duration::ZERO);
        assert_eq!(vad.speech_frames(), 2);
    }

    #[test]
    fn zero_speech_threshold_fires_once_on_pure_silence() {
        let config = VadConfig {
            min_speech_frames: 0,
            max_silence_ms: 1_000,
            ..VadConfig::default()
        };
        let mut vad = VoiceActivityDetector::new(config);
        let fired = (0..20)
            .filter_map(|_| vad.process(&empty()).event)
            .count();
        assert_eq!(fired, 1);
    }

    #[test]
    fn reset_rearms_the_event() {
        let config = VadConfig {
            silence_frame_ms: 100,
            max_silence_ms: 200,
            ..VadConfig::default()
        };
        let mut vad = VoiceActivityDetector::new(config);
        let run_turn = |vad: &mut VoiceActivityDetector| {
            vad.process(&loud());
            (0..10).filter_map(|_| vad.process(&quiet()).event).count()
        };

        assert_eq!(run_turn(&mut vad), 1);
        assert_eq!(run_turn(&mut vad), 0);
        vad.reset();
        assert_eq!(run_turn(&mut vad), 1);
    }
}
