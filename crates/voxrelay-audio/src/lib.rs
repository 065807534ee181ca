//! Audio shaping for the relay.
//!
//! Two independent processors sit on either side of the session:
//!
//! - [`AudioCombiner`] collects the small, irregular chunks a speech engine
//!   emits and releases them as one contiguous frame per flush interval, so
//!   client playback does not stutter.
//! - [`VoiceActivityDetector`] watches client audio and signals the end of
//!   an utterance once a run of silence follows speech.
//!
//! Neither performs I/O; the session relay drives them and owns their
//! timers.

pub mod combiner;
pub mod config;
pub mod error;
pub mod vad;

pub use combiner::{sleep_until_deadline, AudioCombiner};
pub use config::{CombinerConfig, VadConfig};
pub use error::AudioError;
pub use vad::{VadDecision, VadEvent, VadOutcome, VoiceActivityDetector};
