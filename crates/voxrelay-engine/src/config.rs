use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use voxrelay_types::AudioFormat;

/// Default Gemini Live endpoint.
pub const DEFAULT_GEMINI_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

fn default_model() -> String {
    "models/gemini-2.0-flash-live-001".to_string()
}

fn default_voice() -> String {
    "Aoede".to_string()
}

fn default_system_prompt() -> String {
    "You are a warm, concise voice assistant.".to_string()
}

fn default_greeting() -> Option<String> {
    Some("Hello".to_string())
}

fn default_endpoint() -> String {
    DEFAULT_GEMINI_ENDPOINT.to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_response_timeout_ms() -> u64 {
    30_000
}

fn default_input_sample_rate() -> u32 {
    16_000
}

fn default_output_sample_rate() -> u32 {
    24_000
}

fn default_transcribe_output() -> bool {
    true
}

/// Which engine transport the relay connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineProvider {
    /// Gemini Live over WebSocket.
    #[default]
    Gemini,
}

/// Engine session settings, passed through to the vendor unmodified.
#[derive(Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub provider: EngineProvider,
    /// Model identifier, e.g. `models/gemini-2.0-flash-live-001`.
    #[serde(default = "default_model")]
    pub model: String,
    /// Prebuilt voice name.
    #[serde(default = "default_voice")]
    pub voice: String,
    /// System instruction for the conversation.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Sent as the first user turn so the engine speaks first. `None` waits
    /// for the engine to start on its own.
    #[serde(default = "default_greeting")]
    pub greeting: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Bound on connect and on every upstream send. Default: 10 s.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Bound on waiting for the next engine event while the engine holds the
    /// floor. Default: 30 s.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Sample rate of PCM sent upstream. Default: 16 kHz.
    #[serde(default = "default_input_sample_rate")]
    pub input_sample_rate: u32,
    /// Sample rate of PCM the engine produces. Default: 24 kHz.
    #[serde(default = "default_output_sample_rate")]
    pub output_sample_rate: u32,
    /// Ask the engine for transcripts of its own speech.
    #[serde(default = "default_transcribe_output")]
    pub transcribe_output: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: EngineProvider::default(),
            model: default_model(),
            voice: default_voice(),
            system_prompt: default_system_prompt(),
            greeting: default_greeting(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            request_timeout_ms: default_request_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            input_sample_rate: default_input_sample_rate(),
            output_sample_rate: default_output_sample_rate(),
            transcribe_output: default_transcribe_output(),
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("system_prompt_len", &self.system_prompt.len())
            .field("greeting", &self.greeting)
            .field("api_key", &"[REDACTED]")
            .field("endpoint", &self.endpoint)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("response_timeout_ms", &self.response_timeout_ms)
            .field("input_sample_rate", &self.input_sample_rate)
            .field("output_sample_rate", &self.output_sample_rate)
            .field("transcribe_output", &self.transcribe_output)
            .finish()
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Format of audio the relay sends upstream.
    pub fn input_format(&self) -> AudioFormat {
        AudioFormat::mono(self.input_sample_rate)
    }

    /// Format of audio the engine sends back.
    pub fn output_format(&self) -> AudioFormat {
        AudioFormat::mono(self.output_sample_rate)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.model.trim().is_empty() {
            return Err(EngineError::Config("model must not be empty".to_string()));
        }
        if self.input_sample_rate == 0 || self.output_sample_rate == 0 {
            return Err(EngineError::Config(
                "sample rates must be greater than zero".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 || self.response_timeout_ms == 0 {
            return Err(EngineError::Config(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
