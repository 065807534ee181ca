//! Connector and session traits implemented by every engine transport.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::event::EngineEvent;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use voxrelay_types::AudioFrame;

/// Stream of engine events. Ends when the engine closes the connection.
pub type EventStream = BoxStream<'static, Result<EngineEvent, EngineError>>;

/// Write half of an engine connection.
#[async_trait]
pub trait EngineSink: Send {
    /// Streams one fragment of client PCM to the engine.
    async fn send_audio(&mut self, frame: &AudioFrame) -> Result<(), EngineError>;

    /// Sends a text turn. With `end_of_turn` the engine starts responding.
    async fn send_text(&mut self, text: &str, end_of_turn: bool) -> Result<(), EngineError>;

    /// Tells the engine the human finished speaking.
    async fn end_turn(&mut self) -> Result<(), EngineError> {
        self.send_text("", true).await
    }

    /// Closes the upstream connection. Calling it twice is harmless.
    async fn close(&mut self) -> Result<(), EngineError>;
}

/// An open engine connection, already split into its two halves so the
/// relay can write and read concurrently.
pub struct EngineSession {
    pub sink: Box<dyn EngineSink>,
    pub events: EventStream,
}

impl EngineSession {
    pub fn new(sink: Box<dyn EngineSink>, events: EventStream) -> Self {
        Self { sink, events }
    }
}

impl std::fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSession").finish_non_exhaustive()
    }
}

/// Opens engine sessions.
#[async_trait]
pub trait EngineConnector: Send + Sync {
    /// Short transport name for logs.
    fn name(&self) -> &'static str;

    /// Establishes a new session. Returns once the engine is ready to
    /// accept input.
    async fn connect(&self, config: &EngineConfig) -> Result<EngineSession, EngineError>;
}
