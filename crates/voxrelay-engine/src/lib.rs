//! Upstream speech engine interface for the relay.
//!
//! The relay treats the conversational engine as an opaque duplex stream:
//! it pushes client audio and text in through an [`EngineSink`] and reads
//! [`EngineEvent`]s back from the session's event stream. Vendor transports
//! implement [`EngineConnector`]; the relay never inspects vendor payloads.
//!
//! Two connectors ship with the crate:
//! - [`GeminiConnector`] speaks the Gemini Live `BidiGenerateContent`
//!   WebSocket protocol.
//! - [`ChannelConnector`] is an in-process engine backed by channels, used
//!   by tests and local development.

pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod gemini;
pub mod session;

pub use channel::{ChannelConnector, ChannelEngineHandle, EngineRequest};
pub use config::{EngineConfig, EngineProvider};
pub use error::EngineError;
pub use event::EngineEvent;
pub use gemini::GeminiConnector;
pub use session::{EngineConnector, EngineSession, EngineSink, EventStream};
