use bytes::Bytes;

/// Everything the relay understands from an engine.
///
/// Vendor responses are mapped onto this closed set by the connector; any
/// field not represented here is dropped at the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A fragment of synthesized PCM speech.
    Audio(Bytes),
    /// A text or transcript fragment.
    Text(String),
    /// The engine finished its turn.
    TurnComplete,
    /// The engine reported a failure; the session cannot continue.
    Error(String),
}
