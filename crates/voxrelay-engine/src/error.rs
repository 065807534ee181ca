use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid engine configuration: {0}")]
    Config(String),

    #[error("Engine connection failed: {0}")]
    Connect(String),

    #[error("Engine transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Engine protocol error: {0}")]
    Protocol(String),

    #[error("Engine payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Engine connection closed")]
    Closed,
}
