use thiserror::Error;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Invalid combiner configuration: {0}")]
    Combiner(String),

    #[error("Invalid VAD configuration: {0}")]
    Vad(String),
}
