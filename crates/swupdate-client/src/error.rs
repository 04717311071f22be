use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwupdateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too short: expected {expected} bytes, got {actual}")]
    ShortFrame { expected: usize, actual: usize },

    #[error("payload of {0} bytes does not fit the frame buffer")]
    PayloadTooLarge(usize),

    #[error("failed to encode control payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("installer did not answer within {0}s")]
    ResponseTimeout(u64),

    #[error("installer rejected the request")]
    Rejected,

    #[error("process error: {0}")]
    Process(String),

    #[error("no installer command configured")]
    NoCommand,
}
