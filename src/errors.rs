use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelloError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid speed {value}, must be between 10 and 100 cm/s")]
    InvalidSpeed { value: i32 },

    #[error("link closed")]
    LinkClosed,

    #[error("video feed failed - {msg}")]
    VideoFailed { msg: String },

    #[error("failed to parse \"{msg}\"")]
    ParseError { msg: String },

    #[error("invalid mission program - {msg}")]
    InvalidProgram { msg: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("{msg}")]
    Generic { msg: String },
}

pub type Result<T> = std::result::Result<T, TelloError>;
