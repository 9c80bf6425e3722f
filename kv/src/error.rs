use thiserror::Error;

/// Errors raised by the durability core.
///
/// Variants map onto the error taxonomy: `Internal` and `Value` cover
/// everything a caller should treat as a hard failure (bad input, I/O that
/// isn't tolerated), while corrupt WAL entries and corrupt snapshots are
/// logged and recovered from inline rather than surfaced as `Error` —
/// they never fail a caller's request.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Value(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Bincode(#[from] bincode::Error),
}

pub type CResult<T> = std::result::Result<T, Error>;
