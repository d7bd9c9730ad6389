use thiserror::Error;

#[derive(Debug, Error)]
pub enum MfdError {
    /// The elemental matrix of a cell could not be built (non-SPD tensor,
    /// degenerate geometry, failed local factorization).
    #[error("Malformed cell {cell}: {reason}")]
    MalformedCell { cell: usize, reason: String },

    #[error("Solve error: {0}")]
    Solve(String),

    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MfdError>;
