use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Invalid planner state: {0}")]
    InvalidState(String),

    #[error("Memory binding error: {0}")]
    BindingError(String),

    #[error("Allocation error: {0}")]
    AllocationError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),
}
