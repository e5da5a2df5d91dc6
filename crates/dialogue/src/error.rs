use thiserror::Error;

use folksim_store::StorageError;

#[derive(Debug, Clone, Error)]
pub enum DialogueError {
    /// Invalid names or a self-pair.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Duplicate active dialogue or an operation on an ended dialogue.
    #[error("dialogue state error: {0}")]
    State(String),
    /// A storage operation failed even after retries.
    #[error("memory operation failed: {0}")]
    Memory(#[from] StorageError),
    /// Fatal wrapper around anything that killed the dialogue mid-flight.
    #[error("dialogue execution failed: {0}")]
    Handler(String),
}
