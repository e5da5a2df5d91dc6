use thiserror::Error;

/// Storage failure, tagged by kind.  Callers decide retry vs abort.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("storage busy: {0}")]
    Busy(String),
    #[error("storage i/o: {0}")]
    Io(String),
}

impl StorageError {
    pub fn not_found(what: impl Into<String>) -> Self {
        StorageError::NotFound(what.into())
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        StorageError::Conflict(what.into())
    }
}

macro_rules! impl_io_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for StorageError {
                fn from(err: $ty) -> Self {
                    StorageError::Io(err.to_string())
                }
            }
        )*
    };
}

impl_io_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
    std::io::Error,
);

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Corrupt(err.to_string())
    }
}
