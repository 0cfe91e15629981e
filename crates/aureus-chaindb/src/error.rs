//! Error types for the chain databases.

/// Errors surfaced by the chain database stores.
///
/// Absence of a record is never an error; lookups return `Option` or `bool`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// RocksDB error.
    #[error("RocksDB error: {0}")]
    Rocksdb(#[from] rocksdb::Error),

    /// Bincode serialization/deserialization error.
    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed record or unexpected key. Fatal: the store must be rebuilt
    /// from primary block data rather than patched.
    #[error("Database corruption: {0}")]
    Corruption(String),

    /// A long-running scan observed its interrupt signal and stopped.
    #[error("Operation interrupted")]
    Interrupted,

    /// The injected crash hook fired after a partial batch write.
    #[error("Simulated crash after partial batch write")]
    CrashSimulated,
}

impl Error {
    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }
}

/// Result type for chain database operations.
pub type Result<T> = std::result::Result<T, Error>;
