use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("store failure: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("watcher failure: {0}")]
    Watcher(#[from] notify::Error),

    #[error("failed to parse {file}: {message}")]
    Parse { file: String, message: String },

    #[error("indexing failed: {0}")]
    Coordinator(String),

    #[error("serialization failure: {0}")]
    Json(#[from] serde_json::Error),

    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    #[error("usage error: {0}")]
    Usage(String),
}

impl LedgerError {
    /// Parse failures are confined to a single file during an indexing run;
    /// everything else aborts the run.
    pub fn is_file_scoped(&self) -> bool {
        matches!(self, LedgerError::Parse { .. })
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
