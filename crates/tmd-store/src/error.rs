use crate::model::{ImageStatus, RunStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database schema version {found} is newer than supported version {supported}")]
    UnsupportedSchemaVersion { supported: u32, found: u32 },

    #[error("invalid account name {0:?}")]
    InvalidAccountName(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("image {url} marked {status} without a reason")]
    MissingReason { url: String, status: ImageStatus },

    #[error("run not found: {0}")]
    RunNotFound(String),

    /// The run already left `in_progress`; ledger transitions happen once.
    #[error("run {run_id} is already {status}")]
    RunFinished { run_id: String, status: RunStatus },
}

pub type Result<T> = std::result::Result<T, StoreError>;
