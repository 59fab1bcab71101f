use std::fmt;

use tmd_store::StoreError;

use crate::processor::ProcessSummary;

/// How an extraction failure should be handled. Only the kind drives
/// retries, never the underlying cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network blip or navigation timeout.
    Transient,
    RateLimited,
    /// The page died under the worker.
    Crashed,
    /// Logged out; no page can succeed anymore.
    SessionExpired,
    /// The item is gone for good.
    NotFound,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::RateLimited => "rate limited",
            Self::Crashed => "page crashed",
            Self::SessionExpired => "session expired",
            Self::NotFound => "not found",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ExtractError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ExtractError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn crashed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Crashed, message)
    }

    pub fn session_expired(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SessionExpired, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("none of the {attempted} pages could be created")]
    NoLivePages { attempted: usize },

    #[error("page pool is shutting down")]
    ShuttingDown,

    #[error("every page crashed and none could be recreated")]
    Exhausted,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("processor is already running")]
    AlreadyProcessing,

    #[error(
        "run aborted after {}/{} items: {kind}: {message}",
        .summary.completed(),
        .summary.total
    )]
    Fatal {
        kind: ErrorKind,
        message: String,
        summary: ProcessSummary,
    },

    #[error(
        "page pool exhausted after {}/{} items",
        .summary.completed(),
        .summary.total
    )]
    PoolExhausted { summary: ProcessSummary },
}

impl ProcessError {
    /// What was done before the run was cut short.
    pub fn summary(&self) -> Option<&ProcessSummary> {
        match self {
            Self::AlreadyProcessing => None,
            Self::Fatal { summary, .. } | Self::PoolExhausted { summary } => Some(summary),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error("invalid crawler config: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("timeline scroll failed: {0:#}")]
    Scroll(anyhow::Error),
}
