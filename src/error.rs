use thiserror::Error;

/// Error taxonomy for the crawl engine.
///
/// Transient and throttled failures are recovered locally by the throttle
/// and the engine; permanent failures cost one batch and return its pids to
/// the frontier; auth and integrity failures are fatal for the run.
#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("session expired (HTTP 401)")]
    AuthExpired,

    #[error("throttled (HTTP {status})")]
    Throttled {
        status: u16,
        retry_after: Option<u64>,
    },

    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent failure (HTTP {0})")]
    PermanentFailure(u16),

    #[error("corrupt payload: {0}")]
    CorruptPayload(String),

    #[error("store integrity violation: {0}")]
    StoreIntegrity(String),

    #[error("cancelled")]
    Cancelled,

    #[error("store: {0}")]
    Store(#[from] tokio_rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(String),
}

impl CrawlError {
    /// True when the caller should retry (with backoff) rather than give up.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CrawlError::Throttled { .. } | CrawlError::Transient(_)
        )
    }

    /// Process exit code per the external interface contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            CrawlError::AuthExpired => 2,
            CrawlError::StoreIntegrity(_) => 3,
            CrawlError::Store(tokio_rusqlite::Error::Rusqlite(
                rusqlite::Error::SqliteFailure(err, _),
            )) if err.code == rusqlite::ErrorCode::DatabaseCorrupt => 3,
            CrawlError::Cancelled => 0,
            _ => 1,
        }
    }
}

impl From<rusqlite::Error> for CrawlError {
    fn from(e: rusqlite::Error) -> Self {
        CrawlError::Store(tokio_rusqlite::Error::Rusqlite(e))
    }
}

pub type Result<T> = std::result::Result<T, CrawlError>;
