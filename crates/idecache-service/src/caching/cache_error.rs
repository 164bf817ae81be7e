use thiserror::Error;

/// An error produced while populating a cache entry.
///
/// Only [`NotFound`](Self::NotFound) is stored in caches. Every other variant is handed to the
/// waiters of the failed computation and then forgotten, so the next lookup retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The value legitimately does not exist, e.g. no make target references a file.
    ///
    /// The attached string is the reason reported to every later lookup.
    #[error("not found: {0}")]
    NotFound(String),
    /// Input was read successfully but is unusable, e.g. invalid UTF-8.
    #[error("malformed: {0}")]
    Malformed(String),
    /// A helper process could not be spawned or waited for.
    #[error("process failed: {0}")]
    ProcessFailed(String),
    /// The key lies outside of the tree the cache is responsible for.
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// The owner of the cache could not be constructed and will never produce values.
    #[error("construction failed: {0}")]
    Construction(String),
    /// The operation that owned the computation was cancelled.
    #[error("cancelled")]
    Cancelled,
    /// An unexpected error in idecache itself.
    #[error("internal error")]
    InternalError,
}

/// Coarse classification of [`CacheError`]s, deciding how a failure is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Cached negatively until the miss expires.
    NotFound,
    /// Retried on the next lookup.
    Transient,
    /// Retrying does not help. The caller should degrade.
    Fatal,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::NotFound(reason.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Malformed(_) | Self::ProcessFailed(_) | Self::Cancelled | Self::InternalError => {
                ErrorKind::Transient
            }
            Self::InvalidPath(_) | Self::Construction(_) => ErrorKind::Fatal,
        }
    }

    /// Whether this error is remembered as a negative cache entry.
    pub fn is_negative(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub(crate) fn metrics_tag(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "negative",
            Self::Malformed(_) => "malformed",
            Self::ProcessFailed(_) => "process",
            Self::InvalidPath(_) => "invalid-path",
            Self::Construction(_) => "construction",
            Self::Cancelled => "cancelled",
            Self::InternalError => "internal",
        }
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

/// An entry in a cache, containing either `Ok(T)` or the reason why no value is available.
pub type CacheEntry<T = ()> = Result<T, CacheError>;
