use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Key absent, RID not in the page directory, or a required index is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// A record lock was denied.
    #[error("lock conflict on record {0}")]
    Conflict(u64),

    /// Every cached page is pinned; callers must not retry blindly.
    #[error("cache exhausted: all {0} pages are pinned")]
    CacheExhausted(usize),

    /// Disk read or write failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Tombstoned record reachable through an index, chain loop, or similar.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}
