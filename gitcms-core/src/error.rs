//! Error type shared by every layer of the storage engine

use std::time::Duration;

use crate::object::ObjectId;

/// Result type for storage engine operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur while reading, committing or locking site content
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Repository for site '{0}' is busy, retry later")]
    LockHeld(String),

    #[error("Unlock failed for site '{0}': no lock held")]
    UnlockFailed(String),

    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Rollback of {site}@{branch} to {snapshot} failed ({rollback_error}) after: {cause}")]
    RollbackFailed {
        site: String,
        branch: String,
        snapshot: ObjectId,
        cause: Box<StoreError>,
        rollback_error: Box<StoreError>,
    },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid change set: {0}")]
    InvalidChange(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Lock store error: {0}")]
    LockStore(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Operation(#[from] anyhow::Error),
}

impl StoreError {
    /// Whether the caller can surface this as an ordinary user-facing
    /// condition (404/409/busy) rather than a server fault.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound(_) | StoreError::Conflict(_) | StoreError::LockHeld(_)
        )
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            StoreError::RemoteUnavailable(format!("request timed out: {}", e))
        } else {
            StoreError::RemoteUnavailable(e.to_string())
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::LockStore(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_kinds() {
        assert!(StoreError::NotFound("pages/a.md".into()).is_recoverable());
        assert!(StoreError::Conflict("stale sha".into()).is_recoverable());
        assert!(StoreError::LockHeld("acme".into()).is_recoverable());
        assert!(!StoreError::RemoteUnavailable("502".into()).is_recoverable());
        assert!(!StoreError::UnlockFailed("acme".into()).is_recoverable());
    }

    #[test]
    fn test_rollback_failed_message_names_snapshot() {
        let snapshot = ObjectId::new([0xc0; 20]);
        let err = StoreError::RollbackFailed {
            site: "acme".into(),
            branch: "staging".into(),
            snapshot,
            cause: Box::new(StoreError::RemoteUnavailable("write failed".into())),
            rollback_error: Box::new(StoreError::RemoteUnavailable("ref update failed".into())),
        };
        let msg = err.to_string();
        assert!(msg.contains("acme@staging"));
        assert!(msg.contains(&snapshot.to_hex()));
    }
}
