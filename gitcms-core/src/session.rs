//! Rollback-aware edit sessions
//!
//! A session records the branch head before any write. If the operation
//! fails for any reason the branch is force-moved back to that snapshot, so
//! a multi-commit operation either lands completely or not at all. A wrapper
//! dropped before it settles (a cancelled request) restores the snapshot in
//! the background, then releases any lock it holds.

use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;

use crate::content::{ContentClient, DirEntry};
use crate::error::{Result, StoreError};
use crate::host::{FileContent, GitHost, RepoScope};
use crate::mutex::LockGuard;
use crate::object::{ObjectId, RepoState};
use crate::path::StoragePath;
use crate::tree::{CommitOutcome, TreeChange, TreeTransaction};

/// Where a wrapped operation stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    SnapshotTaken(ObjectId),
    Committed(ObjectId),
    RolledBack(ObjectId),
}

/// Snapshot on entry, restore on failure
pub struct RollbackWrapper {
    host: Arc<dyn GitHost>,
    scope: RepoScope,
    state: SessionState,
    /// Set once `finish` has run to completion, whatever the outcome
    settled: bool,
    lock: Option<LockGuard>,
}

impl RollbackWrapper {
    pub fn new(host: Arc<dyn GitHost>, scope: RepoScope) -> Self {
        Self {
            host,
            scope,
            state: SessionState::Idle,
            settled: false,
            lock: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Keep `lock` until the wrapper settles. If the wrapper is dropped
    /// unsettled the lock is released only after the snapshot is restored.
    pub fn hold_lock(&mut self, lock: LockGuard) {
        self.lock = Some(lock);
    }

    /// Hand back the held lock
    pub fn take_lock(&mut self) -> Option<LockGuard> {
        self.lock.take()
    }

    /// Record the current head commit
    pub async fn snapshot(&mut self) -> Result<ObjectId> {
        let head = self.host.get_repo_state(&self.scope).await?;
        tracing::debug!("Snapshot of {} at {}", self.scope, head.commit.short());
        self.state = SessionState::SnapshotTaken(head.commit);
        Ok(head.commit)
    }

    /// Settle an operation's result. Errors restore the snapshot and are
    /// returned unchanged unless the restore itself fails.
    pub async fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        let snapshot = match self.state {
            SessionState::SnapshotTaken(commit) => commit,
            state => {
                return Err(StoreError::Operation(anyhow::anyhow!(
                    "cannot finish session for {} in state {:?}",
                    self.scope,
                    state
                )));
            }
        };

        let cause = match result {
            Ok(value) => {
                self.state = SessionState::Committed(snapshot);
                self.settled = true;
                return Ok(value);
            }
            Err(cause) => cause,
        };

        tracing::warn!(
            "Operation on {} failed ({}), restoring {}",
            self.scope,
            cause,
            snapshot.short()
        );
        let restored = self.host.update_ref(&self.scope, snapshot, true).await;
        self.settled = true;
        match restored {
            Ok(()) => {
                self.state = SessionState::RolledBack(snapshot);
                Err(cause)
            }
            Err(rollback_error) => {
                tracing::error!(
                    "CRITICAL: {} left inconsistent, could not restore {}: {} (after: {})",
                    self.scope,
                    snapshot,
                    rollback_error,
                    cause
                );
                Err(StoreError::RollbackFailed {
                    site: self.scope.site.clone(),
                    branch: self.scope.branch.clone(),
                    snapshot,
                    cause: Box::new(cause),
                    rollback_error: Box::new(rollback_error),
                })
            }
        }
    }
}

impl Drop for RollbackWrapper {
    fn drop(&mut self) {
        let lock = self.lock.take();
        let snapshot = match self.state {
            SessionState::SnapshotTaken(snapshot) if !self.settled => snapshot,
            _ => return,
        };
        let host = self.host.clone();
        let scope = self.scope.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(restore_abandoned(host, scope, snapshot, lock));
            }
            Err(_) => tracing::error!(
                "CRITICAL: {} abandoned with no runtime to restore {}",
                scope,
                snapshot
            ),
        }
    }
}

async fn restore_abandoned(
    host: Arc<dyn GitHost>,
    scope: RepoScope,
    snapshot: ObjectId,
    lock: Option<LockGuard>,
) {
    tracing::warn!("Session on {} abandoned, restoring {}", scope, snapshot.short());
    match host.update_ref(&scope, snapshot, true).await {
        Ok(()) => tracing::info!("Restored {} to {}", scope, snapshot.short()),
        Err(e) => tracing::error!(
            "CRITICAL: {} left inconsistent, could not restore {}: {}",
            scope,
            snapshot,
            e
        ),
    }
    if let Some(lock) = lock {
        if let Err(e) = lock.release().await {
            tracing::warn!("Failed to release lock for {} after restore: {}", scope, e);
        }
    }
}

/// Run `op` with the branch snapshotted beforehand and restored if `op`
/// fails. `op` receives the snapshot commit. Does not lock; see
/// [`GitStore::lock_and_run`](crate::store::GitStore::lock_and_run).
pub async fn with_rollback<T, F, Fut>(host: Arc<dyn GitHost>, scope: RepoScope, op: F) -> Result<T>
where
    F: FnOnce(ObjectId) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut wrapper = RollbackWrapper::new(host, scope);
    let snapshot = wrapper.snapshot().await?;
    let result = op(snapshot).await;
    wrapper.finish(result).await
}

/// Everything an operation may do to one site's branch while it holds the
/// site lock
#[derive(Clone)]
pub struct EditSession {
    content: ContentClient,
    tree: TreeTransaction,
    snapshot: ObjectId,
}

impl EditSession {
    pub fn new(host: Arc<dyn GitHost>, scope: RepoScope, snapshot: ObjectId) -> Self {
        Self {
            content: ContentClient::new(host.clone(), scope.clone()),
            tree: TreeTransaction::new(host, scope),
            snapshot,
        }
    }

    pub fn scope(&self) -> &RepoScope {
        self.content.scope()
    }

    /// Head commit when the session started
    pub fn snapshot(&self) -> ObjectId {
        self.snapshot
    }

    pub async fn read<P: StoragePath + ?Sized>(&self, path: &P) -> Result<FileContent> {
        self.content.read(path).await
    }

    pub async fn read_text<P: StoragePath + ?Sized>(&self, path: &P) -> Result<(String, ObjectId)> {
        self.content.read_text(path).await
    }

    pub async fn exists<P: StoragePath + ?Sized>(&self, path: &P) -> Result<bool> {
        self.content.exists(path).await
    }

    pub async fn create<P: StoragePath + ?Sized>(
        &self,
        path: &P,
        content: impl Into<Bytes>,
        message: &str,
    ) -> Result<ObjectId> {
        self.content.create(path, content, message).await
    }

    pub async fn update<P: StoragePath + ?Sized>(
        &self,
        path: &P,
        content: impl Into<Bytes>,
        sha: Option<ObjectId>,
        message: &str,
    ) -> Result<ObjectId> {
        self.content.update(path, content, sha, message).await
    }

    pub async fn write<P: StoragePath + ?Sized>(
        &self,
        path: &P,
        content: impl Into<Bytes>,
        sha: Option<ObjectId>,
        message: &str,
    ) -> Result<ObjectId> {
        self.content.write(path, content, sha, message).await
    }

    pub async fn delete<P: StoragePath + ?Sized>(
        &self,
        path: &P,
        sha: Option<ObjectId>,
        message: &str,
    ) -> Result<()> {
        self.content.delete(path, sha, message).await
    }

    pub async fn list_directory(&self, dir: &str) -> Result<Vec<DirEntry>> {
        self.content.list_directory(dir).await
    }

    /// Apply several changes as one commit
    pub async fn commit_changes(&self, changes: Vec<TreeChange>, message: &str) -> Result<CommitOutcome> {
        self.tree.commit(changes, message).await
    }

    /// Current branch head
    pub async fn head(&self) -> Result<RepoState> {
        self.tree.head().await
    }
}
