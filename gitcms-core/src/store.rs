//! Storage engine facade
//!
//! [`GitStore::lock_and_run`] is the entry point for every mutating request:
//! lock the site, snapshot the branch, run the caller's operation with an
//! [`EditSession`], roll back on failure and release the lock on every path.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::StoreConfig;
use crate::content::ContentClient;
use crate::error::{Result, StoreError};
use crate::github::GitHubClient;
use crate::host::{GitHost, RepoScope};
use crate::mutex::SiteMutex;
use crate::session::{EditSession, RollbackWrapper};

#[derive(Clone)]
pub struct GitStore {
    host: Arc<dyn GitHost>,
    mutex: SiteMutex,
    default_branch: String,
    operation_timeout: Option<Duration>,
}

impl GitStore {
    pub fn new(host: Arc<dyn GitHost>, mutex: SiteMutex, default_branch: impl Into<String>) -> Self {
        Self {
            host,
            mutex,
            default_branch: default_branch.into(),
            operation_timeout: None,
        }
    }

    /// GitHub-backed store with the configured lock store
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let host = Arc::new(GitHubClient::from_config(config)?);
        let store = Self::new(host, config.site_mutex()?, config.default_branch.clone());
        Ok(match config.operation_timeout() {
            Some(timeout) => store.with_operation_timeout(timeout),
            None => store,
        })
    }

    /// Bound every locked operation; expiry counts as a failure
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    pub fn default_branch(&self) -> &str {
        &self.default_branch
    }

    pub fn host(&self) -> &Arc<dyn GitHost> {
        &self.host
    }

    pub fn mutex(&self) -> &SiteMutex {
        &self.mutex
    }

    /// Lock-free client for read-only requests. `None` means the default
    /// branch.
    pub fn reader(&self, site: &str, branch: Option<&str>) -> ContentClient {
        ContentClient::new(self.host.clone(), self.scope(site, branch))
    }

    fn scope(&self, site: &str, branch: Option<&str>) -> RepoScope {
        RepoScope::new(site, branch.unwrap_or(&self.default_branch))
    }

    /// Run `op` with exclusive access to the site's branch.
    ///
    /// Fails with `LockHeld` without running `op` if another session holds
    /// the site. Any error from `op` (or a timeout) restores the branch to
    /// its head at entry before being returned.
    pub async fn lock_and_run<T, F, Fut>(&self, site: &str, branch: Option<&str>, op: F) -> Result<T>
    where
        F: FnOnce(EditSession) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let scope = self.scope(site, branch);
        let mut wrapper = RollbackWrapper::new(self.host.clone(), scope.clone());
        wrapper.hold_lock(self.mutex.lock(site).await?);

        // Dropping `wrapper` mid-operation restores the snapshot before the
        // lock is released.
        let result = self.run_locked(&mut wrapper, &scope, op).await;

        if let Some(guard) = wrapper.take_lock() {
            if let Err(e) = guard.release().await {
                tracing::warn!("Failed to release lock for {} after operation: {}", scope, e);
            }
        }
        result
    }

    async fn run_locked<T, F, Fut>(
        &self,
        wrapper: &mut RollbackWrapper,
        scope: &RepoScope,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce(EditSession) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let snapshot = wrapper.snapshot().await?;
        let session = EditSession::new(self.host.clone(), scope.clone(), snapshot);

        let result = match self.operation_timeout {
            Some(limit) => match tokio::time::timeout(limit, op(session)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!("Operation on {} exceeded {:?}", scope, limit);
                    Err(StoreError::Timeout(limit))
                }
            },
            None => op(session).await,
        };
        wrapper.finish(result).await
    }
}
