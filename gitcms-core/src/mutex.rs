//! Distributed per-site mutex
//!
//! One edit session per site at a time. Lock records live in a shared
//! [`LockStore`]; acquisition is a single conditional create at the store,
//! never a check followed by a write. This is a try-lock: a held lock fails
//! immediately with [`StoreError::LockHeld`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::{Result, StoreError};

const RELEASE_ATTEMPTS: u32 = 4;
const RELEASE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// A held lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub site: String,
    /// Token identifying the session that holds the lock
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    /// `None` means the lock never expires on its own
    pub expires_at: Option<DateTime<Utc>>,
}

impl LockRecord {
    pub fn new(site: impl Into<String>, ttl: Option<chrono::Duration>) -> Self {
        let now = Utc::now();
        Self {
            site: site.into(),
            holder: uuid::Uuid::new_v4().to_string(),
            acquired_at: now,
            expires_at: ttl.map(|ttl| now + ttl),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Shared, strongly consistent storage for lock records
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Store `record` unless a live record exists for its site. Expired
    /// records are replaced. Returns whether the lock was acquired.
    async fn try_acquire(&self, record: &LockRecord) -> Result<bool>;

    /// Delete the site's record, only if `holder` matches when given.
    /// Returns whether a record was deleted.
    async fn release(&self, site: &str, holder: Option<&str>) -> Result<bool>;

    /// Push back the expiry of a record still owned by `holder`
    async fn refresh(&self, site: &str, holder: &str, expires_at: DateTime<Utc>) -> Result<bool>;

    /// Current record for a site, expired or not
    async fn get(&self, site: &str) -> Result<Option<LockRecord>>;
}

/// Process-local lock store
#[derive(Default)]
pub struct MemoryLockStore {
    records: tokio::sync::Mutex<HashMap<String, LockRecord>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, record: &LockRecord) -> Result<bool> {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.get(&record.site) {
            if !existing.is_expired(Utc::now()) {
                return Ok(false);
            }
        }
        records.insert(record.site.clone(), record.clone());
        Ok(true)
    }

    async fn release(&self, site: &str, holder: Option<&str>) -> Result<bool> {
        let mut records = self.records.lock().await;
        match records.get(site) {
            Some(existing) if holder.is_none_or(|h| h == existing.holder) => {
                records.remove(site);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn refresh(&self, site: &str, holder: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let mut records = self.records.lock().await;
        match records.get_mut(site) {
            Some(existing) if existing.holder == holder => {
                existing.expires_at = Some(expires_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, site: &str) -> Result<Option<LockRecord>> {
        Ok(self.records.lock().await.get(site).cloned())
    }
}

/// Lock store in an SQLite database, shared by every process that opens the
/// same file
pub struct SqliteLockStore {
    conn: Mutex<Connection>,
}

impl SqliteLockStore {
    /// Open or create the lock database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::LockStore(format!("cannot create {:?}: {}", parent, e)))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS site_locks (
                site TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                acquired_at INTEGER NOT NULL,
                expires_at INTEGER
            ) WITHOUT ROWID;",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::LockStore("connection mutex poisoned".to_string()))?;
        Ok(f(&conn)?)
    }
}

fn millis_to_time(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

#[async_trait]
impl LockStore for SqliteLockStore {
    async fn try_acquire(&self, record: &LockRecord) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let changed = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO site_locks (site, holder, acquired_at, expires_at) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(site) DO UPDATE SET holder=excluded.holder, acquired_at=excluded.acquired_at, \
                 expires_at=excluded.expires_at \
                 WHERE site_locks.expires_at IS NOT NULL AND site_locks.expires_at <= ?5",
                rusqlite::params![
                    record.site,
                    record.holder,
                    record.acquired_at.timestamp_millis(),
                    record.expires_at.map(|t| t.timestamp_millis()),
                    now
                ],
            )
        })?;
        Ok(changed == 1)
    }

    async fn release(&self, site: &str, holder: Option<&str>) -> Result<bool> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM site_locks WHERE site=?1 AND (?2 IS NULL OR holder=?2)",
                rusqlite::params![site, holder],
            )
        })?;
        Ok(changed == 1)
    }

    async fn refresh(&self, site: &str, holder: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE site_locks SET expires_at=?3 WHERE site=?1 AND holder=?2",
                rusqlite::params![site, holder, expires_at.timestamp_millis()],
            )
        })?;
        Ok(changed == 1)
    }

    async fn get(&self, site: &str) -> Result<Option<LockRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT site, holder, acquired_at, expires_at FROM site_locks WHERE site=?1",
                rusqlite::params![site],
                |row| {
                    let expires: Option<i64> = row.get(3)?;
                    Ok(LockRecord {
                        site: row.get(0)?,
                        holder: row.get(1)?,
                        acquired_at: millis_to_time(row.get(2)?),
                        expires_at: expires.map(millis_to_time),
                    })
                },
            )
            .optional()
        })
    }
}

/// Try-lock over a [`LockStore`], keyed by site id
#[derive(Clone)]
pub struct SiteMutex {
    store: Arc<dyn LockStore>,
    ttl: Option<Duration>,
}

impl SiteMutex {
    /// Locks without expiry: a holder that never releases keeps the site
    /// locked until [`unlock`](Self::unlock) is called by an operator
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store, ttl: None }
    }

    /// Locks expire after `ttl` unless the holder's heartbeat refreshes them
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Acquire the site's lock or fail with `LockHeld`
    pub async fn lock(&self, site: &str) -> Result<LockGuard> {
        let ttl = self.ttl.map(to_chrono).transpose()?;
        let record = LockRecord::new(site, ttl);
        if !self.store.try_acquire(&record).await? {
            tracing::info!("Lock for site {} is held by another session", site);
            return Err(StoreError::LockHeld(site.to_string()));
        }
        tracing::debug!("Locked site {} (holder {})", site, record.holder);

        let heartbeat = match (self.ttl, ttl) {
            (Some(period), Some(ttl)) => Some(spawn_heartbeat(
                self.store.clone(),
                record.site.clone(),
                record.holder.clone(),
                period,
                ttl,
            )),
            _ => None,
        };
        Ok(LockGuard {
            store: self.store.clone(),
            site: record.site,
            holder: record.holder,
            released: false,
            heartbeat,
        })
    }

    /// Remove the site's lock whoever holds it. Fails with `UnlockFailed`
    /// when no lock exists.
    pub async fn unlock(&self, site: &str) -> Result<()> {
        if self.store.release(site, None).await? {
            tracing::info!("Unlocked site {}", site);
            Ok(())
        } else {
            Err(StoreError::UnlockFailed(site.to_string()))
        }
    }

    /// Current lock record, if any
    pub async fn status(&self, site: &str) -> Result<Option<LockRecord>> {
        self.store.get(site).await
    }
}

fn to_chrono(ttl: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(ttl).map_err(|e| StoreError::Config(format!("invalid lock ttl: {}", e)))
}

fn spawn_heartbeat(
    store: Arc<dyn LockStore>,
    site: String,
    holder: String,
    ttl: Duration,
    chrono_ttl: chrono::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval((ttl / 3).max(Duration::from_millis(1)));
        interval.tick().await;
        loop {
            interval.tick().await;
            match store.refresh(&site, &holder, Utc::now() + chrono_ttl).await {
                Ok(true) => tracing::trace!("Refreshed lock for site {}", site),
                Ok(false) => {
                    tracing::warn!("Lock for site {} was lost before release", site);
                    break;
                }
                Err(e) => tracing::warn!("Failed to refresh lock for site {}: {}", site, e),
            }
        }
    })
}

/// Proof of a held site lock. Release explicitly with
/// [`release`](Self::release); a guard dropped without release (early
/// return, panic, cancelled future) releases the lock in the background.
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    site: String,
    holder: String,
    released: bool,
    heartbeat: Option<JoinHandle<()>>,
}

impl LockGuard {
    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Release the lock. `UnlockFailed` if this guard no longer owns it.
    /// A store error leaves the guard unreleased, so dropping it retries in
    /// the background.
    pub async fn release(mut self) -> Result<()> {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        let released = self.store.release(&self.site, Some(&self.holder)).await?;
        self.released = true;
        if released {
            tracing::debug!("Released lock for site {}", self.site);
            Ok(())
        } else {
            Err(StoreError::UnlockFailed(self.site.clone()))
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        if self.released {
            return;
        }
        let store = self.store.clone();
        let site = std::mem::take(&mut self.site);
        let holder = std::mem::take(&mut self.holder);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release_abandoned(store, site, holder));
            }
            Err(_) => tracing::error!("Lock for site {} leaked: no runtime to release it", site),
        }
    }
}

/// Background release of a guard that was dropped or whose release failed
async fn release_abandoned(store: Arc<dyn LockStore>, site: String, holder: String) {
    for attempt in 1..=RELEASE_ATTEMPTS {
        match store.release(&site, Some(&holder)).await {
            Ok(true) => {
                tracing::debug!("Released abandoned lock for site {}", site);
                return;
            }
            Ok(false) => {
                tracing::warn!("Abandoned lock for site {} was already gone", site);
                return;
            }
            Err(e) if attempt < RELEASE_ATTEMPTS => {
                tracing::warn!("Failed to release lock for site {} (attempt {}): {}", site, attempt, e);
                tokio::time::sleep(RELEASE_RETRY_DELAY * attempt).await;
            }
            Err(e) => tracing::error!("Failed to release abandoned lock for site {}: {}", site, e),
        }
    }
}
