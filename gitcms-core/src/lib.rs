//! GitCMS Core Library
//!
//! Git-backed content storage for static sites, one repository per site:
//! - Object model and git object ids (Blob, Tree, Commit)
//! - Logical content paths mapped to repository paths
//! - Remote Git host abstraction with GitHub REST and in-memory backends
//! - Single-file content operations with optimistic concurrency
//! - Multi-file changes folded into one commit
//! - Per-site distributed mutex (in-memory or SQLite lock store)
//! - Rollback-aware edit sessions behind `GitStore::lock_and_run`

pub mod config;
pub mod content;
pub mod error;
pub mod github;
pub mod host;
pub mod memory;
pub mod mutex;
pub mod object;
pub mod path;
pub mod session;
pub mod store;
pub mod tree;

pub use config::StoreConfig;
pub use content::{ContentClient, DirEntry};
pub use error::{Result, StoreError};
pub use github::GitHubClient;
pub use host::{FileContent, GitHost, RepoScope, TreeListing, TreeWrite};
pub use memory::{HostOp, MemoryHost};
pub use mutex::{LockGuard, LockRecord, LockStore, MemoryLockStore, SiteMutex, SqliteLockStore};
pub use object::{Blob, Commit, ObjectId, ObjectKind, RepoState, Tree, TreeEntry};
pub use path::{ContentDir, ContentPath, StoragePath};
pub use session::{EditSession, RollbackWrapper, SessionState, with_rollback};
pub use store::GitStore;
pub use tree::{CommitOutcome, TreeChange, TreeTransaction};
