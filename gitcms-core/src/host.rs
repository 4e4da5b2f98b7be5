//! Remote Git host abstraction
//!
//! The storage engine never touches a working copy; it drives the remote
//! host's content and git-data APIs through this trait. Backends:
//! [`GitHubClient`](crate::github::GitHubClient) for production and
//! [`MemoryHost`](crate::memory::MemoryHost) for tests.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::object::{DIR_MODE, FILE_MODE, ObjectId, ObjectKind, RepoState, Tree};

/// A site's repository at one branch
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoScope {
    pub site: String,
    pub branch: String,
}

impl RepoScope {
    pub fn new(site: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            branch: branch.into(),
        }
    }
}

impl std::fmt::Display for RepoScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.site, self.branch)
    }
}

/// Decoded file content plus its current blob id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub content: Bytes,
    pub sha: ObjectId,
}

/// One entry submitted when creating a tree on top of a base tree.
/// `sha: None` removes the path from the base tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeWrite {
    pub path: String,
    #[serde(serialize_with = "serialize_mode")]
    pub mode: u32,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    pub sha: Option<ObjectId>,
}

impl TreeWrite {
    pub fn blob(path: impl Into<String>, sha: ObjectId, mode: u32) -> Self {
        Self {
            path: path.into(),
            mode,
            kind: ObjectKind::Blob,
            sha: Some(sha),
        }
    }

    pub fn subtree(path: impl Into<String>, sha: ObjectId) -> Self {
        Self {
            path: path.into(),
            mode: DIR_MODE,
            kind: ObjectKind::Tree,
            sha: Some(sha),
        }
    }

    pub fn remove(path: impl Into<String>, kind: ObjectKind) -> Self {
        Self {
            path: path.into(),
            mode: if kind == ObjectKind::Tree { DIR_MODE } else { FILE_MODE },
            kind,
            sha: None,
        }
    }

    pub fn is_removal(&self) -> bool {
        self.sha.is_none()
    }
}

fn serialize_mode<S: serde::Serializer>(mode: &u32, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{:06o}", mode))
}

/// A tree fetched from the host. Recursive listings hold full paths.
#[derive(Debug, Clone)]
pub struct TreeListing {
    pub sha: ObjectId,
    pub tree: Tree,
    /// The host stopped listing before the end of the tree
    pub truncated: bool,
}

/// Operations the storage engine needs from a Git hosting API
#[async_trait]
pub trait GitHost: Send + Sync {
    /// Read one file at the branch head
    async fn read_file(&self, scope: &RepoScope, path: &str) -> Result<FileContent>;

    /// Create a file that must not exist yet; commits to the branch
    async fn create_file(
        &self,
        scope: &RepoScope,
        path: &str,
        content: &[u8],
        message: &str,
    ) -> Result<ObjectId>;

    /// Replace a file whose current blob id is `sha`; commits to the branch
    async fn update_file(
        &self,
        scope: &RepoScope,
        path: &str,
        content: &[u8],
        sha: ObjectId,
        message: &str,
    ) -> Result<ObjectId>;

    /// Delete a file whose current blob id is `sha`; commits to the branch
    async fn delete_file(
        &self,
        scope: &RepoScope,
        path: &str,
        sha: ObjectId,
        message: &str,
    ) -> Result<()>;

    /// Current head commit of the branch and its root tree
    async fn get_repo_state(&self, scope: &RepoScope) -> Result<RepoState>;

    /// Fetch a tree object, optionally expanded recursively
    async fn get_tree(&self, site: &str, tree: ObjectId, recursive: bool) -> Result<TreeListing>;

    /// Upload a blob without referencing it from any tree
    async fn create_blob(&self, site: &str, content: &[u8]) -> Result<ObjectId>;

    /// Create a tree by applying `writes` on top of `base_tree`
    async fn create_tree(
        &self,
        site: &str,
        base_tree: Option<ObjectId>,
        writes: &[TreeWrite],
    ) -> Result<ObjectId>;

    /// Create a commit object; does not move any ref
    async fn create_commit(
        &self,
        site: &str,
        message: &str,
        tree: ObjectId,
        parents: &[ObjectId],
    ) -> Result<ObjectId>;

    /// Point the branch at `commit`
    async fn update_ref(&self, scope: &RepoScope, commit: ObjectId, force: bool) -> Result<()>;
}
