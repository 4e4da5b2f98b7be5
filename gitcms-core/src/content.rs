//! Content object store client
//!
//! Reads and writes single files of one site's repository at one branch.
//! Unbatched writes commit straight to the branch; use
//! [`TreeTransaction`](crate::tree::TreeTransaction) to group several
//! changes into one commit.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use std::sync::Arc;

use crate::error::{Result, StoreError};
use crate::host::{FileContent, GitHost, RepoScope};
use crate::object::{ObjectId, ObjectKind, TreeEntry};
use crate::path::StoragePath;

/// Encode file content for the wire
pub fn encode_content(content: &[u8]) -> String {
    STANDARD.encode(content)
}

/// Decode wire content. Hosts wrap base64 at 60 columns, so ASCII
/// whitespace is dropped first.
pub fn decode_content(encoded: &str) -> Result<Vec<u8>> {
    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| StoreError::Decode(format!("invalid base64 content: {}", e)))
}

/// Entry directly inside a directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub path: String,
    pub kind: ObjectKind,
    pub sha: ObjectId,
}

/// File-level access to a site's repository at one branch
#[derive(Clone)]
pub struct ContentClient {
    host: Arc<dyn GitHost>,
    scope: RepoScope,
}

impl ContentClient {
    pub fn new(host: Arc<dyn GitHost>, scope: RepoScope) -> Self {
        Self { host, scope }
    }

    pub fn scope(&self) -> &RepoScope {
        &self.scope
    }

    /// Read a file's content and current blob id
    pub async fn read<P: StoragePath + ?Sized>(&self, path: &P) -> Result<FileContent> {
        let path = path.to_storage_path()?;
        tracing::debug!("read {}:{}", self.scope, path);
        self.host.read_file(&self.scope, &path).await
    }

    /// Read a file as UTF-8 text
    pub async fn read_text<P: StoragePath + ?Sized>(&self, path: &P) -> Result<(String, ObjectId)> {
        let file = self.read(path).await?;
        let text = String::from_utf8(file.content.to_vec())
            .map_err(|e| StoreError::Decode(format!("content is not UTF-8: {}", e)))?;
        Ok((text, file.sha))
    }

    /// Whether a file exists at the branch head
    pub async fn exists<P: StoragePath + ?Sized>(&self, path: &P) -> Result<bool> {
        match self.read(path).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create a file that must not exist yet
    pub async fn create<P: StoragePath + ?Sized>(
        &self,
        path: &P,
        content: impl Into<Bytes>,
        message: &str,
    ) -> Result<ObjectId> {
        let path = path.to_storage_path()?;
        let content = content.into();
        let sha = self.host.create_file(&self.scope, &path, &content, message).await?;
        tracing::info!("created {}:{} ({})", self.scope, path, sha.short());
        Ok(sha)
    }

    /// Replace a file's content. Without `sha` the current id is read
    /// first; the host still rejects the write if the file moves in between.
    pub async fn update<P: StoragePath + ?Sized>(
        &self,
        path: &P,
        content: impl Into<Bytes>,
        sha: Option<ObjectId>,
        message: &str,
    ) -> Result<ObjectId> {
        let path = path.to_storage_path()?;
        let content = content.into();
        let expected = match sha {
            Some(sha) => sha,
            None => self.host.read_file(&self.scope, &path).await?.sha,
        };
        let new_sha = self
            .host
            .update_file(&self.scope, &path, &content, expected, message)
            .await?;
        tracing::info!(
            "updated {}:{} {} -> {}",
            self.scope,
            path,
            expected.short(),
            new_sha.short()
        );
        Ok(new_sha)
    }

    /// Create or replace a file. With `sha` this is an update against that
    /// blob id; without it the current id is discovered and a missing file
    /// is created.
    pub async fn write<P: StoragePath + ?Sized>(
        &self,
        path: &P,
        content: impl Into<Bytes>,
        sha: Option<ObjectId>,
        message: &str,
    ) -> Result<ObjectId> {
        if sha.is_some() {
            return self.update(path, content, sha, message).await;
        }
        let path = path.to_storage_path()?;
        match self.host.read_file(&self.scope, &path).await {
            Ok(current) => self.update(&path, content, Some(current.sha), message).await,
            Err(StoreError::NotFound(_)) => self.create(&path, content, message).await,
            Err(e) => Err(e),
        }
    }

    /// Delete a file. Same `sha` semantics as [`update`](Self::update).
    pub async fn delete<P: StoragePath + ?Sized>(
        &self,
        path: &P,
        sha: Option<ObjectId>,
        message: &str,
    ) -> Result<()> {
        let path = path.to_storage_path()?;
        let expected = match sha {
            Some(sha) => sha,
            None => self.host.read_file(&self.scope, &path).await?.sha,
        };
        self.host.delete_file(&self.scope, &path, expected, message).await?;
        tracing::info!("deleted {}:{} ({})", self.scope, path, expected.short());
        Ok(())
    }

    /// Files and directories directly inside `dir` (empty string for root)
    pub async fn list_directory(&self, dir: &str) -> Result<Vec<DirEntry>> {
        let dir = dir.trim_matches('/');
        let head = self.host.get_repo_state(&self.scope).await?;
        let listing = self.host.get_tree(&self.scope.site, head.tree, true).await?;
        if listing.truncated {
            return Err(StoreError::RemoteUnavailable(format!(
                "tree listing for {} was truncated",
                self.scope
            )));
        }
        if !dir.is_empty() && !listing.tree.contains(dir, ObjectKind::Tree) {
            return Err(StoreError::NotFound(dir.to_string()));
        }
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };
        Ok(listing
            .tree
            .iter()
            .filter_map(|entry: &TreeEntry| {
                let name = entry.path.strip_prefix(&prefix)?;
                if name.contains('/') {
                    return None;
                }
                Some(DirEntry {
                    name: name.to_string(),
                    path: entry.path.clone(),
                    kind: entry.kind,
                    sha: entry.id,
                })
            })
            .collect())
    }
}
