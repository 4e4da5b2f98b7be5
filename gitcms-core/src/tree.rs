//! Tree transaction engine
//!
//! Folds a set of path-level changes into exactly one commit:
//!
//! 1. read the branch head and its recursive tree listing
//! 2. upload new content as blobs ([`stage_blobs`])
//! 3. turn the staged changes into tree writes against the head tree ([`plan`])
//! 4. create the tree and a commit whose parent is the head read in step 1
//! 5. force the branch ref to the new commit
//!
//! Readers of the branch see either the old head or the new one, never a
//! subset of the changes. Step 5 overwrites whatever the ref points at, so
//! callers must hold the site's [`SiteMutex`](crate::mutex::SiteMutex) lock.

use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{Result, StoreError};
use crate::host::{GitHost, RepoScope, TreeWrite};
use crate::object::{Blob, FILE_MODE, ObjectId, ObjectKind, RepoState, Tree};
use crate::path::normalize;

/// A requested path-level change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeChange {
    /// Add a file or replace its content
    Upsert { path: String, content: Bytes },
    /// Remove an existing file
    Delete { path: String },
    /// Move a file, keeping its blob
    Rename { from: String, to: String },
    /// Move a directory, keeping its subtree
    RenameDirectory { from: String, to: String },
}

impl TreeChange {
    pub fn upsert(path: impl Into<String>, content: impl Into<Bytes>) -> Self {
        TreeChange::Upsert {
            path: path.into(),
            content: content.into(),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        TreeChange::Delete { path: path.into() }
    }

    pub fn rename(from: impl Into<String>, to: impl Into<String>) -> Self {
        TreeChange::Rename {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn rename_directory(from: impl Into<String>, to: impl Into<String>) -> Self {
        TreeChange::RenameDirectory {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// A change whose new content already exists on the host as a blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedChange {
    Blob { path: String, id: ObjectId },
    Delete { path: String },
    Rename { from: String, to: String },
    RenameDirectory { from: String, to: String },
}

/// Result of a committed tree transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Head the commit was built on
    pub parent: ObjectId,
    pub commit: ObjectId,
    pub tree: ObjectId,
}

/// Upload content for every upsert. Blobs whose id already appears in the
/// listing are not uploaded again.
pub async fn stage_blobs(
    host: &dyn GitHost,
    site: &str,
    listing: &Tree,
    changes: Vec<TreeChange>,
) -> Result<Vec<StagedChange>> {
    let known: BTreeSet<ObjectId> = listing
        .iter()
        .filter(|e| e.kind == ObjectKind::Blob)
        .map(|e| e.id)
        .collect();
    let mut staged = Vec::with_capacity(changes.len());
    for change in changes {
        staged.push(match change {
            TreeChange::Upsert { path, content } => {
                let local = Blob::from_bytes(content.to_vec()).id();
                let id = if known.contains(&local) {
                    local
                } else {
                    host.create_blob(site, &content).await?
                };
                StagedChange::Blob { path, id }
            }
            TreeChange::Delete { path } => StagedChange::Delete { path },
            TreeChange::Rename { from, to } => StagedChange::Rename { from, to },
            TreeChange::RenameDirectory { from, to } => StagedChange::RenameDirectory { from, to },
        });
    }
    Ok(staged)
}

/// Compute the tree writes that apply `staged` to the recursive `listing`.
///
/// Each path may be touched by at most one change. Removals come first in
/// the result, then additions, each sorted by path.
pub fn plan(listing: &Tree, staged: &[StagedChange]) -> Result<Vec<TreeWrite>> {
    if staged.is_empty() {
        return Err(StoreError::InvalidChange("empty change set".to_string()));
    }

    let mut planner = Planner {
        listing,
        touched: BTreeSet::new(),
        moved_dirs: Vec::new(),
        removals: BTreeMap::new(),
        additions: BTreeMap::new(),
    };
    for change in staged {
        planner.apply(change)?;
    }
    planner.check_moved_dirs()?;
    for path in planner.additions.keys() {
        planner.check_parents(path)?;
    }

    let mut writes: Vec<TreeWrite> = planner.removals.into_values().collect();
    writes.extend(planner.additions.into_values());
    Ok(writes)
}

struct Planner<'a> {
    listing: &'a Tree,
    touched: BTreeSet<String>,
    moved_dirs: Vec<String>,
    removals: BTreeMap<String, TreeWrite>,
    additions: BTreeMap<String, TreeWrite>,
}

impl Planner<'_> {
    fn apply(&mut self, change: &StagedChange) -> Result<()> {
        match change {
            StagedChange::Blob { path, id } => {
                let path = self.touch(path)?;
                if self.listing.contains(&path, ObjectKind::Tree) {
                    return Err(StoreError::Conflict(format!("{} is a directory", path)));
                }
                let mode = self.listing.get(&path).map(|e| e.mode).unwrap_or(FILE_MODE);
                self.additions.insert(path.clone(), TreeWrite::blob(path, *id, mode));
            }
            StagedChange::Delete { path } => {
                let path = self.touch(path)?;
                self.require_blob(&path)?;
                self.removals
                    .insert(path.clone(), TreeWrite::remove(path, ObjectKind::Blob));
            }
            StagedChange::Rename { from, to } => {
                let from = self.touch(from)?;
                let to = self.touch(to)?;
                let entry = self.require_blob(&from)?.clone();
                if self.listing.get(&to).is_some() {
                    return Err(StoreError::Conflict(format!("{} already exists", to)));
                }
                self.removals
                    .insert(from.clone(), TreeWrite::remove(from, ObjectKind::Blob));
                self.additions
                    .insert(to.clone(), TreeWrite::blob(to, entry.id, entry.mode));
            }
            StagedChange::RenameDirectory { from, to } => {
                let from = self.touch(from)?;
                let to = self.touch(to)?;
                let entry = match self.listing.get(&from) {
                    Some(e) if e.kind == ObjectKind::Tree => e.clone(),
                    _ => return Err(StoreError::NotFound(format!("directory {}", from))),
                };
                if to.starts_with(&format!("{}/", from)) {
                    return Err(StoreError::InvalidChange(format!(
                        "cannot move {} into itself",
                        from
                    )));
                }
                if self.listing.get(&to).is_some() {
                    return Err(StoreError::Conflict(format!("{} already exists", to)));
                }
                self.moved_dirs.push(from.clone());
                self.moved_dirs.push(to.clone());
                self.removals
                    .insert(from.clone(), TreeWrite::remove(from, ObjectKind::Tree));
                self.additions
                    .insert(to.clone(), TreeWrite::subtree(to, entry.id));
            }
        }
        Ok(())
    }

    fn touch(&mut self, path: &str) -> Result<String> {
        let path = normalize(path)?;
        if !self.touched.insert(path.clone()) {
            return Err(StoreError::InvalidChange(format!(
                "{} is changed more than once",
                path
            )));
        }
        Ok(path)
    }

    fn require_blob(&self, path: &str) -> Result<&crate::object::TreeEntry> {
        match self.listing.get(path) {
            Some(e) if e.kind == ObjectKind::Blob => Ok(e),
            _ => Err(StoreError::NotFound(path.to_string())),
        }
    }

    /// A new file cannot sit below an existing file that stays in place
    fn check_parents(&self, path: &str) -> Result<()> {
        let mut end = 0;
        while let Some(pos) = path[end..].find('/') {
            let parent = &path[..end + pos];
            if self.listing.contains(parent, ObjectKind::Blob) && !self.removals.contains_key(parent)
            {
                return Err(StoreError::Conflict(format!("{} is a file", parent)));
            }
            end += pos + 1;
        }
        Ok(())
    }

    /// Nothing else may be touched inside a directory that is being moved
    fn check_moved_dirs(&self) -> Result<()> {
        for dir in &self.moved_dirs {
            let prefix = format!("{}/", dir);
            if let Some(inner) = self.touched.iter().find(|p| p.starts_with(&prefix)) {
                return Err(StoreError::InvalidChange(format!(
                    "{} is inside moved directory {}",
                    inner, dir
                )));
            }
        }
        Ok(())
    }
}

/// Multi-file commits against one branch
#[derive(Clone)]
pub struct TreeTransaction {
    host: Arc<dyn GitHost>,
    scope: RepoScope,
}

impl TreeTransaction {
    pub fn new(host: Arc<dyn GitHost>, scope: RepoScope) -> Self {
        Self { host, scope }
    }

    pub fn scope(&self) -> &RepoScope {
        &self.scope
    }

    pub async fn head(&self) -> Result<RepoState> {
        self.host.get_repo_state(&self.scope).await
    }

    /// Apply `changes` to the branch head as a single commit
    pub async fn commit(&self, changes: Vec<TreeChange>, message: &str) -> Result<CommitOutcome> {
        if changes.is_empty() {
            return Err(StoreError::InvalidChange("empty change set".to_string()));
        }
        let head = self.host.get_repo_state(&self.scope).await?;
        let listing = self.host.get_tree(&self.scope.site, head.tree, true).await?;
        if listing.truncated {
            return Err(StoreError::RemoteUnavailable(format!(
                "tree listing for {} was truncated",
                self.scope
            )));
        }

        let staged = stage_blobs(self.host.as_ref(), &self.scope.site, &listing.tree, changes).await?;
        let writes = plan(&listing.tree, &staged)?;
        tracing::debug!(
            "{}: {} tree writes on top of {}",
            self.scope,
            writes.len(),
            head.tree.short()
        );

        let tree = self
            .host
            .create_tree(&self.scope.site, Some(head.tree), &writes)
            .await?;
        let commit = self
            .host
            .create_commit(&self.scope.site, message, tree, &[head.commit])
            .await?;
        self.host.update_ref(&self.scope, commit, true).await?;

        tracing::info!(
            "{}: committed {} on {} ({})",
            self.scope,
            commit.short(),
            head.commit.short(),
            message
        );
        Ok(CommitOutcome {
            parent: head.commit,
            commit,
            tree,
        })
    }
}
