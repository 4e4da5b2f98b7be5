//! In-memory Git host
//!
//! Keeps blobs, trees, commits and branch refs per site in process memory
//! and applies the same precondition checks the GitHub API does. Every call
//! holds the state lock for its whole duration, so each host operation is
//! atomic with respect to concurrent readers. Faults can be injected per
//! operation to exercise rollback paths.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tokio::sync::RwLock;

use crate::error::{Result, StoreError};
use crate::host::{FileContent, GitHost, RepoScope, TreeListing, TreeWrite};
use crate::object::{Blob, Commit, ObjectId, ObjectKind, RepoState, Tree, TreeEntry, FILE_MODE};

/// Host operations, used to target injected faults and count calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOp {
    ReadFile,
    CreateFile,
    UpdateFile,
    DeleteFile,
    GetRepoState,
    GetTree,
    CreateBlob,
    CreateTree,
    CreateCommit,
    UpdateRef,
}

#[derive(Debug, Clone)]
struct Fault {
    op: HostOp,
    path: Option<String>,
    remaining: usize,
}

/// One site's object database and refs
#[derive(Default)]
struct SiteRepo {
    blobs: HashMap<ObjectId, Bytes>,
    /// Single-level trees; entry paths are names
    trees: HashMap<ObjectId, Tree>,
    commits: HashMap<ObjectId, Commit>,
    refs: HashMap<String, ObjectId>,
}

impl SiteRepo {
    fn put_blob(&mut self, data: &[u8]) -> ObjectId {
        let id = Blob::from_bytes(data.to_vec()).id();
        self.blobs.entry(id).or_insert_with(|| Bytes::copy_from_slice(data));
        id
    }

    fn tree(&self, id: &ObjectId) -> Result<&Tree> {
        self.trees
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("tree {}", id)))
    }

    fn commit(&self, id: &ObjectId) -> Result<&Commit> {
        self.commits
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("commit {}", id)))
    }

    fn head(&self, branch: &str) -> Result<RepoState> {
        let commit = *self
            .refs
            .get(branch)
            .ok_or_else(|| StoreError::NotFound(format!("branch {}", branch)))?;
        let tree = self.commit(&commit)?.tree_id;
        Ok(RepoState { commit, tree })
    }

    /// Blob entries below `tree_id`, keyed by full path
    fn flatten(&self, tree_id: &ObjectId, prefix: &str, out: &mut Tree) -> Result<()> {
        for entry in self.tree(tree_id)?.iter() {
            let path = join(prefix, &entry.path);
            match entry.kind {
                ObjectKind::Tree => self.flatten(&entry.id, &path, out)?,
                _ => out.insert(TreeEntry::new(path, entry.id, entry.kind, entry.mode)),
            }
        }
        Ok(())
    }

    /// Blob and tree entries below `tree_id`, in listing order
    fn list_recursive(&self, tree_id: &ObjectId, prefix: &str, out: &mut Tree) -> Result<()> {
        for entry in self.tree(tree_id)?.iter() {
            let path = join(prefix, &entry.path);
            out.insert(TreeEntry::new(path.clone(), entry.id, entry.kind, entry.mode));
            if entry.kind == ObjectKind::Tree {
                self.list_recursive(&entry.id, &path, out)?;
            }
        }
        Ok(())
    }

    /// Store nested trees for a flat blob listing and return the root id
    fn build(&mut self, flat: &Tree) -> Result<ObjectId> {
        let entries: Vec<(String, TreeEntry)> = flat
            .iter()
            .map(|e| (e.path.clone(), e.clone()))
            .collect();
        self.build_level(entries)
    }

    fn build_level(&mut self, entries: Vec<(String, TreeEntry)>) -> Result<ObjectId> {
        let mut level = Tree::new();
        let mut children: BTreeMap<String, Vec<(String, TreeEntry)>> = BTreeMap::new();
        for (rel, entry) in entries {
            match rel.split_once('/') {
                Some((dir, rest)) => children
                    .entry(dir.to_string())
                    .or_default()
                    .push((rest.to_string(), entry)),
                None => level.insert(TreeEntry::new(rel, entry.id, entry.kind, entry.mode)),
            }
        }
        for (dir, nested) in children {
            if level.get(&dir).is_some() {
                return Err(StoreError::Conflict(format!(
                    "'{}' is both a file and a directory",
                    dir
                )));
            }
            let child = self.build_level(nested)?;
            level.insert(TreeEntry::tree(dir, child));
        }
        let id = level.id();
        self.trees.entry(id).or_insert(level);
        Ok(id)
    }

    fn lookup(&self, root: &ObjectId, path: &str) -> Result<Option<TreeEntry>> {
        let mut current = *root;
        let parts: Vec<&str> = path.split('/').collect();
        for (i, part) in parts.iter().enumerate() {
            let Some(entry) = self.tree(&current)?.get(part) else {
                return Ok(None);
            };
            if i == parts.len() - 1 {
                return Ok(Some(entry.clone()));
            }
            if entry.kind != ObjectKind::Tree {
                return Ok(None);
            }
            current = entry.id;
        }
        Ok(None)
    }

    /// Commit a new root tree on top of the branch head and advance the ref
    fn commit_on_branch(&mut self, branch: &str, tree: ObjectId, message: &str) -> Result<ObjectId> {
        let head = self.head(branch)?;
        let commit = Commit::new(
            tree,
            vec![head.commit],
            "gitcms".to_string(),
            message.to_string(),
            chrono::Utc::now().timestamp(),
        );
        let id = commit.id();
        self.commits.insert(id, commit);
        self.refs.insert(branch.to_string(), id);
        Ok(id)
    }

    fn is_ancestor(&self, ancestor: &ObjectId, of: &ObjectId) -> bool {
        let mut stack = vec![*of];
        while let Some(id) = stack.pop() {
            if id == *ancestor {
                return true;
            }
            if let Some(commit) = self.commits.get(&id) {
                stack.extend(commit.parents.iter().copied());
            }
        }
        false
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

fn under(path: &str, dir: &str) -> bool {
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

/// In-memory [`GitHost`] with per-site repositories
#[derive(Default)]
pub struct MemoryHost {
    sites: RwLock<HashMap<String, SiteRepo>>,
    faults: Mutex<Vec<Fault>>,
    calls: Mutex<HashMap<HostOp, usize>>,
}

impl MemoryHost {
    /// Create an empty host with no site repositories
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision a site repository whose `branch` holds `files` in one
    /// initial commit
    pub async fn create_repo(&self, scope: &RepoScope, files: &[(&str, &[u8])]) -> Result<ObjectId> {
        let mut sites = self.sites.write().await;
        if sites.contains_key(&scope.site) {
            return Err(StoreError::Conflict(format!("repository {} already exists", scope.site)));
        }
        let mut repo = SiteRepo::default();
        let mut flat = Tree::new();
        for (path, data) in files {
            let path = crate::path::normalize(path)?;
            let id = repo.put_blob(data);
            flat.insert(TreeEntry::blob(path, id));
        }
        let tree = repo.build(&flat)?;
        let commit = Commit::new(
            tree,
            vec![],
            "gitcms".to_string(),
            "Initial commit".to_string(),
            chrono::Utc::now().timestamp(),
        );
        let id = commit.id();
        repo.commits.insert(id, commit);
        repo.refs.insert(scope.branch.clone(), id);
        sites.insert(scope.site.clone(), repo);
        Ok(id)
    }

    /// Make the next `times` calls of `op` fail with `RemoteUnavailable`.
    /// With `path`, only calls touching that path count.
    pub fn inject_fault(&self, op: HostOp, path: Option<&str>, times: usize) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push(Fault {
                op,
                path: path.map(str::to_string),
                remaining: times,
            });
        }
    }

    /// Number of calls made to `op` so far, including failed ones
    pub fn call_count(&self, op: HostOp) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.get(&op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Commit messages from the branch head back to the root
    pub async fn history(&self, scope: &RepoScope) -> Result<Vec<String>> {
        let sites = self.sites.read().await;
        let repo = site(&sites, &scope.site)?;
        let mut next = Some(repo.head(&scope.branch)?.commit);
        let mut messages = Vec::new();
        while let Some(id) = next {
            let commit = repo.commit(&id)?;
            messages.push(commit.message.clone());
            next = commit.parents.first().copied();
        }
        Ok(messages)
    }

    fn enter(&self, op: HostOp, path: Option<&str>) -> Result<()> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(op).or_insert(0) += 1;
        }
        let Ok(mut faults) = self.faults.lock() else {
            return Ok(());
        };
        let hit = faults.iter_mut().find(|f| {
            f.op == op && f.remaining > 0 && (f.path.is_none() || f.path.as_deref() == path)
        });
        if let Some(fault) = hit {
            fault.remaining -= 1;
            tracing::debug!("Injected fault for {:?} {:?}", op, path);
            return Err(StoreError::RemoteUnavailable(format!(
                "injected fault: {:?}{}",
                op,
                path.map(|p| format!(" {}", p)).unwrap_or_default()
            )));
        }
        faults.retain(|f| f.remaining > 0);
        Ok(())
    }
}

fn site<'a>(sites: &'a HashMap<String, SiteRepo>, name: &str) -> Result<&'a SiteRepo> {
    sites
        .get(name)
        .ok_or_else(|| StoreError::NotFound(format!("repository {}", name)))
}

fn site_mut<'a>(sites: &'a mut HashMap<String, SiteRepo>, name: &str) -> Result<&'a mut SiteRepo> {
    sites
        .get_mut(name)
        .ok_or_else(|| StoreError::NotFound(format!("repository {}", name)))
}

#[async_trait]
impl GitHost for MemoryHost {
    async fn read_file(&self, scope: &RepoScope, path: &str) -> Result<FileContent> {
        self.enter(HostOp::ReadFile, Some(path))?;
        let sites = self.sites.read().await;
        let repo = site(&sites, &scope.site)?;
        let head = repo.head(&scope.branch)?;
        match repo.lookup(&head.tree, path)? {
            Some(entry) if entry.kind == ObjectKind::Blob => {
                let content = repo
                    .blobs
                    .get(&entry.id)
                    .cloned()
                    .ok_or_else(|| StoreError::NotFound(format!("blob {}", entry.id)))?;
                Ok(FileContent {
                    content,
                    sha: entry.id,
                })
            }
            _ => Err(StoreError::NotFound(path.to_string())),
        }
    }

    async fn create_file(
        &self,
        scope: &RepoScope,
        path: &str,
        content: &[u8],
        message: &str,
    ) -> Result<ObjectId> {
        self.enter(HostOp::CreateFile, Some(path))?;
        let mut sites = self.sites.write().await;
        let repo = site_mut(&mut sites, &scope.site)?;
        let head = repo.head(&scope.branch)?;
        if repo.lookup(&head.tree, path)?.is_some() {
            return Err(StoreError::Conflict(format!("{} already exists", path)));
        }
        let mut flat = Tree::new();
        repo.flatten(&head.tree, "", &mut flat)?;
        let id = repo.put_blob(content);
        flat.insert(TreeEntry::blob(path, id));
        let tree = repo.build(&flat)?;
        repo.commit_on_branch(&scope.branch, tree, message)?;
        Ok(id)
    }

    async fn update_file(
        &self,
        scope: &RepoScope,
        path: &str,
        content: &[u8],
        sha: ObjectId,
        message: &str,
    ) -> Result<ObjectId> {
        self.enter(HostOp::UpdateFile, Some(path))?;
        let mut sites = self.sites.write().await;
        let repo = site_mut(&mut sites, &scope.site)?;
        let head = repo.head(&scope.branch)?;
        let current = match repo.lookup(&head.tree, path)? {
            Some(entry) if entry.kind == ObjectKind::Blob => entry,
            _ => return Err(StoreError::NotFound(path.to_string())),
        };
        if current.id != sha {
            return Err(StoreError::Conflict(format!(
                "{} is at {} but does not match {}",
                path, current.id, sha
            )));
        }
        let mut flat = Tree::new();
        repo.flatten(&head.tree, "", &mut flat)?;
        let id = repo.put_blob(content);
        flat.insert(TreeEntry::new(path, id, ObjectKind::Blob, current.mode));
        let tree = repo.build(&flat)?;
        repo.commit_on_branch(&scope.branch, tree, message)?;
        Ok(id)
    }

    async fn delete_file(
        &self,
        scope: &RepoScope,
        path: &str,
        sha: ObjectId,
        message: &str,
    ) -> Result<()> {
        self.enter(HostOp::DeleteFile, Some(path))?;
        let mut sites = self.sites.write().await;
        let repo = site_mut(&mut sites, &scope.site)?;
        let head = repo.head(&scope.branch)?;
        match repo.lookup(&head.tree, path)? {
            Some(entry) if entry.kind == ObjectKind::Blob => {
                if entry.id != sha {
                    return Err(StoreError::Conflict(format!(
                        "{} is at {} but does not match {}",
                        path, entry.id, sha
                    )));
                }
            }
            _ => return Err(StoreError::NotFound(path.to_string())),
        }
        let mut flat = Tree::new();
        repo.flatten(&head.tree, "", &mut flat)?;
        flat.remove(path);
        let tree = repo.build(&flat)?;
        repo.commit_on_branch(&scope.branch, tree, message)?;
        Ok(())
    }

    async fn get_repo_state(&self, scope: &RepoScope) -> Result<RepoState> {
        self.enter(HostOp::GetRepoState, None)?;
        let sites = self.sites.read().await;
        site(&sites, &scope.site)?.head(&scope.branch)
    }

    async fn get_tree(&self, site_name: &str, tree: ObjectId, recursive: bool) -> Result<TreeListing> {
        self.enter(HostOp::GetTree, None)?;
        let sites = self.sites.read().await;
        let repo = site(&sites, site_name)?;
        let listing = if recursive {
            let mut out = Tree::new();
            repo.list_recursive(&tree, "", &mut out)?;
            out
        } else {
            repo.tree(&tree)?.clone()
        };
        Ok(TreeListing {
            sha: tree,
            tree: listing,
            truncated: false,
        })
    }

    async fn create_blob(&self, site_name: &str, content: &[u8]) -> Result<ObjectId> {
        self.enter(HostOp::CreateBlob, None)?;
        let mut sites = self.sites.write().await;
        Ok(site_mut(&mut sites, site_name)?.put_blob(content))
    }

    async fn create_tree(
        &self,
        site_name: &str,
        base_tree: Option<ObjectId>,
        writes: &[TreeWrite],
    ) -> Result<ObjectId> {
        self.enter(HostOp::CreateTree, None)?;
        let mut sites = self.sites.write().await;
        let repo = site_mut(&mut sites, site_name)?;
        let mut flat = Tree::new();
        if let Some(base) = base_tree {
            repo.flatten(&base, "", &mut flat)?;
        }
        for write in writes {
            let path = crate::path::normalize(&write.path)?;
            match (write.kind, write.sha) {
                (_, None) => {
                    let before = flat.len();
                    flat.remove(&path);
                    flat.entries.retain(|p, _| !under(p, &path));
                    if flat.len() == before {
                        return Err(StoreError::Conflict(format!("cannot remove missing path {}", path)));
                    }
                }
                (ObjectKind::Tree, Some(id)) => {
                    flat.entries.retain(|p, _| !under(p, &path));
                    let mut subtree = Tree::new();
                    repo.flatten(&id, &path, &mut subtree)?;
                    flat.entries.extend(subtree.entries);
                }
                (_, Some(id)) => {
                    if !repo.blobs.contains_key(&id) {
                        return Err(StoreError::Conflict(format!("unknown blob {}", id)));
                    }
                    let mode = if write.mode == 0 { FILE_MODE } else { write.mode };
                    flat.insert(TreeEntry::new(path, id, ObjectKind::Blob, mode));
                }
            }
        }
        repo.build(&flat)
    }

    async fn create_commit(
        &self,
        site_name: &str,
        message: &str,
        tree: ObjectId,
        parents: &[ObjectId],
    ) -> Result<ObjectId> {
        self.enter(HostOp::CreateCommit, None)?;
        let mut sites = self.sites.write().await;
        let repo = site_mut(&mut sites, site_name)?;
        repo.tree(&tree)?;
        for parent in parents {
            repo.commit(parent)?;
        }
        let commit = Commit::new(
            tree,
            parents.to_vec(),
            "gitcms".to_string(),
            message.to_string(),
            chrono::Utc::now().timestamp(),
        );
        let id = commit.id();
        repo.commits.insert(id, commit);
        Ok(id)
    }

    async fn update_ref(&self, scope: &RepoScope, commit: ObjectId, force: bool) -> Result<()> {
        self.enter(HostOp::UpdateRef, None)?;
        let mut sites = self.sites.write().await;
        let repo = site_mut(&mut sites, &scope.site)?;
        repo.commit(&commit)?;
        let current = repo.head(&scope.branch)?.commit;
        if !force && !repo.is_ancestor(&current, &commit) {
            return Err(StoreError::Conflict(format!(
                "update of {} to {} is not a fast forward",
                scope.branch, commit
            )));
        }
        repo.refs.insert(scope.branch.clone(), commit);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> RepoScope {
        RepoScope::new("acme", "staging")
    }

    async fn seeded() -> MemoryHost {
        let host = MemoryHost::new();
        host.create_repo(
            &scope(),
            &[
                ("_config.yml", "title: Acme".as_bytes()),
                ("pages/foo.md", "# Foo".as_bytes()),
                ("_news/a.md", "a".as_bytes()),
            ],
        )
        .await
        .unwrap();
        host
    }

    #[tokio::test]
    async fn test_read_seeded_file() {
        let host = seeded().await;
        let file = host.read_file(&scope(), "pages/foo.md").await.unwrap();
        assert_eq!(file.content.as_ref(), b"# Foo");
        assert_eq!(file.sha, Blob::from_bytes(b"# Foo".to_vec()).id());
        assert!(matches!(
            host.read_file(&scope(), "pages/missing.md").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            host.read_file(&scope(), "pages").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_requires_current_sha() {
        let host = seeded().await;
        let stale = host.read_file(&scope(), "pages/foo.md").await.unwrap().sha;
        host.update_file(&scope(), "pages/foo.md", b"v2", stale, "v2").await.unwrap();
        let err = host
            .update_file(&scope(), "pages/foo.md", b"v3", stale, "v3")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        let file = host.read_file(&scope(), "pages/foo.md").await.unwrap();
        assert_eq!(file.content.as_ref(), b"v2");
    }

    #[tokio::test]
    async fn test_create_existing_conflicts() {
        let host = seeded().await;
        let err = host
            .create_file(&scope(), "pages/foo.md", b"x", "dup")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_recursive_listing_includes_directories() {
        let host = seeded().await;
        let head = host.get_repo_state(&scope()).await.unwrap();
        let listing = host.get_tree("acme", head.tree, true).await.unwrap();
        assert!(listing.tree.contains("_news", ObjectKind::Tree));
        assert!(listing.tree.contains("_news/a.md", ObjectKind::Blob));
        assert!(listing.tree.contains("_config.yml", ObjectKind::Blob));

        let top = host.get_tree("acme", head.tree, false).await.unwrap();
        assert!(top.tree.get("_news/a.md").is_none());
    }

    #[tokio::test]
    async fn test_create_tree_moves_subtree() {
        let host = seeded().await;
        let head = host.get_repo_state(&scope()).await.unwrap();
        let listing = host.get_tree("acme", head.tree, true).await.unwrap();
        let news = listing.tree.get("_news").unwrap().id;
        let tree = host
            .create_tree(
                "acme",
                Some(head.tree),
                &[
                    TreeWrite::remove("_news", ObjectKind::Tree),
                    TreeWrite::subtree("_updates", news),
                ],
            )
            .await
            .unwrap();
        let moved = host.get_tree("acme", tree, true).await.unwrap();
        assert!(moved.tree.contains("_updates/a.md", ObjectKind::Blob));
        assert!(moved.tree.get("_news").is_none());
        assert!(moved.tree.contains("pages/foo.md", ObjectKind::Blob));
    }

    #[tokio::test]
    async fn test_non_forced_ref_update_must_fast_forward() {
        let host = seeded().await;
        let c0 = host.get_repo_state(&scope()).await.unwrap().commit;
        let sha = host.read_file(&scope(), "pages/foo.md").await.unwrap().sha;
        host.update_file(&scope(), "pages/foo.md", b"v2", sha, "v2").await.unwrap();

        let err = host.update_ref(&scope(), c0, false).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        host.update_ref(&scope(), c0, true).await.unwrap();
        assert_eq!(host.get_repo_state(&scope()).await.unwrap().commit, c0);
    }

    #[tokio::test]
    async fn test_injected_fault_is_consumed() {
        let host = seeded().await;
        host.inject_fault(HostOp::ReadFile, Some("_config.yml"), 1);
        assert!(host.read_file(&scope(), "pages/foo.md").await.is_ok());
        assert!(matches!(
            host.read_file(&scope(), "_config.yml").await,
            Err(StoreError::RemoteUnavailable(_))
        ));
        assert!(host.read_file(&scope(), "_config.yml").await.is_ok());
        assert_eq!(host.call_count(HostOp::ReadFile), 3);
    }
}
