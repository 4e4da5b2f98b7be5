//! End-to-end scenarios for locked, rolled-back edit sessions
//!
//! These tests validate:
//! - Mutual exclusion per site and manual unlock
//! - Rollback of multi-commit operations on failure, timeout and cancellation
//! - Lock release surviving a transient lock store error
//! - Optimistic concurrency on single-file writes
//! - Multi-file changes landing as one commit seen atomically by readers

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gitcms_core::{
    Blob, ContentDir, GitHost, GitStore, HostOp, LockRecord, LockStore, MemoryHost, MemoryLockStore,
    ObjectId, RepoScope, SiteMutex, StoreError, TreeChange,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn scope() -> RepoScope {
    RepoScope::new("acme", "staging")
}

async fn setup(files: &[(&str, &[u8])]) -> (GitStore, Arc<MemoryHost>, ObjectId) {
    let host = Arc::new(MemoryHost::new());
    let c0 = host.create_repo(&scope(), files).await.unwrap();
    let mutex = SiteMutex::new(Arc::new(MemoryLockStore::new()));
    (GitStore::new(host.clone(), mutex, "staging"), host, c0)
}

async fn head(host: &MemoryHost) -> ObjectId {
    host.get_repo_state(&scope()).await.unwrap().commit
}

#[tokio::test]
async fn test_second_session_is_rejected_while_first_runs() {
    let (store, _, _) = setup(&[("pages/a.md", "a".as_bytes())]).await;
    let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
    let (finish_tx, finish_rx) = tokio::sync::oneshot::channel::<()>();

    let first = {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .lock_and_run("acme", None, |_| async move {
                    let _ = entered_tx.send(());
                    let _ = finish_rx.await;
                    Ok(())
                })
                .await
        })
    };
    entered_rx.await.unwrap();

    let err = store
        .lock_and_run("acme", None, |_| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::LockHeld(_)));
    assert!(err.is_recoverable());

    // Other sites are unaffected.
    assert!(store.mutex().lock("globex").await.is_ok());

    finish_tx.send(()).unwrap();
    first.await.unwrap().unwrap();
    store
        .lock_and_run("acme", None, |_| async { Ok(()) })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_manual_unlock_of_stuck_site() {
    let (store, _, _) = setup(&[("pages/a.md", "a".as_bytes())]).await;
    let stuck = store.mutex().lock("acme").await.unwrap();
    std::mem::forget(stuck);

    assert!(matches!(
        store.lock_and_run("acme", None, |_| async { Ok(()) }).await,
        Err(StoreError::LockHeld(_))
    ));
    assert!(matches!(
        store.mutex().unlock("globex").await,
        Err(StoreError::UnlockFailed(_))
    ));
    store.mutex().unlock("acme").await.unwrap();
    store
        .lock_and_run("acme", None, |_| async { Ok(()) })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_failed_second_write_restores_snapshot() {
    let (store, host, c0) = setup(&[
        ("pages/a.md", "a v1".as_bytes()),
        ("_data/b.yml", "b: 1".as_bytes()),
    ])
    .await;
    host.inject_fault(HostOp::UpdateFile, Some("_data/b.yml"), 1);

    let err = store
        .lock_and_run("acme", None, |session| async move {
            assert_eq!(session.snapshot(), c0);
            session.update("pages/a.md", "a v2", None, "edit a").await?;
            session
                .update(&ContentDir::Data.file("b.yml"), "b: 2", None, "edit b")
                .await?;
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::RemoteUnavailable(_)));
    assert_eq!(head(&host).await, c0);
    let reader = store.reader("acme", None);
    assert_eq!(reader.read("pages/a.md").await.unwrap().content.as_ref(), b"a v1");
    assert!(store.mutex().status("acme").await.unwrap().is_none());
}

#[tokio::test]
async fn test_caller_error_restores_snapshot() {
    let (store, host, c0) = setup(&[("pages/a.md", "a".as_bytes())]).await;
    let err = store
        .lock_and_run("acme", None, |session| async move {
            session
                .commit_changes(vec![TreeChange::upsert("pages/new.md", "new")], "add page")
                .await?;
            Err::<(), _>(anyhow::anyhow!("front matter is invalid").into())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Operation(_)));
    assert_eq!(head(&host).await, c0);
}

#[tokio::test]
async fn test_stale_sha_is_conflict() {
    let (store, host, _) = setup(&[("pages/a.md", "a".as_bytes())]).await;
    let reader = store.reader("acme", None);
    let seen = reader.read("pages/a.md").await.unwrap().sha;

    store
        .lock_and_run("acme", None, |session| async move {
            session.update("pages/a.md", "first", Some(seen), "first writer").await
        })
        .await
        .unwrap();
    let after_first = head(&host).await;

    let err = store
        .lock_and_run("acme", None, |session| async move {
            session.update("pages/a.md", "second", Some(seen), "second writer").await
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
    assert_eq!(head(&host).await, after_first);
    assert_eq!(reader.read("pages/a.md").await.unwrap().content.as_ref(), b"first");
}

#[tokio::test]
async fn test_rename_and_ordering_update_in_one_commit() {
    let (store, host, c0) = setup(&[
        ("pages/foo.md", "# Foo".as_bytes()),
        ("_news/collection.yml", "order:\n  - foo.md\n".as_bytes()),
    ])
    .await;
    let tree_fetches = host.call_count(HostOp::GetTree);
    let ordering = ContentDir::collection("news")
        .ordering_file()
        .unwrap()
        .storage_path()
        .unwrap();

    let outcome = store
        .lock_and_run("acme", None, |session| async move {
            session
                .commit_changes(
                    vec![
                        TreeChange::rename("pages/foo.md", "pages/bar.md"),
                        TreeChange::upsert(ordering, "order:\n  - bar.md\n"),
                    ],
                    "Rename foo.md to bar.md",
                )
                .await
        })
        .await
        .unwrap();

    assert_eq!(outcome.parent, c0);
    assert_eq!(head(&host).await, outcome.commit);
    assert_eq!(host.call_count(HostOp::GetTree), tree_fetches + 1);
    assert_eq!(
        host.history(&scope()).await.unwrap(),
        vec!["Rename foo.md to bar.md".to_string(), "Initial commit".to_string()]
    );

    let reader = store.reader("acme", None);
    assert!(!reader.exists("pages/foo.md").await.unwrap());
    assert_eq!(reader.read("pages/bar.md").await.unwrap().content.as_ref(), b"# Foo");
    let (order, _) = reader.read_text("_news/collection.yml").await.unwrap();
    assert!(order.contains("bar.md"));
}

#[tokio::test]
async fn test_directory_rename_keeps_siblings() {
    let (store, _, _) = setup(&[
        ("_news/2024/a.md", "a".as_bytes()),
        ("_news/2023/b.md", "b".as_bytes()),
        ("_news/collection.yml", "order: []".as_bytes()),
        ("_events/x.md", "x".as_bytes()),
    ])
    .await;

    store
        .lock_and_run("acme", None, |session| async move {
            session
                .commit_changes(
                    vec![TreeChange::rename_directory("_news", "_updates")],
                    "Rename collection",
                )
                .await
        })
        .await
        .unwrap();

    let reader = store.reader("acme", None);
    for path in ["_updates/2024/a.md", "_updates/2023/b.md", "_updates/collection.yml", "_events/x.md"] {
        assert!(reader.exists(path).await.unwrap(), "{} missing", path);
    }
    assert!(matches!(reader.list_directory("_news").await, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn test_readers_see_all_or_none_of_a_commit() {
    let (store, host, _) = setup(&[
        ("pages/a.md", "a1".as_bytes()),
        ("pages/b.md", "b1".as_bytes()),
    ])
    .await;
    let before = (Blob::from_bytes(b"a1".to_vec()).id(), Blob::from_bytes(b"b1".to_vec()).id());
    let after = (Blob::from_bytes(b"a2".to_vec()).id(), Blob::from_bytes(b"b2".to_vec()).id());

    let observer = {
        let host = host.clone();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..50 {
                let state = host.get_repo_state(&scope()).await.unwrap();
                let listing = host.get_tree("acme", state.tree, true).await.unwrap();
                let a = listing.tree.get("pages/a.md").map(|e| e.id);
                let b = listing.tree.get("pages/b.md").map(|e| e.id);
                seen.push((a, b));
                tokio::task::yield_now().await;
            }
            seen
        })
    };

    store
        .lock_and_run("acme", None, |session| async move {
            session
                .commit_changes(
                    vec![TreeChange::upsert("pages/a.md", "a2"), TreeChange::upsert("pages/b.md", "b2")],
                    "edit both",
                )
                .await
        })
        .await
        .unwrap();

    for (a, b) in observer.await.unwrap() {
        let pair = (a.unwrap(), b.unwrap());
        assert!(pair == before || pair == after, "observed a partial commit");
    }
}

#[tokio::test]
async fn test_cancelled_session_releases_lock() {
    let (store, _, _) = setup(&[("pages/a.md", "a".as_bytes())]).await;
    let cancelled = tokio::time::timeout(
        Duration::from_millis(20),
        store.lock_and_run("acme", None, |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }),
    )
    .await;
    assert!(cancelled.is_err());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(store.mutex().status("acme").await.unwrap().is_none());
    store
        .lock_and_run("acme", None, |_| async { Ok(()) })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_cancelled_session_restores_snapshot() {
    let (store, host, c0) = setup(&[
        ("pages/a.md", "a".as_bytes()),
        ("pages/b.md", "b".as_bytes()),
    ])
    .await;
    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        store.lock_and_run("acme", None, |session| async move {
            session.update("pages/a.md", "a2", None, "edit a").await?;
            tokio::time::sleep(Duration::from_secs(5)).await;
            session.update("pages/b.md", "b2", None, "edit b").await?;
            Ok(())
        }),
    )
    .await;
    assert!(cancelled.is_err());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(head(&host).await, c0);
    let reader = store.reader("acme", None);
    assert_eq!(reader.read("pages/a.md").await.unwrap().content.as_ref(), b"a");
    assert!(store.mutex().status("acme").await.unwrap().is_none());
}

/// Lock store whose first release fails like a busy SQLite database
struct BusyOnceLockStore {
    inner: MemoryLockStore,
    busy: AtomicBool,
}

#[async_trait]
impl LockStore for BusyOnceLockStore {
    async fn try_acquire(&self, record: &LockRecord) -> gitcms_core::Result<bool> {
        self.inner.try_acquire(record).await
    }

    async fn release(&self, site: &str, holder: Option<&str>) -> gitcms_core::Result<bool> {
        if self.busy.swap(false, Ordering::SeqCst) {
            return Err(StoreError::LockStore("database is locked".to_string()));
        }
        self.inner.release(site, holder).await
    }

    async fn refresh(
        &self,
        site: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
    ) -> gitcms_core::Result<bool> {
        self.inner.refresh(site, holder, expires_at).await
    }

    async fn get(&self, site: &str) -> gitcms_core::Result<Option<LockRecord>> {
        self.inner.get(site).await
    }
}

#[tokio::test]
async fn test_failed_release_does_not_leave_site_locked() {
    let host = Arc::new(MemoryHost::new());
    host.create_repo(&scope(), &[("pages/a.md", "a".as_bytes())]).await.unwrap();
    let mutex = SiteMutex::new(Arc::new(BusyOnceLockStore {
        inner: MemoryLockStore::new(),
        busy: AtomicBool::new(true),
    }));
    let store = GitStore::new(host, mutex, "staging");

    store
        .lock_and_run("acme", None, |session| async move {
            session.update("pages/a.md", "a2", None, "edit").await
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.mutex().status("acme").await.unwrap().is_none());
    store
        .lock_and_run("acme", None, |_| async { Ok(()) })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_failed_rollback_is_reported() {
    let (store, host, c0) = setup(&[("pages/a.md", "a".as_bytes())]).await;
    let faulty = host.clone();
    let err = store
        .lock_and_run("acme", None, |session| async move {
            session.update("pages/a.md", "a2", None, "edit").await?;
            faulty.inject_fault(HostOp::UpdateRef, None, 1);
            Err::<(), _>(StoreError::Conflict("pages/a.md".to_string()))
        })
        .await
        .unwrap_err();

    match err {
        StoreError::RollbackFailed { site, snapshot, cause, .. } => {
            assert_eq!(site, "acme");
            assert_eq!(snapshot, c0);
            assert!(matches!(*cause, StoreError::Conflict(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_ne!(head(&host).await, c0);
    assert!(store.mutex().status("acme").await.unwrap().is_none());
}
