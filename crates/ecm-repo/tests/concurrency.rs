mod common;

use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

use ecm_dispatch::BlobManagerConfig;
use ecm_lock::{KeyedLockCoordinator, LockConfig, LockError};
use ecm_repo::{Document, RepoError, Repository};

use common::{default_fixture, REPOSITORY};

fn coordinator(timeout: Duration) -> Arc<KeyedLockCoordinator> {
    Arc::new(KeyedLockCoordinator::new(LockConfig::new().with_timeout(timeout)))
}

// ---------------------------------------------------------------------------
// get-or-create under the lock coordinator
// ---------------------------------------------------------------------------

#[test]
fn racing_get_or_create_creates_exactly_once() {
    let f = default_fixture();
    let locks = coordinator(Duration::from_secs(10));
    let barrier = Arc::new(Barrier::new(5));
    let root = f.repo.root_id();

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let repo = Arc::clone(&f.repo);
            let locks = Arc::clone(&locks);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                repo.get_or_create_document(&locks, root, "shared-folder", "Folder")
                    .unwrap()
            })
        })
        .collect();

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(outcomes.iter().filter(|o| o.is_created()).count(), 1);
    let id = outcomes[0].document().id;
    assert!(outcomes.iter().all(|o| o.document().id == id));
    assert_eq!(f.repo.document_count(), 2);
    assert!(locks.is_empty());
}

#[test]
fn contended_key_times_out_with_concurrent_update() {
    let f = default_fixture();
    let locks = coordinator(Duration::from_millis(50));
    let root = f.repo.root_id();
    let key = format!("{REPOSITORY}-{root}-busy");

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let holder = {
        let locks = Arc::clone(&locks);
        let key = key.clone();
        thread::spawn(move || {
            locks
                .do_atomically::<_, LockError, _>(&key, || {
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Ok(())
                })
                .unwrap();
        })
    };
    entered_rx.recv().unwrap();

    let err = f
        .repo
        .get_or_create_document(&locks, root, "busy", "Folder")
        .unwrap_err();
    assert!(err.is_concurrent_update());
    assert_eq!(err.to_string(), format!("Failed to acquire the lock on key {key}"));

    release_tx.send(()).unwrap();
    holder.join().unwrap();
    let created = f
        .repo
        .get_or_create_document(&locks, root, "busy", "Folder")
        .unwrap();
    assert!(created.is_created());
}

#[test]
fn configured_lock_timeout_applies_to_get_or_create() {
    let config = BlobManagerConfig::from_toml_str(
        r#"
        [lock]
        timeout_ms = 40

        [[providers]]
        id = "default"
        store = { kind = "memory", name = "configured" }
        "#,
    )
    .unwrap();
    let repo = Repository::new("configured", Arc::new(config.build().unwrap()));
    let locks = Arc::new(config.lock_coordinator());
    let root = repo.root_id();
    let key = format!("configured-{root}-busy");

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let holder = {
        let locks = Arc::clone(&locks);
        let key = key.clone();
        thread::spawn(move || {
            locks
                .do_atomically::<_, LockError, _>(&key, || {
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Ok(())
                })
                .unwrap();
        })
    };
    entered_rx.recv().unwrap();

    let started = std::time::Instant::now();
    let err = repo.get_or_create_document(&locks, root, "busy", "Folder").unwrap_err();
    assert!(err.is_concurrent_update());
    assert!(started.elapsed() < Duration::from_secs(5));

    release_tx.send(()).unwrap();
    holder.join().unwrap();
    assert!(repo.get_or_create_document(&locks, root, "busy", "Folder").unwrap().is_created());
}

#[test]
fn different_names_do_not_contend() {
    let f = default_fixture();
    let locks = coordinator(Duration::from_secs(5));
    let root = f.repo.root_id();
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let repo = Arc::clone(&f.repo);
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                repo.get_or_create_document(&locks, root, &format!("folder-{i}"), "Folder")
                    .unwrap()
                    .is_created()
            })
        })
        .collect();
    assert!(handles.into_iter().all(|h| h.join().unwrap()));
    assert_eq!(f.repo.document_count(), 5);
}

// ---------------------------------------------------------------------------
// Commit-time unique constraint
// ---------------------------------------------------------------------------

#[test]
fn unique_name_violation_at_commit() {
    let f = default_fixture();
    let root = f.repo.root_id();

    let mut first = f.session();
    let mut second = f.session();
    first.create(Document::new(root, "dup", "Folder")).unwrap();
    second.create(Document::new(root, "dup", "Folder")).unwrap();
    assert!(second.find_child(root, "dup").unwrap().is_some());

    first.commit().unwrap();
    let err = second.commit().unwrap_err();
    assert!(matches!(err, RepoError::ConcurrentUpdate(_)));
    assert!(err.is_concurrent_update());
    assert_eq!(f.repo.document_count(), 2);
}

// ---------------------------------------------------------------------------
// Session and transaction behavior
// ---------------------------------------------------------------------------

#[test]
fn staged_changes_are_private_until_commit() {
    let f = default_fixture();
    let root = f.repo.root_id();
    let mut writer = f.session();
    let doc = writer.create(Document::new(root, "draft", "Note")).unwrap();

    let reader = f.session();
    assert!(!reader.exists(&doc.id).unwrap());
    assert!(reader.find_child(root, "draft").unwrap().is_none());
    drop(reader);

    writer.rollback();
    assert!(!f.session().exists(&doc.id).unwrap());
    assert_eq!(f.repo.document_count(), 1);
}

#[test]
fn refresh_discards_staged_changes() {
    let f = default_fixture();
    let doc = f.create_file("note", b"foo", "text/plain");
    let mut session = f.session();
    let changed = doc.clone().with_property("dc:title", "Changed");
    session.save(changed).unwrap();
    assert_eq!(session.get(&doc.id).unwrap().property("dc:title"), Some("Changed"));

    let refreshed = session.refresh(&doc.id).unwrap();
    assert_eq!(refreshed.property("dc:title"), None);
    assert!(!session.has_changes());
}

#[test]
fn remove_takes_descendants() {
    let f = default_fixture();
    let root = f.repo.root_id();
    let mut session = f.session();
    let folder = session.create(Document::new(root, "folder", "Folder")).unwrap();
    let child = session.create(Document::new(folder.id, "child", "Note")).unwrap();
    session.commit().unwrap();

    let mut session = f.session();
    assert_eq!(session.children(folder.id).unwrap().len(), 1);
    session.remove(&folder.id).unwrap();
    session.commit().unwrap();

    let session = f.session();
    assert!(!session.exists(&folder.id).unwrap());
    assert!(!session.exists(&child.id).unwrap());
    assert!(matches!(session.get(&child.id), Err(RepoError::DocumentNotFound(_))));
}

#[test]
fn timed_out_transaction_fails() {
    let f = default_fixture();
    let mut session = f.repo.open_session_with_timeout(Duration::from_millis(20));
    thread::sleep(Duration::from_millis(50));
    let err = session
        .create(Document::new(f.repo.root_id(), "late", "Note"))
        .unwrap_err();
    assert!(matches!(err, RepoError::TransactionTimeout { .. }));
    assert!(matches!(session.commit(), Err(RepoError::TransactionTimeout { .. })));
    assert_eq!(f.repo.document_count(), 1);
}

#[test]
fn get_child_reports_missing() {
    let f = default_fixture();
    let err = f.session().get_child(f.repo.root_id(), "nope").unwrap_err();
    assert!(matches!(err, RepoError::DocumentNotFound(_)));
}
