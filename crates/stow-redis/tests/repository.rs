mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{Harness, remote_config, wait_until};
use serde_json::json;
use stow_config::ExpirationMode;
use stow_redis::{
    CLEANUP_TASK, MemoryStore, RemoteRepository, SUBSCRIBER_TASK, ValueStore, round_down_minute,
};
use stow_session::{
    DELETE_TASK, Error, ManualScheduler, NotifierEvent, RecordingNotifier, SequentialIdProvider,
    SessionData, SessionManager, SessionRepository, now_millis,
};

fn repository(h: &Harness, mode: ExpirationMode) -> RemoteRepository {
    RemoteRepository::new(h.repository_context(remote_config(mode)), h.store.clone()).unwrap()
}

/// A live session whose expiry minute lies in the future.
fn live_session(id: &str) -> SessionData {
    let now = now_millis();
    SessionData::restored(id, now, now, 60)
}

// ── Record layout ───────────────────────────────────────────────────

#[test]
fn test_hash_field_bytes() {
    let h = Harness::new();
    let repo = repository(&h, ExpirationMode::SortedSet);
    let session = SessionData::restored("abc", 0x0102, 0x0A0B, 1800);
    repo.store(&session).unwrap();
    repo.set_attribute(&session, "user", &json!("alice")).unwrap();

    let key = "stow:app:{abc}";
    assert_eq!(
        h.store.hget(key, "#:lastAccessed").unwrap().unwrap(),
        vec![0, 0, 0, 0, 0, 0, 0x0A, 0x0B]
    );
    assert_eq!(
        h.store.hget(key, "#:maxInactiveInterval").unwrap().unwrap(),
        vec![0, 0, 0x07, 0x08]
    );
    assert_eq!(
        h.store.hget(key, "#:creationTime").unwrap().unwrap(),
        vec![0, 0, 0, 0, 0, 0, 0x01, 0x02]
    );
    assert_eq!(h.store.hget(key, "user").unwrap().unwrap(), br#""alice""#.to_vec());
}

#[test]
fn test_wrong_width_is_not_decoded() {
    let h = Harness::new();
    let repo = repository(&h, ExpirationMode::SortedSet);
    repo.store(&live_session("abc")).unwrap();
    h.store
        .hset("stow:app:{abc}", "#:creationTime", &[0, 0, 0, 1])
        .unwrap();

    let err = repo.get("abc").unwrap_err();
    assert!(matches!(err, Error::Decode(ref msg) if msg.contains("#:creationTime")));
    assert!(!err.is_transient());
}

#[test]
fn test_braced_ids_are_never_looked_up() {
    let h = Harness::new();
    let repo = repository(&h, ExpirationMode::SortedSet);
    h.store.clear_commands();

    assert!(repo.get("x}{y").unwrap().is_none());
    assert!(repo.get("").unwrap().is_none());
    assert!(h.store.commands().is_empty());
}

#[test]
fn test_reserved_attribute_names_are_rejected() {
    let h = Harness::new();
    let repo = repository(&h, ExpirationMode::SortedSet);
    let session = live_session("abc");
    repo.store(&session).unwrap();

    for name in ["#:owner", "#:creationTime", "#:anything"] {
        assert!(matches!(
            repo.set_attribute(&session, name, &json!(1)),
            Err(Error::InvalidAttribute(_))
        ));
        assert!(matches!(
            repo.get_attribute(&session, name),
            Err(Error::InvalidAttribute(_))
        ));
    }
    assert!(repo.get("abc").unwrap().is_some());
}

#[test]
fn test_metadata_is_not_an_attribute() {
    let h = Harness::new();
    let repo = repository(&h, ExpirationMode::SortedSet);
    let session = live_session("abc");
    repo.store(&session).unwrap();
    repo.set_attribute(&session, "cart", &json!([1, 2])).unwrap();

    let names: Vec<String> = repo.get_all_keys(&session).unwrap().into_iter().collect();
    assert_eq!(names, vec!["cart".to_string()]);
}

// ── Id rotation ─────────────────────────────────────────────────────

#[test]
fn test_rotation_with_notification_expiry() {
    let h = Harness::new();
    let repo = repository(&h, ExpirationMode::Notification);
    let mut session = live_session("old");
    repo.store(&session).unwrap();
    repo.set_attribute(&session, "user", &json!("alice")).unwrap();
    let bucket = h
        .keys
        .bucket_key(round_down_minute(session.expires_at().unwrap()));
    h.store.clear_commands();

    session.set_new_id("new");
    repo.session_id_change(&session).unwrap();

    assert_eq!(
        h.store.commands_named("rename"),
        vec![
            "rename stow:app:{old} stow:app:{new}".to_string(),
            "rename stow:app:expire:{old} stow:app:expire:{new}".to_string(),
        ]
    );
    assert_eq!(h.store.commands_named("srem"), vec![format!("srem {bucket} old")]);
    assert_eq!(h.store.commands_named("sadd"), vec![format!("sadd {bucket} new")]);

    assert!(repo.get("old").unwrap().is_none());
    session.swap_id();
    assert_eq!(repo.get("new").unwrap().unwrap().id(), "new");
    assert_eq!(repo.get_attribute(&session, "user").unwrap(), Some(json!("alice")));
    assert!(h.store.exists(&h.keys.marker_key("new")).unwrap());
}

#[test]
fn test_rotation_with_sorted_set_expiry() {
    let h = Harness::new();
    let repo = repository(&h, ExpirationMode::SortedSet);
    let mut session = live_session("old");
    repo.store(&session).unwrap();
    let index = h.keys.sorted_set_key();
    let score = session.expires_at().unwrap() as f64;
    h.store.clear_commands();

    session.set_new_id("new");
    repo.session_id_change(&session).unwrap();

    assert_eq!(
        h.store.commands_named("rename"),
        vec!["rename stow:app:{old} stow:app:{new}".to_string()]
    );
    assert_eq!(h.store.commands_named("zrem"), vec![format!("zrem {index} old")]);
    assert_eq!(
        h.store.commands_named("zadd"),
        vec![format!("zadd {index} new {score}")]
    );
    assert_eq!(h.store.zrange(&index, 0, -1).unwrap(), vec!["new".to_string()]);
}

#[test]
fn test_rotation_of_missing_session_fails() {
    let h = Harness::new();
    let repo = repository(&h, ExpirationMode::SortedSet);
    let mut session = live_session("gone");
    session.set_new_id("new");

    assert!(matches!(
        repo.session_id_change(&session),
        Err(Error::Backend { transient: false, .. })
    ));
}

// ── Stored timing drives expiry bookkeeping ─────────────────────────

/// A stored session whose in-memory access time was then bumped two
/// minutes, as a lookup does, without being stored again.
fn accessed_after_store(repo: &RemoteRepository, id: &str) -> (SessionData, i64) {
    let mut session = live_session(id);
    repo.store(&session).unwrap();
    let stored_expiry = session.expires_at().unwrap();
    session.set_last_accessed_time(session.last_accessed_time() + 120_000);
    (session, stored_expiry)
}

#[test]
fn test_rotation_moves_the_stored_bucket_entry() {
    let h = Harness::new();
    let repo = repository(&h, ExpirationMode::Notification);
    let (mut session, stored_expiry) = accessed_after_store(&repo, "old");
    let stored_bucket = h.keys.bucket_key(round_down_minute(stored_expiry));
    let bumped_bucket = h
        .keys
        .bucket_key(round_down_minute(session.expires_at().unwrap()));

    session.set_new_id("new");
    repo.session_id_change(&session).unwrap();

    assert_eq!(h.store.smembers(&stored_bucket).unwrap(), vec!["new".to_string()]);
    assert!(h.store.smembers(&bumped_bucket).unwrap().is_empty());
}

#[test]
fn test_removal_clears_the_stored_bucket_entry() {
    let h = Harness::new();
    let repo = repository(&h, ExpirationMode::Notification);
    let (session, stored_expiry) = accessed_after_store(&repo, "abc");
    let stored_bucket = h.keys.bucket_key(round_down_minute(stored_expiry));

    repo.remove(&session).unwrap();

    assert!(h.store.smembers(&stored_bucket).unwrap().is_empty());
    assert!(!h.store.exists(&h.keys.marker_key("abc")).unwrap());
    assert!(!h.store.exists("stow:app:{abc}").unwrap());
}

#[test]
fn test_rotation_keeps_the_stored_score() {
    let h = Harness::new();
    let repo = repository(&h, ExpirationMode::SortedSet);
    let (mut session, stored_expiry) = accessed_after_store(&repo, "old");
    let index = h.keys.sorted_set_key();
    h.store.clear_commands();

    session.set_new_id("new");
    repo.session_id_change(&session).unwrap();

    assert_eq!(
        h.store.commands_named("zadd"),
        vec![format!("zadd {index} new {}", stored_expiry as f64)]
    );
    let due = h
        .store
        .zrange_by_score(&index, 0.0, stored_expiry as f64)
        .unwrap();
    assert_eq!(due, vec!["new".to_string()]);
}

// ── Through the manager ─────────────────────────────────────────────

struct Node {
    manager: Arc<SessionManager>,
    scheduler: Arc<ManualScheduler>,
    notifier: Arc<RecordingNotifier>,
}

fn node(store: &Arc<MemoryStore>, mode: ExpirationMode) -> Node {
    let scheduler = Arc::new(ManualScheduler::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let manager = SessionManager::builder(remote_config(mode), scheduler.clone())
        .notifier(notifier.clone())
        .id_provider(Arc::new(SequentialIdProvider::new("s")))
        .build(RemoteRepository::factory(store.clone()))
        .unwrap();
    Node {
        manager,
        scheduler,
        notifier,
    }
}

#[test]
fn test_attributes_are_shared_between_nodes() {
    let store = Arc::new(MemoryStore::new());
    let a = node(&store, ExpirationMode::SortedSet);
    let b = node(&store, ExpirationMode::SortedSet);

    let session = a.manager.get_session(None, true).unwrap().unwrap();
    session.set_attribute("cart", json!({"items": [1]})).unwrap();
    a.manager.request_finished(&[&session]).unwrap();

    let seen = b.manager.get_session(Some("s1"), false).unwrap().unwrap();
    assert!(!seen.is_new());
    assert_eq!(seen.get_attribute("cart").unwrap(), Some(json!({"items": [1]})));
}

#[test]
fn test_marker_expiry_deletes_through_manager() {
    let store = Arc::new(MemoryStore::new());
    let n = node(&store, ExpirationMode::Notification);
    assert!(store.expiry_notifications_enabled());

    let session = n.manager.get_session(None, true).unwrap().unwrap();
    session.set_attribute("user", "alice").unwrap();
    n.manager.request_finished(&[&session]).unwrap();

    let mut submitted = n.scheduler.take_submitted();
    assert_eq!(submitted.len(), 1);
    let (name, task, handle) = submitted.remove(0);
    assert_eq!(name, SUBSCRIBER_TASK);
    let subscriber = thread::spawn(move || task(handle.token()));
    assert!(wait_until(|| store.subscriber_count() == 1));

    store.advance(Duration::from_secs(61));
    store.purge_expired();
    assert!(wait_until(|| n.scheduler.submitted_names() == vec![DELETE_TASK.to_string()]));
    assert_eq!(n.scheduler.run_submitted(), 1);

    assert!(!store.exists("stow:app:{s1}").unwrap());
    assert_eq!(n.manager.stats().deleted, 1);
    let events = n.notifier.events();
    assert!(events.contains(&NotifierEvent::Removed("user".into(), json!("alice"))));
    assert!(events.contains(&NotifierEvent::Destroyed {
        id: "s1".into(),
        expired: true,
    }));

    n.manager.close();
    subscriber.join().unwrap();
    assert_eq!(store.subscriber_count(), 0);
}

#[test]
fn test_sorted_set_tick_deletes_idle_session() {
    let store = Arc::new(MemoryStore::new());
    let n = node(&store, ExpirationMode::SortedSet);
    assert_eq!(n.scheduler.period_of(CLEANUP_TASK), Some(Duration::from_secs(20)));

    n.manager
        .repository()
        .store(&SessionData::restored("idle", 0, 0, 60))
        .unwrap();
    let live = n.manager.get_session(None, true).unwrap().unwrap();

    assert_eq!(n.scheduler.tick(CLEANUP_TASK), 1);

    assert!(n.manager.repository().get("idle").unwrap().is_none());
    assert!(n.manager.repository().get(&live.id()).unwrap().is_some());
    assert_eq!(n.manager.stats().deleted, 1);
    assert!(n.notifier.events().contains(&NotifierEvent::Destroyed {
        id: "idle".into(),
        expired: true,
    }));
}

#[test]
fn test_expired_session_is_removed_on_lookup() {
    let store = Arc::new(MemoryStore::new());
    let n = node(&store, ExpirationMode::SortedSet);
    n.manager
        .repository()
        .store(&SessionData::restored("idle", 0, 0, 60))
        .unwrap();

    assert!(n.manager.get_session(Some("idle"), false).unwrap().is_none());
    assert_eq!(n.manager.stats().expired, 1);
    assert!(!store.exists("stow:app:{idle}").unwrap());
}

#[test]
fn test_switch_session_id_keeps_attributes() {
    let store = Arc::new(MemoryStore::new());
    let n = node(&store, ExpirationMode::Notification);
    let session = n.manager.get_session(None, true).unwrap().unwrap();
    session.set_attribute("user", "alice").unwrap();
    n.manager.request_finished(&[&session]).unwrap();

    let new_id = n.manager.switch_session_id(&session).unwrap();
    assert_eq!(new_id, "s2");
    assert_eq!(session.id(), "s2");

    assert!(n.manager.get_session(Some("s1"), false).unwrap().is_none());
    let found = n.manager.get_session(Some("s2"), false).unwrap().unwrap();
    assert_eq!(found.get_attribute("user").unwrap(), Some(json!("alice")));
    assert!(store.exists("stow:app:expire:{s2}").unwrap());
    assert!(!store.exists("stow:app:expire:{s1}").unwrap());
}

#[test]
fn test_concurrent_invalidation_is_a_conflict() {
    let store = Arc::new(MemoryStore::new());
    let a = node(&store, ExpirationMode::SortedSet);
    let b = node(&store, ExpirationMode::SortedSet);

    let first = a.manager.get_session(None, true).unwrap().unwrap();
    let second = b.manager.get_session(Some("s1"), false).unwrap().unwrap();

    first.invalidate().unwrap();
    second.invalidate().unwrap();

    assert_eq!(a.manager.stats().invalidation_conflicts, 0);
    assert_eq!(b.manager.stats().invalidation_conflicts, 1);
    assert!(!store.exists("stow:app:{s1}").unwrap());
}

#[test]
fn test_close_stops_background_work() {
    let store = Arc::new(MemoryStore::new());
    let n = node(&store, ExpirationMode::SortedSet);
    assert_eq!(n.scheduler.live_periodic(), vec![CLEANUP_TASK.to_string()]);

    n.manager.close();
    n.manager.close();

    assert!(n.scheduler.live_periodic().is_empty());
    assert!(matches!(
        n.manager.get_session(None, true),
        Err(Error::Closed)
    ));
    assert!(matches!(store.hget("k", "f"), Err(stow_redis::StoreError::Closed)));
}
