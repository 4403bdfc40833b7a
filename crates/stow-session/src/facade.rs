//! Per-use view over a session.
//!
//! A [`SessionFacade`] caches the attributes read or written during one use
//! of a session, tracks which of them changed, and pushes the difference to
//! the repository in one transaction on [`commit`](SessionFacade::commit).
//! Façades wrapping the same [`SessionData`] share its timing record,
//! lifecycle state and commit lock, but keep independent attribute diffs.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use stow_config::ReplicationTrigger;
use tracing::{debug, trace};

use crate::attribute::{AttributeValue, is_immutable};
use crate::data::SessionData;
use crate::error::{Error, Result};
use crate::manager::SessionContext;

/// Lifecycle of a session as seen by its façades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created during this use.
    New,
    /// Loaded from the repository.
    Valid,
    /// Destroyed by this node.
    Invalid,
    /// Another actor destroyed it first.
    Conflict,
}

impl SessionState {
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::New | SessionState::Valid)
    }
}

/// State shared by every façade wrapping the same session.
pub(crate) struct SharedSession {
    pub(crate) data: RwLock<SessionData>,
    state: Mutex<SessionState>,
    locked: AtomicBool,
}

#[derive(Debug, Clone)]
struct CachedAttribute {
    /// `None` memoizes an attribute the repository does not have.
    value: Option<AttributeValue>,
    dirty: bool,
    deleted: bool,
}

impl CachedAttribute {
    fn current(&self) -> Option<&AttributeValue> {
        if self.deleted { None } else { self.value.as_ref() }
    }
}

/// Session object handed to callers.
pub struct SessionFacade {
    shared: Arc<SharedSession>,
    ctx: Arc<SessionContext>,
    cache: Mutex<HashMap<String, CachedAttribute>>,
}

impl SessionFacade {
    pub(crate) fn new(data: SessionData, ctx: Arc<SessionContext>) -> Self {
        let state = if data.is_new() {
            SessionState::New
        } else {
            SessionState::Valid
        };
        Self {
            shared: Arc::new(SharedSession {
                data: RwLock::new(data),
                state: Mutex::new(state),
                locked: AtomicBool::new(false),
            }),
            ctx,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Another façade over the same session with its own, empty diff.
    pub fn wrap(&self) -> SessionFacade {
        SessionFacade {
            shared: Arc::clone(&self.shared),
            ctx: Arc::clone(&self.ctx),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn shared(&self) -> &SharedSession {
        &self.shared
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn id(&self) -> String {
        self.shared.data.read().id().to_string()
    }

    /// Snapshot of the underlying record.
    pub fn data(&self) -> SessionData {
        self.shared.data.read().clone()
    }

    pub fn creation_time(&self) -> i64 {
        self.shared.data.read().creation_time()
    }

    pub fn last_accessed_time(&self) -> i64 {
        self.shared.data.read().last_accessed_time()
    }

    pub fn max_inactive_interval(&self) -> i32 {
        self.shared.data.read().max_inactive_interval()
    }

    /// Change the inactivity timeout; persisted on the next commit.
    pub fn set_max_inactive_interval(&self, secs: i32) {
        self.shared.data.write().set_max_inactive_interval(secs);
    }

    pub fn is_new(&self) -> bool {
        self.shared.data.read().is_new()
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    pub fn is_valid(&self) -> bool {
        self.state().is_active()
    }

    pub(crate) fn ensure_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::InvalidSession(self.id()))
        }
    }

    // ── Attributes ──────────────────────────────────────────────────

    fn tracks_reads(&self) -> bool {
        self.ctx.config.replication_trigger == ReplicationTrigger::SetAndNonPrimitiveGet
    }

    /// Value held by the local cache, or the repository's value fetched now.
    ///
    /// The outer `Option` tells whether the cache knew the name.
    fn prior_value(&self, data: &SessionData, name: &str) -> Result<Option<AttributeValue>> {
        if let Some(entry) = self.cache.lock().get(name) {
            return Ok(entry.current().cloned());
        }
        if data.is_new() {
            return Ok(None);
        }
        let value = self.ctx.repository.get_attribute(data, name)?;
        if let Some(v) = &value {
            self.ctx.notifier.attribute_restored(data, name, v);
        }
        Ok(value)
    }

    pub fn get_attribute(&self, name: &str) -> Result<Option<AttributeValue>> {
        self.ensure_valid()?;
        let data = self.shared.data.read();

        if data.is_mandatory_remote(name) {
            return self.ctx.repository.get_attribute(&data, name);
        }

        let track_reads = self.tracks_reads();
        if let Some(entry) = self.cache.lock().get_mut(name) {
            if track_reads && entry.current().is_some_and(|v| !is_immutable(v)) {
                entry.dirty = true;
            }
            return Ok(entry.current().cloned());
        }

        trace!(session_id = %data.id(), attribute = name, "Attribute cache miss");
        let fetched = self.ctx.repository.get_attribute(&data, name)?;
        if let Some(v) = &fetched {
            self.ctx.notifier.attribute_restored(&data, name, v);
        }

        let mut cache = self.cache.lock();
        let entry = cache
            .entry(name.to_string())
            .or_insert_with(|| CachedAttribute {
                value: fetched,
                dirty: false,
                deleted: false,
            });
        if track_reads && entry.current().is_some_and(|v| !is_immutable(v)) {
            entry.dirty = true;
        }
        Ok(entry.current().cloned())
    }

    /// Set an attribute. A JSON `null` removes it.
    pub fn set_attribute(&self, name: &str, value: impl Into<AttributeValue>) -> Result<()> {
        let value = value.into();
        if value.is_null() {
            return self.remove_attribute(name);
        }
        self.ensure_valid()?;
        let data = self.shared.data.read();

        if data.is_mandatory_remote(name) {
            let old = self.ctx.repository.get_attribute(&data, name)?;
            self.ctx.repository.set_attribute(&data, name, &value)?;
            match old {
                Some(old) => self
                    .ctx
                    .notifier
                    .attribute_replaced(&data, name, &old, &value),
                None => self.ctx.notifier.attribute_added(&data, name, &value),
            }
            return Ok(());
        }

        let prior = self.prior_value(&data, name)?;
        self.cache.lock().insert(
            name.to_string(),
            CachedAttribute {
                value: Some(value.clone()),
                dirty: true,
                deleted: false,
            },
        );

        match prior {
            Some(old) => self
                .ctx
                .notifier
                .attribute_replaced(&data, name, &old, &value),
            None => self.ctx.notifier.attribute_added(&data, name, &value),
        }
        Ok(())
    }

    pub fn remove_attribute(&self, name: &str) -> Result<()> {
        self.ensure_valid()?;
        let data = self.shared.data.read();

        if data.is_mandatory_remote(name) {
            let old = self.ctx.repository.get_attribute(&data, name)?;
            self.ctx.repository.remove_attribute(&data, name)?;
            if let Some(old) = old {
                self.ctx.notifier.attribute_removed(&data, name, &old);
            }
            return Ok(());
        }

        let prior = self.prior_value(&data, name)?;
        self.cache.lock().insert(
            name.to_string(),
            CachedAttribute {
                value: None,
                dirty: true,
                deleted: true,
            },
        );

        if let Some(old) = prior {
            self.ctx.notifier.attribute_removed(&data, name, &old);
        }
        Ok(())
    }

    /// Names of every attribute visible through this façade.
    pub fn attribute_names(&self) -> Result<BTreeSet<String>> {
        self.ensure_valid()?;
        let data = self.shared.data.read();
        self.names_for(&data)
    }

    fn names_for(&self, data: &SessionData) -> Result<BTreeSet<String>> {
        let mut names = self.ctx.repository.get_all_keys(data)?;
        for (name, entry) in self.cache.lock().iter() {
            if entry.deleted {
                names.remove(name);
            } else if entry.value.is_some() {
                names.insert(name.clone());
            }
        }
        Ok(names)
    }

    // ── Commit ──────────────────────────────────────────────────────

    /// Claim the right to commit among façades wrapping this session.
    ///
    /// Only the first caller gets `true`.
    pub fn check_used_and_lock(&self) -> bool {
        !self.shared.locked.swap(true, Ordering::AcqRel)
    }

    /// Push this façade's changes to the repository as one transaction.
    ///
    /// Safe to call repeatedly: entries are clean after a successful commit,
    /// so a second call writes no attributes. Does nothing once the session
    /// has been invalidated.
    pub fn commit(&self) -> Result<()> {
        if !self.is_valid() {
            debug!(session_id = %self.id(), "Skipping commit of invalidated session");
            return Ok(());
        }

        let data = self.shared.data.read();
        let mut tx = self.ctx.repository.start_commit(&data)?;
        let set_all = tx.is_set_all_attributes();
        let distributing = tx.is_distributing();

        let mut written = Vec::new();
        {
            let cache = self.cache.lock();
            for (name, entry) in cache.iter() {
                if data.is_mandatory_remote(name) {
                    continue;
                }
                if entry.deleted {
                    if entry.dirty {
                        tx.remove_attribute(name);
                        written.push(name.clone());
                    }
                    continue;
                }
                let Some(value) = &entry.value else {
                    continue;
                };
                if entry.dirty || set_all {
                    self.ctx.notifier.attribute_being_stored(&data, name, value);
                    tx.add_attribute(name, value);
                    written.push(name.clone());
                }
            }
        }

        tx.commit()?;

        let mut cache = self.cache.lock();
        for name in &written {
            if let Some(entry) = cache.get_mut(name) {
                entry.dirty = false;
            }
        }
        self.ctx.counters.commits.fetch_add(1, Ordering::Relaxed);

        debug!(
            session_id = %data.id(),
            writes = written.len(),
            distributing,
            "Session committed"
        );
        Ok(())
    }

    // ── Invalidation ────────────────────────────────────────────────

    /// Destroy the session on behalf of the caller.
    pub fn invalidate(&self) -> Result<()> {
        self.ensure_valid()?;
        self.do_invalidate(false)
    }

    /// Destroy the session, `expired` telling listeners why.
    ///
    /// When another actor already claimed the destruction the session moves
    /// to [`SessionState::Conflict`] and the conflict is reported to the
    /// manager once. Calling this on a session that is no longer active does
    /// nothing.
    pub fn do_invalidate(&self, expired: bool) -> Result<()> {
        let mut state = self.shared.state.lock();
        if !state.is_active() {
            return Ok(());
        }

        let data = self.shared.data.read();
        if !self.ctx.repository.prepare_remove(&data)? {
            *state = SessionState::Conflict;
            drop(state);
            self.ctx.invalidation_conflict(&data, expired);
            return Ok(());
        }

        let names = self.names_for(&data)?;
        for name in &names {
            let value = match self.cache.lock().get(name) {
                Some(entry) => entry.current().cloned(),
                None => self.ctx.repository.get_attribute(&data, name)?,
            };
            if let Some(value) = value {
                self.ctx.notifier.attribute_removed(&data, name, &value);
            }
        }
        self.ctx.notifier.session_destroyed(&data, expired);

        *state = SessionState::Invalid;
        drop(state);
        self.cache.lock().clear();

        self.ctx.repository.remove(&data)?;
        debug!(session_id = %data.id(), expired, "Session invalidated");
        Ok(())
    }
}

impl std::fmt::Debug for SessionFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFacade")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::SessionCounters;
    use crate::memory::InMemoryRepository;
    use crate::notifier::{NotifierEvent, RecordingNotifier};
    use crate::repository::{
        CommitTransaction, RepositoryContext, SessionDeleter, SessionRepository,
    };
    use crate::scheduler::ManualScheduler;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use stow_config::SessionConfig;

    struct NoopDeleter;

    impl SessionDeleter for NoopDeleter {
        fn delete(&self, _id: &str, _expired: bool) -> Result<()> {
            Ok(())
        }

        fn delete_async(&self, _id: &str, _expired: bool) {}
    }

    /// In-memory repository that records transaction operations and reads.
    struct CountingRepository {
        inner: InMemoryRepository,
        ops: Arc<Mutex<Vec<String>>>,
        reads: AtomicUsize,
    }

    struct CountingTransaction<'a> {
        inner: Box<dyn CommitTransaction + 'a>,
        ops: Arc<Mutex<Vec<String>>>,
    }

    impl CommitTransaction for CountingTransaction<'_> {
        fn add_attribute(&mut self, name: &str, value: &AttributeValue) {
            self.ops.lock().push(format!("add:{name}={value}"));
            self.inner.add_attribute(name, value);
        }

        fn remove_attribute(&mut self, name: &str) {
            self.ops.lock().push(format!("remove:{name}"));
            self.inner.remove_attribute(name);
        }

        fn commit(self: Box<Self>) -> Result<()> {
            self.inner.commit()
        }

        fn is_distributing(&self) -> bool {
            self.inner.is_distributing()
        }

        fn is_set_all_attributes(&self) -> bool {
            self.inner.is_set_all_attributes()
        }
    }

    impl SessionRepository for CountingRepository {
        fn get(&self, id: &str) -> Result<Option<SessionData>> {
            self.inner.get(id)
        }

        fn store(&self, session: &SessionData) -> Result<()> {
            self.inner.store(session)
        }

        fn get_attribute(&self, session: &SessionData, name: &str) -> Result<Option<AttributeValue>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_attribute(session, name)
        }

        fn set_attribute(
            &self,
            session: &SessionData,
            name: &str,
            value: &AttributeValue,
        ) -> Result<()> {
            self.inner.set_attribute(session, name, value)
        }

        fn remove_attribute(&self, session: &SessionData, name: &str) -> Result<()> {
            self.inner.remove_attribute(session, name)
        }

        fn get_all_keys(&self, session: &SessionData) -> Result<BTreeSet<String>> {
            self.inner.get_all_keys(session)
        }

        fn remove(&self, session: &SessionData) -> Result<()> {
            self.inner.remove(session)
        }

        fn prepare_remove(&self, session: &SessionData) -> Result<bool> {
            self.inner.prepare_remove(session)
        }

        fn start_commit(&self, session: &SessionData) -> Result<Box<dyn CommitTransaction + '_>> {
            Ok(Box::new(CountingTransaction {
                inner: self.inner.start_commit(session)?,
                ops: Arc::clone(&self.ops),
            }))
        }

        fn session_id_change(&self, session: &SessionData) -> Result<()> {
            self.inner.session_id_change(session)
        }

        fn owned_session_ids(&self) -> Result<Vec<String>> {
            self.inner.owned_session_ids()
        }

        fn close(&self) {
            self.inner.close()
        }

        fn is_distributed(&self) -> bool {
            false
        }
    }

    struct Fixture {
        ctx: Arc<SessionContext>,
        repo: Arc<CountingRepository>,
        notifier: Arc<RecordingNotifier>,
    }

    impl Fixture {
        fn new(config: SessionConfig) -> Self {
            let config = Arc::new(config);
            let repo = Arc::new(CountingRepository {
                inner: InMemoryRepository::new(RepositoryContext {
                    config: Arc::clone(&config),
                    scheduler: Arc::new(ManualScheduler::new()),
                    deleter: Arc::new(NoopDeleter),
                }),
                ops: Arc::new(Mutex::new(Vec::new())),
                reads: AtomicUsize::new(0),
            });
            let notifier = Arc::new(RecordingNotifier::new());
            let ctx = Arc::new(SessionContext {
                config,
                repository: repo.clone(),
                notifier: notifier.clone(),
                counters: SessionCounters::default(),
            });
            Self {
                ctx,
                repo,
                notifier,
            }
        }

        /// A stored session loaded the way the manager hands it out.
        fn existing(&self, id: &str, attrs: &[(&str, AttributeValue)]) -> SessionFacade {
            let data = SessionData::new(id, 1_000, 600)
                .with_mandatory_remote_keys(self.ctx.config.mandatory_remote_keys.clone());
            self.repo.store(&data).unwrap();
            for (name, value) in attrs {
                self.repo.set_attribute(&data, name, value).unwrap();
            }
            SessionFacade::new(data, Arc::clone(&self.ctx))
        }

        fn created(&self, id: &str) -> SessionFacade {
            let mut data = SessionData::new(id, 1_000, 600);
            data.set_new(true);
            self.repo.store(&data).unwrap();
            SessionFacade::new(data, Arc::clone(&self.ctx))
        }

        fn take_ops(&self) -> Vec<String> {
            std::mem::take(&mut *self.repo.ops.lock())
        }
    }

    #[test]
    fn test_second_commit_writes_nothing() {
        let f = Fixture::new(SessionConfig::new());
        let session = f.existing("s", &[]);

        session.set_attribute("a", 1).unwrap();
        session.commit().unwrap();
        assert_eq!(f.take_ops(), vec!["add:a=1"]);

        session.commit().unwrap();
        assert!(f.take_ops().is_empty());
    }

    #[test]
    fn test_last_set_wins_in_diff() {
        let f = Fixture::new(SessionConfig::new());
        let session = f.existing("s", &[]);

        session.set_attribute("a", "v1").unwrap();
        session.set_attribute("a", "v2").unwrap();
        session.commit().unwrap();

        assert_eq!(f.take_ops(), vec!["add:a=\"v2\""]);
        assert_eq!(
            f.repo.get_attribute(&session.data(), "a").unwrap(),
            Some(json!("v2"))
        );
    }

    #[test]
    fn test_remove_is_committed_and_cached() {
        let f = Fixture::new(SessionConfig::new());
        let session = f.existing("s", &[("a", json!(true))]);

        session.remove_attribute("a").unwrap();
        let reads = f.repo.reads.load(Ordering::SeqCst);
        assert_eq!(session.get_attribute("a").unwrap(), None);
        assert_eq!(f.repo.reads.load(Ordering::SeqCst), reads);

        session.commit().unwrap();
        assert_eq!(f.take_ops(), vec!["remove:a"]);
        assert!(f.repo.get_all_keys(&session.data()).unwrap().is_empty());
    }

    #[test]
    fn test_null_value_removes() {
        let f = Fixture::new(SessionConfig::new());
        let session = f.existing("s", &[("a", json!(5))]);

        session.set_attribute("a", AttributeValue::Null).unwrap();
        session.commit().unwrap();
        assert_eq!(f.take_ops(), vec!["remove:a"]);
    }

    #[test]
    fn test_reads_are_cached() {
        let f = Fixture::new(SessionConfig::new());
        let session = f.existing("s", &[("a", json!(1))]);

        assert_eq!(session.get_attribute("a").unwrap(), Some(json!(1)));
        assert_eq!(session.get_attribute("a").unwrap(), Some(json!(1)));
        assert_eq!(session.get_attribute("missing").unwrap(), None);
        assert_eq!(session.get_attribute("missing").unwrap(), None);
        assert_eq!(f.repo.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_mandatory_remote_keys_bypass_cache() {
        let f = Fixture::new(SessionConfig::new().with_mandatory_remote_key("lock"));
        let session = f.existing("s", &[]);

        session.set_attribute("lock", "held").unwrap();
        assert_eq!(
            f.repo.get_attribute(&session.data(), "lock").unwrap(),
            Some(json!("held"))
        );

        let before = f.repo.reads.load(Ordering::SeqCst);
        session.get_attribute("lock").unwrap();
        session.get_attribute("lock").unwrap();
        assert_eq!(f.repo.reads.load(Ordering::SeqCst), before + 2);

        session.commit().unwrap();
        assert!(f.take_ops().is_empty());
    }

    #[test]
    fn test_mandatory_remote_events_follow_stored_value() {
        let f = Fixture::new(SessionConfig::new().with_mandatory_remote_key("lock"));
        let session = f.existing("s", &[("lock", json!("a"))]);

        session.set_attribute("lock", "b").unwrap();
        session.remove_attribute("lock").unwrap();
        session.remove_attribute("lock").unwrap();
        session.set_attribute("lock", "c").unwrap();

        assert_eq!(
            f.notifier.events(),
            vec![
                NotifierEvent::Replaced("lock".into(), json!("a"), json!("b")),
                NotifierEvent::Removed("lock".into(), json!("b")),
                NotifierEvent::Added("lock".into(), json!("c")),
            ]
        );
    }

    #[test]
    fn test_non_primitive_reads_replicate() {
        let config =
            SessionConfig::new().with_replication_trigger(ReplicationTrigger::SetAndNonPrimitiveGet);
        let f = Fixture::new(config);
        let session = f.existing("s", &[("list", json!([1])), ("count", json!(3))]);

        session.get_attribute("list").unwrap();
        session.get_attribute("count").unwrap();
        session.commit().unwrap();
        assert_eq!(f.take_ops(), vec!["add:list=[1]"]);

        session.get_attribute("list").unwrap();
        session.commit().unwrap();
        assert_eq!(f.take_ops(), vec!["add:list=[1]"]);
    }

    #[test]
    fn test_plain_reads_do_not_replicate() {
        let f = Fixture::new(SessionConfig::new());
        let session = f.existing("s", &[("list", json!([1]))]);

        session.get_attribute("list").unwrap();
        session.commit().unwrap();
        assert!(f.take_ops().is_empty());
    }

    #[test]
    fn test_attribute_events() {
        let f = Fixture::new(SessionConfig::new());
        let session = f.created("s");

        session.set_attribute("a", 1).unwrap();
        session.set_attribute("a", 2).unwrap();
        session.remove_attribute("a").unwrap();

        assert_eq!(
            f.notifier.events(),
            vec![
                NotifierEvent::Added("a".into(), json!(1)),
                NotifierEvent::Replaced("a".into(), json!(1), json!(2)),
                NotifierEvent::Removed("a".into(), json!(2)),
            ]
        );
    }

    #[test]
    fn test_replacing_stored_value_restores_it_first() {
        let f = Fixture::new(SessionConfig::new());
        let session = f.existing("s", &[("a", json!("old"))]);

        session.set_attribute("a", "new").unwrap();
        session.commit().unwrap();

        assert_eq!(
            f.notifier.events(),
            vec![
                NotifierEvent::Restored("a".into(), json!("old")),
                NotifierEvent::Replaced("a".into(), json!("old"), json!("new")),
                NotifierEvent::BeingStored("a".into(), json!("new")),
            ]
        );
    }

    #[test]
    fn test_attribute_names_merge_cache_and_store() {
        let f = Fixture::new(SessionConfig::new());
        let session = f.existing("s", &[("stored", json!(1)), ("gone", json!(2))]);

        session.set_attribute("local", 3).unwrap();
        session.remove_attribute("gone").unwrap();

        let names: Vec<_> = session.attribute_names().unwrap().into_iter().collect();
        assert_eq!(names, vec!["local".to_string(), "stored".to_string()]);
    }

    #[test]
    fn test_wrapped_facades_share_state_not_diff() {
        let f = Fixture::new(SessionConfig::new());
        let first = f.existing("s", &[]);
        let second = first.wrap();

        first.set_max_inactive_interval(30);
        assert_eq!(second.max_inactive_interval(), 30);

        first.set_attribute("a", 1).unwrap();
        second.commit().unwrap();
        assert!(f.take_ops().is_empty());

        assert!(first.check_used_and_lock());
        assert!(!second.check_used_and_lock());

        first.invalidate().unwrap();
        assert_eq!(second.state(), SessionState::Invalid);
        assert!(matches!(
            second.get_attribute("a"),
            Err(Error::InvalidSession(_))
        ));
    }

    #[test]
    fn test_diff_belongs_to_the_setting_facade() {
        let f = Fixture::new(SessionConfig::new());
        let original = f.existing("s", &[]);
        let wrapped = original.wrap();

        original.set_attribute("k", "from-original").unwrap();
        wrapped.commit().unwrap();
        assert!(f.take_ops().is_empty());
        original.commit().unwrap();
        assert_eq!(f.take_ops(), vec![r#"add:k="from-original""#]);

        wrapped.set_attribute("k", "from-wrapped").unwrap();
        original.commit().unwrap();
        assert!(f.take_ops().is_empty());
        wrapped.commit().unwrap();
        assert_eq!(f.take_ops(), vec![r#"add:k="from-wrapped""#]);
    }

    #[test]
    fn test_invalidate_notifies_and_removes() {
        let f = Fixture::new(SessionConfig::new());
        let session = f.existing("s", &[("a", json!(1))]);
        session.set_attribute("b", 2).unwrap();
        f.notifier.clear();

        session.invalidate().unwrap();

        assert_eq!(session.state(), SessionState::Invalid);
        assert!(f.repo.get("s").unwrap().is_none());
        assert_eq!(
            f.notifier.events(),
            vec![
                NotifierEvent::Removed("a".into(), json!(1)),
                NotifierEvent::Removed("b".into(), json!(2)),
                NotifierEvent::Destroyed {
                    id: "s".into(),
                    expired: false,
                },
            ]
        );

        assert!(matches!(session.invalidate(), Err(Error::InvalidSession(_))));
        session.commit().unwrap();
        assert!(f.take_ops().is_empty());
    }

    #[test]
    fn test_conflicting_invalidation() {
        let f = Fixture::new(SessionConfig::new());
        let session = f.existing("s", &[]);
        let other = SessionFacade::new(session.data(), Arc::clone(&f.ctx));

        assert!(f.repo.prepare_remove(&session.data()).unwrap());
        other.do_invalidate(true).unwrap();

        assert_eq!(other.state(), SessionState::Conflict);
        assert_eq!(f.ctx.counters.conflicts.load(Ordering::Relaxed), 1);
        assert!(!f
            .notifier
            .events()
            .iter()
            .any(|e| matches!(e, NotifierEvent::Destroyed { .. })));

        other.do_invalidate(true).unwrap();
        assert_eq!(f.ctx.counters.conflicts.load(Ordering::Relaxed), 1);
    }
}
