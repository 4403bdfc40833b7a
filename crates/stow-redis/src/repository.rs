//! Session repository over a remote key-value store.
//!
//! One hash per session holds the timing fields (see [`crate::encoding`])
//! and one field per attribute with the value as JSON. Eviction is delegated
//! to the [`ExpirationStrategy`] chosen by configuration.

use std::collections::BTreeSet;
use std::sync::Arc;

use stow_config::{ConfigError, SessionConfig};
use stow_session::{
    AttributeValue, CommitTransaction, Error, RepositoryContext, Result, SessionData,
    SessionRepository,
};
use tracing::{debug, info, trace, warn};

use crate::encoding::{
    CREATION_TIME, INVALID_FLAG, INVALID_SESSION, LAST_ACCESSED, LOOKUP_FIELDS,
    MAX_INACTIVE_INTERVAL, OWNER, RESERVED_PREFIX, check_attribute_name, decode_attribute, decode_owner, decode_timing, encode_attribute,
    encode_timing,
};
use crate::expiration::{ExpirationStrategy, StrategyContext, build_strategy};
use crate::keys::{KeyLayout, is_valid_id};
use crate::store::{TxCommand, ValueStore};

/// Session repository backed by a [`ValueStore`].
pub struct RemoteRepository {
    config: Arc<SessionConfig>,
    store: Arc<dyn ValueStore>,
    keys: KeyLayout,
    strategy: Box<dyn ExpirationStrategy>,
}

impl RemoteRepository {
    /// Build the repository and the expiration strategy selected by
    /// `config.remote`.
    pub fn new(ctx: RepositoryContext, store: Arc<dyn ValueStore>) -> Result<Self> {
        let remote = ctx.config.remote.as_ref().ok_or_else(|| ConfigError::MissingField {
            field: "remote".to_string(),
            context: "remote session repository".to_string(),
        })?;
        let keys = KeyLayout::new(&remote.key_prefix, &ctx.config.namespace);
        let strategy = build_strategy(
            remote.expiration,
            StrategyContext::new(&ctx, Arc::clone(&store), keys.clone()),
            ctx.config.max_inactive_interval,
        );
        Ok(Self::with_strategy(ctx, store, keys, strategy))
    }

    /// Build the repository around an explicit strategy.
    pub fn with_strategy(
        ctx: RepositoryContext,
        store: Arc<dyn ValueStore>,
        keys: KeyLayout,
        strategy: Box<dyn ExpirationStrategy>,
    ) -> Self {
        Self {
            config: ctx.config,
            store,
            keys,
            strategy,
        }
    }

    /// Repository builder for [`stow_session::SessionManagerBuilder::build`].
    pub fn factory(
        store: Arc<dyn ValueStore>,
    ) -> impl FnOnce(RepositoryContext) -> Result<Arc<dyn SessionRepository>> {
        move |ctx| Ok(Arc::new(RemoteRepository::new(ctx, store)?) as Arc<dyn SessionRepository>)
    }

    pub fn keys(&self) -> &KeyLayout {
        &self.keys
    }

    pub fn strategy(&self) -> &dyn ExpirationStrategy {
        self.strategy.as_ref()
    }

    /// Forward a new default inactivity timeout to the strategy.
    pub fn configuration_changed(&self, max_inactive_interval: i32) {
        self.strategy.configuration_changed(max_inactive_interval);
    }

    fn session_key(&self, session: &SessionData) -> String {
        self.keys.session_key(session.id())
    }

    /// `session` carrying the timing stored under `key`.
    ///
    /// Lookups bump the in-memory access time without writing it, so expiry
    /// bookkeeping has to be found from the stored fields. Falls back to
    /// `session` when the hash holds no readable timing.
    fn with_stored_timing(&self, key: &str, session: &SessionData) -> Result<SessionData> {
        let values = self
            .store
            .hmget(key, &[LAST_ACCESSED, MAX_INACTIVE_INTERVAL, CREATION_TIME])?;
        let [last_accessed, mii, creation]: [Option<Vec<u8>>; 3] =
            values.try_into().map_err(|v: Vec<Option<Vec<u8>>>| {
                Error::Decode(format!("expected 3 timing fields, got {}", v.len()))
            })?;

        let timing = match decode_timing(
            last_accessed.as_deref(),
            mii.as_deref(),
            creation.as_deref(),
        ) {
            Ok(Some(timing)) => timing,
            Ok(None) => return Ok(session.clone()),
            Err(e) => {
                debug!(session_id = %session.id(), error = %e, "Stored timing unreadable");
                return Ok(session.clone());
            }
        };

        let mut stored = SessionData::restored(
            session.id(),
            timing.creation_time,
            timing.last_accessed,
            timing.max_inactive_interval,
        );
        if let Some(new_id) = session.new_id() {
            stored.set_new_id(new_id);
        }
        Ok(stored)
    }
}

impl SessionRepository for RemoteRepository {
    fn get(&self, id: &str) -> Result<Option<SessionData>> {
        if !is_valid_id(id) {
            debug!(session_id = %id, "Rejecting malformed session id");
            return Ok(None);
        }

        let values = self.store.hmget(&self.keys.session_key(id), &LOOKUP_FIELDS)?;
        let [last_accessed, mii, creation, invalid, owner]: [Option<Vec<u8>>; 5] =
            values.try_into().map_err(|v: Vec<Option<Vec<u8>>>| {
                Error::Decode(format!("expected {} fields, got {}", LOOKUP_FIELDS.len(), v.len()))
            })?;

        if invalid.is_some() {
            trace!(session_id = %id, "Session is being removed");
            return Ok(None);
        }
        let Some(timing) = decode_timing(
            last_accessed.as_deref(),
            mii.as_deref(),
            creation.as_deref(),
        )?
        else {
            return Ok(None);
        };
        let owner = owner.as_deref().map(decode_owner).transpose()?;

        Ok(Some(
            SessionData::restored(
                id,
                timing.creation_time,
                timing.last_accessed,
                timing.max_inactive_interval,
            )
            .with_mandatory_remote_keys(self.config.mandatory_remote_keys.clone())
            .with_previous_owner(owner),
        ))
    }

    fn store(&self, session: &SessionData) -> Result<()> {
        let mut fields = encode_timing(session);
        if self.config.sticky
            && let Some(owner) = session.previous_owner()
        {
            fields.push((OWNER.to_string(), owner.as_bytes().to_vec()));
        }
        self.store.hmset(&self.session_key(session), &fields)?;
        self.strategy.session_touched(session)
    }

    fn get_attribute(&self, session: &SessionData, name: &str) -> Result<Option<AttributeValue>> {
        check_attribute_name(name)?;
        self.store
            .hget(&self.session_key(session), name)?
            .map(|bytes| decode_attribute(&bytes))
            .transpose()
    }

    fn set_attribute(
        &self,
        session: &SessionData,
        name: &str,
        value: &AttributeValue,
    ) -> Result<()> {
        check_attribute_name(name)?;
        let bytes = encode_attribute(value)?;
        self.store.hset(&self.session_key(session), name, &bytes)?;
        Ok(())
    }

    fn remove_attribute(&self, session: &SessionData, name: &str) -> Result<()> {
        check_attribute_name(name)?;
        self.store.hdel(&self.session_key(session), &[name])?;
        Ok(())
    }

    fn get_all_keys(&self, session: &SessionData) -> Result<BTreeSet<String>> {
        Ok(self
            .store
            .hkeys(&self.session_key(session))?
            .into_iter()
            .filter(|k| !k.starts_with(RESERVED_PREFIX))
            .collect())
    }

    fn remove(&self, session: &SessionData) -> Result<()> {
        let key = self.session_key(session);
        let stored = self.with_stored_timing(&key, session)?;
        self.store.del(&key)?;
        self.strategy.session_deleted(&stored)
    }

    fn prepare_remove(&self, session: &SessionData) -> Result<bool> {
        let key = self.session_key(session);
        if !self.store.hsetnx(&key, INVALID_SESSION, INVALID_FLAG)? {
            return Ok(false);
        }
        // A claim on a hash that had no session in it just created that hash.
        if self.store.hget(&key, CREATION_TIME)?.is_none() {
            self.store.del(&key)?;
            return Ok(false);
        }
        Ok(true)
    }

    fn start_commit(&self, session: &SessionData) -> Result<Box<dyn CommitTransaction + '_>> {
        Ok(Box::new(RemoteTransaction {
            repository: self,
            session: session.clone(),
            added: Vec::new(),
            removed: Vec::new(),
            error: None,
        }))
    }

    /// Rename the hash, then move the strategy's bookkeeping.
    ///
    /// These are two separate calls. A crash between them leaves the
    /// session under its new key while the expiry index still points at the
    /// old id; the hash TTL still bounds its lifetime.
    fn session_id_change(&self, session: &SessionData) -> Result<()> {
        let Some(new_id) = session.new_id() else {
            return Ok(());
        };
        if !is_valid_id(new_id) {
            return Err(Error::InvalidSession(format!("malformed new id '{new_id}'")));
        }

        let new_key = self.keys.session_key(new_id);
        self.store
            .rename(&self.keys.session_key(session.id()), &new_key)?;
        let stored = self.with_stored_timing(&new_key, session)?;
        self.strategy.session_id_change(&stored)
    }

    /// Always empty: the store offers no key scan.
    fn owned_session_ids(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn start(&self) -> Result<()> {
        if self.strategy.requires_expiry_notifications() {
            self.store.enable_expiry_notifications()?;
        }
        self.strategy.start_expired_sessions_task()?;
        info!(namespace = %self.config.namespace, "Remote session repository started");
        Ok(())
    }

    fn close(&self) {
        self.strategy.close();
        self.store.close();
    }

    fn is_distributed(&self) -> bool {
        true
    }
}

/// Attribute changes applied in one keyed transaction on commit.
struct RemoteTransaction<'a> {
    repository: &'a RemoteRepository,
    session: SessionData,
    added: Vec<(String, Vec<u8>)>,
    removed: Vec<String>,
    /// First encoding failure, reported by `commit`.
    error: Option<Error>,
}

impl CommitTransaction for RemoteTransaction<'_> {
    fn add_attribute(&mut self, name: &str, value: &AttributeValue) {
        let encoded = check_attribute_name(name).and_then(|()| encode_attribute(value));
        match encoded {
            Ok(bytes) => self.added.push((name.to_string(), bytes)),
            Err(e) => {
                warn!(session_id = %self.session.id(), attribute = name, error = %e, "Cannot store attribute");
                self.error.get_or_insert(e);
            }
        }
    }

    fn remove_attribute(&mut self, name: &str) {
        match check_attribute_name(name) {
            Ok(()) => self.removed.push(name.to_string()),
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let RemoteTransaction {
            repository,
            session,
            added,
            removed,
            error,
        } = *self;
        if let Some(e) = error {
            return Err(e);
        }

        if !added.is_empty() || !removed.is_empty() {
            let mut commands = Vec::with_capacity(2);
            if !removed.is_empty() {
                commands.push(TxCommand::HDel(removed));
            }
            if !added.is_empty() {
                commands.push(TxCommand::HMSet(added));
            }
            repository
                .store
                .transaction(&repository.session_key(&session), commands)?;
        }
        repository.store(&session)
    }

    fn is_distributing(&self) -> bool {
        true
    }

    fn is_set_all_attributes(&self) -> bool {
        false
    }
}
