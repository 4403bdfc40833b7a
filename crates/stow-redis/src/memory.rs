//! In-process [`ValueStore`].
//!
//! Single-node stand-in for the remote backend, compiled for tests and the
//! `testing` feature. It supports:
//! - strings, hashes, sets and sorted sets
//! - TTLs with lazy expiry on access and [`MemoryStore::purge_expired`]
//! - key-expiry events on [`EXPIRED_CHANNEL`] once enabled
//! - pattern pub/sub using [`glob::Pattern`]
//!
//! Every command is appended to a log so tests can assert exactly which
//! backend calls an operation made.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::time::Duration;

use parking_lot::Mutex;
use stow_session::now_millis;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::store::{MessageListener, StoreError, StoreResult, TxCommand, ValueStore};

/// Channel on which key-expiry events are published.
pub const EXPIRED_CHANNEL: &str = "__keyevent@0__:expired";

const SUBSCRIBER_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
enum Value {
    Str(Vec<u8>),
    Hash(HashMap<String, Vec<u8>>),
    Set(BTreeSet<String>),
    ZSet(HashMap<String, f64>),
}

impl Value {
    fn is_empty_collection(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::Hash(h) => h.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::ZSet(z) => z.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// Epoch millisecond in store time.
    expires_at: Option<i64>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// View of the keyspace for one command, evicting expired keys it touches.
struct Keyspace<'a> {
    data: &'a mut HashMap<String, Entry>,
    now: i64,
    expired: Vec<String>,
}

impl Keyspace<'_> {
    fn evict_if_expired(&mut self, key: &str) {
        if self.data.get(key).is_some_and(|e| e.is_expired(self.now)) {
            self.data.remove(key);
            self.expired.push(key.to_string());
        }
    }

    fn entry(&mut self, key: &str) -> Option<&mut Entry> {
        self.evict_if_expired(key);
        self.data.get_mut(key)
    }

    fn entry_or(&mut self, key: &str, empty: fn() -> Value) -> &mut Entry {
        self.evict_if_expired(key);
        self.data
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(empty()))
    }

    /// Collections never stay around empty.
    fn drop_if_empty(&mut self, key: &str) {
        if self.data.get(key).is_some_and(|e| e.value.is_empty_collection()) {
            self.data.remove(key);
        }
    }

    fn hash(&mut self, key: &str) -> StoreResult<Option<&mut HashMap<String, Vec<u8>>>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(Some(h)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn hash_or_create(&mut self, key: &str) -> StoreResult<&mut HashMap<String, Vec<u8>>> {
        match &mut self.entry_or(key, || Value::Hash(HashMap::new())).value {
            Value::Hash(h) => Ok(h),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn set(&mut self, key: &str) -> StoreResult<Option<&mut BTreeSet<String>>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => Ok(Some(s)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn set_or_create(&mut self, key: &str) -> StoreResult<&mut BTreeSet<String>> {
        match &mut self.entry_or(key, || Value::Set(BTreeSet::new())).value {
            Value::Set(s) => Ok(s),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn zset(&mut self, key: &str) -> StoreResult<Option<&mut HashMap<String, f64>>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => Ok(Some(z)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn zset_or_create(&mut self, key: &str) -> StoreResult<&mut HashMap<String, f64>> {
        match &mut self.entry_or(key, || Value::ZSet(HashMap::new())).value {
            Value::ZSet(z) => Ok(z),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    /// Members ordered by score, then by member.
    fn sorted_members(&mut self, key: &str) -> StoreResult<Vec<(String, f64)>> {
        let mut members: Vec<(String, f64)> = match self.zset(key)? {
            Some(z) => z.iter().map(|(m, s)| (m.clone(), *s)).collect(),
            None => return Ok(Vec::new()),
        };
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(members)
    }
}

struct Subscriber {
    id: u64,
    pattern: glob::Pattern,
    sender: Sender<(String, String)>,
}

/// In-process key-value store implementing [`ValueStore`].
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Entry>>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscriber: AtomicU64,
    clock_offset_ms: AtomicI64,
    expiry_notifications: AtomicBool,
    closed: AtomicBool,
    log: Mutex<Vec<String>>,
    subscribe_failures: Mutex<VecDeque<StoreError>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Clock ───────────────────────────────────────────────────────

    /// Current store time in epoch milliseconds.
    pub fn now(&self) -> i64 {
        now_millis() + self.clock_offset_ms.load(Ordering::Relaxed)
    }

    /// Move the store clock forward.
    pub fn advance(&self, by: Duration) {
        let ms = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.clock_offset_ms.fetch_add(ms, Ordering::Relaxed);
    }

    // ── Inspection ──────────────────────────────────────────────────

    /// Every command issued so far, oldest first.
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Logged commands whose name is `name`.
    pub fn commands_named(&self, name: &str) -> Vec<String> {
        let prefix = format!("{name} ");
        self.log
            .lock()
            .iter()
            .filter(|c| c.starts_with(&prefix) || c.as_str() == name)
            .cloned()
            .collect()
    }

    pub fn clear_commands(&self) {
        self.log.lock().clear();
    }

    /// Expiry time of a live key, if it has one.
    pub fn expires_at(&self, key: &str) -> Option<i64> {
        let now = self.now();
        self.data
            .lock()
            .get(key)
            .filter(|e| !e.is_expired(now))
            .and_then(|e| e.expires_at)
    }

    /// Number of keys, expired ones included until they are evicted.
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn expiry_notifications_enabled(&self) -> bool {
        self.expiry_notifications.load(Ordering::Acquire)
    }

    // ── Fault injection ─────────────────────────────────────────────

    /// Make the next `psubscribe` call fail with `err`.
    pub fn fail_next_subscribe(&self, err: StoreError) {
        self.subscribe_failures.lock().push_back(err);
    }

    /// Drop every live subscription as if the connection was lost.
    pub fn disconnect_subscribers(&self) {
        let dropped = std::mem::take(&mut *self.subscribers.lock());
        debug!(count = dropped.len(), "Dropping subscriptions");
    }

    // ── Expiry ──────────────────────────────────────────────────────

    /// Evict every expired key now. Returns how many were evicted.
    pub fn purge_expired(&self) -> usize {
        let now = self.now();
        let expired: Vec<String> = {
            let mut data = self.data.lock();
            let keys: Vec<String> = data
                .iter()
                .filter(|(_, e)| e.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &keys {
                data.remove(key);
            }
            keys
        };
        self.notify_expired(&expired);
        expired.len()
    }

    fn notify_expired(&self, keys: &[String]) {
        if keys.is_empty() || !self.expiry_notifications_enabled() {
            return;
        }
        for key in keys {
            trace!(key = %key, "Key expired");
            self.record(format!("publish {EXPIRED_CHANNEL} {key}"));
            self.deliver(EXPIRED_CHANNEL, key);
        }
    }

    fn deliver(&self, channel: &str, message: &str) -> usize {
        let mut delivered = 0;
        self.subscribers.lock().retain(|s| {
            if !s.pattern.matches(channel) {
                return true;
            }
            let alive = s
                .sender
                .send((channel.to_string(), message.to_string()))
                .is_ok();
            if alive {
                delivered += 1;
            }
            alive
        });
        delivered
    }

    // ── Command plumbing ────────────────────────────────────────────

    fn record(&self, command: String) {
        self.log.lock().push(command);
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Run one command against the keyspace, then publish any lazy expiries.
    fn run<T>(
        &self,
        command: String,
        f: impl FnOnce(&mut Keyspace<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.check_open()?;
        self.record(command);
        let now = self.now();
        let (result, expired) = {
            let mut data = self.data.lock();
            let mut keyspace = Keyspace {
                data: &mut *data,
                now,
                expired: Vec::new(),
            };
            let result = f(&mut keyspace);
            (result, keyspace.expired)
        };
        self.notify_expired(&expired);
        result
    }
}

impl ValueStore for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.run(format!("get {key}"), |ks| match ks.entry(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(v),
                ..
            }) => Ok(Some(v.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        })
    }

    fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.run(format!("set {key}"), |ks| {
            ks.data
                .insert(key.to_string(), Entry::new(Value::Str(value.to_vec())));
            Ok(())
        })
    }

    fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Vec<u8>>> {
        self.run(format!("hget {key} {field}"), |ks| {
            Ok(ks.hash(key)?.and_then(|h| h.get(field).cloned()))
        })
    }

    fn hset(&self, key: &str, field: &str, value: &[u8]) -> StoreResult<()> {
        self.run(format!("hset {key} {field}"), |ks| {
            ks.hash_or_create(key)?
                .insert(field.to_string(), value.to_vec());
            Ok(())
        })
    }

    fn hsetnx(&self, key: &str, field: &str, value: &[u8]) -> StoreResult<bool> {
        self.run(format!("hsetnx {key} {field}"), |ks| {
            let hash = ks.hash_or_create(key)?;
            if hash.contains_key(field) {
                return Ok(false);
            }
            hash.insert(field.to_string(), value.to_vec());
            Ok(true)
        })
    }

    fn hmget(&self, key: &str, fields: &[&str]) -> StoreResult<Vec<Option<Vec<u8>>>> {
        self.run(format!("hmget {key} {}", fields.join(" ")), |ks| {
            Ok(match ks.hash(key)? {
                Some(h) => fields.iter().map(|f| h.get(*f).cloned()).collect(),
                None => vec![None; fields.len()],
            })
        })
    }

    fn hmset(&self, key: &str, fields: &[(String, Vec<u8>)]) -> StoreResult<()> {
        let names: Vec<&str> = fields.iter().map(|(f, _)| f.as_str()).collect();
        self.run(format!("hmset {key} {}", names.join(" ")), |ks| {
            let hash = ks.hash_or_create(key)?;
            for (field, value) in fields {
                hash.insert(field.clone(), value.clone());
            }
            Ok(())
        })
    }

    fn hdel(&self, key: &str, fields: &[&str]) -> StoreResult<usize> {
        self.run(format!("hdel {key} {}", fields.join(" ")), |ks| {
            let removed = match ks.hash(key)? {
                Some(h) => fields.iter().filter(|f| h.remove(**f).is_some()).count(),
                None => 0,
            };
            ks.drop_if_empty(key);
            Ok(removed)
        })
    }

    fn hkeys(&self, key: &str) -> StoreResult<Vec<String>> {
        self.run(format!("hkeys {key}"), |ks| {
            Ok(ks
                .hash(key)?
                .map(|h| h.keys().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.run(format!("sadd {key} {member}"), |ks| {
            Ok(ks.set_or_create(key)?.insert(member.to_string()))
        })
    }

    fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.run(format!("srem {key} {member}"), |ks| {
            let removed = ks.set(key)?.is_some_and(|s| s.remove(member));
            ks.drop_if_empty(key);
            Ok(removed)
        })
    }

    fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.run(format!("smembers {key}"), |ks| {
            Ok(ks
                .set(key)?
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn spop(&self, key: &str) -> StoreResult<Option<String>> {
        self.run(format!("spop {key}"), |ks| {
            let popped = ks.set(key)?.and_then(|s| s.pop_first());
            ks.drop_if_empty(key);
            Ok(popped)
        })
    }

    fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<bool> {
        self.run(format!("zadd {key} {member} {score}"), |ks| {
            Ok(ks
                .zset_or_create(key)?
                .insert(member.to_string(), score)
                .is_none())
        })
    }

    fn zrem(&self, key: &str, member: &str) -> StoreResult<usize> {
        self.run(format!("zrem {key} {member}"), |ks| {
            let removed = ks
                .zset(key)?
                .and_then(|z| z.remove(member))
                .map_or(0, |_| 1);
            ks.drop_if_empty(key);
            Ok(removed)
        })
    }

    fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>> {
        self.run(format!("zrangebyscore {key} {min} {max}"), |ks| {
            Ok(ks
                .sorted_members(key)?
                .into_iter()
                .filter(|(_, score)| *score >= min && *score <= max)
                .map(|(member, _)| member)
                .collect())
        })
    }

    fn zrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        self.run(format!("zrange {key} {start} {stop}"), |ks| {
            let members = ks.sorted_members(key)?;
            let len = members.len() as isize;
            let resolve = |i: isize| if i < 0 { len + i } else { i };
            let (start, stop) = (resolve(start).max(0), resolve(stop).min(len - 1));
            if start > stop {
                return Ok(Vec::new());
            }
            Ok(members[start as usize..=stop as usize]
                .iter()
                .map(|(member, _)| member.clone())
                .collect())
        })
    }

    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.run(format!("expire {key} {ttl_ms}"), |ks| {
            let now = ks.now;
            Ok(match ks.entry(key) {
                Some(entry) => {
                    entry.expires_at = Some(now.saturating_add(ttl_ms));
                    true
                }
                None => false,
            })
        })
    }

    fn expire_at(&self, key: &str, at_millis: i64) -> StoreResult<bool> {
        self.run(format!("expireat {key} {at_millis}"), |ks| {
            Ok(match ks.entry(key) {
                Some(entry) => {
                    entry.expires_at = Some(at_millis);
                    true
                }
                None => false,
            })
        })
    }

    fn persist(&self, key: &str) -> StoreResult<bool> {
        self.run(format!("persist {key}"), |ks| {
            Ok(ks.entry(key).is_some_and(|e| e.expires_at.take().is_some()))
        })
    }

    fn rename(&self, from: &str, to: &str) -> StoreResult<()> {
        self.run(format!("rename {from} {to}"), |ks| {
            ks.evict_if_expired(from);
            ks.evict_if_expired(to);
            let entry = ks
                .data
                .remove(from)
                .ok_or_else(|| StoreError::NoSuchKey(from.to_string()))?;
            ks.data.insert(to.to_string(), entry);
            Ok(())
        })
    }

    fn del(&self, key: &str) -> StoreResult<bool> {
        self.run(format!("del {key}"), |ks| {
            ks.evict_if_expired(key);
            Ok(ks.data.remove(key).is_some())
        })
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        self.run(format!("exists {key}"), |ks| Ok(ks.entry(key).is_some()))
    }

    fn transaction(&self, key: &str, commands: Vec<TxCommand>) -> StoreResult<()> {
        self.run(format!("multi {key} {}", commands.len()), |ks| {
            let hash = ks.hash_or_create(key)?;
            for command in commands {
                match command {
                    TxCommand::HSet { field, value } => {
                        hash.insert(field, value);
                    }
                    TxCommand::HMSet(fields) => hash.extend(fields),
                    TxCommand::HDel(fields) => {
                        for field in &fields {
                            hash.remove(field);
                        }
                    }
                }
            }
            ks.drop_if_empty(key);
            Ok(())
        })
    }

    fn psubscribe(
        &self,
        pattern: &str,
        listener: &dyn MessageListener,
        cancel: &CancellationToken,
    ) -> StoreResult<()> {
        self.check_open()?;
        self.record(format!("psubscribe {pattern}"));
        if let Some(err) = self.subscribe_failures.lock().pop_front() {
            return Err(err);
        }
        let matcher = glob::Pattern::new(pattern)
            .map_err(|e| StoreError::Command(format!("invalid pattern '{pattern}': {e}")))?;

        let (sender, receiver) = mpsc::channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(Subscriber {
            id,
            pattern: matcher,
            sender,
        });
        listener.on_subscribed(pattern);

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }
            match receiver.recv_timeout(SUBSCRIBER_POLL) {
                Ok((channel, message)) => listener.on_message(&channel, &message),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    break if self.closed.load(Ordering::Acquire) {
                        Ok(())
                    } else {
                        Err(StoreError::Connection(
                            "subscription connection lost".to_string(),
                        ))
                    };
                }
            }
        };

        self.subscribers.lock().retain(|s| s.id != id);
        result
    }

    fn publish(&self, channel: &str, message: &str) -> StoreResult<usize> {
        self.check_open()?;
        self.record(format!("publish {channel} {message}"));
        Ok(self.deliver(channel, message))
    }

    fn enable_expiry_notifications(&self) -> StoreResult<()> {
        self.check_open()?;
        self.record("config set notify-keyspace-events Ex".to_string());
        self.expiry_notifications.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.subscribers.lock().clear();
        debug!("Memory store closed");
    }
}
