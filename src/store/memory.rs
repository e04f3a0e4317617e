//! In-process coordination store.
//!
//! Mirrors the semantics of a Redis keyspace: each key holds one typed value,
//! empty collections disappear, strings may carry an expiry, and the whole
//! keyspace sits behind one mutex so every trait call is atomic. Expiry uses
//! [`tokio::time::Instant`] so tests can drive time with `tokio::time::pause`.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{CoordinationStore, FollowUp, Guard, Key, StoreOp};
use crate::error::{FleetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Str,
    List,
    Set,
    Hash,
}

impl Kind {
    fn empty(self) -> Value {
        match self {
            Kind::Str => Value::Str(String::new()),
            Kind::List => Value::List(VecDeque::new()),
            Kind::Set => Value::Set(BTreeSet::new()),
            Kind::Hash => Value::Hash(BTreeMap::new()),
        }
    }
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Set(BTreeSet<String>),
    Hash(BTreeMap<String, String>),
}

impl Value {
    fn kind(&self) -> Kind {
        match self {
            Value::Str(_) => Kind::Str,
            Value::List(_) => Kind::List,
            Value::Set(_) => Kind::Set,
            Value::Hash(_) => Kind::Hash,
        }
    }

    fn is_empty_collection(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::List(l) => l.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::Hash(h) => h.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    fn purge_expired(&mut self, key: &str) {
        let now = Instant::now();
        if self
            .entries
            .get(key)
            .is_some_and(|e| e.expires_at.is_some_and(|at| at <= now))
        {
            self.entries.remove(key);
        }
    }

    /// Typed access to a live key, optionally creating an empty value.
    fn slot(&mut self, key: &str, kind: Kind, create: bool) -> Result<Option<&mut Value>> {
        self.purge_expired(key);
        match self.entries.get(key) {
            Some(entry) if entry.value.kind() != kind => {
                return Err(FleetError::Store(format!(
                    "WRONGTYPE key {key} holds {:?}, expected {kind:?}",
                    entry.value.kind()
                )));
            }
            Some(_) => {}
            None if create => {
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        value: kind.empty(),
                        expires_at: None,
                    },
                );
            }
            None => {}
        }
        Ok(self.entries.get_mut(key).map(|e| &mut e.value))
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self
            .entries
            .get(key)
            .is_some_and(|e| e.value.is_empty_collection())
        {
            self.entries.remove(key);
        }
    }

    fn list_len(&mut self, key: &str) -> Result<usize> {
        Ok(match self.slot(key, Kind::List, false)? {
            Some(Value::List(l)) => l.len(),
            _ => 0,
        })
    }

    fn hash_field(&mut self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(match self.slot(key, Kind::Hash, false)? {
            Some(Value::Hash(h)) => h.get(field).cloned(),
            _ => None,
        })
    }

    fn holds(&mut self, guard: &Guard) -> Result<bool> {
        match guard {
            Guard::HashFieldEquals { hash, field, value } => {
                Ok(self.hash_field(&hash.render(), field)?.as_deref() == Some(value.as_str()))
            }
            Guard::HashFieldAbsent { hash, field } => {
                Ok(self.hash_field(&hash.render(), field)?.is_none())
            }
            Guard::ListEmpty { list } => Ok(self.list_len(&list.render())? == 0),
        }
    }

    /// Verify that `op` can be applied, without mutating anything.
    fn check(&mut self, op: &StoreOp) -> Result<()> {
        match op {
            StoreOp::PushBack { list, .. }
            | StoreOp::PushFront { list, .. }
            | StoreOp::ListRemove { list, .. } => {
                self.slot(&list.render(), Kind::List, false)?;
            }
            StoreOp::SetAdd { set, .. } | StoreOp::SetRemove { set, .. } => {
                self.slot(&set.render(), Kind::Set, false)?;
            }
            StoreOp::HashSet { hash, .. } | StoreOp::HashDelete { hash, .. } => {
                self.slot(&hash.render(), Kind::Hash, false)?;
            }
            StoreOp::HashIncr { hash, field, .. } => {
                if let Some(current) = self.hash_field(&hash.render(), field)? {
                    current.parse::<i64>().map_err(|_| {
                        FleetError::Store(format!("field {field} of {hash} is not an integer"))
                    })?;
                }
            }
            StoreOp::Delete { .. } => {}
        }
        Ok(())
    }

    fn apply(&mut self, op: StoreOp) -> Result<()> {
        match op {
            StoreOp::PushBack { list, value } => {
                if let Some(Value::List(l)) = self.slot(&list.render(), Kind::List, true)? {
                    l.push_back(value);
                }
            }
            StoreOp::PushFront { list, value } => {
                if let Some(Value::List(l)) = self.slot(&list.render(), Kind::List, true)? {
                    l.push_front(value);
                }
            }
            StoreOp::ListRemove { list, value } => {
                let key = list.render();
                if let Some(Value::List(l)) = self.slot(&key, Kind::List, false)? {
                    l.retain(|v| v != &value);
                }
                self.drop_if_empty(&key);
            }
            StoreOp::SetAdd { set, member } => {
                if let Some(Value::Set(s)) = self.slot(&set.render(), Kind::Set, true)? {
                    s.insert(member);
                }
            }
            StoreOp::SetRemove { set, member } => {
                let key = set.render();
                if let Some(Value::Set(s)) = self.slot(&key, Kind::Set, false)? {
                    s.remove(&member);
                }
                self.drop_if_empty(&key);
            }
            StoreOp::HashSet { hash, field, value } => {
                if let Some(Value::Hash(h)) = self.slot(&hash.render(), Kind::Hash, true)? {
                    h.insert(field, value);
                }
            }
            StoreOp::HashDelete { hash, field } => {
                let key = hash.render();
                if let Some(Value::Hash(h)) = self.slot(&key, Kind::Hash, false)? {
                    h.remove(&field);
                }
                self.drop_if_empty(&key);
            }
            StoreOp::HashIncr { hash, field, by } => {
                if let Some(Value::Hash(h)) = self.slot(&hash.render(), Kind::Hash, true)? {
                    let current = match h.get(&field) {
                        Some(raw) => raw.parse::<i64>().map_err(|_| {
                            FleetError::Store(format!("field {field} of {hash} is not an integer"))
                        })?,
                        None => 0,
                    };
                    h.insert(field, (current + by).to_string());
                }
            }
            StoreOp::Delete { key } => {
                self.entries.remove(&key.render());
            }
        }
        Ok(())
    }

    fn apply_all(&mut self, ops: Vec<StoreOp>) -> Result<()> {
        for op in &ops {
            self.check(op)?;
        }
        for op in ops {
            self.apply(op)?;
        }
        Ok(())
    }
}

/// Coordination store living in the current process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn list_push_back(&self, list: &Key, value: &str) -> Result<usize> {
        let mut ks = self.keyspace.lock().await;
        let key = list.render();
        match ks.slot(&key, Kind::List, true)? {
            Some(Value::List(l)) => {
                l.push_back(value.to_string());
                Ok(l.len())
            }
            _ => Ok(0),
        }
    }

    async fn list_push_front(&self, list: &Key, value: &str) -> Result<usize> {
        let mut ks = self.keyspace.lock().await;
        let key = list.render();
        match ks.slot(&key, Kind::List, true)? {
            Some(Value::List(l)) => {
                l.push_front(value.to_string());
                Ok(l.len())
            }
            _ => Ok(0),
        }
    }

    async fn list_pop_front(&self, list: &Key) -> Result<Option<String>> {
        let mut ks = self.keyspace.lock().await;
        let key = list.render();
        let popped = match ks.slot(&key, Kind::List, false)? {
            Some(Value::List(l)) => l.pop_front(),
            _ => None,
        };
        ks.drop_if_empty(&key);
        Ok(popped)
    }

    async fn list_pop_front_then(
        &self,
        list: &Key,
        follow_up: FollowUp,
    ) -> Result<Option<String>> {
        let mut ks = self.keyspace.lock().await;
        let key = list.render();
        let popped = match ks.slot(&key, Kind::List, false)? {
            Some(Value::List(l)) => l.pop_front(),
            _ => None,
        };
        let Some(value) = popped else {
            return Ok(None);
        };
        ks.drop_if_empty(&key);

        let ops = follow_up(&value);
        if let Err(e) = ops.iter().try_for_each(|op| ks.check(op)) {
            // Undo the pop so the failed follow-up leaves no trace.
            if let Some(Value::List(l)) = ks.slot(&key, Kind::List, true)? {
                l.push_front(value);
            }
            return Err(e);
        }
        for op in ops {
            ks.apply(op)?;
        }
        Ok(Some(value))
    }

    async fn list_remove(&self, list: &Key, value: &str) -> Result<usize> {
        let mut ks = self.keyspace.lock().await;
        let key = list.render();
        let removed = match ks.slot(&key, Kind::List, false)? {
            Some(Value::List(l)) => {
                let before = l.len();
                l.retain(|v| v != value);
                before - l.len()
            }
            _ => 0,
        };
        ks.drop_if_empty(&key);
        Ok(removed)
    }

    async fn list_len(&self, list: &Key) -> Result<usize> {
        self.keyspace.lock().await.list_len(&list.render())
    }

    async fn list_range(&self, list: &Key, limit: Option<usize>) -> Result<Vec<String>> {
        let mut ks = self.keyspace.lock().await;
        Ok(match ks.slot(&list.render(), Kind::List, false)? {
            Some(Value::List(l)) => l
                .iter()
                .take(limit.unwrap_or(usize::MAX))
                .cloned()
                .collect(),
            _ => Vec::new(),
        })
    }

    async fn list_trim(&self, list: &Key, keep: usize) -> Result<()> {
        let mut ks = self.keyspace.lock().await;
        let key = list.render();
        if let Some(Value::List(l)) = ks.slot(&key, Kind::List, false)? {
            l.truncate(keep);
        }
        ks.drop_if_empty(&key);
        Ok(())
    }

    async fn set_add(&self, set: &Key, member: &str) -> Result<bool> {
        let mut ks = self.keyspace.lock().await;
        Ok(match ks.slot(&set.render(), Kind::Set, true)? {
            Some(Value::Set(s)) => s.insert(member.to_string()),
            _ => false,
        })
    }

    async fn set_remove(&self, set: &Key, member: &str) -> Result<bool> {
        let mut ks = self.keyspace.lock().await;
        let key = set.render();
        let removed = match ks.slot(&key, Kind::Set, false)? {
            Some(Value::Set(s)) => s.remove(member),
            _ => false,
        };
        ks.drop_if_empty(&key);
        Ok(removed)
    }

    async fn set_members(&self, set: &Key) -> Result<Vec<String>> {
        let mut ks = self.keyspace.lock().await;
        Ok(match ks.slot(&set.render(), Kind::Set, false)? {
            Some(Value::Set(s)) => s.iter().cloned().collect(),
            _ => Vec::new(),
        })
    }

    async fn set_contains(&self, set: &Key, member: &str) -> Result<bool> {
        let mut ks = self.keyspace.lock().await;
        Ok(match ks.slot(&set.render(), Kind::Set, false)? {
            Some(Value::Set(s)) => s.contains(member),
            _ => false,
        })
    }

    async fn hash_set(&self, hash: &Key, field: &str, value: &str) -> Result<()> {
        let mut ks = self.keyspace.lock().await;
        if let Some(Value::Hash(h)) = ks.slot(&hash.render(), Kind::Hash, true)? {
            h.insert(field.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn hash_get(&self, hash: &Key, field: &str) -> Result<Option<String>> {
        self.keyspace.lock().await.hash_field(&hash.render(), field)
    }

    async fn hash_delete(&self, hash: &Key, field: &str) -> Result<bool> {
        let mut ks = self.keyspace.lock().await;
        let key = hash.render();
        let removed = match ks.slot(&key, Kind::Hash, false)? {
            Some(Value::Hash(h)) => h.remove(field).is_some(),
            _ => false,
        };
        ks.drop_if_empty(&key);
        Ok(removed)
    }

    async fn hash_get_all(&self, hash: &Key) -> Result<BTreeMap<String, String>> {
        let mut ks = self.keyspace.lock().await;
        Ok(match ks.slot(&hash.render(), Kind::Hash, false)? {
            Some(Value::Hash(h)) => h.clone(),
            _ => BTreeMap::new(),
        })
    }

    async fn put(&self, key: &Key, value: &str) -> Result<()> {
        let mut ks = self.keyspace.lock().await;
        ks.entries.insert(
            key.render(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn put_ex(&self, key: &Key, value: &str, ttl: Duration) -> Result<()> {
        let mut ks = self.keyspace.lock().await;
        ks.entries.insert(
            key.render(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &Key) -> Result<Option<String>> {
        let mut ks = self.keyspace.lock().await;
        Ok(match ks.slot(&key.render(), Kind::Str, false)? {
            Some(Value::Str(s)) => Some(s.clone()),
            _ => None,
        })
    }

    async fn exists(&self, key: &Key) -> Result<bool> {
        let mut ks = self.keyspace.lock().await;
        let key = key.render();
        ks.purge_expired(&key);
        Ok(ks.entries.contains_key(&key))
    }

    async fn delete(&self, key: &Key) -> Result<bool> {
        let mut ks = self.keyspace.lock().await;
        let key = key.render();
        ks.purge_expired(&key);
        Ok(ks.entries.remove(&key).is_some())
    }

    async fn try_lock(&self, key: &Key, token: &str, lease: Duration) -> Result<bool> {
        let mut ks = self.keyspace.lock().await;
        let key = key.render();
        ks.purge_expired(&key);
        if ks.entries.contains_key(&key) {
            return Ok(false);
        }
        ks.entries.insert(
            key,
            Entry {
                value: Value::Str(token.to_string()),
                expires_at: Some(Instant::now() + lease),
            },
        );
        Ok(true)
    }

    async fn unlock(&self, key: &Key, token: &str) -> Result<bool> {
        let mut ks = self.keyspace.lock().await;
        let key = key.render();
        ks.purge_expired(&key);
        let held = matches!(
            ks.entries.get(&key),
            Some(Entry { value: Value::Str(holder), .. }) if holder == token
        );
        if held {
            ks.entries.remove(&key);
        }
        Ok(held)
    }

    async fn atomic(&self, guard: Option<Guard>, ops: Vec<StoreOp>) -> Result<bool> {
        let mut ks = self.keyspace.lock().await;
        if let Some(guard) = guard {
            if !ks.holds(&guard)? {
                return Ok(false);
            }
        }
        ks.apply_all(ops)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{TenantId, WorkerName};

    fn tenant(name: &str) -> TenantId {
        TenantId::new(name).unwrap()
    }

    #[tokio::test]
    async fn list_is_fifo_and_disappears_when_empty() {
        let store = MemoryStore::new();
        let q = Key::Queue(tenant("a"));

        store.list_push_back(&q, "1").await.unwrap();
        store.list_push_back(&q, "2").await.unwrap();
        store.list_push_front(&q, "0").await.unwrap();
        assert_eq!(store.list_range(&q, None).await.unwrap(), vec!["0", "1", "2"]);

        assert_eq!(store.list_pop_front(&q).await.unwrap().as_deref(), Some("0"));
        assert_eq!(store.list_pop_front(&q).await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.list_pop_front(&q).await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.list_pop_front(&q).await.unwrap(), None);
        assert!(!store.exists(&q).await.unwrap());
    }

    #[tokio::test]
    async fn list_remove_counts_all_occurrences() {
        let store = MemoryStore::new();
        let q = Key::Queue(tenant("a"));
        for v in ["x", "y", "x", "x"] {
            store.list_push_back(&q, v).await.unwrap();
        }
        assert_eq!(store.list_remove(&q, "x").await.unwrap(), 3);
        assert_eq!(store.list_remove(&q, "missing").await.unwrap(), 0);
        assert_eq!(store.list_len(&q).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn wrong_type_is_an_error() {
        let store = MemoryStore::new();
        let key = Key::ActiveWorkers;
        store.set_add(&key, "w").await.unwrap();
        assert!(matches!(
            store.list_push_back(&key, "v").await,
            Err(FleetError::Store(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expiring_keys_lapse() {
        let store = MemoryStore::new();
        let hb = Key::Heartbeat(WorkerName::new("w1").unwrap());
        store.put_ex(&hb, "1", Duration::from_millis(100)).await.unwrap();
        assert!(store.exists(&hb).await.unwrap());

        tokio::time::advance(Duration::from_millis(99)).await;
        assert!(store.exists(&hb).await.unwrap());

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(!store.exists(&hb).await.unwrap());
        assert_eq!(store.get(&hb).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_is_exclusive_and_token_checked() {
        let store = MemoryStore::new();
        let lock = Key::ArtifactLock(tenant("a"));
        let lease = Duration::from_secs(1);

        assert!(store.try_lock(&lock, "t1", lease).await.unwrap());
        assert!(!store.try_lock(&lock, "t2", lease).await.unwrap());
        assert!(!store.unlock(&lock, "t2").await.unwrap());
        assert!(store.unlock(&lock, "t1").await.unwrap());
        assert!(store.try_lock(&lock, "t2", lease).await.unwrap());

        // An abandoned lease can be taken over once it expires.
        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(store.try_lock(&lock, "t3", lease).await.unwrap());
        assert!(!store.unlock(&lock, "t2").await.unwrap());
    }

    #[tokio::test]
    async fn atomic_respects_guard() {
        let store = MemoryStore::new();
        let records = Key::ProcessingRecords(tenant("a"));
        let done = Key::Done(tenant("a"));
        store.hash_set(&records, "img.png", "w1").await.unwrap();

        let ops = vec![
            StoreOp::HashDelete {
                hash: records.clone(),
                field: "img.png".to_string(),
            },
            StoreOp::SetAdd {
                set: done.clone(),
                member: "img.png".to_string(),
            },
        ];
        let wrong = Guard::HashFieldEquals {
            hash: records.clone(),
            field: "img.png".to_string(),
            value: "w2".to_string(),
        };
        assert!(!store.atomic(Some(wrong), ops.clone()).await.unwrap());
        assert!(!store.set_contains(&done, "img.png").await.unwrap());

        let right = Guard::HashFieldEquals {
            hash: records.clone(),
            field: "img.png".to_string(),
            value: "w1".to_string(),
        };
        assert!(store.atomic(Some(right), ops).await.unwrap());
        assert!(store.set_contains(&done, "img.png").await.unwrap());
        assert_eq!(store.hash_get(&records, "img.png").await.unwrap(), None);
    }

    #[tokio::test]
    async fn atomic_is_all_or_nothing() {
        let store = MemoryStore::new();
        let done = Key::Done(tenant("a"));
        store.put(&Key::MonitorEvents, "not a list").await.unwrap();

        let result = store
            .atomic(
                None,
                vec![
                    StoreOp::SetAdd {
                        set: done.clone(),
                        member: "x".to_string(),
                    },
                    StoreOp::PushBack {
                        list: Key::MonitorEvents,
                        value: "e".to_string(),
                    },
                ],
            )
            .await;
        assert!(result.is_err());
        assert!(!store.exists(&done).await.unwrap());
    }

    #[tokio::test]
    async fn pop_then_applies_follow_up_with_popped_value() {
        let store = MemoryStore::new();
        let q = Key::Queue(tenant("a"));
        let processing = Key::Processing(tenant("a"));
        store.list_push_back(&q, "img.png").await.unwrap();

        let set = processing.clone();
        let popped = store
            .list_pop_front_then(
                &q,
                Box::new(move |value| {
                    vec![StoreOp::SetAdd {
                        set: set.clone(),
                        member: value.to_string(),
                    }]
                }),
            )
            .await
            .unwrap();

        assert_eq!(popped.as_deref(), Some("img.png"));
        assert!(store.set_contains(&processing, "img.png").await.unwrap());
        assert_eq!(store.list_len(&q).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn hash_incr_counts_from_zero() {
        let store = MemoryStore::new();
        let retries = Key::Retries(tenant("a"));
        for _ in 0..2 {
            store
                .atomic(
                    None,
                    vec![StoreOp::HashIncr {
                        hash: retries.clone(),
                        field: "x".to_string(),
                        by: 1,
                    }],
                )
                .await
                .unwrap();
        }
        assert_eq!(store.hash_get(&retries, "x").await.unwrap().as_deref(), Some("2"));
    }
}
