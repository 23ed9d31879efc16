use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;

use super::kv::{rank_top, KvStore};

enum Value {
    Bytes(Bytes),
    SortedSet(HashMap<String, f64>),
    Set(BTreeSet<String>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Bytes(_) => "string",
            Value::SortedSet(_) => "zset",
            Value::Set(_) => "set",
        }
    }
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| now >= t)
    }
}

/// Process-local store with lazy TTL expiry. Counters are atomic per key
/// through the map's shard locks.
#[derive(Default)]
pub struct MemoryKvStore {
    map: DashMap<String, Entry>,
}

fn wrong_type(key: &str, found: &Value, wanted: &str) -> anyhow::Error {
    anyhow::anyhow!(
        "WRONGTYPE key '{}' holds a {}, expected {}",
        key,
        found.type_name(),
        wanted
    )
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drops every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.map.len();
        self.map.retain(|_, e| !e.is_expired(now));
        before.saturating_sub(self.map.len())
    }

    /// Live entry for `key`, removing it first if expired.
    fn live(&self, key: &str) -> Option<dashmap::mapref::one::Ref<'_, String, Entry>> {
        let entry = self.map.get(key)?;
        if entry.is_expired(Instant::now()) {
            drop(entry);
            self.map.remove_if(key, |_, e| e.is_expired(Instant::now()));
            return None;
        }
        Some(entry)
    }

    /// Write access to `key`, (re)creating it with `init` when absent or expired.
    fn with_entry<T>(
        &self,
        key: &str,
        init: impl FnOnce() -> Value,
        f: impl FnOnce(&mut Value) -> Result<T>,
    ) -> Result<T> {
        let now = Instant::now();
        match self.map.entry(key.to_string()) {
            MapEntry::Occupied(mut occ) => {
                if occ.get().is_expired(now) {
                    occ.insert(Entry { value: init(), expires_at: None });
                }
                f(&mut occ.get_mut().value)
            }
            MapEntry::Vacant(vac) => {
                let mut entry = vac.insert(Entry { value: init(), expires_at: None });
                f(&mut entry.value)
            }
        }
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match self.live(key) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                Value::Bytes(b) => Ok(Some(b.clone())),
                other => Err(wrong_type(key, other, "string")),
            },
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|t| Instant::now() + t);
        self.map.insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .map
            .remove(key)
            .is_some_and(|(_, e)| !e.is_expired(now)))
    }

    async fn zincr(&self, key: &str, member: &str, by: f64) -> Result<f64> {
        self.with_entry(
            key,
            || Value::SortedSet(HashMap::new()),
            |value| match value {
                Value::SortedSet(scores) => {
                    let score = scores.entry(member.to_string()).or_insert(0.0);
                    *score += by;
                    Ok(*score)
                }
                other => Err(wrong_type(key, other, "zset")),
            },
        )
    }

    async fn ztop(&self, key: &str, n: usize) -> Result<Vec<(String, f64)>> {
        let Some(entry) = self.live(key) else {
            return Ok(Vec::new());
        };
        let Value::SortedSet(scores) = &entry.value else {
            return Err(wrong_type(key, &entry.value, "zset"));
        };

        let mut ranked: Vec<(String, f64)> =
            scores.iter().map(|(m, s)| (m.clone(), *s)).collect();
        rank_top(&mut ranked, n);
        Ok(ranked)
    }

    async fn sadd_bounded(&self, key: &str, member: &str, max_len: usize) -> Result<bool> {
        self.with_entry(
            key,
            || Value::Set(BTreeSet::new()),
            |value| match value {
                Value::Set(members) => {
                    if members.contains(member) {
                        return Ok(true);
                    }
                    if members.len() >= max_len {
                        return Ok(false);
                    }
                    members.insert(member.to_string());
                    Ok(true)
                }
                other => Err(wrong_type(key, other, "set")),
            },
        )
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        match self.live(key) {
            None => Ok(Vec::new()),
            Some(entry) => match &entry.value {
                Value::Set(members) => Ok(members.iter().cloned().collect()),
                other => Err(wrong_type(key, other, "set")),
            },
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_is_lazy() {
        let store = MemoryKvStore::new();
        store
            .set("k", Bytes::from_static(b"v"), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        store.set("forever", Bytes::from_static(b"x"), None).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.get("forever").await.unwrap().is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_sorted_set_ordering() {
        let store = MemoryKvStore::new();
        for member in ["b", "a", "c", "a", "c", "c"] {
            store.zincr("z", member, 1.0).await.unwrap();
        }
        let top = store.ztop("z", 10).await.unwrap();
        assert_eq!(
            top,
            vec![("c".to_string(), 3.0), ("a".to_string(), 2.0), ("b".to_string(), 1.0)]
        );
        assert_eq!(store.ztop("z", 1).await.unwrap().len(), 1);
        assert!(store.ztop("missing", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ties_sort_by_member() {
        let store = MemoryKvStore::new();
        for member in ["zeta", "alpha", "mid"] {
            store.zincr("z", member, 1.0).await.unwrap();
        }
        let names: Vec<String> = store.ztop("z", 3).await.unwrap().into_iter().map(|(m, _)| m).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);

        let cut = store.ztop("z", 1).await.unwrap();
        assert_eq!(cut, vec![("alpha".to_string(), 1.0)]);
    }

    #[tokio::test]
    async fn test_bounded_set() {
        let store = MemoryKvStore::new();
        assert!(store.sadd_bounded("s", "one", 2).await.unwrap());
        assert!(store.sadd_bounded("s", "two", 2).await.unwrap());
        assert!(!store.sadd_bounded("s", "three", 2).await.unwrap());
        assert!(store.sadd_bounded("s", "one", 2).await.unwrap());
        assert_eq!(store.smembers("s").await.unwrap(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_wrong_type_and_delete() {
        let store = MemoryKvStore::new();
        store.set("k", Bytes::from_static(b"v"), None).await.unwrap();
        assert!(store.zincr("k", "m", 1.0).await.is_err());
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.zincr("k", "m", 1.0).await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_atomic() {
        let store = Arc::new(MemoryKvStore::new());
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        store.zincr("z", "q", 1.0).await.unwrap();
                    }
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(store.ztop("z", 1).await.unwrap()[0].1, 800.0);
    }
}
