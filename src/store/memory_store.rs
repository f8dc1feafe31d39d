//! In-process `KvStore` used by tests and by the demo binary when no Redis URL is configured.

use super::KvStore;
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Default)]
struct Inner {
    strings: HashMap<String, (String, Option<Instant>)>,
    lists: HashMap<String, Vec<String>>,
    sets: HashMap<String, HashSet<String>>,
    zsets: HashMap<String, BTreeMap<String, f64>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

/// Single-process, mutex-guarded store. Mirrors the surface of `RedisStore` exactly so tests
/// and the demo binary can swap between the two without changing call sites.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner").finish_non_exhaustive()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut guard = self.lock();
        if let Some((value, expires)) = guard.strings.get(key).cloned() {
            if expires.map_or(false, |at| Instant::now() >= at) {
                guard.strings.remove(key);
                return Ok(None);
            }
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires = ttl.map(|d| Instant::now() + d);
        self.lock().strings.insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut guard = self.lock();
        guard.strings.remove(key);
        guard.lists.remove(key);
        guard.sets.remove(key);
        guard.zsets.remove(key);
        guard.hashes.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError> {
        let mut guard = self.lock();
        let current = guard.strings.get(key).map(|(v, _)| v.as_str());
        if current == expected {
            guard.strings.insert(key.to_string(), (new.to_string(), None));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn list_push_right(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock().lists.entry(key.to_string()).or_default().push(value.to_string());
        Ok(())
    }

    async fn list_pop_left(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut guard = self.lock();
        match guard.lists.get_mut(key) {
            Some(list) if !list.is_empty() => Ok(Some(list.remove(0))),
            _ => Ok(None),
        }
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if let Some(list) = self.lock().lists.get_mut(key) {
            list.retain(|v| v != value);
        }
        Ok(())
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.lock().lists.get(key).map_or(0, |l| l.len()))
    }

    async fn list_range(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<String>, StoreError> {
        let guard = self.lock();
        Ok(match guard.lists.get(key) {
            Some(list) => list.iter().skip(offset).take(limit).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.lock().sets.entry(key.to_string()).or_default().insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        if let Some(set) = self.lock().sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.lock().sets.get(key).map(|s| s.iter().cloned().collect()).unwrap_or_default())
    }

    async fn zset_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.lock().zsets.entry(key.to_string()).or_default().insert(member.to_string(), score);
        Ok(())
    }

    async fn zset_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        if let Some(zset) = self.lock().zsets.get_mut(key) {
            zset.remove(member);
        }
        Ok(())
    }

    async fn zset_range_by_score(&self, key: &str, max_score: f64) -> Result<Vec<String>, StoreError> {
        let guard = self.lock();
        Ok(match guard.zsets.get(key) {
            Some(zset) => {
                let mut entries: Vec<(&String, &f64)> =
                    zset.iter().filter(|(_, &score)| score <= max_score).collect();
                entries.sort_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal));
                entries.into_iter().map(|(member, _)| member.clone()).collect()
            }
            None => Vec::new(),
        })
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self
            .lock()
            .hashes
            .get(key)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<(), StoreError> {
        if let Some(hash) = self.lock().hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }
}
