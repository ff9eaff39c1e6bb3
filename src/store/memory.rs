//! In-memory [`KvStore`].
//!
//! Backed by `DashMap`; each operation holds the key's shard lock for its
//! whole read-modify-write, which gives the same per-key atomicity a Redis
//! `INCR`/`SETNX`/`LPUSH`+`LTRIM` script would.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use dashmap::DashMap;

use super::KvStore;
use crate::error::StoreError;

#[derive(Debug, Default)]
pub struct InMemoryStore {
    values: DashMap<String, String>,
    lists: DashMap<String, VecDeque<String>>,
    ranked: DashMap<String, HashMap<String, f64>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every key.
    pub fn clear(&self) {
        self.values.clear();
        self.lists.clear();
        self.ranked.clear();
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.values.len() + self.lists.len() + self.ranked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn corrupt(key: &str, raw: &str) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        message: format!("not a number: {}", raw),
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<String, StoreError> {
        let entry = self
            .values
            .entry(key.to_string())
            .or_insert_with(|| value.to_string());
        Ok(entry.value().clone())
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut entry = self.values.entry(key.to_string()).or_insert_with(|| "0".to_string());
        let current: i64 = entry.parse().map_err(|_| corrupt(key, &entry))?;
        let next = current + delta;
        *entry = next.to_string();
        Ok(next)
    }

    async fn incr_float_clamped(
        &self,
        key: &str,
        delta: f64,
        min: f64,
        max: f64,
    ) -> Result<f64, StoreError> {
        let mut entry = self.values.entry(key.to_string()).or_insert_with(|| "0".to_string());
        let current: f64 = entry.parse().map_err(|_| corrupt(key, &entry))?;
        let next = (current + delta).clamp(min, max);
        *entry = next.to_string();
        Ok(next)
    }

    async fn push_trim(&self, key: &str, value: &str, max_len: usize) -> Result<(), StoreError> {
        let mut list = self.lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        list.truncate(max_len);
        Ok(())
    }

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lists
            .get(key)
            .map(|list| list.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn zincr(&self, key: &str, member: &str, delta: f64) -> Result<f64, StoreError> {
        let mut set = self.ranked.entry(key.to_string()).or_default();
        let score = set.entry(member.to_string()).or_insert(0.0);
        *score += delta;
        Ok(*score)
    }

    async fn ztop(&self, key: &str, limit: usize) -> Result<Vec<(String, f64)>, StoreError> {
        let mut members: Vec<(String, f64)> = self
            .ranked
            .get(key)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        // ties by member so the order is stable
        members.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
        members.truncate(limit);
        Ok(members)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.values.remove(key);
        self.lists.remove(key);
        self.ranked.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_set_if_absent_first_write_wins() {
        let store = InMemoryStore::new();
        assert_eq!(store.set_if_absent("k", "a").await.unwrap(), "a");
        assert_eq!(store.set_if_absent("k", "b").await.unwrap(), "a");
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(InMemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let s = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    s.incr("counter", 1).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get("counter").await.unwrap().as_deref(), Some("800"));
    }

    #[tokio::test]
    async fn test_float_increment_clamps() {
        let store = InMemoryStore::new();
        for _ in 0..10 {
            store.incr_float_clamped("adj", 0.75, -2.0, 2.0).await.unwrap();
        }
        assert_eq!(store.incr_float_clamped("adj", 0.0, -2.0, 2.0).await.unwrap(), 2.0);
        for _ in 0..10 {
            store.incr_float_clamped("adj", -0.75, -2.0, 2.0).await.unwrap();
        }
        assert_eq!(store.incr_float_clamped("adj", 0.0, -2.0, 2.0).await.unwrap(), -2.0);
    }

    #[tokio::test]
    async fn test_non_numeric_counter_is_corrupt() {
        let store = InMemoryStore::new();
        store.set("k", "abc").await.unwrap();
        assert!(matches!(store.incr("k", 1).await, Err(StoreError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_push_trim_keeps_newest_first() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store.push_trim("log", &i.to_string(), 3).await.unwrap();
        }
        assert_eq!(store.list_range("log", 10).await.unwrap(), vec!["4", "3", "2"]);
        assert_eq!(store.list_range("log", 1).await.unwrap(), vec!["4"]);
        store.delete("log").await.unwrap();
        assert!(store.list_range("log", 10).await.unwrap().is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_ranked_set_orders_by_score() {
        let store = InMemoryStore::new();
        store.zincr("p", "sales:keyword:precio", 1.0).await.unwrap();
        store.zincr("p", "support:instant:no funciona", 1.0).await.unwrap();
        store.zincr("p", "support:instant:no funciona", 2.0).await.unwrap();
        store.zincr("p", "general:intent:question", 1.0).await.unwrap();

        let top = store.ztop("p", 2).await.unwrap();
        assert_eq!(
            top,
            vec![
                ("support:instant:no funciona".to_string(), 3.0),
                ("general:intent:question".to_string(), 1.0),
            ]
        );
        assert!(store.ztop("missing", 5).await.unwrap().is_empty());
    }
}
