//! In-process storage backend.
//!
//! # Responsibilities
//! - Provide the full `StorageBackend` contract without external services
//! - Allow outage and per-operation fault injection so breaker, buffer and
//!   recovery paths can be exercised

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::storage::{StorageBackend, StorageError, StorageResult};

/// Storage operation, for targeted fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOp {
    Set,
    Get,
    Delete,
    Push,
    Pop,
    ListLen,
    Zadd,
    ZrangeByScore,
    Zrevrange,
    Zrem,
    Zcard,
    Ping,
}

#[derive(Default)]
struct Data {
    values: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
    sorted_sets: HashMap<String, HashMap<String, f64>>,
}

#[derive(Default)]
struct Faults {
    /// Remaining forced failures per operation.
    fail_next: HashMap<StorageOp, u32>,
    /// Go unavailable once this operation next succeeds.
    outage_after: Option<StorageOp>,
    /// One-shot delay before the operation runs.
    delay_next: HashMap<StorageOp, Duration>,
}

/// Mutex-protected maps standing in for a Redis-compatible service.
#[derive(Default)]
pub struct InMemoryStorage {
    data: Mutex<Data>,
    faults: Mutex<Faults>,
    unavailable: AtomicBool,
    /// Operations attempted, including rejected ones.
    operations: AtomicU64,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails until restored.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
        tracing::debug!(available, "In-memory storage availability changed");
    }

    pub fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    /// Fail the next `times` calls of `op` without touching the data.
    pub fn fail_next(&self, op: StorageOp, times: u32) {
        self.faults.lock().fail_next.insert(op, times);
    }

    /// Become unavailable right after the next successful `op`. A `Pop` only
    /// counts when it returns an element.
    pub fn outage_after(&self, op: StorageOp) {
        self.faults.lock().outage_after = Some(op);
    }

    /// Stall the next call of `op` for `delay` before it runs.
    pub fn delay_next(&self, op: StorageOp, delay: Duration) {
        self.faults.lock().delay_next.insert(op, delay);
    }

    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    async fn check(&self, op: StorageOp) -> StorageResult<()> {
        self.operations.fetch_add(1, Ordering::SeqCst);

        let delay = self.faults.lock().delay_next.remove(&op);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("connection refused".into()));
        }

        let mut faults = self.faults.lock();
        if let Some(remaining) = faults.fail_next.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StorageError::Backend(format!("injected {op:?} failure")));
            }
        }
        Ok(())
    }

    fn succeeded(&self, op: StorageOp) {
        let mut faults = self.faults.lock();
        if faults.outage_after == Some(op) {
            faults.outage_after = None;
            self.unavailable.store(true, Ordering::SeqCst);
            tracing::debug!(?op, "In-memory storage going unavailable after operation");
        }
    }

    fn sorted(set: &HashMap<String, f64>) -> Vec<(&String, f64)> {
        let mut members: Vec<_> = set.iter().map(|(m, s)| (m, *s)).collect();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        members
    }
}

#[async_trait]
impl StorageBackend for InMemoryStorage {
    async fn set(&self, key: &str, value: String) -> StorageResult<()> {
        self.check(StorageOp::Set).await?;
        self.data.lock().values.insert(key.to_string(), value);
        self.succeeded(StorageOp::Set);
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.check(StorageOp::Get).await?;
        let value = self.data.lock().values.get(key).cloned();
        self.succeeded(StorageOp::Get);
        Ok(value)
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        self.check(StorageOp::Delete).await?;
        let existed = self.data.lock().values.remove(key).is_some();
        self.succeeded(StorageOp::Delete);
        Ok(existed)
    }

    async fn push(&self, list: &str, value: String) -> StorageResult<()> {
        self.check(StorageOp::Push).await?;
        self.data.lock().lists.entry(list.to_string()).or_default().push_front(value);
        self.succeeded(StorageOp::Push);
        Ok(())
    }

    async fn pop(&self, list: &str) -> StorageResult<Option<String>> {
        self.check(StorageOp::Pop).await?;
        let value = self.data.lock().lists.get_mut(list).and_then(|l| l.pop_back());
        if value.is_some() {
            self.succeeded(StorageOp::Pop);
        }
        Ok(value)
    }

    async fn list_len(&self, list: &str) -> StorageResult<usize> {
        self.check(StorageOp::ListLen).await?;
        let len = self.data.lock().lists.get(list).map_or(0, |l| l.len());
        self.succeeded(StorageOp::ListLen);
        Ok(len)
    }

    async fn zadd(&self, set: &str, member: &str, score: f64) -> StorageResult<()> {
        self.check(StorageOp::Zadd).await?;
        self.data
            .lock()
            .sorted_sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string(), score);
        self.succeeded(StorageOp::Zadd);
        Ok(())
    }

    async fn zrange_by_score(&self, set: &str, min: f64, max: f64, limit: usize) -> StorageResult<Vec<String>> {
        self.check(StorageOp::ZrangeByScore).await?;
        let members = {
            let data = self.data.lock();
            match data.sorted_sets.get(set) {
                Some(members) => Self::sorted(members)
                    .into_iter()
                    .filter(|(_, score)| *score >= min && *score <= max)
                    .take(limit)
                    .map(|(m, _)| m.clone())
                    .collect(),
                None => Vec::new(),
            }
        };
        self.succeeded(StorageOp::ZrangeByScore);
        Ok(members)
    }

    async fn zrevrange(&self, set: &str, start: usize, stop: usize) -> StorageResult<Vec<String>> {
        self.check(StorageOp::Zrevrange).await?;
        if stop < start {
            return Ok(Vec::new());
        }
        let members = {
            let data = self.data.lock();
            match data.sorted_sets.get(set) {
                Some(members) => Self::sorted(members)
                    .into_iter()
                    .rev()
                    .skip(start)
                    .take(stop - start + 1)
                    .map(|(m, _)| m.clone())
                    .collect(),
                None => Vec::new(),
            }
        };
        self.succeeded(StorageOp::Zrevrange);
        Ok(members)
    }

    async fn zrem(&self, set: &str, member: &str) -> StorageResult<bool> {
        self.check(StorageOp::Zrem).await?;
        let existed = self
            .data
            .lock()
            .sorted_sets
            .get_mut(set)
            .is_some_and(|s| s.remove(member).is_some());
        self.succeeded(StorageOp::Zrem);
        Ok(existed)
    }

    async fn zcard(&self, set: &str) -> StorageResult<usize> {
        self.check(StorageOp::Zcard).await?;
        let len = self.data.lock().sorted_sets.get(set).map_or(0, |s| s.len());
        self.succeeded(StorageOp::Zcard);
        Ok(len)
    }

    async fn ping(&self) -> StorageResult<()> {
        self.check(StorageOp::Ping).await?;
        self.succeeded(StorageOp::Ping);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_key_values() {
        let storage = InMemoryStorage::new();
        storage.set("k", "v".into()).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(storage.delete("k").await.unwrap());
        assert!(!storage.delete("k").await.unwrap());
        assert!(storage.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_is_fifo() {
        let storage = InMemoryStorage::new();
        for v in ["a", "b", "c"] {
            storage.push("l", v.into()).await.unwrap();
        }
        assert_eq!(storage.list_len("l").await.unwrap(), 3);
        assert_eq!(storage.pop("l").await.unwrap().as_deref(), Some("a"));
        assert_eq!(storage.pop("l").await.unwrap().as_deref(), Some("b"));
        assert_eq!(storage.pop("l").await.unwrap().as_deref(), Some("c"));
        assert!(storage.pop("l").await.unwrap().is_none());
        assert!(storage.pop("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sorted_set_ranges() {
        let storage = InMemoryStorage::new();
        storage.zadd("z", "old", 1.0).await.unwrap();
        storage.zadd("z", "mid", 5.0).await.unwrap();
        storage.zadd("z", "new", 9.0).await.unwrap();

        assert_eq!(storage.zrange_by_score("z", 0.0, 5.0, 10).await.unwrap(), vec!["old", "mid"]);
        assert_eq!(storage.zrange_by_score("z", 0.0, 100.0, 1).await.unwrap(), vec!["old"]);
        assert_eq!(storage.zrevrange("z", 0, 1).await.unwrap(), vec!["new", "mid"]);
        assert_eq!(storage.zrevrange("z", 0, 99).await.unwrap().len(), 3);

        assert!(storage.zrem("z", "mid").await.unwrap());
        assert!(!storage.zrem("z", "mid").await.unwrap());
        assert_eq!(storage.zcard("z").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_outage_injection() {
        let storage = InMemoryStorage::new();
        storage.set_available(false);
        assert!(matches!(storage.ping().await, Err(StorageError::Backend(_))));
        assert!(storage.set("k", "v".into()).await.is_err());

        storage.set_available(true);
        storage.ping().await.unwrap();
        assert_eq!(storage.operation_count(), 3);
    }

    #[tokio::test]
    async fn test_targeted_failures() {
        let storage = InMemoryStorage::new();
        storage.zadd("z", "m", 1.0).await.unwrap();
        storage.fail_next(StorageOp::Zrem, 1);

        assert!(storage.zrem("z", "m").await.is_err());
        assert_eq!(storage.zcard("z").await.unwrap(), 1, "failed call must not change data");
        assert!(storage.zrem("z", "m").await.unwrap());
    }

    #[tokio::test]
    async fn test_outage_after_non_empty_pop() {
        let storage = InMemoryStorage::new();
        storage.push("l", "a".into()).await.unwrap();
        storage.outage_after(StorageOp::Pop);

        assert!(storage.pop("empty").await.unwrap().is_none());
        assert!(storage.is_available());
        assert_eq!(storage.pop("l").await.unwrap().as_deref(), Some("a"));
        assert!(!storage.is_available());
        assert!(storage.get("k").await.is_err());
    }

    #[tokio::test]
    async fn test_delay_is_one_shot() {
        let storage = InMemoryStorage::new();
        storage.delay_next(StorageOp::Ping, Duration::from_millis(50));

        let started = std::time::Instant::now();
        storage.ping().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));

        let started = std::time::Instant::now();
        storage.ping().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(50));
    }
}
