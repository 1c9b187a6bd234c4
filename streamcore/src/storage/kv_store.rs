//! `KvStore` abstracts the Redis primitives the storage layer needs,
//! per Design Note "Abstract transport": callers code against this
//! trait, a real `redis`-backed implementation and an in-memory test
//! double both satisfy it, and tests inject the latter.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::error::StreamResult;

/// One write operation batched into a `pipeline()` round trip.
#[derive(Debug, Clone)]
pub enum PipelineOp {
    ZAdd { key: String, score: f64, member: String },
    ZRemRangeByScore { key: String, min: f64, max: f64 },
    LPush { key: String, value: String },
    LTrim { key: String, start: i64, stop: i64 },
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn hset(&self, key: &str, field: &str, value: &str) -> StreamResult<()>;
    async fn hgetall(&self, key: &str) -> StreamResult<HashMap<String, String>>;

    async fn lpush(&self, key: &str, value: &str) -> StreamResult<()>;
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> StreamResult<()>;
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StreamResult<Vec<String>>;

    async fn zadd(&self, key: &str, score: f64, member: &str) -> StreamResult<()>;
    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> StreamResult<Vec<(String, f64)>>;
    async fn zrevrange(&self, key: &str, start: i64, stop: i64) -> StreamResult<Vec<(String, f64)>>;
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> StreamResult<()>;
    async fn zincrby(&self, key: &str, score: f64, member: &str) -> StreamResult<()>;

    async fn publish(&self, channel: &str, message: &str) -> StreamResult<()>;

    /// Execute a batch of writes as one atomic round trip.
    async fn pipeline(&self, ops: Vec<PipelineOp>) -> StreamResult<()>;

    async fn ping(&self) -> StreamResult<()>;

    /// Approximate count of keys matching `pattern` (§9 open question:
    /// documented as racy/approximate under concurrent mutation, not
    /// removed).
    async fn scan_count(&self, pattern: &str) -> StreamResult<usize>;
}

/// In-memory `KvStore` double used by tests — no network, no Redis.
#[derive(Default)]
pub struct InMemoryStore {
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
    lists: Mutex<HashMap<String, Vec<String>>>,
    sorted_sets: Mutex<HashMap<String, BTreeMap<String, f64>>>,
    pub published: Mutex<Vec<(String, String)>>,
    pub fail_next: Mutex<usize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arrange for the next `n` operations to fail, simulating a
    /// connection outage for circuit-breaker tests.
    pub fn fail_next_calls(&self, n: usize) {
        *self.fail_next.lock().unwrap() = n;
    }

    fn maybe_fail(&self) -> StreamResult<()> {
        let mut n = self.fail_next.lock().unwrap();
        if *n > 0 {
            *n -= 1;
            return Err(crate::error::StreamCoreError::Storage(anyhow::anyhow!(
                "simulated connection error"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn hset(&self, key: &str, field: &str, value: &str) -> StreamResult<()> {
        self.maybe_fail()?;
        self.hashes
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> StreamResult<HashMap<String, String>> {
        self.maybe_fail()?;
        Ok(self
            .hashes
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn lpush(&self, key: &str, value: &str) -> StreamResult<()> {
        self.maybe_fail()?;
        self.lists
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .insert(0, value.to_string());
        Ok(())
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> StreamResult<()> {
        self.maybe_fail()?;
        let mut lists = self.lists.lock().unwrap();
        if let Some(list) = lists.get_mut(key) {
            let len = list.len() as i64;
            let start = start.clamp(0, len) as usize;
            let stop = (stop + 1).clamp(0, len) as usize;
            *list = if start < stop {
                list[start..stop].to_vec()
            } else {
                Vec::new()
            };
        }
        Ok(())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StreamResult<Vec<String>> {
        self.maybe_fail()?;
        let lists = self.lists.lock().unwrap();
        let Some(list) = lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as i64;
        let start = start.clamp(0, len) as usize;
        let stop = (stop + 1).clamp(0, len) as usize;
        Ok(if start < stop {
            list[start..stop].to_vec()
        } else {
            Vec::new()
        })
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> StreamResult<()> {
        self.maybe_fail()?;
        self.sorted_sets
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> StreamResult<Vec<(String, f64)>> {
        self.maybe_fail()?;
        let sets = self.sorted_sets.lock().unwrap();
        let Some(set) = sets.get(key) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<(String, f64)> = set
            .iter()
            .filter(|(_, &score)| score >= min && score <= max)
            .map(|(m, &s)| (m.clone(), s))
            .collect();
        entries.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        Ok(entries)
    }

    async fn zrevrange(&self, key: &str, start: i64, stop: i64) -> StreamResult<Vec<(String, f64)>> {
        self.maybe_fail()?;
        let sets = self.sorted_sets.lock().unwrap();
        let Some(set) = sets.get(key) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<(String, f64)> =
            set.iter().map(|(m, &s)| (m.clone(), s)).collect();
        entries.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        let len = entries.len() as i64;
        let start = start.clamp(0, len) as usize;
        let stop = (stop + 1).clamp(0, len) as usize;
        Ok(if start < stop {
            entries[start..stop].to_vec()
        } else {
            Vec::new()
        })
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> StreamResult<()> {
        self.maybe_fail()?;
        if let Some(set) = self.sorted_sets.lock().unwrap().get_mut(key) {
            set.retain(|_, &mut score| !(score >= min && score <= max));
        }
        Ok(())
    }

    async fn zincrby(&self, key: &str, score: f64, member: &str) -> StreamResult<()> {
        self.maybe_fail()?;
        *self
            .sorted_sets
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .entry(member.to_string())
            .or_insert(0.0) += score;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> StreamResult<()> {
        self.maybe_fail()?;
        self.published
            .lock()
            .unwrap()
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }

    async fn pipeline(&self, ops: Vec<PipelineOp>) -> StreamResult<()> {
        self.maybe_fail()?;
        for op in ops {
            match op {
                PipelineOp::ZAdd { key, score, member } => self.zadd(&key, score, &member).await?,
                PipelineOp::ZRemRangeByScore { key, min, max } => {
                    self.zremrangebyscore(&key, min, max).await?
                }
                PipelineOp::LPush { key, value } => self.lpush(&key, &value).await?,
                PipelineOp::LTrim { key, start, stop } => self.ltrim(&key, start, stop).await?,
            }
        }
        Ok(())
    }

    async fn ping(&self) -> StreamResult<()> {
        self.maybe_fail()
    }

    async fn scan_count(&self, pattern: &str) -> StreamResult<usize> {
        self.maybe_fail()?;
        let prefix = pattern.trim_end_matches('*');
        Ok(self
            .sorted_sets
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .count())
    }
}
