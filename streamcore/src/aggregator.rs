//! Windowed aggregation engine — tumbling and sliding windows with
//! statistical metrics, one per derived key.
//!
//! Mirrors the per-key-map-behind-a-lock shape used for `active_tasks`
//! in `streaming::worker_pool::StreamingWorkerPool`: an outer lock
//! guards the map shape (insert-on-first-sight), an inner lock guards
//! the hot per-key state.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::schemas::AggregateResult;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn compute(key: &str, window_start: f64, window_end: f64, values: &[f64]) -> Option<AggregateResult> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let count = sorted.len();
    let total: f64 = sorted.iter().sum();
    let avg = total / count as f64;
    let p99_idx = ((count as f64 * 0.99) as isize - 1).max(0) as usize;
    Some(AggregateResult {
        key: key.to_string(),
        window_start,
        window_end,
        count,
        total,
        avg,
        min: sorted[0],
        max: sorted[count - 1],
        p99: sorted[p99_idx],
    })
}

/// Accumulates values for a fixed, non-overlapping time interval.
struct TumblingWindow {
    values: Vec<f64>,
    start_time: f64,
}

impl TumblingWindow {
    fn new() -> Self {
        Self {
            values: Vec::new(),
            start_time: now_secs(),
        }
    }

    fn add(&mut self, value: f64) {
        self.values.push(value);
    }

    fn compute(&self, key: &str) -> Option<AggregateResult> {
        compute(key, self.start_time, now_secs(), &self.values)
    }

    fn reset(&mut self) {
        self.values.clear();
        self.start_time = now_secs();
    }
}

/// Time-bounded buffer of `(timestamp, value)` pairs with eviction of
/// entries strictly older than `now - window_sec`.
struct SlidingWindow {
    entries: std::collections::VecDeque<(f64, f64)>,
    window_sec: f64,
}

impl SlidingWindow {
    fn new(window_sec: f64) -> Self {
        Self {
            entries: std::collections::VecDeque::new(),
            window_sec,
        }
    }

    fn add(&mut self, value: f64, timestamp: f64) {
        self.entries.push_back((timestamp, value));
        self.evict(timestamp);
    }

    fn evict(&mut self, now: f64) {
        let cutoff = now - self.window_sec;
        while let Some(&(ts, _)) = self.entries.front() {
            if ts < cutoff {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn compute(&mut self, key: &str) -> Option<AggregateResult> {
        let now = now_secs();
        self.evict(now);
        if self.entries.is_empty() {
            return None;
        }
        let window_start = self.entries.front().unwrap().0;
        let values: Vec<f64> = self.entries.iter().map(|(_, v)| *v).collect();
        compute(key, window_start, now, &values)
    }
}

/// Maintains both tumbling and sliding window aggregations per key.
pub struct WindowedAggregator {
    sliding_sec: f64,
    tumbling: Mutex<HashMap<String, Mutex<TumblingWindow>>>,
    sliding: Mutex<HashMap<String, Mutex<SlidingWindow>>>,
}

impl WindowedAggregator {
    pub fn new(sliding_sec: u64) -> Self {
        Self {
            sliding_sec: sliding_sec as f64,
            tumbling: Mutex::new(HashMap::new()),
            sliding: Mutex::new(HashMap::new()),
        }
    }

    /// Add a data point to both window types, creating them lazily.
    pub fn add(&self, key: &str, value: f64, timestamp: f64) {
        {
            let mut map = self.tumbling.lock().unwrap();
            map.entry(key.to_string())
                .or_insert_with(|| Mutex::new(TumblingWindow::new()))
                .lock()
                .unwrap()
                .add(value);
        }
        {
            let sliding_sec = self.sliding_sec;
            let mut map = self.sliding.lock().unwrap();
            map.entry(key.to_string())
                .or_insert_with(|| Mutex::new(SlidingWindow::new(sliding_sec)))
                .lock()
                .unwrap()
                .add(value, timestamp);
        }
    }

    /// Flush all tumbling windows, returning a result for every window
    /// that holds at least one sample, then reset every window
    /// (including the empty ones, whose start is refreshed).
    pub fn flush_tumbling(&self) -> Vec<AggregateResult> {
        let map = self.tumbling.lock().unwrap();
        let mut results = Vec::new();
        for (key, window) in map.iter() {
            let mut window = window.lock().unwrap();
            if let Some(result) = window.compute(key) {
                results.push(result);
            }
            window.reset();
        }
        results
    }

    /// Query the current sliding window for a specific key.
    pub fn query_sliding(&self, key: &str) -> Option<AggregateResult> {
        let map = self.sliding.lock().unwrap();
        let window = map.get(key)?;
        window.lock().unwrap().compute(key)
    }

    /// Query all sliding windows.
    pub fn get_all_sliding(&self) -> Vec<AggregateResult> {
        let map = self.sliding.lock().unwrap();
        let mut results = Vec::new();
        for (key, window) in map.iter() {
            if let Some(result) = window.lock().unwrap().compute(key) {
                results.push(result);
            }
        }
        results
    }

    pub fn active_keys(&self) -> Vec<String> {
        self.tumbling.lock().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tumbling_correctness() {
        let agg = WindowedAggregator::new(60);
        for v in [10.0, 20.0, 30.0, 40.0, 50.0] {
            agg.add("k1", v, now_secs());
        }
        let results = agg.flush_tumbling();
        assert_eq!(results.len(), 1);
        let r = &results[0];
        assert_eq!(r.count, 5);
        assert_eq!(r.total, 150.0);
        assert_eq!(r.avg, 30.0);
        assert_eq!(r.min, 10.0);
        assert_eq!(r.max, 50.0);
    }

    #[test]
    fn tumbling_resets_after_flush() {
        let agg = WindowedAggregator::new(60);
        agg.add("k1", 1.0, now_secs());
        assert_eq!(agg.flush_tumbling().len(), 1);
        // Immediately after flush, the just-flushed window is empty.
        assert!(agg.flush_tumbling().is_empty());
    }

    #[test]
    fn p99_indexing() {
        let agg = WindowedAggregator::new(60);
        for i in 1..=100 {
            agg.add("k1", i as f64, now_secs());
        }
        let results = agg.flush_tumbling();
        assert_eq!(results[0].p99, 99.0);
    }

    #[test]
    fn sliding_eviction() {
        let agg = WindowedAggregator::new(10);
        let now = now_secs();
        agg.add("k1", 1.0, now - 15.0);
        agg.add("k1", 2.0, now);
        let r = agg.query_sliding("k1").unwrap();
        assert_eq!(r.count, 1);
        assert_eq!(r.avg, 2.0);
    }

    #[test]
    fn invariants_hold_for_any_nonempty_window() {
        let agg = WindowedAggregator::new(60);
        for v in [5.0, 1.0, 9.0, 3.0] {
            agg.add("k", v, now_secs());
        }
        let r = agg.query_sliding("k").unwrap();
        assert!(r.min <= r.avg && r.avg <= r.max);
        assert_eq!(r.total, 18.0);
        assert_eq!(r.count, 4);
    }

    #[test]
    fn unknown_key_queries_return_none() {
        let agg = WindowedAggregator::new(60);
        assert!(agg.query_sliding("missing").is_none());
    }
}
