//! Rolling z-score anomaly detection.
//!
//! Per-key ring buffers behind an outer lock, the same shape as
//! `aggregator::WindowedAggregator`'s maps.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::schemas::{AnomalyEvent, Severity};

const MIN_WINDOW_SIZE: usize = 10;

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

struct RollingBuffer {
    values: VecDeque<f64>,
    capacity: usize,
}

impl RollingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }
}

fn sample_mean(values: &VecDeque<f64>) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_stdev(values: &VecDeque<f64>, mean: f64) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
    var.sqrt()
}

/// Rolling z-score anomaly detector. Maintains a fixed-capacity window
/// of recent values per key.
pub struct ZScoreDetector {
    window_size: usize,
    threshold: f64,
    windows: Mutex<HashMap<String, RollingBuffer>>,
}

impl ZScoreDetector {
    pub fn new(window_size: usize, z_threshold: f64) -> Self {
        Self {
            window_size,
            threshold: z_threshold,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Append `value` to key's rolling window and, if anomalous,
    /// return an `AnomalyEvent`.
    pub fn check(&self, key: &str, value: f64, timestamp: f64) -> Option<AnomalyEvent> {
        let mut map = self.windows.lock().unwrap();
        let buffer = map
            .entry(key.to_string())
            .or_insert_with(|| RollingBuffer::new(self.window_size));
        buffer.push(value);

        if buffer.values.len() < MIN_WINDOW_SIZE {
            return None;
        }

        let mean = sample_mean(&buffer.values);
        let std = sample_stdev(&buffer.values, mean);
        if std < 1e-10 {
            return None;
        }

        let z_score = (value - mean) / std;
        if z_score.abs() > self.threshold {
            Some(AnomalyEvent {
                key: key.to_string(),
                value,
                z_score: round3(z_score),
                mean: round3(mean),
                std: round3(std),
                threshold: self.threshold,
                severity: if z_score.abs() > 4.0 {
                    Severity::Critical
                } else {
                    Severity::Warning
                },
                timestamp,
            })
        } else {
            None
        }
    }

    pub fn tracked_keys(&self) -> Vec<String> {
        self.windows.lock().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_event_below_min_window() {
        let d = ZScoreDetector::new(100, 3.0);
        for i in 0..9 {
            assert!(d.check("k", i as f64, i as f64).is_none());
        }
    }

    #[test]
    fn spike_detection_and_severity_escalation() {
        let d = ZScoreDetector::new(100, 3.0);
        for _ in 0..40 {
            assert!(d.check("k", 20.0, 0.0).is_none());
        }
        let event = d.check("k", 100.0, 0.0).expect("expected anomaly");
        assert!(event.z_score.abs() > 3.0);

        let d2 = ZScoreDetector::new(100, 3.0);
        for _ in 0..40 {
            d2.check("k2", 20.0, 0.0);
        }
        let critical = d2.check("k2", 200.0, 0.0).expect("expected anomaly");
        assert_eq!(critical.severity, Severity::Critical);
    }

    #[test]
    fn zero_variance_window_never_fires() {
        let d = ZScoreDetector::new(100, 3.0);
        for _ in 0..20 {
            assert!(d.check("flat", 5.0, 0.0).is_none());
        }
    }

    #[test]
    fn per_key_isolation() {
        let d = ZScoreDetector::new(100, 3.0);
        for _ in 0..40 {
            d.check("a", 20.0, 0.0);
        }
        // "b" starts fresh even though "a" has a full window.
        assert!(d.check("b", 999.0, 0.0).is_none());
    }
}
