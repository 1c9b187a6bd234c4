//! Online OLS linear regression over a sliding window, per key.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::schemas::{Direction, TrendResult};

const MIN_POINTS: usize = 20;

fn round_to(v: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (v * factor).round() / factor
}

struct TrendBuffer {
    points: VecDeque<(f64, f64)>,
    capacity: usize,
}

impl TrendBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, timestamp: f64, value: f64) {
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back((timestamp, value));
    }
}

/// Maintains a bounded ring buffer of `(timestamp, value)` per key and
/// classifies the OLS trend on demand.
pub struct TrendAnalyzer {
    window_size: usize,
    windows: Mutex<HashMap<String, TrendBuffer>>,
}

impl TrendAnalyzer {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, key: &str, value: f64, timestamp: f64) {
        let window_size = self.window_size;
        let mut map = self.windows.lock().unwrap();
        map.entry(key.to_string())
            .or_insert_with(|| TrendBuffer::new(window_size))
            .push(timestamp, value);
    }

    pub fn get_trend(&self, key: &str) -> Option<TrendResult> {
        let map = self.windows.lock().unwrap();
        let buffer = map.get(key)?;
        Self::fit(key, &buffer.points)
    }

    pub fn get_all_trends(&self) -> Vec<TrendResult> {
        let map = self.windows.lock().unwrap();
        map.iter()
            .filter_map(|(key, buffer)| Self::fit(key, &buffer.points))
            .collect()
    }

    fn fit(key: &str, points: &VecDeque<(f64, f64)>) -> Option<TrendResult> {
        let n = points.len();
        if n < MIN_POINTS {
            return None;
        }

        let x0 = points[0].0;
        let xs: Vec<f64> = points.iter().map(|(t, _)| t - x0).collect();
        let ys: Vec<f64> = points.iter().map(|(_, v)| *v).collect();

        let sum_x: f64 = xs.iter().sum();
        let sum_y: f64 = ys.iter().sum();
        let sum_xy: f64 = xs.iter().zip(&ys).map(|(x, y)| x * y).sum();
        let sum_x2: f64 = xs.iter().map(|x| x * x).sum();
        let sum_y2: f64 = ys.iter().map(|y| y * y).sum();

        let denom = n as f64 * sum_x2 - sum_x * sum_x;
        if denom.abs() < 1e-10 {
            return Some(TrendResult {
                key: key.to_string(),
                slope: 0.0,
                r_squared: 0.0,
                direction: Direction::Stable,
                confidence: 0.0,
                data_points: n,
            });
        }

        let slope = (n as f64 * sum_xy - sum_x * sum_y) / denom;

        let ss_tot = sum_y2 - (sum_y * sum_y) / n as f64;
        let r_squared = if ss_tot.abs() < 1e-10 {
            0.0
        } else {
            let intercept = (sum_y - slope * sum_x) / n as f64;
            let ss_res: f64 = xs
                .iter()
                .zip(&ys)
                .map(|(x, y)| (y - (slope * x + intercept)).powi(2))
                .sum();
            (1.0 - ss_res / ss_tot).max(0.0)
        };

        let direction = if r_squared < 0.1 {
            Direction::Stable
        } else if slope > 0.001 {
            Direction::Rising
        } else if slope < -0.001 {
            Direction::Falling
        } else {
            Direction::Stable
        };

        let r_squared_rounded = round_to(r_squared, 4);
        Some(TrendResult {
            key: key.to_string(),
            slope: round_to(slope, 6),
            r_squared: r_squared_rounded,
            direction,
            confidence: r_squared_rounded,
            data_points: n,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_none_below_min_points() {
        let t = TrendAnalyzer::new(60);
        for i in 0..19 {
            t.add("k", i as f64, 1000.0 + i as f64);
        }
        assert!(t.get_trend("k").is_none());
    }

    #[test]
    fn rising_trend_detected() {
        let t = TrendAnalyzer::new(60);
        for i in 0..30 {
            t.add("k", (2 * i) as f64, 1000.0 + i as f64);
        }
        let r = t.get_trend("k").unwrap();
        assert_eq!(r.direction, Direction::Rising);
        assert!(r.slope > 0.0);
        assert!(r.r_squared > 0.9);
        assert_eq!(r.data_points, 30);
    }

    #[test]
    fn falling_trend_detected() {
        let t = TrendAnalyzer::new(60);
        for i in 0..30 {
            t.add("k", (100 - 2 * i) as f64, 1000.0 + i as f64);
        }
        let r = t.get_trend("k").unwrap();
        assert_eq!(r.direction, Direction::Falling);
    }

    #[test]
    fn flat_series_is_stable() {
        let t = TrendAnalyzer::new(60);
        for i in 0..30 {
            t.add("k", 5.0, 1000.0 + i as f64);
        }
        let r = t.get_trend("k").unwrap();
        assert_eq!(r.direction, Direction::Stable);
        assert_eq!(r.r_squared, 0.0);
    }

    #[test]
    fn r_squared_bounded_in_unit_interval() {
        let t = TrendAnalyzer::new(60);
        for i in 0..40 {
            let noise = if i % 2 == 0 { 1.0 } else { -1.0 };
            t.add("k", i as f64 + noise, 1000.0 + i as f64);
        }
        let r = t.get_trend("k").unwrap();
        assert!((0.0..=1.0).contains(&r.r_squared));
    }
}
