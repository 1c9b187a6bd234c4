//! Canonical event schemas — the single source of truth for data
//! shapes flowing through the pipeline, mirroring the tagged-enum /
//! struct shape `protocol::messages` uses for its wire types.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Temperature,
    Humidity,
    Pressure,
}

impl SensorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorType::Temperature => "temperature",
            SensorType::Humidity => "humidity",
            SensorType::Pressure => "pressure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PageView,
    Click,
    Purchase,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PageView => "page_view",
            EventType::Click => "click",
            EventType::Purchase => "purchase",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorReading {
    pub device_id: String,
    pub sensor_type: SensorType,
    pub value: f64,
    pub unit: String,
    /// Unix epoch in milliseconds.
    pub timestamp: f64,
    #[serde(default = "default_location")]
    pub location: String,
}

fn default_location() -> String {
    "datacenter-1".to_string()
}

impl SensorReading {
    pub fn partition_key(&self) -> &str {
        &self.device_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub session_id: String,
    pub user_id: String,
    pub event_type: EventType,
    pub page: String,
    /// Purchase amount; required iff `event_type == Purchase`.
    #[serde(default)]
    pub value: Option<f64>,
    /// Unix epoch in milliseconds.
    pub timestamp: f64,
}

impl ActivityEvent {
    pub fn partition_key(&self) -> &str {
        &self.user_id
    }
}

/// Result of computing an aggregate over a window's samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub key: String,
    pub window_start: f64,
    pub window_end: f64,
    pub count: usize,
    pub total: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub key: String,
    pub value: f64,
    pub z_score: f64,
    pub mean: f64,
    pub std: f64,
    pub threshold: f64,
    pub severity: Severity,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Rising,
    Falling,
    Stable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendResult {
    pub key: String,
    pub slope: f64,
    pub r_squared: f64,
    pub direction: Direction,
    pub confidence: f64,
    pub data_points: usize,
}

/// Envelope written to the dead-letter topic for a message that could
/// not be decoded or handled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEnvelope {
    pub original_topic: String,
    pub partition: i32,
    pub offset: i64,
    pub error_type: String,
    pub error_message: String,
    pub stack_trace: String,
    /// Unix epoch in milliseconds.
    pub failed_at: f64,
    /// Lowercase hex, despite the field name (matches the wire format
    /// inherited from the original producer).
    pub original_value_b64: Option<String>,
}
