use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Data category a subscription or frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Vibration,
    Power,
    Server,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Vibration => "vibration",
            Category::Power => "power",
            Category::Server => "server",
        };
        f.write_str(name)
    }
}

/// A latest-telemetry subscription issued on the current connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub cmd_id: u64,
    pub device_id: Uuid,
    pub category: Category,
    pub unit_id: Option<u32>,
}

/// One sample of a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPoint {
    pub ts: i64,
    pub value: String,
}

impl TelemetryPoint {
    pub fn as_f64(&self) -> Option<f64> {
        self.value.trim().parse().ok()
    }
}

/// Metric name to its samples, newest first as delivered by the platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TelemetryFrame {
    metrics: BTreeMap<String, Vec<TelemetryPoint>>,
}

impl TelemetryFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, points: Vec<TelemetryPoint>) {
        self.metrics.insert(key.into(), points);
    }

    pub fn get(&self, key: &str) -> Option<&[TelemetryPoint]> {
        self.metrics.get(key).map(Vec::as_slice)
    }

    /// First sample of `key`, which is the latest value in a latest-telemetry update.
    pub fn latest(&self, key: &str) -> Option<&TelemetryPoint> {
        self.metrics.get(key).and_then(|points| points.first())
    }

    pub fn latest_f64(&self, key: &str) -> Option<f64> {
        self.latest(key).and_then(TelemetryPoint::as_f64)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}
