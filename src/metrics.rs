//! The metric value model: the typed record a collector emits and the batch
//! container the engine assembles per (monitor, level, tick).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metric type reported by a collector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    #[default]
    Unknown,
    Counter,
    Gauge,
    Bool,
    Event,
}

impl MetricType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Bool => "bool",
            Self::Event => "event",
        }
    }
}

/// One metric value as reported by a collector.
///
/// The name is the domain-specific metric name, like `threads_running` from
/// the `status.global` collector: lowercase but otherwise not modified
/// (hyphens and underscores are preserved). String values are not supported;
/// boolean values are reported as 0 and 1. Values are immutable once
/// produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub name: String,
    pub value: f64,
    pub metric_type: MetricType,
    /// Name-value pairs that determine the group this value belongs to.
    /// Only certain domains group metrics (for example `io.table` groups by
    /// schema and table).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub group: HashMap<String, String>,
    /// Optional annotations describing the value.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub meta: HashMap<String, String>,
}

impl MetricValue {
    #[must_use]
    pub fn new(name: impl Into<String>, value: f64, metric_type: MetricType) -> Self {
        Self {
            name: name.into(),
            value,
            metric_type,
            group: HashMap::new(),
            meta: HashMap::new(),
        }
    }

    #[must_use]
    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, value, MetricType::Gauge)
    }

    #[must_use]
    pub fn counter(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, value, MetricType::Counter)
    }

    #[must_use]
    pub fn with_group(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.group.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}

/// Metrics collected for one plan level, from one database instance.
///
/// `values` is keyed on domain: every domain configured in the batch's level
/// has a key, possibly with an empty sequence when its collector failed.
/// Sinks must not mutate batches they receive.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Metrics {
    /// When collection started.
    pub begin: DateTime<Utc>,
    /// When collection completed.
    pub end: DateTime<Utc>,
    pub monitor_id: String,
    /// Plan name.
    pub plan: String,
    /// Level name.
    pub level: String,
    /// Monitor state when the batch was produced.
    pub state: String,
    pub values: HashMap<String, Vec<MetricValue>>,
}

impl Metrics {
    /// Total number of values across all domains.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.values().all(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_value_builders() {
        let v = MetricValue::gauge("max_connections", 151.0);
        assert_eq!(v.name, "max_connections");
        assert_eq!(v.metric_type, MetricType::Gauge);
        assert!(v.group.is_empty());

        let v = MetricValue::counter("count_fetch", 2.0)
            .with_group("schema", "test")
            .with_group("table", "t1");
        assert_eq!(v.group.len(), 2);
        assert_eq!(v.group.get("schema").map(String::as_str), Some("test"));
    }

    #[test]
    fn test_metric_type_as_str() {
        assert_eq!(MetricType::Counter.as_str(), "counter");
        assert_eq!(MetricType::Gauge.as_str(), "gauge");
        assert_eq!(MetricType::Unknown.as_str(), "unknown");
    }

    #[test]
    fn test_batch_len() {
        let mut values = HashMap::new();
        values.insert(
            "var.global".to_string(),
            vec![MetricValue::gauge("a", 1.0), MetricValue::gauge("b", 2.0)],
        );
        values.insert("innodb".to_string(), vec![]);

        let now = Utc::now();
        let m = Metrics {
            begin: now,
            end: now,
            monitor_id: "db1".to_string(),
            plan: "default".to_string(),
            level: "performance".to_string(),
            state: String::new(),
            values,
        };
        assert_eq!(m.len(), 2);
        assert!(!m.is_empty());
    }
}
