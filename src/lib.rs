//! Multi-tenant MySQL metrics monitor.
//!
//! Each configured database instance gets an independent pipeline: a
//! declarative [`plan::Plan`] describes which metric domains to collect at
//! which cadence, the [`monitor::engine::Engine`] drives the per-domain
//! [`collectors::Collector`]s, the level plan collector
//! ([`monitor::lpc::LevelCollector`]) owns the timing loop, and the level
//! plan adjuster ([`monitor::lpa::LevelAdjuster`]) swaps plans when the
//! observed MySQL role changes. Produced batches fan out to [`sink::Sink`]s.

pub mod cli;
pub mod collectors;
pub mod config;
pub mod event;
pub mod metrics;
pub mod monitor;
pub mod plan;
pub mod sink;

pub use metrics::{MetricType, MetricValue, Metrics};
pub use monitor::MonitorState;
pub use plan::Plan;
