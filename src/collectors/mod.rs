//! Metric collectors.
//!
//! A collector produces values for one domain of MySQL metrics
//! (`status.global`, `io.table`, ...). Collectors follow a prepare-once,
//! collect-many lifecycle: [`Collector::prepare`] scans a plan and builds
//! per-level state (queries, chosen source), then [`Collector::collect`] is
//! invoked per tick for a single level name.

use anyhow::Result;
use futures::future::BoxFuture;
use sqlx::MySqlPool;
use std::fmt;

use crate::metrics::MetricValue;
use crate::plan::Plan;

pub mod registry;
pub mod util;

pub mod innodb;
pub mod iotable;
pub mod size;
pub mod status;
pub mod sysvar;

/// Self-description of a collector: its domain, a human description, and the
/// options it accepts.
#[derive(Clone, Debug)]
pub struct Help {
    pub domain: &'static str,
    pub description: &'static str,
    pub options: &'static [HelpOption],
}

#[derive(Clone, Copy, Debug)]
pub struct HelpOption {
    pub name: &'static str,
    pub doc: &'static str,
    pub values: &'static str,
}

/// A collect failure that may carry partial results. Partial values are kept
/// in the batch; the error is reported through the event hook.
#[derive(Debug)]
pub struct CollectError {
    pub partial: Vec<MetricValue>,
    pub error: anyhow::Error,
}

impl CollectError {
    #[must_use]
    pub fn new(error: anyhow::Error) -> Self {
        Self {
            partial: Vec::new(),
            error,
        }
    }

    #[must_use]
    pub fn with_partial(partial: Vec<MetricValue>, error: anyhow::Error) -> Self {
        Self { partial, error }
    }
}

impl fmt::Display for CollectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.error)
    }
}

impl From<anyhow::Error> for CollectError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(error)
    }
}

impl From<sqlx::Error> for CollectError {
    fn from(error: sqlx::Error) -> Self {
        Self::new(error.into())
    }
}

pub type CollectResult = std::result::Result<Vec<MetricValue>, CollectError>;

/// Per-monitor, per-domain stateful collector.
///
/// `collect` is only called for level names the collector has been
/// successfully prepared for, and is never concurrent with `prepare` on the
/// same collector (plan swaps pause the timing loop first). Concurrent
/// `collect` calls for different level names are possible.
pub trait Collector: Send + Sync {
    /// Stable domain identifier, e.g. `var.global`.
    fn domain(&self) -> &'static str;

    fn help(&self) -> Help;

    /// Scan every level of `plan` that collects this domain, validate its
    /// metric names and options, and build cached per-level state. Prepare
    /// is all-or-nothing per plan: when any level fails, no state from the
    /// attempted plan remains observable by future collects.
    ///
    /// # Errors
    ///
    /// Returns the first per-level validation or probe error.
    fn prepare<'a>(&'a mut self, plan: &'a Plan) -> BoxFuture<'a, Result<()>>;

    /// Produce the values for exactly one level. Partial results alongside
    /// an error are permitted and kept.
    fn collect<'a>(&'a self, level_name: &'a str) -> BoxFuture<'a, CollectResult>;
}

/// Arguments handed to a factory when a collector is constructed.
#[derive(Clone)]
pub struct FactoryArgs {
    pub monitor_id: String,
    pub pool: MySqlPool,
}

/// Makes collectors by domain name. Factories must be reentrant: one factory
/// can serve many monitors concurrently.
pub trait CollectorFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the factory cannot build a collector for
    /// `domain`.
    fn make(&self, domain: &str, args: &FactoryArgs) -> Result<Box<dyn Collector>>;
}
