//! The plan model: a declarative hierarchy of levels that defines which
//! metric domains are collected, which metric names within each domain, at
//! which cadence, and with which per-domain options.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// One domain inside a level: the ordered metric names to collect plus
/// collector-specific options.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Domain {
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl Domain {
    #[must_use]
    pub fn new(metrics: &[&str]) -> Self {
        Self {
            metrics: metrics.iter().map(ToString::to_string).collect(),
            options: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// One level of a plan: a collection frequency and the domains collected at
/// that frequency.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Level {
    pub freq: Duration,
    #[serde(default)]
    pub collect: HashMap<String, Domain>,
}

/// A plan is the declarative collection schedule for one monitor. Plans are
/// immutable once handed to the engine; a new plan is installed by atomic
/// swap.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    pub levels: HashMap<String, Level>,
}

impl Plan {
    /// Validate the plan invariants: a non-empty name, at least one level,
    /// and a positive frequency per level. Frequencies need not be multiples
    /// of each other. Metric names are validated later, by each collector's
    /// prepare.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("plan has no name");
        }
        if self.levels.is_empty() {
            bail!("plan {} has no levels", self.name);
        }
        for (level_name, level) in &self.levels {
            if level_name.is_empty() {
                bail!("plan {} has a level with an empty name", self.name);
            }
            if level.freq.is_zero() {
                bail!("plan {} level {level_name}: freq must be > 0", self.name);
            }
            for domain in level.collect.keys() {
                if domain.is_empty() {
                    bail!(
                        "plan {} level {level_name} has a domain with an empty name",
                        self.name
                    );
                }
            }
        }
        Ok(())
    }

    /// All domains referenced anywhere in the plan, sorted and deduplicated.
    #[must_use]
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self
            .levels
            .values()
            .flat_map(|l| l.collect.keys().cloned())
            .collect();
        domains.sort();
        domains.dedup();
        domains
    }

    #[must_use]
    pub fn level(&self, name: &str) -> Option<&Level> {
        self.levels.get(name)
    }
}

/// The built-in plan used when no plan file is given: key sysvars and status
/// counters at a short cadence, dataset size at a long one.
#[must_use]
pub fn default_plan() -> Plan {
    let mut levels = HashMap::new();

    let mut performance = HashMap::new();
    performance.insert(
        "status.global".to_string(),
        Domain::new(&[
            "queries",
            "threads_running",
            "threads_connected",
            "slow_queries",
            "bytes_received",
            "bytes_sent",
        ]),
    );
    levels.insert(
        "performance".to_string(),
        Level {
            freq: Duration::from_secs(5),
            collect: performance,
        },
    );

    let mut sysvars = HashMap::new();
    sysvars.insert(
        "var.global".to_string(),
        Domain::new(&["max_connections", "innodb_buffer_pool_size"]),
    );
    levels.insert(
        "sysvars".to_string(),
        Level {
            freq: Duration::from_secs(30),
            collect: sysvars,
        },
    );

    let mut data_size = HashMap::new();
    data_size.insert("size.data".to_string(), Domain::new(&["bytes"]));
    data_size.insert("size.binlogs".to_string(), Domain::new(&["bytes"]));
    levels.insert(
        "data-size".to_string(),
        Level {
            freq: Duration::from_secs(300),
            collect: data_size,
        },
    );

    Plan {
        name: "default".to_string(),
        levels,
    }
}
