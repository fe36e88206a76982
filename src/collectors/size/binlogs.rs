//! The `size.binlogs` collector: total size of all binary logs.

use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use sqlx::{MySqlPool, Row};
use std::collections::HashSet;
use tracing::{debug, info_span};
use tracing_futures::Instrument as _;

use super::super::{CollectError, CollectResult, Collector, FactoryArgs, Help};
use crate::metrics::MetricValue;
use crate::plan::Plan;

pub const DOMAIN: &str = "size.binlogs";

pub const METRIC_BYTES: &str = "bytes";

const QUERY: &str = "SHOW BINARY LOGS";

// Server error when binary logging is disabled.
const ER_NO_BINARY_LOGGING: &str = "1381";

/// Collects the summed size of all binary logs for the `size.binlogs`
/// domain. When binary logging is disabled the level collects an empty
/// sequence instead of erroring.
pub struct Binlogs {
    pool: MySqlPool,
    levels: HashSet<String>,
}

impl Binlogs {
    #[must_use]
    pub fn new(args: &FactoryArgs) -> Self {
        Self {
            pool: args.pool.clone(),
            levels: HashSet::new(),
        }
    }

    fn binlog_disabled(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db) => db.code().as_deref() == Some(ER_NO_BINARY_LOGGING),
            _ => false,
        }
    }

    async fn query_values(pool: &MySqlPool) -> CollectResult {
        let span = info_span!(
            "db.query",
            db.system = "mysql",
            db.operation = "SHOW",
            db.statement = QUERY,
            otel.kind = "client"
        );
        let rows = match sqlx::query(QUERY).fetch_all(pool).instrument(span).await {
            Ok(rows) => rows,
            Err(e) if Self::binlog_disabled(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut total: u64 = 0;
        for row in &rows {
            // File_size is unsigned on modern servers; older ones report it
            // as text.
            let size: Option<u64> = row
                .try_get::<u64, _>("File_size")
                .ok()
                .or_else(|| row.try_get::<String, _>("File_size").ok()?.parse().ok());
            match size {
                Some(s) => total = total.saturating_add(s),
                None => debug!("could not read File_size, skipping row"),
            }
        }
        #[allow(clippy::cast_precision_loss)]
        Ok(vec![MetricValue::gauge(METRIC_BYTES, total as f64)])
    }
}

impl Collector for Binlogs {
    fn domain(&self) -> &'static str {
        DOMAIN
    }

    fn help(&self) -> Help {
        Help {
            domain: DOMAIN,
            description: "Collect the total size of all binary logs",
            options: &[],
        }
    }

    fn prepare<'a>(&'a mut self, plan: &'a Plan) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut staged = HashSet::new();
            for (level_name, level) in &plan.levels {
                if !level.collect.contains_key(DOMAIN) {
                    continue;
                }
                Self::query_values(&self.pool)
                    .await
                    .map_err(|e| e.error.context(format!(
                        "{DOMAIN}: plan {} level {level_name}",
                        plan.name
                    )))?;
                staged.insert(level_name.clone());
            }
            self.levels = staged;
            Ok(())
        })
    }

    fn collect<'a>(&'a self, level_name: &'a str) -> BoxFuture<'a, CollectResult> {
        Box::pin(async move {
            if !self.levels.contains(level_name) {
                return Err(CollectError::new(anyhow!(
                    "{DOMAIN}: not prepared for level {level_name}"
                )));
            }
            Self::query_values(&self.pool).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binlog_disabled_classification() {
        // Non-database errors never classify as disabled binlog.
        assert!(!Binlogs::binlog_disabled(&sqlx::Error::PoolClosed));
    }
}
