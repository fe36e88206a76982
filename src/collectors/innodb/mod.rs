//! The `innodb` collector: InnoDB counters from
//! `information_schema.INNODB_METRICS`.

use anyhow::{Context, Result, anyhow, bail};
use futures::future::BoxFuture;
use sqlx::{MySqlPool, Row};
use std::collections::HashMap;
use tracing::{debug, info_span};
use tracing_futures::Instrument as _;

use super::{CollectError, CollectResult, Collector, FactoryArgs, Help, HelpOption, util};
use crate::metrics::{MetricType, MetricValue};
use crate::plan::Plan;

pub const DOMAIN: &str = "innodb";

/// `all: enabled` collects every currently enabled InnoDB metric instead of
/// the level's metric list.
pub const OPT_ALL: &str = "all";

#[derive(Clone, Debug)]
struct LevelState {
    query: String,
}

/// Collects InnoDB metrics for the `innodb` domain. Each value carries a
/// `subsystem` meta annotation as reported by the server.
pub struct InnodbMetrics {
    pool: MySqlPool,
    levels: HashMap<String, Option<LevelState>>,
}

impl InnodbMetrics {
    #[must_use]
    pub fn new(args: &FactoryArgs) -> Self {
        Self {
            pool: args.pool.clone(),
            levels: HashMap::new(),
        }
    }

    fn named_query(metrics: &[String]) -> String {
        format!(
            "SELECT NAME, SUBSYSTEM, COUNT, TYPE FROM information_schema.INNODB_METRICS WHERE NAME IN ('{}')",
            util::quoted_in_list(metrics)
        )
    }

    fn enabled_query() -> String {
        "SELECT NAME, SUBSYSTEM, COUNT, TYPE FROM information_schema.INNODB_METRICS WHERE STATUS = 'enabled'".to_string()
    }

    /// Map the server-reported metric type to ours. `value` and the
    /// set-gauge types read as gauges; everything counter-like is a counter.
    fn metric_type(server_type: &str) -> MetricType {
        match server_type {
            "counter" | "status_counter" => MetricType::Counter,
            _ => MetricType::Gauge,
        }
    }

    async fn query_values(pool: &MySqlPool, state: &LevelState) -> CollectResult {
        let span = info_span!(
            "db.query",
            db.system = "mysql",
            db.operation = "SELECT",
            db.statement = %state.query,
            otel.kind = "client"
        );
        let rows = sqlx::query(&state.query)
            .fetch_all(pool)
            .instrument(span)
            .await?;

        let mut values = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = match row.try_get("NAME") {
                Ok(name) => name,
                Err(e) => {
                    debug!(error = %e, "could not scan NAME, skipping row");
                    continue;
                }
            };
            let count: i64 = match row.try_get("COUNT") {
                Ok(count) => count,
                Err(e) => {
                    debug!(metric = %name, error = %e, "could not scan COUNT, skipping row");
                    continue;
                }
            };
            let subsystem: String = row.try_get("SUBSYSTEM").unwrap_or_default();
            let server_type: String = row.try_get("TYPE").unwrap_or_default();
            #[allow(clippy::cast_precision_loss)]
            values.push(
                MetricValue::new(
                    name.to_ascii_lowercase(),
                    count as f64,
                    Self::metric_type(&server_type),
                )
                .with_meta("subsystem", subsystem),
            );
        }
        Ok(values)
    }
}

impl Collector for InnodbMetrics {
    fn domain(&self) -> &'static str {
        DOMAIN
    }

    fn help(&self) -> Help {
        Help {
            domain: DOMAIN,
            description: "Collect InnoDB metrics from information_schema.INNODB_METRICS",
            options: &[HelpOption {
                name: OPT_ALL,
                doc: "Collect all enabled InnoDB metrics instead of the level's metric list",
                values: "enabled",
            }],
        }
    }

    fn prepare<'a>(&'a mut self, plan: &'a Plan) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut staged = HashMap::new();
            for (level_name, level) in &plan.levels {
                let Some(dom) = level.collect.get(DOMAIN) else {
                    continue;
                };
                util::validate_metric_names(&dom.metrics)
                    .with_context(|| format!("{DOMAIN}: plan {} level {level_name}", plan.name))?;

                let all = dom.options.get(OPT_ALL).map(String::as_str);
                let state = match all {
                    Some("enabled") => Some(LevelState {
                        query: Self::enabled_query(),
                    }),
                    Some(other) if !other.is_empty() => {
                        bail!(
                            "{DOMAIN}: plan {} level {level_name}: invalid all: {other}; valid values: enabled",
                            plan.name
                        );
                    }
                    _ if dom.metrics.is_empty() => None,
                    _ => Some(LevelState {
                        query: Self::named_query(&dom.metrics),
                    }),
                };

                if let Some(state) = &state {
                    Self::query_values(&self.pool, state)
                        .await
                        .map_err(|e| e.error)
                        .with_context(|| {
                            format!("{DOMAIN}: plan {} level {level_name}", plan.name)
                        })?;
                }
                staged.insert(level_name.clone(), state);
            }
            self.levels = staged;
            Ok(())
        })
    }

    fn collect<'a>(&'a self, level_name: &'a str) -> BoxFuture<'a, CollectResult> {
        Box::pin(async move {
            let Some(state) = self.levels.get(level_name) else {
                return Err(CollectError::new(anyhow!(
                    "{DOMAIN}: not prepared for level {level_name}"
                )));
            };
            let Some(state) = state else {
                return Ok(Vec::new());
            };
            Self::query_values(&self.pool, state).await
        })
    }
}
