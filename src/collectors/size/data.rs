//! The `size.data` collector: approximate dataset size per schema from
//! `information_schema.tables`.

use anyhow::{Context, Result, anyhow, bail};
use futures::future::BoxFuture;
use sqlx::MySqlPool;
use std::collections::HashMap;
use tracing::info_span;
use tracing_futures::Instrument as _;

use super::super::{CollectError, CollectResult, Collector, FactoryArgs, Help, HelpOption, util};
use crate::metrics::MetricValue;
use crate::plan::Plan;

pub const DOMAIN: &str = "size.data";

pub const OPT_EXCLUDE: &str = "exclude";
pub const OPT_TOTAL: &str = "total";

pub const DEFAULT_EXCLUDE: &str = "mysql,information_schema,performance_schema,sys";

/// The metric this domain emits, grouped by `{db}`.
pub const METRIC_BYTES: &str = "bytes";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TotalMode {
    No,
    Yes,
    Only,
}

#[derive(Clone, Debug)]
struct LevelState {
    query: String,
    total: TotalMode,
}

/// Collects per-schema dataset size for the `size.data` domain. The level's
/// metric list is fixed (`bytes`); options control schema filtering and the
/// total row.
pub struct Data {
    pool: MySqlPool,
    levels: HashMap<String, LevelState>,
}

impl Data {
    #[must_use]
    pub fn new(args: &FactoryArgs) -> Self {
        Self {
            pool: args.pool.clone(),
            levels: HashMap::new(),
        }
    }

    fn build_query(exclude: &str) -> Result<String> {
        let mut query = String::from(
            "SELECT table_schema, \
             CAST(SUM(COALESCE(data_length, 0) + COALESCE(index_length, 0)) AS UNSIGNED) AS bytes \
             FROM information_schema.tables",
        );
        let schemas: Vec<&str> = exclude
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if !schemas.is_empty() {
            for schema in &schemas {
                if !util::is_valid_metric_name(schema) {
                    bail!("{schema} isn't a valid schema name");
                }
            }
            query.push_str(&format!(
                " WHERE table_schema NOT IN ('{}')",
                schemas.join("', '")
            ));
        }
        query.push_str(" GROUP BY table_schema");
        Ok(query)
    }

    fn parse_total_mode(options: &HashMap<String, String>) -> TotalMode {
        match options.get(OPT_TOTAL).map(String::as_str) {
            Some("only") => TotalMode::Only,
            Some(v) if crate::config::bool_from_str(v) => TotalMode::Yes,
            _ => TotalMode::No,
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
        let rows: Vec<(String, u64)> = sqlx::query_as(&state.query)
            .fetch_all(pool)
            .instrument(span)
            .await?;

        let mut values = Vec::with_capacity(rows.len() + 1);
        let mut total: u64 = 0;
        for (schema, bytes) in rows {
            total = total.saturating_add(bytes);
            if state.total != TotalMode::Only {
                #[allow(clippy::cast_precision_loss)]
                values.push(MetricValue::gauge(METRIC_BYTES, bytes as f64).with_group("db", schema));
            }
        }
        if state.total != TotalMode::No {
            // The total row carries an empty db group value.
            #[allow(clippy::cast_precision_loss)]
            values.push(MetricValue::gauge(METRIC_BYTES, total as f64).with_group("db", ""));
        }
        Ok(values)
    }
}

impl Collector for Data {
    fn domain(&self) -> &'static str {
        DOMAIN
    }

    fn help(&self) -> Help {
        Help {
            domain: DOMAIN,
            description: "Collect dataset size (data + index bytes) per schema",
            options: &[
                HelpOption {
                    name: OPT_EXCLUDE,
                    doc: "Comma-separated schema names to exclude",
                    values: "default: mysql,information_schema,performance_schema,sys",
                },
                HelpOption {
                    name: OPT_TOTAL,
                    doc: "Report a total across all schemas",
                    values: "no (default), yes (total plus per-schema), only (just the total)",
                },
            ],
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
                let exclude = dom
                    .options
                    .get(OPT_EXCLUDE)
                    .map_or(DEFAULT_EXCLUDE, String::as_str);
                let state = LevelState {
                    query: Self::build_query(exclude).with_context(|| {
                        format!("{DOMAIN}: plan {} level {level_name}", plan.name)
                    })?,
                    total: Self::parse_total_mode(&dom.options),
                };
                Self::query_values(&self.pool, &state)
                    .await
                    .map_err(|e| e.error)
                    .with_context(|| format!("{DOMAIN}: plan {} level {level_name}", plan.name))?;
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
            Self::query_values(&self.pool, state).await
        })
    }
}
