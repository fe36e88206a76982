//! The `io.table` collector: per-table I/O waits from
//! `performance_schema.table_io_waits_summary_by_table`.
//!
//! Each value is grouped by `{schema, table}`. Include/exclude options
//! accept `schema.*`, `schema.table`, and bare `table` forms; include wins
//! over exclude when both are given.

use anyhow::{Context, Result, anyhow, bail};
use futures::future::BoxFuture;
use sqlx::{MySqlPool, Row};
use std::collections::HashMap;
use tracing::{debug, info_span};
use tracing_futures::Instrument as _;

use super::{CollectError, CollectResult, Collector, FactoryArgs, Help, HelpOption, util};
use crate::config::bool_from_str;
use crate::metrics::{MetricType, MetricValue};
use crate::plan::Plan;

pub const DOMAIN: &str = "io.table";

pub const OPT_EXCLUDE: &str = "exclude";
pub const OPT_INCLUDE: &str = "include";
pub const OPT_ALL: &str = "all";

pub const DEFAULT_EXCLUDE: &str = "mysql.*,information_schema.*,performance_schema.*,sys.*";

const TABLE: &str = "performance_schema.table_io_waits_summary_by_table";

/// The full column set used when `all: yes`.
pub const DEFAULT_COLUMNS: &[&str] = &[
    "sum_timer_wait",
    "min_timer_wait",
    "avg_timer_wait",
    "max_timer_wait",
    "count_read",
    "sum_timer_read",
    "min_timer_read",
    "avg_timer_read",
    "max_timer_read",
    "count_write",
    "sum_timer_write",
    "min_timer_write",
    "avg_timer_write",
    "max_timer_write",
    "count_fetch",
    "sum_timer_fetch",
    "min_timer_fetch",
    "avg_timer_fetch",
    "max_timer_fetch",
    "count_insert",
    "sum_timer_insert",
    "min_timer_insert",
    "avg_timer_insert",
    "max_timer_insert",
    "count_update",
    "sum_timer_update",
    "min_timer_update",
    "avg_timer_update",
    "max_timer_update",
    "count_delete",
    "sum_timer_delete",
    "min_timer_delete",
    "avg_timer_delete",
    "max_timer_delete",
];

/// Build the collection query for one level. Deterministic given the same
/// option map and metric list.
///
/// # Errors
///
/// Returns an error on invalid column or filter names.
pub fn table_io_query(options: &HashMap<String, String>, metrics: &[String]) -> Result<String> {
    let all = options.get(OPT_ALL).map(String::as_str).unwrap_or("no");
    let columns: Vec<String> = if bool_from_str(all) || metrics.is_empty() {
        DEFAULT_COLUMNS.iter().map(ToString::to_string).collect()
    } else {
        util::validate_metric_names(metrics)?;
        metrics.to_vec()
    };

    let mut query = format!(
        "SELECT OBJECT_SCHEMA, OBJECT_NAME, {} FROM {TABLE}",
        columns.join(", ")
    );

    if let Some(include) = options.get(OPT_INCLUDE).filter(|s| !s.is_empty()) {
        let clauses = filter_clauses(include)?;
        if !clauses.is_empty() {
            let ored: Vec<String> = clauses.into_iter().map(|c| format!("({c})")).collect();
            query.push_str(" WHERE ");
            query.push_str(&ored.join(" OR "));
        }
        return Ok(query);
    }

    let exclude = options
        .get(OPT_EXCLUDE)
        .map_or(DEFAULT_EXCLUDE, String::as_str);
    let clauses = filter_clauses(exclude)?;
    if !clauses.is_empty() {
        let anded: Vec<String> = clauses.into_iter().map(|c| format!("NOT ({c})")).collect();
        query.push_str(" WHERE ");
        query.push_str(&anded.join(" AND "));
    }
    Ok(query)
}

/// Turn a comma-separated filter list into SQL clauses. `schema.*` matches
/// the whole schema, `schema.table` one table, and a bare name any table
/// with that name.
fn filter_clauses(list: &str) -> Result<Vec<String>> {
    let mut clauses = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let clause = match entry.split_once('.') {
            Some((schema, "*")) => {
                check_object_name(schema)?;
                format!("OBJECT_SCHEMA = '{schema}'")
            }
            Some((schema, table)) => {
                check_object_name(schema)?;
                check_object_name(table)?;
                format!("OBJECT_SCHEMA = '{schema}' AND OBJECT_NAME = '{table}'")
            }
            None => {
                check_object_name(entry)?;
                format!("OBJECT_NAME = '{entry}'")
            }
        };
        clauses.push(clause);
    }
    Ok(clauses)
}

// Filter entries are interpolated into SQL text, so they get the same
// character class as metric names.
fn check_object_name(name: &str) -> Result<()> {
    if name.is_empty() || !util::is_valid_metric_name(name) {
        bail!("{name} isn't a valid schema or table name");
    }
    Ok(())
}

#[derive(Clone, Debug)]
struct LevelState {
    query: String,
    columns: Vec<String>,
}

/// Collects per-table I/O wait metrics for the `io.table` domain.
pub struct TableIo {
    pool: MySqlPool,
    // None means the level has nothing to collect (empty metric list).
    levels: HashMap<String, Option<LevelState>>,
}

impl TableIo {
    #[must_use]
    pub fn new(args: &FactoryArgs) -> Self {
        Self {
            pool: args.pool.clone(),
            levels: HashMap::new(),
        }
    }

    fn column_type(column: &str) -> MetricType {
        if column.starts_with("count_") || column.starts_with("sum_") {
            MetricType::Counter
        } else {
            MetricType::Gauge
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

        let mut values = Vec::with_capacity(rows.len() * state.columns.len());
        for row in &rows {
            let schema: String = match row.try_get(0) {
                Ok(s) => s,
                Err(e) => {
                    debug!(error = %e, "could not scan OBJECT_SCHEMA, skipping row");
                    continue;
                }
            };
            let table: String = match row.try_get(1) {
                Ok(t) => t,
                Err(e) => {
                    debug!(error = %e, "could not scan OBJECT_NAME, skipping row");
                    continue;
                }
            };
            for (idx, column) in state.columns.iter().enumerate() {
                let value: u64 = match row.try_get(idx + 2) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!(metric = %column, error = %e, "could not scan value, skipping");
                        continue;
                    }
                };
                #[allow(clippy::cast_precision_loss)]
                let value = value as f64;
                values.push(
                    MetricValue::new(column.clone(), value, Self::column_type(column))
                        .with_group("schema", schema.clone())
                        .with_group("table", table.clone()),
                );
            }
        }
        Ok(values)
    }
}

impl Collector for TableIo {
    fn domain(&self) -> &'static str {
        DOMAIN
    }

    fn help(&self) -> Help {
        Help {
            domain: DOMAIN,
            description: "Collect per-table I/O wait metrics from performance_schema",
            options: &[
                HelpOption {
                    name: OPT_EXCLUDE,
                    doc: "Comma-separated schema.*, schema.table, or table entries to exclude",
                    values: "default: mysql.*,information_schema.*,performance_schema.*,sys.*",
                },
                HelpOption {
                    name: OPT_INCLUDE,
                    doc: "Comma-separated entries to include; wins over exclude",
                    values: "schema.*, schema.table, or bare table names",
                },
                HelpOption {
                    name: OPT_ALL,
                    doc: "Collect the full default column set instead of the level's metric list",
                    values: "yes, no",
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

                let all = dom.options.get(OPT_ALL).map(String::as_str).unwrap_or("no");
                if dom.metrics.is_empty() && !bool_from_str(all) {
                    staged.insert(level_name.clone(), None);
                    continue;
                }

                let query = table_io_query(&dom.options, &dom.metrics)
                    .with_context(|| format!("{DOMAIN}: plan {} level {level_name}", plan.name))?;
                let columns = if bool_from_str(all) {
                    DEFAULT_COLUMNS.iter().map(ToString::to_string).collect()
                } else {
                    dom.metrics.clone()
                };
                let state = LevelState { query, columns };
                Self::query_values(&self.pool, &state)
                    .await
                    .map_err(|e| e.error)
                    .with_context(|| format!("{DOMAIN}: plan {} level {level_name}", plan.name))?;
                staged.insert(level_name.clone(), Some(state));
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

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_query_default_excludes() {
        let opts = options(&[
            (OPT_EXCLUDE, "mysql.*,information_schema.*,performance_schema.*,sys.*"),
            (OPT_ALL, "no"),
        ]);
        let got = table_io_query(&opts, &metrics(&["count_fetch", "count_insert"])).expect("query");
        let expect = "SELECT OBJECT_SCHEMA, OBJECT_NAME, count_fetch, count_insert FROM performance_schema.table_io_waits_summary_by_table WHERE NOT (OBJECT_SCHEMA = 'mysql') AND NOT (OBJECT_SCHEMA = 'information_schema') AND NOT (OBJECT_SCHEMA = 'performance_schema') AND NOT (OBJECT_SCHEMA = 'sys')";
        assert_eq!(got, expect);
    }

    #[test]
    fn test_query_include_mixed_forms() {
        let opts = options(&[
            (OPT_INCLUDE, "test_table,sys.*,information_schema.XTRADB_ZIP_DICT"),
            (OPT_ALL, "no"),
        ]);
        let got = table_io_query(&opts, &metrics(&["count_fetch", "count_insert"])).expect("query");
        let expect = "SELECT OBJECT_SCHEMA, OBJECT_NAME, count_fetch, count_insert FROM performance_schema.table_io_waits_summary_by_table WHERE (OBJECT_NAME = 'test_table') OR (OBJECT_SCHEMA = 'sys') OR (OBJECT_SCHEMA = 'information_schema' AND OBJECT_NAME = 'XTRADB_ZIP_DICT')";
        assert_eq!(got, expect);
    }

    #[test]
    fn test_query_all_uses_default_columns() {
        let opts = options(&[
            (OPT_INCLUDE, "test_table,sys.*,information_schema.XTRADB_ZIP_DICT"),
            (OPT_ALL, "yes"),
        ]);
        let got = table_io_query(&opts, &[]).expect("query");
        let expect = "SELECT OBJECT_SCHEMA, OBJECT_NAME, sum_timer_wait, min_timer_wait, avg_timer_wait, max_timer_wait, count_read, sum_timer_read, min_timer_read, avg_timer_read, max_timer_read, count_write, sum_timer_write, min_timer_write, avg_timer_write, max_timer_write, count_fetch, sum_timer_fetch, min_timer_fetch, avg_timer_fetch, max_timer_fetch, count_insert, sum_timer_insert, min_timer_insert, avg_timer_insert, max_timer_insert, count_update, sum_timer_update, min_timer_update, avg_timer_update, max_timer_update, count_delete, sum_timer_delete, min_timer_delete, avg_timer_delete, max_timer_delete FROM performance_schema.table_io_waits_summary_by_table WHERE (OBJECT_NAME = 'test_table') OR (OBJECT_SCHEMA = 'sys') OR (OBJECT_SCHEMA = 'information_schema' AND OBJECT_NAME = 'XTRADB_ZIP_DICT')";
        assert_eq!(got, expect);
    }

    #[test]
    fn test_query_is_deterministic() {
        let opts = options(&[(OPT_INCLUDE, "a.*,b.t,c"), (OPT_ALL, "no")]);
        let m = metrics(&["count_read"]);
        let first = table_io_query(&opts, &m).expect("query");
        let second = table_io_query(&opts, &m).expect("query");
        assert_eq!(first, second);
    }

    #[test]
    fn test_query_rejects_injection_in_filter() {
        let opts = options(&[(OPT_INCLUDE, "bad'schema.*"), (OPT_ALL, "no")]);
        assert!(table_io_query(&opts, &metrics(&["count_read"])).is_err());
    }

    #[test]
    fn test_query_empty_exclude_has_no_filter() {
        let opts = options(&[(OPT_EXCLUDE, ""), (OPT_ALL, "no")]);
        let got = table_io_query(&opts, &metrics(&["count_read"])).expect("query");
        assert_eq!(
            got,
            "SELECT OBJECT_SCHEMA, OBJECT_NAME, count_read FROM performance_schema.table_io_waits_summary_by_table"
        );
    }

    #[test]
    fn test_column_types() {
        assert_eq!(TableIo::column_type("count_fetch"), MetricType::Counter);
        assert_eq!(TableIo::column_type("sum_timer_wait"), MetricType::Counter);
        assert_eq!(TableIo::column_type("avg_timer_wait"), MetricType::Gauge);
        assert_eq!(TableIo::column_type("min_timer_read"), MetricType::Gauge);
    }
}
