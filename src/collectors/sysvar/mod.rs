//! The `var.global` collector: global system variables.
//!
//! Sysvars can be read from more than one source, so the collector probes
//! (for `source: auto`) in order: `SELECT @@GLOBAL...` then
//! `performance_schema.global_variables` then `SHOW GLOBAL VARIABLES`,
//! adopting the first source that works against the live connection.

use anyhow::{Context, Result, anyhow, bail};
use futures::future::BoxFuture;
use sqlx::{MySqlPool, Row};
use std::collections::HashMap;
use tracing::{debug, info_span};
use tracing_futures::Instrument as _;

use super::{CollectError, CollectResult, Collector, FactoryArgs, Help, HelpOption, util};
use crate::metrics::MetricValue;
use crate::plan::Plan;

pub const DOMAIN: &str = "var.global";

pub const OPT_SOURCE: &str = "source";
pub const SOURCE_AUTO: &str = "auto";
pub const SOURCE_SELECT: &str = "select";
pub const SOURCE_PFS: &str = "pfs";
pub const SOURCE_SHOW: &str = "show";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    Select,
    Pfs,
    Show,
}

impl Source {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Select => SOURCE_SELECT,
            Self::Pfs => SOURCE_PFS,
            Self::Show => SOURCE_SHOW,
        }
    }
}

/// Probe order for `source: auto`: first source that works wins.
pub const AUTO_ORDER: &[Source] = &[Source::Select, Source::Pfs, Source::Show];

/// State prepared per level: the chosen source, the SQL to run, and the
/// ordered metric list used to parse multi-column rows.
#[derive(Clone, Debug)]
struct LevelState {
    source: Source,
    query: String,
    metrics: Vec<String>,
}

/// Collects global system variables for the `var.global` domain.
pub struct Global {
    pool: MySqlPool,
    levels: HashMap<String, LevelState>,
}

impl Global {
    #[must_use]
    pub fn new(args: &FactoryArgs) -> Self {
        Self {
            pool: args.pool.clone(),
            levels: HashMap::new(),
        }
    }

    fn select_query(metrics: &[String]) -> String {
        let cols: Vec<String> = metrics.iter().map(|m| format!("@@GLOBAL.{m}")).collect();
        format!("SELECT CONCAT_WS(',', {}) v;", cols.join(", "))
    }

    fn pfs_query(metrics: &[String]) -> String {
        format!(
            "SELECT variable_name, variable_value FROM performance_schema.global_variables WHERE variable_name IN ('{}');",
            util::quoted_in_list(metrics)
        )
    }

    fn show_query(metrics: &[String]) -> String {
        format!(
            "SHOW GLOBAL VARIABLES WHERE variable_name IN ('{}');",
            util::quoted_in_list(metrics)
        )
    }

    fn level_state(source: Source, metrics: &[String]) -> LevelState {
        let query = match source {
            Source::Select => Self::select_query(metrics),
            Source::Pfs => Self::pfs_query(metrics),
            Source::Show => Self::show_query(metrics),
        };
        LevelState {
            source,
            query,
            metrics: metrics.to_vec(),
        }
    }

    /// Split a `CONCAT_WS` row on `,` and assign values by position into the
    /// remembered metric list. Individual parse failures skip that metric.
    fn parse_csv_row(raw: &str, metrics: &[String]) -> Vec<MetricValue> {
        let fields: Vec<&str> = raw.split(',').collect();
        metrics
            .iter()
            .enumerate()
            .filter_map(|(idx, name)| {
                let Some(field) = fields.get(idx) else {
                    debug!(metric = %name, "missing field in row, skipping");
                    return None;
                };
                util::coerce_row_value(name, field).map(|v| MetricValue::gauge(name.clone(), v))
            })
            .collect()
    }

    async fn prepare_level(
        pool: &MySqlPool,
        metrics: &[String],
        options: &HashMap<String, String>,
    ) -> Result<LevelState> {
        util::validate_metric_names(metrics)?;

        // An empty metric list is valid: collect returns an empty sequence
        // without issuing any query.
        if metrics.is_empty() {
            return Ok(LevelState {
                source: Source::Select,
                query: String::new(),
                metrics: Vec::new(),
            });
        }

        let requested = options
            .get(OPT_SOURCE)
            .map(String::as_str)
            .unwrap_or(SOURCE_AUTO);

        // An explicit non-auto source is forced, with no fallback. It still
        // gets the one-shot validation call.
        if !requested.is_empty() && requested != SOURCE_AUTO {
            let source = match requested {
                SOURCE_SELECT => Source::Select,
                SOURCE_PFS => Source::Pfs,
                SOURCE_SHOW => Source::Show,
                _ => bail!("invalid source: {requested}; valid values: auto, select, pfs, show"),
            };
            let state = Self::level_state(source, metrics);
            Self::query_values(pool, &state)
                .await
                .map_err(|e| e.error)
                .with_context(|| format!("source {requested}"))?;
            return Ok(state);
        }

        let mut last_err = anyhow!("no source attempted");
        for source in AUTO_ORDER {
            let state = Self::level_state(*source, metrics);
            match Self::query_values(pool, &state).await {
                Ok(_) => return Ok(state),
                Err(e) => last_err = e.error,
            }
        }
        Err(anyhow!("auto source failed, last error: {last_err:#}"))
    }

    async fn query_values(pool: &MySqlPool, state: &LevelState) -> CollectResult {
        match state.source {
            Source::Select => Self::collect_select(pool, state).await,
            Source::Pfs | Source::Show => Self::collect_name_value(pool, state).await,
        }
    }

    async fn collect_select(pool: &MySqlPool, state: &LevelState) -> CollectResult {
        let span = info_span!(
            "db.query",
            db.system = "mysql",
            db.operation = "SELECT",
            db.statement = %state.query,
            otel.kind = "client"
        );
        let row: Option<String> = sqlx::query_scalar(&state.query)
            .fetch_optional(pool)
            .instrument(span)
            .await?;

        Ok(row
            .map(|raw| Self::parse_csv_row(&raw, &state.metrics))
            .unwrap_or_default())
    }

    /// `pfs` and `show` share result parsing: two-column `(name, value)`
    /// rows, value coerced to float, failures skipped per row.
    async fn collect_name_value(pool: &MySqlPool, state: &LevelState) -> CollectResult {
        let span = info_span!(
            "db.query",
            db.system = "mysql",
            db.operation = state.source.as_str(),
            db.statement = %state.query,
            otel.kind = "client"
        );
        let rows = sqlx::query(&state.query)
            .fetch_all(pool)
            .instrument(span)
            .await?;

        let mut values = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = match row.try_get(0) {
                Ok(name) => name,
                Err(e) => {
                    debug!(error = %e, "could not scan row name, skipping");
                    continue;
                }
            };
            let raw: String = match row.try_get(1) {
                Ok(raw) => raw,
                Err(e) => {
                    debug!(metric = %name, error = %e, "could not scan row value, skipping");
                    continue;
                }
            };
            if let Some(v) = util::coerce_row_value(&name, &raw) {
                values.push(MetricValue::gauge(name.to_ascii_lowercase(), v));
            }
        }
        Ok(values)
    }
}

impl Collector for Global {
    fn domain(&self) -> &'static str {
        DOMAIN
    }

    fn help(&self) -> Help {
        Help {
            domain: DOMAIN,
            description: "Collect global system variables (sysvars)",
            options: &[HelpOption {
                name: OPT_SOURCE,
                doc: "Where to collect sysvars from",
                values: "auto (probe best source); select (@@GLOBAL.metric_name); pfs (performance_schema.global_variables); show (SHOW GLOBAL VARIABLES)",
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
                let state = Self::prepare_level(&self.pool, &dom.metrics, &dom.options)
                    .await
                    .with_context(|| format!("{DOMAIN}: plan {} level {level_name}", plan.name))?;
                staged.insert(level_name.clone(), state);
            }
            // Commit only after every level prepared.
            self.levels = staged;
            Ok(())
        })
    }

    fn collect<'a>(&'a self, level_name: &'a str) -> BoxFuture<'a, CollectResult> {
        Box::pin(async move {
            // Prepare chose the source, so a missing level here is an
            // internal invariant violation, reported instead of panicking.
            let Some(state) = self.levels.get(level_name) else {
                return Err(CollectError::new(anyhow!(
                    "{DOMAIN}: not prepared for level {level_name}"
                )));
            };
            if state.metrics.is_empty() {
                return Ok(Vec::new());
            }
            Self::query_values(&self.pool, state).await
        })
    }
}
