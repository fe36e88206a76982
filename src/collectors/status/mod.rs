//! The `status.global` collector: global status variables.
//!
//! Status counters have no `@@GLOBAL` form, so the auto source probes
//! `performance_schema.global_status` then `SHOW GLOBAL STATUS`. Values are
//! reported as gauges; rate computation is a sink concern.

use anyhow::{Context, Result, anyhow, bail};
use futures::future::BoxFuture;
use sqlx::{MySqlPool, Row};
use std::collections::HashMap;
use tracing::{debug, info_span};
use tracing_futures::Instrument as _;

use super::{CollectError, CollectResult, Collector, FactoryArgs, Help, HelpOption, util};
use crate::metrics::MetricValue;
use crate::plan::Plan;

pub const DOMAIN: &str = "status.global";

pub const OPT_SOURCE: &str = "source";
pub const SOURCE_AUTO: &str = "auto";
pub const SOURCE_PFS: &str = "pfs";
pub const SOURCE_SHOW: &str = "show";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    Pfs,
    Show,
}

/// Probe order for `source: auto`.
pub const AUTO_ORDER: &[Source] = &[Source::Pfs, Source::Show];

#[derive(Clone, Debug)]
struct LevelState {
    query: String,
    metrics: Vec<String>,
}

/// Collects global status variables for the `status.global` domain.
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

    fn pfs_query(metrics: &[String]) -> String {
        format!(
            "SELECT variable_name, variable_value FROM performance_schema.global_status WHERE variable_name IN ('{}');",
            util::quoted_in_list(metrics)
        )
    }

    fn show_query(metrics: &[String]) -> String {
        format!(
            "SHOW GLOBAL STATUS WHERE variable_name IN ('{}');",
            util::quoted_in_list(metrics)
        )
    }

    fn level_state(source: Source, metrics: &[String]) -> LevelState {
        let query = match source {
            Source::Pfs => Self::pfs_query(metrics),
            Source::Show => Self::show_query(metrics),
        };
        LevelState {
            query,
            metrics: metrics.to_vec(),
        }
    }

    async fn prepare_level(
        pool: &MySqlPool,
        metrics: &[String],
        options: &HashMap<String, String>,
    ) -> Result<LevelState> {
        util::validate_metric_names(metrics)?;

        if metrics.is_empty() {
            return Ok(LevelState {
                query: String::new(),
                metrics: Vec::new(),
            });
        }

        let requested = options
            .get(OPT_SOURCE)
            .map(String::as_str)
            .unwrap_or(SOURCE_AUTO);

        if !requested.is_empty() && requested != SOURCE_AUTO {
            let source = match requested {
                SOURCE_PFS => Source::Pfs,
                SOURCE_SHOW => Source::Show,
                _ => bail!("invalid source: {requested}; valid values: auto, pfs, show"),
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
            description: "Collect global status variables",
            options: &[HelpOption {
                name: OPT_SOURCE,
                doc: "Where to collect status variables from",
                values: "auto (probe best source); pfs (performance_schema.global_status); show (SHOW GLOBAL STATUS)",
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
            if state.metrics.is_empty() {
                return Ok(Vec::new());
            }
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

    #[test]
    fn test_pfs_query() {
        let q = Global::pfs_query(&metrics(&["Threads_running", "Queries"]));
        assert_eq!(
            q,
            "SELECT variable_name, variable_value FROM performance_schema.global_status WHERE variable_name IN ('Threads_running', 'Queries');"
        );
    }

    #[test]
    fn test_show_query() {
        let q = Global::show_query(&metrics(&["Queries"]));
        assert_eq!(q, "SHOW GLOBAL STATUS WHERE variable_name IN ('Queries');");
    }

    #[test]
    fn test_auto_probe_order() {
        assert_eq!(AUTO_ORDER, &[Source::Pfs, Source::Show]);
    }

    #[tokio::test]
    async fn test_prepare_level_rejects_select_source() {
        // select has no meaning for status counters.
        let pool = sqlx::mysql::MySqlPoolOptions::new()
            .connect_lazy("mysql://root@localhost:3306/")
            .expect("lazy pool");
        let mut options = HashMap::new();
        options.insert(OPT_SOURCE.to_string(), "select".to_string());
        let err = Global::prepare_level(&pool, &metrics(&["Queries"]), &options)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid source"));
    }
}
