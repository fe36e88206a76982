//! Shared helpers for collectors:
//! - Metric-name validation (the names get interpolated into SQL text).
//! - Value coercion from MySQL's string results to float.
//! - Quoted IN-list construction.

use anyhow::{Result, bail};
use once_cell::sync::OnceCell;
use regex::Regex;
use tracing::debug;

/// Metric names are restricted to `[A-Za-z0-9_-]*` before they are
/// interpolated into SQL text.
fn valid_metric_regex() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new("^[A-Za-z0-9_-]*$").expect("invalid metric name regex")
    })
}

#[must_use]
pub fn is_valid_metric_name(name: &str) -> bool {
    valid_metric_regex().is_match(name)
}

/// Validate every name in the list.
///
/// # Errors
///
/// Returns an error naming the first invalid metric.
pub fn validate_metric_names(names: &[String]) -> Result<()> {
    for name in names {
        if !is_valid_metric_name(name) {
            bail!("{name} isn't a valid metric name");
        }
    }
    Ok(())
}

/// Join names into the body of a quoted SQL IN list: `a', 'b` for use inside
/// `IN ('...')`. Callers must validate the names first.
#[must_use]
pub fn quoted_in_list(names: &[String]) -> String {
    names.join("', '")
}

/// Coerce a MySQL string value to a float. Booleans (`ON`/`OFF`, `YES`/`NO`,
/// `TRUE`/`FALSE`) become 1/0. Returns `None` for anything else that does
/// not parse; callers skip such rows.
#[must_use]
pub fn coerce_value(raw: &str) -> Option<f64> {
    if let Ok(v) = raw.parse::<f64>() {
        return Some(v);
    }
    match raw.to_ascii_lowercase().as_str() {
        "on" | "yes" | "true" | "enabled" => Some(1.0),
        "off" | "no" | "false" | "disabled" => Some(0.0),
        _ => None,
    }
}

/// Coerce a `(name, value)` row to a float, logging and returning `None` on
/// failure so the caller can continue with the next row.
#[must_use]
pub fn coerce_row_value(metric: &str, raw: &str) -> Option<f64> {
    match coerce_value(raw) {
        Some(v) => Some(v),
        None => {
            debug!(metric, value = raw, "could not parse value, skipping row");
            None
        }
    }
}
