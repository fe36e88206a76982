use anyhow::{Result, anyhow};
use clap::ArgMatches;
use secrecy::SecretString;

use crate::cli::actions::Action;

/// # Errors
///
/// Returns an error if required arguments are missing.
pub fn handler(matches: &ArgMatches) -> Result<Action> {
    if matches.get_flag("list-domains") {
        return Ok(Action::ListDomains);
    }

    let dsn = SecretString::from(
        matches
            .get_one::<String>("dsn")
            .cloned()
            .ok_or_else(|| anyhow!("DSN is required. Please provide it using the --dsn flag."))?,
    );

    Ok(Action::Run {
        dsn,
        monitor_id: matches
            .get_one::<String>("monitor-id")
            .cloned()
            .unwrap_or_default(),
        plan_path: matches.get_one::<String>("plan").cloned(),
    })
}
