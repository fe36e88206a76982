use secrecy::SecretString;

pub mod run;

#[derive(Debug)]
pub enum Action {
    Run {
        dsn: SecretString,
        monitor_id: String,
        plan_path: Option<String>,
    },
    ListDomains,
}
