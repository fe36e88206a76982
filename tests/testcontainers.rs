#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use anyhow::Result;
use mysqlmon::collectors::registry;
use mysqlmon::collectors::{Collector, FactoryArgs};
use mysqlmon::event::TracingEvents;
use mysqlmon::monitor::engine::Engine;
use mysqlmon::plan::{Domain, Level, Plan};
use nix::unistd::geteuid;
use sqlx::mysql::MySqlPoolOptions;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use testcontainers_modules::mysql::Mysql;
use testcontainers_modules::testcontainers::{core::IntoContainerPort, runners::AsyncRunner};
use tokio_util::sync::CancellationToken;

fn socket_exists(host: &str) -> bool {
    if let Some(path) = host.strip_prefix("unix://") {
        Path::new(path).exists()
    } else {
        true
    }
}

fn find_container_runtime() -> Option<String> {
    // Honor explicit DOCKER_HOST if present and reachable.
    if let Ok(existing) = env::var("DOCKER_HOST")
        && !existing.is_empty()
        && socket_exists(&existing)
    {
        return Some(existing);
    }

    // Prefer Podman sockets first, fall back to Docker socket.
    let uid = geteuid().as_raw();
    let candidates = [
        format!("unix:///run/user/{uid}/podman/podman.sock"),
        "unix:///run/podman/podman.sock".to_string(),
        "unix:///var/run/podman/podman.sock".to_string(),
        "unix:///var/run/docker.sock".to_string(),
    ];

    candidates.into_iter().find(|c| socket_exists(c))
}

fn kpi_plan() -> Plan {
    let mut collect = HashMap::new();
    collect.insert(
        "var.global".to_string(),
        Domain::new(&["max_connections", "innodb_buffer_pool_size"]),
    );
    collect.insert(
        "status.global".to_string(),
        Domain::new(&["queries", "threads_running", "threads_connected"]),
    );
    collect.insert("size.data".to_string(), Domain::new(&["bytes"]));
    collect.insert(
        "io.table".to_string(),
        Domain::new(&["count_fetch", "count_insert"]),
    );
    collect.insert("innodb".to_string(), Domain::new(&["lock_timeouts"]));

    let mut levels = HashMap::new();
    levels.insert(
        "kpi".to_string(),
        Level {
            freq: Duration::from_secs(5),
            collect,
        },
    );
    Plan {
        name: "it".to_string(),
        levels,
    }
}

#[tokio::test]
async fn collect_metrics_from_mysql_container() -> Result<()> {
    let Some(docker_host) = find_container_runtime() else {
        eprintln!(
            "No container runtime socket found (checked Podman + Docker), skipping container integration test"
        );
        return Ok(());
    };

    // Safe because we control the variable name/value and keep it ASCII for
    // the child processes.
    unsafe { env::set_var("DOCKER_HOST", &docker_host) };

    let container = Mysql::default().start().await?;
    let port = container.get_host_port_ipv4(3306.tcp()).await?;
    let dsn = format!("mysql://root@127.0.0.1:{port}/mysql");

    let pool = MySqlPoolOptions::new()
        .max_connections(3)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&dsn)
        .await?;

    // The sysvar collector alone: auto source must adopt select, and the
    // value order must follow the metric list.
    let args = FactoryArgs {
        monitor_id: "it-mysql".to_string(),
        pool: pool.clone(),
    };
    let mut sysvar = registry::global().make("var.global", &args)?;
    let plan = kpi_plan();
    sysvar.prepare(&plan).await?;
    let values = sysvar
        .collect("kpi")
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(values.len(), 2);
    assert_eq!(values[0].name, "max_connections");
    assert_eq!(values[1].name, "innodb_buffer_pool_size");
    assert!(values[0].value > 0.0);

    // The whole engine: one batch with a key per domain.
    let engine = Engine::new("it-mysql", pool, Arc::new(TracingEvents));
    engine.prepare(kpi_plan()).await?;
    let batch = engine.collect("kpi", &CancellationToken::new()).await?;

    assert_eq!(batch.monitor_id, "it-mysql");
    assert!(batch.end >= batch.begin);
    for domain in [
        "var.global",
        "status.global",
        "size.data",
        "io.table",
        "innodb",
    ] {
        assert!(batch.values.contains_key(domain), "missing {domain}");
    }
    assert_eq!(batch.values["var.global"].len(), 2);
    assert!(!batch.values["status.global"].is_empty());
    assert!(!batch.values["size.data"].is_empty());

    Ok(())
}
