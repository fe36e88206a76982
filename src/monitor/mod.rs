//! Per-monitor orchestration.
//!
//! Each monitor runs as an independent actor composed of three cooperating
//! workers: the LPC (timing), the LPA (role observation), and a reconnect
//! worker triggered by connection loss. Across monitors there is no shared
//! mutable state beyond the collector registry.

use anyhow::{Context, Result, bail};
use rand::Rng;
use secrecy::ExposeSecret;
use sqlx::MySqlPool;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub mod engine;
pub mod lpa;
pub mod lpc;

use crate::config::{ConfigMonitor, TransformMetrics};
use crate::event::{self, Event, EventSink};
use crate::plan::Plan;
use crate::sink::Sink;
use engine::Engine;
use lpa::LevelAdjuster;
use lpc::LevelCollector;

/// Monitor states used by the level plan adjuster.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MonitorState {
    /// Initial pre-observation state.
    #[default]
    None,
    Offline,
    Standby,
    ReadOnly,
    Active,
}

impl MonitorState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Offline => "offline",
            Self::Standby => "standby",
            Self::ReadOnly => "read-only",
            Self::Active => "active",
        }
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MonitorState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" => Ok(Self::None),
            "offline" => Ok(Self::Offline),
            "standby" => Ok(Self::Standby),
            "read-only" => Ok(Self::ReadOnly),
            "active" => Ok(Self::Active),
            other => bail!("invalid monitor state: {other}"),
        }
    }
}

/// Exponential backoff with jitter and a cap, for the reconnect loop.
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { current: base, max }
    }

    /// The next delay: the current backoff plus up to 25% jitter, doubling
    /// (capped) each call.
    pub fn next_delay(&mut self) -> Duration {
        let jitter_ms = self.current.as_millis() / 4;
        #[allow(clippy::cast_possible_truncation)]
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms as u64))
        };
        let delay = self.current + jitter;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

const RECONNECT_BASE: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);
const PANIC_RESTART_DELAY: Duration = Duration::from_secs(1);

/// One monitored MySQL instance: the engine, its workers, and their
/// lifecycle.
pub struct Monitor {
    monitor_id: String,
    engine: Arc<Engine>,
    lpc: Arc<LevelCollector>,
    lpa: Option<Arc<LevelAdjuster>>,
    events: Arc<dyn EventSink>,
    initial_plan: Plan,
    cancel: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Monitor {
    /// Build a monitor from its config. The first plan in `plans` is the
    /// initial (active) plan; the rest are available to the plan adjuster.
    ///
    /// # Errors
    ///
    /// Returns an error on an empty monitor id, an unparseable DSN, or an
    /// empty plan list.
    pub fn new(
        config: &ConfigMonitor,
        plans: Vec<Plan>,
        sinks: Vec<Arc<dyn Sink>>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let pool = default_pool(config)?;
        Self::with_pool(config, pool, plans, sinks, events, None)
    }

    /// Like [`Monitor::new`] with an explicit pool (from a
    /// [`crate::config::DbFactory`]) and optional transform-metrics plugin.
    ///
    /// # Errors
    ///
    /// Returns an error on an empty monitor id or an empty plan list.
    pub fn with_pool(
        config: &ConfigMonitor,
        pool: MySqlPool,
        mut plans: Vec<Plan>,
        sinks: Vec<Arc<dyn Sink>>,
        events: Arc<dyn EventSink>,
        transform: Option<TransformMetrics>,
    ) -> Result<Self> {
        let monitor_id = config.monitor_id()?;
        if plans.is_empty() {
            bail!("monitor {monitor_id}: no plans configured");
        }
        let initial_plan = plans[0].clone();
        initial_plan
            .validate()
            .with_context(|| format!("monitor {monitor_id}"))?;

        let cancel = CancellationToken::new();
        let engine = Arc::new(Engine::new(
            monitor_id.clone(),
            pool,
            Arc::clone(&events),
        ));
        let mut lpc = LevelCollector::new(
            Arc::clone(&engine),
            sinks,
            Arc::clone(&events),
            cancel.child_token(),
        );
        if let Some(transform) = transform {
            lpc = lpc.with_transform(transform);
        }
        let lpc = Arc::new(lpc);

        let lpa = config.plan_adjuster.as_ref().map(|cfg| {
            Arc::new(LevelAdjuster::new(
                Arc::clone(&engine),
                Arc::clone(&lpc),
                cfg.clone(),
                std::mem::take(&mut plans),
                Arc::clone(&events),
                cancel.child_token(),
            ))
        });

        Ok(Self {
            monitor_id,
            engine,
            lpc,
            lpa,
            events,
            initial_plan,
            cancel,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Prepare the initial plan and start the workers.
    ///
    /// # Errors
    ///
    /// Returns an error when the initial prepare fails; nothing is started
    /// in that case.
    pub async fn start(&self) -> Result<()> {
        if let Err(e) = self.engine.prepare(self.initial_plan.clone()).await {
            self.events.send(
                Event::new(event::MONITOR_ERROR, &self.monitor_id, &self.initial_plan.name)
                    .with_error(&e),
            );
            return Err(e);
        }

        self.events.send(Event::new(
            event::MONITOR_STARTED,
            &self.monitor_id,
            &self.initial_plan.name,
        ));

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.spawn_lpc_supervisor());
        if let Some(lpa) = &self.lpa {
            let lpa = Arc::clone(lpa);
            tasks.push(tokio::spawn(async move { lpa.run().await }));
        }
        tasks.push(self.spawn_reconnect_worker());
        Ok(())
    }

    // Restart the scheduling loop after a panic; a clean return means stop.
    fn spawn_lpc_supervisor(&self) -> JoinHandle<()> {
        let lpc = Arc::clone(&self.lpc);
        let events = Arc::clone(&self.events);
        let cancel = self.cancel.clone();
        let monitor_id = self.monitor_id.clone();
        tokio::spawn(async move {
            loop {
                let run = Arc::clone(&lpc);
                let handle = tokio::spawn(async move { run.run().await });
                match handle.await {
                    Ok(()) => return,
                    Err(join_err) => {
                        if cancel.is_cancelled() {
                            return;
                        }
                        events.send(Event::new(
                            event::LPC_PANIC,
                            &monitor_id,
                            join_err.to_string(),
                        ));
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            () = tokio::time::sleep(PANIC_RESTART_DELAY) => {}
                        }
                    }
                }
            }
        })
    }

    // Waits for the engine to flag a lost connection, pauses collection,
    // and probes with backoff until the pool answers again. Collectors are
    // re-prepared before collection resumes (schema might have changed).
    fn spawn_reconnect_worker(&self) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let lpc = Arc::clone(&self.lpc);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = engine.wait_connection_lost() => {}
                }
                lpc.pause();

                let mut backoff = Backoff::new(RECONNECT_BASE, RECONNECT_MAX);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(backoff.next_delay()) => {}
                    }
                    if let Err(e) = sqlx::query("SELECT 1").execute(engine.pool()).await {
                        debug!(
                            monitor_id = engine.monitor_id(),
                            error = %e,
                            "reconnect probe failed"
                        );
                        continue;
                    }
                    match engine.reprepare().await {
                        Ok(()) => {
                            engine.clear_disconnected();
                            lpc.resume();
                            break;
                        }
                        Err(e) => {
                            debug!(
                                monitor_id = engine.monitor_id(),
                                error = %format!("{e:#}"),
                                "re-prepare after reconnect failed"
                            );
                        }
                    }
                }
            }
        })
    }

    /// Stop the monitor: cancel the root context and wait for the workers.
    /// Outstanding collections and sink sends complete or observe
    /// cancellation.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.lpc.stop();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        self.events.send(Event::new(
            event::MONITOR_STOPPED,
            &self.monitor_id,
            "",
        ));
    }

    #[must_use]
    pub fn monitor_id(&self) -> &str {
        &self.monitor_id
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    #[must_use]
    pub fn lpc(&self) -> &Arc<LevelCollector> {
        &self.lpc
    }

    /// One-line status for admin introspection.
    pub async fn status(&self) -> String {
        format!(
            "monitor={} lpc={} {}",
            self.monitor_id,
            self.lpc.status(),
            self.engine.status().await
        )
    }
}

/// Build the default lazy pool from the monitor's DSN.
///
/// # Errors
///
/// Returns an error when the DSN does not parse.
pub fn default_pool(config: &ConfigMonitor) -> Result<MySqlPool> {
    let opts = MySqlConnectOptions::from_str(config.dsn.expose_secret())
        .context("invalid monitor DSN")?;
    Ok(MySqlPoolOptions::new()
        .max_connections(3)
        .acquire_timeout(Duration::from_secs(5))
        .connect_lazy_with(opts))
}
