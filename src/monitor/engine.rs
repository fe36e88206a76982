//! The per-monitor collection engine.
//!
//! Owns the installed plan and one collector per domain. Prepare swaps in a
//! freshly prepared collector generation (all-or-nothing), collect fans out
//! across the level's domains concurrently and always produces a batch with
//! one `values` key per configured domain.

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use futures::FutureExt;
use futures::future::join_all;
use sqlx::MySqlPool;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;

use crate::collectors::registry::{self, CollectorRegistry};
use crate::collectors::{Collector, FactoryArgs};
use crate::event::{self, Event, EventSink};
use crate::metrics::{MetricValue, Metrics};
use crate::monitor::MonitorState;
use crate::plan::Plan;

struct Inner {
    plan: Option<Arc<Plan>>,
    collectors: HashMap<String, Box<dyn Collector>>,
}

pub struct Engine {
    monitor_id: String,
    pool: MySqlPool,
    events: Arc<dyn EventSink>,
    registry: Arc<CollectorRegistry>,
    // Write = prepare, read = collect: prepare is never concurrent with
    // collect on the same collector.
    inner: RwLock<Inner>,
    state: std::sync::Mutex<MonitorState>,
    disconnected: AtomicBool,
    connection_lost: Notify,
}

impl Engine {
    #[must_use]
    pub fn new(monitor_id: impl Into<String>, pool: MySqlPool, events: Arc<dyn EventSink>) -> Self {
        Self::with_registry(monitor_id, pool, events, registry::global())
    }

    #[must_use]
    pub fn with_registry(
        monitor_id: impl Into<String>,
        pool: MySqlPool,
        events: Arc<dyn EventSink>,
        registry: Arc<CollectorRegistry>,
    ) -> Self {
        Self {
            monitor_id: monitor_id.into(),
            pool,
            events,
            registry,
            inner: RwLock::new(Inner {
                plan: None,
                collectors: HashMap::new(),
            }),
            state: std::sync::Mutex::new(MonitorState::None),
            disconnected: AtomicBool::new(false),
            connection_lost: Notify::new(),
        }
    }

    #[must_use]
    pub fn monitor_id(&self) -> &str {
        &self.monitor_id
    }

    /// The currently installed plan, if any.
    pub async fn plan(&self) -> Option<Arc<Plan>> {
        self.inner.read().await.plan.clone()
    }

    /// Install `plan`: construct a collector for every domain the plan
    /// references, prepare each against the whole plan, and swap the new
    /// generation in atomically. On any failure the previous plan and
    /// collectors remain unchanged.
    ///
    /// # Errors
    ///
    /// Returns the first prepare error with the offending domain (and, via
    /// the collector's context, level) identified.
    pub async fn prepare(&self, plan: Plan) -> Result<()> {
        self.events.send(Event::new(
            event::ENGINE_PREPARE,
            &self.monitor_id,
            &plan.name,
        ));
        let plan_name = plan.name.clone();
        match self.prepare_swap(plan).await {
            Ok(()) => {
                self.events.send(Event::new(
                    event::ENGINE_PREPARE_SUCCESS,
                    &self.monitor_id,
                    &plan_name,
                ));
                Ok(())
            }
            Err(e) => {
                self.events.send(
                    Event::new(event::ENGINE_PREPARE_ERROR, &self.monitor_id, &plan_name)
                        .with_error(&e),
                );
                Err(e)
            }
        }
    }

    async fn prepare_swap(&self, plan: Plan) -> Result<()> {
        plan.validate()?;

        let args = FactoryArgs {
            monitor_id: self.monitor_id.clone(),
            pool: self.pool.clone(),
        };
        let mut collectors: HashMap<String, Box<dyn Collector>> = HashMap::new();
        for domain in plan.domains() {
            let mut collector = self
                .registry
                .make(&domain, &args)
                .with_context(|| format!("domain {domain}"))?;
            collector
                .prepare(&plan)
                .await
                .with_context(|| format!("domain {domain}"))?;
            collectors.insert(domain, collector);
        }

        let mut inner = self.inner.write().await;
        inner.plan = Some(Arc::new(plan));
        inner.collectors = collectors;
        Ok(())
    }

    /// Re-prepare all collectors against the currently installed plan
    /// (after a reconnect, when server state may have changed).
    ///
    /// # Errors
    ///
    /// Returns an error when no plan is installed or prepare fails.
    pub async fn reprepare(&self) -> Result<()> {
        let plan = self
            .plan()
            .await
            .ok_or_else(|| anyhow!("engine has no plan to re-prepare"))?;
        self.prepare(plan.as_ref().clone()).await
    }

    /// Collect one level of the installed plan. Collectors for different
    /// domains run concurrently, each bounded by the level frequency.
    /// Per-collector failures leave an empty (or partial) value sequence
    /// for that domain; the batch is still produced.
    ///
    /// # Errors
    ///
    /// Only fails when no plan is installed or the level is unknown.
    pub async fn collect(&self, level_name: &str, cancel: &CancellationToken) -> Result<Metrics> {
        let inner = self.inner.read().await;
        let plan = inner
            .plan
            .as_ref()
            .ok_or_else(|| anyhow!("engine not prepared"))?;
        let level = plan
            .level(level_name)
            .ok_or_else(|| anyhow!("level {level_name} not in plan {}", plan.name))?;

        let begin = Utc::now();
        let collections = level.collect.keys().map(|domain| {
            let collector = inner.collectors.get(domain);
            async move {
                let values = match collector {
                    Some(c) => {
                        self.collect_domain(c.as_ref(), domain, level_name, level.freq, cancel)
                            .await
                    }
                    None => {
                        // Should not happen: prepare constructs a collector
                        // per referenced domain.
                        self.events.send(Event::new(
                            event::COLLECTOR_ERROR,
                            &self.monitor_id,
                            format!("{domain}/{level_name}: no collector"),
                        ));
                        Vec::new()
                    }
                };
                (domain.clone(), values)
            }
        });
        let values: HashMap<String, Vec<MetricValue>> = join_all(collections).await.into_iter().collect();
        let end = Utc::now();

        Ok(Metrics {
            begin,
            end,
            monitor_id: self.monitor_id.clone(),
            plan: plan.name.clone(),
            level: level_name.to_string(),
            state: self.state().as_str().to_string(),
            values,
        })
    }

    async fn collect_domain(
        &self,
        collector: &dyn Collector,
        domain: &str,
        level_name: &str,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Vec<MetricValue> {
        let fut = AssertUnwindSafe(collector.collect(level_name)).catch_unwind();
        let outcome = tokio::select! {
            () = cancel.cancelled() => return Vec::new(),
            outcome = tokio::time::timeout(budget, fut) => outcome,
        };

        match outcome {
            Err(_elapsed) => {
                self.events.send(Event::new(
                    event::ENGINE_COLLECT_ERROR,
                    &self.monitor_id,
                    format!("{domain}/{level_name}: collect timed out after {budget:?}"),
                ));
                Vec::new()
            }
            Ok(Err(panic)) => {
                self.events.send(Event::new(
                    event::COLLECTOR_PANIC,
                    &self.monitor_id,
                    format!("{domain}/{level_name}: {}", panic_message(panic.as_ref())),
                ));
                Vec::new()
            }
            Ok(Ok(Ok(values))) => values,
            Ok(Ok(Err(collect_err))) => {
                if is_connection_error(&collect_err.error) {
                    self.mark_disconnected();
                }
                self.events.send(
                    Event::new(
                        event::COLLECTOR_ERROR,
                        &self.monitor_id,
                        format!("{domain}/{level_name}"),
                    )
                    .with_error(&collect_err.error),
                );
                // Partial results are kept.
                collect_err.partial
            }
        }
    }

    /// Monitor state attached to future batches (set by the level plan
    /// adjuster).
    #[must_use]
    pub fn state(&self) -> MonitorState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set_state(&self, state: MonitorState) {
        match self.state.lock() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    fn mark_disconnected(&self) {
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            self.events.send(Event::new(
                event::MONITOR_CONNECTING,
                &self.monitor_id,
                "connection lost",
            ));
            self.connection_lost.notify_one();
        }
    }

    /// Clear the disconnected flag after a successful reconnect and
    /// re-prepare.
    pub fn clear_disconnected(&self) {
        if self.disconnected.swap(false, Ordering::SeqCst) {
            self.events.send(Event::new(
                event::MONITOR_CONNECTED,
                &self.monitor_id,
                "reconnected",
            ));
        }
    }

    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Resolves when the engine classifies a collect failure as a lost
    /// connection. Consumed by the monitor's reconnect worker.
    pub async fn wait_connection_lost(&self) {
        self.connection_lost.notified().await;
    }

    /// One-line status for admin introspection.
    pub async fn status(&self) -> String {
        let inner = self.inner.read().await;
        let plan = inner.plan.as_ref().map_or("none", |p| p.name.as_str());
        format!(
            "plan={plan} domains={} state={}",
            inner.collectors.len(),
            self.state().as_str()
        )
    }

    #[must_use]
    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

/// Classify an error chain as a lost connection (triggers the reconnect
/// loop) versus an ordinary query failure.
#[must_use]
pub fn is_connection_error(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(sqlx_err) = cause.downcast_ref::<sqlx::Error>() {
            return matches!(
                sqlx_err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
            );
        }
    }
    false
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "collector panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_connection_error() {
        let io: anyhow::Error = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ))
        .into();
        assert!(is_connection_error(&io));

        let pool: anyhow::Error = sqlx::Error::PoolTimedOut.into();
        assert!(is_connection_error(&pool));

        let row: anyhow::Error = sqlx::Error::RowNotFound.into();
        assert!(!is_connection_error(&row));

        let plain = anyhow!("not a db error");
        assert!(!is_connection_error(&plain));
    }

    #[test]
    fn test_panic_message_forms() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom".to_string());
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(boxed.as_ref()), "collector panicked");
    }
}
