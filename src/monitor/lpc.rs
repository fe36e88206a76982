//! The level plan collector (LPC): the timing loop that drives collection.
//!
//! One scheduling task per monitor keeps a next-due timestamp per level,
//! sleeps until the earliest one, then fires every due level (ties broken
//! by ascending frequency). Each fired level becomes one engine collect on
//! its own task; if a level's previous collection is still running when its
//! next tick comes due, the tick is skipped with an `lpc-blocked` event.
//! There is no queueing.

use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::warn;

use super::engine::Engine;
use crate::config::TransformMetrics;
use crate::event::{self, Event, EventSink};
use crate::plan::Plan;
use crate::sink::{self, Sink};

struct LevelSchedule {
    name: String,
    freq: Duration,
    next: Instant,
    busy: Arc<AtomicBool>,
}

pub struct LevelCollector {
    engine: Arc<Engine>,
    sinks: Vec<Arc<dyn Sink>>,
    events: Arc<dyn EventSink>,
    transform: Option<TransformMetrics>,
    cancel: CancellationToken,
    // true = paused. The scheduling loop watches for changes.
    paused: watch::Sender<bool>,
    tracker: TaskTracker,
}

impl LevelCollector {
    #[must_use]
    pub fn new(
        engine: Arc<Engine>,
        sinks: Vec<Arc<dyn Sink>>,
        events: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            engine,
            sinks,
            events,
            transform: None,
            cancel,
            paused,
            tracker: TaskTracker::new(),
        }
    }

    #[must_use]
    pub fn with_transform(mut self, transform: TransformMetrics) -> Self {
        self.transform = Some(transform);
        self
    }

    /// The scheduling loop. Runs until [`LevelCollector::stop`] and returns
    /// once outstanding collections and sink sends have completed or
    /// observed cancellation.
    pub async fn run(&self) {
        let mut paused_rx = self.paused.subscribe();

        'outer: loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if *paused_rx.borrow_and_update() {
                tokio::select! {
                    () = self.cancel.cancelled() => break 'outer,
                    changed = paused_rx.changed() => {
                        if changed.is_err() {
                            break 'outer;
                        }
                        continue 'outer;
                    }
                }
            }

            // Snapshot the installed plan; resuming after a plan change
            // rebuilds the schedule from the new plan.
            let Some(plan) = self.engine.plan().await else {
                tokio::select! {
                    () = self.cancel.cancelled() => break 'outer,
                    () = tokio::time::sleep(Duration::from_millis(100)) => continue 'outer,
                }
            };
            self.events.send(Event::new(
                event::LPC_RUNNING,
                self.engine.monitor_id(),
                &plan.name,
            ));

            let now = Instant::now();
            let mut schedule: Vec<LevelSchedule> = plan
                .levels
                .iter()
                .map(|(name, level)| LevelSchedule {
                    name: name.clone(),
                    freq: level.freq,
                    next: now,
                    busy: Arc::new(AtomicBool::new(false)),
                })
                .collect();
            // Ascending frequency: ties on a shared due time fire the
            // fastest level first.
            schedule.sort_by_key(|s| s.freq);

            'ticking: loop {
                if self.cancel.is_cancelled() {
                    break 'outer;
                }
                if *paused_rx.borrow_and_update() {
                    continue 'outer;
                }
                // A plan swap may complete between wakeups; a stale
                // schedule must never fire under the new plan.
                match self.engine.plan().await {
                    Some(current) if Arc::ptr_eq(&current, &plan) => {}
                    _ => continue 'outer,
                }
                let next_due = schedule
                    .iter()
                    .map(|s| s.next)
                    .min()
                    .unwrap_or_else(Instant::now);
                tokio::select! {
                    () = self.cancel.cancelled() => break 'outer,
                    changed = paused_rx.changed() => {
                        if changed.is_err() {
                            break 'outer;
                        }
                        continue 'ticking;
                    }
                    () = tokio::time::sleep_until(next_due) => {}
                }

                let now = Instant::now();
                for sched in schedule.iter_mut().filter(|s| s.next <= now) {
                    if sched.busy.swap(true, Ordering::SeqCst) {
                        // Previous tick still collecting this level: skip.
                        self.events.send(Event::new(
                            event::LPC_BLOCKED,
                            self.engine.monitor_id(),
                            &sched.name,
                        ));
                    } else {
                        self.spawn_collection(&sched.name, sched.freq, Arc::clone(&sched.busy));
                    }
                    while sched.next <= now {
                        sched.next += sched.freq;
                    }
                }
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
    }

    fn spawn_collection(&self, level_name: &str, freq: Duration, busy: Arc<AtomicBool>) {
        let engine = Arc::clone(&self.engine);
        let sinks = self.sinks.clone();
        let events = Arc::clone(&self.events);
        let transform = self.transform.clone();
        let cancel = self.cancel.clone();
        let tracker = self.tracker.clone();
        let level = level_name.to_string();

        self.tracker.spawn(async move {
            match engine.collect(&level, &cancel).await {
                Ok(mut metrics) => {
                    // A collection truncated by shutdown is dropped, not
                    // sent.
                    if cancel.is_cancelled() {
                        busy.store(false, Ordering::SeqCst);
                        return;
                    }
                    if let Some(transform) = &transform
                        && let Err(e) = transform(&mut metrics)
                    {
                        warn!(error = %format!("{e:#}"), "transform-metrics plugin failed");
                    }
                    sink::fan_out(&tracker, &sinks, metrics, freq, &events);
                }
                Err(e) => events.send(
                    Event::new(event::ENGINE_COLLECT_ERROR, engine.monitor_id(), &level)
                        .with_error(&e),
                ),
            }
            busy.store(false, Ordering::SeqCst);
        });
    }

    /// Idempotent: pausing a paused loop is a no-op.
    pub fn pause(&self) {
        let was_paused = self.paused.send_replace(true);
        if !was_paused {
            self.events.send(Event::new(
                event::LPC_PAUSED,
                self.engine.monitor_id(),
                "",
            ));
        }
    }

    /// Idempotent: resuming a running loop is a no-op. The scheduling loop
    /// emits `lpc-running` when it rebuilds its schedule.
    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Pause, prepare the engine with `plan`, then resume. On prepare
    /// failure the previous plan stays installed and the loop resumes with
    /// it.
    ///
    /// # Errors
    ///
    /// Returns the engine's prepare error.
    pub async fn change_plan(&self, plan: Plan) -> Result<()> {
        let plan_name = plan.name.clone();
        self.events.send(Event::new(
            event::CHANGE_PLAN,
            self.engine.monitor_id(),
            &plan_name,
        ));

        self.pause();
        let result = self.engine.prepare(plan).await;
        match &result {
            Ok(()) => self.events.send(Event::new(
                event::CHANGE_PLAN_SUCCESS,
                self.engine.monitor_id(),
                &plan_name,
            )),
            Err(e) => self.events.send(
                Event::new(event::CHANGE_PLAN_ERROR, self.engine.monitor_id(), &plan_name)
                    .with_error(e),
            ),
        }
        self.resume();
        result
    }

    /// Cancel the loop. [`LevelCollector::run`] returns once outstanding
    /// collections have completed or observed cancellation.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn status(&self) -> String {
        if self.cancel.is_cancelled() {
            "stopped".to_string()
        } else if *self.paused.borrow() {
            "paused".to_string()
        } else {
            "running".to_string()
        }
    }
}
