//! The level plan adjuster (LPA): switches a monitor's active plan based on
//! the observed MySQL role.
//!
//! A background poller runs a lightweight role query on a fixed cadence and
//! debounces the result: a candidate state must persist across N
//! consecutive polls before it commits, and M consecutive poll failures
//! commit `offline`. One successful poll re-enters an online state.

use anyhow::Result;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::MonitorState;
use super::engine::Engine;
use super::lpc::LevelCollector;
use crate::config::ConfigPlanAdjuster;
use crate::event::{self, Event, EventSink};
use crate::plan::Plan;

/// Role indicators from one poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Observation {
    pub read_only: bool,
    pub replica_running: bool,
}

/// Map role indicators to a monitor state: writable means active, a
/// read-only instance with a running replica thread is a standby, and a
/// read-only instance without one is read-only.
#[must_use]
pub fn decide(obs: Observation) -> MonitorState {
    if !obs.read_only {
        MonitorState::Active
    } else if obs.replica_running {
        MonitorState::Standby
    } else {
        MonitorState::ReadOnly
    }
}

/// Debounces observed states before they commit.
pub struct Debounce {
    debounce: u32,
    offline_after: u32,
    committed: MonitorState,
    candidate: Option<(MonitorState, u32)>,
    failures: u32,
}

impl Debounce {
    #[must_use]
    pub fn new(debounce: u32, offline_after: u32) -> Self {
        Self {
            debounce: debounce.max(1),
            offline_after: offline_after.max(1),
            committed: MonitorState::None,
            candidate: None,
            failures: 0,
        }
    }

    /// Feed one successful poll. Returns the newly committed state when a
    /// transition happens.
    pub fn observe(&mut self, state: MonitorState) -> Option<MonitorState> {
        self.failures = 0;

        // One successful poll after reconnection re-enters an online state.
        if self.committed == MonitorState::Offline {
            self.candidate = None;
            self.committed = state;
            return Some(state);
        }

        if state == self.committed {
            self.candidate = None;
            return None;
        }

        let count = match &mut self.candidate {
            Some((candidate, count)) if *candidate == state => {
                *count += 1;
                *count
            }
            _ => {
                self.candidate = Some((state, 1));
                1
            }
        };
        if count >= self.debounce {
            self.candidate = None;
            self.committed = state;
            Some(state)
        } else {
            None
        }
    }

    /// Feed one failed poll. Commits `offline` after the configured number
    /// of consecutive failures.
    pub fn observe_failure(&mut self) -> Option<MonitorState> {
        self.failures += 1;
        if self.failures >= self.offline_after && self.committed != MonitorState::Offline {
            self.candidate = None;
            self.committed = MonitorState::Offline;
            Some(MonitorState::Offline)
        } else {
            None
        }
    }

    /// Roll the committed state back after an aborted transition.
    pub fn force(&mut self, state: MonitorState) {
        self.candidate = None;
        self.committed = state;
    }

    #[must_use]
    pub fn committed(&self) -> MonitorState {
        self.committed
    }
}

pub struct LevelAdjuster {
    engine: Arc<Engine>,
    lpc: Arc<LevelCollector>,
    cfg: ConfigPlanAdjuster,
    plans: HashMap<String, Plan>,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl LevelAdjuster {
    #[must_use]
    pub fn new(
        engine: Arc<Engine>,
        lpc: Arc<LevelCollector>,
        cfg: ConfigPlanAdjuster,
        plans: Vec<Plan>,
        events: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Self {
        let plans = plans.into_iter().map(|p| (p.name.clone(), p)).collect();
        Self {
            engine,
            lpc,
            cfg,
            plans,
            events,
            cancel,
        }
    }

    /// The poll loop. Runs until cancelled.
    pub async fn run(&self) {
        let mut debounce = Debounce::new(self.cfg.debounce, self.cfg.offline_after);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(self.cfg.poll_interval) => {}
            }

            let transition = match self.poll().await {
                Ok(obs) => debounce.observe(decide(obs)),
                Err(e) => {
                    debug!(
                        monitor_id = self.engine.monitor_id(),
                        error = %format!("{e:#}"),
                        "role poll failed"
                    );
                    debounce.observe_failure()
                }
            };

            if let Some(new_state) = transition {
                let old = self.engine.state();
                if !self.apply(old, new_state).await {
                    debounce.force(old);
                }
            }
        }
    }

    async fn poll(&self) -> Result<Observation> {
        let pool = self.engine.pool();
        let read_only: i64 = sqlx::query_scalar("SELECT @@GLOBAL.read_only")
            .fetch_one(pool)
            .await?;

        // Newer servers dropped the old statement; older ones don't know
        // the new one. Try both before counting the poll as failed.
        let rows = match sqlx::query("SHOW REPLICA STATUS").fetch_all(pool).await {
            Ok(rows) => rows,
            Err(_) => sqlx::query("SHOW SLAVE STATUS").fetch_all(pool).await?,
        };
        let replica_running = rows.iter().any(|row| {
            let io: Option<String> = row
                .try_get("Replica_IO_Running")
                .or_else(|_| row.try_get("Slave_IO_Running"))
                .ok();
            matches!(io.as_deref(), Some("Yes" | "Connecting"))
        });

        Ok(Observation {
            read_only: read_only != 0,
            replica_running,
        })
    }

    /// Commit a state transition: resolve the state's plan, swap it in via
    /// the LPC, and stamp the engine. Returns false when the plan change
    /// failed and the transition was aborted.
    async fn apply(&self, old: MonitorState, new_state: MonitorState) -> bool {
        if old == new_state {
            return true;
        }
        self.events.send(Event::new(
            event::STATE_CHANGE_BEGIN,
            self.engine.monitor_id(),
            format!("{} -> {}", old.as_str(), new_state.as_str()),
        ));

        self.engine.set_state(new_state);

        // Unmapped states inherit the active plan.
        let plan_name = self
            .cfg
            .plans
            .get(new_state.as_str())
            .or_else(|| self.cfg.plans.get(MonitorState::Active.as_str()));

        if let Some(plan_name) = plan_name {
            let current = self.engine.plan().await.map(|p| p.name.clone());
            if current.as_deref() != Some(plan_name.as_str()) {
                let Some(plan) = self.plans.get(plan_name) else {
                    warn!(
                        monitor_id = self.engine.monitor_id(),
                        plan = %plan_name,
                        "state maps to an unknown plan, keeping current plan"
                    );
                    self.events.send(Event::new(
                        event::STATE_CHANGE_END,
                        self.engine.monitor_id(),
                        new_state.as_str(),
                    ));
                    return true;
                };
                if let Err(e) = self.lpc.change_plan(plan.clone()).await {
                    self.engine.set_state(old);
                    self.events.send(
                        Event::new(
                            event::STATE_CHANGE_ABORT,
                            self.engine.monitor_id(),
                            format!("{} -> {}", old.as_str(), new_state.as_str()),
                        )
                        .with_error(&e),
                    );
                    return false;
                }
            }
        }

        self.events.send(Event::new(
            event::STATE_CHANGE_END,
            self.engine.monitor_id(),
            new_state.as_str(),
        ));
        true
    }
}
