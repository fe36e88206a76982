//! Named event emissions for observability.
//!
//! The core reports every interesting state transition through a
//! non-blocking [`EventSink`] hook: prepare success and error, LPC
//! paused/running/blocked, sink errors, and so on. The hook is fire and
//! forget; emitters never block on it.

use chrono::{DateTime, Utc};

// Monitor lifecycle
pub const MONITOR_STARTED: &str = "monitor-started";
pub const MONITOR_STOPPED: &str = "monitor-stopped";
pub const MONITOR_ERROR: &str = "monitor-error";
pub const MONITOR_PANIC: &str = "monitor-panic";
pub const MONITOR_CONNECTING: &str = "connecting";
pub const MONITOR_CONNECTED: &str = "connected";

// Level plan collector
pub const LPC_RUNNING: &str = "lpc-running";
pub const LPC_PAUSED: &str = "lpc-paused";
pub const LPC_BLOCKED: &str = "lpc-blocked";
pub const LPC_PANIC: &str = "lpc-panic";

// Engine
pub const ENGINE_PREPARE: &str = "engine-prepare";
pub const ENGINE_PREPARE_SUCCESS: &str = "engine-prepare-success";
pub const ENGINE_PREPARE_ERROR: &str = "engine-prepare-error";
pub const ENGINE_COLLECT_ERROR: &str = "engine-collect-error";

// Plan changes driven by the level plan adjuster
pub const CHANGE_PLAN: &str = "change-plan";
pub const CHANGE_PLAN_SUCCESS: &str = "change-plan-success";
pub const CHANGE_PLAN_ERROR: &str = "change-plan-error";
pub const STATE_CHANGE_BEGIN: &str = "state-change-begin";
pub const STATE_CHANGE_END: &str = "state-change-end";
pub const STATE_CHANGE_ABORT: &str = "state-change-abort";
// Historical name, kept as-is for consumers that match on it.
pub const REPL_SOURCE_CHANGE: &str = "repl-soruce-change";

// Collectors and sinks
pub const COLLECTOR_ERROR: &str = "collector-error";
pub const COLLECTOR_PANIC: &str = "collector-panic";
pub const REGISTER_METRICS: &str = "register-metrics";
pub const SINK_ERROR: &str = "sink-error";
pub const SINK_SEND_ERROR: &str = "sink-send-error";

/// One emitted event.
#[derive(Clone, Debug)]
pub struct Event {
    pub name: &'static str,
    pub monitor_id: String,
    pub data: String,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl Event {
    #[must_use]
    pub fn new(name: &'static str, monitor_id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name,
            monitor_id: monitor_id.into(),
            data: data.into(),
            error: None,
            at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_error(mut self, error: &anyhow::Error) -> Self {
        self.error = Some(format!("{error:#}"));
        self
    }
}

/// Receives events from the core. Implementations must not block: the
/// emitters run on hot paths (the engine's collect loop, sink dispatch) and
/// call [`EventSink::send`] inline.
pub trait EventSink: Send + Sync {
    fn send(&self, event: Event);
}

/// Default receiver: writes events to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEvents;

impl EventSink for TracingEvents {
    fn send(&self, event: Event) {
        match &event.error {
            Some(err) => tracing::warn!(
                event = event.name,
                monitor_id = %event.monitor_id,
                data = %event.data,
                error = %err,
                "monitor event"
            ),
            None => tracing::info!(
                event = event.name,
                monitor_id = %event.monitor_id,
                data = %event.data,
                "monitor event"
            ),
        }
    }
}
