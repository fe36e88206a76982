//! Sinks send metric batches to external destinations.
//!
//! Each produced batch is dispatched to every sink on its own task with a
//! budget bounded by the level's frequency. Sinks are independent: one
//! sink's failure or slowness never delays the others, and failures are not
//! retried here (retry is the sink's concern).

use anyhow::Result;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::event::{self, Event, EventSink};
use crate::metrics::Metrics;

/// An external destination for metric batches. Send must respect the
/// context budget; batches must not be mutated.
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    /// # Errors
    ///
    /// Returns an error when delivery fails; the caller emits an event and
    /// moves on.
    fn send<'a>(&'a self, metrics: &'a Metrics) -> BoxFuture<'a, Result<()>>;

    /// One-line status for admin introspection.
    fn status(&self) -> String;
}

/// Dispatch one batch to every sink, each on its own task bounded by
/// `budget`. Outstanding sends are tracked by `tracker` so shutdown can
/// drain them.
pub fn fan_out(
    tracker: &TaskTracker,
    sinks: &[Arc<dyn Sink>],
    metrics: Metrics,
    budget: Duration,
    events: &Arc<dyn EventSink>,
) {
    let metrics = Arc::new(metrics);
    for sink in sinks {
        let sink = Arc::clone(sink);
        let metrics = Arc::clone(&metrics);
        let events = Arc::clone(events);
        tracker.spawn(async move {
            match tokio::time::timeout(budget, sink.send(&metrics)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => events.send(
                    Event::new(event::SINK_SEND_ERROR, &metrics.monitor_id, sink.name())
                        .with_error(&e),
                ),
                Err(_) => events.send(Event::new(
                    event::SINK_ERROR,
                    &metrics.monitor_id,
                    format!("{}: send timed out after {budget:?}", sink.name()),
                )),
            }
        });
    }
}

/// The built-in development sink: writes batch summaries to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl Sink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn send<'a>(&'a self, metrics: &'a Metrics) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let took = metrics
                .end
                .signed_duration_since(metrics.begin)
                .num_milliseconds();
            info!(
                monitor_id = %metrics.monitor_id,
                plan = %metrics.plan,
                level = %metrics.level,
                state = %metrics.state,
                values = metrics.len(),
                took_ms = took,
                "metrics"
            );
            Ok(())
        })
    }

    fn status(&self) -> String {
        "ok".to_string()
    }
}
