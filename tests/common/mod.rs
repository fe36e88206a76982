#![allow(dead_code)]

use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use mysqlmon::collectors::{
    CollectError, CollectResult, Collector, CollectorFactory, FactoryArgs, Help,
};
use mysqlmon::event::{Event, EventSink};
use mysqlmon::metrics::{MetricValue, Metrics};
use mysqlmon::plan::{Domain, Level, Plan};
use mysqlmon::sink::Sink;
use sqlx::MySqlPool;
use sqlx::mysql::MySqlPoolOptions;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// A pool that never connects; mock collectors don't touch it.
pub fn lazy_pool() -> MySqlPool {
    MySqlPoolOptions::new()
        .connect_lazy("mysql://root@127.0.0.1:3306/mysql")
        .expect("lazy pool")
}

/// Build a plan from `(level, freq, domains)` triples.
pub fn plan_with(name: &str, levels: &[(&str, Duration, &[&str])]) -> Plan {
    let levels = levels
        .iter()
        .map(|(level_name, freq, domains)| {
            let collect: HashMap<String, Domain> = domains
                .iter()
                .map(|d| ((*d).to_string(), Domain::default()))
                .collect();
            (
                (*level_name).to_string(),
                Level {
                    freq: *freq,
                    collect,
                },
            )
        })
        .collect();
    Plan {
        name: name.to_string(),
        levels,
    }
}

/// Scripted collector behavior for engine and LPC tests.
#[derive(Clone)]
pub enum MockBehavior {
    Values(Vec<MetricValue>),
    Sleep(Duration, Vec<MetricValue>),
    Fail,
    FailPartial(Vec<MetricValue>),
    Panic,
    PrepareFail,
}

pub struct MockCollector {
    domain: &'static str,
    behavior: MockBehavior,
}

impl Collector for MockCollector {
    fn domain(&self) -> &'static str {
        self.domain
    }

    fn help(&self) -> Help {
        Help {
            domain: self.domain,
            description: "scripted test collector",
            options: &[],
        }
    }

    fn prepare<'a>(&'a mut self, _plan: &'a Plan) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if matches!(self.behavior, MockBehavior::PrepareFail) {
                return Err(anyhow!("mock prepare failure"));
            }
            Ok(())
        })
    }

    fn collect<'a>(&'a self, _level_name: &'a str) -> BoxFuture<'a, CollectResult> {
        Box::pin(async move {
            match &self.behavior {
                MockBehavior::Values(values) => Ok(values.clone()),
                MockBehavior::PrepareFail => Ok(Vec::new()),
                MockBehavior::Sleep(duration, values) => {
                    tokio::time::sleep(*duration).await;
                    Ok(values.clone())
                }
                MockBehavior::Fail => Err(CollectError::new(anyhow!("mock collect failure"))),
                MockBehavior::FailPartial(partial) => Err(CollectError::with_partial(
                    partial.clone(),
                    anyhow!("mock partial failure"),
                )),
                MockBehavior::Panic => panic!("mock collector panic"),
            }
        })
    }
}

pub struct MockFactory {
    pub domain: &'static str,
    pub behavior: MockBehavior,
}

impl CollectorFactory for MockFactory {
    fn make(&self, _domain: &str, _args: &FactoryArgs) -> Result<Box<dyn Collector>> {
        Ok(Box::new(MockCollector {
            domain: self.domain,
            behavior: self.behavior.clone(),
        }))
    }
}

/// Records every event for later assertions.
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<(&'static str, String)>>,
}

impl RecordingEvents {
    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .expect("events lock")
            .iter()
            .filter(|(n, _)| *n == name)
            .count()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .expect("events lock")
            .iter()
            .map(|(n, _)| *n)
            .collect()
    }
}

impl EventSink for RecordingEvents {
    fn send(&self, event: Event) {
        self.events
            .lock()
            .expect("events lock")
            .push((event.name, event.data));
    }
}

/// Records every batch it receives.
#[derive(Default)]
pub struct RecordingSink {
    batches: Mutex<Vec<Metrics>>,
}

impl RecordingSink {
    pub fn batches(&self) -> Vec<Metrics> {
        self.batches.lock().expect("batches lock").clone()
    }

    pub fn drain(&self) -> Vec<Metrics> {
        std::mem::take(&mut *self.batches.lock().expect("batches lock"))
    }
}

impl Sink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn send<'a>(&'a self, metrics: &'a Metrics) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.batches
                .lock()
                .expect("batches lock")
                .push(metrics.clone());
            Ok(())
        })
    }

    fn status(&self) -> String {
        format!("{} batches", self.batches.lock().expect("batches lock").len())
    }
}
