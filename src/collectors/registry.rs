//! The domain-to-factory registry.
//!
//! A process-wide instance (see [`global`]) comes pre-loaded with the
//! built-in collectors; external code plugs in new domains with
//! [`CollectorRegistry::register`]. Standalone instances can be constructed
//! for tests or embedding.

use anyhow::{Result, anyhow, bail};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::{Collector, CollectorFactory, FactoryArgs};
use crate::event::{self, Event, EventSink, TracingEvents};

/// Domains served by the built-in factory.
pub const BUILTIN_DOMAINS: &[&str] = &[
    "status.global",
    "var.global",
    "size.data",
    "size.binlogs",
    "innodb",
    "io.table",
];

pub struct CollectorRegistry {
    strict: AtomicBool,
    factories: Mutex<HashMap<String, Arc<dyn CollectorFactory>>>,
    events: Mutex<Arc<dyn EventSink>>,
}

impl CollectorRegistry {
    /// An empty, non-strict registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            strict: AtomicBool::new(false),
            factories: Mutex::new(HashMap::new()),
            events: Mutex::new(Arc::new(TracingEvents)),
        }
    }

    /// A registry pre-loaded with the built-in collector factory.
    ///
    /// # Panics
    ///
    /// Never panics: registering built-ins into an empty non-strict registry
    /// cannot fail.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        let builtin: Arc<dyn CollectorFactory> = Arc::new(BuiltinFactory);
        for domain in BUILTIN_DOMAINS {
            registry
                .register(domain, Arc::clone(&builtin))
                .expect("built-in registration cannot fail");
        }
        registry
    }

    /// In strict mode, registering an already-bound domain fails instead of
    /// overwriting.
    pub fn set_strict(&self, strict: bool) {
        self.strict.store(strict, Ordering::SeqCst);
    }

    /// Replace the event receiver used for `register-metrics` emissions.
    pub fn set_events(&self, events: Arc<dyn EventSink>) {
        let mut guard = lock(&self.events);
        *guard = events;
    }

    /// Bind `domain` to `factory`. Overwrites an existing binding unless the
    /// registry is strict.
    ///
    /// # Errors
    ///
    /// Returns an error when strict and the domain is already registered.
    pub fn register(&self, domain: &str, factory: Arc<dyn CollectorFactory>) -> Result<()> {
        {
            let mut factories = lock(&self.factories);
            if factories.contains_key(domain) && self.strict.load(Ordering::SeqCst) {
                bail!("{domain} already registered");
            }
            factories.insert(domain.to_string(), factory);
        }
        let events = lock(&self.events).clone();
        events.send(Event::new(event::REGISTER_METRICS, "", domain));
        Ok(())
    }

    /// All registered domain names, sorted.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let factories = lock(&self.factories);
        let mut names: Vec<String> = factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Construct a collector for `domain` with a previously registered
    /// factory.
    ///
    /// # Errors
    ///
    /// Returns an error when the domain is unregistered or the factory
    /// fails.
    pub fn make(&self, domain: &str, args: &FactoryArgs) -> Result<Box<dyn Collector>> {
        let factory = {
            let factories = lock(&self.factories);
            factories
                .get(domain)
                .cloned()
                .ok_or_else(|| anyhow!("{domain} not registered"))?
        };
        factory.make(domain, args)
    }
}

impl Default for CollectorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// A poisoned registry mutex means a factory panicked while holding the lock;
// the map itself is still usable.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

static GLOBAL: Lazy<Arc<CollectorRegistry>> =
    Lazy::new(|| Arc::new(CollectorRegistry::with_builtins()));

/// The process-wide registry, pre-loaded with the built-in collectors.
#[must_use]
pub fn global() -> Arc<CollectorRegistry> {
    Arc::clone(&GLOBAL)
}

/// The built-in factory: makes collectors for the closed set in
/// [`BUILTIN_DOMAINS`].
pub struct BuiltinFactory;

impl CollectorFactory for BuiltinFactory {
    fn make(&self, domain: &str, args: &FactoryArgs) -> Result<Box<dyn Collector>> {
        match domain {
            "status.global" => Ok(Box::new(super::status::Global::new(args))),
            "var.global" => Ok(Box::new(super::sysvar::Global::new(args))),
            "size.data" => Ok(Box::new(super::size::Data::new(args))),
            "size.binlogs" => Ok(Box::new(super::size::Binlogs::new(args))),
            "innodb" => Ok(Box::new(super::innodb::InnodbMetrics::new(args))),
            "io.table" => Ok(Box::new(super::iotable::TableIo::new(args))),
            _ => bail!("collector for domain {domain} not registered"),
        }
    }
}
