//! Idling resources and the registry that aggregates them.
//!
//! An [`IdlingResource`] is anything the application can point at and say
//! "this is still working": an in-flight request, a running animation, a
//! queue that has not drained. The [`IdlingResourceRegistry`] keeps a
//! name-keyed set of them and answers a single question, "is everything idle
//! right now?", for the synchronizer.
//!
//! The registry never owns a resource. It keeps a [`Weak`] reference, so a
//! resource whose owner drops it simply disappears from the idle computation.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use quiesce_core::idling::{CountingResource, IdlingResourceRegistry};
//!
//! let registry = IdlingResourceRegistry::new();
//! let network = Arc::new(CountingResource::new("network"));
//! registry.register(&network);
//!
//! network.increment();
//! assert!(!registry.is_everything_idle());
//! assert_eq!(registry.busy_resource_names(), vec!["network".to_string()]);
//!
//! network.decrement();
//! assert!(registry.is_everything_idle());
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Something that can report whether it is currently busy.
///
/// Implementations are queried from the UI thread and, for diagnostics, from
/// driver-facing threads, so `is_idle` must be cheap and must not block.
pub trait IdlingResource: Send + Sync {
    /// Unique name used as the registry key.
    fn name(&self) -> &str;

    /// Short category shown in diagnostics (e.g. `"network"`, `"timer"`).
    fn kind(&self) -> &str {
        "resource"
    }

    /// Returns `true` if the resource has no pending work.
    fn is_idle(&self) -> bool;
}

/// Diagnostic record for a resource or activity that is keeping the app busy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyResource {
    pub name: String,
    pub kind: String,
}

impl BusyResource {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
        }
    }
}

impl std::fmt::Display for BusyResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.kind)
    }
}

/// Name-keyed set of idling resources.
///
/// Registration is last-write-wins: registering a second resource under an
/// existing name replaces the first and emits a warning. Queries take a
/// snapshot of the live entries under the lock and evaluate them after the
/// lock is released, so a resource may safely touch the registry from its own
/// `is_idle`.
#[derive(Default)]
pub struct IdlingResourceRegistry {
    entries: RwLock<BTreeMap<String, Weak<dyn IdlingResource>>>,
}

impl IdlingResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource under its [`name`](IdlingResource::name).
    ///
    /// The registry holds only a weak reference; the caller keeps the
    /// resource alive. Returns `true` if an entry with the same name was
    /// replaced.
    pub fn register<R: IdlingResource + 'static>(&self, resource: &Arc<R>) -> bool {
        let dynamic: Arc<dyn IdlingResource> = resource.clone();
        self.register_dyn(&dynamic)
    }

    /// [`register`](Self::register) for a resource already behind a trait
    /// object.
    pub fn register_dyn(&self, resource: &Arc<dyn IdlingResource>) -> bool {
        let name = resource.name().to_string();
        let mut entries = self.entries.write();
        entries.retain(|_, weak| weak.strong_count() > 0);
        let replaced = entries.insert(name.clone(), Arc::downgrade(resource)).is_some();
        if replaced {
            warn!(name = %name, "idling resource registered twice, replacing previous entry");
        } else {
            debug!(name = %name, kind = resource.kind(), "idling resource registered");
        }
        replaced
    }

    /// Removes the resource registered under `name`.
    ///
    /// Returns `true` if a live entry was removed.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self
            .entries
            .write()
            .remove(name)
            .map_or(false, |weak| weak.strong_count() > 0);
        debug!(name, removed, "idling resource unregistered");
        removed
    }

    /// Returns `true` if every live resource reports idle.
    ///
    /// Stops at the first busy resource.
    pub fn is_everything_idle(&self) -> bool {
        self.snapshot().iter().all(|resource| resource.is_idle())
    }

    /// Names of all resources that are busy right now, in name order.
    pub fn busy_resource_names(&self) -> Vec<String> {
        self.busy_resources().into_iter().map(|busy| busy.name).collect()
    }

    /// Full diagnostic set of busy resources, in name order.
    pub fn busy_resources(&self) -> Vec<BusyResource> {
        self.snapshot()
            .iter()
            .filter(|resource| !resource.is_idle())
            .map(|resource| BusyResource::new(resource.name(), resource.kind()))
            .collect()
    }

    /// Returns `true` if a live resource is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .get(name)
            .map_or(false, |weak| weak.strong_count() > 0)
    }

    /// Number of live registered resources.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every registration.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    fn snapshot(&self) -> Vec<Arc<dyn IdlingResource>> {
        self.entries.read().values().filter_map(Weak::upgrade).collect()
    }
}

impl std::fmt::Debug for IdlingResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdlingResourceRegistry")
            .field("names", &self.entries.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Stock resources
// ---------------------------------------------------------------------------

/// Busy while its counter is above zero.
///
/// Suited to work that can overlap, such as concurrent network requests.
#[derive(Debug)]
pub struct CountingResource {
    name: String,
    kind: String,
    count: Arc<AtomicUsize>,
}

impl CountingResource {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_kind(name, "counter")
    }

    pub fn with_kind(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Marks one more unit of work as in flight.
    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Marks one unit of work as finished. Extra calls are ignored.
    pub fn decrement(&self) {
        let previous = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous.is_err() {
            warn!(name = %self.name, "counting resource decremented below zero");
        }
    }

    /// Current number of in-flight units.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Increments now and decrements when the guard drops.
    pub fn busy(&self) -> CountingGuard {
        self.increment();
        CountingGuard {
            count: Arc::clone(&self.count),
        }
    }
}

impl IdlingResource for CountingResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn is_idle(&self) -> bool {
        self.count() == 0
    }
}

/// Scope guard returned by [`CountingResource::busy`].
#[must_use = "the resource goes idle again as soon as the guard is dropped"]
pub struct CountingGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for CountingGuard {
    fn drop(&mut self) {
        let _ = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

/// Busy until a deadline passes.
///
/// Models work with a known duration: timers, animations, debounce windows.
#[derive(Debug)]
pub struct TimedResource {
    name: String,
    kind: String,
    deadline: Mutex<Option<Instant>>,
}

impl TimedResource {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_kind(name, "timer")
    }

    pub fn with_kind(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            deadline: Mutex::new(None),
        }
    }

    /// Stays busy for `duration` from now, replacing any earlier deadline.
    pub fn busy_for(&self, duration: Duration) {
        *self.deadline.lock() = Some(Instant::now() + duration);
    }

    /// Pushes the deadline out to at least `duration` from now.
    pub fn extend(&self, duration: Duration) {
        let candidate = Instant::now() + duration;
        let mut deadline = self.deadline.lock();
        if deadline.map_or(true, |current| current < candidate) {
            *deadline = Some(candidate);
        }
    }

    /// Goes idle immediately.
    pub fn finish(&self) {
        *self.deadline.lock() = None;
    }
}

impl IdlingResource for TimedResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn is_idle(&self) -> bool {
        self.deadline
            .lock()
            .map_or(true, |deadline| Instant::now() >= deadline)
    }
}

/// Adapts a closure into an idling resource.
pub struct FnResource {
    name: String,
    kind: String,
    check: Box<dyn Fn() -> bool + Send + Sync>,
}

impl FnResource {
    /// `check` returns `true` when the resource is idle.
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        check: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            check: Box::new(check),
        }
    }
}

impl IdlingResource for FnResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn is_idle(&self) -> bool {
        (self.check)()
    }
}

impl std::fmt::Debug for FnResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnResource")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}
