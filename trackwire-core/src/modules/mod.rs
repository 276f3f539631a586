//! Module registry
//!
//! The registry holds the configured collectors and dispatchers, keyed by
//! module id and kept in registration order:
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!  TrackRequest ─►│ ModuleRegistry               │
//!                 │  ├─ collect()   (Collector)  │──► context payload
//!                 │  ├─ validators  (Validator)  │──► drop / purge / queue
//!                 │  └─ dispatch()  (Dispatcher) │──► fan-out, one completion
//!                 └──────────────────────────────┘
//! ```
//!
//! A module may be a collector, a dispatcher, or both; the capabilities are
//! fixed when the module is registered.

mod fanout;

use std::sync::{Arc, RwLock, Weak};

use crate::error::DispatchError;
use crate::types::{DispatchRequest, ModuleResponse, Payload, TrackOutcome, TrackRequest};

use fanout::Fanout;

/// Callback a dispatcher fires exactly once per request it accepts
pub type ModuleCompletion = Box<dyn FnOnce(ModuleResponse) + Send + 'static>;

/// Observer for orchestration-level error reports
pub type ErrorObserver = Box<dyn Fn(&str) + Send + Sync + 'static>;

/// Contributes read-only context data to every event
pub trait Collector: Send + Sync {
    /// Unique module id
    fn id(&self) -> &str;

    /// Data to merge into the next event, `None` to contribute nothing
    fn data(&self) -> Option<Payload>;
}

/// Forwards requests to a destination
pub trait Dispatcher: Send + Sync {
    /// Unique module id
    fn id(&self) -> &str;

    /// Deliver a request. `completion` must be invoked exactly once, from
    /// any thread, when the dispatcher is done with the request.
    fn dynamic_track(&self, request: DispatchRequest, completion: ModuleCompletion);
}

/// Gate consulted before a request is queued or dispatched
pub trait DispatchValidator: Send + Sync {
    fn id(&self) -> &str;

    /// Hold the request in the persistent queue
    fn should_queue(&self, _request: &TrackRequest) -> bool {
        false
    }

    /// Discard the request without dispatching it
    fn should_drop(&self, _request: &TrackRequest) -> bool {
        false
    }

    /// Discard everything already queued
    fn should_purge(&self, _request: &TrackRequest) -> bool {
        false
    }
}

/// Upward notification channel used by the orchestrator and dispatchers
pub trait ModuleDelegate: Send + Sync {
    /// Send a request on to the dispatchers
    fn request_forward(&self, request: DispatchRequest);

    /// Report an orchestration-level failure that has no request to attach to
    fn report_error(&self, message: &str);
}

/// Capabilities of one registered module
#[derive(Clone, Default)]
pub struct ModuleEntry {
    pub collector: Option<Arc<dyn Collector>>,
    pub dispatcher: Option<Arc<dyn Dispatcher>>,
}

/// Ordered set of modules and validators
#[derive(Default)]
pub struct ModuleRegistry {
    modules: RwLock<Vec<(String, ModuleEntry)>>,
    validators: RwLock<Vec<Arc<dyn DispatchValidator>>>,
    error_observers: RwLock<Vec<ErrorObserver>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the capabilities for `id`
    pub fn register(&self, id: impl Into<String>, entry: ModuleEntry) {
        let id = id.into();
        let mut modules = self.modules.write().unwrap_or_else(|e| e.into_inner());
        match modules.iter_mut().find(|(existing, _)| *existing == id) {
            Some((_, slot)) => *slot = entry,
            None => modules.push((id.clone(), entry)),
        }
        tracing::debug!(module = %id, "Registered module");
    }

    pub fn register_collector(&self, collector: Arc<dyn Collector>) {
        let id = collector.id().to_string();
        let mut entry = self.entry(&id).unwrap_or_default();
        entry.collector = Some(collector);
        self.register(id, entry);
    }

    pub fn register_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) {
        let id = dispatcher.id().to_string();
        let mut entry = self.entry(&id).unwrap_or_default();
        entry.dispatcher = Some(dispatcher);
        self.register(id, entry);
    }

    pub fn register_validator(&self, validator: Arc<dyn DispatchValidator>) {
        self.validators
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(validator);
    }

    /// Remove a module and all its capabilities
    pub fn remove(&self, id: &str) -> bool {
        let mut modules = self.modules.write().unwrap_or_else(|e| e.into_inner());
        let before = modules.len();
        modules.retain(|(existing, _)| existing != id);
        modules.len() != before
    }

    pub fn entry(&self, id: &str) -> Option<ModuleEntry> {
        self.modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(existing, _)| existing == id)
            .map(|(_, entry)| entry.clone())
    }

    /// Registered module ids in registration order
    pub fn module_ids(&self) -> Vec<String> {
        self.modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn dispatchers(&self) -> Vec<Arc<dyn Dispatcher>> {
        self.modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|(_, entry)| entry.dispatcher.clone())
            .collect()
    }

    fn collectors(&self) -> Vec<Arc<dyn Collector>> {
        self.modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|(_, entry)| entry.collector.clone())
            .collect()
    }

    pub fn validators(&self) -> Vec<Arc<dyn DispatchValidator>> {
        self.validators
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Merge every collector's contribution; later registrations win
    pub fn collect(&self) -> Payload {
        let mut data = Payload::new();
        for collector in self.collectors() {
            if let Some(contribution) = collector.data() {
                data.extend(contribution);
            }
        }
        data
    }

    /// Fan a request out to every dispatcher.
    ///
    /// Each dispatcher gets its own copy tagged with its module id. The
    /// original completion fires once, after the last dispatcher reports.
    pub fn dispatch(&self, mut request: DispatchRequest) {
        let dispatchers = self.dispatchers();
        if dispatchers.is_empty() {
            tracing::warn!(
                events = request.event_count(),
                "No dispatchers registered, dropping request"
            );
            request.complete(TrackOutcome::failure(DispatchError::Dropped(
                "no dispatchers registered".to_string(),
            )));
            return;
        }

        let completion = request.take_completion();
        let fanout = Fanout::new(dispatchers.len(), completion);

        for dispatcher in dispatchers {
            let copy = request.detached().with_dispatch_service(dispatcher.id());
            let fanout = Arc::clone(&fanout);
            dispatcher.dynamic_track(copy, Box::new(move |response| fanout.record(response)));
        }
    }

    /// Subscribe to orchestration error reports
    pub fn on_error(&self, observer: ErrorObserver) {
        self.error_observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    fn notify_error(&self, message: &str) {
        tracing::error!(message, "Module reported an error");
        for observer in self
            .error_observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            observer(message);
        }
    }

    /// Delegate that forwards into this registry without keeping it alive.
    ///
    /// Dispatchers owned by the registry hold this, so it must not be a
    /// strong reference.
    pub fn delegate(self: &Arc<Self>) -> Arc<dyn ModuleDelegate> {
        Arc::new(RegistryDelegate {
            registry: Arc::downgrade(self),
        })
    }
}

struct RegistryDelegate {
    registry: Weak<ModuleRegistry>,
}

impl ModuleDelegate for RegistryDelegate {
    fn request_forward(&self, request: DispatchRequest) {
        match self.registry.upgrade() {
            Some(registry) => registry.dispatch(request),
            None => request.complete(TrackOutcome::failure(DispatchError::Dropped(
                "module registry shut down".to_string(),
            ))),
        }
    }

    fn report_error(&self, message: &str) {
        match self.registry.upgrade() {
            Some(registry) => registry.notify_error(message),
            None => tracing::error!(message, "Error reported after registry shut down"),
        }
    }
}
