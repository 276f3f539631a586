//! Pipeline entry point
//!
//! [`Tracker`] owns the shared pieces and runs every track call through the
//! same steps:
//!
//! 1. refresh the session
//! 2. merge collector output and event data into the payload
//! 3. consult validators (drop, purge, force queue)
//! 4. hand the request to the dispatch orchestrator

use std::sync::Arc;

use serde_json::Value;
use tokio::runtime::Handle;

use crate::config::Config;
use crate::connectivity::{ConnectionStatus, Connectivity};
use crate::data::{EventDataManager, SessionRefresh};
use crate::dispatchers::CollectDispatcher;
use crate::error::{DispatchError, Result};
use crate::modules::ModuleRegistry;
use crate::queue::{DispatchQueueModule, PersistentQueue, QueuePolicy, TrackDecision};
use crate::storage::{DiskStore, SqliteStore};
use crate::tagmanagement::{TagManagementDispatcher, TagRuntime};
use crate::types::{keys, BatchTrackRequest, Payload, TrackOutcome, TrackRequest};

/// Validator verdict for one request or batch
enum Gate {
    Drop(String),
    Pass { force_queue: bool },
}

pub struct Tracker {
    config: Config,
    registry: Arc<ModuleRegistry>,
    data: Arc<EventDataManager>,
    queue: Arc<DispatchQueueModule>,
    connectivity: Arc<Connectivity>,
}

impl Tracker {
    /// Assemble the pipeline on top of an existing store and registry
    pub fn new(config: Config, store: Arc<dyn DiskStore>, registry: Arc<ModuleRegistry>) -> Self {
        let data = Arc::new(EventDataManager::new(
            Arc::clone(&store),
            config.session.timeout(),
        ));

        let queue = Arc::new(DispatchQueueModule::new(
            QueuePolicy::from_config(&config),
            PersistentQueue::new(store, config.queue.max_queue_size),
            registry.delegate(),
        ));
        registry.register_validator(queue.clone());

        let connectivity = Arc::new(Connectivity::default());
        let weak_queue = Arc::downgrade(&queue);
        connectivity.subscribe(Box::new(move |_previous, current| {
            if let Some(queue) = weak_queue.upgrade() {
                queue.on_connectivity_change(current);
            }
        }));

        Self {
            config,
            registry,
            data,
            queue,
            connectivity,
        }
    }

    /// Open the SQLite store at the configured path with an empty registry
    pub fn open(config: Config) -> Result<Self> {
        let path = config.database_path();
        let store = SqliteStore::open(&path)?;
        tracing::info!(path = %path.display(), "Opened trackwire store");
        Ok(Self::new(config, Arc::new(store), Arc::new(ModuleRegistry::new())))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn data(&self) -> &Arc<EventDataManager> {
        &self.data
    }

    pub fn connectivity(&self) -> &Arc<Connectivity> {
        &self.connectivity
    }

    // ============================================
    // Dispatchers
    // ============================================

    /// Register the HTTP collect dispatcher if configured.
    ///
    /// Returns whether a dispatcher was registered.
    pub fn enable_collect(&self, handle: Handle) -> Result<bool> {
        if !self.config.collect.is_ready() {
            return Ok(false);
        }
        let dispatcher = CollectDispatcher::new(&self.config.collect, handle)?
            .with_delegate(self.registry.delegate());
        self.registry.register_dispatcher(Arc::new(dispatcher));
        Ok(true)
    }

    /// Register the tag management dispatcher on the host's runtime if configured
    pub fn enable_tag_management(
        &self,
        runtime: Arc<dyn TagRuntime>,
    ) -> Option<Arc<TagManagementDispatcher>> {
        if !self.config.tag_management.enabled {
            return None;
        }
        let dispatcher = Arc::new(TagManagementDispatcher::new(
            &self.config.tag_management,
            runtime,
        ));
        self.registry.register_dispatcher(dispatcher.clone());
        Some(dispatcher)
    }

    // ============================================
    // Tracking
    // ============================================

    pub fn track(&self, request: TrackRequest) -> TrackDecision {
        let mut request = self.enrich(request);

        match self.gate(&[&request], false) {
            Gate::Drop(reason) => {
                tracing::debug!(event = ?request.event_name(), %reason, "Validator dropped request");
                if let Some(completion) = request.take_completion() {
                    completion(TrackOutcome::failure(DispatchError::Dropped(reason)));
                }
                TrackDecision::Dropped
            }
            Gate::Pass { force_queue } => self.queue.track(request, force_queue),
        }
    }

    /// Track several events as one ordered batch with a shared completion.
    ///
    /// Validators see every event; one drop verdict drops the whole batch.
    pub fn track_batch(&self, mut batch: BatchTrackRequest) -> TrackDecision {
        batch.requests = std::mem::take(&mut batch.requests)
            .into_iter()
            .map(|request| self.enrich(request))
            .collect();

        let requests: Vec<&TrackRequest> = batch.requests.iter().collect();
        match self.gate(&requests, true) {
            Gate::Drop(reason) => {
                tracing::debug!(events = batch.len(), %reason, "Validator dropped batch");
                if let Some(completion) = batch.take_completion() {
                    completion(TrackOutcome::failure(DispatchError::Dropped(reason)));
                }
                TrackDecision::Dropped
            }
            Gate::Pass { force_queue } => self.queue.track_batch(batch, force_queue),
        }
    }

    /// Run every validator over `requests`.
    ///
    /// For batches the dispatch queue's own batching policy is skipped; the
    /// caller already grouped the events.
    fn gate(&self, requests: &[&TrackRequest], batch: bool) -> Gate {
        let mut force_queue = false;
        for validator in self.registry.validators() {
            let own_policy = batch && validator.id() == crate::queue::MODULE_ID;
            let mut purge = false;
            for request in requests {
                if validator.should_drop(request) {
                    return Gate::Drop(format!("dropped by {}", validator.id()));
                }
                purge |= validator.should_purge(request);
                if !own_policy {
                    force_queue |= validator.should_queue(request);
                }
            }
            if purge {
                tracing::info!(validator = validator.id(), "Validator purged dispatch queue");
                self.queue.clear_queue();
            }
        }
        Gate::Pass { force_queue }
    }

    fn enrich(&self, request: TrackRequest) -> TrackRequest {
        let started = self.data.refresh_session() == SessionRefresh::Started;

        let mut context: Payload = self.registry.collect();
        context.extend(self.data.all_event_data());
        if started {
            context.insert(keys::SESSION_STARTED.to_string(), Value::Bool(true));
        }
        request.with_context(context)
    }

    // ============================================
    // Queue control
    // ============================================

    /// Release queued events now. Returns how many were forwarded.
    pub fn flush(&self) -> usize {
        self.queue.flush()
    }

    /// Drop queued events without dispatching them
    pub fn clear_queue(&self) {
        self.queue.clear_queue();
    }

    pub fn queued_events(&self) -> usize {
        self.queue.current_events()
    }

    /// Host report of the network state
    pub fn set_connection_status(&self, status: ConnectionStatus) {
        self.connectivity.set_status(status);
    }

    /// Host report of the power state
    pub fn set_low_power(&self, low_power: bool) {
        self.queue.set_low_power(low_power);
    }

    /// Start the purge/dispatch-after timer on the current tokio runtime
    pub fn start_maintenance(&self) -> tokio::task::JoinHandle<()> {
        self.queue.spawn_maintenance()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ConnectionType;
    use crate::data::Expiry;
    use crate::modules::testing::RecordingDispatcher;
    use crate::modules::{Collector, DispatchValidator};
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::sync::mpsc;

    fn tracker(batching: bool) -> (Tracker, Arc<RecordingDispatcher>) {
        let mut config = Config::default();
        config.batching.enabled = batching;
        config.queue.max_queue_size = 200;

        let registry = Arc::new(ModuleRegistry::new());
        let dispatcher = RecordingDispatcher::new("collect");
        registry.register_dispatcher(dispatcher.clone());

        let tracker = Tracker::new(config, Arc::new(MemoryStore::new()), registry);
        (tracker, dispatcher)
    }

    fn sent_payloads(dispatcher: &RecordingDispatcher) -> Vec<Payload> {
        dispatcher
            .received
            .lock()
            .unwrap()
            .iter()
            .flat_map(|r| r.payloads().into_iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    #[test]
    fn test_hello_hello_wake() {
        crate::logging::init_test();
        let (tracker, dispatcher) = tracker(true);

        assert_eq!(tracker.track(TrackRequest::event("hello")), TrackDecision::Queued);
        assert_eq!(tracker.track(TrackRequest::event("hello")), TrackDecision::Queued);
        assert_eq!(tracker.queued_events(), 2);

        assert_eq!(tracker.track(TrackRequest::event("wake")), TrackDecision::Forwarded);
        assert_eq!(tracker.queued_events(), 2);
        assert_eq!(dispatcher.event_names(), vec!["wake"]);
    }

    #[test]
    fn test_forwarded_request_completes_for_caller() {
        let (tracker, _dispatcher) = tracker(false);
        let (tx, rx) = mpsc::channel();

        tracker.track(TrackRequest::event("purchase").with_completion(move |outcome| {
            tx.send(outcome).unwrap();
        }));

        let outcome = rx.recv().unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.module_responses[0].module_id, "collect");
    }

    #[test]
    fn test_payload_is_enriched() {
        let (tracker, dispatcher) = tracker(false);
        tracker.data().add(
            json!({"user_tier": "gold"}).as_object().cloned().unwrap(),
            Expiry::Forever,
        );

        tracker.track(TrackRequest::event("first"));
        tracker.track(TrackRequest::event("second"));

        let sent = sent_payloads(&dispatcher);
        assert_eq!(sent[0]["user_tier"], json!("gold"));
        assert_eq!(sent[0][keys::SESSION_STARTED], json!(true));
        assert!(!sent[1].contains_key(keys::SESSION_STARTED));
        assert_eq!(sent[0][keys::SESSION_ID], sent[1][keys::SESSION_ID]);
        assert_eq!(
            sent[0][keys::VISITOR_ID],
            json!(tracker.data().visitor_id())
        );
        assert_eq!(sent[0][keys::DISPATCH_SERVICE], json!("collect"));
    }

    #[test]
    fn test_collector_output_merged_but_event_wins() {
        struct AppCollector;
        impl Collector for AppCollector {
            fn id(&self) -> &str {
                "app"
            }
            fn data(&self) -> Option<Payload> {
                json!({"app_name": "demo", "screen": "home"}).as_object().cloned()
            }
        }

        let (tracker, dispatcher) = tracker(false);
        tracker.registry().register_collector(Arc::new(AppCollector));

        tracker.track(
            TrackRequest::view("checkout")
                .with_data(json!({"screen": "checkout"}).as_object().cloned().unwrap()),
        );

        let sent = sent_payloads(&dispatcher);
        assert_eq!(sent[0]["app_name"], json!("demo"));
        assert_eq!(sent[0]["screen"], json!("checkout"));
    }

    struct ConsentValidator {
        declined: bool,
    }

    impl DispatchValidator for ConsentValidator {
        fn id(&self) -> &str {
            "consent"
        }

        fn should_drop(&self, _request: &TrackRequest) -> bool {
            self.declined
        }

        fn should_purge(&self, request: &TrackRequest) -> bool {
            request.event_name() == Some("decline_consent")
        }
    }

    #[test]
    fn test_validator_drop_completes_with_dropped() {
        let (tracker, dispatcher) = tracker(false);
        tracker
            .registry()
            .register_validator(Arc::new(ConsentValidator { declined: true }));

        let (tx, rx) = mpsc::channel();
        let decision = tracker.track(
            TrackRequest::event("hello").with_completion(move |outcome| tx.send(outcome).unwrap()),
        );

        assert_eq!(decision, TrackDecision::Dropped);
        let outcome = rx.recv().unwrap();
        assert!(matches!(outcome.error, Some(DispatchError::Dropped(_))));
        assert_eq!(dispatcher.request_count(), 0);
    }

    #[test]
    fn test_validator_drop_applies_to_batches() {
        let (tracker, dispatcher) = tracker(false);
        tracker
            .registry()
            .register_validator(Arc::new(ConsentValidator { declined: true }));

        let (tx, rx) = mpsc::channel();
        let batch = BatchTrackRequest::new(vec![TrackRequest::event("x"), TrackRequest::event("y")])
            .with_completion(move |outcome| tx.send(outcome).unwrap());

        assert_eq!(tracker.track_batch(batch), TrackDecision::Dropped);
        let outcome = rx.recv().unwrap();
        assert!(matches!(outcome.error, Some(DispatchError::Dropped(_))));
        assert!(rx.try_recv().is_err());
        assert_eq!(dispatcher.request_count(), 0);
        assert_eq!(tracker.queued_events(), 0);
    }

    struct HoldValidator;

    impl DispatchValidator for HoldValidator {
        fn id(&self) -> &str {
            "hold"
        }

        fn should_queue(&self, _request: &TrackRequest) -> bool {
            true
        }
    }

    #[test]
    fn test_validator_can_hold_batches() {
        let (tracker, dispatcher) = tracker(false);
        tracker.registry().register_validator(Arc::new(HoldValidator));

        let batch = BatchTrackRequest::new(vec![TrackRequest::event("x"), TrackRequest::event("y")]);
        assert_eq!(tracker.track_batch(batch), TrackDecision::Queued);
        assert_eq!(tracker.queued_events(), 2);
        assert_eq!(dispatcher.request_count(), 0);
    }

    #[test]
    fn test_batching_policy_does_not_hold_batches() {
        let (tracker, dispatcher) = tracker(true);

        let batch = BatchTrackRequest::new(vec![TrackRequest::event("x"), TrackRequest::event("y")]);
        assert_eq!(tracker.track_batch(batch), TrackDecision::Forwarded);
        assert_eq!(tracker.queued_events(), 0);
        assert_eq!(dispatcher.event_names(), vec!["x", "y"]);
    }

    #[test]
    fn test_validator_purge_clears_queue() {
        let (tracker, _dispatcher) = tracker(true);
        tracker
            .registry()
            .register_validator(Arc::new(ConsentValidator { declined: false }));

        tracker.track(TrackRequest::event("hello"));
        assert_eq!(tracker.queued_events(), 1);

        tracker.track(TrackRequest::event("decline_consent"));
        assert_eq!(tracker.queued_events(), 0);
    }

    #[test]
    fn test_offline_events_released_on_reconnect() {
        let (tracker, dispatcher) = tracker(false);
        tracker.set_connection_status(ConnectionStatus::Disconnected);

        tracker.track(TrackRequest::event("a"));
        tracker.track(TrackRequest::event("b"));
        assert_eq!(tracker.queued_events(), 2);
        assert_eq!(dispatcher.request_count(), 0);

        tracker.set_connection_status(ConnectionStatus::Connected(ConnectionType::Wifi));
        assert_eq!(tracker.queued_events(), 0);
        assert_eq!(dispatcher.event_names(), vec!["a", "b"]);
        assert!(sent_payloads(&dispatcher)
            .iter()
            .all(|p| p[keys::WAS_QUEUED] == json!(true)));
    }

    #[test]
    fn test_batch_shares_one_completion() {
        let (tracker, dispatcher) = tracker(false);
        let (tx, rx) = mpsc::channel();

        let batch = BatchTrackRequest::new(vec![TrackRequest::event("x"), TrackRequest::event("y")])
            .with_completion(move |outcome| tx.send(outcome).unwrap());
        assert_eq!(tracker.track_batch(batch), TrackDecision::Forwarded);

        assert!(rx.recv().unwrap().success);
        assert!(rx.try_recv().is_err());
        assert_eq!(dispatcher.event_names(), vec!["x", "y"]);
    }

    #[test]
    fn test_clear_queue_is_idempotent() {
        let (tracker, dispatcher) = tracker(true);
        tracker.track(TrackRequest::event("hello"));

        tracker.clear_queue();
        assert_eq!(tracker.queued_events(), 0);
        tracker.clear_queue();
        assert_eq!(tracker.queued_events(), 0);
        assert_eq!(tracker.flush(), 0);
        assert_eq!(dispatcher.request_count(), 0);
    }
}
