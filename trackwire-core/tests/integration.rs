//! Integration tests for the dispatch pipeline
//!
//! These tests run the full `Tracker` on an on-disk SQLite store to verify
//! that queued events survive restarts and are released in order.

use std::sync::{Arc, Mutex};

use serde_json::json;
use tempfile::TempDir;
use trackwire_core::data::Expiry;
use trackwire_core::modules::{Dispatcher, ModuleCompletion, ModuleRegistry};
use trackwire_core::queue::PersistentQueue;
use trackwire_core::storage::{DiskStore, SqliteStore};
use trackwire_core::{
    keys, Config, ConnectionStatus, ConnectionType, DispatchRequest, ModuleResponse,
    TrackDecision, TrackRequest, Tracker,
};

/// Dispatcher that remembers the payloads it was given
#[derive(Default)]
struct CapturingDispatcher {
    events: Mutex<Vec<serde_json::Map<String, serde_json::Value>>>,
}

impl CapturingDispatcher {
    fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|p| p[keys::EVENT].as_str().unwrap().to_string())
            .collect()
    }
}

impl Dispatcher for CapturingDispatcher {
    fn id(&self) -> &str {
        "capture"
    }

    fn dynamic_track(&self, request: DispatchRequest, completion: ModuleCompletion) {
        self.events
            .lock()
            .unwrap()
            .extend(request.payloads().into_iter().cloned());
        completion(ModuleResponse::success("capture", None));
    }
}

fn config(dir: &TempDir, batching: bool) -> Config {
    let mut config = Config::default();
    config.queue.database_path = Some(dir.path().join("trackwire.db"));
    config.queue.max_queue_size = 200;
    config.batching.enabled = batching;
    config
}

fn open(config: Config) -> (Tracker, Arc<CapturingDispatcher>) {
    let store = SqliteStore::open(&config.database_path()).expect("open store");
    let registry = Arc::new(ModuleRegistry::new());
    let dispatcher = Arc::new(CapturingDispatcher::default());
    registry.register_dispatcher(dispatcher.clone());
    (Tracker::new(config, Arc::new(store), registry), dispatcher)
}

// ============================================
// Restart Survival
// ============================================

#[test]
fn test_queued_events_survive_restart() {
    let dir = TempDir::new().unwrap();

    {
        let (tracker, dispatcher) = open(config(&dir, true));
        for name in ["first", "second", "third"] {
            assert_eq!(tracker.track(TrackRequest::event(name)), TrackDecision::Queued);
        }
        assert_eq!(tracker.queued_events(), 3);
        assert!(dispatcher.names().is_empty());
    }

    let (tracker, dispatcher) = open(config(&dir, true));
    assert_eq!(tracker.queued_events(), 3);

    assert_eq!(tracker.flush(), 3);
    assert_eq!(dispatcher.names(), vec!["first", "second", "third"]);
    assert_eq!(tracker.queued_events(), 0);
}

#[test]
fn test_persistent_data_survives_restart() {
    let dir = TempDir::new().unwrap();

    let visitor = {
        let (tracker, _) = open(config(&dir, false));
        tracker.data().add(
            json!({"plan": "pro"}).as_object().cloned().unwrap(),
            Expiry::Forever,
        );
        tracker.data().add(
            json!({"scratch": true}).as_object().cloned().unwrap(),
            Expiry::UntilRestart,
        );
        tracker.data().visitor_id()
    };

    let (tracker, dispatcher) = open(config(&dir, false));
    assert_eq!(tracker.data().visitor_id(), visitor);

    tracker.track(TrackRequest::event("launch"));
    let events = dispatcher.events.lock().unwrap();
    assert_eq!(events[0]["plan"], json!("pro"));
    assert!(!events[0].contains_key("scratch"));
    assert_eq!(events[0][keys::VISITOR_ID], json!(visitor));
}

// ============================================
// Connectivity
// ============================================

#[test]
fn test_offline_then_online_keeps_order() {
    let dir = TempDir::new().unwrap();
    let (tracker, dispatcher) = open(config(&dir, false));

    tracker.track(TrackRequest::event("online_before"));
    tracker.set_connection_status(ConnectionStatus::Disconnected);
    tracker.track(TrackRequest::event("offline_1"));
    tracker.track(TrackRequest::event("offline_2"));
    tracker.track(TrackRequest::event("wake"));

    assert_eq!(tracker.queued_events(), 2);
    assert_eq!(dispatcher.names(), vec!["online_before", "wake"]);

    tracker.set_connection_status(ConnectionStatus::Connected(ConnectionType::Wifi));
    tracker.track(TrackRequest::event("online_after"));

    assert_eq!(
        dispatcher.names(),
        vec!["online_before", "wake", "offline_1", "offline_2", "online_after"]
    );

    let events = dispatcher.events.lock().unwrap();
    assert_eq!(events[2][keys::WAS_QUEUED], json!(true));
    assert!(!events[4].contains_key(keys::WAS_QUEUED));
}

// ============================================
// Queue Bounds
// ============================================

#[test]
fn test_queue_trim_keeps_newest_on_disk() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn DiskStore> =
        Arc::new(SqliteStore::open(&dir.path().join("queue.db")).unwrap());

    {
        let mut queue = PersistentQueue::new(Arc::clone(&store), 5);
        for i in 0..8 {
            queue.enqueue(vec![json!({"event_name": format!("e{}", i)})
                .as_object()
                .cloned()
                .unwrap()]);
            assert!(queue.current_events() <= 5);
        }
    }

    let mut queue = PersistentQueue::new(store, 5);
    let batch = queue.release().expect("queued events");
    let names: Vec<_> = batch
        .payloads()
        .iter()
        .map(|p| p[keys::EVENT].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["e3", "e4", "e5", "e6", "e7"]);
    assert_eq!(queue.current_events(), 0);
}
