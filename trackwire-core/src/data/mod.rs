//! Event data manager
//!
//! Holds the context merged into every outgoing event. Two scopes exist:
//!
//! | Scope      | Backing       | Cleared by                                  |
//! |------------|---------------|---------------------------------------------|
//! | persistent | durable store | `delete`, expiry, session end, restart      |
//! | volatile   | memory only   | `delete`, session end                       |
//!
//! On key collisions the persistent scope wins. Expired items are never
//! returned and are evicted lazily on the next read.
//!
//! The manager also owns session bookkeeping and the anonymous visitor id.

mod expiry;

pub use expiry::{DataItem, Expiry};

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::storage::{DiskStore, TypedStore};
use crate::types::{keys, Payload};

const EVENT_DATA_KEY: &str = "event_data";
const SESSION_KEY: &str = "session";

/// Bookkeeping for the current session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub last_activity: DateTime<Utc>,
}

/// Result of touching the session on a new event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRefresh {
    /// The event belongs to the ongoing session
    Continued,
    /// A new session was started for this event
    Started,
}

struct DataState {
    persistent: BTreeMap<String, DataItem>,
    volatile: Payload,
    session: Option<SessionInfo>,
}

/// Merge-on-read key/value context store
pub struct EventDataManager {
    state: RwLock<DataState>,
    items_store: TypedStore<BTreeMap<String, DataItem>>,
    session_store: TypedStore<SessionInfo>,
    session_timeout: Duration,
}

impl EventDataManager {
    /// Load persisted data, dropping restart-scoped and expired items and
    /// minting a visitor id on first use.
    pub fn new(store: Arc<dyn DiskStore>, session_timeout: std::time::Duration) -> Self {
        let items_store = TypedStore::new(Arc::clone(&store), EVENT_DATA_KEY);
        let session_store = TypedStore::new(store, SESSION_KEY);

        let mut persistent: BTreeMap<String, DataItem> = items_store.retrieve().unwrap_or_default();
        let loaded = persistent.len();
        let now = Utc::now();
        persistent
            .retain(|_, item| item.expiry != Expiry::UntilRestart && !item.expiry.is_expired_at(now));

        let mut dirty = persistent.len() != loaded;
        if !persistent.contains_key(keys::VISITOR_ID) {
            persistent.insert(keys::VISITOR_ID.to_string(), new_visitor_item());
            dirty = true;
        }
        if dirty {
            items_store.save(&persistent);
        }

        let session = session_store.retrieve();

        tracing::debug!(
            items = persistent.len(),
            has_session = session.is_some(),
            "Loaded event data"
        );

        Self {
            state: RwLock::new(DataState {
                persistent,
                volatile: Payload::new(),
                session,
            }),
            items_store,
            session_store,
            session_timeout: Duration::from_std(session_timeout)
                .unwrap_or_else(|_| Duration::minutes(30)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, DataState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, DataState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    // ============================================
    // Data operations
    // ============================================

    /// Upsert persistent data, replacing any existing expiry for the keys
    pub fn add(&self, data: Payload, expiry: Expiry) {
        if data.is_empty() {
            return;
        }
        let mut state = self.write();
        for (key, value) in data {
            state.volatile.remove(&key);
            state.persistent.insert(
                key,
                DataItem {
                    value,
                    expiry: expiry.clone(),
                },
            );
        }
        self.items_store.save(&state.persistent);
    }

    /// Upsert volatile data that lives in memory until the session ends
    pub fn add_volatile(&self, data: Payload) {
        let mut state = self.write();
        state.volatile.extend(data);
    }

    /// Remove keys from both scopes
    pub fn delete<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut state = self.write();
        let mut removed_persistent = false;
        for key in keys {
            let key = key.as_ref();
            state.volatile.remove(key);
            removed_persistent |= state.persistent.remove(key).is_some();
        }
        if removed_persistent {
            self.items_store.save(&state.persistent);
        }
    }

    /// Remove all data except the visitor id
    pub fn delete_all(&self) {
        let mut state = self.write();
        state.volatile.clear();
        let visitor = state.persistent.remove(keys::VISITOR_ID);
        state.persistent.clear();
        state.persistent.insert(
            keys::VISITOR_ID.to_string(),
            visitor.unwrap_or_else(new_visitor_item),
        );
        self.items_store.save(&state.persistent);
    }

    /// Merged view of all live data, persistent over volatile
    pub fn all_event_data(&self) -> Payload {
        self.all_event_data_at(Utc::now())
    }

    pub fn all_event_data_at(&self, now: DateTime<Utc>) -> Payload {
        {
            let state = self.read();
            if !state.persistent.values().any(|i| i.expiry.is_expired_at(now)) {
                return merged(&state);
            }
        }

        let mut state = self.write();
        let before = state.persistent.len();
        state.persistent.retain(|_, item| !item.expiry.is_expired_at(now));
        if state.persistent.len() != before {
            tracing::debug!(
                evicted = before - state.persistent.len(),
                "Evicted expired event data"
            );
            self.items_store.save(&state.persistent);
        }
        merged(&state)
    }

    // ============================================
    // Visitor identity
    // ============================================

    pub fn visitor_id(&self) -> String {
        self.read()
            .persistent
            .get(keys::VISITOR_ID)
            .and_then(|item| item.value.as_str().map(String::from))
            .unwrap_or_default()
    }

    /// Replace the visitor id with a fresh one and return it
    pub fn reset_visitor_id(&self) -> String {
        let item = new_visitor_item();
        let id = item.value.as_str().unwrap_or_default().to_string();
        let mut state = self.write();
        state.persistent.insert(keys::VISITOR_ID.to_string(), item);
        self.items_store.save(&state.persistent);
        tracing::info!("Visitor id reset");
        id
    }

    // ============================================
    // Sessions
    // ============================================

    pub fn session_id(&self) -> Option<String> {
        self.read().session.as_ref().map(|s| s.id.clone())
    }

    /// Record activity, starting a new session when the previous one lapsed
    pub fn refresh_session(&self) -> SessionRefresh {
        self.refresh_session_at(Utc::now())
    }

    pub fn refresh_session_at(&self, now: DateTime<Utc>) -> SessionRefresh {
        let mut state = self.write();
        let lapsed = match &state.session {
            Some(session) => now - session.last_activity > self.session_timeout,
            None => true,
        };

        if lapsed {
            self.begin_session(&mut state, now);
            return SessionRefresh::Started;
        }

        if let Some(session) = state.session.as_mut() {
            session.last_activity = now;
            self.session_store.save(session);
        }
        SessionRefresh::Continued
    }

    fn begin_session(&self, state: &mut DataState, now: DateTime<Utc>) {
        let before = state.persistent.len();
        state.persistent.retain(|_, item| item.expiry != Expiry::Session);
        if state.persistent.len() != before {
            self.items_store.save(&state.persistent);
        }
        state.volatile.clear();

        let session = SessionInfo {
            id: now.timestamp_millis().to_string(),
            last_activity: now,
        };
        self.session_store.save(&session);
        tracing::info!(session_id = %session.id, "Started new session");
        state.session = Some(session);
    }
}

fn new_visitor_item() -> DataItem {
    DataItem {
        value: Value::String(Uuid::new_v4().simple().to_string()),
        expiry: Expiry::Forever,
    }
}

fn merged(state: &DataState) -> Payload {
    let mut data = state.volatile.clone();
    for (key, item) in &state.persistent {
        data.insert(key.clone(), item.value.clone());
    }
    if let Some(session) = &state.session {
        data.insert(
            keys::SESSION_ID.to_string(),
            Value::String(session.id.clone()),
        );
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn manager(store: &Arc<MemoryStore>) -> EventDataManager {
        EventDataManager::new(
            store.clone() as Arc<dyn DiskStore>,
            std::time::Duration::from_secs(1800),
        )
    }

    #[test]
    fn test_visitor_id_is_minted_and_persisted() {
        let store = Arc::new(MemoryStore::new());
        let first = manager(&store).visitor_id();
        assert_eq!(first.len(), 32);

        let second = manager(&store).visitor_id();
        assert_eq!(first, second);
    }

    #[test]
    fn test_persistent_wins_over_volatile() {
        let store = Arc::new(MemoryStore::new());
        let data = manager(&store);

        data.add_volatile(payload(json!({"screen": "volatile", "only_volatile": 1})));
        data.add(payload(json!({"screen": "persistent"})), Expiry::Forever);

        let all = data.all_event_data();
        assert_eq!(all["screen"], json!("persistent"));
        assert_eq!(all["only_volatile"], json!(1));
    }

    #[test]
    fn test_add_overwrites_expiry() {
        let store = Arc::new(MemoryStore::new());
        let data = manager(&store);
        let now = Utc::now();

        data.add(
            payload(json!({"plan": "trial"})),
            Expiry::after_from(now, Duration::seconds(10)),
        );
        data.add(payload(json!({"plan": "paid"})), Expiry::Forever);

        let later = now + Duration::days(1);
        assert_eq!(data.all_event_data_at(later)["plan"], json!("paid"));
    }

    #[test]
    fn test_expired_items_are_excluded_and_evicted() {
        let store = Arc::new(MemoryStore::new());
        let data = manager(&store);
        let now = Utc::now();

        data.add(
            payload(json!({"promo": "spring"})),
            Expiry::after_from(now, Duration::minutes(1)),
        );
        assert_eq!(data.all_event_data_at(now)["promo"], json!("spring"));

        let later = now + Duration::minutes(2);
        assert!(!data.all_event_data_at(later).contains_key("promo"));

        // Eviction was written through, a reload never sees it
        let reloaded = manager(&store);
        assert!(!reloaded.all_event_data_at(now).contains_key("promo"));
    }

    #[test]
    fn test_delete_is_not_resurrected_on_reload() {
        let store = Arc::new(MemoryStore::new());
        let data = manager(&store);
        data.add(payload(json!({"user_tier": "gold", "keep": true})), Expiry::Forever);
        data.delete(["user_tier"]);

        let reloaded = manager(&store);
        let all = reloaded.all_event_data();
        assert!(!all.contains_key("user_tier"));
        assert_eq!(all["keep"], json!(true));
    }

    #[test]
    fn test_delete_all_keeps_visitor_id() {
        let store = Arc::new(MemoryStore::new());
        let data = manager(&store);
        let visitor = data.visitor_id();
        data.add(payload(json!({"a": 1})), Expiry::Forever);
        data.add_volatile(payload(json!({"b": 2})));

        data.delete_all();

        let all = data.all_event_data();
        assert!(!all.contains_key("a"));
        assert!(!all.contains_key("b"));
        assert_eq!(all[keys::VISITOR_ID], json!(visitor));
    }

    #[test]
    fn test_until_restart_items_removed_on_load() {
        let store = Arc::new(MemoryStore::new());
        let data = manager(&store);
        data.add(payload(json!({"launch_flag": true})), Expiry::UntilRestart);
        assert!(data.all_event_data().contains_key("launch_flag"));

        let reloaded = manager(&store);
        assert!(!reloaded.all_event_data().contains_key("launch_flag"));
    }

    #[test]
    fn test_session_lifecycle() {
        let store = Arc::new(MemoryStore::new());
        let data = manager(&store);
        let now = Utc::now();

        assert_eq!(data.refresh_session_at(now), SessionRefresh::Started);
        let first = data.session_id().unwrap();
        data.add(payload(json!({"cart": 3})), Expiry::Session);
        data.add_volatile(payload(json!({"screen": "home"})));

        let soon = now + Duration::minutes(10);
        assert_eq!(data.refresh_session_at(soon), SessionRefresh::Continued);
        assert_eq!(data.session_id().unwrap(), first);

        // 31 minutes after the last activity the session lapses
        let lapsed = soon + Duration::minutes(31);
        assert_eq!(data.refresh_session_at(lapsed), SessionRefresh::Started);
        assert_ne!(data.session_id().unwrap(), first);

        let all = data.all_event_data_at(lapsed);
        assert!(!all.contains_key("cart"));
        assert!(!all.contains_key("screen"));
        assert_eq!(all[keys::SESSION_ID], json!(data.session_id().unwrap()));
    }

    #[test]
    fn test_reset_visitor_id() {
        let store = Arc::new(MemoryStore::new());
        let data = manager(&store);
        let old = data.visitor_id();
        let new = data.reset_visitor_id();
        assert_ne!(old, new);
        assert_eq!(data.visitor_id(), new);
    }

    #[test]
    fn test_storage_failure_degrades_to_memory() {
        let store = Arc::new(MemoryStore::new());
        let data = manager(&store);
        store.set_failing(true);

        data.add(payload(json!({"offline": true})), Expiry::Forever);
        assert_eq!(data.all_event_data()["offline"], json!(true));
    }
}
