//! Dispatch orchestrator: queue now or forward now
//!
//! ## Decision per request
//!
//! 1. Event names in `bypass_keys` are forwarded immediately, always.
//! 2. Otherwise the request is queued when the device is offline, when the
//!    battery saver is holding events, when batching is enabled, or when a
//!    validator asked for it.
//! 3. Everything else is forwarded immediately.
//!
//! ## Release triggers
//!
//! Queued events are released as one ordered batch when connectivity comes
//! back, when the queue reaches `batch_size`, on an explicit flush, when the
//! power-saving hold lifts, or when `dispatch_after` has elapsed since the
//! first event was queued. Releases are split into `batch_size` chunks and
//! handed to the [`ModuleDelegate`]; they are never dropped silently.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::config::Config;
use crate::connectivity::{ConnectionStatus, ConnectionType};
use crate::modules::{DispatchValidator, ModuleDelegate};
use crate::types::{keys, BatchTrackRequest, DispatchRequest, TrackRequest};

use super::persistent::PersistentQueue;

/// Module id of the orchestrator
pub const MODULE_ID: &str = "dispatchqueue";

/// Granularity of the maintenance timer
const MAINTENANCE_TICK: Duration = Duration::from_secs(1);

/// Queueing and release policy, read-only after construction
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    pub batching_enabled: bool,
    pub batch_size: usize,
    pub bypass_keys: BTreeSet<String>,
    pub dispatch_after: Option<Duration>,
    pub wifi_only: bool,
    pub battery_saver: bool,
    pub expiration: Option<Duration>,
    pub purge_interval: Duration,
}

impl QueuePolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batching_enabled: config.batching.enabled,
            batch_size: config.batching.batch_size.max(1),
            bypass_keys: config.batching.bypass_keys.clone(),
            dispatch_after: config.batching.dispatch_after(),
            wifi_only: config.batching.wifi_only,
            battery_saver: config.batching.battery_saver,
            expiration: config.queue.expiration(),
            purge_interval: config.queue.purge_interval(),
        }
    }
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What the orchestrator did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackDecision {
    Queued,
    Forwarded,
    /// Discarded by a validator before reaching the orchestrator
    Dropped,
}

struct QueueState {
    queue: PersistentQueue,
    connection: ConnectionStatus,
    low_power: bool,
    first_queued_at: Option<Instant>,
    last_purge: Instant,
}

/// Owner of the persistent queue and the queue-vs-forward decision
pub struct DispatchQueueModule {
    policy: QueuePolicy,
    state: Mutex<QueueState>,
    delegate: Arc<dyn ModuleDelegate>,
}

impl DispatchQueueModule {
    pub fn new(
        policy: QueuePolicy,
        queue: PersistentQueue,
        delegate: Arc<dyn ModuleDelegate>,
    ) -> Self {
        let queue = queue.with_expiration(policy.expiration);
        Self {
            policy,
            state: Mutex::new(QueueState {
                queue,
                connection: ConnectionStatus::default(),
                low_power: false,
                first_queued_at: None,
                last_purge: Instant::now(),
            }),
            delegate,
        }
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ============================================
    // Decisions
    // ============================================

    /// Whether the event name is exempt from queueing
    pub fn is_bypassed(&self, request: &TrackRequest) -> bool {
        request
            .event_name()
            .map(|name| self.policy.bypass_keys.contains(name))
            .unwrap_or(false)
    }

    /// Batching is enabled and the event is not bypassed
    pub fn can_queue_request(&self, request: &TrackRequest) -> bool {
        self.policy.batching_enabled && !self.is_bypassed(request)
    }

    fn is_online(&self, status: ConnectionStatus) -> bool {
        match status {
            ConnectionStatus::Disconnected => false,
            ConnectionStatus::Connected(ConnectionType::Cellular) => !self.policy.wifi_only,
            ConnectionStatus::Connected(_) => true,
        }
    }

    fn is_holding(&self, state: &QueueState) -> bool {
        self.policy.battery_saver && state.low_power
    }

    fn can_release(&self, state: &QueueState) -> bool {
        self.is_online(state.connection) && !self.is_holding(state)
    }

    /// Whether `request` would be queued right now
    pub fn should_queue(&self, request: &TrackRequest) -> bool {
        if self.is_bypassed(request) {
            return false;
        }
        let state = self.state();
        !self.can_release(&state) || self.can_queue_request(request)
    }

    // ============================================
    // Intake
    // ============================================

    /// Queue or forward a single request.
    ///
    /// `force_queue` comes from external validators. A queued request's
    /// completion is dropped unfired: completions cannot be persisted.
    pub fn track(&self, mut request: TrackRequest, force_queue: bool) -> TrackDecision {
        if self.is_bypassed(&request) {
            tracing::debug!(event = ?request.event_name(), "Bypassing dispatch queue");
            self.delegate.request_forward(request.into());
            return TrackDecision::Forwarded;
        }

        let mut state = self.state();
        let queue_it =
            force_queue || !self.can_release(&state) || self.can_queue_request(&request);

        if !queue_it {
            // Flush anything left over from an offline period first so order holds
            let backlog = if state.queue.is_empty() {
                None
            } else {
                self.release_locked(&mut state)
            };
            drop(state);

            if let Some(batch) = backlog {
                self.forward_released(batch);
            }
            self.delegate.request_forward(request.into());
            return TrackDecision::Forwarded;
        }

        if request.take_completion().is_some() {
            tracing::debug!(
                event = ?request.event_name(),
                "Queued request completion will not fire"
            );
        }
        state.queue.enqueue(vec![request.payload]);
        state.first_queued_at.get_or_insert_with(Instant::now);

        let queued = state.queue.current_events();
        tracing::debug!(queued, "Queued event");

        let release = if self.can_release(&state) && queued >= self.policy.batch_size {
            self.release_locked(&mut state)
        } else {
            None
        };
        drop(state);

        if let Some(batch) = release {
            self.forward_released(batch);
        }
        TrackDecision::Queued
    }

    /// Queue or forward a batch as a unit.
    ///
    /// Batches are queued while releases are blocked or when a validator
    /// forces it; batching policy does not apply because the caller already
    /// grouped the events.
    pub fn track_batch(&self, mut batch: BatchTrackRequest, force_queue: bool) -> TrackDecision {
        let mut state = self.state();
        if !force_queue && self.can_release(&state) {
            drop(state);
            self.delegate.request_forward(batch.into());
            return TrackDecision::Forwarded;
        }

        if batch.take_completion().is_some() {
            tracing::debug!(
                events = batch.len(),
                "Queued batch completion will not fire"
            );
        }
        state.queue.enqueue(batch.into_payloads());
        state.first_queued_at.get_or_insert_with(Instant::now);
        tracing::debug!(queued = state.queue.current_events(), "Queued batch");
        TrackDecision::Queued
    }

    // ============================================
    // Release
    // ============================================

    /// Release the queue now if the device can send. Returns events released.
    pub fn flush(&self) -> usize {
        let mut state = self.state();
        if !self.is_online(state.connection) {
            tracing::debug!("Flush requested while offline, keeping queue");
            return 0;
        }
        let batch = self.release_locked(&mut state);
        drop(state);

        batch.map(|b| self.forward_released(b)).unwrap_or(0)
    }

    /// React to a connectivity transition; releases on offline → online
    pub fn on_connectivity_change(&self, status: ConnectionStatus) {
        let mut state = self.state();
        let was_online = self.is_online(state.connection);
        state.connection = status;

        let release = if !was_online && self.can_release(&state) {
            tracing::info!("Connectivity restored, releasing dispatch queue");
            self.release_locked(&mut state)
        } else {
            None
        };
        drop(state);

        if let Some(batch) = release {
            self.forward_released(batch);
        }
    }

    /// Host power state; with the battery saver on, low power holds events
    pub fn set_low_power(&self, low_power: bool) {
        let mut state = self.state();
        let was_holding = self.is_holding(&state);
        state.low_power = low_power;

        let release = if was_holding && self.can_release(&state) {
            self.release_locked(&mut state)
        } else {
            None
        };
        drop(state);

        if let Some(batch) = release {
            self.forward_released(batch);
        }
    }

    fn release_locked(&self, state: &mut QueueState) -> Option<BatchTrackRequest> {
        state.first_queued_at = None;
        state.queue.release()
    }

    /// Split a released batch into `batch_size` chunks and forward each
    fn forward_released(&self, batch: BatchTrackRequest) -> usize {
        let mut requests = batch.requests;
        let mut forwarded = 0;

        while !requests.is_empty() {
            let rest = requests.split_off(self.policy.batch_size.min(requests.len()));
            let chunk: Vec<TrackRequest> = std::mem::replace(&mut requests, rest)
                .into_iter()
                .map(|mut r| {
                    r.payload
                        .insert(keys::WAS_QUEUED.to_string(), Value::Bool(true));
                    r
                })
                .collect();

            forwarded += chunk.len();
            let request = if chunk.len() == 1 {
                chunk.into_iter().next().map(DispatchRequest::Track)
            } else {
                Some(DispatchRequest::Batch(BatchTrackRequest::new(chunk)))
            };
            if let Some(request) = request {
                self.delegate.request_forward(request);
            }
        }

        tracing::info!(events = forwarded, "Forwarded released events");
        forwarded
    }

    // ============================================
    // Maintenance
    // ============================================

    pub fn current_events(&self) -> usize {
        self.state().queue.current_events()
    }

    /// Discard everything queued; stored completions do not exist and nothing fires
    pub fn clear_queue(&self) {
        let mut state = self.state();
        state.queue.clear();
        state.first_queued_at = None;
        tracing::info!("Dispatch queue cleared");
    }

    /// Purge entries past the configured expiration
    pub fn remove_old_dispatches(&self) -> usize {
        let Some(expiration) = self.policy.expiration else {
            return 0;
        };
        let Ok(max_age) = chrono::Duration::from_std(expiration) else {
            return 0;
        };
        let mut state = self.state();
        state.last_purge = Instant::now();
        state.queue.remove_old_dispatches(max_age, None)
    }

    pub fn tick(&self) {
        self.tick_at(Instant::now());
    }

    /// Run timer-driven work due at `now`: periodic purge and dispatch-after
    pub fn tick_at(&self, now: Instant) {
        let purge_due = {
            let state = self.state();
            now.saturating_duration_since(state.last_purge) >= self.policy.purge_interval
        };
        if purge_due {
            self.remove_old_dispatches();
            self.state().last_purge = now;
        }

        let Some(dispatch_after) = self.policy.dispatch_after else {
            return;
        };
        let mut state = self.state();
        let due = state
            .first_queued_at
            .map(|first| now.saturating_duration_since(first) >= dispatch_after)
            .unwrap_or(false);

        let release = if due && self.can_release(&state) {
            tracing::debug!("Dispatch-after interval elapsed, releasing queue");
            self.release_locked(&mut state)
        } else {
            None
        };
        drop(state);

        if let Some(batch) = release {
            self.forward_released(batch);
        }
    }

    /// Drive [`tick`](Self::tick) from a tokio interval until the module is dropped
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let module = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(module) = module.upgrade() else {
                    break;
                };
                // Storage access blocks, keep it off the async workers
                if let Err(e) = tokio::task::spawn_blocking(move || module.tick()).await {
                    tracing::warn!(error = %e, "Dispatch queue maintenance tick failed");
                }
            }
        })
    }
}

impl DispatchValidator for DispatchQueueModule {
    fn id(&self) -> &str {
        MODULE_ID
    }

    fn should_queue(&self, request: &TrackRequest) -> bool {
        DispatchQueueModule::should_queue(self, request)
    }
}
