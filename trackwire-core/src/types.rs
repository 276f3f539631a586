//! Core request types for trackwire
//!
//! A [`TrackRequest`] is one event payload plus its completion contract.
//! A [`BatchTrackRequest`] groups several track requests behind a single
//! completion. Dispatchers receive either form wrapped in a [`DispatchRequest`].
//!
//! ## Completions
//!
//! Completions are `FnOnce`, so the type system guarantees a completion fires
//! at most once. Every code path that consumes a request either invokes its
//! completion or hands it on; the only intentional exception is persistence to
//! the dispatch queue, where completions are dropped because they cannot be
//! stored.

use std::fmt;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::error::DispatchError;

/// Event attributes merged with context data
pub type Payload = serde_json::Map<String, Value>;

/// Callback fired with a request's final outcome
pub type Completion = Box<dyn FnOnce(TrackOutcome) + Send + 'static>;

/// Well-known payload keys
pub mod keys {
    /// Name of the event (`"screen_view"`, `"purchase"`, `"wake"`)
    pub const EVENT: &str = "event_name";
    /// `"view"` or `"event"`
    pub const CALL_TYPE: &str = "call_type";
    /// Unique id for a single track request
    pub const REQUEST_UUID: &str = "request_uuid";
    /// Creation time of the request
    pub const TIMESTAMP: &str = "timestamp_unix_milliseconds";
    /// Dispatcher the copy of the request was routed to
    pub const DISPATCH_SERVICE: &str = "dispatch_service";
    /// Set on events released from the persistent queue
    pub const WAS_QUEUED: &str = "was_queued";
    /// Current session id
    pub const SESSION_ID: &str = "session_id";
    /// Present on the first event of a new session
    pub const SESSION_STARTED: &str = "session_started";
    /// Persistent anonymous visitor id
    pub const VISITOR_ID: &str = "visitor_id";
}

// ============================================
// Outcomes
// ============================================

/// Result reported by a single module for a request
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleResponse {
    /// Module that handled the request
    pub module_id: String,
    /// Whether the module considers the dispatch successful
    pub success: bool,
    /// Optional response details from the destination
    pub info: Option<Payload>,
    /// Failure reason, if any
    pub error: Option<DispatchError>,
}

impl ModuleResponse {
    pub fn success(module_id: impl Into<String>, info: Option<Payload>) -> Self {
        Self {
            module_id: module_id.into(),
            success: true,
            info,
            error: None,
        }
    }

    pub fn failure(module_id: impl Into<String>, error: DispatchError) -> Self {
        Self {
            module_id: module_id.into(),
            success: false,
            info: None,
            error: Some(error),
        }
    }
}

/// Final outcome of a track or batch request
#[derive(Debug, Clone, PartialEq)]
pub struct TrackOutcome {
    pub success: bool,
    pub info: Option<Payload>,
    pub error: Option<DispatchError>,
    /// Responses of every module the request traversed, in completion order
    pub module_responses: Vec<ModuleResponse>,
}

impl TrackOutcome {
    pub fn success(info: Option<Payload>) -> Self {
        Self {
            success: true,
            info,
            error: None,
            module_responses: Vec::new(),
        }
    }

    pub fn failure(error: DispatchError) -> Self {
        Self {
            success: false,
            info: None,
            error: Some(error),
            module_responses: Vec::new(),
        }
    }

    /// Fold a set of module responses into one outcome.
    ///
    /// Succeeds only if every module succeeded. The first error wins and
    /// `info` maps are merged in response order.
    pub fn from_responses(module_responses: Vec<ModuleResponse>) -> Self {
        let success = !module_responses.is_empty() && module_responses.iter().all(|r| r.success);
        let error = module_responses.iter().find_map(|r| r.error.clone());

        let mut merged = Payload::new();
        for info in module_responses.iter().filter_map(|r| r.info.as_ref()) {
            merged.extend(info.clone());
        }

        Self {
            success,
            info: (!merged.is_empty()).then_some(merged),
            error,
            module_responses,
        }
    }
}

// ============================================
// Track Request
// ============================================

/// A single event to dispatch
pub struct TrackRequest {
    pub payload: Payload,
    pub module_responses: Vec<ModuleResponse>,
    completion: Option<Completion>,
}

impl TrackRequest {
    /// Create a request from a raw payload.
    ///
    /// A `request_uuid` and creation timestamp are added when absent.
    pub fn new(mut payload: Payload) -> Self {
        payload
            .entry(keys::REQUEST_UUID)
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
        payload
            .entry(keys::TIMESTAMP)
            .or_insert_with(|| Value::from(Utc::now().timestamp_millis()));

        Self {
            payload,
            module_responses: Vec::new(),
            completion: None,
        }
    }

    /// Create an `"event"` call with the given event name
    pub fn event(name: impl Into<String>) -> Self {
        Self::with_call_type(name.into(), "event")
    }

    /// Create a `"view"` call with the given screen name
    pub fn view(name: impl Into<String>) -> Self {
        Self::with_call_type(name.into(), "view")
    }

    fn with_call_type(name: String, call_type: &str) -> Self {
        let mut payload = Payload::new();
        payload.insert(keys::EVENT.to_string(), Value::String(name));
        payload.insert(keys::CALL_TYPE.to_string(), Value::String(call_type.to_string()));
        Self::new(payload)
    }

    /// Merge additional attributes into the payload (incoming keys win)
    pub fn with_data(mut self, data: Payload) -> Self {
        self.payload.extend(data);
        self
    }

    /// Attach a completion callback, replacing any existing one
    pub fn with_completion<F>(mut self, completion: F) -> Self
    where
        F: FnOnce(TrackOutcome) + Send + 'static,
    {
        self.completion = Some(Box::new(completion));
        self
    }

    /// Layer the payload on top of context data.
    ///
    /// Context supplies defaults; keys already set on the event win.
    pub fn with_context(mut self, context: Payload) -> Self {
        let mut merged = context;
        merged.extend(std::mem::take(&mut self.payload));
        self.payload = merged;
        self
    }

    /// Tag the payload with the dispatcher it is being routed to
    pub fn with_dispatch_service(mut self, module_id: &str) -> Self {
        self.payload.insert(
            keys::DISPATCH_SERVICE.to_string(),
            Value::String(module_id.to_string()),
        );
        self
    }

    /// Event name, if the payload carries one
    pub fn event_name(&self) -> Option<&str> {
        self.payload.get(keys::EVENT).and_then(Value::as_str)
    }

    pub fn request_uuid(&self) -> Option<&str> {
        self.payload.get(keys::REQUEST_UUID).and_then(Value::as_str)
    }

    pub fn has_completion(&self) -> bool {
        self.completion.is_some()
    }

    /// Detach the completion so it can be resolved elsewhere
    pub fn take_completion(&mut self) -> Option<Completion> {
        self.completion.take()
    }

    /// Copy of the request without its completion
    pub fn detached(&self) -> Self {
        Self {
            payload: self.payload.clone(),
            module_responses: self.module_responses.clone(),
            completion: None,
        }
    }

    /// Resolve the request. The module responses gathered so far are
    /// prepended to the outcome's own.
    pub fn complete(mut self, mut outcome: TrackOutcome) {
        if let Some(completion) = self.completion.take() {
            let mut responses = std::mem::take(&mut self.module_responses);
            responses.append(&mut outcome.module_responses);
            outcome.module_responses = responses;
            completion(outcome);
        }
    }
}

impl fmt::Debug for TrackRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackRequest")
            .field("payload", &self.payload)
            .field("module_responses", &self.module_responses)
            .field("has_completion", &self.completion.is_some())
            .finish()
    }
}

impl From<Payload> for TrackRequest {
    fn from(payload: Payload) -> Self {
        Self::new(payload)
    }
}

// ============================================
// Batch Track Request
// ============================================

/// Ordered group of track requests sharing one completion.
///
/// The order of `requests` is the dispatch order, oldest first.
pub struct BatchTrackRequest {
    pub requests: Vec<TrackRequest>,
    pub module_responses: Vec<ModuleResponse>,
    completion: Option<Completion>,
}

impl BatchTrackRequest {
    pub fn new(requests: Vec<TrackRequest>) -> Self {
        Self {
            requests,
            module_responses: Vec::new(),
            completion: None,
        }
    }

    /// Rebuild a batch from persisted payloads; no completion is attached
    pub fn from_payloads(payloads: Vec<Payload>) -> Self {
        Self::new(payloads.into_iter().map(TrackRequest::new).collect())
    }

    pub fn with_completion<F>(mut self, completion: F) -> Self
    where
        F: FnOnce(TrackOutcome) + Send + 'static,
    {
        self.completion = Some(Box::new(completion));
        self
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Borrow every payload in dispatch order
    pub fn payloads(&self) -> Vec<&Payload> {
        self.requests.iter().map(|r| &r.payload).collect()
    }

    /// Consume the batch, keeping only the payloads in dispatch order
    pub fn into_payloads(self) -> Vec<Payload> {
        self.requests.into_iter().map(|r| r.payload).collect()
    }

    pub fn take_completion(&mut self) -> Option<Completion> {
        self.completion.take()
    }

    /// Copy of the batch with no completions attached anywhere
    pub fn detached(&self) -> Self {
        Self {
            requests: self.requests.iter().map(TrackRequest::detached).collect(),
            module_responses: self.module_responses.clone(),
            completion: None,
        }
    }

    /// Resolve the shared completion
    pub fn complete(mut self, mut outcome: TrackOutcome) {
        if let Some(completion) = self.completion.take() {
            let mut responses = std::mem::take(&mut self.module_responses);
            responses.append(&mut outcome.module_responses);
            outcome.module_responses = responses;
            completion(outcome);
        }
    }
}

impl fmt::Debug for BatchTrackRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchTrackRequest")
            .field("requests", &self.requests)
            .field("module_responses", &self.module_responses)
            .field("has_completion", &self.completion.is_some())
            .finish()
    }
}

// ============================================
// Dispatch Request
// ============================================

/// What a dispatcher receives: one event or an ordered batch
#[derive(Debug)]
pub enum DispatchRequest {
    Track(TrackRequest),
    Batch(BatchTrackRequest),
}

impl DispatchRequest {
    /// Number of events carried
    pub fn event_count(&self) -> usize {
        match self {
            DispatchRequest::Track(_) => 1,
            DispatchRequest::Batch(batch) => batch.len(),
        }
    }

    pub fn take_completion(&mut self) -> Option<Completion> {
        match self {
            DispatchRequest::Track(request) => request.take_completion(),
            DispatchRequest::Batch(batch) => batch.take_completion(),
        }
    }

    pub fn detached(&self) -> Self {
        match self {
            DispatchRequest::Track(request) => DispatchRequest::Track(request.detached()),
            DispatchRequest::Batch(batch) => DispatchRequest::Batch(batch.detached()),
        }
    }

    /// Tag every carried payload with the receiving dispatcher's id
    pub fn with_dispatch_service(self, module_id: &str) -> Self {
        match self {
            DispatchRequest::Track(request) => {
                DispatchRequest::Track(request.with_dispatch_service(module_id))
            }
            DispatchRequest::Batch(mut batch) => {
                batch.requests = batch
                    .requests
                    .into_iter()
                    .map(|r| r.with_dispatch_service(module_id))
                    .collect();
                DispatchRequest::Batch(batch)
            }
        }
    }

    pub fn complete(self, outcome: TrackOutcome) {
        match self {
            DispatchRequest::Track(request) => request.complete(outcome),
            DispatchRequest::Batch(batch) => batch.complete(outcome),
        }
    }

    /// Payloads in dispatch order
    pub fn payloads(&self) -> Vec<&Payload> {
        match self {
            DispatchRequest::Track(request) => vec![&request.payload],
            DispatchRequest::Batch(batch) => batch.payloads(),
        }
    }
}

impl From<TrackRequest> for DispatchRequest {
    fn from(request: TrackRequest) -> Self {
        DispatchRequest::Track(request)
    }
}

impl From<BatchTrackRequest> for DispatchRequest {
    fn from(batch: BatchTrackRequest) -> Self {
        DispatchRequest::Batch(batch)
    }
}
