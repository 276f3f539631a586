use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::TagManagementConfig;
use crate::error::DispatchError;
use crate::executor::SerialQueue;
use crate::modules::{Dispatcher, ModuleCompletion};
use crate::types::{DispatchRequest, ModuleResponse, Payload};

use super::remote::{spawn_bridge, RemoteCommandSender};
use super::runtime::{RuntimeCompletion, TagRuntime};
use super::state::{ErrorCounter, ReadinessState};

/// Module id of the tag management dispatcher
pub const MODULE_ID: &str = "tagmanagement";

type Pending = (DispatchRequest, ModuleCompletion);

struct TagState {
    readiness: ReadinessState,
    pending: VecDeque<Pending>,
    /// A thread is draining `pending`; new requests must queue behind it
    replaying: bool,
}

struct Inner {
    runtime: Arc<dyn TagRuntime>,
    state: Mutex<TagState>,
    errors: ErrorCounter,
    max_pending: usize,
    completions: SerialQueue,
}

/// Dispatcher backed by a [`TagRuntime`]
pub struct TagManagementDispatcher {
    inner: Arc<Inner>,
    remote: RemoteCommandSender,
}

impl TagManagementDispatcher {
    /// Create the dispatcher and start loading `config.url` if one is set
    pub fn new(config: &TagManagementConfig, runtime: Arc<dyn TagRuntime>) -> Self {
        let remote = spawn_bridge(Arc::clone(&runtime), config.remote_command_buffer);
        let dispatcher = Self {
            inner: Arc::new(Inner {
                runtime,
                state: Mutex::new(TagState {
                    readiness: ReadinessState::NotReady,
                    pending: VecDeque::new(),
                    replaying: false,
                }),
                errors: ErrorCounter::default(),
                max_pending: config.max_pending_requests.max(1),
                completions: SerialQueue::new("trackwire-tagmanagement"),
            }),
            remote,
        };

        if let Some(url) = config.url.as_deref() {
            dispatcher.enable(url);
        }
        dispatcher
    }

    /// Load `url` into the runtime. Buffered requests are replayed once it
    /// reports ready.
    pub fn enable(&self, url: &str) {
        tracing::info!(url, "Loading tag management runtime");
        let inner = Arc::clone(&self.inner);
        self.inner
            .runtime
            .enable(url, Box::new(move |ready, error| inner.on_loaded(ready, error)));
    }

    pub fn readiness(&self) -> ReadinessState {
        self.inner.state().readiness
    }

    pub fn error_count(&self) -> u32 {
        self.inner.errors.value()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state().pending.len()
    }

    /// Handle for remote command handlers to push response scripts
    pub fn remote_commands(&self) -> RemoteCommandSender {
        self.remote.clone()
    }
}

impl Dispatcher for TagManagementDispatcher {
    fn id(&self) -> &str {
        MODULE_ID
    }

    fn dynamic_track(&self, request: DispatchRequest, completion: ModuleCompletion) {
        self.inner.track(request, completion);
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, TagState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn track(self: &Arc<Self>, request: DispatchRequest, completion: ModuleCompletion) {
        if self.errors.is_unhealthy() {
            self.reload_then_track(request, completion);
            return;
        }

        let runtime_ready = self.runtime.is_ready();
        let mut state = self.state();
        let ready = state.readiness.is_ready() && runtime_ready;

        if ready && !state.replaying && state.pending.is_empty() {
            drop(state);
            self.send(request, completion);
            return;
        }

        // Anything buffered, or still being replayed, goes out ahead of this request
        let dropped = self.push_pending(&mut state, (request, completion));
        let drain = ready && !state.replaying;
        if drain {
            state.replaying = true;
        } else {
            tracing::debug!(
                readiness = ?state.readiness,
                runtime_ready,
                replaying = state.replaying,
                "Buffering request"
            );
        }
        drop(state);

        self.drop_overflow(dropped);
        if drain {
            self.drain_pending();
        }
    }

    /// Send buffered requests oldest first until the buffer is empty.
    ///
    /// Only the thread that set `replaying` runs this. Requests arriving in
    /// the meantime are appended to the buffer, so they go out after it.
    fn drain_pending(self: &Arc<Self>) {
        let mut replayed = 0usize;
        loop {
            let runtime_ready = self.runtime.is_ready();
            let next = {
                let mut state = self.state();
                let next = if state.readiness.is_ready() && runtime_ready {
                    state.pending.pop_front()
                } else {
                    None
                };
                if next.is_none() {
                    state.replaying = false;
                }
                next
            };

            let Some((request, completion)) = next else {
                break;
            };
            replayed += 1;
            self.send(request, completion);
        }

        if replayed > 0 {
            tracing::debug!(count = replayed, "Replayed buffered requests");
        }
    }

    fn reload_then_track(self: &Arc<Self>, request: DispatchRequest, completion: ModuleCompletion) {
        tracing::debug!(errors = self.errors.value(), "Reloading runtime before dispatch");
        let inner = Arc::clone(self);
        self.runtime.reload(Box::new(move |success, _info, error| {
            if success {
                inner.errors.reset();
                inner.state().readiness = ReadinessState::LoadSuccess;
                inner.track(request, completion);
            } else {
                let failures = inner.errors.increment();
                tracing::warn!(failures, error = ?error, "Runtime reload failed, buffering request");
                let dropped = {
                    let mut state = inner.state();
                    state.readiness = ReadinessState::LoadFailure;
                    inner.push_pending(&mut state, (request, completion))
                };
                inner.drop_overflow(dropped);
            }
        }));
    }

    fn push_pending(&self, state: &mut TagState, pending: Pending) -> Option<Pending> {
        state.pending.push_back(pending);
        if state.pending.len() > self.max_pending {
            state.pending.pop_front()
        } else {
            None
        }
    }

    fn drop_overflow(&self, dropped: Option<Pending>) {
        let Some((request, completion)) = dropped else {
            return;
        };
        tracing::warn!(
            events = request.event_count(),
            max = self.max_pending,
            "Pending buffer full, dropping oldest request"
        );
        self.completions.dispatch(move || {
            completion(ModuleResponse::failure(
                MODULE_ID,
                DispatchError::Dropped("tag management pending buffer full".to_string()),
            ))
        });
    }

    fn send(self: &Arc<Self>, request: DispatchRequest, completion: ModuleCompletion) {
        let inner = Arc::clone(self);
        let done: RuntimeCompletion = Box::new(move |success, info, error| {
            let handler = Arc::clone(&inner);
            inner
                .completions
                .dispatch(move || handler.finish(success, info, error, completion));
        });

        match request {
            DispatchRequest::Track(request) => self.runtime.track(request.payload, done),
            DispatchRequest::Batch(batch) => self.runtime.track_multiple(batch.into_payloads(), done),
        }
    }

    fn finish(
        &self,
        success: bool,
        info: Option<Payload>,
        error: Option<DispatchError>,
        completion: ModuleCompletion,
    ) {
        let error = match (success, error) {
            (_, Some(error)) => Some(error),
            (false, None) => Some(DispatchError::Runtime("runtime rejected the request".to_string())),
            (true, None) => None,
        };

        match error {
            Some(error) => {
                let failures = self.errors.increment();
                tracing::warn!(failures, %error, "Tag management dispatch failed");
                completion(ModuleResponse::failure(MODULE_ID, error));
            }
            None => {
                self.errors.reset();
                completion(ModuleResponse::success(MODULE_ID, info));
            }
        }
    }

    fn on_loaded(self: &Arc<Self>, ready: bool, error: Option<DispatchError>) {
        if !ready {
            let failures = self.errors.increment();
            self.state().readiness = ReadinessState::LoadFailure;
            tracing::warn!(failures, error = ?error, "Tag management runtime failed to load");
            return;
        }

        self.errors.reset();
        let (buffered, drain) = {
            let mut state = self.state();
            state.readiness = ReadinessState::LoadSuccess;
            let drain = !state.replaying;
            state.replaying = true;
            (state.pending.len(), drain)
        };
        tracing::info!(buffered, "Tag management runtime ready");

        if drain {
            self.drain_pending();
        }
    }
}
