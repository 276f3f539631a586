//! Collects module responses for one fanned-out request

use std::sync::{Arc, Mutex};

use crate::types::{Completion, ModuleResponse, TrackOutcome};

struct FanoutState {
    remaining: usize,
    responses: Vec<ModuleResponse>,
    completion: Option<Completion>,
}

/// Fires the original completion once every dispatcher has responded
pub(super) struct Fanout {
    state: Mutex<FanoutState>,
}

impl Fanout {
    pub(super) fn new(expected: usize, completion: Option<Completion>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FanoutState {
                remaining: expected,
                responses: Vec::with_capacity(expected),
                completion,
            }),
        })
    }

    pub(super) fn record(&self, response: ModuleResponse) {
        let finished = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.remaining == 0 {
                tracing::warn!(module = %response.module_id, "Module responded more than once");
                return;
            }
            state.remaining -= 1;
            state.responses.push(response);

            if state.remaining == 0 {
                let responses = std::mem::take(&mut state.responses);
                state.completion.take().map(|c| (c, responses))
            } else {
                None
            }
        };

        // Completion runs outside the lock; it may re-enter the pipeline
        if let Some((completion, responses)) = finished {
            completion(TrackOutcome::from_responses(responses));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_fires_after_last_response_only() {
        let (tx, rx) = mpsc::channel();
        let fanout = Fanout::new(
            2,
            Some(Box::new(move |outcome: TrackOutcome| tx.send(outcome).unwrap())),
        );

        fanout.record(ModuleResponse::success("a", None));
        assert!(rx.try_recv().is_err());

        fanout.record(ModuleResponse::success("b", None));
        let outcome = rx.try_recv().unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.module_responses.len(), 2);

        // Extra responses are ignored
        fanout.record(ModuleResponse::success("a", None));
        assert!(rx.try_recv().is_err());
    }
}
