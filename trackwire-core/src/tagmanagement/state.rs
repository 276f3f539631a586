//! Readiness and error state shared between runtime callbacks

use std::sync::atomic::{AtomicU32, Ordering};

/// Load status of the tag management runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadinessState {
    #[default]
    NotReady,
    LoadFailure,
    LoadSuccess,
}

impl ReadinessState {
    pub fn is_ready(self) -> bool {
        self == ReadinessState::LoadSuccess
    }
}

/// Consecutive dispatch/reload failures; any value above zero means unhealthy
#[derive(Debug, Default)]
pub struct ErrorCounter(AtomicU32);

impl ErrorCounter {
    pub fn increment(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst).saturating_add(1)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    pub fn value(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_unhealthy(&self) -> bool {
        self.value() > 0
    }
}
