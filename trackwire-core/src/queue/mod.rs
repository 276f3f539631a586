//! Persistent dispatch queue and the orchestrator that feeds it
//!
//! ## Architecture
//!
//! ```text
//!  track() ─► DispatchQueueModule ──forward now──► ModuleDelegate ─► dispatchers
//!                   │        ▲
//!              enqueue    release (connectivity restored, batch size,
//!                   ▼        │     explicit flush, dispatch-after timer)
//!              PersistentQueue ◄──► DiskStore ("dispatch_queue")
//! ```
//!
//! The queue is owned by the orchestrator; every read-modify-write of the
//! stored entries happens under the orchestrator's state lock.

mod orchestrator;
mod persistent;

pub use orchestrator::{DispatchQueueModule, QueuePolicy, TrackDecision, MODULE_ID};
pub use persistent::{PersistentQueue, QueueEntry, QUEUE_KEY};
