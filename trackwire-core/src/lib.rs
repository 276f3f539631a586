//! # trackwire-core
//!
//! Event dispatch pipeline for analytics SDKs.
//!
//! This library provides:
//! - Track and batch request types with exactly-once completions
//! - A module registry of collectors, dispatchers and validators
//! - A persistent dispatch queue with batching, expiry and connectivity-aware release
//! - A tag management dispatcher for embedded script runtimes
//! - An HTTP collect dispatcher
//! - Configuration and logging infrastructure
//!
//! ## Architecture
//!
//! ```text
//!  Tracker::track ─► collectors + EventDataManager ─► validators
//!                                                        │
//!                         DispatchQueueModule ◄──────────┘
//!                          │ queue        │ forward
//!                          ▼              ▼
//!                   PersistentQueue   ModuleRegistry::dispatch ─► Collect, TagManagement, ...
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use trackwire_core::{Config, Tracker, TrackRequest};
//!
//! let config = Config::load().expect("failed to load config");
//! let tracker = Tracker::open(config).expect("failed to open store");
//!
//! tracker.track(TrackRequest::event("app_open").with_completion(|outcome| {
//!     println!("delivered: {}", outcome.success);
//! }));
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use connectivity::{ConnectionStatus, ConnectionType};
pub use error::{DispatchError, Error, Result};
pub use queue::TrackDecision;
pub use tracker::Tracker;
pub use types::*;

// Public modules
pub mod config;
pub mod connectivity;
pub mod data;
pub mod dispatchers;
pub mod error;
pub mod executor;
pub mod logging;
pub mod modules;
pub mod queue;
pub mod storage;
pub mod tagmanagement;
pub mod tracker;
pub mod types;
