//! Built-in dispatchers
//!
//! The tag management dispatcher lives in [`crate::tagmanagement`] because
//! of its state machine; the dispatchers here are thin forwarders.

pub mod collect;

pub use collect::{CollectClient, CollectDispatcher};
