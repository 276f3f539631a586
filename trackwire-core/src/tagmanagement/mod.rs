//! Tag management dispatcher
//!
//! Delivers events to an embedded script runtime whose readiness is
//! asynchronous and whose failures need a reload before retrying.
//!
//! ```text
//!   NotReady ──enable ok──► LoadSuccess ◄──reload ok──┐
//!      │                        │                     │
//!   enable failed          dispatch error        LoadFailure
//!      └──────────► errors > 0 ─┴──reload failed──────┘
//! ```
//!
//! Requests that cannot be delivered yet wait in a bounded pending buffer
//! and are replayed oldest first before the next deliverable request.

mod dispatcher;
mod remote;
mod runtime;
mod state;

pub use dispatcher::{TagManagementDispatcher, MODULE_ID};
pub use remote::{RemoteCommandExecuted, RemoteCommandSender};
pub use runtime::{EnableCompletion, RuntimeCompletion, TagRuntime};
pub use state::{ErrorCounter, ReadinessState};
