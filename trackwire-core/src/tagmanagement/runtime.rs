//! Script runtime interface
//!
//! The host embeds the actual webview and implements [`TagRuntime`] on top of
//! it. Every method returns immediately; results arrive through the supplied
//! callback on whatever thread the host chooses. The runtime is responsible
//! for confining script execution to its own thread.

use crate::error::DispatchError;
use crate::types::Payload;

/// Callback for `enable`: `(ready, error)`
pub type EnableCompletion = Box<dyn FnOnce(bool, Option<DispatchError>) + Send + 'static>;

/// Callback for `track`, `track_multiple` and `reload`: `(success, info, error)`
pub type RuntimeCompletion =
    Box<dyn FnOnce(bool, Option<Payload>, Option<DispatchError>) + Send + 'static>;

/// Embedded script execution runtime
pub trait TagRuntime: Send + Sync {
    /// Load the page at `url`
    fn enable(&self, url: &str, completion: EnableCompletion);

    /// Whether the loaded page can accept events right now
    fn is_ready(&self) -> bool;

    fn track(&self, payload: Payload, completion: RuntimeCompletion);

    fn track_multiple(&self, payloads: Vec<Payload>, completion: RuntimeCompletion);

    /// Reload the page after a failure
    fn reload(&self, completion: RuntimeCompletion);

    /// Run a script, fire-and-forget
    fn evaluate_script(&self, script: &str);
}
