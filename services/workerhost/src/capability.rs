//! Negotiated capability set.
//!
//! Empty until `WorkerInitResponse` arrives; immutable afterward. Reading it
//! after `Initialized` must always yield the same map regardless of when it
//! is read.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Well-known capability names the channel gates protocol branches on.
pub mod known {
    pub const HANDLES_WORKER_TERMINATE: &str = "HandlesWorkerTerminate";
    pub const HANDLES_INVOCATION_CANCEL: &str = "HandlesInvocationCancel";
    pub const SUPPORTS_LOAD_RESPONSE_COLLECTION: &str = "SupportsLoadResponseCollection";
    pub const SHARED_MEMORY_DATA_TRANSFER: &str = "SharedMemoryDataTransfer";
    pub const RAW_HTTP_BODY_BYTES: &str = "RawHttpBodyBytes";
    pub const USE_NULLABLE_VALUE_DICTIONARY_FOR_HTTP: &str = "UseNullableValueDictionaryForHttp";
}

/// Capabilities frozen exactly once, at `WorkerInitResponse(success)`.
#[derive(Debug, Default)]
pub struct CapabilitySet {
    frozen: OnceLock<HashMap<String, String>>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Freeze the negotiated capabilities. Subsequent calls are no-ops: the
    /// set is immutable after the first successful init.
    pub fn freeze(&self, caps: HashMap<String, String>) {
        let _ = self.frozen.set(caps);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.get().is_some()
    }

    pub fn has(&self, name: &str) -> bool {
        self.frozen.get().is_some_and(|m| m.contains_key(name))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.frozen.get().and_then(|m| m.get(name)).map(String::as_str)
    }

    /// Snapshot of the frozen map, or empty if not yet initialized.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.frozen.get().cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.frozen.get().map(HashMap::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
