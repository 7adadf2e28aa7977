//! Function Load Manager.
//!
//! Orders, batches, and tracks function-load requests/responses.
//! Follows the `ChannelEntry`/registry-of-entries pattern used elsewhere in
//! the host, adapted from "one entry per channel" to "one entry per function
//! on this channel".

use std::collections::VecDeque;

use crate::capability::{known, CapabilitySet};
use crate::error::{Result, WorkerChannelError};
use crate::protocol::{
    FunctionLoadRequest, FunctionLoadRequestCollection, FunctionLoadResponse, FunctionMetadata,
};

/// A bound on how many invocations may queue behind a not-yet-loaded
/// function. Picks an explicit cap, logging when it is hit, rather than
/// let a slow load turn into unbounded memory growth.
pub const MAX_BUFFERED_INVOCATIONS_PER_FUNCTION: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Pending,
    Loaded,
    Failed,
}

/// One function registered with this worker.
pub struct FunctionLoadEntry {
    pub metadata: FunctionMetadata,
    pub status: LoadStatus,
    /// FIFO of invocation ids buffered while `Pending`.
    pub buffer: VecDeque<String>,
}

impl FunctionLoadEntry {
    fn new(metadata: FunctionMetadata) -> Self {
        Self {
            metadata,
            status: LoadStatus::Pending,
            buffer: VecDeque::new(),
        }
    }

    /// Buffer an invocation while pending. Returns `Err` if the bound is hit
    /// or the function isn't pending (caller should dispatch or fail
    /// immediately instead).
    pub fn buffer_invocation(&mut self, invocation_id: String) -> Result<()> {
        if self.status != LoadStatus::Pending {
            return Err(WorkerChannelError::protocol_violation(format!(
                "cannot buffer invocation for function {} in status {:?}",
                self.metadata.function_id, self.status
            )));
        }
        if self.buffer.len() >= MAX_BUFFERED_INVOCATIONS_PER_FUNCTION {
            return Err(WorkerChannelError::load_failure(
                &self.metadata.function_id,
                "buffered invocation queue full",
            ));
        }
        self.buffer.push_back(invocation_id);
        Ok(())
    }
}

/// Orders, batches, and tracks load requests/responses for every function
/// registered with this worker.
#[derive(Default)]
pub struct FunctionLoadManager {
    entries: Vec<FunctionLoadEntry>,
    buffers_set_up: bool,
}

impl FunctionLoadManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// `SetupFunctionInvocationBuffers`: create a pending entry per metadata
    /// record. Until this runs, `is_ready_for_invocations` is false.
    pub fn setup_buffers(&mut self, metadata: Vec<FunctionMetadata>) {
        self.entries = metadata.into_iter().map(FunctionLoadEntry::new).collect();
        self.buffers_set_up = true;
    }

    pub fn is_ready_for_invocations(&self) -> bool {
        self.buffers_set_up
    }

    pub fn entry(&self, function_id: &str) -> Option<&FunctionLoadEntry> {
        self.entries.iter().find(|e| e.metadata.function_id == function_id)
    }

    pub fn entry_mut(&mut self, function_id: &str) -> Option<&mut FunctionLoadEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.metadata.function_id == function_id)
    }

    /// Build the ordered load request(s): enabled functions first, disabled
    /// last, ties broken by insertion order. Returns either a single
    /// collection or one request per function, depending on the negotiated
    /// `SupportsLoadResponseCollection` capability.
    pub fn build_load_requests(&self, caps: &CapabilitySet) -> LoadRequestPlan {
        let mut ordered: Vec<&FunctionLoadEntry> = self.entries.iter().collect();
        // stable sort: enabled (disabled=false) first, ties keep original
        // (insertion) order because `sort_by_key` is stable.
        ordered.sort_by_key(|e| e.metadata.disabled);

        let requests: Vec<FunctionLoadRequest> = ordered
            .into_iter()
            .map(|e| FunctionLoadRequest {
                function_id: e.metadata.function_id.clone(),
                metadata: e.metadata.clone(),
            })
            .collect();

        if caps.has(known::SUPPORTS_LOAD_RESPONSE_COLLECTION) {
            LoadRequestPlan::Collection(FunctionLoadRequestCollection { requests })
        } else {
            LoadRequestPlan::PerFunction(requests)
        }
    }

    /// Apply a single function's load response: transition its entry,
    /// returning the invocation ids to flush (dispatch) or fail.
    pub fn apply_response(&mut self, response: &FunctionLoadResponse) -> LoadApplyOutcome {
        let Some(entry) = self.entry_mut(&response.function_id) else {
            return LoadApplyOutcome::UnknownFunction;
        };

        use crate::protocol::StatusResult;
        match response.result {
            StatusResult::Success => {
                entry.status = LoadStatus::Loaded;
                let flush: Vec<String> = entry.buffer.drain(..).collect();
                LoadApplyOutcome::Loaded { flush }
            },
            StatusResult::Failure | StatusResult::Cancelled => {
                entry.status = LoadStatus::Failed;
                let fail: Vec<String> = entry.buffer.drain(..).collect();
                LoadApplyOutcome::Failed {
                    fail,
                    reason: response
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "function load failed".to_string()),
                }
            },
        }
    }

    pub fn loaded_count(&self) -> usize {
        self.entries.iter().filter(|e| e.status == LoadStatus::Loaded).count()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.status == LoadStatus::Pending).count()
    }

    pub fn failed_count(&self) -> usize {
        self.entries.iter().filter(|e| e.status == LoadStatus::Failed).count()
    }
}

pub enum LoadRequestPlan {
    PerFunction(Vec<FunctionLoadRequest>),
    Collection(FunctionLoadRequestCollection),
}

pub enum LoadApplyOutcome {
    Loaded { flush: Vec<String> },
    Failed { fail: Vec<String>, reason: String },
    UnknownFunction,
}

fn metadata(function_id: &str, disabled: bool) -> FunctionMetadata {
    FunctionMetadata {
        function_id: function_id.to_string(),
        name: function_id.to_string(),
        language: "test".to_string(),
        disabled,
        triggers: vec![],
        bindings: vec![],
    }
}
