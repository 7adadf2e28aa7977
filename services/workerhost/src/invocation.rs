//! Invocation registry.
//!
//! Follows the `PendingRequest` / oneshot-response pattern used elsewhere in
//! the host: each in-flight call owns a single-producer/single-consumer
//! completion handle, and the channel's executor is the only writer —
//! task-completion sources used as one-shot promises.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::protocol::{RpcInput, RpcValue, StatusResult};
use crate::trace::TraceContext;

/// Outcome delivered to an invocation's result sink exactly once.
#[derive(Clone)]
pub enum InvocationOutcome {
    Success(Vec<RpcValue>),
    Failure(String),
    Cancelled,
}

impl InvocationOutcome {
    pub fn from_status(status: StatusResult, outputs: Vec<RpcValue>, error_message: Option<String>) -> Self {
        match status {
            StatusResult::Success => Self::Success(outputs),
            StatusResult::Failure => Self::Failure(error_message.unwrap_or_default()),
            StatusResult::Cancelled => Self::Cancelled,
        }
    }
}

/// One in-flight function call.
pub struct Invocation {
    pub invocation_id: String,
    pub function_id: String,
    pub trace_context: TraceContext,
    pub registered_at: Instant,
    /// Retained so a function still `Pending` at send time can be dispatched
    /// later, once its load response arrives, with its original inputs.
    pub inputs: Vec<RpcInput>,
    result_sink: Option<oneshot::Sender<InvocationOutcome>>,
}

impl Invocation {
    pub fn new(
        invocation_id: impl Into<String>,
        function_id: impl Into<String>,
        trace_context: TraceContext,
        inputs: Vec<RpcInput>,
    ) -> (Self, oneshot::Receiver<InvocationOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                invocation_id: invocation_id.into(),
                function_id: function_id.into(),
                trace_context,
                registered_at: Instant::now(),
                inputs,
                result_sink: Some(tx),
            },
            rx,
        )
    }

    /// Signal the result sink exactly once. Subsequent calls are no-ops: the
    /// sink is consumed on first use, which is what makes "exactly one
    /// terminal signal" structurally true rather than merely intended.
    pub fn signal(&mut self, outcome: InvocationOutcome) {
        if let Some(sink) = self.result_sink.take() {
            let _ = sink.send(outcome);
        }
    }

    pub fn already_signalled(&self) -> bool {
        self.result_sink.is_none()
    }
}

/// Tracks in-flight invocations; correlates responses; drives cancellation
/// and drain.
#[derive(Default)]
pub struct InvocationRegistry {
    inflight: HashMap<String, Invocation>,
}

impl InvocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, invocation: Invocation) {
        self.inflight.insert(invocation.invocation_id.clone(), invocation);
    }

    pub fn contains(&self, invocation_id: &str) -> bool {
        self.inflight.contains_key(invocation_id)
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    /// Remove and return the invocation for a terminal response, local
    /// cancellation, or channel-level failure. Logs-and-drops (returns
    /// `None`) when the id is unknown.
    pub fn remove(&mut self, invocation_id: &str) -> Option<Invocation> {
        self.inflight.remove(invocation_id)
    }

    pub fn get_mut(&mut self, invocation_id: &str) -> Option<&mut Invocation> {
        self.inflight.get_mut(invocation_id)
    }

    pub fn peek(&self, invocation_id: &str) -> Option<&Invocation> {
        self.inflight.get(invocation_id)
    }

    /// `TryFailExecutions`: signal every in-flight invocation with a fault
    /// and clear the registry. Idempotent — calling it on an empty registry
    /// is a no-op, so applying it twice equals applying it once.
    pub fn fail_all(&mut self, reason: &str) {
        for (_, mut invocation) in self.inflight.drain() {
            invocation.signal(InvocationOutcome::Failure(reason.to_string()));
        }
    }

    /// Channel-level cancellation: every in-flight invocation completes with
    /// `Cancelled` rather than a fault.
    pub fn cancel_all(&mut self) {
        for (_, mut invocation) in self.inflight.drain() {
            invocation.signal(InvocationOutcome::Cancelled);
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.inflight.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signalled_exactly_once() {
        let (mut inv, rx) = Invocation::new("i1", "f1", TraceContext::empty(), vec![]);
        inv.signal(InvocationOutcome::Success(vec![]));
        inv.signal(InvocationOutcome::Failure("double signal".into()));

        match rx.await.unwrap() {
            InvocationOutcome::Success(_) => {},
            other => panic!("expected first signal to win, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fail_all_is_idempotent() {
        let mut registry = InvocationRegistry::new();
        let (inv, rx) = Invocation::new("i1", "f1", TraceContext::empty(), vec![]);
        registry.register(inv);

        registry.fail_all("boom");
        registry.fail_all("boom again"); // second application: no-op, registry already empty

        assert!(registry.is_empty());
        assert!(matches!(rx.await.unwrap(), InvocationOutcome::Failure(_)));
    }

    #[tokio::test]
    async fn is_executing_reflects_registry_membership() {
        let mut registry = InvocationRegistry::new();
        let (inv, _rx) = Invocation::new("i1", "f1", TraceContext::empty(), vec![]);
        registry.register(inv);
        assert!(registry.contains("i1"));
        registry.remove("i1");
        assert!(!registry.contains("i1"));
    }
}

impl std::fmt::Debug for InvocationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success(outputs) => f.debug_tuple("Success").field(&outputs.len()).finish(),
            Self::Failure(msg) => f.debug_tuple("Failure").field(msg).finish(),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}
