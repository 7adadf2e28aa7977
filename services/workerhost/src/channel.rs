//! The Worker Channel: owns one worker subprocess and one bidirectional RPC
//! stream, and exposes the verbs the host uses to drive it.
//!
//! Serialization model: a single `tokio::sync::Mutex<ChannelInner>` is the
//! channel's logical executor. Every verb and
//! every inbound message from the Message Pump locks it before touching
//! state, which gives the required total order of state transitions and
//! registry mutations without a hand-rolled actor mailbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Span};

use crate::capability::{known, CapabilitySet};
use crate::config::{ChannelConfig, HostEnvironment};
use crate::error::{ErrorExt, Result, WorkerChannelError};
use crate::event_bus::EventBus;
use crate::function_load::{FunctionLoadManager, LoadApplyOutcome, LoadRequestPlan};
use crate::invocation::{Invocation, InvocationOutcome, InvocationRegistry};
use crate::latency_probe::LatencyProbe;
use crate::metrics::{forward_log, MetricEvent, MetricsSink, NullMetricsSink, Phase};
use crate::process::{ProcessHandle, ProcessSupervisor};
use crate::protocol::{
    FunctionEnvironmentReloadRequest, FunctionLoadResponse, FunctionMetadata, InvocationCancel,
    InvocationRequest, InvocationResponse, RpcInput, RpcValue, StatusResult, StreamingMessage,
    WorkerInitRequest, WorkerStatusRequest, WorkerTerminate,
};
use crate::shared_memory::SharedMemoryManager;
use crate::state::{ChannelState, Verb};
use crate::trace::TraceContext;

const HOST_VERSION: &str = "1.0.0";
const PROTOCOL_VERSION: &str = "v1";

/// Point-in-time operational snapshot, following the `BridgeStats`/
/// `diagnostics()` convention used elsewhere in the host.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub worker_id: String,
    pub language: String,
    pub state: ChannelState,
    pub capability_count: usize,
    pub inflight_invocations: usize,
    pub functions_loaded: usize,
    pub functions_pending: usize,
    pub functions_failed: usize,
    pub latency_samples: usize,
}

struct ChannelInner {
    state: ChannelState,
    registry: InvocationRegistry,
    function_loads: FunctionLoadManager,
    latency_probe: LatencyProbe,
    drain_waiters: Vec<oneshot::Sender<()>>,
    start_waiter: Option<oneshot::Sender<Result<()>>>,
    reload_waiter: Option<oneshot::Sender<Result<()>>>,
    load_batch: Option<LoadBatchWaiter>,
    process: Option<ProcessHandle>,
}

struct LoadBatchWaiter {
    remaining: std::collections::HashSet<String>,
    reply: oneshot::Sender<Result<()>>,
}

impl ChannelInner {
    fn new() -> Self {
        Self {
            state: ChannelState::Created,
            registry: InvocationRegistry::new(),
            function_loads: FunctionLoadManager::new(),
            latency_probe: LatencyProbe::new(),
            drain_waiters: Vec::new(),
            start_waiter: None,
            reload_waiter: None,
            load_batch: None,
            process: None,
        }
    }

    fn check_drain_complete(&mut self) {
        if self.registry.is_empty() {
            for waiter in self.drain_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    fn fail_channel(&mut self, err: &WorkerChannelError) {
        self.state = ChannelState::Failed;
        self.registry.fail_all(&err.to_string());
        if let Some(w) = self.start_waiter.take() {
            let _ = w.send(Err(err.clone()));
        }
        if let Some(w) = self.reload_waiter.take() {
            let _ = w.send(Err(err.clone()));
        }
        if let Some(batch) = self.load_batch.take() {
            let _ = batch.reply.send(Err(err.clone()));
        }
        self.check_drain_complete();
    }
}

/// One per worker subprocess. Cheap to clone: everything it owns is behind
/// an `Arc`, so a clone is another handle onto the same running channel.
#[derive(Clone)]
pub struct WorkerChannel {
    worker_id: String,
    language: String,
    config: Arc<ChannelConfig>,
    host_env: Arc<HostEnvironment>,
    event_bus: EventBus,
    supervisor: Arc<dyn ProcessSupervisor>,
    shared_memory: SharedMemoryManager,
    metrics: Arc<dyn MetricsSink>,
    capabilities: Arc<CapabilitySet>,
    inner: Arc<Mutex<ChannelInner>>,
    span: Span,
}

impl std::fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerChannel").field("worker_id", &self.worker_id).finish()
    }
}

impl WorkerChannel {
    pub fn new(
        worker_id: impl Into<String>,
        config: ChannelConfig,
        host_env: HostEnvironment,
        event_bus: EventBus,
        supervisor: Arc<dyn ProcessSupervisor>,
        shared_memory: SharedMemoryManager,
    ) -> Self {
        let worker_id = worker_id.into();
        let span = tracing::info_span!("worker_channel", worker_id = %worker_id);
        Self {
            language: config.language.clone(),
            worker_id,
            config: Arc::new(config),
            host_env: Arc::new(host_env),
            event_bus,
            supervisor,
            shared_memory,
            metrics: Arc::new(NullMetricsSink),
            capabilities: Arc::new(CapabilitySet::new()),
            inner: Arc::new(Mutex::new(ChannelInner::new())),
            span,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Routing key this channel publishes host→worker messages under. Kept
    /// distinct from `worker_id` (which this channel subscribes to for
    /// worker→host messages) so a single shared `EventBus` can carry both
    /// directions without a publisher racing its own subscription.
    fn outbound_address(&self) -> String {
        format!("{}::to-worker", self.worker_id)
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub async fn state(&self) -> ChannelState {
        self.inner.lock().await.state
    }

    pub async fn is_executing_invocation(&self, invocation_id: &str) -> bool {
        self.inner.lock().await.registry.contains(invocation_id)
    }

    pub async fn is_ready_for_invocations(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.state.accepts_invocations() && inner.function_loads.is_ready_for_invocations()
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        let inner = self.inner.lock().await;
        Diagnostics {
            worker_id: self.worker_id.clone(),
            language: self.language.clone(),
            state: inner.state,
            capability_count: self.capabilities.len(),
            inflight_invocations: inner.registry.len(),
            functions_loaded: inner.function_loads.loaded_count(),
            functions_pending: inner.function_loads.pending_count(),
            functions_failed: inner.function_loads.failed_count(),
            latency_samples: inner.latency_probe.latencies().len(),
        }
    }

    // ------------------------------------------------------------------
    // §4.2 Start / Init protocol
    // ------------------------------------------------------------------

    /// Starts the subprocess, waits for `StartStream`, runs the init
    /// handshake, and freezes capabilities. Completes with `Cancelled` if
    /// `cancel` fires before init finishes.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let _enter = self.span.enter();
        {
            let mut inner = self.inner.lock().await;
            inner.state.check(Verb::Start)?;
            inner.state = ChannelState::Starting;
        }

        let mut subscription = self.event_bus.subscribe(self.worker_id.clone());

        let process = match self
            .supervisor
            .start(&self.worker_id, &self.config.executable, &self.config.worker_directory)
            .await
        {
            Ok(p) => p,
            Err(e) => {
                self.inner.lock().await.fail_channel(&e);
                return Err(e);
            },
        };
        {
            let mut inner = self.inner.lock().await;
            inner.process = Some(process);
            inner.state = ChannelState::Started;
        }

        self.metrics.record(&self.worker_id, MetricEvent::PhaseBegin(Phase::Start));

        // Wait for StartStream, bounded by the startup timeout, racing the
        // caller's cancellation.
        if let Err(err) = Self::await_with_timeout_and_cancel(
            &mut subscription,
            is_start_stream,
            self.config.startup_timeout,
            &cancel,
            "startup",
        )
        .await
        {
            self.inner.lock().await.fail_channel(&err);
            return Err(err);
        }

        {
            let mut inner = self.inner.lock().await;
            inner.state = ChannelState::Initializing;
        }
        self.metrics.record(&self.worker_id, MetricEvent::PhaseBegin(Phase::Init));

        if self.host_env.v2_compatibility_mode {
            info!(worker_id = %self.worker_id, "V2 compatibility mode enabled for WorkerInitRequest");
        }

        let mut host_capabilities = HashMap::new();
        host_capabilities.insert(known::HANDLES_WORKER_TERMINATE.to_string(), "1".to_string());
        host_capabilities.insert(known::HANDLES_INVOCATION_CANCEL.to_string(), "1".to_string());
        host_capabilities.insert(known::SUPPORTS_LOAD_RESPONSE_COLLECTION.to_string(), "1".to_string());

        self.event_bus.publish(
            self.outbound_address(),
            StreamingMessage::WorkerInitRequest(WorkerInitRequest {
                host_version: HOST_VERSION.to_string(),
                worker_directory: self.config.worker_directory.clone(),
                function_app_directory: self.config.function_app_directory.clone(),
                protocol_version: PROTOCOL_VERSION.to_string(),
                host_capabilities,
                v2_compatible: self.host_env.v2_compatibility_mode,
            }),
        );

        let init_msg = match Self::await_with_timeout_and_cancel(
            &mut subscription,
            is_init_response,
            self.config.init_timeout,
            &cancel,
            "initialization",
        )
        .await
        {
            Ok(msg) => msg,
            Err(err) => {
                self.inner.lock().await.fail_channel(&err);
                return Err(err);
            },
        };
        let StreamingMessage::WorkerInitResponse(response) = init_msg else {
            let err = WorkerChannelError::protocol_violation("expected WorkerInitResponse");
            self.inner.lock().await.fail_channel(&err);
            return Err(err);
        };

        match response.result {
            StatusResult::Success => {
                self.capabilities.freeze(response.capabilities);
                let mut inner = self.inner.lock().await;
                inner.state = ChannelState::Initialized;
            },
            _ => {
                let err = WorkerChannelError::worker_process_failure(
                    response.error_message.unwrap_or_else(|| "worker init failed".to_string()),
                );
                self.inner.lock().await.fail_channel(&err);
                return Err(err);
            },
        }

        self.metrics.record(&self.worker_id, MetricEvent::PhaseEnd(Phase::Init));
        self.metrics.record(&self.worker_id, MetricEvent::PhaseEnd(Phase::Start));

        self.spawn_pump(subscription);
        if self.host_env.dynamic_concurrency_enabled {
            self.spawn_latency_probe_loop();
        }
        Ok(())
    }

    /// Periodically drives the dynamic-concurrency latency probe until the
    /// channel reaches a terminal state. Only spawned when the host-wide
    /// flag is enabled.
    fn spawn_latency_probe_loop(&self) {
        let channel = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(crate::latency_probe::PROBE_INTERVAL);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                if channel.state().await.is_terminal() {
                    break;
                }
                channel.send_latency_probe().await;
            }
        });
    }

    /// Waits for the first message in `subscription` matching `pred`,
    /// draining and discarding anything else. Used only during the Start/
    /// Init handshake, before the steady-state pump is spawned.
    async fn await_message(
        subscription: &mut crate::event_bus::Subscription,
        pred: fn(&StreamingMessage) -> bool,
    ) -> Option<StreamingMessage> {
        loop {
            let envelope = subscription.recv().await?;
            if pred(&envelope.message) {
                return Some(envelope.message);
            }
        }
    }

    /// Races a bounded wait for the next `pred`-matching message against
    /// cancellation, for the handshake phases where both must be honored.
    async fn await_with_timeout_and_cancel(
        subscription: &mut crate::event_bus::Subscription,
        pred: fn(&StreamingMessage) -> bool,
        timeout: Duration,
        cancel: &CancellationToken,
        phase: &str,
    ) -> Result<StreamingMessage> {
        tokio::select! {
            _ = cancel.cancelled() => Err(WorkerChannelError::Cancelled),
            res = tokio::time::timeout(timeout, Self::await_message(subscription, pred)) => {
                match res {
                    Ok(Some(msg)) => Ok(msg),
                    Ok(None) => Err(WorkerChannelError::protocol_violation(format!(
                        "event bus closed while waiting for {phase}"
                    ))),
                    Err(_) => Err(WorkerChannelError::timeout(phase)),
                }
            }
        }
    }

    /// The Message Pump: the sole consumer of this channel's inbound
    /// subscription from here on, routing by discriminant.
    fn spawn_pump(&self, mut subscription: crate::event_bus::Subscription) {
        let channel = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = subscription.recv().await {
                channel.handle_inbound(envelope.message).await;
            }
        });
    }

    async fn handle_inbound(&self, message: StreamingMessage) {
        match message {
            StreamingMessage::FunctionLoadResponse(resp) => self.on_function_load_response(resp).await,
            StreamingMessage::FunctionLoadResponseCollection(coll) => {
                for resp in coll.responses {
                    self.on_function_load_response(resp).await;
                }
            },
            StreamingMessage::InvocationResponse(resp) => self.on_invocation_response(resp).await,
            StreamingMessage::FunctionEnvironmentReloadResponse(resp) => {
                let mut inner = self.inner.lock().await;
                if let Some(waiter) = inner.reload_waiter.take() {
                    let result = match resp.result {
                        StatusResult::Success => Ok(()),
                        _ => Err(WorkerChannelError::invocation_failure(
                            "environment-reload",
                            resp.error_message.unwrap_or_default(),
                        )),
                    };
                    let _ = waiter.send(result);
                }
                self.metrics
                    .record(&self.worker_id, MetricEvent::SpecializationEnvironmentReloadRequestResponse);
            },
            StreamingMessage::RpcLog(log) => forward_log(&self.worker_id, &log),
            StreamingMessage::WorkerStatusResponse(resp) => {
                self.inner.lock().await.latency_probe.complete(resp.probe_id);
            },
            StreamingMessage::WorkerMetadataResponse(_) => {
                debug!(worker_id = %self.worker_id, "worker metadata response received");
            },
            other => {
                warn!(worker_id = %self.worker_id, kind = other.kind(), "unexpected message for channel state");
            },
        }
    }

    async fn on_function_load_response(&self, resp: FunctionLoadResponse) {
        let mut inner = self.inner.lock().await;
        let function_id = resp.function_id.clone();
        match inner.function_loads.apply_response(&resp) {
            LoadApplyOutcome::Loaded { flush } => {
                drop(inner);
                for invocation_id in flush {
                    self.dispatch_buffered(&invocation_id).await;
                }
                let mut inner = self.inner.lock().await;
                Self::settle_load_batch(&mut inner, &function_id);
            },
            LoadApplyOutcome::Failed { fail, reason } => {
                for invocation_id in fail {
                    if let Some(mut invocation) = inner.registry.remove(&invocation_id) {
                        invocation.signal(InvocationOutcome::Failure(reason.clone()));
                    }
                }
                Self::settle_load_batch(&mut inner, &function_id);
            },
            LoadApplyOutcome::UnknownFunction => {
                warn!(worker_id = %self.worker_id, function_id, "load response for unknown function");
            },
        }
        self.metrics.record(&self.worker_id, MetricEvent::FunctionLoadRequestResponse);
    }

    fn settle_load_batch(inner: &mut ChannelInner, function_id: &str) {
        if let Some(batch) = inner.load_batch.as_mut() {
            batch.remaining.remove(function_id);
            if batch.remaining.is_empty() {
                if let Some(batch) = inner.load_batch.take() {
                    let _ = batch.reply.send(Ok(()));
                }
            }
        }
    }

    async fn on_invocation_response(&self, resp: InvocationResponse) {
        let mut inner = self.inner.lock().await;
        let Some(mut invocation) = inner.registry.remove(&resp.invocation_id) else {
            debug!(worker_id = %self.worker_id, invocation_id = %resp.invocation_id, "InvocationResponse for unknown invocation; dropping");
            return;
        };

        let mut outputs = Vec::with_capacity(resp.outputs.len());
        for output in resp.outputs {
            if let RpcValue::SharedMemory(descriptor) = &output {
                if let Some(bytes) = self.shared_memory.read(descriptor) {
                    self.shared_memory.release(&descriptor.region_name);
                    outputs.push(RpcValue::Bytes(bytes));
                    continue;
                }
            }
            outputs.push(output);
        }

        invocation.signal(InvocationOutcome::from_status(resp.result, outputs, resp.error_message));
        inner.check_drain_complete();
    }

    // ------------------------------------------------------------------
    // §4.3 Function Load Manager
    // ------------------------------------------------------------------

    pub async fn load_functions(&self, metadata: Vec<FunctionMetadata>) -> Result<()> {
        let plan = {
            let mut inner = self.inner.lock().await;
            inner.state.check(Verb::LoadFunctions)?;
            inner.function_loads.setup_buffers(metadata);
            inner.state = ChannelState::LoadingFunctions;
            inner.function_loads.build_load_requests(&self.capabilities)
        };

        self.metrics.record(&self.worker_id, MetricEvent::PhaseBegin(Phase::FunctionLoad));

        let function_ids: std::collections::HashSet<String> = match &plan {
            LoadRequestPlan::PerFunction(reqs) => reqs.iter().map(|r| r.function_id.clone()).collect(),
            LoadRequestPlan::Collection(c) => c.requests.iter().map(|r| r.function_id.clone()).collect(),
        };

        // Nothing was actually requested: no response will ever arrive to
        // resolve a load batch, so there is nothing to wait on.
        if function_ids.is_empty() {
            self.metrics.record(&self.worker_id, MetricEvent::PhaseEnd(Phase::FunctionLoad));
            return Ok(());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            inner.load_batch = Some(LoadBatchWaiter {
                remaining: function_ids,
                reply: reply_tx,
            });
        }

        match plan {
            LoadRequestPlan::PerFunction(reqs) => {
                for req in reqs {
                    self.event_bus
                        .publish(self.outbound_address(), StreamingMessage::FunctionLoadRequest(req));
                }
            },
            LoadRequestPlan::Collection(collection) => {
                self.event_bus.publish(
                    self.outbound_address(),
                    StreamingMessage::FunctionLoadRequestCollection(collection),
                );
            },
        }

        let result = match self.config.function_load_timeout() {
            Some(deadline) => tokio::time::timeout(deadline, reply_rx)
                .await
                .map_err(|_| WorkerChannelError::timeout("function-load"))
                .and_then(|r| r.protocol_error("load batch dropped")),
            None => reply_rx.await.protocol_error("load batch dropped"),
        }
        .and_then(std::convert::identity);

        {
            let mut inner = self.inner.lock().await;
            if inner.state == ChannelState::LoadingFunctions && inner.function_loads.loaded_count() > 0 {
                inner.state = ChannelState::Ready;
            }
        }

        self.metrics.record(&self.worker_id, MetricEvent::PhaseEnd(Phase::FunctionLoad));
        result
    }

    async fn dispatch_buffered(&self, invocation_id: &str) {
        let inner = self.inner.lock().await;
        if let Some(invocation) = inner.registry_peek(invocation_id) {
            let function_id = invocation.function_id.clone();
            let trace_context = invocation.trace_context.clone();
            let inputs = invocation.inputs.clone();
            drop(inner);
            self.publish_invocation_request(invocation_id, &function_id, trace_context, inputs);
        }
    }

    // ------------------------------------------------------------------
    // §4.4 Invocation Protocol
    // ------------------------------------------------------------------

    pub async fn send_invocation(
        &self,
        function_id: impl Into<String>,
        inputs: Vec<RpcInput>,
        trace_context: TraceContext,
        cancel: CancellationToken,
    ) -> Result<oneshot::Receiver<InvocationOutcome>> {
        let function_id = function_id.into();
        let invocation_id = uuid::Uuid::new_v4().to_string();

        {
            let inner = self.inner.lock().await;
            inner.state.check(Verb::Invoke)?;
        }

        let (mut invocation, receiver) = Invocation::new(
            invocation_id.clone(),
            function_id.clone(),
            trace_context.clone(),
            inputs.clone(),
        );

        if cancel.is_cancelled() {
            info!(
                worker_id = %self.worker_id,
                invocation_id = %invocation_id,
                "Cancellation has been requested, cancelling invocation request"
            );
            invocation.signal(InvocationOutcome::Cancelled);
            return Ok(receiver);
        }

        {
            let mut inner = self.inner.lock().await;
            inner.registry.register(invocation);

            // Published while still holding the lock: this is what makes
            // publication order for a given function match registration
            // (i.e. call) order, rather than depending on how the scheduler
            // happens to interleave two concurrent callers' continuations.
            match inner.function_loads.entry(&function_id).map(|e| e.status) {
                Some(crate::function_load::LoadStatus::Loaded) | None => {
                    self.publish_invocation_request(&invocation_id, &function_id, trace_context, inputs);
                },
                Some(crate::function_load::LoadStatus::Pending) => {
                    inner
                        .function_loads
                        .entry_mut(&function_id)
                        .unwrap()
                        .buffer_invocation(invocation_id.clone())?;
                },
                Some(crate::function_load::LoadStatus::Failed) => {
                    if let Some(mut invocation) = inner.registry.remove(&invocation_id) {
                        invocation.signal(InvocationOutcome::Failure("function load failed".to_string()));
                    }
                    return Ok(receiver);
                },
            }
        };

        let watch_channel = self.clone();
        let watch_invocation_id = invocation_id.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            watch_channel.send_invocation_cancel(&watch_invocation_id).await;
        });

        Ok(receiver)
    }

    fn publish_invocation_request(
        &self,
        invocation_id: &str,
        function_id: &str,
        trace_context: TraceContext,
        inputs: Vec<RpcInput>,
    ) {
        let trace_context = if self.host_env.app_insights_enabled {
            trace_context
        } else {
            TraceContext::empty()
        };

        let encoded_inputs = inputs.into_iter().map(|input| self.encode_input(input)).collect();

        self.event_bus.publish(
            self.outbound_address(),
            StreamingMessage::InvocationRequest(InvocationRequest {
                invocation_id: invocation_id.to_string(),
                function_id: function_id.to_string(),
                trace_context,
                inputs: encoded_inputs,
            }),
        );
    }

    fn encode_input(&self, input: RpcInput) -> RpcInput {
        let shared_memory_enabled =
            crate::shared_memory::is_enabled(self.host_env.shared_memory_enabled, &self.capabilities);
        if shared_memory_enabled
            && input.value.is_transferable()
            && input.value.byte_len() > self.config.shared_memory_threshold_bytes
        {
            let bytes = match &input.value {
                RpcValue::Bytes(b) => b.clone(),
                RpcValue::String(s) => s.clone().into_bytes(),
                _ => unreachable!("is_transferable guarantees Bytes or String"),
            };
            let descriptor = self.shared_memory.write(&bytes, &input.declared_type);
            RpcInput {
                value: RpcValue::SharedMemory(descriptor),
                ..input
            }
        } else {
            input
        }
    }

    /// `SendInvocationCancel`.
    pub async fn send_invocation_cancel(&self, invocation_id: &str) {
        if self.capabilities.has(known::HANDLES_INVOCATION_CANCEL) {
            self.event_bus.publish(
                self.outbound_address(),
                StreamingMessage::InvocationCancel(InvocationCancel {
                    invocation_id: invocation_id.to_string(),
                }),
            );
            info!(
                worker_id = %self.worker_id,
                invocation_id,
                "Sending invocation cancel request for InvocationId {}", invocation_id
            );
        } else {
            let mut inner = self.inner.lock().await;
            if let Some(mut invocation) = inner.registry.remove(invocation_id) {
                invocation.signal(InvocationOutcome::Cancelled);
                inner.check_drain_complete();
            }
        }
    }

    /// `TryFailExecutions`.
    pub async fn try_fail_executions(&self, reason: &str) {
        let mut inner = self.inner.lock().await;
        inner.registry.fail_all(reason);
        inner.check_drain_complete();
    }

    // ------------------------------------------------------------------
    // §4.5 Environment Reload
    // ------------------------------------------------------------------

    pub async fn send_environment_reload_request(&self, env_vars: HashMap<String, Option<String>>) -> Result<()> {
        {
            let inner = self.inner.lock().await;
            inner.state.check(Verb::ReloadEnvironment)?;
        }

        let mut sanitized = sanitize_env(env_vars);
        sanitized.insert("AzureWebJobsScriptRoot".to_string(), self.config.worker_directory.clone());
        sanitized.insert(
            "FunctionAppDirectory".to_string(),
            self.config.function_app_directory.clone(),
        );

        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            inner.reload_waiter = Some(tx);
        }

        self.event_bus.publish(
            self.outbound_address(),
            StreamingMessage::FunctionEnvironmentReloadRequest(FunctionEnvironmentReloadRequest {
                environment_variables: sanitized,
                function_app_directory: self.config.function_app_directory.clone(),
            }),
        );

        tokio::time::timeout(self.config.env_reload_timeout, rx)
            .await
            .map_err(|_| WorkerChannelError::timeout("env-reload"))
            .and_then(|r| r.protocol_error("env-reload waiter dropped"))
            .and_then(std::convert::identity)
    }

    // ------------------------------------------------------------------
    // §4.9 Dynamic-concurrency latency probe
    // ------------------------------------------------------------------

    pub async fn send_latency_probe(&self) {
        if !self.host_env.dynamic_concurrency_enabled {
            return;
        }
        let probe_id = {
            let mut inner = self.inner.lock().await;
            inner.latency_probe.start()
        };
        self.event_bus.publish(
            self.outbound_address(),
            StreamingMessage::WorkerStatusRequest(WorkerStatusRequest { probe_id }),
        );
    }

    pub async fn latencies(&self) -> Vec<Duration> {
        self.inner.lock().await.latency_probe.latencies()
    }

    // ------------------------------------------------------------------
    // §4.8 Draining and termination
    // ------------------------------------------------------------------

    pub async fn drain_invocations(&self) -> Result<()> {
        self.metrics.record(&self.worker_id, MetricEvent::PhaseBegin(Phase::Drain));
        let waiter = {
            let mut inner = self.inner.lock().await;
            inner.state.check(Verb::Drain)?;
            inner.state = ChannelState::Draining;
            if inner.registry.is_empty() {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                inner.drain_waiters.push(tx);
                Some(rx)
            }
        };

        if let Some(rx) = waiter {
            let _ = rx.await;
        }
        self.metrics.record(&self.worker_id, MetricEvent::PhaseEnd(Phase::Drain));
        Ok(())
    }

    pub async fn terminate(&self) -> Result<()> {
        let _enter = self.span.enter();
        self.metrics.record(&self.worker_id, MetricEvent::PhaseBegin(Phase::Terminate));
        {
            let mut inner = self.inner.lock().await;
            if inner.state.is_terminal() {
                return Ok(());
            }
            inner.state = ChannelState::Terminating;
        }

        let has_terminate_capability = self.capabilities.has(known::HANDLES_WORKER_TERMINATE);
        let process = self.inner.lock().await.process.take();

        if has_terminate_capability {
            self.event_bus.publish(
                self.outbound_address(),
                StreamingMessage::WorkerTerminate(WorkerTerminate {
                    grace_period_seconds: self.config.terminate_grace_period.as_secs() as u32,
                }),
            );
            info!(
                worker_id = %self.worker_id,
                "Sending WorkerTerminate message with grace period {} seconds",
                self.config.terminate_grace_period.as_secs()
            );

            let exited = process.map(|p| p.exited);
            let exited_cleanly = match exited {
                Some(rx) => tokio::time::timeout(self.config.terminate_grace_period, rx).await.is_ok(),
                None => false,
            };
            if !exited_cleanly {
                if let Some(pid) = self.pid().await {
                    let _ = self.supervisor.kill(pid).await;
                }
            }
        } else if let Some(pid) = process.as_ref().map(|p| p.pid) {
            let _ = self.supervisor.kill(pid).await;
        }

        {
            let mut inner = self.inner.lock().await;
            inner.registry.cancel_all();
            if let Some(w) = inner.start_waiter.take() {
                let _ = w.send(Err(WorkerChannelError::Cancelled));
            }
            if let Some(w) = inner.reload_waiter.take() {
                let _ = w.send(Err(WorkerChannelError::Cancelled));
            }
            if let Some(batch) = inner.load_batch.take() {
                let _ = batch.reply.send(Err(WorkerChannelError::Cancelled));
            }
            inner.state = ChannelState::Terminated;
            inner.check_drain_complete();
        }

        self.metrics.record(&self.worker_id, MetricEvent::PhaseEnd(Phase::Terminate));
        Ok(())
    }

    async fn pid(&self) -> Option<u32> {
        self.inner.lock().await.process.as_ref().map(|p| p.pid)
    }
}

impl ChannelInner {
    fn registry_peek(&self, invocation_id: &str) -> Option<&Invocation> {
        self.registry.peek(invocation_id)
    }
}

fn is_start_stream(msg: &StreamingMessage) -> bool {
    matches!(msg, StreamingMessage::StartStream { .. })
}

fn is_init_response(msg: &StreamingMessage) -> bool {
    matches!(msg, StreamingMessage::WorkerInitResponse(_))
}

/// Drop entries whose value is `None` or empty; applying this twice yields
/// the same map.
fn sanitize_env(env_vars: HashMap<String, Option<String>>) -> HashMap<String, String> {
    env_vars
        .into_iter()
        .filter_map(|(k, v)| match v {
            Some(v) if !v.is_empty() => Some((k, v)),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_drops_null_and_empty_and_is_idempotent() {
        let mut input = HashMap::new();
        input.insert("TestNull".to_string(), None);
        input.insert("TestEmpty".to_string(), Some(String::new()));
        input.insert("TestValid".to_string(), Some("TestValue".to_string()));

        let once = sanitize_env(input);
        assert_eq!(once.len(), 1);
        assert_eq!(once.get("TestValid"), Some(&"TestValue".to_string()));

        let twice_input: HashMap<String, Option<String>> =
            once.iter().map(|(k, v)| (k.clone(), Some(v.clone()))).collect();
        let twice = sanitize_env(twice_input);
        assert_eq!(once, twice);
    }
}
