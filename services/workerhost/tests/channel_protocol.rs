//! End-to-end tests driving `WorkerChannel` against a loopback `EventBus` and
//! `LoopbackSupervisor`, standing in for a real worker process and its wire
//! transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use workerhost::capability::known;
use workerhost::channel::WorkerChannel;
use workerhost::config::{ChannelConfig, HostEnvironment};
use workerhost::error::WorkerChannelError;
use workerhost::event_bus::{EventBus, Subscription};
use workerhost::invocation::InvocationOutcome;
use workerhost::process::LoopbackSupervisor;
use workerhost::protocol::{
    FunctionLoadResponse, FunctionMetadata, RpcInput, RpcValue, StatusResult, StreamingMessage,
    WorkerInitResponse,
};
use workerhost::shared_memory::SharedMemoryManager;
use workerhost::state::ChannelState;
use workerhost::trace::TraceContext;

fn test_config() -> ChannelConfig {
    let mut cfg = ChannelConfig::default();
    cfg.worker_directory = "/app".to_string();
    cfg.function_app_directory = "/app".to_string();
    cfg.executable = "node".to_string();
    cfg.language = "node".to_string();
    cfg.startup_timeout = Duration::from_secs(2);
    cfg.init_timeout = Duration::from_secs(2);
    cfg.env_reload_timeout = Duration::from_secs(2);
    cfg.terminate_grace_period = Duration::from_millis(200);
    cfg
}

fn new_channel(worker_id: &str, event_bus: EventBus) -> WorkerChannel {
    WorkerChannel::new(
        worker_id,
        test_config(),
        HostEnvironment::default(),
        event_bus,
        Arc::new(LoopbackSupervisor),
        SharedMemoryManager::new(),
    )
}

fn outbound_key(worker_id: &str) -> String {
    format!("{worker_id}::to-worker")
}

fn function_metadata(function_id: &str, disabled: bool) -> FunctionMetadata {
    FunctionMetadata {
        function_id: function_id.to_string(),
        name: function_id.to_string(),
        language: "node".to_string(),
        disabled,
        triggers: vec!["httpTrigger".to_string()],
        bindings: vec![],
    }
}

/// Drives the Start/Init handshake as if a worker process had connected,
/// handing back capabilities as given. Spawns the handshake on the bus before
/// calling `start()`, mirroring what a real worker's read loop would publish.
async fn handshake(
    event_bus: &EventBus,
    worker_id: &str,
    capabilities: HashMap<String, String>,
) {
    let bus = event_bus.clone();
    let worker_id = worker_id.to_string();
    // Give `start()` a moment to subscribe before the worker side publishes.
    tokio::time::sleep(Duration::from_millis(20)).await;
    bus.publish(worker_id.clone(), StreamingMessage::StartStream { worker_id: worker_id.clone() });
    bus.publish(
        worker_id.clone(),
        StreamingMessage::WorkerInitResponse(WorkerInitResponse {
            worker_id,
            capabilities,
            result: StatusResult::Success,
            error_message: None,
        }),
    );
}

fn caps_with(names: &[&str]) -> HashMap<String, String> {
    names.iter().map(|n| (n.to_string(), "1".to_string())).collect()
}

/// Drives `load_functions` for a single function to completion: spawns the
/// call, answers its one load request with success, and waits for it to
/// return. `load_functions` itself awaits the reply before returning, so the
/// request/response exchange must run concurrently with it, not after it.
async fn load_single_function(
    channel: &WorkerChannel,
    event_bus: &EventBus,
    worker_inbox: &mut Subscription,
    worker_id: &str,
    function_id: &str,
) {
    let load_task = tokio::spawn({
        let channel = channel.clone();
        let function_id = function_id.to_string();
        async move { channel.load_functions(vec![function_metadata(&function_id, false)]).await }
    });

    let envelope = worker_inbox.recv().await.expect("load request observed");
    let StreamingMessage::FunctionLoadRequest(req) = envelope.message else {
        panic!("expected FunctionLoadRequest, got {:?}", envelope.message);
    };
    event_bus.publish(
        worker_id,
        StreamingMessage::FunctionLoadResponse(FunctionLoadResponse {
            function_id: req.function_id,
            result: StatusResult::Success,
            error_message: None,
        }),
    );

    load_task.await.unwrap().expect("load completes");
}

// Scenario 1: happy path through Ready.
#[tokio::test]
async fn happy_path_reaches_ready() {
    let event_bus = EventBus::new();
    let channel = new_channel("worker-1", event_bus.clone());

    let mut worker_inbox = event_bus.subscribe(outbound_key("worker-1"));

    let handshake_task = tokio::spawn(handshake(&event_bus, "worker-1", HashMap::new()));
    channel.start(CancellationToken::new()).await.expect("start succeeds");
    handshake_task.await.unwrap();

    // drain the WorkerInitRequest the worker side would have seen
    let _init_req = worker_inbox.recv().await.expect("init request observed");

    let load_task = tokio::spawn({
        let channel = channel.clone();
        async move {
            channel
                .load_functions(vec![function_metadata("js1", false), function_metadata("js2", false)])
                .await
        }
    });

    for _ in 0..2 {
        let envelope = worker_inbox.recv().await.expect("load request observed");
        let StreamingMessage::FunctionLoadRequest(req) = envelope.message else {
            panic!("expected per-function load requests, got {:?}", envelope.message);
        };
        event_bus.publish(
            "worker-1",
            StreamingMessage::FunctionLoadResponse(FunctionLoadResponse {
                function_id: req.function_id,
                result: StatusResult::Success,
                error_message: None,
            }),
        );
    }

    load_task.await.unwrap().expect("load completes");
    assert!(channel.is_ready_for_invocations().await);
    assert_eq!(channel.state().await, ChannelState::Ready);
}

// Scenario 2: disabled functions load last, and aren't mentioned until the
// final request.
#[tokio::test]
async fn disabled_functions_ordered_last() {
    let event_bus = EventBus::new();
    let channel = new_channel("worker-2", event_bus.clone());
    let mut worker_inbox = event_bus.subscribe(outbound_key("worker-2"));

    tokio::spawn(handshake(&event_bus, "worker-2", HashMap::new()));
    channel.start(CancellationToken::new()).await.expect("start succeeds");
    let _init_req = worker_inbox.recv().await.unwrap();

    let load_task = tokio::spawn({
        let channel = channel.clone();
        async move {
            channel
                .load_functions(vec![
                    function_metadata("aDisabled", true),
                    function_metadata("js1", false),
                    function_metadata("js2", false),
                ])
                .await
        }
    });

    let mut seen = Vec::new();
    for _ in 0..3 {
        let envelope = worker_inbox.recv().await.unwrap();
        let StreamingMessage::FunctionLoadRequest(req) = envelope.message else {
            panic!("expected per-function load requests");
        };
        seen.push(req.function_id.clone());
        event_bus.publish(
            "worker-2",
            StreamingMessage::FunctionLoadResponse(FunctionLoadResponse {
                function_id: req.function_id,
                result: StatusResult::Success,
                error_message: None,
            }),
        );
    }

    load_task.await.unwrap().unwrap();
    assert_eq!(seen, vec!["js1", "js2", "aDisabled"]);
}

// Scenario 3: cancelling an in-flight invocation when the worker has
// negotiated HandlesInvocationCancel sends an explicit cancel message.
#[tokio::test]
#[traced_test]
async fn cancel_with_capability_sends_wire_cancel() {
    let event_bus = EventBus::new();
    let channel = new_channel("worker-3", event_bus.clone());
    let mut worker_inbox = event_bus.subscribe(outbound_key("worker-3"));

    tokio::spawn(handshake(
        &event_bus,
        "worker-3",
        caps_with(&[known::HANDLES_INVOCATION_CANCEL]),
    ));
    channel.start(CancellationToken::new()).await.unwrap();
    let _init_req = worker_inbox.recv().await.unwrap();

    load_single_function(&channel, &event_bus, &mut worker_inbox, "worker-3", "js1").await;

    let cancel = CancellationToken::new();
    let _receiver = channel
        .send_invocation("js1", vec![], TraceContext::empty(), cancel.clone())
        .await
        .unwrap();
    let _invocation_req = worker_inbox.recv().await.unwrap();

    cancel.cancel();
    // the watcher task needs a beat to observe cancellation and publish
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(logs_contain("Sending invocation cancel request for InvocationId"));
}

// Scenario 4: the same sequence without the capability stays local-only.
#[tokio::test]
#[traced_test]
async fn cancel_without_capability_stays_local() {
    let event_bus = EventBus::new();
    let channel = new_channel("worker-4", event_bus.clone());
    let mut worker_inbox = event_bus.subscribe(outbound_key("worker-4"));

    tokio::spawn(handshake(&event_bus, "worker-4", HashMap::new()));
    channel.start(CancellationToken::new()).await.unwrap();
    let _init_req = worker_inbox.recv().await.unwrap();

    load_single_function(&channel, &event_bus, &mut worker_inbox, "worker-4", "js1").await;

    let cancel = CancellationToken::new();
    let receiver = channel
        .send_invocation("js1", vec![], TraceContext::empty(), cancel.clone())
        .await
        .unwrap();
    let _invocation_req = worker_inbox.recv().await.unwrap();

    cancel.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!logs_contain("Sending invocation cancel request for InvocationId"));
    assert!(matches!(receiver.await.unwrap(), InvocationOutcome::Cancelled));
}

// Scenario 5: a token cancelled before `send_invocation` is even called
// short-circuits locally, with no registry entry and no wire traffic.
#[tokio::test]
#[traced_test]
async fn pre_cancelled_token_short_circuits() {
    let event_bus = EventBus::new();
    let channel = new_channel("worker-5", event_bus.clone());
    let mut worker_inbox = event_bus.subscribe(outbound_key("worker-5"));

    tokio::spawn(handshake(&event_bus, "worker-5", HashMap::new()));
    channel.start(CancellationToken::new()).await.unwrap();
    let _init_req = worker_inbox.recv().await.unwrap();

    load_single_function(&channel, &event_bus, &mut worker_inbox, "worker-5", "js1").await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let receiver = channel
        .send_invocation("js1", vec![], TraceContext::empty(), cancel)
        .await
        .unwrap();

    assert!(matches!(receiver.await.unwrap(), InvocationOutcome::Cancelled));
    assert!(logs_contain("Cancellation has been requested, cancelling invocation request"));
    assert!(!channel.is_executing_invocation("anything").await);

    // nothing should have been published on top of the load request round trip
    assert!(tokio::time::timeout(Duration::from_millis(50), worker_inbox.recv())
        .await
        .is_err());
}

// Scenario 6: terminate with/without HandlesWorkerTerminate.
#[tokio::test]
#[traced_test]
async fn terminate_with_capability_sends_wire_terminate() {
    let event_bus = EventBus::new();
    let channel = new_channel("worker-6", event_bus.clone());
    let mut worker_inbox = event_bus.subscribe(outbound_key("worker-6"));

    tokio::spawn(handshake(
        &event_bus,
        "worker-6",
        caps_with(&[known::HANDLES_WORKER_TERMINATE]),
    ));
    channel.start(CancellationToken::new()).await.unwrap();
    let _init_req = worker_inbox.recv().await.unwrap();

    channel.terminate().await.unwrap();

    assert!(logs_contain("Sending WorkerTerminate message with grace period"));
    assert_eq!(channel.state().await, ChannelState::Terminated);
}

#[tokio::test]
#[traced_test]
async fn terminate_without_capability_skips_wire_terminate() {
    let event_bus = EventBus::new();
    let channel = new_channel("worker-7", event_bus.clone());
    let mut worker_inbox = event_bus.subscribe(outbound_key("worker-7"));

    tokio::spawn(handshake(&event_bus, "worker-7", HashMap::new()));
    channel.start(CancellationToken::new()).await.unwrap();
    let _init_req = worker_inbox.recv().await.unwrap();

    channel.terminate().await.unwrap();

    assert!(!logs_contain("Sending WorkerTerminate message with grace period"));
    assert_eq!(channel.state().await, ChannelState::Terminated);
}

// Terminate is idempotent once terminal.
#[tokio::test]
async fn terminate_is_idempotent() {
    let event_bus = EventBus::new();
    let channel = new_channel("worker-7b", event_bus.clone());
    let mut worker_inbox = event_bus.subscribe(outbound_key("worker-7b"));

    tokio::spawn(handshake(&event_bus, "worker-7b", HashMap::new()));
    channel.start(CancellationToken::new()).await.unwrap();
    let _init_req = worker_inbox.recv().await.unwrap();

    channel.terminate().await.unwrap();
    channel.terminate().await.unwrap();
    assert_eq!(channel.state().await, ChannelState::Terminated);
}

// Scenario 7: environment reload sanitizes null/empty values and always
// injects the two well-known directory keys.
#[tokio::test]
async fn environment_reload_sanitizes_input() {
    let event_bus = EventBus::new();
    let channel = new_channel("worker-8", event_bus.clone());
    let mut worker_inbox = event_bus.subscribe(outbound_key("worker-8"));

    tokio::spawn(handshake(&event_bus, "worker-8", HashMap::new()));
    channel.start(CancellationToken::new()).await.unwrap();
    let _init_req = worker_inbox.recv().await.unwrap();

    let mut env_vars = HashMap::new();
    env_vars.insert("TestNull".to_string(), None);
    env_vars.insert("TestEmpty".to_string(), Some(String::new()));
    env_vars.insert("TestValid".to_string(), Some("TestValue".to_string()));

    let reload_task = tokio::spawn({
        let channel = channel.clone();
        async move { channel.send_environment_reload_request(env_vars).await }
    });

    let envelope = worker_inbox.recv().await.unwrap();
    let StreamingMessage::FunctionEnvironmentReloadRequest(req) = envelope.message else {
        panic!("expected FunctionEnvironmentReloadRequest, got {:?}", envelope.message);
    };
    assert!(!req.environment_variables.contains_key("TestNull"));
    assert!(!req.environment_variables.contains_key("TestEmpty"));
    assert_eq!(req.environment_variables.get("TestValid"), Some(&"TestValue".to_string()));
    assert!(req.environment_variables.contains_key("AzureWebJobsScriptRoot"));
    assert!(req.environment_variables.contains_key("FunctionAppDirectory"));

    event_bus.publish(
        "worker-8",
        StreamingMessage::FunctionEnvironmentReloadResponse(
            workerhost::protocol::FunctionEnvironmentReloadResponse {
                result: StatusResult::Success,
                error_message: None,
            },
        ),
    );
    reload_task.await.unwrap().expect("reload succeeds");
}

// Scenario 8: a channel-level failure faults every in-flight invocation and
// clears executing state.
#[tokio::test]
async fn try_fail_executions_faults_in_flight_invocation() {
    let event_bus = EventBus::new();
    let channel = new_channel("worker-9", event_bus.clone());
    let mut worker_inbox = event_bus.subscribe(outbound_key("worker-9"));

    tokio::spawn(handshake(&event_bus, "worker-9", HashMap::new()));
    channel.start(CancellationToken::new()).await.unwrap();
    let _init_req = worker_inbox.recv().await.unwrap();

    load_single_function(&channel, &event_bus, &mut worker_inbox, "worker-9", "js1").await;

    let receiver = channel
        .send_invocation("js1", vec![], TraceContext::empty(), CancellationToken::new())
        .await
        .unwrap();
    let invocation_req = worker_inbox.recv().await.unwrap();
    let StreamingMessage::InvocationRequest(req) = invocation_req.message else {
        panic!("expected InvocationRequest");
    };
    assert!(channel.is_executing_invocation(&req.invocation_id).await);

    channel.try_fail_executions("worker process crashed").await;

    match receiver.await.unwrap() {
        InvocationOutcome::Failure(reason) => assert_eq!(reason, "worker process crashed"),
        other => panic!("expected Failure, got {other:?}"),
    }
    assert!(!channel.is_executing_invocation(&req.invocation_id).await);
}

// No invocation is dispatched before its function has finished loading; it
// buffers and is flushed with its original inputs once the load succeeds.
#[tokio::test]
async fn invocation_buffers_until_function_is_loaded_and_keeps_its_inputs() {
    let event_bus = EventBus::new();
    let channel = new_channel("worker-10", event_bus.clone());
    let mut worker_inbox = event_bus.subscribe(outbound_key("worker-10"));

    tokio::spawn(handshake(&event_bus, "worker-10", HashMap::new()));
    channel.start(CancellationToken::new()).await.unwrap();
    let _init_req = worker_inbox.recv().await.unwrap();

    let load_task = tokio::spawn({
        let channel = channel.clone();
        async move { channel.load_functions(vec![function_metadata("js1", false)]).await }
    });
    let load_envelope = worker_inbox.recv().await.unwrap();
    let StreamingMessage::FunctionLoadRequest(load_req) = load_envelope.message else {
        panic!("expected FunctionLoadRequest");
    };

    let inputs = vec![RpcInput {
        name: "req".to_string(),
        declared_type: "string".to_string(),
        value: RpcValue::String("hello".to_string()),
    }];
    let receiver = channel
        .send_invocation("js1", inputs, TraceContext::empty(), CancellationToken::new())
        .await
        .unwrap();

    // the invocation must not be published while the function is still Pending
    assert!(tokio::time::timeout(Duration::from_millis(50), worker_inbox.recv())
        .await
        .is_err());

    event_bus.publish(
        "worker-10",
        StreamingMessage::FunctionLoadResponse(FunctionLoadResponse {
            function_id: load_req.function_id,
            result: StatusResult::Success,
            error_message: None,
        }),
    );
    load_task.await.unwrap().unwrap();

    let envelope = worker_inbox.recv().await.expect("buffered invocation flushed");
    let StreamingMessage::InvocationRequest(req) = envelope.message else {
        panic!("expected InvocationRequest, got {:?}", envelope.message);
    };
    assert_eq!(req.inputs.len(), 1);
    assert_eq!(req.inputs[0].value, RpcValue::String("hello".to_string()));

    event_bus.publish(
        "worker-10",
        StreamingMessage::InvocationResponse(workerhost::protocol::InvocationResponse {
            invocation_id: req.invocation_id,
            result: StatusResult::Success,
            outputs: vec![],
            error_message: None,
        }),
    );
    assert!(matches!(receiver.await.unwrap(), InvocationOutcome::Success(_)));
}

// State-path legality: invoking before the worker has started is rejected
// without touching the wire.
#[tokio::test]
async fn invoke_before_start_is_rejected() {
    let event_bus = EventBus::new();
    let channel = new_channel("worker-11", event_bus.clone());

    let result = channel
        .send_invocation("js1", vec![], TraceContext::empty(), CancellationToken::new())
        .await;
    assert!(matches!(result, Err(WorkerChannelError::InvalidState { .. })));
}

// Draining waits for in-flight invocations to finish before returning.
#[tokio::test]
async fn drain_completes_once_in_flight_invocation_responds() {
    let event_bus = EventBus::new();
    let channel = new_channel("worker-12", event_bus.clone());
    let mut worker_inbox = event_bus.subscribe(outbound_key("worker-12"));

    tokio::spawn(handshake(&event_bus, "worker-12", HashMap::new()));
    channel.start(CancellationToken::new()).await.unwrap();
    let _init_req = worker_inbox.recv().await.unwrap();

    load_single_function(&channel, &event_bus, &mut worker_inbox, "worker-12", "js1").await;

    let _receiver = channel
        .send_invocation("js1", vec![], TraceContext::empty(), CancellationToken::new())
        .await
        .unwrap();
    let invocation_req = worker_inbox.recv().await.unwrap();
    let StreamingMessage::InvocationRequest(req) = invocation_req.message else {
        panic!("expected InvocationRequest");
    };

    let drain_task = tokio::spawn({
        let channel = channel.clone();
        async move { channel.drain_invocations().await }
    });

    // give drain a moment to register its waiter before the response lands
    tokio::time::sleep(Duration::from_millis(20)).await;
    event_bus.publish(
        "worker-12",
        StreamingMessage::InvocationResponse(workerhost::protocol::InvocationResponse {
            invocation_id: req.invocation_id,
            result: StatusResult::Success,
            outputs: vec![],
            error_message: None,
        }),
    );

    tokio::time::timeout(Duration::from_secs(1), drain_task)
        .await
        .expect("drain completes promptly")
        .unwrap()
        .unwrap();
}

// Startup timeout: no StartStream ever arrives.
#[tokio::test]
async fn start_times_out_without_start_stream() {
    let event_bus = EventBus::new();
    let mut cfg = test_config();
    cfg.startup_timeout = Duration::from_millis(50);
    let channel = WorkerChannel::new(
        "worker-13",
        cfg,
        HostEnvironment::default(),
        event_bus,
        Arc::new(LoopbackSupervisor),
        SharedMemoryManager::new(),
    );

    let result = channel.start(CancellationToken::new()).await;
    assert!(matches!(result, Err(WorkerChannelError::Timeout { .. })));
    assert_eq!(channel.state().await, ChannelState::Failed);
}

// A cancellation token fired mid-handshake aborts `start()` with `Cancelled`
// rather than waiting out the full timeout.
#[tokio::test]
async fn start_cancelled_mid_handshake_yields_cancelled() {
    let event_bus = EventBus::new();
    let mut cfg = test_config();
    cfg.startup_timeout = Duration::from_secs(5);
    let channel = WorkerChannel::new(
        "worker-14",
        cfg,
        HostEnvironment::default(),
        event_bus,
        Arc::new(LoopbackSupervisor),
        SharedMemoryManager::new(),
    );

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel_clone.cancel();
    });

    let result = channel.start(cancel).await;
    assert!(matches!(result, Err(WorkerChannelError::Cancelled)));
}
