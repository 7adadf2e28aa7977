//! Demo binary: starts one worker channel, lets it reach `Ready`, and drives
//! a graceful shutdown (drain then terminate) on Ctrl+C/SIGTERM.
//!
//! This is a harness for exercising the library end to end against a
//! loopback process supervisor, not a production host — a real deployment
//! wires `WorkerChannel` into a dispatcher that owns many channels across
//! many languages.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use workerhost::capability::known;
use workerhost::channel::WorkerChannel;
use workerhost::config::{ChannelConfig, HostEnvironment};
use workerhost::event_bus::EventBus;
use workerhost::process::LoopbackSupervisor;
use workerhost::protocol::{FunctionMetadata, StreamingMessage, WorkerInitResponse};
use workerhost::shared_memory::SharedMemoryManager;

#[derive(Parser, Debug)]
#[command(name = "workerhost", about = "Host-side worker channel demo")]
struct Args {
    #[arg(long, env = "WORKERHOST_WORKER_DIRECTORY", default_value = "./worker")]
    worker_directory: String,

    #[arg(long, env = "WORKERHOST_FUNCTION_APP_DIRECTORY", default_value = "./app")]
    function_app_directory: String,

    #[arg(long, env = "WORKERHOST_EXECUTABLE", default_value = "node")]
    executable: String,

    #[arg(long, env = "WORKERHOST_LANGUAGE", default_value = "node")]
    language: String,

    #[arg(long, env = "WORKERHOST_CONFIG_FILE")]
    config_file: Option<PathBuf>,

    #[arg(long, env = "WORKERHOST_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "WORKERHOST_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = common::logging::init(&args.log_level, "workerhost", args.log_dir.as_ref()) {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let mut config = match ChannelConfig::load(args.config_file.as_ref()) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        },
    };
    config.worker_directory = args.worker_directory;
    config.function_app_directory = args.function_app_directory;
    config.executable = args.executable;
    config.language = args.language;

    let host_env = HostEnvironment::from_process_env();
    let event_bus = EventBus::new();
    let shared_memory = SharedMemoryManager::new();
    let supervisor = Arc::new(LoopbackSupervisor);

    let channel = WorkerChannel::new(
        "worker-1",
        config,
        host_env,
        event_bus.clone(),
        supervisor,
        shared_memory,
    );

    // Drive the loopback handshake: a real worker process would publish
    // these itself once it connects and initializes.
    let handshake_bus = event_bus.clone();
    let handshake_worker_id = channel.worker_id().to_string();
    tokio::spawn(async move {
        handshake_bus.publish(
            handshake_worker_id.clone(),
            StreamingMessage::StartStream {
                worker_id: handshake_worker_id.clone(),
            },
        );
        handshake_bus.publish(
            handshake_worker_id.clone(),
            StreamingMessage::WorkerInitResponse(WorkerInitResponse {
                worker_id: handshake_worker_id,
                capabilities: [
                    (known::HANDLES_WORKER_TERMINATE.to_string(), "1".to_string()),
                    (known::HANDLES_INVOCATION_CANCEL.to_string(), "1".to_string()),
                ]
                .into_iter()
                .collect(),
                result: workerhost::protocol::StatusResult::Success,
                error_message: None,
            }),
        );
    });

    let start_cancel = CancellationToken::new();
    if let Err(e) = channel.start(start_cancel).await {
        error!(error = %e, "worker channel failed to start");
        std::process::exit(1);
    }
    info!(worker_id = channel.worker_id(), "worker channel started");

    if let Err(e) = channel
        .load_functions(vec![FunctionMetadata {
            function_id: "demo".to_string(),
            name: "demo".to_string(),
            language: "node".to_string(),
            disabled: false,
            triggers: vec!["httpTrigger".to_string()],
            bindings: vec![],
        }])
        .await
    {
        error!(error = %e, "function load failed");
    }

    common::shutdown::wait_for_shutdown().await;
    info!("shutdown signal received, draining in-flight invocations");

    if let Err(e) = channel.drain_invocations().await {
        error!(error = %e, "drain failed, terminating anyway");
    }
    if let Err(e) = channel.terminate().await {
        error!(error = %e, "terminate failed");
    }
    info!("worker channel terminated");
}
