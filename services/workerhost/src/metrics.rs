//! Metrics / log bridge.
//!
//! Emits phase-begin/phase-end metric events and routes inbound `RpcLog`
//! messages to the user-log or system-log sink. The sinks themselves are
//! external collaborators; this module only defines the emission points and
//! the trait boundary a real telemetry layer would implement.

use tracing::{debug, info, warn};

use crate::protocol::{LogCategory, RpcLog, RpcLogLevel};

/// A named metric event: `SpecializationEnvironmentReloadRequestResponse`,
/// `FunctionLoadRequestResponse`, and phase-begin/phase-end pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricEvent {
    PhaseBegin(Phase),
    PhaseEnd(Phase),
    FunctionLoadRequestResponse,
    SpecializationEnvironmentReloadRequestResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Init,
    FunctionLoad,
    EnvironmentReload,
    Drain,
    Terminate,
}

/// Sink for metric events; a process-wide telemetry layer implements this.
/// The default `NullMetricsSink` just logs at debug level, which is enough
/// to exercise every call site without a real collector.
pub trait MetricsSink: Send + Sync {
    fn record(&self, worker_id: &str, event: MetricEvent);
}

#[derive(Default)]
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn record(&self, worker_id: &str, event: MetricEvent) {
        debug!(worker_id, ?event, "metric event");
    }
}

/// Route one inbound `RpcLog` to the appropriate sink. `Trace` is promoted to
/// `Information` per §4.6; system logs are additionally mirrored through the
/// host's console log source (modeled here as a second `tracing` target).
pub fn forward_log(worker_id: &str, log: &RpcLog) {
    let level = if log.level == RpcLogLevel::Trace {
        RpcLogLevel::Information
    } else {
        log.level
    };

    match log.category {
        LogCategory::User => emit(worker_id, "worker.user_log", level, &log.message),
        LogCategory::System => {
            emit(worker_id, "worker.system_log", level, &log.message);
            emit(worker_id, "host.console", level, &log.message);
        },
    }
}

fn emit(worker_id: &str, target: &'static str, level: RpcLogLevel, message: &str) {
    match level {
        RpcLogLevel::Trace | RpcLogLevel::Debug => debug!(target: "workerhost::log", worker_id, source = target, "{}", message),
        RpcLogLevel::Information => info!(target: "workerhost::log", worker_id, source = target, "{}", message),
        RpcLogLevel::Warning => warn!(target: "workerhost::log", worker_id, source = target, "{}", message),
        RpcLogLevel::Error | RpcLogLevel::Critical => {
            tracing::error!(target: "workerhost::log", worker_id, source = target, "{}", message)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sink_does_not_panic() {
        let sink = NullMetricsSink;
        sink.record("w1", MetricEvent::PhaseBegin(Phase::Init));
        sink.record("w1", MetricEvent::PhaseEnd(Phase::Init));
    }

    #[test]
    fn forward_log_handles_every_category() {
        forward_log(
            "w1",
            &RpcLog {
                invocation_id: None,
                level: RpcLogLevel::Trace,
                category: LogCategory::System,
                message: "booting".into(),
            },
        );
        forward_log(
            "w1",
            &RpcLog {
                invocation_id: Some("i1".into()),
                level: RpcLogLevel::Error,
                category: LogCategory::User,
                message: "oops".into(),
            },
        );
    }
}
