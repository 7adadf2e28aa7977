//! Process supervision boundary.
//!
//! Spawning, restart policy, and platform-specific memory-mapped-file backing
//! are out of scope here — consumed as "start an OS process
//! asynchronously and expose its PID and termination signal." This module
//! defines only that trait boundary, plus a loopback implementation used by
//! tests to drive the channel without a real subprocess.

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::Result;

/// A started worker subprocess: a PID and a one-shot signal that resolves
/// when the process exits.
pub struct ProcessHandle {
    pub pid: u32,
    pub exited: oneshot::Receiver<std::io::Result<()>>,
}

#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Start the worker process asynchronously for `worker_id`, returning a
    /// handle once the OS has accepted the spawn (not once the worker has
    /// handshaked — that's `StartStream`, a level up).
    async fn start(&self, worker_id: &str, executable: &str, directory: &str) -> Result<ProcessHandle>;

    /// Best-effort kill, used when a graceful `WorkerTerminate` grace period
    /// expires or the capability is absent.
    async fn kill(&self, pid: u32) -> Result<()>;
}

/// A supervisor that never actually spawns anything; `start` immediately
/// hands back a handle whose exit signal is controlled by the test via the
/// paired sender, so tests can drive process-failure and termination paths
/// deterministically.
#[derive(Default)]
pub struct LoopbackSupervisor;

#[async_trait]
impl ProcessSupervisor for LoopbackSupervisor {
    async fn start(&self, worker_id: &str, _executable: &str, _directory: &str) -> Result<ProcessHandle> {
        let (_tx, rx) = oneshot::channel();
        let pid = worker_id
            .bytes()
            .fold(1u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
        Ok(ProcessHandle { pid, exited: rx })
    }

    async fn kill(&self, _pid: u32) -> Result<()> {
        Ok(())
    }
}
