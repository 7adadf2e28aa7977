//! Dynamic-Concurrency Latency Probe.
//!
//! When the host-wide dynamic-concurrency flag is enabled, the channel
//! periodically round-trips a `WorkerStatusRequest`/`WorkerStatusResponse`
//! pair and records the latency in a bounded ring buffer. The Dispatcher
//! (out of scope) uses the resulting history to decide whether to spawn more
//! workers; this module only owns the history and the probe send/record
//! halves.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Ring-buffer capacity for the latency history.
pub const HISTORY_CAPACITY: usize = 50;

/// How often a channel sends a round-trip probe while enabled.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Bounded history of round-trip latencies, plus bookkeeping for in-flight
/// probes awaiting their response.
#[derive(Default)]
pub struct LatencyProbe {
    history: VecDeque<Duration>,
    next_probe_id: u64,
    inflight: Option<(u64, Instant)>,
}

impl LatencyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new probe, returning the id to embed in the
    /// `WorkerStatusRequest`. Only one probe is in flight at a time; starting
    /// a new one before the previous resolved discards the stale one rather
    /// than double-counting it in the history.
    pub fn start(&mut self) -> u64 {
        self.next_probe_id += 1;
        let id = self.next_probe_id;
        self.inflight = Some((id, Instant::now()));
        id
    }

    /// Record the round trip for `probe_id`, if it matches the currently
    /// in-flight probe. A mismatched or late id is ignored.
    pub fn complete(&mut self, probe_id: u64) {
        if let Some((id, started)) = self.inflight {
            if id == probe_id {
                self.push_latency(started.elapsed());
                self.inflight = None;
            }
        }
    }

    fn push_latency(&mut self, latency: Duration) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(latency);
    }

    /// `GetLatencies`: a snapshot of the recorded history, oldest first.
    pub fn latencies(&self) -> Vec<Duration> {
        self.history.iter().copied().collect()
    }
}
