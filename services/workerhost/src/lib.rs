//! Host-side worker channel library.
//!
//! A `WorkerChannel` owns one language-worker subprocess and the bidirectional
//! RPC stream that connects it to the host: starting and initializing it,
//! negotiating capabilities, loading functions, dispatching invocations, and
//! draining/terminating it. The modules here split along the seams named in
//! the design: state machine, capability negotiation, wire protocol, event
//! bus, invocation registry, function load manager, shared-memory transfer,
//! metrics/log forwarding, the dynamic-concurrency latency probe, process
//! supervision, configuration, and the channel itself.

pub mod capability;
pub mod channel;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod function_load;
pub mod invocation;
pub mod latency_probe;
pub mod metrics;
pub mod process;
pub mod protocol;
pub mod shared_memory;
pub mod state;
pub mod trace;

pub use channel::{Diagnostics, WorkerChannel};
pub use error::{Result, WorkerChannelError};
