//! Shared-Memory Data Transfer.
//!
//! Offloads large inputs/outputs to a named memory region instead of the RPC
//! body. Regions are reference-counted with a single-writer discipline per
//! region; the Function Data Cache may pin a region for reuse by a
//! later invocation, deferring release until eviction.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::capability::{known, CapabilitySet};
use crate::protocol::RpcSharedMemory;

/// Default threshold (bytes) above which an eligible input/output is carried
/// via shared memory rather than inline, when the transfer is enabled.
pub const DEFAULT_THRESHOLD_BYTES: usize = 32 * 1024;

/// Whether shared-memory transfer is enabled for this process: both the
/// host-wide environment flag and the negotiated capability must be present.
pub fn is_enabled(host_env_enabled: bool, caps: &CapabilitySet) -> bool {
    host_env_enabled && caps.has(known::SHARED_MEMORY_DATA_TRANSFER)
}

struct Region {
    data: Vec<u8>,
    ref_count: usize,
    pinned: bool,
}

/// Process-wide registry of named memory regions, shared across channels.
#[derive(Clone, Default)]
pub struct SharedMemoryManager {
    regions: Arc<Mutex<HashMap<String, Region>>>,
    next_id: Arc<Mutex<u64>>,
}

impl SharedMemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a fresh region, write `payload` into it, and return a
    /// descriptor the host can embed in an outbound message.
    pub fn write(&self, payload: &[u8], type_tag: &str) -> RpcSharedMemory {
        let id = {
            let mut n = self.next_id.lock();
            *n += 1;
            *n
        };
        let region_name = format!("wc-shm-{id}");
        self.regions.lock().insert(
            region_name.clone(),
            Region {
                data: payload.to_vec(),
                ref_count: 1,
                pinned: false,
            },
        );
        RpcSharedMemory {
            region_name,
            offset: 0,
            count: payload.len() as u64,
            type_tag: type_tag.to_string(),
        }
    }

    /// Read out a region's bytes (host is the reader for outputs written by
    /// the worker).
    pub fn read(&self, descriptor: &RpcSharedMemory) -> Option<Vec<u8>> {
        let regions = self.regions.lock();
        regions.get(&descriptor.region_name).map(|r| {
            let start = descriptor.offset as usize;
            let end = start + descriptor.count as usize;
            r.data.get(start..end).map(<[u8]>::to_vec).unwrap_or_default()
        })
    }

    /// Pin a region so the Function Data Cache can reuse it for a later
    /// invocation's input; release is deferred until `evict`.
    pub fn pin(&self, region_name: &str) {
        if let Some(region) = self.regions.lock().get_mut(region_name) {
            region.pinned = true;
            region.ref_count += 1;
        }
    }

    pub fn evict(&self, region_name: &str) {
        let mut regions = self.regions.lock();
        if let Some(region) = regions.get_mut(region_name) {
            region.pinned = false;
        }
        Self::release_locked(&mut regions, region_name);
    }

    /// Release the host's reference to a region once its owning message has
    /// been acknowledged. A pinned region is not actually freed until
    /// `evict` drops the pin.
    pub fn release(&self, region_name: &str) {
        let mut regions = self.regions.lock();
        Self::release_locked(&mut regions, region_name);
    }

    fn release_locked(regions: &mut HashMap<String, Region>, region_name: &str) {
        let mut remove = false;
        if let Some(region) = regions.get_mut(region_name) {
            if region.ref_count > 0 {
                region.ref_count -= 1;
            }
            remove = region.ref_count == 0 && !region.pinned;
        }
        if remove {
            regions.remove(region_name);
        }
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_without_host_flag_even_with_capability() {
        let caps = CapabilitySet::new();
        let mut m = HashMap::new();
        m.insert(known::SHARED_MEMORY_DATA_TRANSFER.to_string(), "1".to_string());
        caps.freeze(m);
        assert!(!is_enabled(false, &caps));
        assert!(is_enabled(true, &caps));
    }

    #[test]
    fn write_then_read_round_trips() {
        let mgr = SharedMemoryManager::new();
        let descriptor = mgr.write(b"hello world", "bytes");
        assert_eq!(mgr.read(&descriptor).unwrap(), b"hello world");
    }

    #[test]
    fn pinned_region_survives_release() {
        let mgr = SharedMemoryManager::new();
        let descriptor = mgr.write(b"payload", "bytes");
        mgr.pin(&descriptor.region_name);
        mgr.release(&descriptor.region_name);
        assert_eq!(mgr.region_count(), 1, "pinned region must survive a release");
        mgr.evict(&descriptor.region_name);
        assert_eq!(mgr.region_count(), 0);
    }
}
