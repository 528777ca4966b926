//! Registered memory regions. Buffers queued for RDMA hold shared
//! references to the regions covering them; a region is deregistered from
//! the fabric when the last reference drops.

use std::sync::Arc;

use log::trace;
use portals_types::{PtlError, Result};
use spin::Mutex;

use crate::verbs::{MrKeys, RdmaProvider};

pub struct Mr {
    pub base: u64,
    pub len: u64,
    pub keys: MrKeys,
    provider: Arc<dyn RdmaProvider>,
}

impl Mr {
    pub fn covers(&self, addr: u64, len: u64) -> bool {
        addr >= self.base && addr + len <= self.base + self.len
    }
}

impl Drop for Mr {
    fn drop(&mut self) {
        self.provider.deregister_mr(self.keys.lkey);
    }
}

/// Per-NI region list. Lookups register missing ranges on demand, the way
/// the target engine expects: any local segment it is about to put into an
/// SGL resolves to keys in one call.
pub struct MrTable {
    provider: Arc<dyn RdmaProvider>,
    regions: Mutex<Vec<Arc<Mr>>>,
}

impl MrTable {
    pub fn new(provider: Arc<dyn RdmaProvider>) -> MrTable {
        MrTable { provider, regions: Mutex::new(Vec::new()) }
    }

    /// Find a region covering `[addr, addr+len)`, registering one if none
    /// exists yet.
    pub fn lookup(&self, addr: u64, len: u64) -> Result<Arc<Mr>> {
        if len == 0 {
            return Err(PtlError::InvalidArg);
        }
        let mut regions = self.regions.lock();
        if let Some(mr) = regions.iter().find(|mr| mr.covers(addr, len)) {
            return Ok(mr.clone());
        }
        let keys = self.provider.register_mr(addr as *mut u8, len as usize)?;
        trace!("registered mr {:#x}+{len} lkey {}", addr, keys.lkey);
        let mr = Arc::new(Mr { base: addr, len, keys, provider: self.provider.clone() });
        regions.push(mr.clone());
        Ok(mr)
    }

    /// Drop the table's own references; pinned regions survive until their
    /// in-flight holders finish.
    pub fn clear(&self) {
        self.regions.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.regions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verbs::LoopbackFabric;

    #[test]
    fn lookup_caches_covering_regions() {
        let fabric = LoopbackFabric::new();
        let table = MrTable::new(fabric.clone());
        let buf = vec![0u8; 4096];
        let base = buf.as_ptr() as u64;
        let a = table.lookup(base, 4096).unwrap();
        let b = table.lookup(base + 128, 64).unwrap();
        assert_eq!(a.keys.lkey, b.keys.lkey);
        assert_eq!(table.len(), 1);
        let c = table.lookup(base + 4000, 200).unwrap();
        assert_ne!(a.keys.lkey, c.keys.lkey);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn pinned_region_outlives_clear() {
        let fabric = LoopbackFabric::new();
        let table = MrTable::new(fabric.clone());
        let buf = vec![0u8; 64];
        let mr = table.lookup(buf.as_ptr() as u64, 64).unwrap();
        table.clear();
        assert!(mr.covers(buf.as_ptr() as u64, 64));
    }
}
