//! The slice of the RDMA stack the transfer engine consumes: memory
//! registration handing out keys, queue pairs accepting one-sided work
//! requests, and a completion stream reaped in posted order.
//!
//! The surface is a trait: the engine must not care whether a real HCA or
//! the in-tree loopback fabric executes its work requests. The loopback
//! fabric also models address/route resolution and connection acceptance,
//! including injectable transient failures, so the connection state
//! machine can be driven through every edge.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::trace;
use portals_types::wire::Sge;
use portals_types::{Nid, Pid, PtlError, Result};
use spin::Mutex;

/// Physical endpoint of a queue pair.
pub type PeerAddr = (Nid, Pid);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WrOpcode {
    RdmaRead,
    RdmaWrite,
}

/// A one-sided work request. `sg_list` names local registered memory; the
/// remote side is a single `{addr, rkey}` window.
pub struct WorkRequest {
    pub wr_id: u64,
    pub opcode: WrOpcode,
    pub sg_list: Vec<Sge>,
    pub remote_addr: u64,
    pub rkey: u32,
    /// Request a completion for this WR. Unsignaled WRs complete silently.
    pub signaled: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    Error,
}

#[derive(Clone, Copy, Debug)]
pub struct Completion {
    pub wr_id: u64,
    pub status: WcStatus,
}

/// Keys minted by memory registration.
#[derive(Clone, Copy, Debug)]
pub struct MrKeys {
    pub lkey: u32,
    pub rkey: u32,
}

/// A connected queue pair. WRs complete in posted order; the engine's
/// completion coalescing depends on that.
pub trait QueuePair: Send + Sync {
    fn post_send(&self, wr: WorkRequest) -> Result<()>;

    /// Deliver a protocol message to the peer's receive stream.
    fn send_message(&self, bytes: Vec<u8>) -> Result<()>;

    /// Reap available completions into `out`.
    fn poll_cq(&self, out: &mut Vec<Completion>);
}

/// The fabric: registration, resolution, connection setup and the inbound
/// message streams of every local endpoint.
pub trait RdmaProvider: Send + Sync {
    fn register_mr(&self, base: *mut u8, len: usize) -> Result<MrKeys>;
    fn deregister_mr(&self, lkey: u32);

    /// First connection stage; transient failures are retryable.
    fn resolve_addr(&self, nid: Nid) -> Result<()>;
    /// Second connection stage.
    fn resolve_route(&self, nid: Nid) -> Result<()>;
    /// Active connect. The passive side just sees the QP appear.
    fn connect(&self, local: PeerAddr, remote: PeerAddr) -> Result<Arc<dyn QueuePair>>;

    /// Pop the next message addressed to `local`, with the sender's
    /// physical id.
    fn recv(&self, local: PeerAddr) -> Option<(PeerAddr, Vec<u8>)>;
}

struct Region {
    base: u64,
    len: u64,
}

#[derive(Default)]
struct FabricState {
    regions: HashMap<u32, Region>,
    next_key: u32,
    inboxes: HashMap<PeerAddr, VecDeque<(PeerAddr, Vec<u8>)>>,
    fail_resolve_addr: HashMap<Nid, u32>,
    fail_resolve_route: HashMap<Nid, u32>,
    fail_connect: HashMap<Nid, u32>,
}

/// In-process fabric: executes work requests synchronously against
/// registered memory, which trivially preserves posted order.
pub struct LoopbackFabric {
    state: Mutex<FabricState>,
    self_ref: std::sync::Weak<LoopbackFabric>,
}

impl LoopbackFabric {
    pub fn new() -> Arc<LoopbackFabric> {
        Arc::new_cyclic(|self_ref| LoopbackFabric {
            state: Mutex::new(FabricState::default()),
            self_ref: self_ref.clone(),
        })
    }

    /// Make the next `count` address resolutions of `nid` fail.
    pub fn fail_resolve_addr(&self, nid: Nid, count: u32) {
        self.state.lock().fail_resolve_addr.insert(nid, count);
    }

    pub fn fail_resolve_route(&self, nid: Nid, count: u32) {
        self.state.lock().fail_resolve_route.insert(nid, count);
    }

    pub fn fail_connect(&self, nid: Nid, count: u32) {
        self.state.lock().fail_connect.insert(nid, count);
    }

    fn check_window(&self, rkey: u32, addr: u64, len: u64) -> Result<*mut u8> {
        let state = self.state.lock();
        let region = state.regions.get(&rkey).ok_or(PtlError::Fail)?;
        if addr < region.base || addr + len > region.base + region.len {
            return Err(PtlError::Fail);
        }
        Ok(addr as *mut u8)
    }

    fn consume_failure(map: &mut HashMap<Nid, u32>, nid: Nid) -> bool {
        match map.get_mut(&nid) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    }
}

impl RdmaProvider for LoopbackFabric {
    fn register_mr(&self, base: *mut u8, len: usize) -> Result<MrKeys> {
        let mut state = self.state.lock();
        state.next_key += 1;
        let key = state.next_key;
        state.regions.insert(key, Region { base: base as u64, len: len as u64 });
        Ok(MrKeys { lkey: key, rkey: key })
    }

    fn deregister_mr(&self, lkey: u32) {
        self.state.lock().regions.remove(&lkey);
    }

    fn resolve_addr(&self, nid: Nid) -> Result<()> {
        if Self::consume_failure(&mut self.state.lock().fail_resolve_addr, nid) {
            return Err(PtlError::Fail);
        }
        Ok(())
    }

    fn resolve_route(&self, nid: Nid) -> Result<()> {
        if Self::consume_failure(&mut self.state.lock().fail_resolve_route, nid) {
            return Err(PtlError::Fail);
        }
        Ok(())
    }

    fn connect(&self, local: PeerAddr, remote: PeerAddr) -> Result<Arc<dyn QueuePair>> {
        let fabric = self.self_ref.upgrade().ok_or(PtlError::Fail)?;
        Ok(LoopbackQp::create(&fabric, local, remote)?)
    }

    fn recv(&self, local: PeerAddr) -> Option<(PeerAddr, Vec<u8>)> {
        self.state.lock().inboxes.get_mut(&local)?.pop_front()
    }
}

/// A loopback queue pair bound to `(local, remote)`.
pub struct LoopbackQp {
    fabric: Arc<LoopbackFabric>,
    local: PeerAddr,
    remote: PeerAddr,
    cq: Mutex<VecDeque<Completion>>,
}

impl LoopbackQp {
    pub fn create(
        fabric: &Arc<LoopbackFabric>,
        local: PeerAddr,
        remote: PeerAddr,
    ) -> Result<Arc<LoopbackQp>> {
        if LoopbackFabric::consume_failure(
            &mut fabric.state.lock().fail_connect,
            remote.0,
        ) {
            return Err(PtlError::Fail);
        }
        trace!("loopback qp {:?} -> {:?}", local, remote);
        Ok(Arc::new(LoopbackQp {
            fabric: fabric.clone(),
            local,
            remote,
            cq: Mutex::new(VecDeque::new()),
        }))
    }
}

impl QueuePair for LoopbackQp {
    fn post_send(&self, wr: WorkRequest) -> Result<()> {
        let total: u64 = wr.sg_list.iter().map(|sge| sge.length.get() as u64).sum();
        let remote = self.fabric.check_window(wr.rkey, wr.remote_addr, total)?;
        let mut cursor = remote;
        for sge in &wr.sg_list {
            let len = sge.length.get() as usize;
            let local = self
                .fabric
                .check_window(sge.key.get(), sge.addr.get(), len as u64)?;
            unsafe {
                match wr.opcode {
                    // read: remote initiator memory into local segments
                    WrOpcode::RdmaRead => std::ptr::copy_nonoverlapping(cursor, local, len),
                    WrOpcode::RdmaWrite => std::ptr::copy_nonoverlapping(local, cursor, len),
                }
                cursor = cursor.add(len);
            }
        }
        if wr.signaled {
            self.cq
                .lock()
                .push_back(Completion { wr_id: wr.wr_id, status: WcStatus::Success });
        }
        Ok(())
    }

    fn send_message(&self, bytes: Vec<u8>) -> Result<()> {
        let mut state = self.fabric.state.lock();
        state
            .inboxes
            .entry(self.remote)
            .or_default()
            .push_back((self.local, bytes));
        Ok(())
    }

    fn poll_cq(&self, out: &mut Vec<Completion>) {
        let mut cq = self.cq.lock();
        out.extend(cq.drain(..));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_sided_write_and_read() {
        let fabric = LoopbackFabric::new();
        let mut src = vec![7u8; 64];
        let mut dst = vec![0u8; 64];
        let src_keys = fabric.register_mr(src.as_mut_ptr(), src.len()).unwrap();
        let dst_keys = fabric.register_mr(dst.as_mut_ptr(), dst.len()).unwrap();
        let qp = LoopbackQp::create(&fabric, (0, 1), (0, 2)).unwrap();

        qp.post_send(WorkRequest {
            wr_id: 1,
            opcode: WrOpcode::RdmaWrite,
            sg_list: vec![Sge::new(src.as_ptr() as u64, 64, src_keys.lkey)],
            remote_addr: dst.as_ptr() as u64,
            rkey: dst_keys.rkey,
            signaled: true,
        })
        .unwrap();
        assert_eq!(dst, src);

        let mut comps = Vec::new();
        qp.poll_cq(&mut comps);
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].wr_id, 1);
        assert_eq!(comps[0].status, WcStatus::Success);
    }

    #[test]
    fn unsignaled_wr_completes_silently() {
        let fabric = LoopbackFabric::new();
        let mut buf = vec![1u8; 16];
        let keys = fabric.register_mr(buf.as_mut_ptr(), buf.len()).unwrap();
        let qp = LoopbackQp::create(&fabric, (0, 1), (0, 2)).unwrap();
        qp.post_send(WorkRequest {
            wr_id: 9,
            opcode: WrOpcode::RdmaRead,
            sg_list: vec![Sge::new(buf.as_ptr() as u64, 16, keys.lkey)],
            remote_addr: buf.as_ptr() as u64,
            rkey: keys.rkey,
            signaled: false,
        })
        .unwrap();
        let mut comps = Vec::new();
        qp.poll_cq(&mut comps);
        assert!(comps.is_empty());
    }

    #[test]
    fn out_of_window_access_fails() {
        let fabric = LoopbackFabric::new();
        let mut buf = vec![0u8; 32];
        let keys = fabric.register_mr(buf.as_mut_ptr(), buf.len()).unwrap();
        let qp = LoopbackQp::create(&fabric, (0, 1), (0, 2)).unwrap();
        let err = qp.post_send(WorkRequest {
            wr_id: 2,
            opcode: WrOpcode::RdmaWrite,
            sg_list: vec![Sge::new(buf.as_ptr() as u64, 64, keys.lkey)],
            remote_addr: buf.as_ptr() as u64,
            rkey: keys.rkey,
            signaled: true,
        });
        assert_eq!(err, Err(PtlError::Fail));
    }

    #[test]
    fn injected_failures_are_transient() {
        let fabric = LoopbackFabric::new();
        fabric.fail_resolve_addr(4, 2);
        assert!(fabric.resolve_addr(4).is_err());
        assert!(fabric.resolve_addr(4).is_err());
        assert!(fabric.resolve_addr(4).is_ok());
        assert!(fabric.resolve_route(4).is_ok());
    }

    #[test]
    fn messages_reach_the_peer_inbox() {
        let fabric = LoopbackFabric::new();
        let qp = LoopbackQp::create(&fabric, (1, 10), (2, 20)).unwrap();
        qp.send_message(vec![1, 2, 3]).unwrap();
        assert!(fabric.recv((1, 10)).is_none());
        let (from, msg) = fabric.recv((2, 20)).unwrap();
        assert_eq!(from, (1, 10));
        assert_eq!(msg, vec![1, 2, 3]);
    }
}
