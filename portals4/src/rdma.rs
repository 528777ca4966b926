//! Target-side RDMA engine. A matched request arrives carrying the
//! initiator's scatter/gather descriptor; this module turns it into a
//! bounded stream of one-sided reads or writes between the initiator's
//! windows and the local entry's segments.
//!
//! The outer loop advances through remote SGL entries, the inner loop
//! walks the local segment list building an SGL capped at the queue
//! pair's send-SGE limit, registering memory regions on demand and
//! pinning them on a holder until a completion covers the work request.
//! Completions are coalesced: only the last WR of a burst is signaled,
//! with a burst ending when the transfer is done or the outstanding-WR
//! cap is reached; a per-connection countdown additionally signals one WR
//! every so many unsignaled posts so the send queue drains. The engine is
//! reentrant: it parks its cursors in the transfer and resumes from them
//! on the next completion.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::trace;
use portals_types::wire::{DataDir, Sge};
use portals_types::{PtlError, Result};

use crate::md::Seg;
use crate::mr::{Mr, MrTable};
use crate::params::params;
use crate::verbs::{QueuePair, WorkRequest, WrOpcode};

/// Pins the regions referenced by posted work requests until a signaled
/// completion proves the hardware is done with them.
struct RdmaBuf {
    mrs: Vec<Arc<Mr>>,
}

/// Per-connection countdown for the drain-signal policy.
#[derive(Default)]
pub struct CompThreshold(AtomicU32);

impl CompThreshold {
    /// Count one unsignaled post; true when this one must be signaled.
    fn bump(&self) -> bool {
        if self.0.fetch_add(1, Ordering::AcqRel) + 1 >= params().send_comp_threshold {
            self.0.store(0, Ordering::Release);
            true
        } else {
            false
        }
    }
}

/// The resumable state of one target-side transfer.
pub struct RdmaXfer {
    pub dir: DataDir,
    /// Bytes still to move; zero exactly when the transfer is complete.
    pub resid: u64,
    /// Identifies this transfer in signaled completions.
    pub wr_id: u64,
    cur_loc_index: usize,
    cur_loc_off: u64,
    rem_sges: Vec<Sge>,
    cur_rem_sge: usize,
    cur_rem_off: u64,
    /// Set while a signaled WR is in flight; the engine must not be
    /// re-entered until its completion arrives.
    awaiting_comp: bool,
    holders: Vec<RdmaBuf>,
    /// Pending indirect-descriptor fetch: the raw bytes land here first.
    desc: Option<(Box<[u8]>, Arc<Mr>, usize)>,
}

/// Collapse remote windows that continue each other under the same key;
/// a single work request can then cover what arrived as many entries.
fn merge_adjacent(sges: Vec<Sge>) -> Vec<Sge> {
    let mut out: Vec<Sge> = Vec::with_capacity(sges.len());
    for sge in sges {
        if let Some(last) = out.last_mut() {
            if last.key.get() == sge.key.get()
                && last.addr.get() + last.length.get() as u64 == sge.addr.get()
                && last.length.get().checked_add(sge.length.get()).is_some()
            {
                last.length.set(last.length.get() + sge.length.get());
                continue;
            }
        }
        out.push(sge);
    }
    out
}

impl RdmaXfer {
    pub fn new(dir: DataDir, length: u64, rem_sges: Vec<Sge>, wr_id: u64) -> RdmaXfer {
        RdmaXfer {
            dir,
            resid: length,
            wr_id,
            cur_loc_index: 0,
            cur_loc_off: 0,
            rem_sges: merge_adjacent(rem_sges),
            cur_rem_sge: 0,
            cur_rem_off: 0,
            awaiting_comp: false,
            holders: Vec::new(),
            desc: None,
        }
    }

    /// Begin a transfer whose SGL itself lives at the initiator: read the
    /// descriptor into a registered bounce buffer first.
    pub fn new_indirect(
        dir: DataDir,
        length: u64,
        desc_window: Sge,
        wr_id: u64,
        mr_table: &MrTable,
        qp: &dyn QueuePair,
    ) -> Result<RdmaXfer> {
        let len = desc_window.length.get() as usize;
        if len == 0 || len % std::mem::size_of::<Sge>() != 0 {
            return Err(PtlError::InvalidArg);
        }
        let bounce = vec![0u8; len].into_boxed_slice();
        let mr = mr_table.lookup(bounce.as_ptr() as u64, len as u64)?;
        let mut xfer = RdmaXfer::new(dir, length, Vec::new(), wr_id);
        qp.post_send(WorkRequest {
            wr_id,
            opcode: WrOpcode::RdmaRead,
            sg_list: vec![Sge::new(bounce.as_ptr() as u64, len as u32, mr.keys.lkey)],
            remote_addr: desc_window.addr.get(),
            rkey: desc_window.key.get(),
            signaled: true,
        })?;
        xfer.awaiting_comp = true;
        xfer.desc = Some((bounce, mr, len / std::mem::size_of::<Sge>()));
        Ok(xfer)
    }

    pub fn is_fetching_desc(&self) -> bool {
        self.desc.is_some()
    }

    pub fn is_done(&self) -> bool {
        self.resid == 0 && !self.awaiting_comp
    }

    /// Account a signaled completion for this transfer; the WRs it covers
    /// were posted before it, so every pinned region can go.
    pub fn on_completion(&mut self) {
        debug_assert!(self.awaiting_comp);
        self.holders.clear();
        self.awaiting_comp = false;
        if let Some((bounce, _mr, count)) = self.desc.take() {
            // the descriptor arrived; adopt it as the remote SGL
            let mut sges = Vec::with_capacity(count);
            for chunk in bounce.chunks_exact(std::mem::size_of::<Sge>()) {
                let mut sge = Sge::default();
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        chunk.as_ptr(),
                        &mut sge as *mut Sge as *mut u8,
                        std::mem::size_of::<Sge>(),
                    );
                }
                sges.push(sge);
            }
            trace!("indirect SGL fetched: {} entries", sges.len());
            self.rem_sges = merge_adjacent(sges);
        }
    }

    /// Issue one-sided operations until the transfer finishes, the
    /// outstanding cap forces a wait, or posting fails. Re-entered after
    /// each signaled completion.
    pub fn process(
        &mut self,
        local: &[Seg],
        mr_table: &MrTable,
        qp: &dyn QueuePair,
        threshold: &CompThreshold,
    ) -> Result<()> {
        assert!(!self.awaiting_comp, "engine re-entered with a completion in flight");
        let max_out = params().max_rdma_wr_out;
        let sge_cap = params().max_qp_send_sge;
        let opcode = match self.dir {
            DataDir::In => WrOpcode::RdmaRead,
            DataDir::Out => WrOpcode::RdmaWrite,
        };
        let mut burst = 0u32;
        while self.resid > 0 {
            let rem = *self.rem_sges.get(self.cur_rem_sge).ok_or(PtlError::Fail)?;
            let rem_size = rem.length.get() as u64;
            let addr = rem.addr.get() + self.cur_rem_off;
            let rkey = rem.key.get();
            let mut chunk = self.resid.min(rem_size - self.cur_rem_off);

            let mut holder = RdmaBuf { mrs: Vec::new() };
            let sg_list = self.build_sge(local, &mut chunk, sge_cap, mr_table, &mut holder)?;

            self.resid -= chunk;
            self.cur_rem_off += chunk;
            if self.resid > 0 && self.cur_rem_off >= rem_size {
                self.cur_rem_sge += 1;
                self.cur_rem_off = 0;
            }

            burst += 1;
            // signal when done or when the outstanding cap is reached;
            // the per-connection countdown drains long unsignaled runs
            let comp = self.resid == 0 || burst >= max_out;
            let signaled = comp || threshold.bump();

            self.holders.push(holder);
            qp.post_send(WorkRequest {
                wr_id: if comp { self.wr_id } else { 0 },
                opcode,
                sg_list,
                remote_addr: addr,
                rkey,
                signaled,
            })?;

            if comp {
                self.awaiting_comp = true;
                break;
            }
        }
        Ok(())
    }

    /// The inner walk: fill an SGL from the local segments, bounded by the
    /// SGE cap and by `chunk` bytes; `chunk` is trimmed to what fit.
    fn build_sge(
        &mut self,
        local: &[Seg],
        chunk: &mut u64,
        sge_cap: usize,
        mr_table: &MrTable,
        holder: &mut RdmaBuf,
    ) -> Result<Vec<Sge>> {
        let mut sg_list = Vec::new();
        let mut resid = *chunk;
        let mut taken = 0u64;
        while resid > 0 {
            let seg = local.get(self.cur_loc_index).ok_or(PtlError::Fail)?;
            let bytes = resid.min(seg.len - self.cur_loc_off);
            let addr = seg.addr + self.cur_loc_off;

            let mr = mr_table.lookup(addr, bytes)?;
            sg_list.push(Sge::new(addr, bytes as u32, mr.keys.lkey));
            holder.mrs.push(mr);

            resid -= bytes;
            taken += bytes;
            self.cur_loc_off += bytes;
            if self.cur_loc_off >= seg.len {
                self.cur_loc_index += 1;
                self.cur_loc_off = 0;
            }
            if sg_list.len() >= sge_cap {
                break;
            }
        }
        *chunk = taken;
        Ok(sg_list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verbs::{Completion, LoopbackFabric, RdmaProvider};
    use spin::Mutex;

    /// Records every posted WR while forwarding to the loopback QP.
    struct RecordingQp {
        inner: Arc<dyn QueuePair>,
        posted: Mutex<Vec<(u64, usize, u64, bool)>>,
    }

    impl QueuePair for RecordingQp {
        fn post_send(&self, wr: WorkRequest) -> Result<()> {
            let bytes: u64 = wr.sg_list.iter().map(|s| s.length.get() as u64).sum();
            self.posted
                .lock()
                .push((wr.wr_id, wr.sg_list.len(), bytes, wr.signaled));
            self.inner.post_send(wr)
        }
        fn send_message(&self, bytes: Vec<u8>) -> Result<()> {
            self.inner.send_message(bytes)
        }
        fn poll_cq(&self, out: &mut Vec<Completion>) {
            self.inner.poll_cq(out)
        }
    }

    struct Rig {
        fabric: Arc<LoopbackFabric>,
        qp: RecordingQp,
        mr_table: MrTable,
    }

    fn rig() -> Rig {
        let fabric = LoopbackFabric::new();
        let qp = RecordingQp {
            inner: fabric.connect((1, 1), (2, 2)).unwrap(),
            posted: Mutex::new(Vec::new()),
        };
        let mr_table = MrTable::new(fabric.clone());
        Rig { fabric, qp, mr_table }
    }

    fn run_to_completion(xfer: &mut RdmaXfer, local: &[Seg], rig: &Rig) {
        let threshold = CompThreshold::default();
        let mut comps = Vec::new();
        while !xfer.is_done() {
            if !xfer.is_fetching_desc() {
                xfer.process(local, &rig.mr_table, &rig.qp, &threshold).unwrap();
            }
            if xfer.is_done() {
                break;
            }
            rig.qp.poll_cq(&mut comps);
            assert!(!comps.is_empty(), "engine stalled without a completion");
            for comp in comps.drain(..) {
                if comp.wr_id == 0 {
                    // drain-signal CQE, no transfer state attached
                    continue;
                }
                assert_eq!(comp.wr_id, xfer.wr_id);
                xfer.on_completion();
            }
        }
    }

    #[test]
    fn conserves_bytes_across_iovec_boundaries() {
        let rig = rig();
        // remote: initiator buffer of 64 KiB in 3 uneven windows
        let remote = vec![0xa5u8; 65536];
        let rkeys = rig.fabric.register_mr(remote.as_ptr() as *mut u8, 65536).unwrap();
        let base = remote.as_ptr() as u64;
        let rem_sges = vec![
            Sge::new(base, 10_000, rkeys.rkey),
            Sge::new(base + 10_000, 30_000, rkeys.rkey),
            Sge::new(base + 40_000, 25_536, rkeys.rkey),
        ];
        // local: a 40-element iovec entry
        let mut local_mem = vec![0u8; 65536];
        let local: Vec<Seg> = (0..40)
            .map(|i| Seg { addr: local_mem.as_mut_ptr() as u64 + i * 1638, len: 1638 })
            .collect();
        let total: u64 = 65520.min(local.iter().map(|s| s.len).sum());

        let mut xfer = RdmaXfer::new(DataDir::In, total, rem_sges, 42);
        run_to_completion(&mut xfer, &local, &rig);

        let posted = rig.qp.posted.lock();
        let moved: u64 = posted.iter().map(|p| p.2).sum();
        assert_eq!(moved, total, "posted WR byte lengths must sum to the length");
        for (_, sges, _, _) in posted.iter() {
            assert!(*sges <= params().max_qp_send_sge);
        }
        // the engine pulled the initiator's bytes into the local segments
        assert!(local_mem[..total as usize].iter().all(|b| *b == 0xa5));
    }

    #[test]
    fn outstanding_wrs_stay_bounded() {
        let rig = rig();
        let remote = vec![1u8; 1 << 21];
        let rkeys = rig.fabric.register_mr(remote.as_ptr() as *mut u8, 1 << 21).unwrap();
        // many gapped remote windows force many WRs
        let rem_sges: Vec<Sge> = (0..256)
            .map(|i| Sge::new(remote.as_ptr() as u64 + i * 8192, 4096, rkeys.rkey))
            .collect();
        let local_mem = vec![0u8; 1 << 20];
        let local = [Seg { addr: local_mem.as_ptr() as u64, len: 1 << 20 }];

        let mut xfer = RdmaXfer::new(DataDir::In, 1 << 20, rem_sges, 7);
        run_to_completion(&mut xfer, &local, &rig);

        let posted = rig.qp.posted.lock();
        let mut unsignaled_run = 0u32;
        for (_, _, _, signaled) in posted.iter() {
            if *signaled {
                unsignaled_run = 0;
            } else {
                unsignaled_run += 1;
                assert!(unsignaled_run < params().max_rdma_wr_out);
            }
        }
        assert!(posted.last().unwrap().3, "final WR must be signaled");
    }

    #[test]
    fn indirect_descriptor_is_fetched_first() {
        let rig = rig();
        let payload = vec![0x5au8; 160 * 1024];
        let pkeys = rig
            .fabric
            .register_mr(payload.as_ptr() as *mut u8, payload.len())
            .unwrap();
        // the initiator-side descriptor: 40 windows of 4 KiB
        let desc: Vec<Sge> = (0..40)
            .map(|i| Sge::new(payload.as_ptr() as u64 + i * 4096, 4096, pkeys.rkey))
            .collect();
        let desc_bytes = desc.len() * std::mem::size_of::<Sge>();
        let dkeys = rig
            .fabric
            .register_mr(desc.as_ptr() as *mut u8, desc_bytes)
            .unwrap();
        let window = Sge::new(desc.as_ptr() as u64, desc_bytes as u32, dkeys.rkey);

        let sink = vec![0u8; 160 * 1024];
        let local = [Seg { addr: sink.as_ptr() as u64, len: 160 * 1024 }];
        let mut xfer = RdmaXfer::new_indirect(
            DataDir::In,
            160 * 1024,
            window,
            3,
            &rig.mr_table,
            &rig.qp,
        )
        .unwrap();
        assert!(xfer.is_fetching_desc());
        run_to_completion(&mut xfer, &local, &rig);

        let posted = rig.qp.posted.lock();
        // exactly one descriptor read, then the data WRs
        assert_eq!(posted[0].2 as usize, desc_bytes);
        let data_wrs = posted.len() - 1;
        assert!(data_wrs <= 40_usize.div_ceil(params().max_qp_send_sge));
        assert!(sink.iter().all(|b| *b == 0x5a), "payload must arrive bit-exact");
    }

    #[test]
    fn write_direction_pushes_local_data() {
        let rig = rig();
        let remote = vec![0u8; 4096];
        let rkeys = rig.fabric.register_mr(remote.as_ptr() as *mut u8, 4096).unwrap();
        let rem_sges = vec![Sge::new(remote.as_ptr() as u64, 4096, rkeys.rkey)];
        let local_mem = vec![0x77u8; 4096];
        let local = [Seg { addr: local_mem.as_ptr() as u64, len: 4096 }];
        let mut xfer = RdmaXfer::new(DataDir::Out, 4096, rem_sges, 11);
        run_to_completion(&mut xfer, &local, &rig);
        assert!(remote.iter().all(|b| *b == 0x77));
    }
}
