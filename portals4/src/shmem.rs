//! Intra-node transport over one mmapped comm pad per NI. The pad holds a
//! presence table followed by one block per local rank: that rank's
//! inbound queue and its slab of send buffers. A sender allocates from its
//! own slab and enqueues onto the destination's queue; the receiver copies
//! the message out and sends the buffer back as a return, so every send
//! produces exactly one return and the slab never leaks across ranks.

use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, trace};
use portals_types::{Nid, Pid, PtlError, Result};

use crate::params::params;
use crate::pool::{PoolHdr, SharedPool};
use crate::queue::{BufLink, SharedQueue, View};
use crate::shm::{self, ShmRegion};

/// Payload bytes carried inline by one shared-memory buffer. Larger
/// transfers describe their data as mem-iovec cookies instead.
pub const SHMEM_BUF_PAYLOAD: usize = 4096 - 64;

const KIND_SEND: u32 = 0;
const KIND_RETURN: u32 = 1;

#[repr(C)]
struct PidEntry {
    nid: AtomicU32,
    pid: AtomicU32,
    valid: AtomicU32,
    _pad: u32,
}

#[repr(C)]
struct ShmemBuf {
    link: BufLink,
    kind: u32,
    /// Slot of the rank whose slab owns this buffer.
    owner_index: u32,
    len: u32,
    _pad: u32,
    payload: [u8; SHMEM_BUF_PAYLOAD],
}

#[repr(C)]
struct RankBlock {
    queue: SharedQueue,
    pool: PoolHdr,
}

const PAGE: usize = 4096;

fn pid_table_bytes(node_size: u32) -> usize {
    (node_size as usize * std::mem::size_of::<PidEntry>()).next_multiple_of(PAGE)
}

fn block_bytes(num_bufs: u32) -> usize {
    (std::mem::size_of::<RankBlock>().next_multiple_of(64)
        + num_bufs as usize * std::mem::size_of::<ShmemBuf>())
    .next_multiple_of(PAGE)
}

/// Region name for a physical NI, unique per process.
pub fn phys_pad_name(pid: Pid, options: u32) -> String {
    format!("/portals4-shmem-pid{pid}-{options}")
}

/// Region name for a logical NI, derived from the installed map so every
/// rank of the job opens the same pad.
pub fn logical_pad_name(map_hash: u32, options: u32) -> String {
    format!("/portals4-shmem-{map_hash:x}-{options}")
}

/// FNV-1a over the rank map.
pub fn map_hash(map: &[(Nid, Pid)]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for (nid, pid) in map {
        for word in [*nid, *pid] {
            for byte in word.to_le_bytes() {
                hash ^= byte as u32;
                hash = hash.wrapping_mul(0x0100_0193);
            }
        }
    }
    hash
}

/// A received message with the slot of the sending rank.
pub struct ShmemMsg {
    pub src_index: u32,
    pub bytes: Vec<u8>,
}

pub struct ShmemTransport {
    region: ShmRegion,
    index: u32,
    node_size: u32,
    /// This rank's send-buffer slab.
    pool: SharedPool,
}

impl ShmemTransport {
    /// Map the pad and announce presence. Slot 0 creates the region; the
    /// others open it and wait for the final size. Returns once every
    /// local slot has announced.
    pub fn setup(name: &str, index: u32, node_size: u32, id: (Nid, Pid)) -> Result<ShmemTransport> {
        let num_bufs = params().num_sbufs;
        let total = pid_table_bytes(node_size) + node_size as usize * block_bytes(num_bufs);
        // a fresh object is zero-filled by the truncate, so the presence
        // table starts invalid without any store from here
        let region = if index == 0 {
            ShmRegion::create(name, total)?
        } else {
            ShmRegion::open(name, total)?
        };

        let block_off =
            pid_table_bytes(node_size) + index as usize * block_bytes(num_bufs);
        let block: &RankBlock = unsafe { region.at(block_off) };
        block.queue.init();
        let slab_off = block_off + std::mem::size_of::<RankBlock>().next_multiple_of(64);
        let slab = unsafe { region.base().add(slab_off) };
        // owner space of the pad is region offsets, identical in every
        // mapping; offset 0 is the presence table, never a buffer
        let pool = unsafe {
            SharedPool::init(
                &block.pool,
                slab,
                slab_off as u64,
                std::mem::size_of::<ShmemBuf>(),
                num_bufs,
            )
        };

        let transport = ShmemTransport { region, index, node_size, pool };

        // announce: identity first, then the release-fenced valid flag
        let me = transport.pid_entry(index);
        me.nid.store(id.0, Ordering::Relaxed);
        me.pid.store(id.1, Ordering::Relaxed);
        me.valid.store(1, Ordering::Release);

        for slot in 0..node_size {
            while transport.pid_entry(slot).valid.load(Ordering::Acquire) == 0 {
                std::hint::spin_loop();
            }
        }
        debug!("shmem pad {name}: slot {index}/{node_size} up");
        // every slot has mapped the pad; nobody else needs the file
        shm::unlink(name);
        Ok(transport)
    }

    fn pid_entry(&self, slot: u32) -> &PidEntry {
        unsafe {
            self.region
                .at::<PidEntry>(slot as usize * std::mem::size_of::<PidEntry>())
        }
    }

    /// Identity announced by a slot.
    pub fn peer_id(&self, slot: u32) -> (Nid, Pid) {
        let entry = self.pid_entry(slot);
        (entry.nid.load(Ordering::Relaxed), entry.pid.load(Ordering::Relaxed))
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn node_size(&self) -> u32 {
        self.node_size
    }

    fn view(&self) -> View {
        View::new(self.region.base(), 0)
    }

    fn queue_of(&self, slot: u32) -> &SharedQueue {
        let off = pid_table_bytes(self.node_size)
            + slot as usize * block_bytes(params().num_sbufs);
        let block: &RankBlock = unsafe { self.region.at(off) };
        &block.queue
    }

    /// Send `bytes` to a co-located slot. The buffer comes from this
    /// rank's slab and will come back as a return once consumed.
    pub fn send(&self, dest: u32, bytes: &[u8]) -> Result<()> {
        if dest >= self.node_size || bytes.len() > SHMEM_BUF_PAYLOAD {
            return Err(PtlError::InvalidArg);
        }
        let owner = self.pool.alloc().ok_or(PtlError::NoSpace)?;
        let buf: *mut ShmemBuf = self.view().to_local(owner).cast();
        unsafe {
            std::ptr::addr_of_mut!((*buf).kind).write(KIND_SEND);
            std::ptr::addr_of_mut!((*buf).owner_index).write(self.index);
            std::ptr::addr_of_mut!((*buf).len).write(bytes.len() as u32);
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                std::ptr::addr_of_mut!((*buf).payload).cast(),
                bytes.len(),
            );
            self.queue_of(dest).enqueue(self.view(), buf.cast::<BufLink>());
        }
        trace!("shmem slot {} -> {} ({} bytes)", self.index, dest, bytes.len());
        Ok(())
    }

    /// Drain this rank's queue: recycle returns, hand one received message
    /// back to the caller and return the consumed buffer to its owner.
    pub fn poll(&self) -> Option<ShmemMsg> {
        loop {
            let link = unsafe { self.queue_of(self.index).dequeue(self.view()) }?;
            let buf: *mut ShmemBuf = link.cast();
            let (kind, owner_index, len) = unsafe {
                (
                    std::ptr::addr_of!((*buf).kind).read(),
                    std::ptr::addr_of!((*buf).owner_index).read(),
                    std::ptr::addr_of!((*buf).len).read(),
                )
            };
            if kind == KIND_RETURN {
                // one of ours came home
                debug_assert_eq!(owner_index, self.index);
                self.pool.free(self.view().to_owner(buf.cast()));
                continue;
            }
            let mut bytes = vec![0u8; len as usize];
            unsafe {
                std::ptr::copy_nonoverlapping(
                    std::ptr::addr_of!((*buf).payload).cast::<u8>(),
                    bytes.as_mut_ptr(),
                    len as usize,
                );
                std::ptr::addr_of_mut!((*buf).kind).write(KIND_RETURN);
                self.queue_of(owner_index)
                    .enqueue(self.view(), buf.cast::<BufLink>());
            }
            return Some(ShmemMsg { src_index: owner_index, bytes });
        }
    }

    /// Outstanding send buffers not yet returned by peers.
    pub fn bufs_outstanding(&self) -> u32 {
        let mut free = 0;
        let mut held = Vec::new();
        while let Some(owner) = self.pool.alloc() {
            held.push(owner);
            free += 1;
        }
        for owner in held {
            self.pool.free(owner);
        }
        params().num_sbufs - free
    }
}
