//! The client↔PPE channel: one shared region holding the four-level
//! handshake, the PPE's inbound command queue and the slab of command
//! buffers every client allocates from.
//!
//! Handshake levels: 0 idle, 1 reserved by a client, 2 request submitted,
//! 3 reply ready. Exactly one client may hold levels 1–3; the winner posts
//! its PID, the PPE replies with a cookie and the owner-space address of
//! the buffer slab, which is what makes the pool's free list and the
//! queue's links meaningful to the client.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::{debug, trace};
use portals_types::{PtlError, Result};

use crate::command::{CmdBuf, OpCode, CMD_BUF_SIZE};
use crate::params::params;
use crate::pool::{PoolHdr, SharedPool};
use crate::queue::{BufLink, SharedQueue, View};
use crate::shm::{self, ShmRegion};

/// Default name of the comm pad; a PPE serving one job may override it.
pub const COMM_PAD_NAME: &str = "/portals4-ppe-comm-pad";

const LEVEL_IDLE: u32 = 0;
const LEVEL_RESERVED: u32 = 1;
const LEVEL_SUBMITTED: u32 = 2;
const LEVEL_READY: u32 = 3;

#[repr(C)]
struct Handshake {
    level: AtomicU32,
    ret: AtomicU32,
    pid: AtomicU32,
    _pad: u32,
    cookie: AtomicU64,
    bufs_owner_addr: AtomicU64,
}

#[repr(C)]
struct CommPadHdr {
    handshake: Handshake,
    queue: SharedQueue,
    buf_pool: PoolHdr,
}

fn slab_offset() -> usize {
    std::mem::size_of::<CommPadHdr>().next_multiple_of(64)
}

fn pad_size(num_bufs: u32) -> usize {
    slab_offset() + num_bufs as usize * CMD_BUF_SIZE
}

/// PPE end: creates the region and accepts clients.
pub struct PpeChannel {
    region: ShmRegion,
    pool: SharedPool,
    name: String,
    next_cookie: AtomicU64,
}

impl PpeChannel {
    pub fn create(name: &str) -> Result<PpeChannel> {
        let num_bufs = params().num_sbufs;
        let region = ShmRegion::create(name, pad_size(num_bufs))?;
        let hdr: &CommPadHdr = unsafe { region.at(0) };
        hdr.handshake.level.store(LEVEL_IDLE, Ordering::Relaxed);
        hdr.queue.init();
        let slab = unsafe { region.base().add(slab_offset()) };
        // owner space is the PPE's own mapping
        let pool = unsafe {
            SharedPool::init(&hdr.buf_pool, slab, slab as u64, CMD_BUF_SIZE, num_bufs)
        };
        debug!("created comm pad {name} with {num_bufs} command buffers");
        Ok(PpeChannel { region, pool, name: name.to_string(), next_cookie: AtomicU64::new(1) })
    }

    fn hdr(&self) -> &CommPadHdr {
        unsafe { self.region.at(0) }
    }

    /// Serve one pending handshake, if a client has submitted. Returns the
    /// `(cookie, pid)` of the admitted client.
    pub fn accept(&self) -> Option<(u64, u32)> {
        let hs = &self.hdr().handshake;
        if hs.level.load(Ordering::Acquire) != LEVEL_SUBMITTED {
            return None;
        }
        let pid = hs.pid.load(Ordering::Relaxed);
        let cookie = self.next_cookie.fetch_add(1, Ordering::Relaxed);
        hs.cookie.store(cookie, Ordering::Relaxed);
        hs.bufs_owner_addr
            .store(self.pool.slab_owner(), Ordering::Relaxed);
        hs.ret.store(0, Ordering::Relaxed);
        hs.level.store(LEVEL_READY, Ordering::Release);
        debug!("admitted client pid {pid} as cookie {cookie}");
        Some((cookie, pid))
    }

    /// Pop the next submitted command.
    pub fn next_cmd(&self) -> Option<*mut CmdBuf> {
        unsafe {
            self.hdr()
                .queue
                .dequeue(View::identity())
                .map(|link| link.cast())
        }
    }

}

impl Drop for PpeChannel {
    fn drop(&mut self) {
        shm::unlink(&self.name);
    }
}

/// Client end: maps the pad, runs the handshake, then sends commands.
pub struct PpeClient {
    region: ShmRegion,
    pool: SharedPool,
    view: View,
    cookie: u64,
}

impl PpeClient {
    pub fn connect(name: &str) -> Result<PpeClient> {
        let num_bufs = params().num_sbufs;
        let region = ShmRegion::open(name, pad_size(num_bufs))?;
        let hdr: &CommPadHdr = unsafe { region.at(0) };
        let hs = &hdr.handshake;

        // claim the handshake slot
        while hs
            .level
            .compare_exchange(LEVEL_IDLE, LEVEL_RESERVED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            std::hint::spin_loop();
        }
        hs.pid.store(std::process::id(), Ordering::Relaxed);
        hs.level.store(LEVEL_SUBMITTED, Ordering::Release);
        while hs.level.load(Ordering::Acquire) != LEVEL_READY {
            std::hint::spin_loop();
        }
        let ret = hs.ret.load(Ordering::Relaxed);
        let cookie = hs.cookie.load(Ordering::Relaxed);
        let bufs_owner = hs.bufs_owner_addr.load(Ordering::Relaxed);
        // give the slot back before looking at the outcome
        hs.level.store(LEVEL_IDLE, Ordering::Release);
        if ret != 0 {
            return Err(PtlError::Fail);
        }

        let slab_local = unsafe { region.base().add(slab_offset()) };
        let view = View::new(slab_local, bufs_owner);
        let pool = unsafe {
            SharedPool::attach(&hdr.buf_pool, slab_local, bufs_owner, CMD_BUF_SIZE, num_bufs)
        };
        trace!(
            "connected to {name}: cookie {cookie}, slab delta {:#x}",
            (slab_local as i64).wrapping_sub(bufs_owner as i64)
        );
        Ok(PpeClient { region, pool, view, cookie })
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    /// Allocate and arm a command buffer. Backs off while the pool is
    /// drained by other threads.
    pub fn alloc_cmd(&self, op: OpCode) -> Result<*mut CmdBuf> {
        let owner = loop {
            match self.pool.alloc() {
                Some(owner) => break owner,
                None => std::thread::yield_now(),
            }
        };
        let buf: *mut CmdBuf = self.pool.local(owner).cast();
        unsafe { CmdBuf::arm(buf, op, self.cookie) };
        Ok(buf)
    }

    /// Submit a command and busy-wait for the PPE's reply.
    pub fn transfer(&self, buf: *mut CmdBuf) -> Result<()> {
        let hdr: &CommPadHdr = unsafe { self.region.at(0) };
        unsafe { hdr.queue.enqueue(self.view, buf.cast::<BufLink>()) };
        let mut spins = 0u64;
        while !unsafe { &*buf }.is_completed() {
            spins += 1;
            if spins % (1 << 14) == 0 {
                std::thread::sleep(std::time::Duration::from_micros(
                    params().poll_interval_us,
                ));
            } else {
                std::hint::spin_loop();
            }
        }
        portals_types::RetCode::decode(unsafe { (*buf).ret })
    }

    /// Give a completed buffer back to the shared pool.
    pub fn release_cmd(&self, buf: *mut CmdBuf) {
        self.pool.free(self.view.to_owner(buf.cast()));
    }
}
