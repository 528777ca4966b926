//! Slab pools with a lock-free LIFO free list, usable both process-local
//! and inside a shared region mapped at different addresses by different
//! processes.
//!
//! The free list head is one `AtomicU64` packing `{slot offset, tag}`. The
//! tag is bumped on every successful push and pop, so a compare-exchange
//! can never succeed against a head that was popped and pushed back in the
//! meantime. Offsets rather than pointers are linked through the slab,
//! which makes the list meaningful in every mapping of the region; the
//! translation between a local element pointer and its owner-space address
//! is a fixed per-pool delta.

use std::sync::atomic::{AtomicU64, Ordering};

/// Offset value marking the end of the free list.
const NIL: u32 = u32::MAX;

/// Spins before [`SharedPool::alloc`] gives up on an empty pool.
const EMPTY_SPINS: u32 = 1 << 20;

/// Pool header, placed in the shared region by its creator.
#[repr(C)]
pub struct PoolHdr {
    /// `{offset: low 32, tag: high 32}` of the first free slot.
    head: AtomicU64,
}

fn pack(offset: u32, tag: u32) -> u64 {
    ((tag as u64) << 32) | offset as u64
}

fn unpack(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

/// One process' view of a pool: the header and slab live in a mapped
/// region, the owner-space slab base comes from the region's creator.
pub struct SharedPool {
    hdr: *const PoolHdr,
    slab_local: *mut u8,
    slab_owner: u64,
    elem_size: usize,
    count: u32,
}

unsafe impl Send for SharedPool {}
unsafe impl Sync for SharedPool {}

impl SharedPool {
    /// Build the creator's view and thread all slots onto the free list.
    ///
    /// # Safety
    /// `hdr` and `slab` must point into a live mapping with room for the
    /// header and `count * elem_size` bytes; `elem_size` must be at least 8
    /// and 8-aligned so the link word fits every free slot.
    pub unsafe fn init(
        hdr: *const PoolHdr,
        slab: *mut u8,
        slab_owner: u64,
        elem_size: usize,
        count: u32,
    ) -> SharedPool {
        debug_assert!(elem_size >= 8 && elem_size % 8 == 0);
        for i in 0..count {
            let link = slab.add(i as usize * elem_size).cast::<u32>();
            link.write(if i + 1 == count { NIL } else { i + 1 });
        }
        let pool = SharedPool { hdr, slab_local: slab, slab_owner, elem_size, count };
        (*hdr).head.store(pack(if count == 0 { NIL } else { 0 }, 0), Ordering::Release);
        pool
    }

    /// Build a non-creating view over an already initialized pool.
    ///
    /// # Safety
    /// Same layout requirements as [`SharedPool::init`], against a pool the
    /// creator has already initialized.
    pub unsafe fn attach(
        hdr: *const PoolHdr,
        slab: *mut u8,
        slab_owner: u64,
        elem_size: usize,
        count: u32,
    ) -> SharedPool {
        SharedPool { hdr, slab_local: slab, slab_owner, elem_size, count }
    }

    fn head(&self) -> &AtomicU64 {
        unsafe { &(*self.hdr).head }
    }

    fn offset_of_owner(&self, owner: u64) -> u32 {
        let off = owner.wrapping_sub(self.slab_owner);
        debug_assert!(off < self.count as u64 * self.elem_size as u64);
        debug_assert_eq!(off % self.elem_size as u64, 0);
        (off / self.elem_size as u64) as u32
    }

    /// Translate an owner-space element address to this mapping.
    pub fn local(&self, owner: u64) -> *mut u8 {
        unsafe {
            self.slab_local
                .add(self.offset_of_owner(owner) as usize * self.elem_size)
        }
    }

    /// Translate a local element pointer to its owner-space address.
    pub fn owner(&self, local: *const u8) -> u64 {
        let off = local as usize - self.slab_local as usize;
        debug_assert!(off < self.count as usize * self.elem_size);
        self.slab_owner + off as u64
    }

    fn link(&self, slot: u32) -> *mut u32 {
        unsafe { self.slab_local.add(slot as usize * self.elem_size).cast() }
    }

    /// Pop a free element, returning its owner-space address. `None` once
    /// the bounded spin on an empty pool is exhausted; there is no
    /// blocking allocation.
    pub fn alloc(&self) -> Option<u64> {
        let mut spins = EMPTY_SPINS;
        let mut cur = self.head().load(Ordering::Acquire);
        loop {
            let (offset, tag) = unpack(cur);
            if offset == NIL {
                spins -= 1;
                if spins == 0 {
                    return None;
                }
                std::hint::spin_loop();
                cur = self.head().load(Ordering::Acquire);
                continue;
            }
            // Reading the link of a slot another thread may pop
            // concurrently is fine: the slab stays mapped, and the tag
            // check below rejects the result if the head moved.
            let next = unsafe { self.link(offset).read() };
            match self.head().compare_exchange_weak(
                cur,
                pack(next, tag.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(self.slab_owner + offset as u64 * self.elem_size as u64),
                Err(seen) => cur = seen,
            }
        }
    }

    /// Push an element back by owner-space address.
    pub fn free(&self, owner: u64) {
        let slot = self.offset_of_owner(owner);
        let mut cur = self.head().load(Ordering::Acquire);
        loop {
            let (offset, tag) = unpack(cur);
            unsafe { self.link(slot).write(offset) };
            match self.head().compare_exchange_weak(
                cur,
                pack(slot, tag.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn slab_owner(&self) -> u64 {
        self.slab_owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};

    struct TestPool {
        _mem: Box<[u8]>,
        _hdr: Box<PoolHdr>,
        pool: SharedPool,
    }

    fn pool_of(count: u32, elem: usize) -> TestPool {
        let mut mem = vec![0u8; count as usize * elem].into_boxed_slice();
        let hdr = Box::new(PoolHdr { head: AtomicU64::new(0) });
        let pool = unsafe {
            SharedPool::init(&*hdr as *const PoolHdr, mem.as_mut_ptr(), 0x1000, elem, count)
        };
        TestPool { _mem: mem, _hdr: hdr, pool }
    }

    #[test]
    fn exhaustion_and_reuse() {
        let t = pool_of(3, 64);
        let a = t.pool.alloc().unwrap();
        let b = t.pool.alloc().unwrap();
        let c = t.pool.alloc().unwrap();
        assert_eq!(t.pool.alloc(), None);
        assert_eq!([a, b, c].map(|x| (x - 0x1000) / 64), [0, 1, 2]);
        t.pool.free(b);
        assert_eq!(t.pool.alloc(), Some(b));
    }

    #[test]
    fn owner_local_translation() {
        let t = pool_of(4, 32);
        let owner = t.pool.alloc().unwrap();
        let local = t.pool.local(owner);
        assert_eq!(t.pool.owner(local), owner);
    }

    #[test]
    fn concurrent_alloc_free_never_double_allocates() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 2000;
        let t = Arc::new(pool_of(THREADS as u32 / 2, 64));
        let barrier = Arc::new(Barrier::new(THREADS));
        let in_use: Arc<Vec<AtomicUsize>> =
            Arc::new((0..t.pool.count()).map(|_| AtomicUsize::new(0)).collect());
        let mut joins = Vec::new();
        for _ in 0..THREADS {
            let t = t.clone();
            let barrier = barrier.clone();
            let in_use = in_use.clone();
            joins.push(std::thread::spawn(move || {
                barrier.wait();
                for _ in 0..ROUNDS {
                    if let Some(owner) = t.pool.alloc() {
                        let slot = ((owner - 0x1000) / 64) as usize;
                        // no other thread may hold this slot right now
                        assert_eq!(in_use[slot].fetch_add(1, Ordering::SeqCst), 0);
                        std::hint::spin_loop();
                        assert_eq!(in_use[slot].fetch_sub(1, Ordering::SeqCst), 1);
                        t.pool.free(owner);
                    }
                }
            }));
        }
        for join in joins {
            join.join().unwrap();
        }
        // every buffer came back exactly once
        let mut seen = 0;
        while t.pool.alloc().is_some() {
            seen += 1;
        }
        assert_eq!(seen, t.pool.count());
    }
}
