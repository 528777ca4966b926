//! Event queues: a ring of event records shared between the PPE (producer)
//! and the client (consumer). Each slot carries a filled flag so the
//! cursors never need to be compared across processes; a full ring drops
//! the newest event and the loss is reported to the consumer on its next
//! read, the way `PTL_EQ_DROPPED` behaves.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use portals_types::{Event, PtlError, Result, TIME_FOREVER};

use crate::params::params;
use crate::segment::{SegmentHandle, SegmentMapper};

#[repr(C)]
struct RingHdr {
    count: u32,
    _pad: u32,
    producer: AtomicU64,
    consumer: AtomicU64,
    dropped: AtomicU32,
    _pad2: u32,
}

#[repr(C)]
struct RingSlot {
    filled: AtomicU32,
    _pad: u32,
    event: Event,
}

fn ring_bytes(count: u32) -> usize {
    std::mem::size_of::<RingHdr>() + count as usize * std::mem::size_of::<RingSlot>()
}

/// One side's view of a ring, PPE or client.
#[derive(Clone, Copy)]
pub struct EqRing {
    base: *mut u8,
}

unsafe impl Send for EqRing {}
unsafe impl Sync for EqRing {}

impl EqRing {
    /// # Safety
    /// `base` must point at `ring_bytes(count)` bytes initialized by
    /// [`Eq::new`] (or about to be, on the creating side).
    pub unsafe fn from_base(base: *mut u8) -> EqRing {
        EqRing { base }
    }

    fn hdr(&self) -> &RingHdr {
        unsafe { &*self.base.cast() }
    }

    fn slot(&self, index: u64) -> *mut RingSlot {
        let count = self.hdr().count as u64;
        unsafe {
            self.base
                .add(std::mem::size_of::<RingHdr>())
                .cast::<RingSlot>()
                .add((index % count) as usize)
        }
    }

    /// Producer side. Returns whether the event was stored; a full ring
    /// records the drop instead.
    pub fn push(&self, event: Event) -> bool {
        let hdr = self.hdr();
        let at = hdr.producer.load(Ordering::Relaxed);
        let slot = self.slot(at);
        if unsafe { (*slot).filled.load(Ordering::Acquire) } != 0 {
            hdr.dropped.fetch_add(1, Ordering::Release);
            return false;
        }
        unsafe {
            std::ptr::addr_of_mut!((*slot).event).write(event);
            (*slot).filled.store(1, Ordering::Release);
        }
        hdr.producer.store(at + 1, Ordering::Relaxed);
        true
    }

    /// Consumer side. `Ok(Some(..))` carries the event plus whether any
    /// events were lost since the last read.
    pub fn pop(&self) -> Option<(Event, bool)> {
        let hdr = self.hdr();
        let at = hdr.consumer.load(Ordering::Relaxed);
        let slot = self.slot(at);
        if unsafe { (*slot).filled.load(Ordering::Acquire) } == 0 {
            return None;
        }
        let event = unsafe { std::ptr::addr_of!((*slot).event).read() };
        unsafe { (*slot).filled.store(0, Ordering::Release) };
        hdr.consumer.store(at + 1, Ordering::Relaxed);
        let dropped = hdr.dropped.swap(0, Ordering::AcqRel) != 0;
        Some((event, dropped))
    }

    /// Consumer-side blocking read.
    pub fn wait(&self) -> (Event, bool) {
        let mut spins = 0u64;
        loop {
            if let Some(got) = self.pop() {
                return got;
            }
            spins += 1;
            if spins % (1 << 14) == 0 {
                std::thread::sleep(Duration::from_micros(params().poll_interval_us));
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Poll several rings with a microsecond timeout.
    pub fn poll(rings: &[EqRing], timeout_us: u64) -> Result<(Event, bool, usize)> {
        if rings.is_empty() {
            return Err(PtlError::InvalidArg);
        }
        let deadline = if timeout_us == TIME_FOREVER {
            None
        } else {
            Some(Instant::now() + Duration::from_micros(timeout_us))
        };
        let mut spins = 0u64;
        loop {
            for (which, ring) in rings.iter().enumerate() {
                if let Some((event, dropped)) = ring.pop() {
                    return Ok((event, dropped, which));
                }
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(PtlError::Interrupted);
                }
            }
            spins += 1;
            if spins % (1 << 12) == 0 {
                std::thread::sleep(Duration::from_micros(params().poll_interval_us));
            } else {
                std::hint::spin_loop();
            }
        }
    }
}

/// PPE-side event queue object: owns the ring memory and its export.
pub struct Eq {
    /// Backing store of the shared ring; only reached through `ring`.
    _mem: Box<[u8]>,
    pub mapping: SegmentHandle,
    ring: EqRing,
}

impl Eq {
    pub fn new(mapper: &dyn SegmentMapper, count: u64) -> Result<Eq> {
        if count == 0 || count > u32::MAX as u64 {
            return Err(PtlError::InvalidArg);
        }
        let bytes = ring_bytes(count as u32);
        let mut mem = vec![0u8; bytes].into_boxed_slice();
        let ring = unsafe { EqRing::from_base(mem.as_mut_ptr()) };
        unsafe {
            let hdr = mem.as_mut_ptr().cast::<RingHdr>();
            std::ptr::addr_of_mut!((*hdr).count).write(count as u32);
        }
        let mapping = mapper.export(mem.as_ptr(), bytes)?;
        Ok(Eq { _mem: mem, mapping, ring })
    }

    pub fn push(&self, event: Event) -> bool {
        self.ring.push(event)
    }

    pub fn ring(&self) -> EqRing {
        self.ring
    }

    pub fn unmap(&self, mapper: &dyn SegmentMapper) {
        mapper.release(self.mapping);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::LocalMapper;
    use portals_types::EventKind;

    #[test]
    fn push_pop_keeps_order() {
        let mapper = LocalMapper::new(4);
        let eq = Eq::new(&mapper, 4).unwrap();
        for i in 0..3u64 {
            let mut event = Event::new(EventKind::Put);
            event.hdr_data = i;
            assert!(eq.push(event));
        }
        let ring = eq.ring();
        for i in 0..3u64 {
            let (event, dropped) = ring.pop().unwrap();
            assert_eq!(event.hdr_data, i);
            assert!(!dropped);
        }
        assert!(ring.pop().is_none());
    }

    #[test]
    fn overflow_reports_dropped_once() {
        let mapper = LocalMapper::new(4);
        let eq = Eq::new(&mapper, 2).unwrap();
        assert!(eq.push(Event::new(EventKind::Put)));
        assert!(eq.push(Event::new(EventKind::Put)));
        assert!(!eq.push(Event::new(EventKind::Put)), "ring is full");
        let ring = eq.ring();
        let (_, dropped) = ring.pop().unwrap();
        assert!(dropped, "loss is reported on the next read");
        let (_, dropped) = ring.pop().unwrap();
        assert!(!dropped);
    }

    #[test]
    fn poll_times_out() {
        let mapper = LocalMapper::new(4);
        let eq = Eq::new(&mapper, 2).unwrap();
        let err = EqRing::poll(&[eq.ring()], 500);
        assert!(matches!(err, Err(PtlError::Interrupted)));
        eq.push(Event::new(EventKind::Ack));
        let (event, _, which) = EqRing::poll(&[eq.ring()], TIME_FOREVER).unwrap();
        assert_eq!(which, 0);
        assert_eq!(event.kind, EventKind::Ack);
    }
}
