//! Counting events. The `{success, failure}` pair lives on memory shared
//! with the client, written only by the PPE and read lock-free by anyone.
//! Each CT also carries the queue of triggered operations waiting for it
//! to reach their thresholds.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use portals_types::{CtEvent, PtlError, Result, TIME_FOREVER};
use spin::Mutex;

use crate::command::{OpCode, XferCmd};
use crate::params::params;
use crate::segment::{SegmentHandle, SegmentMapper};

/// The shared page contents. `success` and `failure` only ever grow;
/// release stores pair with the acquire loads in the pollers.
#[repr(C)]
pub struct CtInfo {
    success: AtomicU64,
    failure: AtomicU64,
}

impl CtInfo {
    pub fn read(&self) -> CtEvent {
        CtEvent {
            success: self.success.load(Ordering::Acquire),
            failure: self.failure.load(Ordering::Acquire),
        }
    }
}

/// An operation deferred until the CT reaches a threshold.
pub enum TriggeredAction {
    /// Re-dispatch a data movement command on behalf of `cookie`.
    Xfer { op: OpCode, cookie: u64, xfer: XferCmd },
    /// `TriggeredCTInc`.
    CtInc { cookie: u64, ct_raw: u64, increment: CtEvent },
    /// `TriggeredCTSet`.
    CtSet { cookie: u64, ct_raw: u64, value: CtEvent },
}

struct Trigger {
    threshold: u64,
    seq: u64,
    action: TriggeredAction,
}

impl PartialEq for Trigger {
    fn eq(&self, other: &Self) -> bool {
        self.threshold == other.threshold && self.seq == other.seq
    }
}
impl Eq for Trigger {}
impl PartialOrd for Trigger {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Trigger {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.threshold, self.seq).cmp(&(other.threshold, other.seq))
    }
}

/// PPE-side counting event object.
pub struct Ct {
    info: Box<CtInfo>,
    pub mapping: SegmentHandle,
    triggered: Mutex<TriggerQueue>,
}

struct TriggerQueue {
    heap: BinaryHeap<Reverse<Trigger>>,
    next_seq: u64,
}

impl Ct {
    pub fn new(mapper: &dyn SegmentMapper) -> Result<Ct> {
        let info = Box::new(CtInfo {
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
        });
        let mapping =
            mapper.export(&*info as *const CtInfo as *const u8, std::mem::size_of::<CtInfo>())?;
        Ok(Ct {
            info,
            mapping,
            triggered: Mutex::new(TriggerQueue { heap: BinaryHeap::new(), next_seq: 0 }),
        })
    }

    pub fn read(&self) -> CtEvent {
        self.info.read()
    }

    fn fired(&self) -> Vec<TriggeredAction> {
        let reached = {
            let now = self.info.read();
            now.success + now.failure
        };
        let mut queue = self.triggered.lock();
        let mut out = Vec::new();
        // an increment may cross several thresholds at once
        while queue
            .heap
            .peek()
            .is_some_and(|Reverse(t)| t.threshold <= reached)
        {
            out.push(queue.heap.pop().unwrap().0.action);
        }
        out
    }

    /// Add to the counters and collect every trigger the new value crossed.
    pub fn add(&self, inc: CtEvent) -> Vec<TriggeredAction> {
        if inc.success > 0 {
            self.info.success.fetch_add(inc.success, Ordering::Release);
        }
        if inc.failure > 0 {
            self.info.failure.fetch_add(inc.failure, Ordering::Release);
        }
        self.fired()
    }

    /// Replace the counters (may move them backwards) and re-check the
    /// trigger queue against the new value.
    pub fn set(&self, value: CtEvent) -> Vec<TriggeredAction> {
        self.info.success.store(value.success, Ordering::Release);
        self.info.failure.store(value.failure, Ordering::Release);
        self.fired()
    }

    /// Queue an action for `threshold`, or hand it straight back when the
    /// CT is already there. A trigger fires at most once.
    pub fn add_trigger(
        &self,
        threshold: u64,
        action: TriggeredAction,
        max_triggered: u32,
    ) -> Result<Option<TriggeredAction>> {
        let now = self.info.read();
        if now.success + now.failure >= threshold {
            return Ok(Some(action));
        }
        let mut queue = self.triggered.lock();
        if queue.heap.len() as u32 >= max_triggered {
            return Err(PtlError::NoSpace);
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(Reverse(Trigger { threshold, seq, action }));
        Ok(None)
    }

    /// Drop every queued trigger without executing it.
    pub fn cancel_triggered(&self) {
        self.triggered.lock().heap.clear();
    }

    pub fn unmap(&self, mapper: &dyn SegmentMapper) {
        mapper.release(self.mapping);
    }
}

/// Client-side wait: returns once `success + failure >= test`.
///
/// # Safety
/// `info` must point at a live imported CT page.
pub unsafe fn ct_wait(info: *const CtInfo, test: u64) -> CtEvent {
    let mut spins = 0u64;
    loop {
        let now = (*info).read();
        if now.success + now.failure >= test {
            return now;
        }
        spins += 1;
        if spins % (1 << 14) == 0 {
            std::thread::sleep(Duration::from_micros(params().poll_interval_us));
        } else {
            std::hint::spin_loop();
        }
    }
}

/// Client-side poll over several CTs with a microsecond timeout
/// (`TIME_FOREVER` blocks). Returns the satisfied index and value.
///
/// # Safety
/// Every pointer must reference a live imported CT page.
pub unsafe fn ct_poll(
    infos: &[*const CtInfo],
    tests: &[u64],
    timeout_us: u64,
) -> Result<(CtEvent, usize)> {
    if infos.is_empty() || infos.len() != tests.len() {
        return Err(PtlError::InvalidArg);
    }
    let deadline = if timeout_us == TIME_FOREVER {
        None
    } else {
        Some(Instant::now() + Duration::from_micros(timeout_us))
    };
    let mut spins = 0u64;
    loop {
        for (which, (info, test)) in infos.iter().zip(tests).enumerate() {
            let now = (**info).read();
            if now.success + now.failure >= *test {
                return Ok((now, which));
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
