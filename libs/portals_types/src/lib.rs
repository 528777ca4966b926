//! Type definitions shared by the portals messaging substrate: process
//! identifiers, object handles, interface limits, option flags, events and
//! the on-wire scatter/gather structures.
//!
//! This crate carries no behavior beyond validation and packing helpers, so
//! that the client stub, the PPE and the transports all agree on one
//! vocabulary without depending on each other.

mod atomic;
mod error;
mod event;
mod handle;
mod options;
pub mod wire;

pub use atomic::{AtomicDatatype, AtomicOp};
pub use error::{PtlError, Result, RetCode};
pub use event::{CtEvent, Event, EventKind, NiFail};
pub use handle::{Handle, ObjType};
pub use options::{AckReq, EntryOptions, ListKind, MdOptions, NiOptions, PtOptions};

/// Node identifier. In this substrate a NID names a host; all ranks of a
/// node share it.
pub type Nid = u32;
/// Process identifier within a node.
pub type Pid = u32;
/// Rank within a logical interface's map.
pub type Rank = u32;
/// Portal table index.
pub type PtIndex = u32;
/// Match bits carried by matching operations and entries.
pub type MatchBits = u64;

pub const NID_ANY: Nid = u32::MAX;
pub const PID_ANY: Pid = u32::MAX;
pub const RANK_ANY: Rank = u32::MAX;
pub const PT_ANY: PtIndex = u32::MAX;
/// Timeout value meaning "block indefinitely" for the CT/EQ poll calls.
pub const TIME_FOREVER: u64 = u64::MAX;

/// A process identity. Physical addressing names a `(nid, pid)` pair,
/// logical addressing names a rank; the unused half holds the `ANY`
/// markers so the struct stays plain data across the command queue.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessId {
    pub nid: Nid,
    pub pid: Pid,
    pub rank: Rank,
}

impl ProcessId {
    pub const fn physical(nid: Nid, pid: Pid) -> Self {
        Self { nid, pid, rank: RANK_ANY }
    }

    pub const fn logical(rank: Rank) -> Self {
        Self { nid: NID_ANY, pid: PID_ANY, rank }
    }

    pub const fn is_logical(&self) -> bool {
        self.rank != RANK_ANY
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self { nid: NID_ANY, pid: PID_ANY, rank: RANK_ANY }
    }
}

/// Effective resource limits of a network interface. `NIInit` clamps the
/// desired values against the built-in maxima and reports the result.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NiLimits {
    /// Maximum number of match/list entries across all portal indexes.
    pub max_entries: u32,
    pub max_mds: u32,
    pub max_cts: u32,
    pub max_eqs: u32,
    /// Highest allocatable portal table index.
    pub max_pt_index: u32,
    /// Maximum number of elements in an I/O vector.
    pub max_iovecs: u32,
    pub max_triggered_ops: u32,
    pub max_msg_size: u64,
    /// Upper bound on the length of a single atomic operation.
    pub max_atomic_size: u64,
}

impl Default for NiLimits {
    fn default() -> Self {
        Self {
            max_entries: 4096,
            max_mds: 4096,
            max_cts: 1024,
            max_eqs: 64,
            max_pt_index: 63,
            max_iovecs: 256,
            max_triggered_ops: 1024,
            max_msg_size: 1 << 30,
            max_atomic_size: 512,
        }
    }
}

impl NiLimits {
    /// Clamp a desired set of limits against `self` (the interface maxima).
    pub fn clamp(&self, desired: &NiLimits) -> NiLimits {
        NiLimits {
            max_entries: desired.max_entries.min(self.max_entries),
            max_mds: desired.max_mds.min(self.max_mds),
            max_cts: desired.max_cts.min(self.max_cts),
            max_eqs: desired.max_eqs.min(self.max_eqs),
            max_pt_index: desired.max_pt_index.min(self.max_pt_index),
            max_iovecs: desired.max_iovecs.min(self.max_iovecs),
            max_triggered_ops: desired.max_triggered_ops.min(self.max_triggered_ops),
            max_msg_size: desired.max_msg_size.min(self.max_msg_size),
            max_atomic_size: desired.max_atomic_size.min(self.max_atomic_size),
        }
    }
}

/// An element of a user I/O vector: a base address and length in the
/// owning process' address space.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct IoVec {
    pub base: u64,
    pub len: u64,
}
