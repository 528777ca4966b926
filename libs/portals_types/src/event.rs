//! Event records delivered through event queues and the counting-event
//! pair shared between client and PPE.

use strum_macros::FromRepr;

use crate::{MatchBits, ProcessId, PtIndex};

/// What happened. Initiator-side kinds are `Send`, `Ack` and `Reply`; the
/// rest are reported at the target.
#[repr(u8)]
#[derive(FromRepr, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Get = 0,
    Put = 1,
    Atomic = 2,
    FetchAtomic = 3,
    Reply = 4,
    Send = 5,
    Ack = 6,
    PtDisabled = 7,
    AutoUnlink = 8,
}

/// Delivery status recorded in an event.
#[repr(u8)]
#[derive(FromRepr, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NiFail {
    #[default]
    Ok = 0,
    Undeliverable = 1,
    Dropped = 2,
    PtDisabled = 3,
}

/// One event queue record.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub kind: EventKind,
    pub fail: NiFail,
    pub initiator: ProcessId,
    pub pt_index: PtIndex,
    pub match_bits: MatchBits,
    /// Length requested by the initiator.
    pub rlength: u64,
    /// Length actually manipulated at the target.
    pub mlength: u64,
    pub remote_offset: u64,
    /// Target-side start address of the manipulated region, in the address
    /// space of the process that posted the entry.
    pub start: u64,
    pub user_ptr: u64,
    pub hdr_data: u64,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            fail: NiFail::Ok,
            initiator: ProcessId::default(),
            pt_index: 0,
            match_bits: 0,
            rlength: 0,
            mlength: 0,
            remote_offset: 0,
            start: 0,
            user_ptr: 0,
            hdr_data: 0,
        }
    }
}

/// The counting-event pair. Lives on a page shared between PPE (single
/// writer) and clients (readers); both fields only ever grow.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CtEvent {
    pub success: u64,
    pub failure: u64,
}
