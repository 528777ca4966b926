//! Option flags for interfaces, memory descriptors, list entries and
//! portal table indexes, plus the acknowledgement request modes.

use bitflags::bitflags;
use strum_macros::FromRepr;

bitflags! {
    /// Interface kind selection. Exactly one of `MATCHING`/`NO_MATCHING`
    /// and one of `LOGICAL`/`PHYSICAL` must be set.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct NiOptions: u32 {
        const MATCHING = 1;
        const NO_MATCHING = 1 << 1;
        const LOGICAL = 1 << 2;
        const PHYSICAL = 1 << 3;
    }
}

impl NiOptions {
    pub fn is_valid_kind(self) -> bool {
        self.contains(NiOptions::MATCHING) != self.contains(NiOptions::NO_MATCHING)
            && self.contains(NiOptions::LOGICAL) != self.contains(NiOptions::PHYSICAL)
    }
}

bitflags! {
    /// Memory descriptor options.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MdOptions: u32 {
        /// `start`/`length` describe an array of [`crate::IoVec`].
        const IOVEC = 1;
        /// Suppress full events on the attached EQ.
        const EVENT_DISABLE = 1 << 1;
        /// Suppress success events, keep failures.
        const EVENT_SUCCESS_DISABLE = 1 << 2;
        /// Count send completions on the attached CT.
        const EVENT_CT_SEND = 1 << 3;
        /// Count replies (get/fetch data arrival) on the attached CT.
        const EVENT_CT_REPLY = 1 << 4;
        /// Count acks on the attached CT.
        const EVENT_CT_ACK = 1 << 5;
    }
}

bitflags! {
    /// Options shared by list entries and match entries.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EntryOptions: u32 {
        /// Entry accepts put and atomic deposits.
        const OP_PUT = 1;
        /// Entry accepts get and fetch readbacks.
        const OP_GET = 1 << 1;
        /// Unlink after the first match.
        const USE_ONCE = 1 << 2;
        const IOVEC = 1 << 3;
        const EVENT_DISABLE = 1 << 4;
        const EVENT_SUCCESS_DISABLE = 1 << 5;
        /// Count arriving puts/atomics on the attached CT.
        const EVENT_CT_PUT = 1 << 6;
        /// Count serviced gets on the attached CT.
        const EVENT_CT_GET = 1 << 7;
    }
}

bitflags! {
    /// Portal table index options.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PtOptions: u32 {
        /// Deliver only to the overflow list when the priority list is
        /// empty instead of dropping.
        const FLOWCTRL = 1;
    }
}

/// Which list of a portal index an entry is appended to.
#[repr(u8)]
#[derive(FromRepr, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListKind {
    Priority = 0,
    Overflow = 1,
}

/// Acknowledgement requested by the initiator of a put/atomic.
#[repr(u8)]
#[derive(FromRepr, Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckReq {
    /// Full event on the initiator EQ plus CT counting.
    Ack = 0,
    /// No acknowledgement at all.
    NoAck = 1,
    /// Counting acknowledgement only.
    CtAck = 2,
    /// Operation-completed acknowledgement: CT counting, no event payload.
    OcAck = 3,
}
