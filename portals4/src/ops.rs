//! Operation plumbing shared by the client stub and the PPE: the message
//! header that travels between nodes, the argument validation tables the
//! stubs apply before a command is ever enqueued, the atomic arithmetic
//! applied at the target, and the match traversal over a portal index.

use std::sync::Arc;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use portals_types::wire::OPERAND_SIZE;
use portals_types::{
    AckReq, AtomicDatatype, AtomicOp, Handle, MatchBits, NiLimits, ProcessId, PtIndex,
    PtlError, Result, NID_ANY, PID_ANY, RANK_ANY,
};

use crate::me::MatchEntry;
use crate::ni::Ni;

#[repr(u8)]
#[derive(IntoPrimitive, TryFromPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgOp {
    Put = 0,
    Get = 1,
    Atomic = 2,
    FetchAtomic = 3,
    Swap = 4,
}

impl MsgOp {
    /// Whether data is deposited at the target (put side of the matrix).
    pub fn deposits(self) -> bool {
        !matches!(self, MsgOp::Get)
    }

    /// Whether the initiator gets payload back.
    pub fn fetches(self) -> bool {
        matches!(self, MsgOp::Get | MsgOp::FetchAtomic | MsgOp::Swap)
    }

    pub fn is_atomic(self) -> bool {
        matches!(self, MsgOp::Atomic | MsgOp::FetchAtomic | MsgOp::Swap)
    }
}

#[repr(u8)]
#[derive(IntoPrimitive, TryFromPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgKind {
    Request = 0,
    Reply = 1,
}

/// Failure reported in a reply, mirrored into the initiator's events.
#[repr(u8)]
#[derive(IntoPrimitive, TryFromPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgFail {
    Ok = 0,
    NoMatch = 1,
    PtDisabled = 2,
    Dropped = 3,
}

/// The protocol header. Host representation: it never leaves the node
/// boundary unserialized RDMA-side, and the shared-memory path is
/// same-ABI by construction. Only the scatter/gather payload that a peer
/// DMAs against is fixed-endian.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MsgHdr {
    pub kind: u8,
    pub op: u8,
    pub ack_req: u8,
    pub atomic_op: u8,
    pub atomic_dt: u8,
    pub data_fmt: u8,
    pub fail: u8,
    /// Target NI selection: bit 0 matching, bit 1 logical.
    pub ni_bits: u8,
    pub src: ProcessId,
    pub dst: ProcessId,
    pub pt_index: PtIndex,
    pub _pad: u32,
    pub match_bits: MatchBits,
    pub length: u64,
    pub remote_offset: u64,
    pub hdr_data: u64,
    pub operand: [u8; OPERAND_SIZE],
    /// Initiator-side transfer id, echoed by the reply.
    pub xfer_id: u64,
}

pub const MSG_HDR_SIZE: usize = std::mem::size_of::<MsgHdr>();

pub const NI_BIT_MATCHING: u8 = 1;
pub const NI_BIT_LOGICAL: u8 = 2;

pub fn msg_to_bytes(hdr: &MsgHdr, data: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(MSG_HDR_SIZE + data.len());
    bytes.extend_from_slice(unsafe {
        std::slice::from_raw_parts(hdr as *const MsgHdr as *const u8, MSG_HDR_SIZE)
    });
    bytes.extend_from_slice(data);
    bytes
}

pub fn msg_from_bytes(bytes: &[u8]) -> Result<(MsgHdr, &[u8])> {
    if bytes.len() < MSG_HDR_SIZE {
        return Err(PtlError::Fail);
    }
    let mut hdr = MsgHdr {
        kind: 0,
        op: 0,
        ack_req: 0,
        atomic_op: 0,
        atomic_dt: 0,
        data_fmt: 0,
        fail: 0,
        ni_bits: 0,
        src: ProcessId::default(),
        dst: ProcessId::default(),
        pt_index: 0,
        _pad: 0,
        match_bits: 0,
        length: 0,
        remote_offset: 0,
        hdr_data: 0,
        operand: [0; 16],
        xfer_id: 0,
    };
    unsafe {
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            &mut hdr as *mut MsgHdr as *mut u8,
            MSG_HDR_SIZE,
        );
    }
    Ok((hdr, &bytes[MSG_HDR_SIZE..]))
}

/// Target id must fit the NI's addressing mode.
pub fn validate_target(logical: bool, target: ProcessId) -> Result<()> {
    if logical {
        if target.rank == RANK_ANY {
            return Err(PtlError::InvalidArg);
        }
    } else if target.nid == NID_ANY || target.pid == PID_ANY {
        return Err(PtlError::InvalidArg);
    }
    Ok(())
}

pub fn validate_pt(limits: &NiLimits, pt_index: PtIndex) -> Result<()> {
    if pt_index > limits.max_pt_index {
        return Err(PtlError::InvalidArg);
    }
    Ok(())
}

/// The atomic-operation validation matrix. `via_swap` marks the `Swap`
/// entry point, the only one allowed to carry the swap family.
pub fn validate_atomic(
    limits: &NiLimits,
    length: u64,
    op: AtomicOp,
    dt: AtomicDatatype,
    via_swap: bool,
) -> Result<()> {
    if length > limits.max_atomic_size {
        return Err(PtlError::InvalidArg);
    }
    if length % dt.width() as u64 != 0 {
        return Err(PtlError::InvalidArg);
    }
    if op.is_swap_family() != via_swap {
        return Err(PtlError::InvalidArg);
    }
    if !op.allows(dt) {
        return Err(PtlError::InvalidArg);
    }
    if matches!(op, AtomicOp::Cswap | AtomicOp::Mswap) && length != dt.width() as u64 {
        return Err(PtlError::InvalidArg);
    }
    Ok(())
}

pub fn ack_req_from(raw: u32) -> Result<AckReq> {
    AckReq::from_repr(raw as u8).ok_or(PtlError::InvalidArg)
}

macro_rules! int_atomic {
    ($t:ty, $op:expr, $tgt:expr, $src:expr, $operand:expr) => {{
        let a = <$t>::from_ne_bytes($tgt.try_into().unwrap());
        let b = <$t>::from_ne_bytes($src.try_into().unwrap());
        let r: $t = match $op {
            AtomicOp::Min => a.min(b),
            AtomicOp::Max => a.max(b),
            AtomicOp::Sum => a.wrapping_add(b),
            AtomicOp::Prod => a.wrapping_mul(b),
            AtomicOp::Lor => ((a != 0) || (b != 0)) as $t,
            AtomicOp::Land => ((a != 0) && (b != 0)) as $t,
            AtomicOp::Lxor => ((a != 0) ^ (b != 0)) as $t,
            AtomicOp::Bor => a | b,
            AtomicOp::Band => a & b,
            AtomicOp::Bxor => a ^ b,
            AtomicOp::Swap => b,
            AtomicOp::Cswap => {
                let c = <$t>::from_ne_bytes(
                    $operand[..std::mem::size_of::<$t>()].try_into().unwrap(),
                );
                if a == c {
                    b
                } else {
                    a
                }
            }
            AtomicOp::Mswap => {
                let m = <$t>::from_ne_bytes(
                    $operand[..std::mem::size_of::<$t>()].try_into().unwrap(),
                );
                (a & !m) | (b & m)
            }
        };
        $tgt.copy_from_slice(&r.to_ne_bytes());
    }};
}

macro_rules! float_atomic {
    ($t:ty, $op:expr, $tgt:expr, $src:expr) => {{
        let a = <$t>::from_ne_bytes($tgt.try_into().unwrap());
        let b = <$t>::from_ne_bytes($src.try_into().unwrap());
        let r: $t = match $op {
            AtomicOp::Min => a.min(b),
            AtomicOp::Max => a.max(b),
            AtomicOp::Sum => a + b,
            AtomicOp::Prod => a * b,
            AtomicOp::Swap => b,
            // the validation tables reject the rest for floats
            _ => return Err(PtlError::InvalidArg),
        };
        $tgt.copy_from_slice(&r.to_ne_bytes());
    }};
}

/// Apply `op` element-wise: `tgt = op(tgt, src)`. The caller captured the
/// old target bytes beforehand if the operation fetches.
pub fn apply_atomic(
    op: AtomicOp,
    dt: AtomicDatatype,
    tgt: &mut [u8],
    src: &[u8],
    operand: &[u8],
) -> Result<()> {
    let width = dt.width();
    if tgt.len() != src.len() || tgt.len() % width != 0 {
        return Err(PtlError::InvalidArg);
    }
    for (tgt, src) in tgt.chunks_exact_mut(width).zip(src.chunks_exact(width)) {
        match dt {
            AtomicDatatype::I8 => int_atomic!(i8, op, tgt, src, operand),
            AtomicDatatype::U8 => int_atomic!(u8, op, tgt, src, operand),
            AtomicDatatype::I16 => int_atomic!(i16, op, tgt, src, operand),
            AtomicDatatype::U16 => int_atomic!(u16, op, tgt, src, operand),
            AtomicDatatype::I32 => int_atomic!(i32, op, tgt, src, operand),
            AtomicDatatype::U32 => int_atomic!(u32, op, tgt, src, operand),
            AtomicDatatype::I64 => int_atomic!(i64, op, tgt, src, operand),
            AtomicDatatype::U64 => int_atomic!(u64, op, tgt, src, operand),
            AtomicDatatype::Float => float_atomic!(f32, op, tgt, src),
            AtomicDatatype::Double => float_atomic!(f64, op, tgt, src),
        }
    }
    Ok(())
}

/// Walk a portal index: priority list first, then overflow, first entry
/// that accepts wins. A winning `USE_ONCE` entry is unlinked here.
pub fn find_match(
    ni: &Ni,
    pt_index: PtIndex,
    bits: MatchBits,
    initiator: ProcessId,
    wants_put: bool,
) -> std::result::Result<(Arc<MatchEntry>, Handle, Handle), MsgFail> {
    let (candidates, pt_eq) = ni.pt.candidates(pt_index).ok_or(MsgFail::PtDisabled)?;
    for handle in candidates {
        let entry = if ni.is_matching() {
            ni.mes.get(handle)
        } else {
            ni.les.get(handle)
        };
        let Ok(entry) = entry else { continue };
        if !entry.accepts(bits, initiator, wants_put) {
            continue;
        }
        if entry.consume() {
            let _ = ni.pt.unlink(pt_index, handle);
            let _ = if ni.is_matching() {
                ni.mes.free(handle).map(|_| ())
            } else {
                ni.les.free(handle).map(|_| ())
            };
        }
        return Ok((entry, handle, pt_eq));
    }
    Err(MsgFail::NoMatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_with_payload() {
        let hdr = MsgHdr {
            kind: MsgKind::Request.into(),
            op: MsgOp::Put.into(),
            ack_req: 0,
            atomic_op: 0,
            atomic_dt: 0,
            data_fmt: 1,
            fail: 0,
            ni_bits: NI_BIT_LOGICAL,
            src: ProcessId::logical(3),
            dst: ProcessId::logical(4),
            pt_index: 5,
            _pad: 0,
            match_bits: 0xfeed,
            length: 6,
            remote_offset: 7,
            hdr_data: 8,
            operand: [0; 16],
            xfer_id: 9,
        };
        let bytes = msg_to_bytes(&hdr, b"abcdef");
        let (parsed, data) = msg_from_bytes(&bytes).unwrap();
        assert_eq!(parsed.match_bits, 0xfeed);
        assert_eq!(parsed.src.rank, 3);
        assert_eq!(parsed.xfer_id, 9);
        assert_eq!(data, b"abcdef");
        assert!(msg_from_bytes(&bytes[..4]).is_err());
    }

    #[test]
    fn target_form_follows_ni_mode() {
        assert!(validate_target(true, ProcessId::logical(0)).is_ok());
        assert!(validate_target(true, ProcessId::physical(1, 2)).is_err());
        assert!(validate_target(false, ProcessId::physical(1, 2)).is_ok());
        assert!(validate_target(false, ProcessId::logical(0)).is_err());
    }

    #[test]
    fn swap_family_only_through_swap_entry() {
        let limits = NiLimits::default();
        // CSWAP of a float is rejected even through the swap entry
        assert_eq!(
            validate_atomic(&limits, 4, AtomicOp::Cswap, AtomicDatatype::Float, true),
            Err(PtlError::InvalidArg)
        );
        assert!(
            validate_atomic(&limits, 8, AtomicOp::Cswap, AtomicDatatype::U64, true).is_ok()
        );
        // swap ops through the Atomic/FetchAtomic entries are invalid
        assert_eq!(
            validate_atomic(&limits, 8, AtomicOp::Swap, AtomicDatatype::U64, false),
            Err(PtlError::InvalidArg)
        );
        // and plain ops through the Swap entry are too
        assert_eq!(
            validate_atomic(&limits, 8, AtomicOp::Sum, AtomicDatatype::U64, true),
            Err(PtlError::InvalidArg)
        );
        // length discipline
        assert_eq!(
            validate_atomic(&limits, 12, AtomicOp::Sum, AtomicDatatype::U64, false),
            Err(PtlError::InvalidArg)
        );
        assert_eq!(
            validate_atomic(&limits, 16, AtomicOp::Cswap, AtomicDatatype::U64, true),
            Err(PtlError::InvalidArg)
        );
        // logical ops on floats are rejected
        assert_eq!(
            validate_atomic(&limits, 8, AtomicOp::Band, AtomicDatatype::Double, false),
            Err(PtlError::InvalidArg)
        );
    }

    #[test]
    fn atomic_arithmetic() {
        let mut tgt = 10u64.to_ne_bytes().to_vec();
        apply_atomic(
            AtomicOp::Sum,
            AtomicDatatype::U64,
            &mut tgt,
            &5u64.to_ne_bytes(),
            &[0; 16],
        )
        .unwrap();
        assert_eq!(u64::from_ne_bytes(tgt.clone().try_into().unwrap()), 15);

        // cswap only replaces on compare success
        let mut operand = [0u8; 16];
        operand[..8].copy_from_slice(&15u64.to_ne_bytes());
        apply_atomic(
            AtomicOp::Cswap,
            AtomicDatatype::U64,
            &mut tgt,
            &99u64.to_ne_bytes(),
            &operand,
        )
        .unwrap();
        assert_eq!(u64::from_ne_bytes(tgt.clone().try_into().unwrap()), 99);
        apply_atomic(
            AtomicOp::Cswap,
            AtomicDatatype::U64,
            &mut tgt,
            &1u64.to_ne_bytes(),
            &operand,
        )
        .unwrap();
        assert_eq!(u64::from_ne_bytes(tgt.try_into().unwrap()), 99);

        // element-wise float sum
        let mut ftgt = [1.5f64.to_ne_bytes(), 2.5f64.to_ne_bytes()].concat();
        let fsrc = [0.5f64.to_ne_bytes(), 0.25f64.to_ne_bytes()].concat();
        apply_atomic(AtomicOp::Sum, AtomicDatatype::Double, &mut ftgt, &fsrc, &[0; 16])
            .unwrap();
        assert_eq!(f64::from_ne_bytes(ftgt[..8].try_into().unwrap()), 2.0);
        assert_eq!(f64::from_ne_bytes(ftgt[8..].try_into().unwrap()), 2.75);

        // min/max on signed values
        let mut stgt = (-5i32).to_ne_bytes().to_vec();
        apply_atomic(
            AtomicOp::Max,
            AtomicDatatype::I32,
            &mut stgt,
            &3i32.to_ne_bytes(),
            &[0; 16],
        )
        .unwrap();
        assert_eq!(i32::from_ne_bytes(stgt.try_into().unwrap()), 3);
    }
}
