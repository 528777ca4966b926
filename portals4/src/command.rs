//! Command entries exchanged between a client stub and the PPE. One entry
//! per user call, allocated from the shared buffer pool, carrying a fixed
//! payload area viewed as the per-operation parameter struct. The
//! `completed` word is written last, release-fenced, and is the only field
//! both sides touch concurrently.

use std::sync::atomic::{AtomicU32, Ordering};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use portals_types::wire::OPERAND_SIZE;
use portals_types::{NiLimits, ProcessId};

use crate::queue::BufLink;
use crate::segment::SegmentHandle;

#[repr(u32)]
#[derive(IntoPrimitive, TryFromPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    Init = 1,
    Fini,
    NiInit,
    NiFini,
    NiStatus,
    NiHandle,
    SetMap,
    GetMap,
    PtAlloc,
    PtFree,
    PtEnable,
    PtDisable,
    GetUid,
    GetId,
    GetPhysId,
    MdBind,
    MdRelease,
    LeAppend,
    LeUnlink,
    MeAppend,
    MeUnlink,
    CtAlloc,
    CtFree,
    CtCancelTriggered,
    CtSet,
    CtInc,
    EqAlloc,
    EqFree,
    Put,
    Get,
    Atomic,
    FetchAtomic,
    Swap,
    AtomicSync,
    TriggeredPut,
    TriggeredGet,
    TriggeredAtomic,
    TriggeredFetchAtomic,
    TriggeredSwap,
    TriggeredCtInc,
    TriggeredCtSet,
}

pub const CMD_PAYLOAD_SIZE: usize = 384;
pub const CMD_BUF_SIZE: usize = std::mem::size_of::<CmdBuf>();

/// A command buffer in the shared slab. Ownership alternates between the
/// allocating client and the PPE through the command queue; plain fields
/// are only ever accessed by the current owner. The completion word sits
/// at the very end of the entry.
#[repr(C)]
pub struct CmdBuf {
    pub link: BufLink,
    pub cookie: u64,
    pub op: u32,
    pub ret: u32,
    payload: Payload,
    completed: AtomicU32,
    _pad: u32,
}

#[repr(C, align(8))]
struct Payload([u8; CMD_PAYLOAD_SIZE]);

impl CmdBuf {
    /// Prepare a freshly allocated entry for a new command.
    ///
    /// # Safety
    /// `buf` must point at an entry the caller owns.
    pub unsafe fn arm(buf: *mut CmdBuf, op: OpCode, cookie: u64) {
        (*buf).link.init();
        std::ptr::addr_of_mut!((*buf).cookie).write(cookie);
        std::ptr::addr_of_mut!((*buf).op).write(op.into());
        std::ptr::addr_of_mut!((*buf).ret).write(0);
        (*buf).completed.store(0, Ordering::Relaxed);
    }

    /// View the payload as the parameter struct for the current op.
    ///
    /// # Safety
    /// `buf` must point at an entry the caller owns and `T` must match the
    /// op code stored in it.
    pub unsafe fn payload<'a, T: Copy>(buf: *mut CmdBuf) -> &'a mut T {
        debug_assert!(std::mem::size_of::<T>() <= CMD_PAYLOAD_SIZE);
        debug_assert!(std::mem::align_of::<T>() <= 8);
        &mut *std::ptr::addr_of_mut!((*buf).payload).cast::<T>()
    }

    /// PPE side: publish the reply. The release store on `completed` is
    /// what makes the reply fields visible to the spinning client.
    ///
    /// # Safety
    /// `buf` must be the entry just executed; the PPE gives up access.
    pub unsafe fn complete(buf: *mut CmdBuf, ret: u32) {
        std::ptr::addr_of_mut!((*buf).ret).write(ret);
        (*buf).completed.store(1, Ordering::Release);
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire) == 1
    }
}

// Per-operation parameter blocks. Reply fields are written by the PPE
// before `completed` flips.

#[repr(C)]
#[derive(Clone, Copy)]
pub struct NiInitCmd {
    pub options: u32,
    pub pid: u32,
    pub with_desired: u32,
    pub _pad: u32,
    pub desired: NiLimits,
    // reply
    pub actual: NiLimits,
    pub ni_handle: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct HandleCmd {
    pub handle: u64,
    /// `NiStatus` register index.
    pub aux: u64,
    // reply
    pub reply: u64,
    pub reply_id: ProcessId,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct MapCmd {
    pub ni_handle: u64,
    pub map_size: u64,
    pub mapping: SegmentHandle,
    // reply
    pub actual_map_size: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PtCmd {
    pub ni_handle: u64,
    pub eq_handle: u64,
    pub options: u32,
    pub pt_index_req: u32,
    // reply
    pub pt_index: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct MdBindCmd {
    pub ni_handle: u64,
    pub start: u64,
    pub length: u64,
    pub options: u32,
    pub _pad: u32,
    pub eq_handle: u64,
    pub ct_handle: u64,
    pub mapping: SegmentHandle,
    // reply
    pub md_handle: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct AppendCmd {
    pub ni_handle: u64,
    pub start: u64,
    pub length: u64,
    pub ct_handle: u64,
    pub match_bits: u64,
    pub ignore_bits: u64,
    pub user_ptr: u64,
    pub mapping: SegmentHandle,
    pub pt_index: u32,
    pub options: u32,
    pub list: u32,
    pub _pad: u32,
    // reply
    pub entry_handle: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CtCmd {
    pub handle: u64,
    pub success: u64,
    pub failure: u64,
    // reply
    pub ct_mapping: SegmentHandle,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct EqCmd {
    pub ni_handle: u64,
    pub count: u64,
    pub handle: u64,
    // reply
    pub ring_mapping: SegmentHandle,
}

/// Shared by every data movement operation, plain and triggered.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct XferCmd {
    pub md_handle: u64,
    /// Put-side MD of `FetchAtomic`/`Swap`.
    pub put_md_handle: u64,
    pub local_offset: u64,
    pub local_put_offset: u64,
    pub length: u64,
    pub remote_offset: u64,
    pub match_bits: u64,
    pub user_ptr: u64,
    pub hdr_data: u64,
    pub target: ProcessId,
    pub pt_index: u32,
    pub ack_req: u32,
    pub atomic_op: u32,
    pub atomic_dt: u32,
    pub operand: [u8; OPERAND_SIZE],
    pub trig_ct_handle: u64,
    pub threshold: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_fit_the_entry() {
        assert!(std::mem::size_of::<NiInitCmd>() <= CMD_PAYLOAD_SIZE);
        assert!(std::mem::size_of::<MdBindCmd>() <= CMD_PAYLOAD_SIZE);
        assert!(std::mem::size_of::<AppendCmd>() <= CMD_PAYLOAD_SIZE);
        assert!(std::mem::size_of::<XferCmd>() <= CMD_PAYLOAD_SIZE);
        assert_eq!(CMD_BUF_SIZE % 8, 0);
    }

    #[test]
    fn completion_publishes_reply() {
        let mut buf: Box<CmdBuf> = unsafe { Box::new(std::mem::zeroed()) };
        let ptr: *mut CmdBuf = &mut *buf;
        unsafe {
            CmdBuf::arm(ptr, OpCode::Put, 7);
            assert!(!(*ptr).is_completed());
            CmdBuf::complete(ptr, 3);
        }
        assert!(buf.is_completed());
        assert_eq!(buf.ret, 3);
        assert_eq!(OpCode::try_from(buf.op), Ok(OpCode::Put));
    }
}
