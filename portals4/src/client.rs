//! The light client library linked into applications. Every call
//! validates its arguments locally, marshals a command entry, submits it
//! over the shared channel and spins for the engine's reply. Counting
//! events and event queues are read without any command at all: their
//! storage is mapped straight into the client.

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use portals_types::{
    AckReq, AtomicDatatype, AtomicOp, CtEvent, EntryOptions, Event, Handle, IoVec,
    ListKind, MatchBits, MdOptions, NiLimits, NiOptions, ProcessId, PtIndex, PtOptions,
    PtlError, Result,
};
use spin::Mutex;

use crate::channel::PpeClient;
use crate::command::{
    AppendCmd, CmdBuf, CtCmd, EqCmd, HandleCmd, MapCmd, MdBindCmd, NiInitCmd, OpCode,
    PtCmd, XferCmd,
};
use crate::ct::{self, CtInfo};
use crate::eq::EqRing;
use crate::ops;
use crate::ppe::TriggeredCtCmd;
use crate::segment::{ExportedIovec, SegmentHandle, SegmentMapper};

/// A memory descriptor bind request, the raw-address shape of the wire
/// protocol. For [`MdOptions::IOVEC`], `start` points at an array of
/// [`IoVec`] and `length` is the element count.
#[derive(Clone, Copy)]
pub struct MdDesc {
    pub start: u64,
    pub length: u64,
    pub options: MdOptions,
    pub eq_handle: Handle,
    pub ct_handle: Handle,
}

/// A list/match entry append request. `match_bits`/`ignore_bits` are
/// ignored on non-matching interfaces.
#[derive(Clone, Copy)]
pub struct EntryDesc {
    pub start: u64,
    pub length: u64,
    pub options: EntryOptions,
    pub ct_handle: Handle,
    pub match_bits: MatchBits,
    pub ignore_bits: MatchBits,
}

struct NiInfo {
    options: NiOptions,
    limits: NiLimits,
}

struct CtRef {
    info: *const CtInfo,
    mapping: SegmentHandle,
}

struct EqRef {
    ring: EqRing,
    mapping: SegmentHandle,
}

/// Client-side exports backing a bound MD, released with it.
enum MdExport {
    Contiguous(SegmentHandle),
    Iovec(ExportedIovec),
}

struct ClientState {
    nis: HashMap<u64, NiInfo>,
    cts: HashMap<u64, CtRef>,
    eqs: HashMap<u64, EqRef>,
    exports: HashMap<u64, MdExport>,
}

/// One rank's connection to its PPE.
pub struct Portals {
    client: PpeClient,
    mapper: Arc<dyn SegmentMapper>,
    state: Mutex<ClientState>,
}

unsafe impl Send for Portals {}
unsafe impl Sync for Portals {}

impl Portals {
    /// Connect to the engine serving this node and register.
    pub fn connect(pad_name: &str, mapper: Arc<dyn SegmentMapper>) -> Result<Arc<Portals>> {
        let client = PpeClient::connect(pad_name)?;
        let portals = Arc::new(Portals {
            client,
            mapper,
            state: Mutex::new(ClientState {
                nis: HashMap::new(),
                cts: HashMap::new(),
                eqs: HashMap::new(),
                exports: HashMap::new(),
            }),
        });
        portals.roundtrip::<u64, ()>(OpCode::Init, 0, |_| ())?;
        Ok(portals)
    }

    fn roundtrip<P: Copy, R>(
        &self,
        op: OpCode,
        payload: P,
        read: impl FnOnce(&P) -> R,
    ) -> Result<R> {
        let cmd = self.client.alloc_cmd(op)?;
        unsafe { *CmdBuf::payload::<P>(cmd) = payload };
        let res = self.client.transfer(cmd);
        let out = read(unsafe { CmdBuf::payload::<P>(cmd) });
        self.client.release_cmd(cmd);
        res.map(|()| out)
    }

    fn ni_info(&self, handle: Handle) -> Result<(NiOptions, NiLimits)> {
        let state = self.state.lock();
        let info = state.nis.get(&handle.raw()).ok_or(PtlError::InvalidArg)?;
        Ok((info.options, info.limits))
    }

    fn ni_of(&self, object: Handle) -> Result<(NiOptions, NiLimits)> {
        let state = self.state.lock();
        for (raw, info) in &state.nis {
            if Handle::from_raw(*raw).ni_index() == object.ni_index() {
                return Ok((info.options, info.limits));
            }
        }
        Err(PtlError::InvalidArg)
    }

    // ---- interface management ------------------------------------------

    pub fn ni_init(
        &self,
        options: NiOptions,
        pid: u32,
        desired: Option<&NiLimits>,
    ) -> Result<(Handle, NiLimits)> {
        if !options.is_valid_kind() {
            return Err(PtlError::InvalidArg);
        }
        let cmd = NiInitCmd {
            options: options.bits(),
            pid,
            with_desired: desired.is_some() as u32,
            _pad: 0,
            desired: desired.copied().unwrap_or_default(),
            actual: NiLimits::default(),
            ni_handle: 0,
        };
        let (handle_raw, actual) =
            self.roundtrip(OpCode::NiInit, cmd, |p| (p.ni_handle, p.actual))?;
        self.state
            .lock()
            .nis
            .insert(handle_raw, NiInfo { options, limits: actual });
        Ok((Handle::from_raw(handle_raw), actual))
    }

    pub fn ni_fini(&self, ni_handle: Handle) -> Result<()> {
        self.ni_info(ni_handle)?;
        self.roundtrip(
            OpCode::NiFini,
            HandleCmd {
                handle: ni_handle.raw(),
                aux: 0,
                reply: 0,
                reply_id: ProcessId::default(),
                _pad: 0,
            },
            |_| (),
        )?;
        self.state.lock().nis.remove(&ni_handle.raw());
        Ok(())
    }

    pub fn ni_status(&self, ni_handle: Handle, register: u64) -> Result<u64> {
        self.roundtrip(
            OpCode::NiStatus,
            HandleCmd {
                handle: ni_handle.raw(),
                aux: register,
                reply: 0,
                reply_id: ProcessId::default(),
                _pad: 0,
            },
            |p| p.reply,
        )
    }

    /// Recover the NI a handle belongs to.
    pub fn ni_handle_of(&self, object: Handle) -> Result<Handle> {
        self.roundtrip(
            OpCode::NiHandle,
            HandleCmd {
                handle: object.raw(),
                aux: 0,
                reply: 0,
                reply_id: ProcessId::default(),
                _pad: 0,
            },
            |p| Handle::from_raw(p.reply),
        )
    }

    fn id_cmd(&self, op: OpCode, ni_handle: Handle) -> Result<ProcessId> {
        self.roundtrip(
            op,
            HandleCmd {
                handle: ni_handle.raw(),
                aux: 0,
                reply: 0,
                reply_id: ProcessId::default(),
                _pad: 0,
            },
            |p| p.reply_id,
        )
    }

    pub fn get_id(&self, ni_handle: Handle) -> Result<ProcessId> {
        self.id_cmd(OpCode::GetId, ni_handle)
    }

    pub fn get_phys_id(&self, ni_handle: Handle) -> Result<ProcessId> {
        self.id_cmd(OpCode::GetPhysId, ni_handle)
    }

    pub fn get_uid(&self, ni_handle: Handle) -> Result<u64> {
        self.roundtrip(
            OpCode::GetUid,
            HandleCmd {
                handle: ni_handle.raw(),
                aux: 0,
                reply: 0,
                reply_id: ProcessId::default(),
                _pad: 0,
            },
            |p| p.reply,
        )
    }

    pub fn set_map(&self, ni_handle: Handle, mapping: &[ProcessId]) -> Result<()> {
        let (options, _) = self.ni_info(ni_handle)?;
        if !options.contains(NiOptions::LOGICAL) || mapping.is_empty() {
            return Err(PtlError::InvalidArg);
        }
        let export = self.mapper.export(
            mapping.as_ptr().cast(),
            std::mem::size_of_val(mapping),
        )?;
        let result = self.roundtrip(
            OpCode::SetMap,
            MapCmd {
                ni_handle: ni_handle.raw(),
                map_size: mapping.len() as u64,
                mapping: export,
                actual_map_size: 0,
            },
            |_| (),
        );
        self.mapper.release(export);
        result
    }

    pub fn get_map(&self, ni_handle: Handle, out: &mut [ProcessId]) -> Result<usize> {
        let export = self
            .mapper
            .export(out.as_ptr().cast(), std::mem::size_of_val(out))?;
        let result = self.roundtrip(
            OpCode::GetMap,
            MapCmd {
                ni_handle: ni_handle.raw(),
                map_size: out.len() as u64,
                mapping: export,
                actual_map_size: 0,
            },
            |p| p.actual_map_size as usize,
        );
        self.mapper.release(export);
        result
    }

    // ---- portal table --------------------------------------------------

    pub fn pt_alloc(
        &self,
        ni_handle: Handle,
        options: PtOptions,
        eq_handle: Handle,
        requested: PtIndex,
    ) -> Result<PtIndex> {
        self.roundtrip(
            OpCode::PtAlloc,
            PtCmd {
                ni_handle: ni_handle.raw(),
                eq_handle: eq_handle.raw(),
                options: options.bits(),
                pt_index_req: requested,
                pt_index: 0,
                _pad: 0,
            },
            |p| p.pt_index,
        )
    }

    fn pt_cmd(&self, op: OpCode, ni_handle: Handle, pt_index: PtIndex) -> Result<()> {
        self.roundtrip(
            op,
            PtCmd {
                ni_handle: ni_handle.raw(),
                eq_handle: Handle::NONE.raw(),
                options: 0,
                pt_index_req: pt_index,
                pt_index: 0,
                _pad: 0,
            },
            |_| (),
        )
    }

    pub fn pt_free(&self, ni_handle: Handle, pt_index: PtIndex) -> Result<()> {
        self.pt_cmd(OpCode::PtFree, ni_handle, pt_index)
    }

    pub fn pt_enable(&self, ni_handle: Handle, pt_index: PtIndex) -> Result<()> {
        self.pt_cmd(OpCode::PtEnable, ni_handle, pt_index)
    }

    pub fn pt_disable(&self, ni_handle: Handle, pt_index: PtIndex) -> Result<()> {
        self.pt_cmd(OpCode::PtDisable, ni_handle, pt_index)
    }

    // ---- memory descriptors --------------------------------------------

    /// Bind a send/receive source.
    ///
    /// # Safety
    /// The memory named by `md.start`/`md.length` (and every iovec
    /// element) must stay valid and allocated until the descriptor is
    /// released and no operation using it remains in flight.
    pub unsafe fn md_bind(&self, ni_handle: Handle, md: &MdDesc) -> Result<Handle> {
        self.ni_info(ni_handle)?;
        let export = if md.options.contains(MdOptions::IOVEC) {
            let iov =
                std::slice::from_raw_parts(md.start as *const IoVec, md.length as usize);
            MdExport::Iovec(ExportedIovec::export(&*self.mapper, iov)?)
        } else {
            MdExport::Contiguous(
                self.mapper.export(md.start as *const u8, md.length as usize)?,
            )
        };
        let mapping = match &export {
            MdExport::Contiguous(handle) => *handle,
            MdExport::Iovec(iov) => iov.list_handle,
        };
        let result = self.roundtrip(
            OpCode::MdBind,
            MdBindCmd {
                ni_handle: ni_handle.raw(),
                start: md.start,
                length: md.length,
                options: md.options.bits(),
                _pad: 0,
                eq_handle: md.eq_handle.raw(),
                ct_handle: md.ct_handle.raw(),
                mapping,
                md_handle: 0,
            },
            |p| p.md_handle,
        );
        match result {
            Ok(raw) => {
                self.state.lock().exports.insert(raw, export);
                Ok(Handle::from_raw(raw))
            }
            Err(err) => {
                self.release_export(&export);
                Err(err)
            }
        }
    }

    fn release_export(&self, export: &MdExport) {
        match export {
            MdExport::Contiguous(handle) => self.mapper.release(*handle),
            MdExport::Iovec(iov) => iov.release(&*self.mapper),
        }
    }

    pub fn md_release(&self, md_handle: Handle) -> Result<()> {
        self.roundtrip(
            OpCode::MdRelease,
            HandleCmd {
                handle: md_handle.raw(),
                aux: 0,
                reply: 0,
                reply_id: ProcessId::default(),
                _pad: 0,
            },
            |_| (),
        )?;
        if let Some(export) = self.state.lock().exports.remove(&md_handle.raw()) {
            self.release_export(&export);
        }
        Ok(())
    }

    // ---- list entries --------------------------------------------------

    /// Append a non-matching list entry.
    ///
    /// # Safety
    /// Same memory contract as [`Portals::md_bind`].
    pub unsafe fn le_append(
        &self,
        ni_handle: Handle,
        pt_index: PtIndex,
        le: &EntryDesc,
        list: ListKind,
        user_ptr: u64,
    ) -> Result<Handle> {
        self.append(OpCode::LeAppend, ni_handle, pt_index, le, list, user_ptr)
    }

    /// Append a matching entry.
    ///
    /// # Safety
    /// Same memory contract as [`Portals::md_bind`].
    pub unsafe fn me_append(
        &self,
        ni_handle: Handle,
        pt_index: PtIndex,
        me: &EntryDesc,
        list: ListKind,
        user_ptr: u64,
    ) -> Result<Handle> {
        self.append(OpCode::MeAppend, ni_handle, pt_index, me, list, user_ptr)
    }

    unsafe fn append(
        &self,
        op: OpCode,
        ni_handle: Handle,
        pt_index: PtIndex,
        entry: &EntryDesc,
        list: ListKind,
        user_ptr: u64,
    ) -> Result<Handle> {
        let (_, limits) = self.ni_info(ni_handle)?;
        ops::validate_pt(&limits, pt_index)?;
        let export = if entry.options.contains(EntryOptions::IOVEC) {
            let iov = std::slice::from_raw_parts(
                entry.start as *const IoVec,
                entry.length as usize,
            );
            MdExport::Iovec(ExportedIovec::export(&*self.mapper, iov)?)
        } else {
            MdExport::Contiguous(
                self.mapper
                    .export(entry.start as *const u8, entry.length as usize)?,
            )
        };
        let mapping = match &export {
            MdExport::Contiguous(handle) => *handle,
            MdExport::Iovec(iov) => iov.list_handle,
        };
        let result = self.roundtrip(
            op,
            AppendCmd {
                ni_handle: ni_handle.raw(),
                start: entry.start,
                length: entry.length,
                ct_handle: entry.ct_handle.raw(),
                match_bits: entry.match_bits,
                ignore_bits: entry.ignore_bits,
                user_ptr,
                mapping,
                pt_index,
                options: entry.options.bits(),
                list: list as u32,
                _pad: 0,
                entry_handle: 0,
            },
            |p| p.entry_handle,
        );
        match result {
            Ok(raw) => {
                self.state.lock().exports.insert(raw, export);
                Ok(Handle::from_raw(raw))
            }
            Err(err) => {
                self.release_export(&export);
                Err(err)
            }
        }
    }

    pub fn le_unlink(&self, le_handle: Handle) -> Result<()> {
        self.unlink(OpCode::LeUnlink, le_handle)
    }

    pub fn me_unlink(&self, me_handle: Handle) -> Result<()> {
        self.unlink(OpCode::MeUnlink, me_handle)
    }

    fn unlink(&self, op: OpCode, handle: Handle) -> Result<()> {
        self.roundtrip(
            op,
            HandleCmd {
                handle: handle.raw(),
                aux: 0,
                reply: 0,
                reply_id: ProcessId::default(),
                _pad: 0,
            },
            |_| (),
        )?;
        if let Some(export) = self.state.lock().exports.remove(&handle.raw()) {
            self.release_export(&export);
        }
        Ok(())
    }

    // ---- counting events -----------------------------------------------

    pub fn ct_alloc(&self, ni_handle: Handle) -> Result<Handle> {
        let (raw, mapping) = self.roundtrip(
            OpCode::CtAlloc,
            CtCmd {
                handle: ni_handle.raw(),
                success: 0,
                failure: 0,
                ct_mapping: SegmentHandle::NONE,
            },
            |p| (p.handle, p.ct_mapping),
        )?;
        let info = self.mapper.import(mapping)? as *const CtInfo;
        self.state.lock().cts.insert(raw, CtRef { info, mapping });
        Ok(Handle::from_raw(raw))
    }

    pub fn ct_free(&self, ct_handle: Handle) -> Result<()> {
        self.roundtrip(
            OpCode::CtFree,
            CtCmd {
                handle: ct_handle.raw(),
                success: 0,
                failure: 0,
                ct_mapping: SegmentHandle::NONE,
            },
            |_| (),
        )?;
        if let Some(ct) = self.state.lock().cts.remove(&ct_handle.raw()) {
            self.mapper.release(ct.mapping);
        }
        Ok(())
    }

    fn ct_info(&self, ct_handle: Handle) -> Result<*const CtInfo> {
        let state = self.state.lock();
        state
            .cts
            .get(&ct_handle.raw())
            .map(|ct| ct.info)
            .ok_or(PtlError::InvalidArg)
    }

    /// Read the counters without a command round trip.
    pub fn ct_get(&self, ct_handle: Handle) -> Result<CtEvent> {
        Ok(unsafe { (*self.ct_info(ct_handle)?).read() })
    }

    /// Block until `success + failure` reaches `test`.
    pub fn ct_wait(&self, ct_handle: Handle, test: u64) -> Result<CtEvent> {
        let info = self.ct_info(ct_handle)?;
        Ok(unsafe { ct::ct_wait(info, test) })
    }

    /// Wait on several CTs; `timeout_us` of [`portals_types::TIME_FOREVER`]
    /// blocks indefinitely.
    pub fn ct_poll(
        &self,
        ct_handles: &[Handle],
        tests: &[u64],
        timeout_us: u64,
    ) -> Result<(CtEvent, usize)> {
        let infos: Vec<*const CtInfo> = ct_handles
            .iter()
            .map(|handle| self.ct_info(*handle))
            .collect::<Result<_>>()?;
        unsafe { ct::ct_poll(&infos, tests, timeout_us) }
    }

    pub fn ct_set(&self, ct_handle: Handle, value: CtEvent) -> Result<()> {
        self.roundtrip(
            OpCode::CtSet,
            CtCmd {
                handle: ct_handle.raw(),
                success: value.success,
                failure: value.failure,
                ct_mapping: SegmentHandle::NONE,
            },
            |_| (),
        )
    }

    pub fn ct_inc(&self, ct_handle: Handle, increment: CtEvent) -> Result<()> {
        self.roundtrip(
            OpCode::CtInc,
            CtCmd {
                handle: ct_handle.raw(),
                success: increment.success,
                failure: increment.failure,
                ct_mapping: SegmentHandle::NONE,
            },
            |_| (),
        )
    }

    pub fn ct_cancel_triggered(&self, ct_handle: Handle) -> Result<()> {
        self.roundtrip(
            OpCode::CtCancelTriggered,
            CtCmd {
                handle: ct_handle.raw(),
                success: 0,
                failure: 0,
                ct_mapping: SegmentHandle::NONE,
            },
            |_| (),
        )
    }

    // ---- event queues --------------------------------------------------

    pub fn eq_alloc(&self, ni_handle: Handle, count: u64) -> Result<Handle> {
        let (raw, mapping) = self.roundtrip(
            OpCode::EqAlloc,
            EqCmd {
                ni_handle: ni_handle.raw(),
                count,
                handle: 0,
                ring_mapping: SegmentHandle::NONE,
            },
            |p| (p.handle, p.ring_mapping),
        )?;
        let base = self.mapper.import(mapping)?;
        let ring = unsafe { EqRing::from_base(base) };
        self.state.lock().eqs.insert(raw, EqRef { ring, mapping });
        Ok(Handle::from_raw(raw))
    }

    pub fn eq_free(&self, eq_handle: Handle) -> Result<()> {
        self.roundtrip(
            OpCode::EqFree,
            EqCmd {
                ni_handle: 0,
                count: 0,
                handle: eq_handle.raw(),
                ring_mapping: SegmentHandle::NONE,
            },
            |_| (),
        )?;
        if let Some(eq) = self.state.lock().eqs.remove(&eq_handle.raw()) {
            self.mapper.release(eq.mapping);
        }
        Ok(())
    }

    fn eq_ring(&self, eq_handle: Handle) -> Result<EqRing> {
        let state = self.state.lock();
        state
            .eqs
            .get(&eq_handle.raw())
            .map(|eq| eq.ring)
            .ok_or(PtlError::InvalidArg)
    }

    /// Non-blocking event read; the boolean reports lost events.
    pub fn eq_get(&self, eq_handle: Handle) -> Result<Option<(Event, bool)>> {
        Ok(self.eq_ring(eq_handle)?.pop())
    }

    pub fn eq_wait(&self, eq_handle: Handle) -> Result<(Event, bool)> {
        Ok(self.eq_ring(eq_handle)?.wait())
    }

    pub fn eq_poll(
        &self,
        eq_handles: &[Handle],
        timeout_us: u64,
    ) -> Result<(Event, bool, usize)> {
        let rings: Vec<EqRing> = eq_handles
            .iter()
            .map(|handle| self.eq_ring(*handle))
            .collect::<Result<_>>()?;
        EqRing::poll(&rings, timeout_us)
    }

    // ---- data movement -------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn put(
        &self,
        md_handle: Handle,
        local_offset: u64,
        length: u64,
        ack_req: AckReq,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: u64,
        user_ptr: u64,
        hdr_data: u64,
    ) -> Result<()> {
        let (options, limits) = self.ni_of(md_handle)?;
        ops::validate_target(options.contains(NiOptions::LOGICAL), target)?;
        ops::validate_pt(&limits, pt_index)?;
        if length > limits.max_msg_size {
            return Err(PtlError::InvalidArg);
        }
        let mut x = xfer_zero();
        x.md_handle = md_handle.raw();
        x.local_offset = local_offset;
        x.length = length;
        x.ack_req = ack_req as u32;
        x.target = target;
        x.pt_index = pt_index;
        x.match_bits = match_bits;
        x.remote_offset = remote_offset;
        x.user_ptr = user_ptr;
        x.hdr_data = hdr_data;
        self.roundtrip(OpCode::Put, x, |_| ())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn get(
        &self,
        md_handle: Handle,
        local_offset: u64,
        length: u64,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: u64,
        user_ptr: u64,
    ) -> Result<()> {
        let (options, limits) = self.ni_of(md_handle)?;
        ops::validate_target(options.contains(NiOptions::LOGICAL), target)?;
        ops::validate_pt(&limits, pt_index)?;
        if length > limits.max_msg_size {
            return Err(PtlError::InvalidArg);
        }
        let mut x = xfer_zero();
        x.md_handle = md_handle.raw();
        x.local_offset = local_offset;
        x.length = length;
        x.ack_req = AckReq::NoAck as u32;
        x.target = target;
        x.pt_index = pt_index;
        x.match_bits = match_bits;
        x.remote_offset = remote_offset;
        x.user_ptr = user_ptr;
        self.roundtrip(OpCode::Get, x, |_| ())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn atomic(
        &self,
        md_handle: Handle,
        local_offset: u64,
        length: u64,
        ack_req: AckReq,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: u64,
        user_ptr: u64,
        hdr_data: u64,
        op: AtomicOp,
        dt: AtomicDatatype,
    ) -> Result<()> {
        let x = self.checked_atomic(
            md_handle,
            Handle::NONE,
            local_offset,
            0,
            length,
            ack_req,
            target,
            pt_index,
            match_bits,
            remote_offset,
            user_ptr,
            hdr_data,
            None,
            op,
            dt,
            false,
        )?;
        self.roundtrip(OpCode::Atomic, x, |_| ())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn fetch_atomic(
        &self,
        get_md_handle: Handle,
        local_get_offset: u64,
        put_md_handle: Handle,
        local_put_offset: u64,
        length: u64,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: u64,
        user_ptr: u64,
        hdr_data: u64,
        op: AtomicOp,
        dt: AtomicDatatype,
    ) -> Result<()> {
        let x = self.checked_atomic(
            get_md_handle,
            put_md_handle,
            local_get_offset,
            local_put_offset,
            length,
            AckReq::NoAck,
            target,
            pt_index,
            match_bits,
            remote_offset,
            user_ptr,
            hdr_data,
            None,
            op,
            dt,
            false,
        )?;
        self.roundtrip(OpCode::FetchAtomic, x, |_| ())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn swap(
        &self,
        get_md_handle: Handle,
        local_get_offset: u64,
        put_md_handle: Handle,
        local_put_offset: u64,
        length: u64,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: u64,
        user_ptr: u64,
        hdr_data: u64,
        operand: Option<&[u8]>,
        op: AtomicOp,
        dt: AtomicDatatype,
    ) -> Result<()> {
        let x = self.checked_atomic(
            get_md_handle,
            put_md_handle,
            local_get_offset,
            local_put_offset,
            length,
            AckReq::NoAck,
            target,
            pt_index,
            match_bits,
            remote_offset,
            user_ptr,
            hdr_data,
            operand,
            op,
            dt,
            true,
        )?;
        self.roundtrip(OpCode::Swap, x, |_| ())
    }

    #[allow(clippy::too_many_arguments)]
    fn checked_atomic(
        &self,
        md_handle: Handle,
        put_md_handle: Handle,
        local_offset: u64,
        local_put_offset: u64,
        length: u64,
        ack_req: AckReq,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: u64,
        user_ptr: u64,
        hdr_data: u64,
        operand: Option<&[u8]>,
        op: AtomicOp,
        dt: AtomicDatatype,
        via_swap: bool,
    ) -> Result<XferCmd> {
        let (options, limits) = self.ni_of(md_handle)?;
        ops::validate_target(options.contains(NiOptions::LOGICAL), target)?;
        ops::validate_pt(&limits, pt_index)?;
        ops::validate_atomic(&limits, length, op, dt, via_swap)?;
        let mut x = xfer_zero();
        x.md_handle = md_handle.raw();
        x.put_md_handle = put_md_handle.raw();
        x.local_offset = local_offset;
        x.local_put_offset = local_put_offset;
        x.length = length;
        x.ack_req = ack_req as u32;
        x.target = target;
        x.pt_index = pt_index;
        x.match_bits = match_bits;
        x.remote_offset = remote_offset;
        x.user_ptr = user_ptr;
        x.hdr_data = hdr_data;
        x.atomic_op = op as u32;
        x.atomic_dt = dt as u32;
        if let Some(operand) = operand {
            if operand.len() > x.operand.len() {
                return Err(PtlError::InvalidArg);
            }
            x.operand[..operand.len()].copy_from_slice(operand);
        }
        Ok(x)
    }

    /// Flush every atomic this client has issued on any of its NIs.
    pub fn atomic_sync(&self) -> Result<()> {
        self.roundtrip::<u64, ()>(OpCode::AtomicSync, 0, |_| ())
    }

    // ---- triggered operations ------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn triggered_put(
        &self,
        md_handle: Handle,
        local_offset: u64,
        length: u64,
        ack_req: AckReq,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: u64,
        user_ptr: u64,
        hdr_data: u64,
        trig_ct_handle: Handle,
        threshold: u64,
    ) -> Result<()> {
        let (options, limits) = self.ni_of(md_handle)?;
        ops::validate_target(options.contains(NiOptions::LOGICAL), target)?;
        ops::validate_pt(&limits, pt_index)?;
        let mut x = xfer_zero();
        x.md_handle = md_handle.raw();
        x.local_offset = local_offset;
        x.length = length;
        x.ack_req = ack_req as u32;
        x.target = target;
        x.pt_index = pt_index;
        x.match_bits = match_bits;
        x.remote_offset = remote_offset;
        x.user_ptr = user_ptr;
        x.hdr_data = hdr_data;
        x.trig_ct_handle = trig_ct_handle.raw();
        x.threshold = threshold;
        self.roundtrip(OpCode::TriggeredPut, x, |_| ())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn triggered_get(
        &self,
        md_handle: Handle,
        local_offset: u64,
        length: u64,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: u64,
        user_ptr: u64,
        trig_ct_handle: Handle,
        threshold: u64,
    ) -> Result<()> {
        let (options, limits) = self.ni_of(md_handle)?;
        ops::validate_target(options.contains(NiOptions::LOGICAL), target)?;
        ops::validate_pt(&limits, pt_index)?;
        let mut x = xfer_zero();
        x.md_handle = md_handle.raw();
        x.local_offset = local_offset;
        x.length = length;
        x.ack_req = AckReq::NoAck as u32;
        x.target = target;
        x.pt_index = pt_index;
        x.match_bits = match_bits;
        x.remote_offset = remote_offset;
        x.user_ptr = user_ptr;
        x.trig_ct_handle = trig_ct_handle.raw();
        x.threshold = threshold;
        self.roundtrip(OpCode::TriggeredGet, x, |_| ())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn triggered_atomic(
        &self,
        md_handle: Handle,
        local_offset: u64,
        length: u64,
        ack_req: AckReq,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: u64,
        user_ptr: u64,
        hdr_data: u64,
        op: AtomicOp,
        dt: AtomicDatatype,
        trig_ct_handle: Handle,
        threshold: u64,
    ) -> Result<()> {
        let mut x = self.checked_atomic(
            md_handle,
            Handle::NONE,
            local_offset,
            0,
            length,
            ack_req,
            target,
            pt_index,
            match_bits,
            remote_offset,
            user_ptr,
            hdr_data,
            None,
            op,
            dt,
            false,
        )?;
        x.trig_ct_handle = trig_ct_handle.raw();
        x.threshold = threshold;
        self.roundtrip(OpCode::TriggeredAtomic, x, |_| ())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn triggered_fetch_atomic(
        &self,
        get_md_handle: Handle,
        local_get_offset: u64,
        put_md_handle: Handle,
        local_put_offset: u64,
        length: u64,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: u64,
        user_ptr: u64,
        hdr_data: u64,
        op: AtomicOp,
        dt: AtomicDatatype,
        trig_ct_handle: Handle,
        threshold: u64,
    ) -> Result<()> {
        let mut x = self.checked_atomic(
            get_md_handle,
            put_md_handle,
            local_get_offset,
            local_put_offset,
            length,
            AckReq::NoAck,
            target,
            pt_index,
            match_bits,
            remote_offset,
            user_ptr,
            hdr_data,
            None,
            op,
            dt,
            false,
        )?;
        x.trig_ct_handle = trig_ct_handle.raw();
        x.threshold = threshold;
        self.roundtrip(OpCode::TriggeredFetchAtomic, x, |_| ())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn triggered_swap(
        &self,
        get_md_handle: Handle,
        local_get_offset: u64,
        put_md_handle: Handle,
        local_put_offset: u64,
        length: u64,
        target: ProcessId,
        pt_index: PtIndex,
        match_bits: MatchBits,
        remote_offset: u64,
        user_ptr: u64,
        hdr_data: u64,
        operand: Option<&[u8]>,
        op: AtomicOp,
        dt: AtomicDatatype,
        trig_ct_handle: Handle,
        threshold: u64,
    ) -> Result<()> {
        let mut x = self.checked_atomic(
            get_md_handle,
            put_md_handle,
            local_get_offset,
            local_put_offset,
            length,
            AckReq::NoAck,
            target,
            pt_index,
            match_bits,
            remote_offset,
            user_ptr,
            hdr_data,
            operand,
            op,
            dt,
            true,
        )?;
        x.trig_ct_handle = trig_ct_handle.raw();
        x.threshold = threshold;
        self.roundtrip(OpCode::TriggeredSwap, x, |_| ())
    }

    pub fn triggered_ct_inc(
        &self,
        ct_handle: Handle,
        increment: CtEvent,
        trig_ct_handle: Handle,
        threshold: u64,
    ) -> Result<()> {
        self.triggered_ct(OpCode::TriggeredCtInc, ct_handle, increment, trig_ct_handle, threshold)
    }

    pub fn triggered_ct_set(
        &self,
        ct_handle: Handle,
        value: CtEvent,
        trig_ct_handle: Handle,
        threshold: u64,
    ) -> Result<()> {
        self.triggered_ct(OpCode::TriggeredCtSet, ct_handle, value, trig_ct_handle, threshold)
    }

    fn triggered_ct(
        &self,
        op: OpCode,
        ct_handle: Handle,
        value: CtEvent,
        trig_ct_handle: Handle,
        threshold: u64,
    ) -> Result<()> {
        self.roundtrip(
            op,
            TriggeredCtCmd {
                ct: CtCmd {
                    handle: ct_handle.raw(),
                    success: value.success,
                    failure: value.failure,
                    ct_mapping: SegmentHandle::NONE,
                },
                trig_ct_handle: trig_ct_handle.raw(),
                threshold,
            },
            |_| (),
        )
    }
}

impl Drop for Portals {
    fn drop(&mut self) {
        if self
            .roundtrip::<u64, ()>(OpCode::Fini, 0, |_| ())
            .is_err()
        {
            warn!("engine did not acknowledge client teardown");
        }
    }
}

fn xfer_zero() -> XferCmd {
    unsafe { std::mem::zeroed() }
}
