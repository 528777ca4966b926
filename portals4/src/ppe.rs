//! The process plumbing engine. One worker thread owns all hosted NI
//! state: it admits clients over the comm pad, pumps their command
//! queues, runs the connection state machines, moves messages over the
//! shared-memory and RDMA transports, reaps completions and fires
//! triggered operations.
//!
//! Commands are independent; the only ordering the engine guarantees
//! between operations of one client is what counting events impose.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};
use portals_types::wire::{DataDir, DataFormat, MemIovec, Sge, MAX_INLINE_SGE};
use zerocopy::AsBytes;
use portals_types::{
    AckReq, AtomicDatatype, AtomicOp, CtEvent, EntryOptions, Event, EventKind, Handle,
    ListKind, MdOptions, NiFail, NiOptions, ProcessId, PtlError, Result, RetCode,
};
use spin::Mutex;

use crate::channel::PpeChannel;
use crate::command::{
    AppendCmd, CmdBuf, CtCmd, EqCmd, HandleCmd, MapCmd, MdBindCmd, NiInitCmd, OpCode,
    PtCmd, XferCmd,
};
use crate::conn::{Conn, OutMsg, Transport};
use crate::ct::{Ct, TriggeredAction};
use crate::eq::Eq;
use crate::md::{self, Md, Seg};
use crate::me::MatchEntry;
use crate::mr::Mr;
use crate::ni::{Ni, SR_DROP_COUNT, SR_FAIL_COUNT, SR_RECV_BYTES, SR_RECV_COUNT};
use crate::ops::{
    self, MsgFail, MsgHdr, MsgKind, MsgOp, MSG_HDR_SIZE, NI_BIT_LOGICAL, NI_BIT_MATCHING,
};
use crate::params::params;
use crate::rdma::{CompThreshold, RdmaXfer};
use crate::segment::{CookieWindow, SegmentHandle, SegmentMapper};
use crate::shmem::{ShmemTransport, SHMEM_BUF_PAYLOAD};
use crate::verbs::{Completion, QueuePair, RdmaProvider};

pub struct PpeConfig {
    pub pad_name: String,
    pub nid: u32,
    /// PIDs handed to clients that ask for `PID_ANY`.
    pub base_pid: u32,
}

impl Default for PpeConfig {
    fn default() -> Self {
        PpeConfig {
            pad_name: crate::channel::COMM_PAD_NAME.to_string(),
            nid: 0,
            base_pid: 1,
        }
    }
}

struct Client {
    pid: u32,
    refs: u32,
    nis: [Option<Arc<Ni>>; 4],
    outstanding_atomics: u64,
}

/// Initiator-side record of a data operation in flight.
struct InitOp {
    ni: Arc<Ni>,
    cookie: u64,
    op: MsgOp,
    /// Destination MD for fetches, source MD otherwise.
    md: Arc<Md>,
    put_md: Option<Arc<Md>>,
    local_offset: u64,
    ack_req: AckReq,
    user_ptr: u64,
    length: u64,
    /// Windows the target DMAs against, pinned until the reply.
    _mrs: Vec<Arc<Mr>>,
    /// Backing store of an indirect SGL descriptor.
    _desc: Option<Box<[Sge]>>,
}

/// Where a target sends its reply.
#[derive(Clone)]
enum ReplyPath {
    Shmem { via: Arc<ShmemTransport>, dest: u32 },
    Rdma(Arc<dyn QueuePair>),
}

/// Target-side record of a transfer the RDMA engine is driving.
struct TargetOp {
    ni: Arc<Ni>,
    entry: Arc<MatchEntry>,
    pt_eq: Handle,
    xfer: RdmaXfer,
    local: Vec<Seg>,
    qp: Arc<dyn QueuePair>,
    reply: ReplyPath,
    hdr: MsgHdr,
    mlength: u64,
}

pub struct Ppe {
    channel: PpeChannel,
    mapper: Arc<dyn SegmentMapper>,
    provider: Arc<dyn RdmaProvider>,
    nid: u32,
    base_pid: u32,
    clients: Mutex<HashMap<u64, Client>>,
    inits: Mutex<HashMap<u64, InitOp>>,
    targets: Mutex<HashMap<u64, TargetOp>>,
    next_xfer: AtomicU64,
    thresholds: Mutex<HashMap<(u32, u32), Arc<CompThreshold>>>,
    /// Freed objects whose imports can only be released once the last
    /// in-flight reference drops.
    md_graveyard: Mutex<Vec<Arc<Md>>>,
    entry_graveyard: Mutex<Vec<Arc<MatchEntry>>>,
    /// Requests that arrived before their NI registered; a client racing
    /// through bootstrap gets a grace period before the drop is final.
    undelivered: Mutex<Vec<(Vec<u8>, ReplyPath, u32)>>,
}

/// Progress ticks an early request may wait for its NI.
const UNDELIVERED_TRIES: u32 = 1 << 16;

/// Owner of a running PPE worker; stops and joins it on drop.
pub struct PpeHandle {
    running: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl PpeHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PpeHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Ppe {
    pub fn start(
        config: PpeConfig,
        mapper: Arc<dyn SegmentMapper>,
        provider: Arc<dyn RdmaProvider>,
    ) -> Result<PpeHandle> {
        let channel = PpeChannel::create(&config.pad_name)?;
        let ppe = Arc::new(Ppe {
            channel,
            mapper,
            provider,
            nid: config.nid,
            base_pid: config.base_pid,
            clients: Mutex::new(HashMap::new()),
            inits: Mutex::new(HashMap::new()),
            targets: Mutex::new(HashMap::new()),
            next_xfer: AtomicU64::new(1),
            thresholds: Mutex::new(HashMap::new()),
            md_graveyard: Mutex::new(Vec::new()),
            entry_graveyard: Mutex::new(Vec::new()),
            undelivered: Mutex::new(Vec::new()),
        });
        let running = Arc::new(AtomicBool::new(true));
        let worker_running = running.clone();
        let thread = std::thread::Builder::new()
            .name(format!("ppe-nid{}", config.nid))
            .spawn(move || ppe.run(&worker_running))
            .map_err(|_| PtlError::Fail)?;
        Ok(PpeHandle { running, thread: Some(thread) })
    }

    fn run(&self, running: &AtomicBool) {
        debug!("ppe worker up (nid {})", self.nid);
        let mut idle = 0u32;
        while running.load(Ordering::Acquire) {
            let mut busy = false;
            if let Some((cookie, pid)) = self.channel.accept() {
                self.clients.lock().insert(
                    cookie,
                    Client { pid, refs: 0, nis: Default::default(), outstanding_atomics: 0 },
                );
                busy = true;
            }
            while let Some(cmd) = self.channel.next_cmd() {
                self.dispatch(cmd);
                busy = true;
            }
            busy |= self.progress();
            if busy {
                idle = 0;
            } else {
                idle += 1;
                if idle > 1 << 12 {
                    std::thread::sleep(std::time::Duration::from_micros(
                        params().poll_interval_us,
                    ));
                } else {
                    std::hint::spin_loop();
                }
            }
        }
        debug!("ppe worker down (nid {})", self.nid);
    }

    fn nis(&self) -> Vec<Arc<Ni>> {
        let clients = self.clients.lock();
        clients
            .values()
            .flat_map(|client| client.nis.iter().flatten().cloned())
            .collect()
    }

    fn client_ni(&self, cookie: u64, handle_raw: u64) -> Result<Arc<Ni>> {
        let handle = Handle::from_raw(handle_raw);
        let clients = self.clients.lock();
        let client = clients.get(&cookie).ok_or(PtlError::NoInit)?;
        client.nis[handle.ni_index() as usize & 3]
            .clone()
            .ok_or(PtlError::InvalidArg)
    }

    // ---- command dispatch ----------------------------------------------

    fn dispatch(&self, cmd: *mut CmdBuf) {
        let (op_raw, cookie) = unsafe { ((*cmd).op, (*cmd).cookie) };
        let op = match OpCode::try_from(op_raw) {
            Ok(op) => op,
            Err(_) => {
                unsafe { CmdBuf::complete(cmd, RetCode::encode(Err(PtlError::InvalidArg))) };
                return;
            }
        };
        trace!("cmd {op:?} from cookie {cookie}");
        let result = self.execute(op, cookie, cmd);
        unsafe { CmdBuf::complete(cmd, RetCode::encode(result)) };
    }

    fn execute(&self, op: OpCode, cookie: u64, cmd: *mut CmdBuf) -> Result<()> {
        match op {
            OpCode::Init => {
                let mut clients = self.clients.lock();
                let client = clients.get_mut(&cookie).ok_or(PtlError::NoInit)?;
                client.refs += 1;
                Ok(())
            }
            OpCode::Fini => {
                let mut clients = self.clients.lock();
                let client = clients.get_mut(&cookie).ok_or(PtlError::NoInit)?;
                client.refs = client.refs.saturating_sub(1);
                if client.refs == 0 {
                    debug!("client {cookie} (pid {}) torn down", client.pid);
                    client.nis = Default::default();
                }
                Ok(())
            }
            OpCode::NiInit => self.ni_init(cookie, unsafe { CmdBuf::payload(cmd) }),
            OpCode::NiFini => {
                let p: &mut HandleCmd = unsafe { CmdBuf::payload(cmd) };
                let ni = self.client_ni(cookie, p.handle)?;
                // drain in-flight work before the interface goes
                while self.inits.lock().values().any(|op| Arc::ptr_eq(&op.ni, &ni)) {
                    self.progress();
                }
                ni.mr_table.clear();
                let slot = Handle::from_raw(p.handle).ni_index() as usize & 3;
                self.clients
                    .lock()
                    .get_mut(&cookie)
                    .ok_or(PtlError::NoInit)?
                    .nis[slot] = None;
                Ok(())
            }
            OpCode::NiStatus => {
                let p: &mut HandleCmd = unsafe { CmdBuf::payload(cmd) };
                let ni = self.client_ni(cookie, p.handle)?;
                p.reply = ni.sr_read(p.aux)?;
                Ok(())
            }
            OpCode::NiHandle => {
                let p: &mut HandleCmd = unsafe { CmdBuf::payload(cmd) };
                let ni = self.client_ni(cookie, p.handle)?;
                p.reply = ni.handle().raw();
                Ok(())
            }
            OpCode::SetMap => self.set_map(cookie, unsafe { CmdBuf::payload(cmd) }),
            OpCode::GetMap => self.get_map(cookie, unsafe { CmdBuf::payload(cmd) }),
            OpCode::PtAlloc => {
                let p: &mut PtCmd = unsafe { CmdBuf::payload(cmd) };
                let ni = self.client_ni(cookie, p.ni_handle)?;
                let eq = Handle::from_raw(p.eq_handle);
                if !eq.is_none() {
                    ni.eqs.get(eq)?;
                }
                let options = portals_types::PtOptions::from_bits_truncate(p.options);
                p.pt_index = ni.pt.alloc(p.pt_index_req, options, eq)?;
                Ok(())
            }
            OpCode::PtFree => {
                let p: &mut PtCmd = unsafe { CmdBuf::payload(cmd) };
                self.client_ni(cookie, p.ni_handle)?.pt.free(p.pt_index_req)
            }
            OpCode::PtEnable => {
                let p: &mut PtCmd = unsafe { CmdBuf::payload(cmd) };
                self.client_ni(cookie, p.ni_handle)?.pt.enable(p.pt_index_req)
            }
            OpCode::PtDisable => {
                let p: &mut PtCmd = unsafe { CmdBuf::payload(cmd) };
                self.client_ni(cookie, p.ni_handle)?.pt.disable(p.pt_index_req)
            }
            OpCode::GetUid => {
                let p: &mut HandleCmd = unsafe { CmdBuf::payload(cmd) };
                self.client_ni(cookie, p.handle)?;
                p.reply = unsafe { libc::getuid() } as u64;
                Ok(())
            }
            OpCode::GetId => {
                let p: &mut HandleCmd = unsafe { CmdBuf::payload(cmd) };
                let ni = self.client_ni(cookie, p.handle)?;
                let id = ni.id();
                p.reply_id = if ni.is_logical() {
                    ProcessId::logical(id.rank)
                } else {
                    ProcessId::physical(id.nid, id.pid)
                };
                Ok(())
            }
            OpCode::GetPhysId => {
                let p: &mut HandleCmd = unsafe { CmdBuf::payload(cmd) };
                let id = self.client_ni(cookie, p.handle)?.id();
                p.reply_id = ProcessId::physical(id.nid, id.pid);
                Ok(())
            }
            OpCode::MdBind => {
                let p: &mut MdBindCmd = unsafe { CmdBuf::payload(cmd) };
                let ni = self.client_ni(cookie, p.ni_handle)?;
                let eq = Handle::from_raw(p.eq_handle);
                let ct = Handle::from_raw(p.ct_handle);
                if !eq.is_none() {
                    ni.eqs.get(eq)?;
                }
                if !ct.is_none() {
                    ni.cts.get(ct)?;
                }
                let md = Md::resolve(
                    &*self.mapper,
                    p.start,
                    p.length,
                    MdOptions::from_bits_truncate(p.options),
                    eq,
                    ct,
                    p.mapping,
                )?;
                p.md_handle = ni.mds.alloc(md)?.raw();
                Ok(())
            }
            OpCode::MdRelease => {
                let p: &mut HandleCmd = unsafe { CmdBuf::payload(cmd) };
                let ni = self.client_ni(cookie, p.handle)?;
                let md = ni.mds.free(Handle::from_raw(p.handle))?;
                self.md_graveyard.lock().push(md);
                Ok(())
            }
            OpCode::LeAppend => self.append(cookie, cmd, false),
            OpCode::MeAppend => self.append(cookie, cmd, true),
            OpCode::LeUnlink => self.unlink(cookie, cmd, false),
            OpCode::MeUnlink => self.unlink(cookie, cmd, true),
            OpCode::CtAlloc => {
                let p: &mut CtCmd = unsafe { CmdBuf::payload(cmd) };
                let ni = self.client_ni(cookie, p.handle)?;
                let ct = Ct::new(&*self.mapper)?;
                p.ct_mapping = ct.mapping;
                p.handle = ni.cts.alloc(ct)?.raw();
                Ok(())
            }
            OpCode::CtFree => {
                let p: &mut CtCmd = unsafe { CmdBuf::payload(cmd) };
                let ni = self.client_ni(cookie, p.handle)?;
                let ct = ni.cts.free(Handle::from_raw(p.handle))?;
                ct.unmap(&*self.mapper);
                Ok(())
            }
            OpCode::CtCancelTriggered => {
                let p: &mut CtCmd = unsafe { CmdBuf::payload(cmd) };
                let ni = self.client_ni(cookie, p.handle)?;
                ni.cts.get(Handle::from_raw(p.handle))?.cancel_triggered();
                Ok(())
            }
            OpCode::CtSet => {
                let p: &mut CtCmd = unsafe { CmdBuf::payload(cmd) };
                let value = CtEvent { success: p.success, failure: p.failure };
                self.ct_apply(cookie, p.handle, |ct| ct.set(value))
            }
            OpCode::CtInc => {
                let p: &mut CtCmd = unsafe { CmdBuf::payload(cmd) };
                let increment = CtEvent { success: p.success, failure: p.failure };
                self.ct_apply(cookie, p.handle, |ct| ct.add(increment))
            }
            OpCode::EqAlloc => {
                let p: &mut EqCmd = unsafe { CmdBuf::payload(cmd) };
                let ni = self.client_ni(cookie, p.ni_handle)?;
                let eq = Eq::new(&*self.mapper, p.count)?;
                p.ring_mapping = eq.mapping;
                p.handle = ni.eqs.alloc(eq)?.raw();
                Ok(())
            }
            OpCode::EqFree => {
                let p: &mut EqCmd = unsafe { CmdBuf::payload(cmd) };
                let ni = self.client_ni(cookie, p.handle)?;
                let eq = ni.eqs.free(Handle::from_raw(p.handle))?;
                eq.unmap(&*self.mapper);
                Ok(())
            }
            OpCode::Put | OpCode::Get | OpCode::Atomic | OpCode::FetchAtomic
            | OpCode::Swap => {
                let p: &mut XferCmd = unsafe { CmdBuf::payload(cmd) };
                self.initiate(cookie, msg_op_of(op), *p)
            }
            OpCode::AtomicSync => loop {
                {
                    let clients = self.clients.lock();
                    let client = clients.get(&cookie).ok_or(PtlError::NoInit)?;
                    if client.outstanding_atomics == 0 {
                        return Ok(());
                    }
                }
                self.progress();
            },
            OpCode::TriggeredPut
            | OpCode::TriggeredGet
            | OpCode::TriggeredAtomic
            | OpCode::TriggeredFetchAtomic
            | OpCode::TriggeredSwap => {
                let p: &mut XferCmd = unsafe { CmdBuf::payload(cmd) };
                let xfer = *p;
                let plain = plain_op_of(op);
                let ni = self.client_ni(cookie, xfer.md_handle)?;
                let trig_ni = self.client_ni(cookie, xfer.trig_ct_handle)?;
                let ct = trig_ni.cts.get(Handle::from_raw(xfer.trig_ct_handle))?;
                let action = TriggeredAction::Xfer { op: plain, cookie, xfer };
                match ct.add_trigger(
                    xfer.threshold,
                    action,
                    ni.limits.max_triggered_ops,
                )? {
                    Some(action) => {
                        self.run_actions(vec![action]);
                        Ok(())
                    }
                    None => Ok(()),
                }
            }
            OpCode::TriggeredCtInc | OpCode::TriggeredCtSet => {
                let p: &mut TriggeredCtCmd = unsafe { CmdBuf::payload(cmd) };
                let (trig_raw, threshold, target_raw) = p.trigger();
                let value = CtEvent { success: p.ct.success, failure: p.ct.failure };
                let ni = self.client_ni(cookie, trig_raw)?;
                let trig_ct = ni.cts.get(Handle::from_raw(trig_raw))?;
                let action = if op == OpCode::TriggeredCtInc {
                    TriggeredAction::CtInc { cookie, ct_raw: target_raw, increment: value }
                } else {
                    TriggeredAction::CtSet { cookie, ct_raw: target_raw, value }
                };
                match trig_ct.add_trigger(threshold, action, ni.limits.max_triggered_ops)? {
                    Some(action) => {
                        self.run_actions(vec![action]);
                        Ok(())
                    }
                    None => Ok(()),
                }
            }
        }
    }

    fn ni_init(&self, cookie: u64, p: &mut NiInitCmd) -> Result<()> {
        let options = NiOptions::from_bits_truncate(p.options);
        let mut clients = self.clients.lock();
        let client = clients.get_mut(&cookie).ok_or(PtlError::NoInit)?;
        let slot = client
            .nis
            .iter()
            .position(|ni| ni.is_none())
            .ok_or(PtlError::NoSpace)?;
        let pid = if p.pid == portals_types::PID_ANY {
            self.base_pid + cookie as u32
        } else {
            p.pid
        };
        let desired = if p.with_desired != 0 { Some(&p.desired) } else { None };
        let ni = Arc::new(Ni::new(
            slot as u8,
            cookie,
            options,
            desired,
            ProcessId::physical(self.nid, pid),
            self.provider.clone(),
        )?);
        if !ni.is_logical() {
            ni.setup_phys_shmem()?;
        }
        p.actual = ni.limits;
        p.ni_handle = ni.handle().raw();
        client.nis[slot] = Some(ni);
        debug!("client {cookie}: NI slot {slot} up ({options:?}, pid {pid})");
        Ok(())
    }

    fn set_map(&self, cookie: u64, p: &mut MapCmd) -> Result<()> {
        let ni = self.client_ni(cookie, p.ni_handle)?;
        let base = self.mapper.import(p.mapping)?;
        let map = unsafe {
            std::slice::from_raw_parts(base.cast::<ProcessId>(), p.map_size as usize)
        };
        let result = ni.set_map(map);
        self.mapper.release(p.mapping);
        result
    }

    fn get_map(&self, cookie: u64, p: &mut MapCmd) -> Result<()> {
        let ni = self.client_ni(cookie, p.ni_handle)?;
        let table = ni.rank_table()?;
        let mapping = table.mapping();
        let base = self.mapper.import(p.mapping)?;
        let out = unsafe {
            std::slice::from_raw_parts_mut(base.cast::<ProcessId>(), p.map_size as usize)
        };
        for (dst, src) in out.iter_mut().zip(&mapping) {
            *dst = *src;
        }
        p.actual_map_size = mapping.len() as u64;
        self.mapper.release(p.mapping);
        Ok(())
    }

    fn append(&self, cookie: u64, cmd: *mut CmdBuf, matching: bool) -> Result<()> {
        let p: &mut AppendCmd = unsafe { CmdBuf::payload(cmd) };
        let ni = self.client_ni(cookie, p.ni_handle)?;
        if matching != ni.is_matching() {
            return Err(PtlError::InvalidArg);
        }
        ops::validate_pt(&ni.limits, p.pt_index)?;
        let ct = Handle::from_raw(p.ct_handle);
        if !ct.is_none() {
            ni.cts.get(ct)?;
        }
        let list = ListKind::from_repr(p.list as u8).ok_or(PtlError::InvalidArg)?;
        let entry = MatchEntry::resolve(
            &*self.mapper,
            p.start,
            p.length,
            EntryOptions::from_bits_truncate(p.options),
            ct,
            p.match_bits,
            p.ignore_bits,
            p.pt_index,
            list,
            p.user_ptr,
            p.mapping,
            matching,
        )?;
        let arena = if matching { &ni.mes } else { &ni.les };
        let handle = arena.alloc(entry)?;
        if let Err(err) = ni.pt.append(p.pt_index, list, handle) {
            let entry = arena.free(handle)?;
            entry.unmap(&*self.mapper);
            return Err(err);
        }
        p.entry_handle = handle.raw();
        Ok(())
    }

    fn unlink(&self, cookie: u64, cmd: *mut CmdBuf, matching: bool) -> Result<()> {
        let p: &mut HandleCmd = unsafe { CmdBuf::payload(cmd) };
        let ni = self.client_ni(cookie, p.handle)?;
        let handle = Handle::from_raw(p.handle);
        let arena = if matching { &ni.mes } else { &ni.les };
        let entry = arena.free(handle)?;
        let _ = ni.pt.unlink(entry.pt_index, handle);
        self.entry_graveyard.lock().push(entry);
        Ok(())
    }

    fn ct_apply(
        &self,
        cookie: u64,
        handle_raw: u64,
        f: impl FnOnce(&Ct) -> Vec<TriggeredAction>,
    ) -> Result<()> {
        let ni = self.client_ni(cookie, handle_raw)?;
        let ct = ni.cts.get(Handle::from_raw(handle_raw))?;
        let actions = f(&ct);
        self.run_actions(actions);
        Ok(())
    }

    /// Execute fired triggers; anything they fire in turn joins the
    /// worklist, so a chain of triggered CT increments settles here.
    fn run_actions(&self, mut actions: Vec<TriggeredAction>) {
        while let Some(action) = actions.pop() {
            match action {
                TriggeredAction::Xfer { op, cookie, xfer } => {
                    if let Err(err) = self.initiate(cookie, msg_op_of(op), xfer) {
                        warn!("triggered operation failed: {err}");
                    }
                }
                TriggeredAction::CtInc { cookie, ct_raw, increment } => {
                    if let Ok(ni) = self.client_ni(cookie, ct_raw) {
                        if let Ok(ct) = ni.cts.get(Handle::from_raw(ct_raw)) {
                            actions.extend(ct.add(increment));
                        }
                    }
                }
                TriggeredAction::CtSet { cookie, ct_raw, value } => {
                    if let Ok(ni) = self.client_ni(cookie, ct_raw) {
                        if let Ok(ct) = ni.cts.get(Handle::from_raw(ct_raw)) {
                            actions.extend(ct.set(value));
                        }
                    }
                }
            }
        }
    }

    // ---- initiator side ------------------------------------------------

    fn initiate(&self, cookie: u64, op: MsgOp, x: XferCmd) -> Result<()> {
        let ni = self.client_ni(cookie, x.md_handle)?;
        let md = ni.mds.get(Handle::from_raw(x.md_handle))?;
        let put_md = if op == MsgOp::FetchAtomic || op == MsgOp::Swap {
            Some(ni.mds.get(Handle::from_raw(x.put_md_handle))?)
        } else {
            None
        };
        if x.length > ni.limits.max_msg_size {
            return Err(PtlError::InvalidArg);
        }
        let source = put_md.as_ref().unwrap_or(&md);
        let source_offset = if put_md.is_some() { x.local_put_offset } else { x.local_offset };
        if op.deposits() {
            source.check_range(source_offset, x.length)?;
        }
        if op.fetches() {
            md.check_range(x.local_offset, x.length)?;
        }
        let target = ni.resolve_target(x.target)?;
        let ack_req = ops::ack_req_from(x.ack_req)?;

        let me = ni.id();
        let xfer_id = self.next_xfer.fetch_add(1, Ordering::Relaxed);
        let mut hdr = MsgHdr {
            kind: MsgKind::Request.into(),
            op: op.into(),
            ack_req: x.ack_req as u8,
            atomic_op: x.atomic_op as u8,
            atomic_dt: x.atomic_dt as u8,
            data_fmt: DataFormat::None.into(),
            fail: MsgFail::Ok.into(),
            ni_bits: (if ni.is_matching() { NI_BIT_MATCHING } else { 0 })
                | (if ni.is_logical() { NI_BIT_LOGICAL } else { 0 }),
            src: me,
            dst: target,
            pt_index: x.pt_index,
            _pad: 0,
            match_bits: x.match_bits,
            length: x.length,
            remote_offset: x.remote_offset,
            hdr_data: x.hdr_data,
            operand: x.operand,
            xfer_id,
        };

        let local_node = target.nid == me.nid;
        let mut mrs = Vec::new();
        let mut desc_hold = None;
        let data: Vec<u8> = if op.is_atomic() {
            // atomics are bounded by max_atomic_size and travel inline
            hdr.data_fmt = DataFormat::Inline.into();
            let mut data = vec![0u8; x.length as usize];
            unsafe { md::copy_from_segs(&source.segs, source_offset, &mut data) };
            data
        } else if op == MsgOp::Put {
            self.marshal_windows(
                &ni,
                source,
                source_offset,
                x.length,
                local_node,
                &mut hdr,
                &mut mrs,
                &mut desc_hold,
            )?
        } else {
            // Get: describe the destination windows for the target
            self.marshal_windows(
                &ni,
                &md,
                x.local_offset,
                x.length,
                local_node,
                &mut hdr,
                &mut mrs,
                &mut desc_hold,
            )?
        };

        let bytes = ops::msg_to_bytes(&hdr, &data);
        let conn = ni.route(x.target)?;
        self.inits.lock().insert(
            xfer_id,
            InitOp {
                ni: ni.clone(),
                cookie,
                op,
                md,
                put_md,
                local_offset: x.local_offset,
                ack_req,
                user_ptr: x.user_ptr,
                length: x.length,
                _mrs: mrs,
                _desc: desc_hold,
            },
        );
        if op.is_atomic() {
            if let Some(client) = self.clients.lock().get_mut(&cookie) {
                client.outstanding_atomics += 1;
            }
        }

        if let Some(transport) = conn.submit(OutMsg { bytes: bytes.clone(), xfer_id }, true) {
            self.send_on(&ni, &transport, target, bytes);
        }
        Ok(())
    }

    /// Build the data section describing `length` bytes of `md` starting
    /// at `offset`: inline payload below the threshold, cookie windows on
    /// the node-local path, scatter/gather windows (direct or indirect)
    /// for the fabric.
    #[allow(clippy::too_many_arguments)]
    fn marshal_windows(
        &self,
        _ni: &Arc<Ni>,
        md: &Arc<Md>,
        offset: u64,
        length: u64,
        local_node: bool,
        hdr: &mut MsgHdr,
        mrs: &mut Vec<Arc<Mr>>,
        desc_hold: &mut Option<Box<[Sge]>>,
    ) -> Result<Vec<u8>> {
        let is_put = hdr.op == u8::from(MsgOp::Put);
        let inline_cap = if local_node {
            SHMEM_BUF_PAYLOAD - MSG_HDR_SIZE
        } else {
            params().max_inline_data
        };
        if is_put && (length as usize) <= inline_cap {
            hdr.data_fmt = DataFormat::Inline.into();
            let mut data = vec![0u8; length as usize];
            unsafe { md::copy_from_segs(&md.segs, offset, &mut data) };
            return Ok(data);
        }
        if !is_put && (length as usize) <= inline_cap {
            // short get: the reply carries the data inline
            hdr.data_fmt = DataFormat::None.into();
            return Ok(Vec::new());
        }
        if local_node {
            // kernel-assisted copy through the export cookies
            hdr.data_fmt = DataFormat::MemIovec.into();
            let windows = md.cookie_windows(offset, length);
            let mut data =
                Vec::with_capacity(windows.len() * std::mem::size_of::<MemIovec>());
            for w in windows {
                let iov = MemIovec::new(w.handle.id, w.offset, w.len);
                data.extend_from_slice(iov.as_bytes());
            }
            return Ok(data);
        }
        // fabric path: register each piece and describe it as windows
        let pieces = md::walk(&md.segs, offset, length);
        let mut sges = Vec::with_capacity(pieces.len());
        for piece in pieces {
            let mr = _ni.mr_table.lookup(piece.addr, piece.len)?;
            sges.push(Sge::new(piece.addr, piece.len as u32, mr.keys.rkey));
            mrs.push(mr);
        }
        if sges.len() <= MAX_INLINE_SGE {
            hdr.data_fmt = DataFormat::Sge.into();
            let mut data = Vec::with_capacity(sges.len() * std::mem::size_of::<Sge>());
            for sge in &sges {
                data.extend_from_slice(sge_bytes(sge));
            }
            Ok(data)
        } else {
            // the descriptor itself becomes remotely readable memory
            hdr.data_fmt = DataFormat::IndirectSge.into();
            let boxed: Box<[Sge]> = sges.into_boxed_slice();
            let bytes = std::mem::size_of_val(&*boxed);
            let mr = _ni.mr_table.lookup(boxed.as_ptr() as u64, bytes as u64)?;
            let window = Sge::new(boxed.as_ptr() as u64, bytes as u32, mr.keys.rkey);
            mrs.push(mr);
            *desc_hold = Some(boxed);
            Ok(sge_bytes(&window).to_vec())
        }
    }

    fn send_on(&self, ni: &Arc<Ni>, transport: &Transport, target: ProcessId, bytes: Vec<u8>) {
        match transport {
            Transport::Rdma(qp) => {
                if qp.send_message(bytes).is_err() {
                    warn!("message send to {target:?} failed");
                }
            }
            Transport::Shmem { local_index } => {
                if let Some(shmem) = ni.poll_shmem() {
                    if let Err(err) = shmem.send(*local_index, &bytes) {
                        warn!("shmem send to slot {local_index} failed: {err}");
                    }
                } else {
                    warn!("shmem transport not up for {target:?}");
                }
            }
            Transport::None => warn!("no transport for {target:?}"),
        }
    }

    // ---- progress ------------------------------------------------------

    fn progress(&self) -> bool {
        let mut busy = false;
        let nis = self.nis();

        // node-local pads: finish setups, drain inbound queues
        for ni in &nis {
            if let Some(shmem) = ni.poll_shmem() {
                while let Some(msg) = shmem.poll() {
                    busy = true;
                    let reply = ReplyPath::Shmem { via: shmem.clone(), dest: msg.src_index };
                    self.deliver(msg.bytes, reply);
                }
            }
        }

        // connection state machines
        for ni in &nis {
            let mut conns: Vec<Arc<Conn>> = Vec::new();
            let mut push = |conn: Arc<Conn>, conns: &mut Vec<Arc<Conn>>| {
                if !conns.iter().any(|seen| Arc::ptr_eq(seen, &conn)) {
                    conns.push(conn);
                }
            };
            ni.conns.for_each(|conn| push(conn.clone(), &mut conns));
            if let Ok(table) = ni.rank_table() {
                for rank in 0..table.len() as u32 {
                    if let Ok(conn) = table.route(rank) {
                        push(conn, &mut conns);
                    }
                }
            }
            let me = ni.id();
            for conn in conns {
                // work queued behind a connection that something else
                // (shmem switch-over, passive accept) established
                for (msg, transport) in conn.take_pending() {
                    busy = true;
                    self.send_on(ni, &transport, conn.id, msg.bytes);
                }
                if ni.is_logical() && conn.id.nid == me.nid {
                    // node-local peer: the pad will carry it, never the CM
                    continue;
                }
                let progress = conn.progress((me.nid, me.pid), &*self.provider);
                if !progress.to_send.is_empty() || !progress.failed.is_empty() {
                    busy = true;
                }
                for (msg, transport) in progress.to_send {
                    self.send_on(ni, &transport, conn.id, msg.bytes);
                }
                for msg in progress.failed {
                    self.fail_init(msg.xfer_id);
                }
            }
        }

        // fabric inboxes, one per hosted endpoint
        let mut seen: Vec<(u32, u32)> = Vec::new();
        for ni in &nis {
            let me = ni.id();
            let addr = (me.nid, me.pid);
            if seen.contains(&addr) {
                continue;
            }
            seen.push(addr);
            while let Some((from, bytes)) = self.provider.recv(addr) {
                busy = true;
                let qp = match self.target_qp_for(ni, ProcessId::physical(from.0, from.1)) {
                    Ok(qp) => qp,
                    Err(_) => continue,
                };
                self.deliver(bytes, ReplyPath::Rdma(qp));
            }
        }

        busy |= self.reap_completions();
        self.retry_undelivered();
        self.sweep_graveyards();
        busy
    }

    fn retry_undelivered(&self) {
        let pending: Vec<(Vec<u8>, ReplyPath, u32)> =
            std::mem::take(&mut *self.undelivered.lock());
        for (bytes, reply, tries) in pending {
            let Ok((hdr, _)) = ops::msg_from_bytes(&bytes) else { continue };
            if self.find_target_ni(&hdr).is_some() {
                self.deliver(bytes, reply);
            } else if tries == 0 {
                warn!("dropping request for {:?}: NI never appeared", hdr.dst);
                self.send_reply(&hdr, MsgFail::Dropped, 0, &[], &reply);
            } else {
                self.undelivered.lock().push((bytes, reply, tries - 1));
            }
        }
    }

    fn sweep_graveyards(&self) {
        self.md_graveyard.lock().retain(|md| {
            if Arc::strong_count(md) == 1 {
                md.unmap(&*self.mapper);
                false
            } else {
                true
            }
        });
        self.entry_graveyard.lock().retain(|entry| {
            if Arc::strong_count(entry) == 1 {
                entry.unmap(&*self.mapper);
                false
            } else {
                true
            }
        });
    }

    /// The QP of our connection record towards `peer`, established
    /// passively if the peer reached us first. Inbound physical
    /// identities are tracked in the per-NI connection map even on a
    /// logical NI; the rank table only routes outbound.
    fn target_qp_for(&self, ni: &Arc<Ni>, peer: ProcessId) -> Result<Arc<dyn QueuePair>> {
        let conn = ni.conns.get(peer);
        if let Transport::Rdma(qp) = conn.transport() {
            return Ok(qp);
        }
        let me = ni.id();
        let qp = self.provider.connect((me.nid, me.pid), (peer.nid, peer.pid))?;
        if !conn.on_passive_request((me.nid, me.pid), qp.clone()) {
            // our own active attempt wins; wait for it
            if let Transport::Rdma(qp) = conn.transport() {
                return Ok(qp);
            }
        }
        for (msg, transport) in conn.take_pending() {
            self.send_on(ni, &transport, peer, msg.bytes);
        }
        Ok(qp)
    }

    fn threshold_for(&self, peer: (u32, u32)) -> Arc<CompThreshold> {
        self.thresholds.lock().entry(peer).or_default().clone()
    }

    // ---- message delivery ----------------------------------------------

    fn deliver(&self, bytes: Vec<u8>, reply: ReplyPath) {
        let Ok((hdr, data)) = ops::msg_from_bytes(&bytes) else {
            warn!("dropping malformed message");
            return;
        };
        match MsgKind::try_from(hdr.kind) {
            Ok(MsgKind::Request) => self.handle_request(hdr, data, reply),
            Ok(MsgKind::Reply) => self.handle_reply(hdr, data),
            Err(_) => warn!("dropping message with bad kind {}", hdr.kind),
        }
    }

    fn find_target_ni(&self, hdr: &MsgHdr) -> Option<Arc<Ni>> {
        let want_matching = hdr.ni_bits & NI_BIT_MATCHING != 0;
        let want_logical = hdr.ni_bits & NI_BIT_LOGICAL != 0;
        self.nis().into_iter().find(|ni| {
            let id = ni.id();
            ni.is_matching() == want_matching
                && ni.is_logical() == want_logical
                && id.nid == hdr.dst.nid
                && id.pid == hdr.dst.pid
        })
    }

    fn handle_request(&self, hdr: MsgHdr, data: &[u8], reply: ReplyPath) {
        let Some(ni) = self.find_target_ni(&hdr) else {
            // the peer resolved us before our client finished NIInit
            let bytes = ops::msg_to_bytes(&hdr, data);
            self.undelivered.lock().push((bytes, reply, UNDELIVERED_TRIES));
            return;
        };
        let Ok(op) = MsgOp::try_from(hdr.op) else {
            ni.sr_inc(SR_DROP_COUNT, 1);
            return;
        };
        ni.sr_inc(SR_RECV_COUNT, 1);
        ni.sr_inc(SR_RECV_BYTES, hdr.length);

        let matched = ops::find_match(&ni, hdr.pt_index, hdr.match_bits, hdr.src, op.deposits());
        let (entry, _handle, pt_eq) = match matched {
            Ok(found) => found,
            Err(fail) => {
                ni.sr_inc(SR_DROP_COUNT, 1);
                self.send_reply(&hdr, fail, 0, &[], &reply);
                return;
            }
        };
        if hdr.remote_offset > entry.length {
            ni.sr_inc(SR_DROP_COUNT, 1);
            self.send_reply(&hdr, MsgFail::Dropped, 0, &[], &reply);
            return;
        }
        if entry.options.contains(EntryOptions::USE_ONCE) && !entry.is_active() {
            // consumed by this match; release its imports once idle
            self.entry_graveyard.lock().push(entry.clone());
        }
        let mlength = hdr.length.min(entry.length - hdr.remote_offset);

        let Some(fmt) = DataFormat::from_repr(hdr.data_fmt) else {
            ni.sr_inc(SR_DROP_COUNT, 1);
            return;
        };
        match (op, fmt) {
            (MsgOp::Put, DataFormat::Inline) => {
                unsafe {
                    md::copy_to_segs(&entry.segs, hdr.remote_offset, &data[..mlength as usize])
                };
                self.finish_target(&ni, &entry, pt_eq, &hdr, mlength, &[], &reply);
            }
            (MsgOp::Put, DataFormat::MemIovec) => {
                if let Err(err) = self.copy_in_cookies(&entry, &hdr, data, mlength) {
                    warn!("cookie copy failed: {err}");
                    self.send_reply(&hdr, MsgFail::Dropped, 0, &[], &reply);
                    return;
                }
                self.finish_target(&ni, &entry, pt_eq, &hdr, mlength, &[], &reply);
            }
            (MsgOp::Put, DataFormat::Sge | DataFormat::IndirectSge)
            | (MsgOp::Get, DataFormat::Sge | DataFormat::IndirectSge) => {
                self.start_target_dma(ni, entry, pt_eq, hdr, data, mlength, op, fmt, reply);
            }
            (MsgOp::Get, DataFormat::Inline | DataFormat::None) => {
                let mut out = vec![0u8; mlength as usize];
                unsafe { md::copy_from_segs(&entry.segs, hdr.remote_offset, &mut out) };
                self.finish_target(&ni, &entry, pt_eq, &hdr, mlength, &out, &reply);
            }
            (MsgOp::Get, DataFormat::MemIovec) => {
                // write straight into the initiator's cookies
                let mut out = vec![0u8; mlength as usize];
                unsafe { md::copy_from_segs(&entry.segs, hdr.remote_offset, &mut out) };
                if let Err(err) = self.copy_out_cookies(&hdr, data, &out) {
                    warn!("cookie writeback failed: {err}");
                    self.send_reply(&hdr, MsgFail::Dropped, 0, &[], &reply);
                    return;
                }
                self.finish_target(&ni, &entry, pt_eq, &hdr, mlength, &[], &reply);
            }
            (MsgOp::Atomic | MsgOp::FetchAtomic | MsgOp::Swap, DataFormat::Inline) => {
                match self.apply_target_atomic(&entry, &hdr, data, mlength, op) {
                    Ok(old) => {
                        self.finish_target(&ni, &entry, pt_eq, &hdr, mlength, &old, &reply)
                    }
                    Err(err) => {
                        warn!("atomic failed at target: {err}");
                        ni.sr_inc(SR_DROP_COUNT, 1);
                        self.send_reply(&hdr, MsgFail::Dropped, 0, &[], &reply);
                    }
                }
            }
            _ => {
                ni.sr_inc(SR_DROP_COUNT, 1);
                self.send_reply(&hdr, MsgFail::Dropped, 0, &[], &reply);
            }
        }
    }

    fn copy_in_cookies(
        &self,
        entry: &MatchEntry,
        hdr: &MsgHdr,
        data: &[u8],
        mlength: u64,
    ) -> Result<()> {
        let mut dst_off = hdr.remote_offset;
        let mut left = mlength;
        for window in parse_cookies(data) {
            if left == 0 {
                break;
            }
            let take = window.len.min(left);
            let src = self.mapper.import(window.handle)?;
            let mut buf = vec![0u8; take as usize];
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.add(window.offset as usize),
                    buf.as_mut_ptr(),
                    take as usize,
                );
                md::copy_to_segs(&entry.segs, dst_off, &buf);
            }
            self.mapper.release(window.handle);
            dst_off += take;
            left -= take;
        }
        Ok(())
    }

    fn copy_out_cookies(&self, _hdr: &MsgHdr, data: &[u8], payload: &[u8]) -> Result<()> {
        let mut src_off = 0usize;
        for window in parse_cookies(data) {
            if src_off >= payload.len() {
                break;
            }
            let take = (window.len as usize).min(payload.len() - src_off);
            let dst = self.mapper.import(window.handle)?;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    payload.as_ptr().add(src_off),
                    dst.add(window.offset as usize),
                    take,
                );
            }
            self.mapper.release(window.handle);
            src_off += take;
        }
        Ok(())
    }

    fn apply_target_atomic(
        &self,
        entry: &MatchEntry,
        hdr: &MsgHdr,
        data: &[u8],
        mlength: u64,
        op: MsgOp,
    ) -> Result<Vec<u8>> {
        let atomic_op = AtomicOp::from_repr(hdr.atomic_op).ok_or(PtlError::InvalidArg)?;
        let dt = AtomicDatatype::from_repr(hdr.atomic_dt).ok_or(PtlError::InvalidArg)?;
        let len = mlength as usize;
        let mut tgt = vec![0u8; len];
        unsafe { md::copy_from_segs(&entry.segs, hdr.remote_offset, &mut tgt) };
        let old = if op.fetches() { tgt.clone() } else { Vec::new() };
        ops::apply_atomic(atomic_op, dt, &mut tgt, &data[..len], &hdr.operand)?;
        unsafe { md::copy_to_segs(&entry.segs, hdr.remote_offset, &tgt) };
        Ok(old)
    }

    #[allow(clippy::too_many_arguments)]
    fn start_target_dma(
        &self,
        ni: Arc<Ni>,
        entry: Arc<MatchEntry>,
        pt_eq: Handle,
        hdr: MsgHdr,
        data: &[u8],
        mlength: u64,
        op: MsgOp,
        fmt: DataFormat,
        reply: ReplyPath,
    ) {
        let dir = if op == MsgOp::Put { DataDir::In } else { DataDir::Out };
        let qp = match &reply {
            ReplyPath::Rdma(qp) => qp.clone(),
            ReplyPath::Shmem { .. } => {
                // DMA descriptors never arrive over the node-local path
                warn!("scatter/gather request on the shmem path, dropping");
                ni.sr_inc(SR_DROP_COUNT, 1);
                self.send_reply(&hdr, MsgFail::Dropped, 0, &[], &reply);
                return;
            }
        };
        let local = md::walk(&entry.segs, hdr.remote_offset, mlength);
        let xfer_id = self.next_xfer.fetch_add(1, Ordering::Relaxed);
        let xfer = if fmt == DataFormat::Sge {
            let sges = parse_sges(data);
            RdmaXfer::new(dir, mlength, sges, xfer_id)
        } else {
            let sges = parse_sges(data);
            let Some(window) = sges.first().copied() else {
                ni.sr_inc(SR_DROP_COUNT, 1);
                self.send_reply(&hdr, MsgFail::Dropped, 0, &[], &reply);
                return;
            };
            match RdmaXfer::new_indirect(dir, mlength, window, xfer_id, &ni.mr_table, &*qp)
            {
                Ok(xfer) => xfer,
                Err(err) => {
                    warn!("indirect descriptor fetch failed: {err}");
                    ni.sr_inc(SR_DROP_COUNT, 1);
                    self.send_reply(&hdr, MsgFail::Dropped, 0, &[], &reply);
                    return;
                }
            }
        };
        let mut top = TargetOp {
            ni,
            entry,
            pt_eq,
            xfer,
            local,
            qp,
            reply,
            hdr,
            mlength,
        };
        if !top.xfer.is_fetching_desc() {
            let threshold = self.threshold_for((top.hdr.src.nid, top.hdr.src.pid));
            if let Err(err) =
                top.xfer.process(&top.local, &top.ni.mr_table, &*top.qp, &threshold)
            {
                warn!("target dma failed to start: {err}");
                top.ni.sr_inc(SR_DROP_COUNT, 1);
                self.send_reply(&top.hdr, MsgFail::Dropped, 0, &[], &top.reply);
                return;
            }
        }
        if top.xfer.is_done() {
            self.finish_target(
                &top.ni, &top.entry, top.pt_eq, &top.hdr, top.mlength, &[], &top.reply,
            );
        } else {
            self.targets.lock().insert(top.xfer.wr_id, top);
        }
    }

    fn reap_completions(&self) -> bool {
        let mut busy = false;
        let mut completions: Vec<Completion> = Vec::new();
        let qps: Vec<(u64, Arc<dyn QueuePair>)> = {
            let targets = self.targets.lock();
            targets.iter().map(|(id, top)| (*id, top.qp.clone())).collect()
        };
        let mut polled: Vec<*const ()> = Vec::new();
        for (_, qp) in &qps {
            let key = Arc::as_ptr(qp) as *const ();
            if polled.contains(&key) {
                continue;
            }
            polled.push(key);
            qp.poll_cq(&mut completions);
        }
        for comp in completions {
            if comp.wr_id == 0 {
                // drain signal, no transfer attached
                continue;
            }
            busy = true;
            let mut targets = self.targets.lock();
            let Some(mut top) = targets.remove(&comp.wr_id) else { continue };
            drop(targets);
            top.xfer.on_completion();
            if !top.xfer.is_done() {
                let threshold = self.threshold_for((top.hdr.src.nid, top.hdr.src.pid));
                if let Err(err) =
                    top.xfer.process(&top.local, &top.ni.mr_table, &*top.qp, &threshold)
                {
                    warn!("target dma failed mid-flight: {err}");
                    self.send_reply(&top.hdr, MsgFail::Dropped, 0, &[], &top.reply);
                    continue;
                }
            }
            if top.xfer.is_done() {
                self.finish_target(
                    &top.ni, &top.entry, top.pt_eq, &top.hdr, top.mlength, &[], &top.reply,
                );
            } else {
                self.targets.lock().insert(top.xfer.wr_id, top);
            }
        }
        busy
    }

    /// Target-side epilogue: counting event, full event, reply.
    #[allow(clippy::too_many_arguments)]
    fn finish_target(
        &self,
        ni: &Arc<Ni>,
        entry: &Arc<MatchEntry>,
        pt_eq: Handle,
        hdr: &MsgHdr,
        mlength: u64,
        reply_data: &[u8],
        reply: &ReplyPath,
    ) {
        let op = MsgOp::try_from(hdr.op).unwrap_or(MsgOp::Put);
        let wants_ct = if op.deposits() {
            entry.options.contains(EntryOptions::EVENT_CT_PUT)
        } else {
            entry.options.contains(EntryOptions::EVENT_CT_GET)
        };
        if wants_ct && !entry.ct_handle.is_none() {
            if let Ok(ct) = ni.cts.get(entry.ct_handle) {
                let actions = ct.add(CtEvent { success: 1, failure: 0 });
                self.run_actions(actions);
            }
        }
        if !entry.options.contains(EntryOptions::EVENT_DISABLE)
            && !entry.options.contains(EntryOptions::EVENT_SUCCESS_DISABLE)
            && !pt_eq.is_none()
        {
            let kind = match op {
                MsgOp::Put => EventKind::Put,
                MsgOp::Get => EventKind::Get,
                MsgOp::Atomic => EventKind::Atomic,
                MsgOp::FetchAtomic | MsgOp::Swap => EventKind::FetchAtomic,
            };
            let mut event = Event::new(kind);
            event.initiator = if hdr.ni_bits & NI_BIT_LOGICAL != 0 {
                ProcessId::logical(hdr.src.rank)
            } else {
                ProcessId::physical(hdr.src.nid, hdr.src.pid)
            };
            event.pt_index = hdr.pt_index;
            event.match_bits = hdr.match_bits;
            event.rlength = hdr.length;
            event.mlength = mlength;
            event.remote_offset = hdr.remote_offset;
            event.start = entry.start + hdr.remote_offset;
            event.user_ptr = entry.user_ptr;
            event.hdr_data = hdr.hdr_data;
            self.post_eq(ni, pt_eq, event);
        }
        self.send_reply(hdr, MsgFail::Ok, mlength, reply_data, reply);
    }

    fn post_eq(&self, ni: &Arc<Ni>, eq_handle: Handle, event: Event) {
        if let Ok(eq) = ni.eqs.get(eq_handle) {
            if !eq.push(event) {
                trace!("event queue full, event dropped");
            }
        }
    }

    fn send_reply(
        &self,
        hdr: &MsgHdr,
        fail: MsgFail,
        mlength: u64,
        data: &[u8],
        reply: &ReplyPath,
    ) {
        let mut rhdr = *hdr;
        rhdr.kind = MsgKind::Reply.into();
        rhdr.fail = fail.into();
        rhdr.length = mlength;
        rhdr.data_fmt = if data.is_empty() {
            DataFormat::None.into()
        } else {
            DataFormat::Inline.into()
        };
        std::mem::swap(&mut rhdr.src, &mut rhdr.dst);
        let bytes = ops::msg_to_bytes(&rhdr, data);
        match reply {
            ReplyPath::Rdma(qp) => {
                if qp.send_message(bytes).is_err() {
                    warn!("reply send failed");
                }
            }
            ReplyPath::Shmem { via, dest } => {
                if let Err(err) = via.send(*dest, &bytes) {
                    warn!("shmem reply failed: {err}");
                }
            }
        }
    }

    // ---- initiator completion ------------------------------------------

    fn handle_reply(&self, hdr: MsgHdr, data: &[u8]) {
        let Some(iop) = self.inits.lock().remove(&hdr.xfer_id) else {
            warn!("reply for unknown transfer {}", hdr.xfer_id);
            return;
        };
        if iop.op.is_atomic() {
            if let Some(client) = self.clients.lock().get_mut(&iop.cookie) {
                client.outstanding_atomics = client.outstanding_atomics.saturating_sub(1);
            }
        }
        let fail = MsgFail::try_from(hdr.fail).unwrap_or(MsgFail::Dropped);
        if fail != MsgFail::Ok {
            self.account_failure(&iop, fail);
            return;
        }
        if iop.op.fetches() && !data.is_empty() {
            unsafe { md::copy_to_segs(&iop.md.segs, iop.local_offset, data) };
        }
        self.post_initiator_success(&iop, hdr.length);
    }

    /// Initiator-side events on success: send/ack accounting on the
    /// put-side descriptor, reply accounting on the fetch destination.
    fn post_initiator_success(&self, iop: &InitOp, mlength: u64) {
        let put_side = iop.put_md.as_ref().unwrap_or(&iop.md);
        if iop.op.deposits() {
            let mut inc = 0u64;
            if put_side.options.contains(MdOptions::EVENT_CT_SEND) {
                inc += 1;
            }
            if put_side.options.contains(MdOptions::EVENT_CT_ACK)
                && iop.ack_req != AckReq::NoAck
            {
                inc += 1;
            }
            if inc > 0 && !put_side.ct_handle.is_none() {
                if let Ok(ct) = iop.ni.cts.get(put_side.ct_handle) {
                    let actions = ct.add(CtEvent { success: inc, failure: 0 });
                    self.run_actions(actions);
                }
            }
            if !put_side.options.contains(MdOptions::EVENT_DISABLE)
                && !put_side.options.contains(MdOptions::EVENT_SUCCESS_DISABLE)
                && !put_side.eq_handle.is_none()
            {
                let mut event = Event::new(EventKind::Send);
                event.mlength = mlength;
                event.rlength = iop.length;
                event.user_ptr = iop.user_ptr;
                self.post_eq(&iop.ni, put_side.eq_handle, event);
                if iop.ack_req == AckReq::Ack {
                    let mut ack = Event::new(EventKind::Ack);
                    ack.mlength = mlength;
                    ack.user_ptr = iop.user_ptr;
                    self.post_eq(&iop.ni, put_side.eq_handle, ack);
                }
            }
        }
        if iop.op.fetches() {
            if iop.md.options.contains(MdOptions::EVENT_CT_REPLY)
                && !iop.md.ct_handle.is_none()
            {
                if let Ok(ct) = iop.ni.cts.get(iop.md.ct_handle) {
                    let actions = ct.add(CtEvent { success: 1, failure: 0 });
                    self.run_actions(actions);
                }
            }
            if !iop.md.options.contains(MdOptions::EVENT_DISABLE)
                && !iop.md.options.contains(MdOptions::EVENT_SUCCESS_DISABLE)
                && !iop.md.eq_handle.is_none()
            {
                let mut event = Event::new(EventKind::Reply);
                event.mlength = mlength;
                event.user_ptr = iop.user_ptr;
                self.post_eq(&iop.ni, iop.md.eq_handle, event);
            }
        }
    }

    fn account_failure(&self, iop: &InitOp, fail: MsgFail) {
        debug!("transfer failed at peer: {fail:?}");
        iop.ni.sr_inc(SR_FAIL_COUNT, 1);
        let put_side = iop.put_md.as_ref().unwrap_or(&iop.md);
        if !put_side.ct_handle.is_none() {
            if let Ok(ct) = iop.ni.cts.get(put_side.ct_handle) {
                let actions = ct.add(CtEvent { success: 0, failure: 1 });
                self.run_actions(actions);
            }
        }
        if !put_side.options.contains(MdOptions::EVENT_DISABLE)
            && !put_side.eq_handle.is_none()
        {
            let mut event = Event::new(if iop.op.fetches() {
                EventKind::Reply
            } else {
                EventKind::Ack
            });
            event.fail = match fail {
                MsgFail::PtDisabled => NiFail::PtDisabled,
                MsgFail::NoMatch | MsgFail::Dropped => NiFail::Dropped,
                MsgFail::Ok => NiFail::Ok,
            };
            event.user_ptr = iop.user_ptr;
            self.post_eq(&iop.ni, put_side.eq_handle, event);
        }
    }

    /// A queued message died with its connection: `NetworkFailure`.
    fn fail_init(&self, xfer_id: u64) {
        let Some(iop) = self.inits.lock().remove(&xfer_id) else { return };
        if iop.op.is_atomic() {
            if let Some(client) = self.clients.lock().get_mut(&iop.cookie) {
                client.outstanding_atomics = client.outstanding_atomics.saturating_sub(1);
            }
        }
        warn!("transfer {xfer_id} failed: peer unreachable");
        self.account_failure(&iop, MsgFail::Dropped);
    }
}

/// `TriggeredCtInc`/`TriggeredCtSet` parameter block layout: the `CtCmd`
/// head plus the trigger pair.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TriggeredCtCmd {
    pub ct: CtCmd,
    pub trig_ct_handle: u64,
    pub threshold: u64,
}

impl TriggeredCtCmd {
    fn trigger(&self) -> (u64, u64, u64) {
        (self.trig_ct_handle, self.threshold, self.ct.handle)
    }
}

fn msg_op_of(op: OpCode) -> MsgOp {
    match op {
        OpCode::Put | OpCode::TriggeredPut => MsgOp::Put,
        OpCode::Get | OpCode::TriggeredGet => MsgOp::Get,
        OpCode::Atomic | OpCode::TriggeredAtomic => MsgOp::Atomic,
        OpCode::FetchAtomic | OpCode::TriggeredFetchAtomic => MsgOp::FetchAtomic,
        OpCode::Swap | OpCode::TriggeredSwap => MsgOp::Swap,
        _ => unreachable!("not a data operation"),
    }
}

fn plain_op_of(op: OpCode) -> OpCode {
    match op {
        OpCode::TriggeredPut => OpCode::Put,
        OpCode::TriggeredGet => OpCode::Get,
        OpCode::TriggeredAtomic => OpCode::Atomic,
        OpCode::TriggeredFetchAtomic => OpCode::FetchAtomic,
        OpCode::TriggeredSwap => OpCode::Swap,
        other => other,
    }
}

fn sge_bytes(sge: &Sge) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(sge as *const Sge as *const u8, std::mem::size_of::<Sge>())
    }
}

fn parse_sges(data: &[u8]) -> Vec<Sge> {
    data.chunks_exact(std::mem::size_of::<Sge>())
        .map(|chunk| {
            let mut sge = Sge::default();
            unsafe {
                std::ptr::copy_nonoverlapping(
                    chunk.as_ptr(),
                    &mut sge as *mut Sge as *mut u8,
                    std::mem::size_of::<Sge>(),
                );
            }
            sge
        })
        .collect()
}

fn parse_cookies(data: &[u8]) -> Vec<CookieWindow> {
    data.chunks_exact(std::mem::size_of::<MemIovec>())
        .map(|chunk| {
            let mut iov = MemIovec::default();
            unsafe {
                std::ptr::copy_nonoverlapping(
                    chunk.as_ptr(),
                    &mut iov as *mut MemIovec as *mut u8,
                    std::mem::size_of::<MemIovec>(),
                );
            }
            CookieWindow {
                handle: SegmentHandle { id: iov.cookie.get(), len: 0 },
                offset: iov.offset.get(),
                len: iov.length.get(),
            }
        })
        .collect()
}
