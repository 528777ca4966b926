//! Per-interface state: limits, the portal table, the object arenas, the
//! registered-region table and the connection machinery for both
//! addressing modes. Everything an operation touches hangs off its NI.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};

use log::{debug, warn};
use portals_types::{
    Handle, NiLimits, NiOptions, ObjType, ProcessId, PtlError, Rank, Result,
};
use spin::Mutex;

use crate::conn::{Conn, ConnMap, RankTable, Transport};
use crate::ct::Ct;
use crate::eq::Eq;
use crate::md::Md;
use crate::me::MatchEntry;
use crate::mr::MrTable;
use crate::obj::Arena;
use crate::pt::PortalTable;
use crate::shmem::{self, ShmemTransport};
use crate::verbs::RdmaProvider;

/// Status registers reported by `NIStatus`.
pub const SR_DROP_COUNT: u64 = 0;
pub const SR_RECV_COUNT: u64 = 1;
pub const SR_RECV_BYTES: u64 = 2;
pub const SR_FAIL_COUNT: u64 = 3;
const SR_LAST: usize = 4;

/// The node-local transport comes up in the background so installing a
/// map never stalls the command pump of the process driving it.
pub enum ShmemState {
    Down,
    Starting(mpsc::Receiver<Result<ShmemTransport>>),
    Up(Arc<ShmemTransport>),
}

pub struct Ni {
    /// Slot of this NI within its owning client (two handle bits).
    pub index: u8,
    pub cookie: u64,
    pub options: NiOptions,
    pub limits: NiLimits,
    id: Mutex<ProcessId>,
    status: [AtomicU64; SR_LAST],
    pub pt: PortalTable,
    pub mds: Arena<Md>,
    pub les: Arena<MatchEntry>,
    pub mes: Arena<MatchEntry>,
    pub cts: Arena<Ct>,
    pub eqs: Arena<Eq>,
    pub mr_table: MrTable,
    /// Installed rank map, logical NIs only, exactly once.
    rank_table: Mutex<Option<Arc<RankTable>>>,
    /// Physical-mode peer connections, also target-side inbound records.
    pub conns: ConnMap,
    pub shmem: Mutex<ShmemState>,
}

impl Ni {
    pub fn new(
        index: u8,
        cookie: u64,
        options: NiOptions,
        desired: Option<&NiLimits>,
        id: ProcessId,
        provider: Arc<dyn RdmaProvider>,
    ) -> Result<Ni> {
        if !options.is_valid_kind() {
            return Err(PtlError::InvalidArg);
        }
        let maxima = NiLimits::default();
        let limits = match desired {
            Some(desired) => maxima.clamp(desired),
            None => maxima,
        };
        Ok(Ni {
            index,
            cookie,
            options,
            limits,
            id: Mutex::new(id),
            status: Default::default(),
            pt: PortalTable::new(limits.max_pt_index),
            mds: Arena::new(index, ObjType::Md, limits.max_mds),
            les: Arena::new(index, ObjType::Le, limits.max_entries),
            mes: Arena::new(index, ObjType::Me, limits.max_entries),
            cts: Arena::new(index, ObjType::Ct, limits.max_cts),
            eqs: Arena::new(index, ObjType::Eq, limits.max_eqs),
            mr_table: MrTable::new(provider),
            rank_table: Mutex::new(None),
            conns: ConnMap::new(),
            shmem: Mutex::new(ShmemState::Down),
        })
    }

    pub fn is_logical(&self) -> bool {
        self.options.contains(NiOptions::LOGICAL)
    }

    pub fn is_matching(&self) -> bool {
        self.options.contains(NiOptions::MATCHING)
    }

    pub fn id(&self) -> ProcessId {
        *self.id.lock()
    }

    pub fn sr_inc(&self, register: u64, amount: u64) {
        if let Some(sr) = self.status.get(register as usize) {
            sr.fetch_add(amount, Ordering::Relaxed);
        }
    }

    pub fn sr_read(&self, register: u64) -> Result<u64> {
        self.status
            .get(register as usize)
            .map(|sr| sr.load(Ordering::Relaxed))
            .ok_or(PtlError::InvalidArg)
    }

    /// Install the rank map: build the table, elect main ranks, learn our
    /// own rank, and kick off the node-local pad in the background.
    pub fn set_map(&self, map: &[ProcessId]) -> Result<()> {
        if !self.is_logical() || map.is_empty() {
            return Err(PtlError::InvalidArg);
        }
        let mut installed = self.rank_table.lock();
        if installed.is_some() {
            return Err(PtlError::InvalidArg);
        }
        let table = Arc::new(RankTable::build(map));

        let me = self.id();
        let my_rank = map
            .iter()
            .position(|id| id.nid == me.nid && id.pid == me.pid)
            .ok_or(PtlError::InvalidArg)? as Rank;
        self.id.lock().rank = my_rank;

        // node-local peers, in rank order; my slot in the pad
        let locals: Vec<Rank> = (0..map.len() as Rank)
            .filter(|rank| map[*rank as usize].nid == me.nid)
            .collect();
        let index = locals.iter().position(|rank| *rank == my_rank).unwrap() as u32;
        let node_size = locals.len() as u32;
        let pairs: Vec<(u32, u32)> = map.iter().map(|id| (id.nid, id.pid)).collect();
        let name = shmem::logical_pad_name(shmem::map_hash(&pairs), self.options.bits());

        let (tx, rx) = mpsc::channel();
        let id = (me.nid, me.pid);
        std::thread::spawn(move || {
            let _ = tx.send(ShmemTransport::setup(&name, index, node_size, id));
        });
        *self.shmem.lock() = ShmemState::Starting(rx);
        *installed = Some(table);
        debug!(
            "rank map installed: {} ranks, I am rank {my_rank} (pad slot {index}/{node_size})",
            map.len()
        );
        Ok(())
    }

    pub fn rank_table(&self) -> Result<Arc<RankTable>> {
        self.rank_table.lock().clone().ok_or(PtlError::NoInit)
    }

    pub fn has_map(&self) -> bool {
        self.rank_table.lock().is_some()
    }

    /// Bring up the physical-mode pad: one slot, connected to ourselves.
    pub fn setup_phys_shmem(&self) -> Result<()> {
        let me = self.id();
        let name = shmem::phys_pad_name(me.pid, self.options.bits());
        let transport =
            Arc::new(ShmemTransport::setup(&name, 0, 1, (me.nid, me.pid))?);
        let conn = self.conns.get(me);
        conn.set_connected(Transport::Shmem { local_index: 0 });
        *self.shmem.lock() = ShmemState::Up(transport);
        Ok(())
    }

    /// Finish a pending pad setup if its thread is done. On success the
    /// connections of node-local peers are switched over to it.
    pub fn poll_shmem(&self) -> Option<Arc<ShmemTransport>> {
        let mut state = self.shmem.lock();
        let outcome = match &*state {
            ShmemState::Up(transport) => return Some(transport.clone()),
            ShmemState::Down => return None,
            ShmemState::Starting(rx) => rx.try_recv(),
        };
        match outcome {
            Ok(Ok(transport)) => {
                let transport = Arc::new(transport);
                *state = ShmemState::Up(transport.clone());
                drop(state);
                self.connect_local_ranks(&transport);
                Some(transport)
            }
            Ok(Err(err)) => {
                warn!("node-local pad setup failed: {err}");
                *state = ShmemState::Down;
                None
            }
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => {
                *state = ShmemState::Down;
                None
            }
        }
    }

    fn connect_local_ranks(&self, transport: &Arc<ShmemTransport>) {
        let Ok(table) = self.rank_table() else { return };
        let me = self.id();
        let mut local_index = 0u32;
        for rank in 0..table.len() as Rank {
            let entry = table.get(rank).unwrap();
            if entry.nid != me.nid {
                continue;
            }
            entry
                .conn
                .set_connected(Transport::Shmem { local_index });
            local_index += 1;
        }
        debug!("switched {local_index} node-local ranks onto the pad");
    }

    /// The connection carrying traffic to `target`. Node-local ranks keep
    /// their own record, which the pad switch-over marks connected;
    /// off-node ranks consolidate onto their NID's main-rank connection.
    pub fn route(&self, target: ProcessId) -> Result<Arc<Conn>> {
        if self.is_logical() {
            let table = self.rank_table()?;
            let entry = table.get(target.rank)?;
            if entry.nid == self.id().nid {
                return Ok(entry.conn.clone());
            }
            table.route(target.rank)
        } else {
            Ok(self.conns.get(target))
        }
    }

    /// Physical `(nid, pid)` of a target in this NI's addressing mode.
    pub fn resolve_target(&self, target: ProcessId) -> Result<ProcessId> {
        if self.is_logical() {
            let table = self.rank_table()?;
            let entry = table.get(target.rank)?;
            Ok(ProcessId { nid: entry.nid, pid: entry.pid, rank: target.rank })
        } else {
            Ok(target)
        }
    }

    /// Objects still live in any arena, checked before finalize.
    pub fn live_objects(&self) -> usize {
        self.mds.live() + self.les.live() + self.mes.live() + self.cts.live() + self.eqs.live()
    }

    pub fn handle(&self) -> Handle {
        Handle::new(self.index, ObjType::Ni, 1, self.cookie as u32)
    }
}
