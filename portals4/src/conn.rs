//! Connection records and the rank table. A connection walks
//! `Disconnected → ResolvingAddr → ResolvingRoute → Connect → Connecting →
//! Connected`, retrying each resolution stage up to a cap; work submitted
//! before it is up queues on the record and is drained, in order, the
//! moment it connects. Exhausting the retries fails everything queued and
//! drops the record back to `Disconnected` so a later attempt can start
//! clean.
//!
//! In logical mode one rank per NID, the one with the lowest PID, owns the
//! node's cross-node connection; co-located ranks route through it.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, trace, warn};
use portals_types::{Nid, Pid, ProcessId, PtlError, Rank, Result};
use spin::Mutex;

use crate::params::params;
use crate::verbs::{PeerAddr, QueuePair, RdmaProvider};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    ResolvingAddr,
    ResolvingRoute,
    Connect,
    Connecting,
    Connected,
}

#[derive(Clone)]
pub enum Transport {
    None,
    Rdma(Arc<dyn QueuePair>),
    /// Peer is on this node; its slot in the shared-memory pad.
    Shmem { local_index: u32 },
}

/// A queued outbound message plus what the PPE needs to account a failure
/// against if the peer never comes up.
pub struct OutMsg {
    pub bytes: Vec<u8>,
    /// Initiator-side transfer id; names the pending operation whose CT/EQ
    /// records a terminal failure.
    pub xfer_id: u64,
}

struct ConnInner {
    state: ConnState,
    transport: Transport,
    retry_resolve_addr: u32,
    retry_resolve_route: u32,
    retry_connect: u32,
    pending_init: Vec<OutMsg>,
    pending_target: Vec<OutMsg>,
}

pub struct Conn {
    /// Peer identity; NID and PID are set for both addressing modes.
    pub id: ProcessId,
    inner: Mutex<ConnInner>,
    /// For a non-main logical rank: the main rank's record, which carries
    /// the real transport.
    pub main: Option<Arc<Conn>>,
}

/// What a progress tick decided: messages now sendable and messages that
/// failed terminally.
#[derive(Default)]
pub struct Progress {
    pub to_send: Vec<(OutMsg, Transport)>,
    pub failed: Vec<OutMsg>,
}

impl Conn {
    pub fn new(id: ProcessId, main: Option<Arc<Conn>>) -> Arc<Conn> {
        let retries = params().connect_retry_max;
        Arc::new(Conn {
            id,
            inner: Mutex::new(ConnInner {
                state: ConnState::Disconnected,
                transport: Transport::None,
                retry_resolve_addr: retries,
                retry_resolve_route: retries,
                retry_connect: retries,
                pending_init: Vec::new(),
                pending_target: Vec::new(),
            }),
            main,
        })
    }

    pub fn state(&self) -> ConnState {
        self.inner.lock().state
    }

    pub fn transport(&self) -> Transport {
        self.inner.lock().transport.clone()
    }

    /// Force an established transport, used when the peer is reached over
    /// shared memory and no CM exchange happens at all.
    pub fn set_connected(&self, transport: Transport) {
        let mut inner = self.inner.lock();
        inner.transport = transport;
        inner.state = ConnState::Connected;
    }

    /// Hand a message to the connection. Returns the transport to send on
    /// when already connected; otherwise the message queues and the state
    /// machine is started.
    pub fn submit(&self, msg: OutMsg, from_init: bool) -> Option<Transport> {
        let mut inner = self.inner.lock();
        if inner.state == ConnState::Connected {
            return Some(inner.transport.clone());
        }
        if from_init {
            inner.pending_init.push(msg);
        } else {
            inner.pending_target.push(msg);
        }
        if inner.state == ConnState::Disconnected {
            inner.state = ConnState::ResolvingAddr;
            trace!("connection to {:?} entering address resolution", self.id);
        }
        None
    }

    fn fail_all(inner: &mut ConnInner, id: ProcessId) -> Vec<OutMsg> {
        warn!("connection to {id:?} failed; dropping queued work");
        let retries = params().connect_retry_max;
        inner.state = ConnState::Disconnected;
        inner.transport = Transport::None;
        inner.retry_resolve_addr = retries;
        inner.retry_resolve_route = retries;
        inner.retry_connect = retries;
        let mut failed: Vec<OutMsg> = inner.pending_init.drain(..).collect();
        failed.extend(inner.pending_target.drain(..));
        failed
    }

    fn drain(inner: &mut ConnInner) -> Vec<(OutMsg, Transport)> {
        let transport = inner.transport.clone();
        inner
            .pending_init
            .drain(..)
            .chain(inner.pending_target.drain(..))
            .map(|msg| (msg, transport.clone()))
            .collect()
    }

    /// Advance the state machine one step. Called from the PPE progress
    /// loop; never blocks on the fabric lock while holding the record.
    pub fn progress(&self, local: PeerAddr, provider: &dyn RdmaProvider) -> Progress {
        let mut out = Progress::default();
        let mut inner = self.inner.lock();
        match inner.state {
            ConnState::Disconnected | ConnState::Connected => {}
            ConnState::ResolvingAddr => match provider.resolve_addr(self.id.nid) {
                Ok(()) => inner.state = ConnState::ResolvingRoute,
                Err(_) => {
                    inner.retry_resolve_addr -= 1;
                    if inner.retry_resolve_addr == 0 {
                        out.failed = Self::fail_all(&mut inner, self.id);
                    }
                }
            },
            ConnState::ResolvingRoute => match provider.resolve_route(self.id.nid) {
                Ok(()) => inner.state = ConnState::Connect,
                Err(_) => {
                    inner.retry_resolve_route -= 1;
                    if inner.retry_resolve_route == 0 {
                        out.failed = Self::fail_all(&mut inner, self.id);
                    }
                }
            },
            ConnState::Connect => {
                match provider.connect(local, (self.id.nid, self.id.pid)) {
                    Ok(qp) => {
                        inner.transport = Transport::Rdma(qp);
                        inner.state = ConnState::Connecting;
                    }
                    Err(_) => {
                        inner.retry_connect -= 1;
                        if inner.retry_connect == 0 {
                            out.failed = Self::fail_all(&mut inner, self.id);
                        }
                    }
                }
            }
            ConnState::Connecting => {
                // the fabric acks as soon as the QP pair exists
                inner.state = ConnState::Connected;
                debug!("connection to {:?} established", self.id);
                out.to_send = Self::drain(&mut inner);
            }
        }
        out
    }

    /// A peer's simultaneous active connect reached us while our own
    /// attempt is in flight. The lower `(NID, PID)` keeps its active
    /// connection; the higher side accepts the passive one and abandons
    /// its own. Returns whether the offer was accepted.
    pub fn on_passive_request(
        &self,
        local: PeerAddr,
        offered: Arc<dyn QueuePair>,
    ) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            ConnState::Connected => false,
            ConnState::Disconnected => {
                inner.transport = Transport::Rdma(offered);
                inner.state = ConnState::Connected;
                true
            }
            _ => {
                let remote = (self.id.nid, self.id.pid);
                if local < remote {
                    // we win; reject the passive offer and keep going
                    false
                } else {
                    debug!("yielding to simultaneous connect from {:?}", self.id);
                    inner.transport = Transport::Rdma(offered);
                    inner.state = ConnState::Connected;
                    true
                }
            }
        }
    }

    /// Pull everything queued once a passive accept established the
    /// connection.
    pub fn take_pending(&self) -> Vec<(OutMsg, Transport)> {
        let mut inner = self.inner.lock();
        if inner.state == ConnState::Connected {
            Self::drain(&mut inner)
        } else {
            Vec::new()
        }
    }
}

/// One logical rank's row.
pub struct RankEntry {
    pub rank: Rank,
    pub nid: Nid,
    pub pid: Pid,
    pub main_rank: Rank,
    /// Remote XRC SRQ number learned during rank-table exchange.
    pub xrc_srq_num: u32,
    pub conn: Arc<Conn>,
}

/// The rank → `(NID, PID, main_rank)` table of a logical NI.
pub struct RankTable {
    entries: Vec<RankEntry>,
}

impl RankTable {
    /// Build the table and elect each NID's main rank, the lowest PID on
    /// that NID. Non-main ranks get a record backed by the main rank's.
    pub fn build(map: &[ProcessId]) -> RankTable {
        let mut main_of: HashMap<Nid, (Pid, Rank)> = HashMap::new();
        for (rank, id) in map.iter().enumerate() {
            let best = main_of.entry(id.nid).or_insert((id.pid, rank as Rank));
            if id.pid < best.0 {
                *best = (id.pid, rank as Rank);
            }
        }
        // the main connections first, so every co-located rank shares one
        let mains: HashMap<Nid, Arc<Conn>> = main_of
            .iter()
            .map(|(&nid, &(pid, main_rank))| {
                (nid, Conn::new(ProcessId { nid, pid, rank: main_rank }, None))
            })
            .collect();
        let entries = map
            .iter()
            .enumerate()
            .map(|(rank, id)| {
                let (_, main_rank) = main_of[&id.nid];
                let conn = if rank as Rank == main_rank {
                    mains[&id.nid].clone()
                } else {
                    let peer = ProcessId { nid: id.nid, pid: id.pid, rank: rank as Rank };
                    Conn::new(peer, Some(mains[&id.nid].clone()))
                };
                RankEntry {
                    rank: rank as Rank,
                    nid: id.nid,
                    pid: id.pid,
                    main_rank,
                    xrc_srq_num: 0,
                    conn,
                }
            })
            .collect();
        RankTable { entries }
    }

    pub fn get(&self, rank: Rank) -> Result<&RankEntry> {
        self.entries.get(rank as usize).ok_or(PtlError::InvalidArg)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn mapping(&self) -> Vec<ProcessId> {
        self.entries
            .iter()
            .map(|entry| ProcessId::physical(entry.nid, entry.pid))
            .collect()
    }

    /// The connection actually carrying traffic for `rank`.
    pub fn route(&self, rank: Rank) -> Result<Arc<Conn>> {
        let entry = self.get(rank)?;
        Ok(entry.conn.main.clone().unwrap_or_else(|| entry.conn.clone()))
    }
}

/// Physical-mode connection set, keyed by peer `(NID, PID)`.
pub struct ConnMap {
    conns: Mutex<HashMap<PeerAddr, Arc<Conn>>>,
}

impl ConnMap {
    pub fn new() -> ConnMap {
        ConnMap { conns: Mutex::new(HashMap::new()) }
    }

    pub fn get(&self, id: ProcessId) -> Arc<Conn> {
        let mut conns = self.conns.lock();
        conns
            .entry((id.nid, id.pid))
            .or_insert_with(|| Conn::new(id, None))
            .clone()
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<Conn>)) {
        for conn in self.conns.lock().values() {
            f(conn);
        }
    }
}
