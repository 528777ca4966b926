//! Round-trip latency runner. Every rank bootstraps over a physical
//! interface by sending its identity to the collector rank, which gathers
//! the full mapping and hands it back; the ranks then bring up a logical
//! interface and pass an 8-byte potato around the ring, timing the waits.
//!
//! Configuration comes from the environment:
//! `PORTALS4_NUM_PROCS` ranks (default 2), `PORTALS4_COLLECTOR_NID` /
//! `PORTALS4_COLLECTOR_PID` naming the collector (defaults match the
//! built-in single-node setup), `PORTALS4_LOOPS` round trips.

use std::sync::{Arc, Barrier};

use log::info;
use portals4::ppe::{Ppe, PpeConfig};
use portals4::types::{
    AckReq, CtEvent, EntryOptions, Handle, ListKind, MdOptions, NiOptions, ProcessId,
};
use portals4::verbs::LoopbackFabric;
use portals4::{EntryDesc, LocalMapper, MdDesc, Portals, SegmentMapper};

const BASE_PID: u32 = 1000;
/// Portal index the collector gathers identities on.
const GATHER_PT: u32 = 1;

fn env_or(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn main() {
    env_logger::init();
    let num_procs = env_or("PORTALS4_NUM_PROCS", 2) as u32;
    let loops = env_or("PORTALS4_LOOPS", 1000);
    let nid = env_or("PORTALS4_COLLECTOR_NID", 1) as u32;
    let collector = ProcessId::physical(
        nid,
        env_or("PORTALS4_COLLECTOR_PID", BASE_PID as u64) as u32,
    );

    let pad = format!("/portals4-latency-{}", std::process::id());
    let mapper = Arc::new(LocalMapper::new(16384));
    let fabric = LoopbackFabric::new();
    let _ppe = Ppe::start(
        PpeConfig { pad_name: pad.clone(), nid, base_pid: BASE_PID },
        mapper.clone() as Arc<dyn SegmentMapper>,
        fabric,
    )
    .expect("failed to start the engine");

    // stands in for the launcher's start-up ordering: nobody sends until
    // every rank has its bootstrap entries posted, and the potato waits
    // for every logical interface
    let bootstrap = Arc::new(Barrier::new(num_procs as usize));
    let ring_ready = Arc::new(Barrier::new(num_procs as usize));
    let mut ranks = Vec::new();
    for rank in 0..num_procs {
        let pad = pad.clone();
        let mapper = mapper.clone();
        let bootstrap = bootstrap.clone();
        let ring_ready = ring_ready.clone();
        ranks.push(std::thread::spawn(move || {
            run_rank(rank, num_procs, collector, &pad, mapper, loops, &bootstrap, &ring_ready)
        }));
    }
    for rank in ranks {
        rank.join().expect("rank panicked");
    }
}

fn check_no_failures(ct: CtEvent) {
    assert_eq!(ct.failure, 0, "counting event reports failures: {ct:?}");
}

#[allow(clippy::too_many_arguments)]
fn run_rank(
    rank: u32,
    num_procs: u32,
    collector: ProcessId,
    pad: &str,
    mapper: Arc<LocalMapper>,
    loops: u64,
    bootstrap: &Barrier,
    ring_ready: &Barrier,
) {
    let portals = Portals::connect(pad, mapper).expect("connect failed");

    // physical interface for the bootstrap
    let (ni_physical, _) = portals
        .ni_init(NiOptions::NO_MATCHING | NiOptions::PHYSICAL, BASE_PID + rank, None)
        .unwrap();
    let myself = portals.get_phys_id(ni_physical).unwrap();
    let pt = portals
        .pt_alloc(ni_physical, Default::default(), Handle::NONE, 0)
        .unwrap();
    assert_eq!(pt, 0);

    // receive the gathered mapping here
    let mut dmapping = vec![ProcessId::default(); num_procs as usize];
    let map_ct = portals.ct_alloc(ni_physical).unwrap();
    let map_le = unsafe {
        portals
            .le_append(
                ni_physical,
                0,
                &EntryDesc {
                    start: dmapping.as_mut_ptr() as u64,
                    length: (num_procs as usize * std::mem::size_of::<ProcessId>()) as u64,
                    options: EntryOptions::OP_PUT | EntryOptions::EVENT_CT_PUT,
                    ct_handle: map_ct,
                    match_bits: 0,
                    ignore_bits: 0,
                },
                ListKind::Priority,
                0,
            )
            .unwrap()
    };

    if myself == collector {
        // gather everyone's identity on its own portal index, then
        // scatter the full mapping back through index 0
        let mut gathered = vec![ProcessId::default(); num_procs as usize];
        let gather_ct = portals.ct_alloc(ni_physical).unwrap();
        let gather_pt = portals
            .pt_alloc(ni_physical, Default::default(), Handle::NONE, GATHER_PT)
            .unwrap();
        let gather_le = unsafe {
            portals
                .le_append(
                    ni_physical,
                    gather_pt,
                    &EntryDesc {
                        start: gathered.as_mut_ptr() as u64,
                        length: (num_procs as usize * std::mem::size_of::<ProcessId>())
                            as u64,
                        options: EntryOptions::OP_PUT | EntryOptions::EVENT_CT_PUT,
                        ct_handle: gather_ct,
                        match_bits: 0,
                        ignore_bits: 0,
                    },
                    ListKind::Priority,
                    0,
                )
                .unwrap()
        };
        bootstrap.wait();
        send_identity(&portals, ni_physical, myself, collector, rank);
        check_no_failures(portals.ct_wait(gather_ct, num_procs as u64).unwrap());

        let scatter_md = unsafe {
            portals
                .md_bind(
                    ni_physical,
                    &MdDesc {
                        start: gathered.as_ptr() as u64,
                        length: (num_procs as usize * std::mem::size_of::<ProcessId>())
                            as u64,
                        options: MdOptions::EVENT_DISABLE | MdOptions::EVENT_CT_SEND,
                        eq_handle: Handle::NONE,
                        ct_handle: portals.ct_alloc(ni_physical).unwrap(),
                    },
                )
                .unwrap()
        };
        for peer in &gathered {
            portals
                .put(
                    scatter_md,
                    0,
                    (num_procs as usize * std::mem::size_of::<ProcessId>()) as u64,
                    AckReq::OcAck,
                    *peer,
                    0,
                    0,
                    0,
                    0,
                    0,
                )
                .unwrap();
        }
        portals.le_unlink(gather_le).ok();
        portals.md_release(scatter_md).ok();
    } else {
        bootstrap.wait();
        send_identity(&portals, ni_physical, myself, collector, rank);
    }

    // wait for the mapping, feed it into a logical interface
    check_no_failures(portals.ct_wait(map_ct, 1).unwrap());
    portals.le_unlink(map_le).ok();
    portals.ct_free(map_ct).ok();

    let (ni_logical, _) = portals
        .ni_init(NiOptions::NO_MATCHING | NiOptions::LOGICAL, BASE_PID + rank, None)
        .unwrap();
    portals.set_map(ni_logical, &dmapping).unwrap();
    let me = portals.get_id(ni_logical).unwrap();
    assert_eq!(me.rank, rank);
    let logical_pt = portals
        .pt_alloc(ni_logical, Default::default(), Handle::NONE, 0)
        .unwrap();

    // the potato ring
    let mut accumulate: f64 = 0.0;
    let potato_addr = &mut accumulate as *mut f64 as u64;
    let catcher_ct = portals.ct_alloc(ni_logical).unwrap();
    unsafe {
        portals
            .le_append(
                ni_logical,
                logical_pt,
                &EntryDesc {
                    start: potato_addr,
                    length: 8,
                    options: EntryOptions::OP_PUT | EntryOptions::EVENT_CT_PUT,
                    ct_handle: catcher_ct,
                    match_bits: 0,
                    ignore_bits: 0,
                },
                ListKind::Priority,
                0,
            )
            .unwrap()
    };
    let launcher_ct = portals.ct_alloc(ni_logical).unwrap();
    let launcher = unsafe {
        portals
            .md_bind(
                ni_logical,
                &MdDesc {
                    start: potato_addr,
                    length: 8,
                    options: MdOptions::EVENT_DISABLE | MdOptions::EVENT_CT_SEND,
                    eq_handle: Handle::NONE,
                    ct_handle: launcher_ct,
                },
            )
            .unwrap()
    };

    // bootstrap is done, the physical interface can go
    portals.pt_free(ni_physical, 0).ok();
    portals.ni_fini(ni_physical).ok();

    // every logical interface is up before the first throw
    ring_ready.wait();

    // rank 0 starts the potato going
    let nextrank = ProcessId::logical((rank + 1) % num_procs);
    let start = std::time::Instant::now();
    if rank == 0 {
        portals
            .put(launcher, 0, 8, AckReq::OcAck, nextrank, logical_pt, 0, 0, 0, 1)
            .unwrap();
    }
    let mut waited = std::time::Duration::ZERO;
    let mut waitfor: u64 = 1;
    while waitfor < loops {
        let wait_start = std::time::Instant::now();
        check_no_failures(portals.ct_wait(catcher_ct, waitfor).unwrap());
        waited += wait_start.elapsed();
        waitfor += 1;
        // I have the potato! Bomb's away!
        portals
            .put(launcher, 0, 8, AckReq::OcAck, nextrank, logical_pt, 0, 0, 0, 2)
            .unwrap();
    }
    // make sure the last send completed before tearing down
    check_no_failures(portals.ct_wait(launcher_ct, waitfor - 1).unwrap());
    if rank == 0 {
        // the final potato, untimed
        check_no_failures(portals.ct_wait(catcher_ct, 1).unwrap());
        let total = start.elapsed();
        info!("total time: {:.6} s", total.as_secs_f64());
        println!("Total time spent waiting: {:.6} secs", waited.as_secs_f64());
        println!(
            "Average time spent waiting: {:.9} secs",
            waited.as_secs_f64() / (loops * num_procs as u64) as f64
        );
    }
    portals.ni_fini(ni_logical).ok();
}

fn send_identity(
    portals: &Portals,
    ni: Handle,
    myself: ProcessId,
    collector: ProcessId,
    rank: u32,
) {
    let md_ct = portals.ct_alloc(ni).unwrap();
    let md = unsafe {
        portals
            .md_bind(
                ni,
                &MdDesc {
                    start: &myself as *const ProcessId as u64,
                    length: std::mem::size_of::<ProcessId>() as u64,
                    options: MdOptions::EVENT_DISABLE | MdOptions::EVENT_CT_SEND,
                    eq_handle: Handle::NONE,
                    ct_handle: md_ct,
                },
            )
            .unwrap()
    };
    portals
        .put(
            md,
            0,
            std::mem::size_of::<ProcessId>() as u64,
            AckReq::OcAck,
            collector,
            GATHER_PT,
            0,
            (rank as u64) * std::mem::size_of::<ProcessId>() as u64,
            0,
            0,
        )
        .unwrap();
    check_no_failures(portals.ct_wait(md_ct, 1).unwrap());
    portals.md_release(md).ok();
    portals.ct_free(md_ct).ok();
}
