//! End-to-end tests of two ranks sharing a node: every transfer here
//! rides the shared-memory pad.

use std::sync::{Arc, Barrier};

use portals4::ppe::{Ppe, PpeConfig};
use portals4::types::{
    AckReq, AtomicDatatype, AtomicOp, CtEvent, EntryOptions, EventKind, Handle, ListKind,
    MdOptions, NiOptions, ProcessId,
};
use portals4::verbs::LoopbackFabric;
use portals4::{EntryDesc, LocalMapper, MdDesc, Portals, SegmentMapper};

struct Node {
    _ppe: portals4::ppe::PpeHandle,
    pad: String,
    mapper: Arc<LocalMapper>,
}

fn node(tag: &str, nid: u32, base_pid: u32) -> Node {
    let _ = env_logger::builder().is_test(true).try_init();
    let pad = format!("/portals4-test-{tag}-{}", std::process::id());
    let mapper = Arc::new(LocalMapper::new(4096));
    let fabric = LoopbackFabric::new();
    let ppe = Ppe::start(
        PpeConfig { pad_name: pad.clone(), nid, base_pid },
        mapper.clone() as Arc<dyn SegmentMapper>,
        fabric,
    )
    .unwrap();
    Node { _ppe: ppe, pad, mapper }
}

fn logical_ni(portals: &Portals, pid: u32, map: &[ProcessId]) -> Handle {
    let (ni, _) = portals
        .ni_init(NiOptions::NO_MATCHING | NiOptions::LOGICAL, pid, None)
        .unwrap();
    portals.set_map(ni, map).unwrap();
    ni
}

/// One rank's half of the potato loop. Rank 0 throws then waits, rank 1
/// waits then throws back; each rank ends up with `loops` sends and
/// `loops` receives.
fn run_potato(
    portals: &Portals,
    ni: Handle,
    rank: u32,
    loops: u64,
    barrier: &Barrier,
) -> (CtEvent, CtEvent) {
    let pt = portals.pt_alloc(ni, Default::default(), Handle::NONE, 0).unwrap();
    assert_eq!(pt, 0);
    let mut potato: f64 = 42.0;
    let potato_addr = &mut potato as *mut f64 as u64;

    let catcher_ct = portals.ct_alloc(ni).unwrap();
    let catcher = unsafe {
        portals
            .le_append(
                ni,
                pt,
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

    let launcher_ct = portals.ct_alloc(ni).unwrap();
    let launcher = unsafe {
        portals
            .md_bind(
                ni,
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

    // both catchers must be posted before the first throw
    barrier.wait();

    let other = ProcessId::logical(1 - rank);
    for k in 1..=loops {
        if rank == 0 {
            portals
                .put(launcher, 0, 8, AckReq::OcAck, other, pt, 0, 0, 0, k)
                .unwrap();
            let ct = portals.ct_wait(catcher_ct, k).unwrap();
            assert_eq!(ct.failure, 0);
        } else {
            let ct = portals.ct_wait(catcher_ct, k).unwrap();
            assert_eq!(ct.failure, 0);
            portals
                .put(launcher, 0, 8, AckReq::OcAck, other, pt, 0, 0, 0, k)
                .unwrap();
        }
    }
    let send = portals.ct_wait(launcher_ct, loops).unwrap();
    let recv = portals.ct_wait(catcher_ct, loops).unwrap();

    portals.md_release(launcher).unwrap();
    portals.le_unlink(catcher).unwrap();
    (send, recv)
}

#[test]
fn two_rank_potato() {
    const LOOPS: u64 = 1000;
    let n = node("potato", 7, 100);
    let map = [ProcessId::physical(7, 2000), ProcessId::physical(7, 2001)];

    let barrier = Arc::new(Barrier::new(2));
    let worker = {
        let pad = n.pad.clone();
        let mapper = n.mapper.clone();
        let barrier = barrier.clone();
        std::thread::spawn(move || {
            let portals = Portals::connect(&pad, mapper).unwrap();
            let ni = logical_ni(&portals, 2001, &map);
            run_potato(&portals, ni, 1, LOOPS, &barrier)
        })
    };
    let portals = Portals::connect(&n.pad, n.mapper.clone()).unwrap();
    let ni = logical_ni(&portals, 2000, &map);
    let (send, recv) = run_potato(&portals, ni, 0, LOOPS, &barrier);
    let (peer_send, peer_recv) = worker.join().unwrap();

    for ct in [send, recv, peer_send, peer_recv] {
        assert_eq!(ct.success, LOOPS);
        assert_eq!(ct.failure, 0);
    }
}

#[test]
fn megabyte_put_rides_the_pad() {
    const LEN: usize = 1 << 20;
    let n = node("bigput", 9, 100);
    let map = [ProcessId::physical(9, 3000), ProcessId::physical(9, 3001)];

    let mut sink = vec![0u8; LEN];
    let sink_addr = sink.as_mut_ptr() as u64;
    let barrier = Arc::new(Barrier::new(2));
    let worker = {
        let pad = n.pad.clone();
        let mapper = n.mapper.clone();
        let barrier = barrier.clone();
        std::thread::spawn(move || {
            let portals = Portals::connect(&pad, mapper).unwrap();
            let ni = logical_ni(&portals, 3001, &map);
            let pt = portals.pt_alloc(ni, Default::default(), Handle::NONE, 0).unwrap();
            let ct = portals.ct_alloc(ni).unwrap();
            unsafe {
                portals
                    .le_append(
                        ni,
                        pt,
                        &EntryDesc {
                            start: sink_addr,
                            length: LEN as u64,
                            options: EntryOptions::OP_PUT | EntryOptions::EVENT_CT_PUT,
                            ct_handle: ct,
                            match_bits: 0,
                            ignore_bits: 0,
                        },
                        ListKind::Priority,
                        0,
                    )
                    .unwrap();
            }
            barrier.wait();
            let got = portals.ct_wait(ct, 1).unwrap();
            assert_eq!(got.failure, 0);
        })
    };

    let portals = Portals::connect(&n.pad, n.mapper.clone()).unwrap();
    let ni = logical_ni(&portals, 3000, &map);
    let payload: Vec<u8> = (0..LEN).map(|i| (i % 251) as u8).collect();
    let ct = portals.ct_alloc(ni).unwrap();
    let md = unsafe {
        portals
            .md_bind(
                ni,
                &MdDesc {
                    start: payload.as_ptr() as u64,
                    length: LEN as u64,
                    options: MdOptions::EVENT_CT_SEND,
                    eq_handle: Handle::NONE,
                    ct_handle: ct,
                },
            )
            .unwrap()
    };
    barrier.wait();
    portals
        .put(md, 0, LEN as u64, AckReq::CtAck, ProcessId::logical(1), 0, 0, 0, 0, 0)
        .unwrap();
    let sent = portals.ct_wait(ct, 1).unwrap();
    assert_eq!(sent.failure, 0);
    worker.join().unwrap();
    assert_eq!(sink, payload, "payload must arrive bit-exact over the pad");
}

#[test]
fn fetch_atomic_and_swap_round_trip() {
    let n = node("fetsw", 11, 100);
    let map = [ProcessId::physical(11, 4000), ProcessId::physical(11, 4001)];

    let mut counter: u64 = 100;
    let counter_addr = &mut counter as *mut u64 as u64;
    let barrier = Arc::new(Barrier::new(2));
    let worker = {
        let pad = n.pad.clone();
        let mapper = n.mapper.clone();
        let barrier = barrier.clone();
        std::thread::spawn(move || {
            let portals = Portals::connect(&pad, mapper).unwrap();
            let ni = logical_ni(&portals, 4001, &map);
            let pt = portals.pt_alloc(ni, Default::default(), Handle::NONE, 0).unwrap();
            let ct = portals.ct_alloc(ni).unwrap();
            unsafe {
                portals
                    .le_append(
                        ni,
                        pt,
                        &EntryDesc {
                            start: counter_addr,
                            length: 8,
                            options: EntryOptions::OP_PUT
                                | EntryOptions::OP_GET
                                | EntryOptions::EVENT_CT_PUT,
                            ct_handle: ct,
                            match_bits: 0,
                            ignore_bits: 0,
                        },
                        ListKind::Priority,
                        0,
                    )
                    .unwrap();
            }
            barrier.wait();
            // one fetch-add and one swap land here
            let got = portals.ct_wait(ct, 2).unwrap();
            assert_eq!(got.failure, 0);
            // hold the entry open for the closing get
            barrier.wait();
        })
    };

    let portals = Portals::connect(&n.pad, n.mapper.clone()).unwrap();
    let ni = logical_ni(&portals, 4000, &map);
    let mut fetched: u64 = 0;
    let addend: u64 = 5;
    let get_ct = portals.ct_alloc(ni).unwrap();
    let get_md = unsafe {
        portals
            .md_bind(
                ni,
                &MdDesc {
                    start: &mut fetched as *mut u64 as u64,
                    length: 8,
                    options: MdOptions::EVENT_CT_REPLY,
                    eq_handle: Handle::NONE,
                    ct_handle: get_ct,
                },
            )
            .unwrap()
    };
    let put_md = unsafe {
        portals
            .md_bind(
                ni,
                &MdDesc {
                    start: &addend as *const u64 as u64,
                    length: 8,
                    options: MdOptions::empty(),
                    eq_handle: Handle::NONE,
                    ct_handle: Handle::NONE,
                },
            )
            .unwrap()
    };

    barrier.wait();
    portals
        .fetch_atomic(
            get_md,
            0,
            put_md,
            0,
            8,
            ProcessId::logical(1),
            0,
            0,
            0,
            0,
            0,
            AtomicOp::Sum,
            AtomicDatatype::U64,
        )
        .unwrap();
    let replied = portals.ct_wait(get_ct, 1).unwrap();
    assert_eq!(replied.failure, 0);
    assert_eq!(fetched, 100, "fetch returns the pre-add value");

    // swap the (now 105) counter for the addend, fetching the old value
    portals
        .swap(
            get_md,
            0,
            put_md,
            0,
            8,
            ProcessId::logical(1),
            0,
            0,
            0,
            0,
            0,
            None,
            AtomicOp::Swap,
            AtomicDatatype::U64,
        )
        .unwrap();
    let replied = portals.ct_wait(get_ct, 2).unwrap();
    assert_eq!(replied.failure, 0);
    assert_eq!(fetched, 105);
    portals.atomic_sync().unwrap();

    // a plain get reads the final value back
    portals
        .get(get_md, 0, 8, ProcessId::logical(1), 0, 0, 0, 0)
        .unwrap();
    let replied = portals.ct_wait(get_ct, 3).unwrap();
    assert_eq!(replied.failure, 0);
    assert_eq!(fetched, 5);

    barrier.wait();
    worker.join().unwrap();
    assert_eq!(counter, 5, "swap leaves the swapped-in value behind");
}

#[test]
fn triggered_put_fires_on_threshold_and_cancel_prevents() {
    let n = node("trig", 13, 100);
    let map = [ProcessId::physical(13, 5000), ProcessId::physical(13, 5001)];

    let barrier = Arc::new(Barrier::new(2));
    let worker = {
        let pad = n.pad.clone();
        let mapper = n.mapper.clone();
        let barrier = barrier.clone();
        std::thread::spawn(move || {
            let portals = Portals::connect(&pad, mapper).unwrap();
            let ni = logical_ni(&portals, 5001, &map);
            let pt = portals.pt_alloc(ni, Default::default(), Handle::NONE, 0).unwrap();
            let mut sink: u64 = 0;
            let ct = portals.ct_alloc(ni).unwrap();
            unsafe {
                portals
                    .le_append(
                        ni,
                        pt,
                        &EntryDesc {
                            start: &mut sink as *mut u64 as u64,
                            length: 8,
                            options: EntryOptions::OP_PUT | EntryOptions::EVENT_CT_PUT,
                            ct_handle: ct,
                            match_bits: 0,
                            ignore_bits: 0,
                        },
                        ListKind::Priority,
                        0,
                    )
                    .unwrap();
            }
            barrier.wait();
            // the threshold-3 trigger plus the closing plain put
            let got = portals.ct_wait(ct, 2).unwrap();
            assert_eq!(got.failure, 0);
            got.success
        })
    };

    let portals = Portals::connect(&n.pad, n.mapper.clone()).unwrap();
    let ni = logical_ni(&portals, 5000, &map);
    let payload: u64 = 7;
    let send_ct = portals.ct_alloc(ni).unwrap();
    let md = unsafe {
        portals
            .md_bind(
                ni,
                &MdDesc {
                    start: &payload as *const u64 as u64,
                    length: 8,
                    options: MdOptions::EVENT_CT_SEND,
                    eq_handle: Handle::NONE,
                    ct_handle: send_ct,
                },
            )
            .unwrap()
    };
    let trig_ct = portals.ct_alloc(ni).unwrap();

    barrier.wait();
    // fires once trig_ct reaches 3; a second one at 100 gets canceled
    portals
        .triggered_put(
            md, 0, 8, AckReq::CtAck, ProcessId::logical(1), 0, 0, 0, 0, 0, trig_ct, 3,
        )
        .unwrap();
    portals
        .triggered_put(
            md, 0, 8, AckReq::CtAck, ProcessId::logical(1), 0, 0, 0, 0, 0, trig_ct, 100,
        )
        .unwrap();

    // a single increment of 5 crosses the threshold of 3
    portals.ct_inc(trig_ct, CtEvent { success: 5, failure: 0 }).unwrap();
    let sent = portals.ct_wait(send_ct, 1).unwrap();
    assert_eq!(sent.failure, 0);

    // the 100-threshold trigger must die with the cancel
    portals.ct_cancel_triggered(trig_ct).unwrap();
    portals.ct_inc(trig_ct, CtEvent { success: 200, failure: 0 }).unwrap();

    // prove it never fired: send one plain put and watch the target stop
    // at exactly two arrivals
    portals
        .put(md, 0, 8, AckReq::CtAck, ProcessId::logical(1), 0, 0, 0, 0, 0)
        .unwrap();
    let landed = worker.join().unwrap();
    assert_eq!(landed, 2);
}

#[test]
fn events_flow_through_the_rings() {
    let n = node("events", 19, 100);
    let map = [ProcessId::physical(19, 7000), ProcessId::physical(19, 7001)];

    let barrier = Arc::new(Barrier::new(2));
    let worker = {
        let pad = n.pad.clone();
        let mapper = n.mapper.clone();
        let barrier = barrier.clone();
        std::thread::spawn(move || {
            let portals = Portals::connect(&pad, mapper).unwrap();
            let ni = logical_ni(&portals, 7001, &map);
            let eq = portals.eq_alloc(ni, 16).unwrap();
            let pt = portals.pt_alloc(ni, Default::default(), eq, 0).unwrap();
            let mut sink: u64 = 0;
            unsafe {
                portals
                    .le_append(
                        ni,
                        pt,
                        &EntryDesc {
                            start: &mut sink as *mut u64 as u64,
                            length: 8,
                            options: EntryOptions::OP_PUT,
                            ct_handle: Handle::NONE,
                            match_bits: 0,
                            ignore_bits: 0,
                        },
                        ListKind::Priority,
                        0xfeed,
                    )
                    .unwrap();
            }
            barrier.wait();
            let (event, dropped) = portals.eq_wait(eq).unwrap();
            assert!(!dropped);
            assert_eq!(event.kind, EventKind::Put);
            assert_eq!(event.initiator, ProcessId::logical(0));
            assert_eq!(event.rlength, 8);
            assert_eq!(event.mlength, 8);
            assert_eq!(event.user_ptr, 0xfeed);
            assert_eq!(event.hdr_data, 0xabcd);
            sink
        })
    };

    let portals = Portals::connect(&n.pad, n.mapper.clone()).unwrap();
    let ni = logical_ni(&portals, 7000, &map);
    let eq = portals.eq_alloc(ni, 16).unwrap();
    let payload: u64 = 31;
    let md = unsafe {
        portals
            .md_bind(
                ni,
                &MdDesc {
                    start: &payload as *const u64 as u64,
                    length: 8,
                    options: MdOptions::empty(),
                    eq_handle: eq,
                    ct_handle: Handle::NONE,
                },
            )
            .unwrap()
    };
    barrier.wait();
    portals
        .put(md, 0, 8, AckReq::Ack, ProcessId::logical(1), 0, 0, 0, 0x11, 0xabcd)
        .unwrap();
    // a full acknowledgement produces a send event then an ack event
    let (event, _) = portals.eq_wait(eq).unwrap();
    assert_eq!(event.kind, EventKind::Send);
    assert_eq!(event.user_ptr, 0x11);
    let (event, _) = portals.eq_wait(eq).unwrap();
    assert_eq!(event.kind, EventKind::Ack);
    assert!(portals.eq_get(eq).unwrap().is_none());
    assert_eq!(worker.join().unwrap(), 31);
}

#[test]
fn get_map_returns_installed_mapping() {
    let n = node("map", 17, 100);
    let map = [ProcessId::physical(17, 6000), ProcessId::physical(17, 6001)];
    let worker = {
        let pad = n.pad.clone();
        let mapper = n.mapper.clone();
        std::thread::spawn(move || {
            let portals = Portals::connect(&pad, mapper).unwrap();
            logical_ni(&portals, 6001, &map);
        })
    };
    let portals = Portals::connect(&n.pad, n.mapper.clone()).unwrap();
    let ni = logical_ni(&portals, 6000, &map);
    let mut out = [ProcessId::default(); 4];
    let actual = portals.get_map(ni, &mut out).unwrap();
    assert_eq!(actual, 2);
    assert_eq!(&out[..2], &map);
    // installing a second time is an error
    assert!(portals.set_map(ni, &map).is_err());
    assert_eq!(portals.get_id(ni).unwrap(), ProcessId::logical(0));
    let phys = portals.get_phys_id(ni).unwrap();
    assert_eq!((phys.nid, phys.pid), (17, 6000));
    worker.join().unwrap();
}
