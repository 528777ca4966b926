//! End-to-end tests of ranks on different nodes: one engine per NID, all
//! reached over the loopback verbs fabric, so every payload here moves by
//! one-sided reads and writes.

use std::sync::{Arc, Barrier};

use portals4::ppe::{Ppe, PpeConfig, PpeHandle};
use portals4::types::{
    AckReq, AtomicDatatype, AtomicOp, EntryOptions, Handle, IoVec, ListKind, MdOptions,
    NiOptions, ProcessId, PtlError,
};
use portals4::verbs::LoopbackFabric;
use portals4::{EntryDesc, LocalMapper, MdDesc, Portals, SegmentMapper};

/// Two single-rank nodes on one fabric and one memory-sharing facility.
struct Cluster {
    _ppes: Vec<PpeHandle>,
    pads: Vec<String>,
    mapper: Arc<LocalMapper>,
    fabric: Arc<LoopbackFabric>,
}

fn cluster(tag: &str, nids: &[u32]) -> Cluster {
    let _ = env_logger::builder().is_test(true).try_init();
    let mapper = Arc::new(LocalMapper::new(16384));
    let fabric = LoopbackFabric::new();
    let mut ppes = Vec::new();
    let mut pads = Vec::new();
    for nid in nids {
        let pad = format!("/portals4-test-{tag}{nid}-{}", std::process::id());
        ppes.push(
            Ppe::start(
                PpeConfig { pad_name: pad.clone(), nid: *nid, base_pid: 500 },
                mapper.clone() as Arc<dyn SegmentMapper>,
                fabric.clone(),
            )
            .unwrap(),
        );
        pads.push(pad);
    }
    Cluster { _ppes: ppes, pads, mapper, fabric }
}

fn rank(c: &Cluster, node: usize, options: NiOptions, pid: u32, map: &[ProcessId]) -> (Arc<Portals>, Handle) {
    let portals = Portals::connect(&c.pads[node], c.mapper.clone()).unwrap();
    let (ni, _) = portals.ni_init(options, pid, None).unwrap();
    portals.set_map(ni, map).unwrap();
    (portals, ni)
}

const LOGICAL: NiOptions = NiOptions::NO_MATCHING.union(NiOptions::LOGICAL);
const LOGICAL_MATCHING: NiOptions = NiOptions::MATCHING.union(NiOptions::LOGICAL);

#[test]
fn cross_node_put_pulls_over_the_fabric() {
    const LEN: usize = 8192; // above the inline threshold
    let c = cluster("xput", &[21, 22]);
    let map = [ProcessId::physical(21, 700), ProcessId::physical(22, 701)];

    let mut sink = vec![0u8; LEN];
    let sink_addr = sink.as_mut_ptr() as u64;
    let barrier = Arc::new(Barrier::new(2));
    let target = {
        let c_pad = c.pads[1].clone();
        let mapper = c.mapper.clone();
        let barrier = barrier.clone();
        std::thread::spawn(move || {
            let portals = Portals::connect(&c_pad, mapper).unwrap();
            let (ni, _) = portals.ni_init(LOGICAL, 701, None).unwrap();
            portals.set_map(ni, &map).unwrap();
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

    let (portals, ni) = rank(&c, 0, LOGICAL, 700, &map);
    let payload: Vec<u8> = (0..LEN).map(|i| (i * 7 % 256) as u8).collect();
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
    target.join().unwrap();
    assert_eq!(sink, payload);
}

#[test]
fn indirect_iovec_put_into_contiguous_entry() {
    // 40 iovec elements of 4 KiB exceed the inline SGE capacity, so the
    // target reads the descriptor first
    const ELEMS: usize = 40;
    const ELEM_LEN: usize = 4096;
    let c = cluster("xiov", &[31, 32]);
    let map = [ProcessId::physical(31, 710), ProcessId::physical(32, 711)];

    let mut sink = vec![0u8; ELEMS * ELEM_LEN];
    let sink_addr = sink.as_mut_ptr() as u64;
    let barrier = Arc::new(Barrier::new(2));
    let target = {
        let c_pad = c.pads[1].clone();
        let mapper = c.mapper.clone();
        let barrier = barrier.clone();
        std::thread::spawn(move || {
            let portals = Portals::connect(&c_pad, mapper).unwrap();
            let (ni, _) = portals.ni_init(LOGICAL_MATCHING, 711, None).unwrap();
            portals.set_map(ni, &map).unwrap();
            let pt = portals.pt_alloc(ni, Default::default(), Handle::NONE, 0).unwrap();
            let ct = portals.ct_alloc(ni).unwrap();
            unsafe {
                portals
                    .me_append(
                        ni,
                        pt,
                        &EntryDesc {
                            start: sink_addr,
                            length: (ELEMS * ELEM_LEN) as u64,
                            options: EntryOptions::OP_PUT | EntryOptions::EVENT_CT_PUT,
                            ct_handle: ct,
                            match_bits: 0x77,
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

    let (portals, ni) = rank(&c, 0, LOGICAL_MATCHING, 710, &map);
    let mut elems: Vec<Vec<u8>> = (0..ELEMS)
        .map(|e| (0..ELEM_LEN).map(|i| ((e * 31 + i) % 256) as u8).collect())
        .collect();
    let iov: Vec<IoVec> = elems
        .iter_mut()
        .map(|e| IoVec { base: e.as_mut_ptr() as u64, len: ELEM_LEN as u64 })
        .collect();
    let ct = portals.ct_alloc(ni).unwrap();
    let md = unsafe {
        portals
            .md_bind(
                ni,
                &MdDesc {
                    start: iov.as_ptr() as u64,
                    length: ELEMS as u64,
                    options: MdOptions::IOVEC | MdOptions::EVENT_CT_SEND,
                    eq_handle: Handle::NONE,
                    ct_handle: ct,
                },
            )
            .unwrap()
    };
    barrier.wait();
    portals
        .put(
            md,
            0,
            (ELEMS * ELEM_LEN) as u64,
            AckReq::CtAck,
            ProcessId::logical(1),
            0,
            0x77,
            0,
            0,
            0,
        )
        .unwrap();
    let sent = portals.ct_wait(ct, 1).unwrap();
    assert_eq!(sent.failure, 0);
    target.join().unwrap();

    let flat: Vec<u8> = elems.concat();
    assert_eq!(sink, flat, "scattered source must arrive bit-exact");
}

#[test]
fn sixteen_thread_atomic_sum() {
    const THREADS: u64 = 16;
    let c = cluster("xsum", &[41, 42]);
    let map = [ProcessId::physical(41, 720), ProcessId::physical(42, 721)];

    let mut value: u64 = 1000;
    let value_addr = &mut value as *mut u64 as u64;
    let barrier = Arc::new(Barrier::new(2));
    let target = {
        let c_pad = c.pads[1].clone();
        let mapper = c.mapper.clone();
        let barrier = barrier.clone();
        std::thread::spawn(move || {
            let portals = Portals::connect(&c_pad, mapper).unwrap();
            let (ni, _) = portals.ni_init(LOGICAL, 721, None).unwrap();
            portals.set_map(ni, &map).unwrap();
            let pt = portals.pt_alloc(ni, Default::default(), Handle::NONE, 0).unwrap();
            let ct = portals.ct_alloc(ni).unwrap();
            unsafe {
                portals
                    .le_append(
                        ni,
                        pt,
                        &EntryDesc {
                            start: value_addr,
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
            let got = portals.ct_wait(ct, THREADS).unwrap();
            assert_eq!(got.failure, 0);
            got.success
        })
    };

    let (portals, ni) = rank(&c, 0, LOGICAL, 720, &map);
    let one: u64 = 1;
    let send_ct = portals.ct_alloc(ni).unwrap();
    let md = unsafe {
        portals
            .md_bind(
                ni,
                &MdDesc {
                    start: &one as *const u64 as u64,
                    length: 8,
                    options: MdOptions::EVENT_CT_SEND,
                    eq_handle: Handle::NONE,
                    ct_handle: send_ct,
                },
            )
            .unwrap()
    };

    barrier.wait();
    let mut joins = Vec::new();
    for _ in 0..THREADS {
        let portals = portals.clone();
        joins.push(std::thread::spawn(move || {
            portals
                .atomic(
                    md,
                    0,
                    8,
                    AckReq::CtAck,
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
        }));
    }
    for join in joins {
        join.join().unwrap();
    }
    portals.atomic_sync().unwrap();
    let success = target.join().unwrap();
    assert_eq!(success, THREADS);
    let sent = portals.ct_wait(send_ct, THREADS).unwrap();
    assert_eq!(sent.failure, 0);
    assert_eq!(value, 1000 + THREADS);
}

#[test]
fn swap_rejects_float_cswap_before_enqueue() {
    let c = cluster("xrej", &[51]);
    let map = [ProcessId::physical(51, 730)];
    let (portals, ni) = rank(&c, 0, LOGICAL, 730, &map);

    let mut a: f32 = 1.0;
    let b: f32 = 2.0;
    let ct = portals.ct_alloc(ni).unwrap();
    let get_md = unsafe {
        portals
            .md_bind(
                ni,
                &MdDesc {
                    start: &mut a as *mut f32 as u64,
                    length: 4,
                    options: MdOptions::EVENT_CT_REPLY,
                    eq_handle: Handle::NONE,
                    ct_handle: ct,
                },
            )
            .unwrap()
    };
    let put_md = unsafe {
        portals
            .md_bind(
                ni,
                &MdDesc {
                    start: &b as *const f32 as u64,
                    length: 4,
                    options: MdOptions::empty(),
                    eq_handle: Handle::NONE,
                    ct_handle: Handle::NONE,
                },
            )
            .unwrap()
    };
    let err = portals.swap(
        get_md,
        0,
        put_md,
        0,
        4,
        ProcessId::logical(0),
        0,
        0,
        0,
        0,
        0,
        Some(&1.0f32.to_ne_bytes()),
        AtomicOp::Cswap,
        AtomicDatatype::Float,
    );
    assert_eq!(err, Err(PtlError::InvalidArg));
    // nothing was enqueued: the counters never move
    let ct_now = portals.ct_get(ct).unwrap();
    assert_eq!((ct_now.success, ct_now.failure), (0, 0));
}

#[test]
fn connection_retry_exhaustion_then_recovery() {
    let c = cluster("xretry", &[61, 62]);
    let map = [ProcessId::physical(61, 740), ProcessId::physical(62, 741)];

    let mut sink: u64 = 0;
    let sink_addr = &mut sink as *mut u64 as u64;
    let barrier = Arc::new(Barrier::new(2));
    let target = {
        let c_pad = c.pads[1].clone();
        let mapper = c.mapper.clone();
        let barrier = barrier.clone();
        std::thread::spawn(move || {
            let portals = Portals::connect(&c_pad, mapper).unwrap();
            let (ni, _) = portals.ni_init(LOGICAL, 741, None).unwrap();
            portals.set_map(ni, &map).unwrap();
            let pt = portals.pt_alloc(ni, Default::default(), Handle::NONE, 0).unwrap();
            let ct = portals.ct_alloc(ni).unwrap();
            unsafe {
                portals
                    .le_append(
                        ni,
                        pt,
                        &EntryDesc {
                            start: sink_addr,
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
            let got = portals.ct_wait(ct, 1).unwrap();
            assert_eq!(got.failure, 0);
        })
    };

    // every address resolution towards nid 62 fails until the retries
    // run out
    let retries = portals4::params().connect_retry_max;
    c.fabric.fail_resolve_addr(62, retries);

    let (portals, ni) = rank(&c, 0, LOGICAL, 740, &map);
    let payload: u64 = 9;
    let ct = portals.ct_alloc(ni).unwrap();
    let md = unsafe {
        portals
            .md_bind(
                ni,
                &MdDesc {
                    start: &payload as *const u64 as u64,
                    length: 8,
                    options: MdOptions::EVENT_CT_SEND,
                    eq_handle: Handle::NONE,
                    ct_handle: ct,
                },
            )
            .unwrap()
    };
    barrier.wait();
    portals
        .put(md, 0, 8, AckReq::CtAck, ProcessId::logical(1), 0, 0, 0, 0, 0)
        .unwrap();
    // the failed connection lands in the CT's failure field
    let after = portals.ct_wait(ct, 1).unwrap();
    assert_eq!(after.failure, 1);
    assert_eq!(after.success, 0);

    // the peer is reachable now; the next put goes through
    portals
        .put(md, 0, 8, AckReq::CtAck, ProcessId::logical(1), 0, 0, 0, 0, 0)
        .unwrap();
    let after = portals.ct_wait(ct, 2).unwrap();
    assert_eq!(after.success, 1);
    assert_eq!(after.failure, 1);
    target.join().unwrap();
    assert_eq!(sink, 9);
}
