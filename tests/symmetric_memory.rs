use rshmem::{
    launch, Backend, MallocStatus, SegmentExchange, SegmentId, ShmemWorld, ShmemWorldBuilder,
    SymAddr,
};
use serial_test::serial;
use std::time::Duration;

const HEAP: usize = 1 << 16;

fn build_world() -> ShmemWorld {
    ShmemWorldBuilder::new()
        .with_heap_size(HEAP)
        .with_symmetric_check(true)
        .build()
}

macro_rules! alloc_test {
    ($num_pes:expr) => {
        paste::paste! {
            #[test]
            #[serial]
            fn [<symmetric_addresses_ $num_pes>]() {
                let results = launch($num_pes, || {
                    let world = build_world();
                    let a = world.malloc::<u64>(10).unwrap();
                    let b = world.memalign::<u8>(256, 3).unwrap();
                    let c = world.malloc::<u32>(100).unwrap();
                    let aligned = b.addr().offset % 256 == 0;
                    let in_use = world.heap_in_use();
                    world.free(b).unwrap();
                    let c = world.realloc(c, 200).unwrap();
                    let addrs = (a.addr(), c.addr());
                    world.free(a).unwrap();
                    world.free(c).unwrap();
                    (addrs, aligned, in_use >= 80 + 3 + 400, world.heap_in_use())
                });
                // every pe made the same calls and got the same offsets
                for (addrs, aligned, used, left) in results.iter() {
                    assert_eq!(*addrs, results[0].0);
                    assert!(aligned);
                    assert!(used);
                    assert_eq!(*left, 0);
                }
            }
        }
    };
}

alloc_test!(1);
alloc_test!(2);
alloc_test!(5);

#[test]
#[serial]
fn realloc_keeps_the_prefix() {
    let results = launch(2, || {
        let world = build_world();
        let my_pe = world.my_pe();
        let data = world.malloc::<u16>(4).unwrap();
        world.put(data, &[1, 2, 3, 4], my_pe);
        let grown = world.realloc(data, 64).unwrap();
        let mut prefix = [0u16; 4];
        world.get(&mut prefix, grown.sub(0, 4), my_pe);
        let shrunk = world.realloc(grown, 2).unwrap();
        let mut head = [0u16; 2];
        world.get(&mut head, shrunk, my_pe);
        world.free(shrunk).unwrap();
        prefix == [1, 2, 3, 4] && head == [1, 2]
    });
    assert_eq!(results, vec![true, true]);
}

#[test]
#[serial]
fn allocator_errors_are_reported() {
    let results = launch(2, || {
        let world = build_world();
        let mut statuses = Vec::new();

        statuses.push(world.malloc::<u64>(0).unwrap_err().status());
        statuses.push(world.malloc_error());

        statuses.push(world.malloc::<u8>(HEAP * 2).unwrap_err().status());
        statuses.push(world.memalign::<u8>(48, 16).unwrap_err().status());
        statuses.push(world.memalign::<u8>(64, HEAP * 2).unwrap_err().status());

        let block = world.malloc::<u64>(4).unwrap();
        statuses.push(world.malloc_error());
        statuses.push(world.realloc(block, HEAP).unwrap_err().status());
        world.free(block).unwrap();
        statuses.push(world.free(block).unwrap_err().status());

        let statik = world.declare_static::<u64>(2).unwrap();
        statuses.push(world.free(statik).unwrap_err().status());
        statuses.push(world.realloc(statik, 4).unwrap_err().status());
        statuses
    });
    let expected = vec![
        MallocStatus::BadSize,
        MallocStatus::BadSize,
        MallocStatus::Fail,
        MallocStatus::NotAligned,
        MallocStatus::MemalignFailed,
        MallocStatus::Ok,
        MallocStatus::ReallocFailed,
        MallocStatus::AlreadyFree,
        MallocStatus::NotInSymmHeap,
        MallocStatus::NotInSymmHeap,
    ];
    for statuses in results {
        assert_eq!(statuses, expected);
    }
}

#[test]
#[serial]
fn mismatched_sizes_are_detected_everywhere() {
    let results = launch(3, || {
        let world = build_world();
        let len = if world.my_pe() == 1 { 8 } else { 16 };
        let status = world.malloc::<u64>(len).map(|_| ()).map_err(|e| e.status());
        // the heap is untouched, so matching calls still work afterwards
        let ok = world.malloc::<u64>(16).is_ok();
        (status, ok)
    });
    for (status, ok) in results {
        assert_eq!(status, Err(MallocStatus::SymmsizeFailed));
        assert!(ok);
    }
}

#[test]
#[serial]
fn static_segment_exhaustion() {
    let results = launch(1, || {
        let world = ShmemWorldBuilder::new()
            .with_heap_size(HEAP)
            .with_static_size(64)
            .build();
        let first = world.declare_static::<u64>(8).is_ok();
        let second = world.declare_static::<u8>(1).map_err(|e| e.status());
        let empty = world.declare_static::<u8>(0).map_err(|e| e.status());
        (first, second.err(), empty.err())
    });
    assert_eq!(
        results,
        vec![(true, Some(MallocStatus::Fail), Some(MallocStatus::BadSize))]
    );
}

#[test]
#[serial]
fn address_translation_round_trips() {
    let results = launch(4, || {
        let world = build_world();
        let my_pe = world.my_pe();
        let num_pes = world.num_pes();
        let data = world.malloc::<u64>(32).unwrap();
        let statik = world.declare_static::<u64>(1).unwrap();
        let mut success = true;

        let local = world.local_addr(data.addr()) + 8;
        for pe in 0..num_pes {
            let remote = world.translate(local, pe).unwrap();
            success &= world.to_local(remote, pe).unwrap() == local;
            if pe == my_pe {
                success &= remote == local;
            }
        }
        success &= world.sym_addr(local) == Some(data.addr().byte_add(8));

        // statics keep their address everywhere
        let static_local = world.local_addr(statik.addr());
        success &= world.translate(static_local, (my_pe + 1) % num_pes).unwrap() == static_local;
        success &= world.sym_addr(static_local) == Some(statik.addr());

        // outside every segment
        let outside = 64;
        success &= world.translate(outside, 0).is_err();
        success &= world.sym_addr(outside).is_none();
        world.barrier_all();
        world.free(data).unwrap();
        success
    });
    assert_eq!(results, vec![true; 4]);
}

#[test]
#[serial]
fn reachability_probes() {
    let results = launch(3, || {
        let world = build_world();
        let num_pes = world.num_pes();
        let data = world.malloc::<u64>(4).unwrap();
        let mut success = (0..num_pes).all(|pe| world.pe_accessible(pe));
        success &= !world.pe_accessible(num_pes);
        success &= (0..num_pes).all(|pe| world.addr_accessible(data.addr(), pe));
        success &= !world.addr_accessible(data.addr(), num_pes);
        success &= !world.addr_accessible(SymAddr::new(SegmentId::Heap, HEAP + 8), 0);
        world.barrier_all();
        world.free(data).unwrap();
        success
    });
    assert_eq!(results, vec![true; 3]);
}

#[test]
#[serial]
fn unanswered_pings_time_out() {
    let results = launch(2, || {
        let world = ShmemWorldBuilder::new()
            .with_heap_size(HEAP)
            .with_ping_timeout(Duration::ZERO)
            .build();
        let my_pe = world.my_pe();
        let peer = 1 - my_pe;
        // a zero deadline expires before any pong can arrive, the probe just reports the peer unreachable
        let reached = world.pe_accessible(peer);
        let me = world.pe_accessible(my_pe);
        world.barrier_all();
        (reached, me)
    });
    assert_eq!(results, vec![(false, true); 2]);
}

macro_rules! exchange_test {
    ($exchange:ident, $num_pes:expr) => {
        paste::paste! {
            #[test]
            #[serial]
            #[allow(non_snake_case)]
            fn [<$exchange _segment_exchange_ $num_pes>]() {
                let results = launch($num_pes, || {
                    let world = ShmemWorldBuilder::new()
                        .with_lamellae(Backend::Local)
                        .with_heap_size(HEAP)
                        .with_segment_exchange(SegmentExchange::$exchange)
                        .with_collect_algorithm("wavefront")
                        .with_ping_timeout(Duration::from_millis(500))
                        .build();
                    let my_pe = world.my_pe();
                    let num_pes = world.num_pes();
                    let data = world.malloc::<u64>(2).unwrap();
                    let local = world.local_addr(data.addr());
                    let mut success = world.heap_size() == HEAP;
                    for pe in 0..num_pes {
                        success &= world.to_local(world.translate(local, pe).unwrap(), pe).unwrap() == local;
                        success &= world.pe_accessible(pe);
                    }
                    world.p(data, my_pe as u64, (my_pe + 1) % num_pes);
                    world.barrier_all();
                    success &= world.g(data, my_pe) == ((my_pe + num_pes - 1) % num_pes) as u64;
                    world.barrier_all();
                    world.free(data).unwrap();
                    success
                });
                assert!(results.iter().all(|s| *s));
            }
        }
    };
}

exchange_test!(Transport, 3);
exchange_test!(Handshake, 1);
exchange_test!(Handshake, 4);
