use rshmem::{launch, ShmemWorld, ShmemWorldBuilder};
use serial_test::serial;

fn build_world() -> ShmemWorld {
    ShmemWorldBuilder::new().with_heap_size(1 << 20).build()
}

macro_rules! nonblocking_test {
    ($t:ty, $num_pes:expr, $len:expr) => {
        paste::paste! {
            #[test]
            #[serial]
            fn [<nonblocking_ $t _ $num_pes _ $len>]() {
                let results = launch($num_pes, || {
                    let world = build_world();
                    let my_pe = world.my_pe();
                    let num_pes = world.num_pes();
                    let next = (my_pe + 1) % num_pes;
                    let prev = (my_pe + num_pes - 1) % num_pes;
                    let mut success = true;

                    let data = world.malloc::<$t>($len).unwrap();
                    let fetched = world.malloc::<$t>($len).unwrap();
                    let src: Vec<$t> = (0..$len).map(|i| (i + my_pe) as $t).collect();
                    let handle = world.put_nb(data, &src, next);
                    handle.wait();
                    world.barrier_all();

                    let handle = world.get_nb(fetched, data, $len, next);
                    handle.wait();
                    let local = unsafe { world.local_slice(fetched) };
                    for (i, v) in local.iter().enumerate() {
                        if *v != (i + my_pe) as $t {
                            eprintln!("pe {} get_nb index {} got {:?}", my_pe, i, v);
                            success = false;
                        }
                    }
                    let local = unsafe { world.local_slice(data) };
                    for (i, v) in local.iter().enumerate() {
                        if *v != (i + prev) as $t {
                            eprintln!("pe {} put_nb index {} got {:?}", my_pe, i, v);
                            success = false;
                        }
                    }
                    world.barrier_all();
                    world.free(fetched).unwrap();
                    world.free(data).unwrap();
                    success
                });
                assert!(results.iter().all(|s| *s));
            }
        }
    };
}

nonblocking_test!(u8, 2, 4096);
nonblocking_test!(u32, 3, 100);
nonblocking_test!(u64, 4, 1);
nonblocking_test!(f64, 2, 513);

#[test]
#[serial]
fn implicit_transfers_complete_at_quiet() {
    let results = launch(3, || {
        let world = build_world();
        let my_pe = world.my_pe();
        let num_pes = world.num_pes();
        let slots = world.malloc::<u64>(num_pes * 16).unwrap();
        let copy = world.malloc::<u64>(num_pes * 16).unwrap();
        for pe in 0..num_pes {
            let block: Vec<u64> = vec![my_pe as u64; 16];
            world.put_nbi(slots.sub(my_pe * 16, 16), &block, pe);
        }
        world.quiet();
        world.barrier_all();
        world.get_nbi(copy, slots, num_pes * 16, (my_pe + 1) % num_pes);
        world.quiet();
        let local = unsafe { world.local_slice(copy) };
        let success = local.iter().enumerate().all(|(i, v)| *v == (i / 16) as u64);
        world.barrier_all();
        world.free(copy).unwrap();
        world.free(slots).unwrap();
        success
    });
    assert_eq!(results, vec![true; 3]);
}

#[test]
#[serial]
fn handles_can_be_awaited() {
    let results = launch(2, || {
        let world = build_world();
        let my_pe = world.my_pe();
        let data = world.malloc::<u32>(8).unwrap();
        let back = world.malloc::<u32>(8).unwrap();
        futures::executor::block_on(async {
            world.put_nb(data, &[my_pe as u32 + 1; 8], 1 - my_pe).await;
        });
        world.barrier_all();
        let handle = world.get_nb(back, data, 8, my_pe);
        futures::executor::block_on(handle);
        let success = unsafe { world.local_slice(back) }.iter().all(|v| *v == (2 - my_pe) as u32);
        world.barrier_all();
        world.free(back).unwrap();
        world.free(data).unwrap();
        success
    });
    assert_eq!(results, vec![true, true]);
}

#[test]
#[serial]
fn dropped_handles_are_still_covered_by_quiet() {
    let results = launch(2, || {
        let world = build_world();
        let my_pe = world.my_pe();
        let data = world.malloc::<u64>(256).unwrap();
        let src: Vec<u64> = (0..256).collect();
        let handle = world.put_nb(data, &src, 1 - my_pe);
        world.quiet();
        let mut success = handle.test();
        drop(handle);
        world.barrier_all();
        success &= unsafe { world.local_slice(data) } == src.as_slice();
        world.barrier_all();
        world.free(data).unwrap();
        success
    });
    assert_eq!(results, vec![true, true]);
}
