use rand::Rng;
use rshmem::{
    launch, ActiveSet, ShmemWorld, ShmemWorldBuilder, WaitMode, BARRIER_SYNC_SIZE, SYNC_VALUE,
};
use serial_test::serial;
use std::time::{Duration, Instant};

fn build_world(barrier: &str) -> ShmemWorld {
    build_world_waiting(barrier, WaitMode::SpinBlock)
}

fn build_world_waiting(barrier: &str, mode: WaitMode) -> ShmemWorld {
    ShmemWorldBuilder::new()
        .with_heap_size(1 << 20)
        .with_barrier_algorithm(barrier)
        .with_wait_mode(mode)
        .build()
}

fn jitter() {
    let delay = rand::thread_rng().gen_range(0..500);
    std::thread::sleep(Duration::from_micros(delay));
}

macro_rules! barrier_test {
    ($mode:ident, $alg:ident, $num_pes:expr) => {
        paste::paste! {
            #[test]
            #[serial]
            fn [<$alg _barrier_ $mode:snake _ $num_pes>]() {
                let results = launch($num_pes, || {
                    let world = build_world_waiting(stringify!($alg), WaitMode::$mode);
                    let my_pe = world.my_pe();
                    let num_pes = world.num_pes();
                    let mut success = world.algorithms()[0] == stringify!($alg);

                    let psync = world.alloc_psync(BARRIER_SYNC_SIZE).unwrap();
                    let arrivals = world.malloc::<u64>(1).unwrap();
                    world.p(arrivals, 0, my_pe);
                    world.barrier_all();

                    // nobody leaves round r before everybody has announced r
                    for round in 1..=20u64 {
                        jitter();
                        world.inc(arrivals, 0);
                        world.barrier(ActiveSet::world(num_pes), psync);
                        let seen = world.fetch(arrivals, 0);
                        if seen < round * num_pes as u64 {
                            eprintln!("pe {} left round {} after {} arrivals", my_pe, round, seen);
                            success = false;
                        }
                        world.barrier(ActiveSet::world(num_pes), psync);
                    }

                    // the pSync is handed back untouched
                    let local = unsafe { world.local_slice(psync) };
                    if local.iter().any(|v| *v != SYNC_VALUE) {
                        eprintln!("pe {} pSync not restored: {:?}", my_pe, &local[..4]);
                        success = false;
                    }
                    world.barrier_all();
                    world.free(arrivals).unwrap();
                    world.free(psync).unwrap();
                    success
                });
                assert!(results.iter().all(|s| *s));
            }

            #[test]
            #[serial]
            fn [<$alg _strided_barrier_ $mode:snake _ $num_pes>]() {
                let results = launch($num_pes, || {
                    let world = build_world_waiting(stringify!($alg), WaitMode::$mode);
                    let my_pe = world.my_pe();
                    let num_pes = world.num_pes();
                    let psync = world.alloc_psync(BARRIER_SYNC_SIZE).unwrap();
                    let hits = world.malloc::<u64>(1).unwrap();
                    world.p(hits, 0, my_pe);
                    world.barrier_all();

                    // odd pes synchronize among themselves
                    let odds = ActiveSet::new(1, 1, num_pes / 2);
                    let mut success = true;
                    if my_pe % 2 == 1 {
                        for round in 1..=10u64 {
                            jitter();
                            world.inc(hits, 1);
                            world.barrier(odds, psync);
                            if world.fetch(hits, 1) < round * odds.size() as u64 {
                                success = false;
                            }
                            world.barrier(odds, psync);
                        }
                    }
                    world.barrier_all();
                    world.free(hits).unwrap();
                    world.free(psync).unwrap();
                    success
                });
                assert!(results.iter().all(|s| *s));
            }
        }
    };
}

macro_rules! iter_num_pes {
    ($mode:ident, $alg:ident, ($($num_pes:expr),*)) => {
        $(barrier_test!($mode, $alg, $num_pes);)*
    };
}

macro_rules! create_barrier_tests {
    ($mode:ident, ($($alg:ident),*), $num_pes:tt) => {
        $(iter_num_pes!($mode, $alg, $num_pes);)*
    };
}

create_barrier_tests!(SpinBlock, (linear, dissemination, transport), (2, 3, 4, 7, 8));
create_barrier_tests!(Block, (linear, dissemination, transport), (2, 4));
create_barrier_tests!(Spin, (linear, dissemination), (2, 3));

#[test]
#[serial]
fn delayed_pe_holds_everyone_back() {
    let results = launch(4, || {
        let world = ShmemWorldBuilder::new().with_heap_size(1 << 16).build();
        let my_pe = world.my_pe();
        let shared = world.malloc::<i32>(1).unwrap();
        world.p(shared, 7, my_pe);
        world.barrier_all();

        let start = Instant::now();
        if my_pe == 2 {
            std::thread::sleep(Duration::from_millis(200));
        }
        world.barrier_all();
        let held = start.elapsed() >= Duration::from_millis(200);

        if my_pe == 0 {
            world.swap(shared, 99, 0);
        }
        world.barrier_all();
        let seen = world.g(shared, 0);
        world.barrier_all();
        world.free(shared).unwrap();
        held && seen == 99
    });
    assert_eq!(results, vec![true; 4]);
}

macro_rules! teardown_test {
    ($alg:ident, $num_pes:expr) => {
        paste::paste! {
            #[test]
            #[serial]
            fn [<$alg _teardown_acks_every_arrival_ $num_pes>]() {
                // the closing barrier of finalize posts increments, their acks must land before shutdown
                for _ in 0..25 {
                    let results = launch($num_pes, || {
                        let world = build_world(stringify!($alg));
                        jitter();
                        world.barrier_all();
                        world.my_pe()
                    });
                    assert_eq!(results, (0..$num_pes).collect::<Vec<_>>());
                }
            }
        }
    };
}

teardown_test!(linear, 4);
teardown_test!(dissemination, 5);

#[test]
#[serial]
fn unknown_barrier_falls_back_to_default() {
    let names = launch(2, || build_world(" Butterfly ").algorithms()[0]);
    assert_eq!(names, vec!["linear", "linear"]);
}

#[test]
#[serial]
#[should_panic]
fn short_psync_is_fatal() {
    launch(2, || {
        let world = build_world("linear");
        let psync = world.alloc_psync(BARRIER_SYNC_SIZE - 1).unwrap();
        world.barrier(ActiveSet::world(2), psync);
    });
}
