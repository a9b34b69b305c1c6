use rshmem::{launch, Comparator, ShmemWorld, ShmemWorldBuilder};
use serial_test::serial;

const ITERS: usize = 100;

fn build_world() -> ShmemWorld {
    ShmemWorldBuilder::new().with_heap_size(1 << 20).build()
}

macro_rules! arith_test {
    ($t:ty, $num_pes:expr) => {
        paste::paste! {
            #[test]
            #[serial]
            fn [<fetch_add_ $t _ $num_pes>]() {
                let results = launch($num_pes, || {
                    let world = build_world();
                    let my_pe = world.my_pe();
                    let num_pes = world.num_pes();
                    let mut success = true;

                    let cells = world.malloc::<$t>(2).unwrap();
                    world.put(cells, &[0 as $t, 0 as $t], my_pe);
                    world.barrier_all();

                    // every pe hammers the cells of pe 0
                    let mut prev = Vec::with_capacity(ITERS);
                    for _ in 0..ITERS {
                        prev.push(world.fadd(cells.sub(0, 1), 2 as $t, 0));
                        world.inc(cells.sub(1, 1), 0);
                    }
                    world.quiet();
                    world.barrier_all();

                    let total = (num_pes * ITERS) as $t;
                    if world.fetch(cells.sub(0, 1), 0) != 2 as $t * total {
                        eprintln!("pe {} fadd total {:?}", my_pe, world.fetch(cells.sub(0, 1), 0));
                        success = false;
                    }
                    if world.fetch(cells.sub(1, 1), 0) != total {
                        eprintln!("pe {} inc total {:?}", my_pe, world.fetch(cells.sub(1, 1), 0));
                        success = false;
                    }
                    // the values we saw are increasing, even and in range
                    for pair in prev.windows(2) {
                        if pair[0] >= pair[1] {
                            success = false;
                        }
                    }
                    if prev.iter().any(|v| *v % (2 as $t) != 0 as $t || *v >= 2 as $t * total) {
                        success = false;
                    }
                    world.barrier_all();

                    // finc and add on our own neighbour
                    let target = (my_pe + 1) % num_pes;
                    world.set(cells.sub(0, 1), 5 as $t, target);
                    world.quiet();
                    world.barrier_all();
                    let seen = world.finc(cells.sub(0, 1), target);
                    world.add(cells.sub(0, 1), 3 as $t, target);
                    world.quiet();
                    world.barrier_all();
                    if seen != 5 as $t || world.fetch(cells.sub(0, 1), my_pe) != 9 as $t {
                        eprintln!("pe {} finc {:?}", my_pe, seen);
                        success = false;
                    }
                    world.barrier_all();
                    world.free(cells).unwrap();
                    success
                });
                assert!(results.iter().all(|s| *s));
            }

            #[test]
            #[serial]
            fn [<cswap_race_ $t _ $num_pes>]() {
                let results = launch($num_pes, || {
                    let world = build_world();
                    let my_pe = world.my_pe();
                    let cell = world.malloc::<$t>(1).unwrap();
                    world.p(cell, 0 as $t, my_pe);
                    world.barrier_all();
                    let won = world.cswap(cell, 0 as $t, (my_pe + 1) as $t, 0) == 0 as $t;
                    world.barrier_all();
                    let winner = world.fetch(cell, 0);
                    // a failed cswap leaves the cell untouched
                    let stale = world.cswap(cell, 0 as $t, 100 as $t, 0);
                    world.barrier_all();
                    world.free(cell).unwrap();
                    (won, winner, stale, my_pe)
                });
                let winners: Vec<_> = results.iter().filter(|r| r.0).collect();
                assert_eq!(winners.len(), 1);
                let winner_pe = winners[0].3;
                for (_, winner, stale, _) in results.iter() {
                    assert_eq!(*winner, (winner_pe + 1) as $t);
                    assert_eq!(*stale, (winner_pe + 1) as $t);
                }
            }

            #[test]
            #[serial]
            fn [<swap_chain_ $t _ $num_pes>]() {
                let results = launch($num_pes, || {
                    let world = build_world();
                    let my_pe = world.my_pe();
                    let cell = world.malloc::<$t>(1).unwrap();
                    world.p(cell, <$t>::MAX, my_pe);
                    world.barrier_all();
                    let prev = world.swap(cell, my_pe as $t, 0);
                    world.barrier_all();
                    let last = world.fetch(cell, 0);
                    world.barrier_all();
                    world.free(cell).unwrap();
                    (prev, last)
                });
                // the swaps form a chain: every value is seen by exactly one swapper, except the last one
                let mut seen: Vec<$t> = results.iter().map(|r| r.0).collect();
                seen.push(results[0].1);
                seen.sort();
                let mut expected: Vec<$t> = (0..$num_pes).map(|pe| pe as $t).collect();
                expected.push(<$t>::MAX);
                expected.sort();
                assert_eq!(seen, expected);
            }
        }
    };
}

macro_rules! iter_num_pes {
    ($t:ty, ($($num_pes:expr),*)) => {
        $(arith_test!($t, $num_pes);)*
    };
}

macro_rules! create_atomic_tests {
    (($($t:ty),*), $num_pes:tt) => {
        $(iter_num_pes!($t, $num_pes);)*
    };
}

create_atomic_tests!((i32, u32, i64, u64, i128, u128, usize), (1, 2, 4, 8));

#[test]
#[serial]
fn float_swap_fetch_set() {
    let results = launch(2, || {
        let world = build_world();
        let my_pe = world.my_pe();
        let other = 1 - my_pe;
        let cells = world.malloc::<f64>(1).unwrap();
        let single = world.malloc::<f32>(1).unwrap();
        world.set(cells, 1.5, other);
        world.set(single, -0.25, other);
        world.quiet();
        world.barrier_all();
        let old = world.swap(cells, my_pe as f64, other);
        let old_single = world.swap(single, 2.0, other);
        world.barrier_all();
        let now = world.fetch(cells, my_pe);
        world.barrier_all();
        world.free(single).unwrap();
        world.free(cells).unwrap();
        old == 1.5 && old_single == -0.25 && now == other as f64
    });
    assert_eq!(results, vec![true, true]);
}

#[test]
#[serial]
fn wait_until_sees_remote_increments() {
    let results = launch(4, || {
        let world = build_world();
        let my_pe = world.my_pe();
        let num_pes = world.num_pes();
        let flag = world.malloc::<i64>(1).unwrap();
        world.p(flag, 0, my_pe);
        world.barrier_all();
        let mut success = true;
        if my_pe == 0 {
            let expected = 5 * (num_pes as i64 - 1);
            success &= world.wait_until(flag, Comparator::Ge, 1) >= 1;
            success &= world.wait_until(flag, Comparator::Eq, expected) == expected;
            success &= world.wait_until(flag, Comparator::Gt, expected - 1) == expected;
            success &= world.wait_until(flag, Comparator::Le, expected) == expected;
            success &= world.wait_until(flag, Comparator::Lt, expected + 1) == expected;
            success &= world.wait(flag, 0) == expected;
        } else {
            for _ in 0..5 {
                world.inc(flag, 0);
            }
            world.quiet();
        }
        world.barrier_all();
        world.free(flag).unwrap();
        success
    });
    assert!(results.iter().all(|s| *s));
}

#[test]
#[serial]
fn point_to_point_signal() {
    let results = launch(2, || {
        let world = build_world();
        let my_pe = world.my_pe();
        let data = world.malloc::<u64>(64).unwrap();
        let signal = world.malloc::<u64>(1).unwrap();
        world.p(signal, 0, my_pe);
        world.barrier_all();
        let mut success = true;
        if my_pe == 0 {
            let payload: Vec<u64> = (0..64).collect();
            world.put(data, &payload, 1);
            world.fence();
            world.set(signal, 1, 1);
            world.quiet();
        } else {
            world.wait_until(signal, Comparator::Eq, 1);
            let local = unsafe { world.local_slice(data) };
            success = local.iter().enumerate().all(|(i, v)| *v == i as u64);
        }
        world.barrier_all();
        world.free(signal).unwrap();
        world.free(data).unwrap();
        success
    });
    assert_eq!(results, vec![true, true]);
}
