use rand::Rng;
use rshmem::{launch, ShmemLock, ShmemWorld, ShmemWorldBuilder, WaitMode};
use serial_test::serial;
use std::time::Duration;

fn build_world() -> ShmemWorld {
    build_world_waiting(WaitMode::SpinBlock)
}

fn build_world_waiting(mode: WaitMode) -> ShmemWorld {
    ShmemWorldBuilder::new()
        .with_heap_size(1 << 20)
        .with_wait_mode(mode)
        .build()
}

/// read-modify-write `counter` on pe 0 under `lock`, `iters` times
fn locked_increments(
    world: &ShmemWorld,
    lock: &ShmemLock,
    counter: rshmem::SymmetricPtr<u64>,
    iters: usize,
) {
    for _ in 0..iters {
        world.set_lock(lock);
        let value = world.g(counter, 0);
        world.p(counter, value + 1, 0);
        world.clear_lock(lock);
    }
}

macro_rules! lock_test {
    ($mode:ident, $num_pes:expr, $iters:expr) => {
        paste::paste! {
            #[test]
            #[serial]
            fn [<mutual_exclusion_ $mode:snake _ $num_pes _ $iters>]() {
                let results = launch($num_pes, || {
                    let world = build_world_waiting(WaitMode::$mode);
                    let my_pe = world.my_pe();
                    let num_pes = world.num_pes();
                    let lock = world.new_lock().unwrap();
                    let counter = world.malloc::<u64>(1).unwrap();
                    world.p(counter, 0, my_pe);
                    world.barrier_all();

                    locked_increments(&world, &lock, counter, $iters);
                    world.barrier_all();
                    let total = world.g(counter, 0);
                    world.barrier_all();
                    world.free(counter).unwrap();
                    world.free_lock(lock).unwrap();
                    total == (num_pes * $iters) as u64
                });
                assert!(results.iter().all(|s| *s));
            }
        }
    };
}

lock_test!(SpinBlock, 1, 50);
lock_test!(SpinBlock, 2, 200);
lock_test!(SpinBlock, 3, 100);
lock_test!(SpinBlock, 8, 1000);
lock_test!(Block, 2, 200);
lock_test!(Block, 4, 200);
lock_test!(Spin, 2, 200);
lock_test!(Spin, 3, 100);

#[test]
#[serial]
fn holders_do_not_overlap() {
    let results = launch(4, || {
        let world = build_world();
        let my_pe = world.my_pe();
        let lock = world.new_lock().unwrap();
        let inside = world.malloc::<i64>(1).unwrap();
        world.p(inside, 0, my_pe);
        world.barrier_all();

        let mut success = true;
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            world.set_lock(&lock);
            if world.fadd(inside, 1, 0) != 0 {
                success = false;
            }
            std::thread::sleep(Duration::from_micros(rng.gen_range(0..200)));
            world.fadd(inside, -1, 0);
            world.clear_lock(&lock);
        }
        world.barrier_all();
        world.free(inside).unwrap();
        world.free_lock(lock).unwrap();
        success
    });
    assert_eq!(results, vec![true; 4]);
}

#[test]
#[serial]
fn test_lock_only_takes_a_free_lock() {
    let results = launch(3, || {
        let world = build_world();
        let my_pe = world.my_pe();
        let lock = world.new_lock().unwrap();
        let mut success = true;

        if my_pe == 0 {
            world.set_lock(&lock);
        }
        world.barrier_all();
        if my_pe != 0 {
            success &= !world.test_lock(&lock);
        }
        world.barrier_all();
        if my_pe == 0 {
            world.clear_lock(&lock);
        }
        world.barrier_all();
        if my_pe == 1 {
            success &= world.test_lock(&lock);
        }
        world.barrier_all();
        if my_pe == 2 {
            success &= !world.test_lock(&lock);
        }
        world.barrier_all();
        if my_pe == 1 {
            world.clear_lock(&lock);
        }
        world.barrier_all();
        // a released lock can be taken again by a blocking acquire
        world.set_lock(&lock);
        world.clear_lock(&lock);
        world.barrier_all();
        world.free_lock(lock).unwrap();
        success
    });
    assert_eq!(results, vec![true; 3]);
}

#[test]
#[serial]
fn racing_test_lock_has_one_winner() {
    let results = launch(6, || {
        let world = build_world();
        let my_pe = world.my_pe();
        let lock = world.new_lock().unwrap();
        let winners = world.malloc::<u64>(1).unwrap();
        world.p(winners, 0, my_pe);
        world.barrier_all();

        let mut success = true;
        for round in 1..=30u64 {
            let won = world.test_lock(&lock);
            if won {
                world.inc(winners, 0);
            }
            world.barrier_all();
            // a lost race never leaves the loser queued behind the winner
            success &= world.g(winners, 0) == round;
            world.barrier_all();
            if won {
                world.clear_lock(&lock);
            }
            world.barrier_all();
        }
        world.free(winners).unwrap();
        world.free_lock(lock).unwrap();
        success
    });
    assert_eq!(results, vec![true; 6]);
}

macro_rules! static_lock_test {
    ($name:ident, $legacy_zero:expr) => {
        #[test]
        #[serial]
        fn $name() {
            let results = launch(4, || {
                let world = ShmemWorldBuilder::new()
                    .with_heap_size(1 << 16)
                    .with_lock_legacy_zero($legacy_zero)
                    .build();
                let lock = world.declare_static_lock().unwrap();
                let counter = world.declare_static::<u64>(1).unwrap();
                world.barrier_all();
                locked_increments(&world, &lock, counter, 100);
                world.barrier_all();
                let total = world.g(counter, 0);
                world.barrier_all();
                total
            });
            assert_eq!(results, vec![400; 4]);
        }
    };
}

static_lock_test!(zeroed_static_lock, true);
static_lock_test!(initialized_static_lock, false);
