use parking_lot::Mutex;
use rshmem::{launch, ActiveSet, ShmemInterceptor, ShmemWorldBuilder, BCAST_SYNC_SIZE};
use serial_test::serial;
use std::sync::Arc;

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<(usize, &'static str, bool)>>,
}

impl ShmemInterceptor for Recorder {
    fn enter(&self, pe: usize, op: &'static str) {
        self.events.lock().push((pe, op, true));
    }
    fn exit(&self, pe: usize, op: &'static str) {
        self.events.lock().push((pe, op, false));
    }
}

#[test]
#[serial]
fn every_call_is_bracketed() {
    let recorder = Arc::new(Recorder::default());
    launch(3, || {
        let world = ShmemWorldBuilder::new()
            .with_heap_size(1 << 16)
            .with_interceptor(recorder.clone())
            .build();
        let my_pe = world.my_pe();
        let data = world.malloc::<u64>(4).unwrap();
        let psync = world.alloc_psync(BCAST_SYNC_SIZE).unwrap();
        world.put(data, &[1, 2, 3, 4], my_pe);
        world.barrier_all();
        world.broadcast(data, data, 4, 0, ActiveSet::world(3), psync);
        world.fadd(data, 1, 0);
        world.barrier_all();
        world.free(psync).unwrap();
        world.free(data).unwrap();
    });

    let events = recorder.events.lock();
    for pe in 0..3 {
        let mine: Vec<_> = events.iter().filter(|e| e.0 == pe).map(|e| (e.1, e.2)).collect();
        let expected = [
            "malloc",
            "alloc_psync",
            "put",
            "barrier_all",
            "broadcast",
            "fadd",
            "barrier_all",
            "free",
            "free",
        ];
        // runtime internal calls (the barrier inside malloc, ...) are not reported
        let flat: Vec<_> = expected.iter().flat_map(|op| [(*op, true), (*op, false)]).collect();
        assert_eq!(mine, flat, "pe {}", pe);
    }
}

#[test]
#[serial]
fn hooks_default_to_no_ops() {
    struct Entries(Mutex<usize>);
    impl ShmemInterceptor for Entries {
        fn enter(&self, _pe: usize, _op: &'static str) {
            *self.0.lock() += 1;
        }
    }
    let entries = Arc::new(Entries(Mutex::new(0)));
    launch(2, || {
        let world = ShmemWorldBuilder::new()
            .with_heap_size(1 << 16)
            .with_interceptor(entries.clone())
            .build();
        world.barrier_all();
        world.quiet();
    });
    assert_eq!(*entries.0.lock(), 4);
}
