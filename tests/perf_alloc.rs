use std::alloc::System;
use std::hint::black_box;

use serial_test::serial;
use stats_alloc::{Region, StatsAlloc, INSTRUMENTED_SYSTEM};
use streamprobe::reconcile::Reconciler;
use streamprobe::wire::{self, Message};

#[global_allocator]
static GLOBAL: &StatsAlloc<System> = &INSTRUMENTED_SYSTEM;

fn measure_alloc_counts<T>(f: impl FnOnce() -> T) -> (T, usize, usize) {
    // Calibrate for ambient allocator activity in the test harness process.
    let idle_region = Region::new(&GLOBAL);
    black_box(());
    let idle = idle_region.change();

    let region = Region::new(&GLOBAL);
    let output = f();
    let used = region.change();

    let allocations = used.allocations.saturating_sub(idle.allocations);
    let deallocations = used.deallocations.saturating_sub(idle.deallocations);
    (output, allocations, deallocations)
}

#[test]
#[serial]
fn in_order_arrivals_allocate_nothing_when_presized() {
    let count = 10_000u64;
    let mut reconciler = Reconciler::with_capacity(count as usize);

    let (_, allocations, deallocations) = measure_alloc_counts(|| {
        for id in 0..count {
            reconciler.expect(id, id);
            black_box(reconciler.on_arrival(id, id + 50));
        }
    });

    assert!(
        allocations <= 4,
        "in-order reconcile allocation budget exceeded: {}",
        allocations
    );
    assert!(
        deallocations <= 4,
        "in-order reconcile deallocation budget exceeded: {}",
        deallocations
    );
    assert_eq!(reconciler.arrived_count(), count as usize);
}

#[test]
#[serial]
fn reorder_window_allocation_budget() {
    let count = 10_000u64;
    let mut reconciler = Reconciler::with_capacity(count as usize);
    for id in 0..count {
        reconciler.expect(id, id);
    }

    // Every 100th id arrives one place late: the side map stays tiny.
    let (_, allocations, _) = measure_alloc_counts(|| {
        let mut id = 0;
        while id + 1 < count {
            if id % 100 == 0 {
                black_box(reconciler.on_arrival(id + 1, id + 60));
                black_box(reconciler.on_arrival(id, id + 61));
            } else {
                black_box(reconciler.on_arrival(id, id + 50));
                black_box(reconciler.on_arrival(id + 1, id + 51));
            }
            id += 2;
        }
    });

    assert!(
        allocations <= 32,
        "reorder reconcile allocation budget exceeded: {}",
        allocations
    );
    assert_eq!(reconciler.arrived_too_late_count(), 100);
}

#[test]
#[serial]
fn header_decode_allocates_zero() {
    let data = Message::new(42, vec![0u8; 48]).encode().expect("encode");

    let (_, allocations, deallocations) = measure_alloc_counts(|| {
        for _ in 0..1_000 {
            black_box(wire::decode_header(black_box(&data)).expect("decode"));
        }
    });

    assert_eq!(allocations, 0, "header decode allocated");
    assert_eq!(deallocations, 0, "header decode deallocated");
}
