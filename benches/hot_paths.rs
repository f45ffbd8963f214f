use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use streamprobe::reconcile::Reconciler;
use streamprobe::wire::{self, Message};

const STREAM_LEN: u64 = 10_000;

fn issued(count: u64) -> Reconciler {
    let mut r = Reconciler::with_capacity(count as usize);
    for id in 0..count {
        r.expect(id, id * 1_000);
    }
    r
}

fn bench_reconcile(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile");

    group.bench_function("in_order_10k", |b| {
        b.iter_batched(
            || issued(STREAM_LEN),
            |mut r| {
                for id in 0..STREAM_LEN {
                    black_box(r.on_arrival(id, id * 1_000 + 250));
                }
                r
            },
            BatchSize::LargeInput,
        )
    });

    group.bench_function("pairwise_swap_10k", |b| {
        b.iter_batched(
            || issued(STREAM_LEN),
            |mut r| {
                let mut id = 0;
                while id + 1 < STREAM_LEN {
                    black_box(r.on_arrival(id + 1, id * 1_000 + 250));
                    black_box(r.on_arrival(id, id * 1_000 + 300));
                    id += 2;
                }
                r
            },
            BatchSize::LargeInput,
        )
    });

    group.bench_function("burst_loss_10k", |b| {
        b.iter_batched(
            || issued(STREAM_LEN),
            |mut r| {
                // Every tenth block of 50 ids is lost, then arrives late.
                for block in 0..STREAM_LEN / 50 {
                    if block % 10 == 0 {
                        continue;
                    }
                    for id in block * 50..(block + 1) * 50 {
                        black_box(r.on_arrival(id, id * 1_000 + 250));
                    }
                }
                for block in (0..STREAM_LEN / 50).step_by(10) {
                    for id in block * 50..(block + 1) * 50 {
                        black_box(r.on_arrival(id, id * 1_000 + 900));
                    }
                }
                r
            },
            BatchSize::LargeInput,
        )
    });

    group.finish();
}

fn bench_wire(c: &mut Criterion) {
    let velocity = Message::new(7, vec![0u8; 48]).encode().expect("encode");
    let mut buf = Vec::with_capacity(velocity.len());

    c.bench_function("wire_decode_header", |b| {
        b.iter(|| wire::decode_header(black_box(&velocity)).expect("decode"))
    });

    c.bench_function("wire_encode_into", |b| {
        let message = Message::new(7, vec![0u8; 48]);
        b.iter(|| {
            message.encode_into(&mut buf).expect("encode");
            black_box(buf.len())
        })
    });
}

criterion_group!(benches, bench_reconcile, bench_wire);
criterion_main!(benches);
