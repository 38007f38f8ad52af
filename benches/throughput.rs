use criterion::{black_box, criterion_group, criterion_main, Criterion};
use relay_pipeline::{
    Backend, MapStage, PassthroughStage, PipelineBuilder, ReadCursor, RelayBuffer, Result, StageInput,
    DEFAULT_SLOT_SIZE,
};
use std::time::Duration;

fn benchmark_relay_put(c: &mut Criterion) {
    let shared = RelayBuffer::<Vec<u8>>::shared(16).expect("Buffer failed");
    c.bench_function("relay_put_threads_64b", |b| {
        b.iter(|| shared.put(black_box(vec![7u8; 64])).expect("Put failed"));
    });

    let process = RelayBuffer::<Vec<u8>>::process(16, DEFAULT_SLOT_SIZE).expect("Buffer failed");
    c.bench_function("relay_put_processes_64b", |b| {
        b.iter(|| process.put(black_box(vec![7u8; 64])).expect("Put failed"));
    });
}

fn benchmark_relay_put_get(c: &mut Criterion) {
    for backend in [Backend::Threads, Backend::Processes] {
        let buffer =
            RelayBuffer::<Vec<u8>>::new(4, backend, DEFAULT_SLOT_SIZE).expect("Buffer failed");
        let mut cursor = ReadCursor::new();
        c.bench_function(&format!("relay_put_get_{backend:?}"), |b| {
            b.iter(|| {
                buffer.put(black_box(vec![1u8; 64])).expect("Put failed");
                black_box(buffer.get_latest(&mut cursor).expect("Get failed"));
            });
        });
    }
}

fn benchmark_three_stage_round_trip(c: &mut Criterion) {
    for backend in [Backend::Threads, Backend::Processes] {
        let mut pipeline = PipelineBuilder::<u64>::new()
            .add_stage(MapStage::new("inc", |input: StageInput<u64>| -> Result<u64> {
                Ok(input.into_newest().unwrap_or(0) + 1)
            }))
            .add_stage(PassthroughStage)
            .terminal(PassthroughStage)
            .capacity(2)
            .backend(backend)
            .build()
            .expect("Build failed");
        pipeline.start().expect("Start failed");

        let mut next = 0u64;
        c.bench_function(&format!("three_stage_round_trip_{backend:?}"), |b| {
            b.iter(|| {
                next += 1;
                pipeline.put(black_box(next)).expect("Put failed");
                black_box(pipeline.get().expect("Get failed"));
            });
        });

        let _ = pipeline.stop();
    }
}

criterion_group!(
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(10));
    targets = benchmark_relay_put, benchmark_relay_put_get, benchmark_three_stage_round_trip
);
criterion_main!(benches);
