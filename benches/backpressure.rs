use criterion::{black_box, criterion_group, criterion_main, Criterion};
use relay_pipeline::{
    Backend, MapStage, PassthroughStage, PipelineBuilder, ReadMode, Result, StageInput,
};
use std::time::Duration;

// A slow stage never slows the producer down: the relay buffer evicts and
// the stage picks up the freshest value on its next read.
fn benchmark_slow_consumer_producer_rate(c: &mut Criterion) {
    for backend in [Backend::Threads, Backend::Processes] {
        let mut pipeline = PipelineBuilder::<u64>::new()
            .add_stage(MapStage::new("slow", |input: StageInput<u64>| -> Result<u64> {
                std::thread::sleep(Duration::from_micros(500));
                Ok(input.into_newest().unwrap_or(0))
            }))
            .terminal(PassthroughStage)
            .capacity(4)
            .backend(backend)
            .build()
            .expect("Build failed");
        pipeline.start().expect("Start failed");

        c.bench_function(&format!("slow_consumer_1000_puts_{backend:?}"), |b| {
            b.iter(|| {
                for i in 0..1000u64 {
                    pipeline.put(black_box(i)).expect("Put failed");
                }
            });
        });

        let _ = pipeline.stop();
    }
}

fn benchmark_batch_window(c: &mut Criterion) {
    let mut pipeline = PipelineBuilder::<u64>::new()
        .add_stage(PassthroughStage)
        .terminal(PassthroughStage)
        .capacity(vec![1, 8])
        .build()
        .expect("Build failed");
    pipeline
        .configure_read_mode(1, ReadMode::Batch)
        .expect("Configure failed");
    pipeline.start().expect("Start failed");

    let mut next = 0u64;
    c.bench_function("batch_window_8", |b| {
        b.iter(|| {
            next += 1;
            pipeline.put(black_box(next)).expect("Put failed");
            black_box(pipeline.try_get().expect("Read failed"));
        });
    });

    let _ = pipeline.stop();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(15))
        .sample_size(20);
    targets = benchmark_slow_consumer_producer_rate, benchmark_batch_window
);
criterion_main!(benches);
