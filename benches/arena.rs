use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use std::time::Duration;
use vidarena::arena::{ArenaConfig, ArenaHandle};
use vidarena::{BatchArray, BatchInfo, Frame, Normalizer};

fn gradient(width: u32, height: u32) -> Frame {
    let data = (0..width as usize * height as usize * 3)
        .map(|i| (i % 251) as u8)
        .collect();
    Frame::from_data(data, width, height).unwrap()
}

fn bench_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize");
    for (width, height) in [(640, 360), (1280, 720)] {
        let frame = gradient(width, height);
        group.throughput(Throughput::Elements(1));
        group.bench_function(format!("{width}x{height}->224"), |b| {
            let mut normalizer = Normalizer::new(224);
            b.iter(|| normalizer.normalize(black_box(&frame)).unwrap())
        });
    }
    group.finish();
}

fn bench_put_get(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let row_bytes = 224 * 224 * 3;
    let config = ArenaConfig::new(256, row_bytes)
        .with_segment_dir(dir.path())
        .with_put_retries(0, Duration::ZERO);
    let mut arena = ArenaHandle::create(config).unwrap();
    let info = BatchInfo::new("bench", "bench.npy", 0);

    let mut group = c.benchmark_group("arena");
    for rows in [1usize, 16, 64] {
        let array =
            BatchArray::from_shape(vec![rows, 224, 224, 3], vec![7u8; rows * row_bytes]).unwrap();
        group.throughput(Throughput::Bytes((rows * row_bytes) as u64));
        group.bench_function(format!("put_get/{rows}"), |b| {
            b.iter_batched(
                || array.clone(),
                |array| {
                    arena.put(&array, &info).unwrap();
                    arena.try_get().unwrap().unwrap()
                },
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_normalize, bench_put_get);
criterion_main!(benches);
