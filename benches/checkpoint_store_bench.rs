use criterion::{BatchSize, BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use vifit::checkpoint::{CounterDelta, Segment};
use vifit::checkpoint_manager::CheckpointStore;
use vifit::outcome::ResultRow;
use vifit::work_unit::{Phase, WorkKey};
use tempfile::TempDir;

const FLUSH: u32 = 500;

fn segment(start: u32, len: u32) -> Segment {
    Segment {
        rows: (start..start + len)
            .map(|pixel_id| ResultRow::new(WorkKey::Pixel { pixel_id }, vec![0.31, 0.22, 181.0, 0.013, 23.0]))
            .collect(),
        failures: vec![],
    }
}

fn delta(len: u32) -> CounterDelta {
    CounterDelta {
        attempted: len as u64,
        succeeded: len as u64,
        failed: 0,
    }
}

/// Store already holding `resident` rows.
fn prefilled(resident: u32) -> (TempDir, CheckpointStore) {
    let temp_dir = TempDir::new().unwrap();
    let mut store = CheckpointStore::open(temp_dir.path(), Phase::Climatology).unwrap();
    let mut start = 0;
    while start < resident {
        let len = FLUSH.min(resident - start);
        store.append(segment(start, len), delta(len)).unwrap();
        start += len;
    }
    (temp_dir, store)
}

/// One flush of 500 rows onto checkpoints of growing size. Flat timings across the
/// group mean a save never pays for history.
fn bench_append_onto_resident(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint_append_500");
    group.sample_size(20);
    for resident in [1_000u32, 10_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(resident), &resident, |b, &resident| {
            let (_temp_dir, mut store) = prefilled(resident);
            let mut next = resident;
            b.iter(|| {
                store.append(black_box(segment(next, FLUSH)), delta(FLUSH)).unwrap();
                next += FLUSH;
            })
        });
    }
    group.finish();
}

/// Full run of saves for n rows. Should scale linearly in n.
fn bench_total_save_cost(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint_total_saves");
    group.sample_size(10);
    for n in [1_000u32, 10_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter_batched(|| (), |_| prefilled(black_box(n)), BatchSize::PerIteration)
        });
    }
    group.finish();
}

fn bench_load(c: &mut Criterion) {
    let (temp_dir, _store) = prefilled(50_000);
    c.bench_function("checkpoint_load_50k", |b| {
        b.iter(|| {
            let mut store = CheckpointStore::open(temp_dir.path(), Phase::Climatology).unwrap();
            black_box(store.load().unwrap().map(|s| s.rows.len()))
        })
    });
}

criterion_group!(benches, bench_append_onto_resident, bench_total_save_cost, bench_load);
criterion_main!(benches);
