use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{rngs::StdRng, Rng, SeedableRng};
use slotdb_core::compression::{TsdDecoder, TsdEncoder};
use slotdb_core::storage::{DataFamily, DataFamilyOptions};
use slotdb_core::types::timeutil::{ONE_HOUR, ONE_SECOND};
use slotdb_core::types::{FieldType, Interval, Row};
use slotdb_core::version::TableCache;
use tempfile::TempDir;

fn bench_tsd(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0x51_07);
    let values: Vec<f64> = (0..360).map(|_| rng.gen_range(0.0..100.0)).collect();
    let mut group = c.benchmark_group("tsd");
    group.throughput(Throughput::Elements(values.len() as u64));

    group.bench_function("encode_360", |b| {
        b.iter(|| {
            let mut encoder = TsdEncoder::new(0);
            for (slot, v) in values.iter().enumerate() {
                encoder.push(slot as u16, *v);
            }
            black_box(encoder.finish());
        });
    });

    let mut encoder = TsdEncoder::new(0);
    for (slot, v) in values.iter().enumerate() {
        encoder.push(slot as u16, *v);
    }
    let block = encoder.finish().unwrap();
    group.bench_function("decode_360", |b| {
        b.iter(|| {
            let mut decoder = TsdDecoder::new(&block).unwrap();
            black_box(decoder.decode_all().unwrap());
        });
    });
    group.finish();
}

fn bench_family_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("family_write");
    group.sample_size(20);
    for &series in &[100u32, 10_000] {
        let rows: Vec<Row> = (0..series)
            .map(|s| Row::new(1, s, (s as i64 % 360) * 10 * ONE_SECOND).with_field(1, FieldType::Sum, 1.0))
            .collect();
        group.throughput(Throughput::Elements(rows.len() as u64));
        group.bench_with_input(BenchmarkId::new("rows", series), &rows, |b, rows| {
            let dir = TempDir::new().unwrap();
            let family = DataFamily::open(
                &dir.path().join("family-0"),
                1,
                DataFamilyOptions {
                    family_time: 0,
                    family_width: ONE_HOUR,
                    interval: Interval::from_millis(10 * ONE_SECOND).unwrap(),
                    max_memdb_size: 1 << 30,
                    mutable_memdb_ttl: Duration::from_secs(1800),
                },
                Arc::new(TableCache::new(16)),
            )
            .unwrap();
            b.iter(|| black_box(family.write_rows(rows).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_tsd, bench_family_write);
criterion_main!(benches);
