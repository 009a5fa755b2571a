//! Criterion benchmarks for the vector index builder.
//!
//! Covers the hot paths of a scheduling round:
//! - candidate selection over tables with many parts
//! - a full build and install of one flat index
//! - checksum verification of a part with an installed index

use std::collections::BTreeSet;
use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::Rng;
use tempfile::{Builder, TempDir};

use partindex::builder::VectorIndexBuilder;
use partindex::config::{BuilderSettings, SettingsHandle};
use partindex::library::DefaultIndexLibrary;
use partindex::metadata::{ColumnDescription, TableMetadata, VectorIndexDescription, VectorIndexKind};
use partindex::part::{LocalPartRegistry, PartRegistry, VectorColumn};

const DIMENSION: usize = 32;

fn random_column(rows: usize) -> VectorColumn {
    let mut rng = rand::rng();
    let data: Vec<Vec<f32>> = (0..rows)
        .map(|_| (0..DIMENSION).map(|_| rng.random::<f32>()).collect())
        .collect();
    VectorColumn::from_rows(DIMENSION, &data).unwrap()
}

fn table(parts: usize, rows: usize) -> (TempDir, Arc<LocalPartRegistry>, Arc<VectorIndexBuilder>) {
    let dir = Builder::new().prefix("partindex_bench").tempdir().unwrap();
    let metadata = TableMetadata::new("bench", vec![ColumnDescription::vector("embedding", DIMENSION)])
        .with_vector_index(VectorIndexDescription::new(
            "flat",
            "embedding",
            DIMENSION,
            VectorIndexKind::Flat,
        ))
        .with_vector_index(
            VectorIndexDescription::new("ivf", "embedding", DIMENSION, VectorIndexKind::Ivf)
                .with_param("nlist", "16"),
        );
    let registry = Arc::new(LocalPartRegistry::create(dir.path(), metadata).unwrap());
    for _ in 0..parts {
        registry.insert_part("all", &[("embedding", random_column(rows))]).unwrap();
    }
    let builder = Arc::new(VectorIndexBuilder::new(
        registry.clone(),
        Arc::new(DefaultIndexLibrary::new()),
        SettingsHandle::new(BuilderSettings::default()),
    ));
    (dir, registry, builder)
}

/// Benchmark candidate selection.
fn bench_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("selection");

    for parts in [10, 100, 500] {
        let (_dir, registry, builder) = table(parts, 8);
        let metadata = registry.metadata();
        let excluded = BTreeSet::new();

        group.throughput(Throughput::Elements(parts as u64));
        group.bench_with_input(BenchmarkId::new("select_slow", parts), &parts, |b, _| {
            b.iter(|| {
                let task = builder.select_part_to_build_vector_index(&metadata, true, &excluded);
                black_box(task)
            })
        });
    }

    group.finish();
}

/// Benchmark a full build plus install of one index.
fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    group.sample_size(20);

    for rows in [1_000, 10_000] {
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::new("flat", rows), &rows, |b, &rows| {
            b.iter_with_setup(
                || table(1, rows),
                |(dir, registry, builder)| {
                    let metadata = registry.metadata();
                    let part = registry.data_parts().remove(0);
                    let status = builder
                        .build_vector_index(&metadata, &part.name, "flat", false)
                        .unwrap();
                    black_box(status);
                    drop(dir);
                },
            )
        });
    }

    group.finish();
}

/// Benchmark checksum verification of a part carrying an index.
fn bench_verify(c: &mut Criterion) {
    let mut group = c.benchmark_group("verify");

    let (_dir, registry, builder) = table(1, 10_000);
    let metadata = registry.metadata();
    let part = registry.data_parts().remove(0);
    builder
        .build_vector_index(&metadata, &part.name, "ivf", false)
        .unwrap();
    let disk = registry.disk();

    group.bench_function("checksums_10k", |b| {
        b.iter(|| {
            let manifest = part.checksums(disk.as_ref()).unwrap();
            black_box(manifest.verify(disk.as_ref(), &part.relative_path).unwrap())
        })
    });

    group.finish();
}

criterion_group!(benches, bench_selection, bench_build, bench_verify);
criterion_main!(benches);
