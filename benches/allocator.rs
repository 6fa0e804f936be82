//! Benchmarks for usmalloc.
//!
//! Run with: cargo bench

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use usmalloc::{
    kb, suppress_diagnostics, AllocationManager, AllocationProperties, DeviceIndex, DummyBackend,
    DummyContext, FreeMode, SubmissionContext, UsmConfig,
};

const DEV0: DeviceIndex = DeviceIndex(0);

fn manager(config: UsmConfig) -> AllocationManager {
    suppress_diagnostics(true);
    let backend = Arc::new(DummyBackend::new());
    let manager = AllocationManager::new(config, backend.clone(), backend).unwrap();
    manager.ensure_initialized([DEV0]).unwrap();
    manager
}

fn bench_create_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("create_free");
    let props = AllocationProperties::device(DEV0);

    for (name, config) in [("pooled", UsmConfig::default()), ("dedicated", UsmConfig::no_pooling())] {
        let manager = manager(config);
        for size in [kb(4), kb(32), kb(512)] {
            group.bench_with_input(BenchmarkId::new(name, size), &size, |b, &size| {
                b.iter(|| {
                    let ptr = manager.create_allocation(size, &props).unwrap();
                    manager.free_allocation(black_box(ptr), FreeMode::Deferred).unwrap();
                })
            });
        }
    }

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");
    let manager = manager(UsmConfig::default());
    let props = AllocationProperties::host([DEV0]);
    let ptrs: Vec<_> = (0..1000)
        .map(|_| manager.create_allocation(kb(1), &props).unwrap())
        .collect();

    group.throughput(Throughput::Elements(ptrs.len() as u64));
    group.bench_function("get_record_interior_1000x", |b| {
        b.iter(|| {
            for ptr in &ptrs {
                black_box(manager.get_record(ptr.offset(17)));
            }
        })
    });
    group.bench_function("pooled_base_ptr_1000x", |b| {
        b.iter(|| {
            for ptr in &ptrs {
                black_box(manager.get_pooled_allocation_base_ptr(ptr.offset(17)));
            }
        })
    });

    group.finish();
}

fn bench_residency(c: &mut Criterion) {
    let mut group = c.benchmark_group("residency");
    let manager = manager(UsmConfig::no_pooling());
    let props = AllocationProperties::device(DEV0);
    for _ in 0..256 {
        manager.create_allocation(kb(4), &props).unwrap();
    }
    let ctx: Arc<dyn SubmissionContext> = Arc::new(DummyContext::new(1, DEV0));
    manager.make_internal_allocations_resident(&ctx, 1);

    let mut task = 1;
    group.bench_function("internal_set_unchanged", |b| {
        b.iter(|| {
            task += 1;
            manager.make_internal_allocations_resident(&ctx, task);
        })
    });

    group.finish();
}

criterion_group!(benches, bench_create_free, bench_lookup, bench_residency);
criterion_main!(benches);
