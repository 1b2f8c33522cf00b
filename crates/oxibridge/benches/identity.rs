// Identity registry benchmarks
//
// These benchmarks measure the cost of the lookups every bridging call
// starts with, and of registration as the registry grows.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use oxibridge::{Id, IdentityRegistry, ManagedObject, Origin, managed};

fn populate(registry: &IdentityRegistry, count: usize) -> Vec<(ManagedObject, Id)> {
    (0..count)
        .map(|i| {
            let object = managed(i);
            let native = Id::from_ptr(((i + 1) * 16) as *mut _);
            registry.register(&object, native, Origin::Managed).unwrap();
            (object, native)
        })
        .collect()
}

/// Benchmark forward and backward lookups at several registry sizes.
fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("identity_lookup");

    for size in &[16, 1024, 65536] {
        let registry = IdentityRegistry::with_capacity(*size);
        let pairs = populate(&registry, *size);
        let (object, native) = &pairs[size / 2];

        group.bench_with_input(BenchmarkId::new("native", size), size, |b, _| {
            b.iter(|| registry.lookup_native(black_box(object), Origin::Managed));
        });
        group.bench_with_input(BenchmarkId::new("managed", size), size, |b, _| {
            b.iter(|| registry.lookup_managed(black_box(*native), Origin::Managed));
        });
    }

    group.finish();
}

/// Benchmark a register/remove cycle against a populated registry.
fn bench_register(c: &mut Criterion) {
    let registry = IdentityRegistry::with_capacity(1024);
    let _pairs = populate(&registry, 1024);
    let object = managed(u64::MAX);
    let native = Id::from_ptr(0x10_0000 as *mut _);

    c.bench_function("identity_register_remove", |b| {
        b.iter(|| {
            registry
                .register(black_box(&object), native, Origin::Native)
                .unwrap();
            registry.unregister(&object).unwrap();
        });
    });
}

criterion_group!(benches, bench_lookup, bench_register);
criterion_main!(benches);
