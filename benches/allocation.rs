use blockstore_rs::{BlockAllocator, BlockStorage, Fat, MemoryMedium, OpenMode, StorageMedium};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

fn new_fat(max_blocks: i32) -> Fat {
    let medium = MemoryMedium::new();
    let stream = medium.open_stream("Cache_bench/fat", OpenMode::ReadWrite).unwrap();
    Fat::initialize(stream, 0, max_blocks).unwrap()
}

fn new_storage(block_size: u32, max_blocks: u64) -> BlockStorage {
    let medium: Arc<dyn StorageMedium> = Arc::new(MemoryMedium::new());
    BlockStorage::open(medium, "bench", block_size, block_size as u64 * max_blocks).unwrap()
}

/// Benchmark allocating 10K blocks
fn bench_allocate_10k(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_10k_blocks");

    for chain in [1usize, 10, 100].iter() {
        group.bench_with_input(BenchmarkId::new("fat", chain), chain, |b, &chain| {
            b.iter(|| {
                let mut fat = new_fat(10_000);
                for _ in 0..10_000 / chain {
                    fat.allocate_block_sequence(chain).unwrap();
                }
                black_box(&fat);
            });
        });
    }

    group.finish();
}

/// Benchmark allocation + release cycles (fragmentation test)
fn bench_alloc_release_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_release_cycle");

    group.bench_function("fat", |b| {
        b.iter(|| {
            let mut fat = new_fat(10_000);
            let mut heads = Vec::new();

            // Allocate
            for _ in 0..100 {
                heads.push(fat.allocate_block_sequence(10).unwrap()[0]);
            }

            // Release every other chain
            for (i, head) in heads.iter().enumerate() {
                if i % 2 == 0 {
                    fat.release_block_sequence(*head).unwrap();
                }
            }

            // Re-allocate into the holes
            for _ in 0..50 {
                fat.allocate_block_sequence(10).unwrap();
            }

            black_box(&fat);
        });
    });

    group.finish();
}

/// Benchmark fragmentation score calculation
fn bench_fragmentation_score(c: &mut Criterion) {
    let mut fat = new_fat(10_000);
    for i in 0..500 {
        let head = fat.allocate_block_sequence(10).unwrap()[0];
        if i % 2 == 0 {
            fat.release_block_sequence(head).unwrap();
        }
    }

    c.bench_function("fragmentation_score/fat", |b| {
        b.iter(|| black_box(fat.fragmentation_score()));
    });
}

/// Benchmark saving and reading entries by size
fn bench_save_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("save_read_by_size");

    for size in [16usize, 512, 4096, 64 * 1024].iter() {
        let content = vec![0xA5u8; *size];

        group.bench_with_input(BenchmarkId::new("save", size), &content, |b, content| {
            b.iter(|| {
                let mut storage = new_storage(512, 4096);
                for _ in 0..16 {
                    black_box(storage.save(content).unwrap());
                }
            });
        });

        let mut storage = new_storage(512, 4096);
        let id = storage.save(&content).unwrap();
        group.bench_with_input(BenchmarkId::new("read", size), &id, |b, &id| {
            b.iter(|| black_box(storage.read(id).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark compacting a store with every other entry removed
fn bench_compact(c: &mut Criterion) {
    c.bench_function("compact/half_removed", |b| {
        b.iter_batched(
            || {
                let mut storage = new_storage(64, 4096);
                let ids: Vec<_> = (0..500).map(|_| storage.save(&[7u8; 200]).unwrap()).collect();
                for id in ids.iter().step_by(2) {
                    storage.remove(*id).unwrap();
                }
                storage
            },
            |mut storage| black_box(storage.compact().unwrap()),
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_allocate_10k,
    bench_alloc_release_cycle,
    bench_fragmentation_score,
    bench_save_read,
    bench_compact
);
criterion_main!(benches);
