use criterion::{black_box, criterion_group, criterion_main, Criterion};
use strata_store::{BlockConfig, BlockStorage, Compression};
use tempfile::TempDir;

fn bench_write_1mb(c: &mut Criterion) {
    let temp = TempDir::new().unwrap();
    let cfg = BlockConfig::default().with_overwrite(true);
    let store = BlockStorage::open(temp.path(), cfg).unwrap();
    let data: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 251) as u8).collect();

    // Repeated writes of the same value exercise the dedup path after the first
    c.bench_function("block_write_1mb", |b| {
        b.iter(|| store.write_bytes("bench", black_box(&data)).unwrap())
    });
}

fn bench_read_1mb(c: &mut Criterion) {
    let temp = TempDir::new().unwrap();
    let store = BlockStorage::open(temp.path(), BlockConfig::default()).unwrap();
    let data = vec![7u8; 1024 * 1024];
    store.write_bytes("bench", &data).unwrap();

    c.bench_function("block_read_1mb", |b| {
        b.iter(|| store.read_bytes(black_box("bench")).unwrap())
    });
}

fn bench_read_1mb_lz4(c: &mut Criterion) {
    let temp = TempDir::new().unwrap();
    let cfg = BlockConfig::default().with_compression(Compression::Lz4);
    let store = BlockStorage::open(temp.path(), cfg).unwrap();
    let data: Vec<u8> = b"strata ".iter().copied().cycle().take(1024 * 1024).collect();
    store.write_bytes("bench", &data).unwrap();

    c.bench_function("block_read_1mb_lz4", |b| {
        b.iter(|| store.read_bytes(black_box("bench")).unwrap())
    });
}

criterion_group!(benches, bench_write_1mb, bench_read_1mb, bench_read_1mb_lz4);
criterion_main!(benches);
