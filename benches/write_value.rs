//! Hot-path benchmarks for the mmap dictionary.
//!
//! The overwrite path is what every counter increment after the first
//! becomes, so it is the number that matters for per-request overhead. The
//! append path shows the cost of first-touch and file growth.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use promdb::storage::{MmapedDict, MmapedFile};
use promdb::storage::page_size;
use tempfile::tempdir;

fn bench_overwrite(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let file = MmapedFile::open(&dir.path().join("counter_bench-0.db"), page_size()).unwrap();
    let mut dict = MmapedDict::new(file).unwrap();

    let key = br#"["requests","requests",["code","method"],["200","get"]]"#;
    dict.write_value(key, 0.0).unwrap();

    let mut value = 0.0f64;
    c.bench_function("write_value/overwrite", |b| {
        b.iter(|| {
            value += 1.0;
            dict.write_value(black_box(key), black_box(value)).unwrap();
        })
    });
}

fn bench_read(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let file = MmapedFile::open(&dir.path().join("counter_bench-0.db"), page_size()).unwrap();
    let mut dict = MmapedDict::new(file).unwrap();

    let key = br#"["requests","requests",["code","method"],["200","get"]]"#;
    dict.write_value(key, 42.0).unwrap();

    c.bench_function("write_value/read", |b| {
        b.iter(|| dict.read_value(black_box(key)).unwrap())
    });
}

fn bench_append(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let file = MmapedFile::open(&dir.path().join("counter_append-0.db"), page_size()).unwrap();
    let mut dict = MmapedDict::new(file).unwrap();

    let mut i = 0u64;
    c.bench_function("write_value/append_new_key", |b| {
        b.iter(|| {
            i += 1;
            let key = format!(r#"["m","m",["n"],["{i}"]]"#);
            dict.write_value(black_box(key.as_bytes()), 1.0).unwrap();
        })
    });
}

criterion_group!(benches, bench_overwrite, bench_read, bench_append);
criterion_main!(benches);
