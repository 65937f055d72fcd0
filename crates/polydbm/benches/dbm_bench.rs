//! Throughput of the core record operations across back-ends

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use polydbm::{CasValue, Dbm, Params, PolyDbm};

const CLASSES: [&str; 4] = ["TinyDBM", "BabyDBM", "CacheDBM", "StdHashDBM"];
const NUM_RECORDS: usize = 10_000;

fn make_key(id: usize) -> Vec<u8> {
    format!("bench_key_{:08}", id).into_bytes()
}

fn open(class: &str) -> PolyDbm {
    let mut dbm = PolyDbm::new();
    dbm.open("", true, &Params::new().with("dbm", class))
        .expect("open in-memory database");
    dbm
}

fn populated(class: &str) -> PolyDbm {
    let dbm = open(class);
    for i in 0..NUM_RECORDS {
        dbm.set(&make_key(i), b"value", true).expect("set");
    }
    dbm
}

fn bench_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("set");
    for class in CLASSES {
        let dbm = open(class);
        let mut counter = 0usize;
        group.bench_function(BenchmarkId::from_parameter(class), |b| {
            b.iter(|| {
                let _ = dbm.set(&make_key(counter % NUM_RECORDS), b"value", true);
                counter += 1;
            });
        });
    }
    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    for class in CLASSES {
        let dbm = populated(class);
        let mut counter = 0usize;
        group.bench_function(BenchmarkId::from_parameter(class), |b| {
            b.iter(|| {
                black_box(dbm.get(&make_key(counter % NUM_RECORDS)).ok());
                counter += 1;
            });
        });
    }
    group.finish();
}

fn bench_compare_exchange(c: &mut Criterion) {
    let dbm = populated("TinyDBM");
    let mut counter = 0usize;
    c.bench_function("compare_exchange_any", |b| {
        b.iter(|| {
            let key = make_key(counter % NUM_RECORDS);
            let _ = dbm.compare_exchange(&key, CasValue::Any, CasValue::Bytes(b"next"));
            counter += 1;
        });
    });
}

fn bench_increment(c: &mut Criterion) {
    let dbm = open("StdHashDBM");
    c.bench_function("increment", |b| {
        b.iter(|| black_box(dbm.increment(b"counter", 1, 0).ok()));
    });
}

criterion_group!(benches, bench_set, bench_get, bench_compare_exchange, bench_increment);
criterion_main!(benches);
