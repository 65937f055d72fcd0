//! Integration tests for the async adapter

use polydbm::{AsyncDbm, CasValue, Dbm, DbmFuture, File, MemoryFile, Params, PolyDbm, StatusCode};
use std::sync::Arc;
use std::time::Duration;

fn open_memory(class: &str) -> Arc<PolyDbm> {
    let mut dbm = PolyDbm::new();
    dbm.open("", true, &Params::new().with("dbm", class)).unwrap();
    Arc::new(dbm)
}

#[test]
fn test_hundred_sets_with_four_workers() {
    let dbm = open_memory("TinyDBM");
    let mut adapter = AsyncDbm::new(Arc::clone(&dbm), 4).unwrap();

    let mut futures: Vec<DbmFuture> = (0..100)
        .map(|i| adapter.set(format!("{:03}", i).as_bytes(), b"value", false))
        .collect();
    for future in &futures {
        assert!(future.wait(Duration::from_secs(10)).unwrap());
    }
    for future in &mut futures {
        future.get().unwrap();
    }
    assert_eq!(dbm.count().unwrap(), 100);

    adapter.destruct();
    let mut dbm = Arc::try_unwrap(dbm).ok().unwrap();
    dbm.close().unwrap();
}

#[test]
fn test_destruct_completes_every_future() {
    let _ = tracing_subscriber::fmt::try_init();
    let dbm = open_memory("StdHashDBM");
    let mut adapter = AsyncDbm::with_queue_capacity(Arc::clone(&dbm), 2, 8).unwrap();
    let futures: Vec<DbmFuture> = (0..200)
        .map(|i| adapter.append(b"log", format!("{}", i % 10).as_bytes(), b""))
        .collect();
    adapter.destruct();
    for future in &futures {
        assert!(future.wait(Duration::ZERO).unwrap());
    }
    assert_eq!(dbm.get(b"log").unwrap().len(), 200);
}

#[test]
fn test_compare_exchange_tasks() {
    let dbm = open_memory("BabyDBM");
    let adapter = AsyncDbm::new(Arc::clone(&dbm), 2).unwrap();
    adapter
        .compare_exchange(b"x", CasValue::Nil, CasValue::Bytes(b"1"))
        .get()
        .unwrap();
    let status = adapter
        .compare_exchange(b"x", CasValue::Nil, CasValue::Bytes(b"2"))
        .get()
        .unwrap_err();
    assert_eq!(status.code(), StatusCode::InfeasibleError);

    adapter.set(b"y", b"1", true).get().unwrap();
    let expected: [(&[u8], CasValue); 2] = [(b"x", "1".into()), (b"y", "1".into())];
    let desired: [(&[u8], CasValue); 2] = [(b"x", CasValue::Nil), (b"y", "2".into())];
    adapter.compare_exchange_multi(&expected, &desired).get().unwrap();
    assert_eq!(dbm.get(b"x").unwrap_err().code(), StatusCode::NotFoundError);
    assert_eq!(dbm.get(b"y").unwrap(), b"2");
}

#[test]
fn test_batch_and_queue_tasks() {
    let dbm = open_memory("StdTreeDBM");
    let adapter = AsyncDbm::new(Arc::clone(&dbm), 3).unwrap();
    let records: [(&[u8], &[u8]); 2] = [(b"a", b"1"), (b"b", b"2")];
    adapter.set_multi(&records, true).get().unwrap();

    let keys: [&[u8]; 3] = [b"a", b"b", b"c"];
    let map = adapter.get_multi(&keys).get_map_str().unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map.get("b").map(String::as_str), Some("2"));

    adapter.rekey(b"a", b"z", false, false).get().unwrap();
    let key = adapter.push_last(b"queued", 1.0).get_bytes().unwrap();
    assert_eq!(key.len(), 8);
    let (first_key, value) = adapter.pop_first().get_pair().unwrap();
    assert_eq!(first_key, key);
    assert_eq!(value, b"queued");

    let removable: [&[u8]; 2] = [b"b", b"z"];
    adapter.remove_multi(&removable).get().unwrap();
    assert_eq!(dbm.count().unwrap(), 0);
}

#[test]
fn test_flat_record_tasks() {
    let src = open_memory("StdHashDBM");
    let dest = open_memory("StdTreeDBM");
    for i in 0..20 {
        src.set(format!("{}", i).as_bytes(), b"v", true).unwrap();
    }
    let mut image = MemoryFile::new();
    image.open("", true, &Params::new()).unwrap();
    let image: Arc<dyn File> = Arc::new(image);

    let source = AsyncDbm::new(Arc::clone(&src), 1).unwrap();
    source.export_to_flat_records(Arc::clone(&image)).get().unwrap();
    let target = AsyncDbm::new(Arc::clone(&dest), 1).unwrap();
    target.import_from_flat_records(Arc::clone(&image)).get().unwrap();
    assert_eq!(dest.count().unwrap(), 20);

    target.clear().get().unwrap();
    let dest_dbm: Arc<dyn Dbm> = dest.clone();
    source.export(dest_dbm).get().unwrap();
    assert_eq!(dest.count().unwrap(), 20);
}

#[test]
fn test_maintenance_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("async.tkh");
    let mut dbm = PolyDbm::new();
    dbm.open(path.to_str().unwrap(), true, &Params::new()).unwrap();
    let dbm = Arc::new(dbm);
    let adapter = AsyncDbm::new(Arc::clone(&dbm), 2).unwrap();

    adapter.set(b"k", b"v", true).get().unwrap();
    adapter.rebuild(&Params::parse("num_buckets=64")).get().unwrap();
    adapter.synchronize(true, &Params::new()).get().unwrap();
    let copy = dir.path().join("copy.tkh");
    adapter
        .copy_file_data(copy.to_str().unwrap(), false)
        .get()
        .unwrap();
    assert!(copy.exists());
    assert_eq!(dbm.get(b"k").unwrap(), b"v");
}
