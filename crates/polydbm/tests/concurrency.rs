//! Randomized multi-threaded workloads checked against a shadow map

use parking_lot::Mutex;
use polydbm::{CasValue, Dbm, Params, PolyDbm, StatusCode};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

const NUM_THREADS: usize = 8;
const NUM_KEYS: usize = 64;
const OPS_PER_THREAD: usize = 2_000;

fn open(params: &str) -> Arc<PolyDbm> {
    let mut dbm = PolyDbm::new();
    dbm.open("", true, &Params::parse(params)).unwrap();
    Arc::new(dbm)
}

fn run_mixed_workload(dbm: Arc<PolyDbm>) {
    let shadow: Arc<Vec<Mutex<Option<Vec<u8>>>>> =
        Arc::new((0..NUM_KEYS).map(|_| Mutex::new(None)).collect());

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let dbm = Arc::clone(&dbm);
            let shadow = Arc::clone(&shadow);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t as u64);
                for i in 0..OPS_PER_THREAD {
                    let slot = rng.gen_range(0..NUM_KEYS);
                    let key = format!("key{:03}", slot);
                    let mut expected = shadow[slot].lock();
                    match rng.gen_range(0..3) {
                        0 => {
                            let value = format!("{}-{}", t, i).into_bytes();
                            dbm.set(key.as_bytes(), &value, true).unwrap();
                            *expected = Some(value);
                        }
                        1 => {
                            let removed = dbm.remove(key.as_bytes());
                            assert_eq!(removed.is_ok(), expected.is_some());
                            *expected = None;
                        }
                        _ => match dbm.get(key.as_bytes()) {
                            Ok(value) => assert_eq!(Some(value), *expected),
                            Err(status) => {
                                assert_eq!(status.code(), StatusCode::NotFoundError);
                                assert!(expected.is_none());
                            }
                        },
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let live = shadow.iter().filter(|slot| slot.lock().is_some()).count();
    assert_eq!(dbm.count().unwrap(), live as i64);
}

#[test]
fn test_mixed_workload_hash() {
    run_mixed_workload(open("dbm=TinyDBM,num_buckets=16"));
}

#[test]
fn test_mixed_workload_tree() {
    run_mixed_workload(open("dbm=BabyDBM"));
}

#[test]
fn test_mixed_workload_sharded() {
    run_mixed_workload(open("dbm=StdHashDBM,num_shards=4"));
}

#[test]
fn test_concurrent_increments() {
    let dbm = open("dbm=StdHashDBM");
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|_| {
            let dbm = Arc::clone(&dbm);
            thread::spawn(move || {
                for _ in 0..500 {
                    dbm.increment(b"counter", 1, 0).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(dbm.increment(b"counter", polydbm::INCREMENT_PROBE, 0).unwrap(), 4_000);
}

#[test]
fn test_transfers_preserve_total() {
    let dbm = open("dbm=StdTreeDBM,num_shards=3");
    let accounts: Vec<String> = (0..10).map(|i| format!("account{}", i)).collect();
    for account in &accounts {
        dbm.set(account.as_bytes(), b"100", true).unwrap();
    }

    // Reads every balance at once while transfers run; a half-applied
    // transfer would show up as a total other than 1000.
    let done = Arc::new(AtomicBool::new(false));
    let snapshots = Arc::new(AtomicUsize::new(0));
    let observer = {
        let dbm = Arc::clone(&dbm);
        let accounts = accounts.clone();
        let done = Arc::clone(&done);
        let snapshots = Arc::clone(&snapshots);
        thread::spawn(move || {
            let keys: Vec<&[u8]> = accounts.iter().map(|a| a.as_bytes()).collect();
            while !done.load(Ordering::SeqCst) || snapshots.load(Ordering::SeqCst) == 0 {
                let balances = dbm.get_multi(&keys).unwrap();
                assert_eq!(balances.len(), accounts.len());
                let total: i64 = balances
                    .values()
                    .map(|v| String::from_utf8_lossy(v).parse::<i64>().unwrap())
                    .sum();
                assert_eq!(total, 1_000);
                snapshots.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let dbm = Arc::clone(&dbm);
            let accounts = accounts.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(100 + t as u64);
                let mut done = 0;
                while done < 200 {
                    let from = &accounts[rng.gen_range(0..accounts.len())];
                    let to = &accounts[rng.gen_range(0..accounts.len())];
                    if from == to {
                        continue;
                    }
                    let from_value = dbm.get(from.as_bytes()).unwrap();
                    let to_value = dbm.get(to.as_bytes()).unwrap();
                    let from_balance: i64 = String::from_utf8_lossy(&from_value).parse().unwrap();
                    let to_balance: i64 = String::from_utf8_lossy(&to_value).parse().unwrap();
                    let new_from = (from_balance - 1).to_string();
                    let new_to = (to_balance + 1).to_string();
                    let expected: [(&[u8], CasValue); 2] = [
                        (from.as_bytes(), CasValue::Bytes(&from_value)),
                        (to.as_bytes(), CasValue::Bytes(&to_value)),
                    ];
                    let desired: [(&[u8], CasValue); 2] = [
                        (from.as_bytes(), CasValue::Bytes(new_from.as_bytes())),
                        (to.as_bytes(), CasValue::Bytes(new_to.as_bytes())),
                    ];
                    match dbm.compare_exchange_multi(&expected, &desired) {
                        Ok(()) => done += 1,
                        Err(status) => assert_eq!(status.code(), StatusCode::InfeasibleError),
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    observer.join().unwrap();
    assert!(snapshots.load(Ordering::SeqCst) > 0);

    let total: i64 = accounts
        .iter()
        .map(|a| {
            let value = dbm.get(a.as_bytes()).unwrap();
            String::from_utf8_lossy(&value).parse::<i64>().unwrap()
        })
        .sum();
    assert_eq!(total, 1_000);
}
