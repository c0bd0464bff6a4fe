// InstanceCache integration suite (consolidated).
//
// Each test documents what behavior is being verified and which
// invariants are assumed or asserted. The core invariants exercised:
// - Single-flight: one construction per key under a caller stampede,
//   every caller sharing the identical Arc.
// - Override chain: a forced construction supersedes an in-flight one
//   and its result is observed by every waiter, including those that
//   started waiting before the override was issued.
// - Ownership: every key maps to exactly one instance; put moves a key
//   between instances and reports the displaced owner.
// - Reclamation: dropping the last external Arc makes the entry vanish
//   on the next reconcile pass.
// - Failure delivery: a construction failure reaches every waiter and
//   is never retried by the cache itself.
use singleflight_map::{CacheError, InstanceCache};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

fn string_cache() -> InstanceCache<String, String> {
    InstanceCache::new(|key: &String| Ok(Arc::new(key.to_uppercase())))
}

// Test: single-flight under a stampede.
// Assumes: only the caller that ends up owning the builder runs its
// construction function; all others join and wait.
// Verifies: the function runs exactly once and all callers receive the
// identical Arc.
#[test]
fn stampede_constructs_once() {
    const CALLERS: usize = 16;
    let cache = string_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let barrier = Barrier::new(CALLERS);
    let key = "scan:42".to_string();

    let results: Vec<Arc<String>> = thread::scope(|s| {
        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                s.spawn(|| {
                    let calls = Arc::clone(&calls);
                    barrier.wait();
                    cache
                        .get_or_construct_with(&key, move |k: &String| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(20));
                            Ok(Arc::new(k.to_uppercase()))
                        })
                        .expect("construction succeeds")
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in &results[1..] {
        assert!(Arc::ptr_eq(&results[0], result));
    }
    assert_eq!(*results[0], "SCAN:42");
}

// Test: idempotent get after construction.
// Assumes: a finished construction is visible to get before and after
// reconciliation.
// Verifies: get returns the constructed Arc without re-invoking the
// construction function.
#[test]
fn get_after_construct_is_idempotent() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    let cache: InstanceCache<String, String> = InstanceCache::new(move |key: &String| {
        counted.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(key.to_uppercase()))
    });
    let key = "a".to_string();

    let built = cache.get_or_construct(&key).expect("construct");
    let before_reconcile = cache.get(&key).expect("visible before reconcile");
    assert!(Arc::ptr_eq(&built, &before_reconcile));

    cache.reconcile().expect("reconcile");
    let after_reconcile = cache.get(&key).expect("visible after reconcile");
    assert!(Arc::ptr_eq(&built, &after_reconcile));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// Test: override precedence.
// Assumes: construct_with appends at the chain tail and the tail result
// is authoritative for the whole chain.
// Verifies: with a slow construction in flight, callers that were
// already waiting, the slow construction's own caller, and get all end
// up observing the override's result, never the superseded one.
#[test]
fn forced_override_wins_for_all_waiters() {
    let cache = Arc::new(string_cache());
    let key = "k".to_string();
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let slow_cache = Arc::clone(&cache);
    let slow_key = key.clone();
    let slow = thread::spawn(move || {
        slow_cache.get_or_construct_with(&slow_key, move |_| {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            Ok(Arc::new("first".to_string()))
        })
    });
    started_rx.recv().unwrap();

    // While the construction is in flight, get must not block and must
    // not see a result yet.
    assert!(cache.get(&key).is_none());

    let waiter_cache = Arc::clone(&cache);
    let waiter_key = key.clone();
    let waiter = thread::spawn(move || waiter_cache.get_or_construct(&waiter_key));
    // Give the waiter a moment to join the in-flight chain.
    thread::sleep(Duration::from_millis(20));

    let forced = cache
        .construct_with(&key, |_| Ok(Arc::new("second".to_string())))
        .expect("override construction");
    assert_eq!(*forced, "second");

    release_tx.send(()).unwrap();
    let from_slow = slow.join().unwrap().expect("superseded caller result");
    let from_waiter = waiter.join().unwrap().expect("waiter result");
    assert!(Arc::ptr_eq(&forced, &from_slow));
    assert!(Arc::ptr_eq(&forced, &from_waiter));

    cache.reconcile().expect("reconcile");
    let current = cache.get(&key).expect("mapped");
    assert!(Arc::ptr_eq(&forced, &current));
}

// Test: key displacement via put.
// Assumes: an instance in the map may be attached to further keys.
// Verifies: put moves the key, reports the displaced owner, and key
// sets update on both sides.
#[test]
fn put_displaces_previous_owner() {
    let cache = string_cache();
    let k1 = "one".to_string();
    let k2 = "two".to_string();
    let i1 = cache.get_or_construct(&k1).expect("construct one");
    let i2 = cache.get_or_construct(&k2).expect("construct two");
    cache.reconcile().expect("reconcile");

    let displaced = cache.put(&k1, &i2).expect("put recognized instance");
    assert!(Arc::ptr_eq(displaced.as_ref().expect("displaced"), &i1));

    let now = cache.get(&k1).expect("mapped");
    assert!(Arc::ptr_eq(&now, &i2));
    let keys_of_i1 = cache.keys_for(&i1).expect("i1 still tracked");
    assert!(!keys_of_i1.contains(&k1));
    let keys_of_i2 = cache.keys_for(&i2).expect("i2 tracked");
    assert!(keys_of_i2.contains(&k1) && keys_of_i2.contains(&k2));
}

// Test: put with a foreign instance.
// Assumes: outside a construction, only instances the cache originated
// are accepted.
// Verifies: UnrecognizedInstance, and the cache is left untouched.
#[test]
fn put_rejects_foreign_instance() {
    let cache = string_cache();
    let foreign = Arc::new("foreign".to_string());
    let err = cache.put(&"k".to_string(), &foreign).unwrap_err();
    assert!(matches!(err, CacheError::UnrecognizedInstance));
    assert!(cache.is_empty());
}

// Test: put from inside a construction function.
// Assumes: a construction function may hand the cache additional
// instances under other keys via put.
// Verifies: the put value is installed for the other key after
// reconciliation.
#[test]
fn put_inside_construction_installs_value() {
    let cache = Arc::new(string_cache());
    let side_cache = Arc::clone(&cache);
    let main_key = "main".to_string();
    let side_key = "side".to_string();
    let side_for_closure = side_key.clone();
    // Keeps the side value externally reachable; the cache itself only
    // holds it weakly once reconciled.
    let side_holder: Arc<Mutex<Option<Arc<String>>>> = Arc::new(Mutex::new(None));
    let holder = Arc::clone(&side_holder);

    let built = cache
        .get_or_construct_with(&main_key, move |_| {
            let side_value = Arc::new("SIDE".to_string());
            side_cache
                .put(&side_for_closure, &side_value)
                .map_err(|e| -> singleflight_map::BoxedError { Box::new(e) })?;
            *holder.lock().unwrap() = Some(side_value);
            Ok(Arc::new("MAIN".to_string()))
        })
        .expect("construct");
    assert_eq!(*built, "MAIN");

    cache.reconcile().expect("reconcile");
    let side = cache.get(&side_key).expect("side value installed");
    assert_eq!(*side, "SIDE");
}

// Test: remove detaches the key only.
// Assumes: an instance stays tracked while externally reachable.
// Verifies: remove returns the owner, get misses afterwards, and the
// instance remains visible through instances().
#[test]
fn remove_detaches_key_and_keeps_instance() {
    let cache = string_cache();
    let key = "k".to_string();
    let instance = cache.get_or_construct(&key).expect("construct");
    cache.reconcile().expect("reconcile");

    let removed = cache.remove(&key).expect("remove").expect("was mapped");
    assert!(Arc::ptr_eq(&removed, &instance));
    assert!(cache.get(&key).is_none());
    assert!(cache
        .instances()
        .iter()
        .any(|i| Arc::ptr_eq(i, &instance)));
}

// Test: remove of a key whose construction is still in flight.
// Assumes: remove drops the builder record without blocking; the
// construction keeps running and still delivers its result to the
// owner and to every joined waiter.
// Verifies: remove returns None, both the owner and a waiter that had
// already parked receive the construction's Arc, the key is free, and
// the result stays tracked keyless while externally reachable.
#[test]
fn remove_during_construction_keeps_waiters() {
    let cache = Arc::new(string_cache());
    let key = "k".to_string();
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let owner_cache = Arc::clone(&cache);
    let owner_key = key.clone();
    let owner = thread::spawn(move || {
        owner_cache.get_or_construct_with(&owner_key, move |_| {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            Ok(Arc::new("built".to_string()))
        })
    });
    started_rx.recv().unwrap();

    let waiter_cache = Arc::clone(&cache);
    let waiter_key = key.clone();
    let waiter = thread::spawn(move || waiter_cache.get_or_construct(&waiter_key));
    // Give the waiter a moment to join the in-flight chain.
    thread::sleep(Duration::from_millis(20));

    let removed = cache.remove(&key).expect("remove");
    assert!(removed.is_none());

    release_tx.send(()).unwrap();
    let from_owner = owner.join().unwrap().expect("owner result");
    let from_waiter = waiter.join().unwrap().expect("waiter result");
    assert_eq!(*from_owner, "built");
    assert!(Arc::ptr_eq(&from_owner, &from_waiter));

    cache.reconcile().expect("reconcile");
    assert!(cache.get(&key).is_none());
    assert!(cache.keys_for(&from_owner).expect("tracked").is_empty());
}

// Test: clear_keys_for detaches every key of one instance.
// Verifies: the detached set is returned and subsequent keys_for is
// empty while the instance stays tracked.
#[test]
fn clear_keys_for_detaches_all_keys() {
    let cache = string_cache();
    let k1 = "one".to_string();
    let k2 = "alias".to_string();
    let instance = cache.get_or_construct(&k1).expect("construct");
    cache.reconcile().expect("reconcile");
    cache.put(&k2, &instance).expect("alias key");

    let cleared = cache.clear_keys_for(&instance).expect("clear");
    assert!(cleared.contains(&k1) && cleared.contains(&k2));
    assert!(cache.get(&k1).is_none());
    assert!(cache.get(&k2).is_none());
    assert!(cache.keys_for(&instance).expect("still tracked").is_empty());
}

// Test: reclamation after the last external Arc drops.
// Assumes: the cache holds instances weakly; reconcile prunes dead
// entries deterministically.
// Verifies: the key disappears from keys() and len() drops to zero.
#[test]
fn dropped_instance_is_reclaimed_on_reconcile() {
    let cache = string_cache();
    let key = "gone".to_string();
    let instance = cache.get_or_construct(&key).expect("construct");
    cache.reconcile().expect("reconcile");
    assert!(cache.keys().contains(&key));
    assert_eq!(cache.len(), 1);

    drop(instance);
    cache.reconcile().expect("reconcile");
    assert!(!cache.keys().contains(&key));
    assert!(cache.is_empty());
    assert!(cache.get(&key).is_none());
}

// Test: construction failure fan-out.
// Assumes: a failure is recorded on the builder and cloned to every
// waiter; the cache never retries on its own.
// Verifies: all concurrent callers get a Construction error; after a
// reconcile the key is free and a fresh construction succeeds.
#[test]
fn construction_failure_reaches_every_waiter() {
    const CALLERS: usize = 8;
    let cache = string_cache();
    let key = "bad".to_string();
    let barrier = Barrier::new(CALLERS);

    let results: Vec<Result<Arc<String>, CacheError>> = thread::scope(|s| {
        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    cache.get_or_construct_with(&key, |_| {
                        thread::sleep(Duration::from_millis(10));
                        Err("backing store unavailable".into())
                    })
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for result in results {
        assert!(matches!(result, Err(CacheError::Construction(_))));
    }

    // The failed chain is dropped by reconciliation; the key is free.
    cache.reconcile().expect("reconcile");
    let recovered = cache.get_or_construct(&key).expect("fresh construction");
    assert_eq!(*recovered, "BAD");
}

// Test: construct-inside-construct is rejected.
// Verifies: NestedConstruct instead of a deadlock, and the outer
// construction still completes.
#[test]
fn nested_construct_is_rejected() {
    let cache = Arc::new(string_cache());
    let inner_cache = Arc::clone(&cache);
    let observed = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&observed);

    let built = cache
        .get_or_construct_with(&"outer".to_string(), move |_| {
            let err = inner_cache
                .get_or_construct(&"inner".to_string())
                .unwrap_err();
            *sink.lock().unwrap() = Some(err);
            Ok(Arc::new("OUTER".to_string()))
        })
        .expect("outer construction");
    assert_eq!(*built, "OUTER");
    assert!(matches!(
        observed.lock().unwrap().take(),
        Some(CacheError::NestedConstruct)
    ));
}

// Test: filtered scan and counting.
// Verifies: find_where honors the predicate and the limit; len counts
// distinct live instances.
#[test]
fn find_where_and_len() {
    let cache = string_cache();
    let held: Vec<Arc<String>> = ["a", "b", "c"]
        .iter()
        .map(|key| cache.get_or_construct(&key.to_string()).expect("construct"))
        .collect();
    cache.reconcile().expect("reconcile");
    let all = cache.instances();
    assert_eq!(all.len(), held.len());
    assert_eq!(cache.len(), 3);

    let found = cache.find_where(|i| i.as_str() > "A", 0);
    assert_eq!(found.len(), 2);
    let limited = cache.find_where(|_| true, 2);
    assert_eq!(limited.len(), 2);
}
