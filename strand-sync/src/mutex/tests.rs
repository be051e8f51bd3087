use super::*;
use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::sync::Mutex as StdMutex;

#[test]
fn try_lock_excludes() {
    let _trace = crate::util::test::trace_init();
    let mutex = Mutex::new();
    let first = mutex.try_lock().expect("unlocked mutex");
    assert!(mutex.is_locked());
    assert!(mutex.try_lock().is_none());
    drop(first);
    assert!(!mutex.is_locked());
    assert!(mutex.try_lock().is_some());
}

#[test]
fn handoff_follows_registration_order() {
    let _trace = crate::util::test::trace_init();
    let mutex = Mutex::new();
    let order = Arc::new(StdMutex::new(Vec::new()));

    let first = mutex.lock();
    let second = mutex.lock();
    let third = mutex.lock();
    assert!(first.is_ready());
    assert!(!second.is_ready());
    assert!(!third.is_ready());

    let push = |n: i32| {
        let order = order.clone();
        move |resolved: Promise<Ownership>| {
            let _ownership = resolved.wait().expect("ownership delivered");
            order.lock().unwrap().push(n);
        }
    };
    second.set_callback(push(2)).resume();
    third.set_callback(push(3)).resume();

    let ownership = first.wait().expect("first lock is immediate");
    order.lock().unwrap().push(1);
    drop(ownership);

    assert_eq!(*order.lock().unwrap(), [1, 2, 3]);
}

#[test]
fn dropped_waiter_forwards_ownership() {
    let _trace = crate::util::test::trace_init();
    let mutex = Mutex::new();
    let held = mutex.try_lock().expect("unlocked mutex");

    let mut abandoned = tokio_test::task::spawn(mutex.lock());
    tokio_test::assert_pending!(abandoned.poll());
    drop(abandoned);

    let mut next = tokio_test::task::spawn(mutex.lock());
    tokio_test::assert_pending!(next.poll());

    // Releasing hands ownership to the abandoned waiter, whose discarded
    // token immediately forwards it onward.
    drop(held);
    assert!(next.is_woken());
    let ownership = tokio_test::assert_ready!(next.poll()).expect("ownership forwarded");
    assert!(ownership.owns_lock());
}

#[test]
fn ownership_can_be_held_across_threads() {
    let _trace = crate::util::test::trace_init();
    let mutex = Mutex::new();
    let hits = Arc::new(AtomicUsize::new(0));

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let mutex = mutex.clone();
            let hits = hits.clone();
            std::thread::spawn(move || {
                for _ in 0..100 {
                    let ownership = mutex.lock().wait().expect("lock never cancels");
                    let seen = hits.load(Relaxed);
                    std::thread::yield_now();
                    hits.store(seen + 1, Relaxed);
                    drop(ownership);
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }
    // The non-atomic read-modify-write was serialized by the mutex.
    assert_eq!(hits.load(Relaxed), 400);
}

#[test]
fn release_returns_next_waiter() {
    let _trace = crate::util::test::trace_init();
    let mutex = Mutex::new();
    let mut held = mutex.lock().wait().expect("immediate");

    let mut waiter = tokio_test::task::spawn(mutex.lock());
    tokio_test::assert_pending!(waiter.poll());

    let mut prepared = held.release();
    assert!(!waiter.is_woken(), "resumption is deferred until dispatch");
    let waker = prepared
        .symmetric_transfer()
        .expect("a waiter was queued behind the holder");
    waker.wake();
    assert!(waiter.is_woken());
    let ownership = tokio_test::assert_ready!(waiter.poll()).expect("ownership transferred");
    assert!(ownership.owns_lock());
    drop(held);
}

#[test]
fn multi_lock_acquires_all() {
    let _trace = crate::util::test::trace_init();
    let a = Mutex::new();
    let b = Mutex::new();
    let c = Mutex::new();
    let multi = MultiLock::all([a.clone(), b.clone(), c.clone()]);

    let ownership = multi.lock().wait().expect("uncontended multi-lock");
    assert!(a.try_lock().is_none());
    assert!(b.try_lock().is_none());
    assert!(c.try_lock().is_none());
    drop(ownership);
    assert!(a.try_lock().is_some());
}

#[test]
fn multi_lock_backs_off_when_blocked() {
    let _trace = crate::util::test::trace_init();
    let a = Mutex::new();
    let b = Mutex::new();
    let multi = MultiLock::all([a.clone(), b.clone()]);

    let held_b = b.try_lock().expect("b starts free");
    let mut pending = tokio_test::task::spawn(multi.lock());
    tokio_test::assert_pending!(pending.poll());
    // The failed try-lock of `b` released `a` again.
    assert!(!a.is_locked(), "rollback must release the first mutex");

    drop(held_b);
    assert!(pending.is_woken());
    let ownership = tokio_test::assert_ready!(pending.poll()).expect("all acquired");
    assert!(a.is_locked() && b.is_locked());
    drop(ownership);
    assert!(!a.is_locked() && !b.is_locked());
}

#[test]
fn multi_lock_with_empty_slots() {
    let _trace = crate::util::test::trace_init();
    let a = Mutex::new();
    let multi = MultiLock::new([Some(a.clone()), None, None]);
    let ownership = multi.lock().wait().expect("single real slot");
    assert!(a.is_locked());
    drop(ownership);
    assert!(!a.is_locked());
}

#[test]
fn contended_threads_make_progress() {
    let _trace = crate::util::test::trace_init();
    let a = Mutex::new();
    let b = Mutex::new();
    // Two multi-locks over the same mutexes in opposite order; the rotation
    // strategy must not deadlock.
    let forward = MultiLock::all([a.clone(), b.clone()]);
    let backward = MultiLock::all([b.clone(), a.clone()]);

    let threads: Vec<_> = [forward, backward]
        .into_iter()
        .map(|multi| {
            std::thread::spawn(move || {
                for _ in 0..100 {
                    let ownership = multi.lock().wait().expect("multi-lock never cancels");
                    drop(ownership);
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }
}
