use super::*;
use crate::outcome::AwaitError;
use crate::task::{is_detached, Task};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::Relaxed};
use std::time::Duration;
use tokio_test::{assert_pending, assert_ready, task};

type Slot<T> = Arc<Mutex<Option<Completion<T>>>>;

fn slot<T>() -> Slot<T> {
    Arc::new(Mutex::new(None))
}

/// Completes a promise from a freshly spawned OS thread after `ms`.
fn thread_sleep(ms: u64) -> Promise<()> {
    Promise::from_fn(move |completion| {
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(ms));
            completion.complete(()).resume();
        });
    })
}

#[test]
fn resolved_constructors() {
    let _trace = crate::util::test::trace_init();
    assert!(Promise::from_value(7).is_ready());
    assert_eq!(Promise::from_value(7).wait().unwrap(), 7);
    assert!(matches!(
        Promise::<u32>::empty().wait(),
        Err(AwaitError::Cancelled)
    ));
    assert_eq!(Promise::<u32>::default().wait().unwrap(), 0);
}

#[test]
fn synchronous_producer() {
    let _trace = crate::util::test::trace_init();
    let promise = Promise::from_fn(|completion| completion.complete(5));
    assert!(!promise.is_ready(), "producer must not run before the await");
    assert_eq!(promise.wait().unwrap(), 5);
}

#[test]
fn producer_runs_once_on_first_poll() {
    let _trace = crate::util::test::trace_init();
    let runs = Arc::new(AtomicUsize::new(0));
    let promise = {
        let runs = runs.clone();
        Promise::from_fn(move |completion| {
            runs.fetch_add(1, Relaxed);
            completion.complete(1)
        })
    };
    let mut task = task::spawn(promise);
    assert_eq!(assert_ready!(task.poll()).unwrap(), 1);
    assert_eq!(runs.load(Relaxed), 1);
}

#[test]
fn deferred_completion_wakes_consumer() {
    let _trace = crate::util::test::trace_init();
    let slot: Slot<u32> = slot();
    let promise = {
        let slot = slot.clone();
        Promise::from_fn(move |completion| {
            *slot.lock().unwrap() = Some(completion);
        })
    };
    let mut task = task::spawn(promise);
    assert_pending!(task.poll());

    let completion = slot.lock().unwrap().take().unwrap();
    completion.complete(9).resume();

    assert!(task.is_woken());
    assert_eq!(assert_ready!(task.poll()).unwrap(), 9);
}

#[test]
fn dropped_completion_cancels() {
    let _trace = crate::util::test::trace_init();
    let promise: Promise<u32> = Promise::from_fn(|completion| drop(completion));
    assert!(matches!(promise.wait(), Err(AwaitError::Cancelled)));
}

#[test]
fn failed_completion_carries_fault() {
    let _trace = crate::util::test::trace_init();
    let promise: Promise<u32> =
        Promise::from_fn(|completion| completion.fail(std::io::Error::other("nope")));
    match promise.wait() {
        Err(AwaitError::Fault(fault)) => assert_eq!(fault.to_string(), "nope"),
        other => panic!("expected fault, got {other:?}"),
    }
}

#[test]
fn cross_thread_completion() {
    let _trace = crate::util::test::trace_init();
    let id = Promise::from_task(Task::new(async {
        thread_sleep(5).await.unwrap();
        std::thread::current().id()
    }));
    // The task resumed on the sleeper thread, not here.
    assert_ne!(id.wait().unwrap(), std::thread::current().id());
}

#[test]
fn nested_tasks_resolve_through_stored_completion() {
    let _trace = crate::util::test::trace_init();
    let slot: Slot<i32> = slot();

    let inner = {
        let slot = slot.clone();
        Task::new(async move {
            let source = Promise::from_fn(move |completion| {
                *slot.lock().unwrap() = Some(completion);
            });
            source.await.unwrap()
        })
    };
    let outer = Task::new(async move {
        Promise::from_task(inner).await.unwrap() + 1
    });

    let mut join = task::spawn(Promise::from_task(outer));
    assert_pending!(join.poll());

    let completion = slot.lock().unwrap().take().unwrap();
    completion.complete(41).resume();

    assert!(join.is_woken());
    assert_eq!(assert_ready!(join.poll()).unwrap(), 42);
}

#[test]
fn has_value_resolves_in_place() {
    let _trace = crate::util::test::trace_init();
    let mut promise = Promise::from_fn(|completion| completion.complete(3));
    let mut probe = task::spawn(async move {
        let has = promise.has_value().await;
        (has, promise.await.unwrap())
    });
    assert_eq!(assert_ready!(probe.poll()), (true, 3));

    let mut empty = Promise::<u32>::empty();
    let mut probe = task::spawn(async move { empty.is_empty().await });
    assert!(assert_ready!(probe.poll()));
}

#[test]
fn get_maps_empty_to_none() {
    let _trace = crate::util::test::trace_init();
    let mut probe = task::spawn(async {
        let a = Promise::from_value(1).get().await;
        let b = Promise::<u32>::empty().get().await;
        (a, b)
    });
    let (a, b) = assert_ready!(probe.poll());
    assert_eq!(a.unwrap(), Some(1));
    assert_eq!(b.unwrap(), None);
}

#[test]
fn set_callback_defers_producer_start() {
    let _trace = crate::util::test::trace_init();
    let started = Arc::new(AtomicBool::new(false));
    let delivered = Arc::new(Mutex::new(None));

    let promise = {
        let started = started.clone();
        Promise::from_fn(move |completion| {
            started.store(true, Relaxed);
            completion.complete(11)
        })
    };
    let prepared = {
        let delivered = delivered.clone();
        promise.set_callback(move |resolved| {
            *delivered.lock().unwrap() = Some(resolved.wait().unwrap());
        })
    };
    assert!(!started.load(Relaxed), "producer must wait for the handle");
    assert!(delivered.lock().unwrap().is_none());

    prepared.resume();
    assert!(started.load(Relaxed));
    assert_eq!(*delivered.lock().unwrap(), Some(11));
}

#[test]
fn set_callback_on_resolved_runs_inline() {
    let _trace = crate::util::test::trace_init();
    let delivered = Arc::new(Mutex::new(None));
    let prepared = {
        let delivered = delivered.clone();
        Promise::from_value(4).set_callback(move |resolved| {
            *delivered.lock().unwrap() = Some(resolved.wait().unwrap());
        })
    };
    assert!(!prepared.is_some());
    assert_eq!(*delivered.lock().unwrap(), Some(4));
}

#[test]
fn dropping_promise_detaches_closure_producer() {
    let _trace = crate::util::test::trace_init();
    let observed_detached = Arc::new(AtomicBool::new(false));
    let promise: Promise<u32> = {
        let observed = observed_detached.clone();
        Promise::from_fn(move |completion| {
            observed.store(!completion.is_connected(), Relaxed);
        })
    };
    drop(promise);
    assert!(
        observed_detached.load(Relaxed),
        "the closure runs detached when its promise is dropped"
    );
}

#[test]
fn dropping_promise_cancels_unstarted_task() {
    let _trace = crate::util::test::trace_init();
    let ran = Arc::new(AtomicBool::new(false));
    let promise = {
        let ran = ran.clone();
        Promise::from_task(Task::new(async move {
            ran.store(true, Relaxed);
        }))
    };
    drop(promise);
    assert!(!ran.load(Relaxed), "tasks are cancelled, not detached");
}

#[test]
fn destroying_a_bound_unstarted_task_cancels_its_consumer() {
    let _trace = crate::util::test::trace_init();
    let slot: Slot<u32> = slot();
    let promise = {
        let slot = slot.clone();
        Promise::from_fn(move |completion| {
            *slot.lock().unwrap() = Some(completion);
        })
    };
    let mut consumer = task::spawn(promise);
    assert_pending!(consumer.poll());

    let completion = slot.lock().unwrap().take().unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let bound = {
        let ran = ran.clone();
        Task::new(async move {
            ran.store(true, Relaxed);
            5u32
        })
    };
    let mut prepared = bound.start(completion);
    let waker = prepared
        .symmetric_transfer()
        .expect("start hands back the task's first resumption");
    // Dropping the bare waker (without waking it) destroys the bound,
    // never-started task: the body must not run, and its completion's drop
    // path must resolve the consumer to Empty.
    drop(waker);

    assert!(!ran.load(Relaxed), "a destroyed task never polls its body");
    assert!(consumer.is_woken());
    assert!(matches!(
        assert_ready!(consumer.poll()),
        Err(AwaitError::Cancelled)
    ));
}

#[test]
fn dropping_task_handle_runs_it_detached() {
    let _trace = crate::util::test::trace_init();
    let ran = Arc::new(AtomicBool::new(false));
    let detached = Arc::new(AtomicBool::new(false));
    {
        let ran = ran.clone();
        let detached = detached.clone();
        drop(Task::new(async move {
            ran.store(true, Relaxed);
            detached.store(is_detached().await, Relaxed);
        }));
    }
    assert!(ran.load(Relaxed));
    assert!(detached.load(Relaxed));
}

#[test]
fn is_detached_reports_live_consumer() {
    let _trace = crate::util::test::trace_init();
    let promise = Promise::from_task(Task::new(async { is_detached().await }));
    assert_eq!(promise.wait().unwrap(), false);
}

#[test]
fn detach_starts_the_producer() {
    let _trace = crate::util::test::trace_init();
    let ran = Arc::new(AtomicBool::new(false));
    let promise = {
        let ran = ran.clone();
        Promise::from_task(Task::new(async move {
            ran.store(true, Relaxed);
        }))
    };
    promise.detach();
    assert!(ran.load(Relaxed));
}

#[test]
fn task_panic_is_transported() {
    let _trace = crate::util::test::trace_init();
    let promise: Promise<u32> = Promise::from_task(Task::new(async { panic!("boom") }));
    match promise.wait() {
        Err(AwaitError::Fault(fault)) => {
            assert!(fault.is_panic());
            assert!(fault.to_string().contains("boom"));
        }
        other => panic!("expected panic fault, got {other:?}"),
    }
}

#[test]
fn completion_drop_during_unwind_faults() {
    let _trace = crate::util::test::trace_init();
    let promise: Promise<u32> = Promise::from_task(Task::new(async {
        let inner: Promise<u32> = Promise::from_fn::<_, ()>(|completion| {
            let _completion = completion;
            panic!("producer exploded");
        });
        inner.await.unwrap()
    }));
    match promise.wait() {
        Err(AwaitError::Fault(fault)) => assert!(fault.is_panic()),
        other => panic!("expected fault, got {other:?}"),
    }
}

#[test]
fn released_completion_rebinds() {
    let _trace = crate::util::test::trace_init();
    let slot = Arc::new(Mutex::new(None));
    let promise = {
        let slot = slot.clone();
        Promise::from_fn(move |completion| {
            *slot.lock().unwrap() = Some(completion.release());
        })
    };
    let mut task = task::spawn(promise);
    assert_pending!(task.poll());

    let released = slot.lock().unwrap().take().unwrap();
    released.rebind().complete(8).resume();
    assert_eq!(assert_ready!(task.poll()).unwrap(), 8);
}

#[test]
fn deep_task_chain_completes_iteratively() {
    let _trace = crate::util::test::trace_init();

    fn chain(n: u32) -> Promise<u32> {
        if n == 0 {
            return Promise::from_value(0);
        }
        Promise::from_task(Task::new(async move { chain(n - 1).await.unwrap() + 1 }))
    }

    // Deep enough that recursive resumption would overflow the stack; the
    // trampoline must keep both the start and completion cascades flat.
    assert_eq!(chain(10_000).wait().unwrap(), 10_000);
}

#[test]
#[should_panic(expected = "invalid promise state")]
fn polling_consumed_promise_panics() {
    let mut promise = Promise::from_value(1);
    let waker = crate::frame::Parker::new().waker();
    let mut cx = Context::from_waker(&waker);
    let _ = promise.poll_take(&mut cx);
    let _ = promise.poll_take(&mut cx);
}

#[test]
fn works_under_a_foreign_executor() {
    let _trace = crate::util::test::trace_init();
    let value = futures::executor::block_on(async {
        let nested = Promise::from_task(Task::new(async {
            Promise::from_fn(|completion| completion.complete(40)).await.unwrap() + 2
        }));
        nested.await.unwrap()
    });
    assert_eq!(value, 42);
}

#[test]
fn send_and_sync() {
    crate::util::test::assert_send::<Promise<u32>>();
    crate::util::test::assert_send::<Completion<u32>>();
    crate::util::test::assert_send_sync::<Completion<u32>>();
}
