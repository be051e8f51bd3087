use super::*;
use proptest::prelude::*;
use strand::AwaitError;
use tokio_test::{assert_pending, assert_ready, task};

#[test]
fn push_pop_fifo() {
    let _trace = crate::util::test::trace_init();
    let queue = Queue::with_capacity(4);
    for i in 0..4 {
        assert!(queue.push(i).is_ready());
    }
    assert_eq!(queue.len(), 4);
    for i in 0..4 {
        assert_eq!(queue.pop().wait().unwrap(), i);
    }
    assert!(queue.is_empty());
}

#[test]
fn full_ring_parks_the_producer() {
    let _trace = crate::util::test::trace_init();
    let queue = Queue::with_capacity(1);
    assert!(queue.push(1).is_ready());

    let mut blocked = task::spawn(queue.push(2));
    assert_pending!(blocked.poll());

    // Popping vacates a slot and promotes the parked value into it.
    assert_eq!(queue.pop().wait().unwrap(), 1);
    assert!(blocked.is_woken());
    assert_ready!(blocked.poll()).unwrap();
    assert_eq!(queue.pop().wait().unwrap(), 2);
}

#[test]
fn empty_ring_parks_the_consumer() {
    let _trace = crate::util::test::trace_init();
    let queue = Queue::with_capacity(2);
    let mut blocked = task::spawn(queue.pop());
    assert_pending!(blocked.poll());

    // The handed-over value never touches the ring.
    queue.push(7).wait().unwrap();
    assert!(queue.is_empty());
    assert!(blocked.is_woken());
    assert_eq!(assert_ready!(blocked.poll()).unwrap(), 7);
}

#[test]
fn unawaited_deferred_push_is_abandoned() {
    let _trace = crate::util::test::trace_init();
    let queue = Queue::with_capacity(1);
    assert!(queue.push(1).is_ready());
    drop(queue.push(2));
    assert_eq!(queue.pop().wait().unwrap(), 1);
    assert!(queue.is_empty(), "the abandoned push must not land");
}

#[test]
fn close_fails_parked_consumers_only() {
    let _trace = crate::util::test::trace_init();
    let queue = Queue::with_capacity(2);
    queue.push(1).wait().unwrap();

    let mut parked = task::spawn(queue.pop());
    // Take the buffered item so the second pop really parks.
    assert_eq!(assert_ready!(parked.poll()).unwrap(), 1);
    let mut parked = task::spawn(queue.pop());
    assert_pending!(parked.poll());

    queue.push(2).wait().unwrap();
    // A parked consumer grabbed the push before close.
    assert_ready!(parked.poll()).unwrap();

    let mut parked = task::spawn(queue.pop());
    assert_pending!(parked.poll());
    queue.close(Fault::msg("shutting down"));
    assert!(parked.is_woken());
    match assert_ready!(parked.poll()) {
        Err(AwaitError::Fault(fault)) => assert_eq!(fault.to_string(), "shutting down"),
        other => panic!("expected fault, got {other:?}"),
    }

    // Buffered items still drain after close.
    queue.reopen();
    queue.push(3).wait().unwrap();
    queue.close(Fault::msg("again"));
    assert_eq!(queue.pop().wait().unwrap(), 3);
    assert!(matches!(
        queue.pop().wait(),
        Err(AwaitError::Fault(_))
    ));
}

#[test]
fn clear_unblocks_parked_producers() {
    let _trace = crate::util::test::trace_init();
    let queue = Queue::with_capacity(1);
    assert!(queue.push(1).is_ready());
    let mut blocked = task::spawn(queue.push(2));
    assert_pending!(blocked.poll());

    queue.clear();
    assert!(queue.is_empty());
    assert!(blocked.is_woken());
    assert_ready!(blocked.poll()).unwrap();
}

#[test]
fn concurrent_producers_and_consumers_conserve_items() {
    let _trace = crate::util::test::trace_init();
    let queue = Queue::with_capacity(3);
    let producers: Vec<_> = (0..4u32)
        .map(|p| {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..50u32 {
                    queue.push(p * 1000 + i).wait().unwrap();
                }
            })
        })
        .collect();
    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();
            std::thread::spawn(move || {
                (0..50).map(|_| queue.pop().wait().unwrap()).collect::<Vec<u32>>()
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }
    let mut popped: Vec<u32> = consumers
        .into_iter()
        .flat_map(|consumer| consumer.join().unwrap())
        .collect();
    popped.sort();
    let mut expected: Vec<u32> = (0..4u32)
        .flat_map(|p| (0..50u32).map(move |i| p * 1000 + i))
        .collect();
    expected.sort();
    assert_eq!(popped, expected);
}

#[test]
fn awaitable_under_a_foreign_executor() {
    let _trace = crate::util::test::trace_init();
    let queue = Queue::with_capacity(1);
    futures::executor::block_on(async {
        queue.push(1u32).await.unwrap();
        let consumer = queue.clone();
        assert_eq!(consumer.pop().await.unwrap(), 1);
    });
}

proptest! {
    // Per-side FIFO and conservation under arbitrary single-threaded
    // push/pop interleavings.
    #[test]
    fn sequential_ops_match_a_model(ops in proptest::collection::vec(any::<bool>(), 1..200)) {
        let queue = Queue::with_capacity(2);
        let mut model = std::collections::VecDeque::new();
        let mut next = 0u32;
        for is_push in ops {
            if is_push {
                // Stay within capacity so pushes never park.
                if model.len() < 2 {
                    prop_assert!(queue.push(next).is_ready());
                    model.push_back(next);
                    next += 1;
                }
            } else {
                let popped = queue.pop();
                match model.pop_front() {
                    Some(expected) => {
                        prop_assert_eq!(popped.wait().unwrap(), expected);
                    }
                    None => prop_assert!(!popped.is_ready()),
                }
            }
        }
    }
}
