use super::*;
use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use strand::{Promise, Task, WhenEach};
use tokio_test::{assert_pending, assert_ready, task};

#[test]
fn broadcast_delivers_to_each_subscriber_once() {
    let _trace = crate::util::test::trace_init();
    let dist = Distributor::<u32>::new();

    let mut first = task::spawn(dist.subscribe(Ident::NONE));
    let mut second = task::spawn(dist.subscribe(Ident::NONE));
    assert_pending!(first.poll());
    assert_pending!(second.poll());
    assert_eq!(dist.subscriber_count(), 2);

    dist.broadcast(10);
    assert_eq!(dist.subscriber_count(), 0);
    assert_eq!(assert_ready!(first.poll()).unwrap(), 10);
    assert_eq!(assert_ready!(second.poll()).unwrap(), 10);

    // Single-shot: a second broadcast reaches nobody.
    dist.broadcast(20);
}

#[test]
fn broadcast_with_collects_resumptions_in_registration_order() {
    let _trace = crate::util::test::trace_init();
    let dist = Distributor::<u32>::new();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    for id in 0..3 {
        let order = order.clone();
        dist.subscribe(Ident::NONE)
            .set_callback(move |resolved| {
                resolved.wait().unwrap();
                order.lock().unwrap().push(id);
            })
            .resume();
    }

    let mut buffer = Vec::new();
    dist.broadcast_with(&mut buffer, 1);
    assert_eq!(buffer.len(), 3);
    assert!(order.lock().unwrap().is_empty(), "dispatch is deferred");
    buffer.clear();
    assert_eq!(*order.lock().unwrap(), [0, 1, 2]);
}

#[test]
fn kick_out_by_ident() {
    let _trace = crate::util::test::trace_init();
    let dist = Distributor::<u32>::new();
    let ident = Ident::unique();

    let mut kicked = task::spawn(dist.subscribe(ident));
    let mut kept = task::spawn(dist.subscribe(Ident::NONE));
    assert_pending!(kicked.poll());
    assert_pending!(kept.poll());

    dist.kick_out(ident).resume();
    assert!(kicked.is_woken());
    assert!(matches!(
        assert_ready!(kicked.poll()),
        Err(strand::AwaitError::Cancelled)
    ));

    dist.kick_out_fault(Ident::unique(), Fault::msg("nobody"))
        .resume();
    dist.broadcast(5);
    assert_eq!(assert_ready!(kept.poll()).unwrap(), 5);
}

#[test]
fn alert_refuses_registration_when_set() {
    let _trace = crate::util::test::trace_init();
    let dist = Distributor::<u32>::new();
    let flag = AlertFlag::new();
    flag.set();
    let refused = dist.subscribe_alertable(&flag);
    assert!(matches!(
        refused.wait(),
        Err(strand::AwaitError::Cancelled)
    ));
    assert_eq!(dist.subscriber_count(), 0);
}

#[test]
fn alert_evicts_registered_subscriber() {
    let _trace = crate::util::test::trace_init();
    let dist = Distributor::<u32>::new();
    let flag = AlertFlag::new();
    let mut waiting = task::spawn(dist.subscribe_alertable(&flag));
    assert_pending!(waiting.poll());

    dist.alert(&flag).resume();
    assert!(flag.is_set());
    assert!(waiting.is_woken());
    assert!(matches!(
        assert_ready!(waiting.poll()),
        Err(strand::AwaitError::Cancelled)
    ));
}

/// The full distributor script: three plain watchers, two alert-aware
/// watchers, four broadcasts interleaved with one kick-out and two alerts.
/// Across all five watchers there are exactly fourteen deliveries.
#[test]
fn broadcast_script_counts_fourteen_resumptions() {
    let _trace = crate::util::test::trace_init();
    let dist = Distributor::<i32>::new();
    let resumes = Arc::new(AtomicUsize::new(0));

    fn plain_watcher(
        dist: &Distributor<i32>,
        ident: Ident,
        resumes: &Arc<AtomicUsize>,
    ) -> Promise<()> {
        let dist = dist.clone();
        let resumes = resumes.clone();
        Promise::from_task(Task::new(async move {
            let mut expected = 10;
            while expected <= 40 {
                match dist.subscribe(ident).await {
                    Ok(value) => {
                        resumes.fetch_add(1, Relaxed);
                        assert_eq!(value, expected);
                        expected += 10;
                    }
                    Err(_) => break,
                }
            }
        }))
    }

    fn alert_watcher(
        dist: &Distributor<i32>,
        flag: &AlertFlag,
        resumes: &Arc<AtomicUsize>,
    ) -> Promise<()> {
        let dist = dist.clone();
        let flag = flag.clone();
        let resumes = resumes.clone();
        Promise::from_task(Task::new(async move {
            let mut expected = 10;
            loop {
                match dist.subscribe_alertable(&flag).await {
                    Ok(value) => {
                        resumes.fetch_add(1, Relaxed);
                        assert_eq!(value, expected);
                        expected += 10;
                    }
                    Err(_) => break,
                }
            }
        }))
    }

    let ident_a = Ident::unique();
    let ident_b = Ident::unique();
    let ident_c = Ident::unique();
    let alert_d = AlertFlag::new();
    let alert_e = AlertFlag::new();

    let mut watchers = [
        plain_watcher(&dist, ident_a, &resumes),
        plain_watcher(&dist, ident_b, &resumes),
        plain_watcher(&dist, ident_c, &resumes),
        alert_watcher(&dist, &alert_d, &resumes),
        alert_watcher(&dist, &alert_e, &resumes),
    ];
    let each = WhenEach::new();
    for (uid, watcher) in watchers.iter_mut().enumerate() {
        each.add(watcher, uid as u32).resume();
    }

    // Round one: everyone receives 10, but the fifth watcher is alerted
    // before the buffered resumptions run, so it re-registers into a set
    // flag and drops out.
    let mut buffer = Vec::new();
    dist.broadcast_with(&mut buffer, 10);
    dist.alert(&alert_e).resume();
    buffer.clear();
    assert_eq!(each.next().wait().unwrap(), 4);

    // Round two: 20 for the four remaining, then the second watcher is
    // kicked out by identity.
    dist.broadcast(20);
    dist.kick_out(ident_b).resume();
    assert_eq!(each.next().wait().unwrap(), 1);

    // Round three: 30 for the three remaining, then the fourth is alerted
    // out of its registration.
    dist.broadcast(30);
    dist.alert(&alert_d).resume();
    assert!(alert_d.is_set());
    assert_eq!(each.next().wait().unwrap(), 3);

    // Round four: the two survivors receive 40 and finish.
    dist.broadcast(40);
    let mut finishers = [each.next().wait().unwrap(), each.next().wait().unwrap()];
    finishers.sort();
    assert_eq!(finishers, [0, 2]);

    assert_eq!(resumes.load(Relaxed), 14);
}
