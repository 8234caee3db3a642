//! Preemption watcher lifecycle

use cpu_reserve::config::CpuReserveConfig;
use cpu_reserve::controller::{AddRequest, ChangeRequest, Controller};
use cpu_reserve::kernel::SimulatedKernel;
use cpu_reserve::monitor::HistogramSummary;
use cpu_reserve::watch::{WatchBuffer, WatcherState};
use cpu_reserve::{ReserveError, ThreadId};
use std::sync::Arc;
use std::time::{Duration, Instant};

const CLIENT: ThreadId = ThreadId::new(0x400, 0);
const SERVER: ThreadId = ThreadId::new(0x1, 0);
const T: ThreadId = ThreadId::new(0x30, 2);

async fn setup(monitor: bool) -> (Arc<SimulatedKernel>, Controller) {
    let kernel = Arc::new(SimulatedKernel::new(1));
    let mut config = CpuReserveConfig::default();
    config.watch.monitor = monitor;
    let ctl = Controller::new(kernel.clone(), SERVER, &config);
    ctl.add(
        AddRequest {
            thread: T,
            name: "watched".into(),
            priority: 10,
            period_us: 1000,
            wcet_us: 100,
            deadline_us: 1000,
        },
        CLIENT,
    )
    .await
    .unwrap();
    (kernel, ctl)
}

/// Wait until counter `id` reaches `count`
async fn wait_for_counter(buffer: &WatchBuffer, id: u32, count: u32) -> bool {
    for _ in 0..100 {
        if buffer.get(id) == count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Wait until the kernel served `count` consumed-time samples
async fn wait_for_samples(kernel: &SimulatedKernel, count: usize) -> bool {
    for _ in 0..100 {
        if kernel.samples_taken() == count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Wait until the watcher recorded a consumed-time delta
async fn wait_for_histogram(ctl: &Controller) -> Option<HistogramSummary> {
    for _ in 0..100 {
        let histogram = ctl.list().await.first().and_then(|r| r.histogram.clone());
        if histogram.as_ref().is_some_and(|h| h.min_us.is_some()) {
            return histogram;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

#[tokio::test]
async fn test_watch_twice_is_busy() {
    let (_kernel, ctl) = setup(false).await;
    ctl.watch(T, CLIENT).await.unwrap();
    assert!(matches!(ctl.watch(T, CLIENT).await, Err(ReserveError::Busy(_))));
}

#[tokio::test]
async fn test_watch_requires_primary_reservation() {
    let (_kernel, ctl) = setup(false).await;
    let other = ThreadId::new(0x31, 0);
    assert!(matches!(ctl.watch(other, CLIENT).await, Err(ReserveError::NotFound(_))));
}

#[tokio::test]
async fn test_timeslice_overrun_is_counted() {
    let (kernel, ctl) = setup(false).await;
    let grant = ctl.watch(T, CLIENT).await.unwrap();

    assert!(kernel.preempt_timeslice(T, 1));
    assert!(kernel.preempt_timeslice(T, 1));
    assert!(kernel.preempt_timeslice(T, 3));

    assert!(wait_for_counter(&grant.buffer, 1, 2).await);
    assert!(wait_for_counter(&grant.buffer, 3, 1).await);
    assert_eq!(ctl.watch_counters(T).await.unwrap(), vec![0, 2, 0, 1]);

    let list = ctl.list().await;
    assert_eq!(list[0].watcher, WatcherState::Running);
    assert_eq!(list[0].preempter, Some(grant.preempter));
}

#[tokio::test]
async fn test_deadline_histogram() {
    let (kernel, ctl) = setup(true).await;
    ctl.watch(T, CLIENT).await.unwrap();

    // Once counted, the sample has been read
    kernel.consume(T, 500);
    assert!(kernel.preempt_deadline(T));
    assert!(wait_for_samples(&kernel, 1).await);
    kernel.consume(T, 300);
    assert!(kernel.preempt_deadline(T));

    let histogram = wait_for_histogram(&ctl).await.unwrap();
    assert_eq!(histogram.min_us, Some(300));
    assert_eq!(histogram.bins[3], 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delete_waits_for_watcher_rendezvous() {
    let (kernel, ctl) = setup(true).await;
    let grant = ctl.watch(T, CLIENT).await.unwrap();
    let buffer = Arc::downgrade(&grant.buffer);
    drop(grant);

    // The worker is busy sampling when the shutdown signal arrives
    kernel.set_sample_delay(Duration::from_millis(200));
    let start = Instant::now();
    assert!(kernel.preempt_deadline(T));

    let outcome = ctl.delete_thread(T).await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert_eq!(outcome.removed, 1);
    assert_eq!(kernel.samples_taken(), 1);

    assert_eq!(ctl.count().await, 0);
    assert!(buffer.upgrade().is_none());
}

#[tokio::test]
async fn test_slow_sampling_does_not_stall_requests() {
    let (kernel, ctl) = setup(true).await;
    ctl.watch(T, CLIENT).await.unwrap();
    kernel.set_sample_delay(Duration::from_millis(300));

    let start = Instant::now();
    assert!(kernel.preempt_deadline(T));
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Served on the same single thread while the sample is outstanding
    assert_eq!(ctl.list().await.len(), 1);
    assert_eq!(ctl.count().await, 1);
    assert!(start.elapsed() < Duration::from_millis(150));

    assert!(wait_for_samples(&kernel, 1).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_thread_is_busy_while_being_deleted() {
    let (kernel, ctl) = setup(true).await;
    let ctl = Arc::new(ctl);
    ctl.watch(T, CLIENT).await.unwrap();

    kernel.set_sample_delay(Duration::from_millis(300));
    assert!(kernel.preempt_deadline(T));

    let deleting = {
        let ctl = ctl.clone();
        tokio::spawn(async move { ctl.delete_thread(T).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let late = AddRequest {
        thread: T,
        name: "late".into(),
        priority: 9,
        period_us: 1000,
        wcet_us: 50,
        deadline_us: 0,
    };
    assert!(matches!(ctl.add(late.clone(), CLIENT).await, Err(ReserveError::Busy(_))));
    assert!(matches!(
        ctl.delayed_preempt(T, 1, 10, CLIENT).await,
        Err(ReserveError::Busy(_))
    ));
    let change = ChangeRequest {
        wcet_us: Some(200),
        ..Default::default()
    };
    assert!(matches!(ctl.change(T, 1, change).await, Err(ReserveError::Busy(_))));

    let outcome = deleting.await.unwrap().unwrap();
    assert_eq!(outcome.removed, 1);
    assert_eq!(ctl.count().await, 0);
    assert!(kernel.timeslices(T).is_empty());

    // Once the delete is through the thread can be reserved again
    assert_eq!(ctl.add(late, CLIENT).await.unwrap().id, 1);
    assert_eq!(kernel.timeslices(T).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overlapping_deletes_both_wait_for_watcher() {
    let (kernel, ctl) = setup(true).await;
    let grant = ctl.watch(T, CLIENT).await.unwrap();
    let buffer = Arc::downgrade(&grant.buffer);
    drop(grant);

    kernel.set_sample_delay(Duration::from_millis(300));
    let start = Instant::now();
    assert!(kernel.preempt_deadline(T));

    let first = async {
        let outcome = ctl.delete_thread(T).await;
        (outcome, start.elapsed())
    };
    let second = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        let outcome = ctl.delete_thread(T).await;
        (outcome, start.elapsed())
    };
    let ((first, first_at), (second, second_at)) = tokio::join!(first, second);

    assert_eq!(first.unwrap().removed, 1);
    assert!(matches!(second, Err(ReserveError::NotFound(_))));
    assert!(first_at >= Duration::from_millis(300));
    assert!(second_at >= Duration::from_millis(300));

    assert_eq!(kernel.samples_taken(), 1);
    assert!(buffer.upgrade().is_none());
}

#[tokio::test]
async fn test_delete_task_stops_all_watchers() {
    let (kernel, ctl) = setup(false).await;
    let sibling = ThreadId::new(T.task, 7);
    ctl.add(
        AddRequest {
            thread: sibling,
            name: "sibling".into(),
            priority: 5,
            period_us: 1000,
            wcet_us: 100,
            deadline_us: 0,
        },
        CLIENT,
    )
    .await
    .unwrap();

    let a = Arc::downgrade(&ctl.watch(T, CLIENT).await.unwrap().buffer);
    let b = Arc::downgrade(&ctl.watch(sibling, CLIENT).await.unwrap().buffer);

    let outcome = ctl.delete_task(T).await.unwrap();
    assert_eq!(outcome.removed, 2);
    assert!(a.upgrade().is_none());
    assert!(b.upgrade().is_none());
    assert!(!kernel.preempt_timeslice(T, 1));
}
