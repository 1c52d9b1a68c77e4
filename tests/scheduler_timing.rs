//! Scheduler timing tests on paused time: interval cadence, one-shot
//! removal, pause/resume, and the global concurrency cap.

use modhost_core::eventbus::topics;
use modhost_core::scheduler::{task_fn, TaskHandler, TaskKind, TaskOptions};
use modhost_core::{Error, EventBus, SchedulerConfig, UnifiedScheduler};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn counting(hits: &Arc<AtomicUsize>) -> TaskHandler {
    let hits = Arc::clone(hits);
    task_fn(move || {
        let hits = Arc::clone(&hits);
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

/// Handler that sleeps for `work` and records the highest overlap seen.
fn busy(work: Duration, running: &Arc<AtomicUsize>, peak: &Arc<AtomicUsize>) -> TaskHandler {
    let running = Arc::clone(running);
    let peak = Arc::clone(peak);
    task_fn(move || {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(work).await;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

fn scheduler() -> UnifiedScheduler {
    UnifiedScheduler::new(SchedulerConfig::default()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn interval_fires_once_per_period() {
    let sched = scheduler();
    let hits = Arc::new(AtomicUsize::new(0));
    let key = sched
        .interval("heartbeat", Duration::from_secs(10), counting(&hits), TaskOptions::for_module("presence"))
        .unwrap();
    assert_eq!(key, "presence:heartbeat");

    tokio::time::sleep(Duration::from_secs(35)).await;

    assert_eq!(hits.load(Ordering::SeqCst), 3);
    let info = sched.task(&key).unwrap();
    assert_eq!(info.kind, TaskKind::Interval);
    assert_eq!(info.stats.runs, 3);
    assert_eq!(info.stats.successes, 3);
}

#[tokio::test(start_paused = true)]
async fn run_immediately_fires_at_registration() {
    let sched = scheduler();
    let hits = Arc::new(AtomicUsize::new(0));
    sched
        .interval(
            "warmup",
            Duration::from_secs(60),
            counting(&hits),
            TaskOptions::default().run_immediately(),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn timeout_fires_once_and_removes_itself() {
    let bus = Arc::new(EventBus::default());
    let sched = scheduler().with_event_bus(Arc::clone(&bus));
    let removed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&removed);
    bus.subscribe("audit", topics::TASK_REMOVED, move |_, event| {
        sink.lock().push(event.str_field("reason").map(str::to_string));
        Ok(())
    });
    let hits = Arc::new(AtomicUsize::new(0));
    let key = sched
        .timeout("reminder", Duration::from_secs(5), counting(&hits), TaskOptions::default())
        .unwrap();

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(sched.task(&key).is_none());
    assert_eq!(*removed.lock(), vec![Some("fired".to_string())]);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn paused_task_does_not_fire_until_resumed() {
    let sched = scheduler();
    let hits = Arc::new(AtomicUsize::new(0));
    let key = sched
        .interval("poll", Duration::from_secs(10), counting(&hits), TaskOptions::default())
        .unwrap();

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    assert!(sched.pause_task(&key).unwrap());
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(sched.stats().paused_tasks, 1);

    assert!(sched.resume_task(&key).unwrap());
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn concurrency_cap_prevents_overlap_and_defers() {
    let sched = UnifiedScheduler::new(SchedulerConfig {
        max_concurrent: 1,
        requeue_delay: Duration::from_millis(100),
        ..SchedulerConfig::default()
    })
    .unwrap();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut keys = Vec::new();
    for id in ["sync-a", "sync-b"] {
        let key = sched
            .interval(
                id,
                Duration::from_secs(1),
                busy(Duration::from_secs(3), &running, &peak),
                TaskOptions::default(),
            )
            .unwrap();
        keys.push(key);
    }

    let mut last_seen = vec![None; keys.len()];
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        for (key, previous) in keys.iter().zip(last_seen.iter_mut()) {
            let last_run = sched.task(key).unwrap().last_run;
            assert!(last_run >= *previous, "{key}: last_run went from {previous:?} to {last_run:?}");
            *previous = last_run;
        }
    }

    assert!(last_seen.iter().any(Option::is_some), "{last_seen:?}");
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    let stats = sched.stats();
    assert!(stats.deferrals > 0, "{stats:?}");
    assert!(stats.total_runs >= 4, "{stats:?}");
    assert_eq!(stats.dropped, 0);
}

#[tokio::test(start_paused = true)]
async fn bounded_requeue_drops_starved_execution() {
    let sched = UnifiedScheduler::new(SchedulerConfig {
        max_concurrent: 1,
        requeue_delay: Duration::from_millis(100),
        max_requeues: Some(2),
        ..SchedulerConfig::default()
    })
    .unwrap();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    sched
        .timeout(
            "long",
            Duration::ZERO,
            busy(Duration::from_secs(10), &running, &peak),
            TaskOptions::default(),
        )
        .unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let starved = sched
        .timeout("short", Duration::from_secs(1), counting(&hits), TaskOptions::default())
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(sched.task(&starved).is_none());
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    let stats = sched.stats();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.deferrals, 3);
}

#[tokio::test(start_paused = true)]
async fn stop_clears_tasks_and_rejects_new_ones() {
    let sched = scheduler();
    let hits = Arc::new(AtomicUsize::new(0));
    sched
        .interval("a", Duration::from_secs(1), counting(&hits), TaskOptions::for_module("games"))
        .unwrap();
    sched
        .interval("b", Duration::from_secs(1), counting(&hits), TaskOptions::for_module("games"))
        .unwrap();
    sched
        .interval("c", Duration::from_secs(1), counting(&hits), TaskOptions::for_module("media"))
        .unwrap();

    assert_eq!(sched.remove_module_tasks("games"), 2);
    assert_eq!(sched.stop(), 1);
    assert_eq!(sched.stop(), 0);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    let err = sched
        .timeout("late", Duration::from_secs(1), counting(&hits), TaskOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::ShuttingDown(_)));
}
