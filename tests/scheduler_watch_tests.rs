//! Live reconciliation: the daemon picks up config file changes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use calimg::clock::Clock;
use calimg::config::{ImageType, watcher};
use calimg::history::Trigger;
use calimg::naming::ConfigId;
use calimg::scheduler::Scheduler;
use calimg::worker::{JobRunner, WorkerError, WorkerOutcome};

use common::{TestEnv, on_demand_config, scheduled_config};

#[derive(Debug)]
struct NoopRunner;

#[async_trait]
impl JobRunner for NoopRunner {
    async fn submit(&self, _id: &ConfigId, _trigger: Trigger) -> Result<WorkerOutcome, WorkerError> {
        Ok(WorkerOutcome {
            bytes: Arc::new(Vec::new()),
            content_type: "image/png".to_owned(),
            image_type: ImageType::Png,
            crc32: "00000000".to_owned(),
            duration_ms: 0,
            event_count: 0,
        })
    }
}

/// Poll `status()` until `predicate` holds or the deadline passes.
async fn wait_for(
    scheduler: &Arc<Scheduler>,
    deadline: Duration,
    predicate: impl Fn(&[calimg::scheduler::ScheduleStatus]) -> bool,
) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate(&scheduler.status()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn added_and_removed_configs_reconcile_within_deadline() {
    let env = TestEnv::new(&[("a.json", scheduled_config())], vec![]).await;
    let scheduler = Scheduler::new(
        Arc::clone(&env.configs),
        Arc::clone(&env.cache),
        Arc::clone(&env.ledger),
        Arc::new(NoopRunner),
        Arc::clone(&env.clock) as Arc<dyn Clock>,
    );
    scheduler.init().await.unwrap();
    assert_eq!(scheduler.status().len(), 1);

    // The production cadence is 2 s; the 3 s deadline below is the
    // contract being exercised, so keep the real default here.
    let (events, watch_handle) =
        watcher::spawn(Arc::clone(&env.configs), watcher::WatchOptions::default());
    let watch_task = tokio::spawn(Arc::clone(&scheduler).watch(events));

    // A new schedulable config appears.
    tokio::fs::write(env.config_dir.path().join("b.json"), scheduled_config())
        .await
        .unwrap();
    assert!(
        wait_for(&scheduler, Duration::from_secs(3), |status| {
            status.iter().any(|s| s.id == "b")
        })
        .await,
        "b was not scheduled within 3s"
    );

    // An existing one disappears.
    tokio::fs::remove_file(env.config_dir.path().join("a.json"))
        .await
        .unwrap();
    assert!(
        wait_for(&scheduler, Duration::from_secs(3), |status| {
            status.iter().all(|s| s.id != "a")
        })
        .await,
        "a was not unscheduled within 3s"
    );

    scheduler.stop_all();
    watch_handle.abort();
    watch_task.abort();
}

#[tokio::test]
async fn toggling_pre_generation_updates_the_timer_set() {
    let env = TestEnv::new(&[("a.json", on_demand_config())], vec![]).await;
    let scheduler = Scheduler::new(
        Arc::clone(&env.configs),
        Arc::clone(&env.cache),
        Arc::clone(&env.ledger),
        Arc::new(NoopRunner),
        Arc::clone(&env.clock) as Arc<dyn Clock>,
    );
    scheduler.init().await.unwrap();
    assert!(scheduler.status().is_empty());

    let (events, watch_handle) = watcher::spawn(
        Arc::clone(&env.configs),
        watcher::WatchOptions {
            interval: Duration::from_millis(100),
        },
    );
    let watch_task = tokio::spawn(Arc::clone(&scheduler).watch(events));

    // Turn pre-generation on.
    tokio::fs::write(env.config_dir.path().join("a.json"), scheduled_config())
        .await
        .unwrap();
    assert!(
        wait_for(&scheduler, Duration::from_secs(2), |status| {
            status.iter().any(|s| s.id == "a")
        })
        .await,
        "a was not scheduled after the toggle"
    );

    // And off again.
    tokio::fs::write(env.config_dir.path().join("a.json"), on_demand_config())
        .await
        .unwrap();
    assert!(
        wait_for(&scheduler, Duration::from_secs(2), |status| status.is_empty()).await,
        "a was not unscheduled after the toggle"
    );

    scheduler.stop_all();
    watch_handle.abort();
    watch_task.abort();
}
