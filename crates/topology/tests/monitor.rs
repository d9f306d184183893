//! Tests of the cluster monitor against the in-memory driver.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use docbus_store::{ClusterConfig, MemberState, MemberStatus, TopologyStatus};
use docbus_store_memory::MemoryDriver;
use docbus_topology::{ClusterMonitor, MAX_STATUS_FAILURES, MonitorListener, MonitorSettings};
use tokio::sync::Mutex;

#[derive(Default)]
struct Recorder {
    new_status_count: AtomicUsize,
    failure_counts: Mutex<Vec<u32>>,
    host_down_events: Mutex<Vec<(Vec<String>, Vec<String>)>>,
    abort_events: AtomicUsize,
    abort_count: AtomicU32,
}

#[async_trait]
impl MonitorListener for Recorder {
    async fn on_new_status(&self, _status: &TopologyStatus) {
        self.new_status_count.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_get_status_failure(&self, failure_count: u32) {
        self.failure_counts.lock().await.push(failure_count);
    }

    async fn on_host_down(&self, lost: &[String], remaining: &[String]) {
        self.host_down_events
            .lock()
            .await
            .push((lost.to_vec(), remaining.to_vec()));
    }

    async fn on_monitor_abort(&self, failure_count: u32) {
        self.abort_events.fetch_add(1, Ordering::SeqCst);
        self.abort_count.store(failure_count, Ordering::SeqCst);
    }
}

fn status_of(hosts: &[&str]) -> TopologyStatus {
    TopologyStatus {
        set_name: "rs0".to_string(),
        members: hosts
            .iter()
            .map(|host| MemberStatus {
                host: (*host).to_string(),
                state: MemberState::Secondary,
                ok: true,
            })
            .collect(),
    }
}

fn monitor_over(
    driver: &MemoryDriver,
    seed: Vec<String>,
) -> (ClusterMonitor<MemoryDriver>, Arc<ClusterConfig>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let config = Arc::new(ClusterConfig::new(seed));
    let settings = MonitorSettings {
        interval: Duration::from_millis(10),
        ..MonitorSettings::default()
    };
    (
        ClusterMonitor::new(driver.clone(), Arc::clone(&config), settings),
        config,
    )
}

async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_repeated_failures_abort_monitoring_once() {
    let driver = MemoryDriver::new();
    driver.set_topology_status(None).await;

    let (monitor, config) = monitor_over(&driver, vec![]);
    let recorder = Arc::new(Recorder::default());
    monitor.add_listener(recorder.clone()).await;
    monitor.start().unwrap();

    wait_until(|| recorder.abort_events.load(Ordering::SeqCst) > 0).await;

    assert_eq!(recorder.abort_events.load(Ordering::SeqCst), 1);
    assert_eq!(
        recorder.abort_count.load(Ordering::SeqCst),
        MAX_STATUS_FAILURES + 1
    );
    assert!(!config.monitoring_enabled());

    let counts = recorder.failure_counts.lock().await.clone();
    assert_eq!(
        counts,
        (1..=MAX_STATUS_FAILURES + 1).collect::<Vec<u32>>()
    );

    // The loop is gone; no further ticks arrive even if the store recovers.
    driver.set_topology_status(Some(status_of(&["a:27017"]))).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.new_status_count.load(Ordering::SeqCst), 0);
    assert_eq!(recorder.abort_events.load(Ordering::SeqCst), 1);

    monitor.terminate().await;
}

#[tokio::test]
async fn test_successful_fetch_resets_failure_counter() {
    let driver = MemoryDriver::new();
    driver.set_topology_status(None).await;

    let (monitor, _config) = monitor_over(&driver, vec![]);
    let recorder = Arc::new(Recorder::default());
    monitor.add_listener(recorder.clone()).await;
    monitor.start().unwrap();

    // Let a few failures accrue, then recover before the threshold.
    wait_until(|| {
        let counts = recorder.failure_counts.try_lock().map(|c| c.len());
        counts.map(|len| len >= 3).unwrap_or(false)
    })
    .await;
    driver.set_topology_status(Some(status_of(&["a:27017"]))).await;
    wait_until(|| recorder.new_status_count.load(Ordering::SeqCst) > 0).await;

    // Fail again; the counter must restart at one.
    recorder.failure_counts.lock().await.clear();
    driver.set_topology_status(None).await;
    wait_until(|| {
        let counts = recorder.failure_counts.try_lock().map(|c| !c.is_empty());
        counts.unwrap_or(false)
    })
    .await;

    let counts = recorder.failure_counts.lock().await.clone();
    assert_eq!(counts[0], 1);
    assert_eq!(recorder.abort_events.load(Ordering::SeqCst), 0);

    monitor.terminate().await;
}

#[tokio::test]
async fn test_vanished_host_triggers_host_down_and_seed_update() {
    let driver = MemoryDriver::new();
    driver.set_topology_status(Some(status_of(&["a:27017"]))).await;

    let seed = vec!["a:27017".to_string(), "b:27017".to_string()];
    let (monitor, config) = monitor_over(&driver, seed);
    let recorder = Arc::new(Recorder::default());
    monitor.add_listener(recorder.clone()).await;
    monitor.start().unwrap();

    wait_until(|| {
        recorder
            .host_down_events
            .try_lock()
            .map(|events| !events.is_empty())
            .unwrap_or(false)
    })
    .await;

    let events = recorder.host_down_events.lock().await.clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, vec!["b:27017".to_string()]);
    assert_eq!(events[0].1, vec!["a:27017".to_string()]);
    assert_eq!(config.host_seed(), vec!["a:27017".to_string()]);

    monitor.terminate().await;
}

#[tokio::test]
async fn test_new_host_joins_seed_without_host_down() {
    let driver = MemoryDriver::new();
    driver
        .set_topology_status(Some(status_of(&["a:27017", "c:27017"])))
        .await;

    let (monitor, config) = monitor_over(&driver, vec!["a:27017".to_string()]);
    let recorder = Arc::new(Recorder::default());
    monitor.add_listener(recorder.clone()).await;
    monitor.start().unwrap();

    wait_until(|| config.host_seed().len() == 2).await;

    assert_eq!(
        config.host_seed(),
        vec!["a:27017".to_string(), "c:27017".to_string()]
    );
    assert!(recorder.host_down_events.lock().await.is_empty());

    monitor.terminate().await;
}

#[tokio::test]
async fn test_current_status_reflects_latest_fetch() {
    let driver = MemoryDriver::new();
    driver.set_topology_status(Some(status_of(&["a:27017"]))).await;

    let (monitor, _config) = monitor_over(&driver, vec![]);
    monitor.start().unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if monitor.current_status().await.is_some() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no status recorded");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let status = monitor.current_status().await.unwrap();
    assert_eq!(status.set_name, "rs0");
    assert_eq!(status.active_hosts(), vec!["a:27017".to_string()]);

    monitor.terminate().await;
}

#[tokio::test]
async fn test_terminate_is_idempotent_and_start_twice_errs() {
    let driver = MemoryDriver::new();
    let (monitor, _config) = monitor_over(&driver, vec![]);

    monitor.start().unwrap();
    monitor.terminate().await;
    monitor.terminate().await;

    assert!(monitor.start().is_err());
}
