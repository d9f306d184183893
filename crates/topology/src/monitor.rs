use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docbus_store::{ClusterConfig, StoreDriver, TopologyStatus};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::Error;

/// Consecutive failed status fetches tolerated before the monitor aborts.
pub const MAX_STATUS_FAILURES: u32 = 10;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings for a [`ClusterMonitor`].
#[derive(Clone, Debug)]
pub struct MonitorSettings {
    /// Interval between status fetches.
    pub interval: Duration,
    /// Bound on waiting for the tick loop during terminate.
    pub shutdown_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Receives cluster monitor events. All methods default to no-ops so
/// implementors override only what they care about.
#[async_trait]
pub trait MonitorListener: Send + Sync + 'static {
    /// A fresh topology status was fetched.
    async fn on_new_status(&self, _status: &TopologyStatus) {}

    /// A status fetch failed or came back empty; `failure_count` is the
    /// number of consecutive failures so far.
    async fn on_get_status_failure(&self, _failure_count: u32) {}

    /// Previously known hosts disappeared from the topology.
    async fn on_host_down(&self, _lost: &[String], _remaining: &[String]) {}

    /// The failure threshold was exceeded; monitoring shut down for good.
    async fn on_monitor_abort(&self, _failure_count: u32) {}
}

/// Background monitor of the store's node set.
///
/// Runs a strictly serialized tick loop: fetch status, notify listeners,
/// reconcile the shared host seed. Failures are contained at the tick
/// boundary; only the explicit threshold escalation stops the loop.
pub struct ClusterMonitor<D>
where
    D: StoreDriver,
{
    driver: D,
    config: Arc<ClusterConfig>,
    settings: MonitorSettings,
    listeners: Arc<RwLock<Vec<Arc<dyn MonitorListener>>>>,
    current_status: Arc<Mutex<Option<TopologyStatus>>>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl<D> Clone for ClusterMonitor<D>
where
    D: StoreDriver,
{
    fn clone(&self) -> Self {
        Self {
            driver: self.driver.clone(),
            config: Arc::clone(&self.config),
            settings: self.settings.clone(),
            listeners: Arc::clone(&self.listeners),
            current_status: Arc::clone(&self.current_status),
            shutdown_token: self.shutdown_token.clone(),
            task_tracker: self.task_tracker.clone(),
        }
    }
}

impl<D> std::fmt::Debug for ClusterMonitor<D>
where
    D: StoreDriver,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterMonitor").finish_non_exhaustive()
    }
}

impl<D> ClusterMonitor<D>
where
    D: StoreDriver,
{
    /// Creates a new monitor over the shared cluster configuration.
    #[must_use]
    pub fn new(driver: D, config: Arc<ClusterConfig>, settings: MonitorSettings) -> Self {
        Self {
            driver,
            config,
            settings,
            listeners: Arc::new(RwLock::new(Vec::new())),
            current_status: Arc::new(Mutex::new(None)),
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        }
    }

    /// Registers an event listener.
    pub async fn add_listener(&self, listener: Arc<dyn MonitorListener>) {
        self.listeners.write().await.push(listener);
    }

    /// The most recently fetched status, if any.
    pub async fn current_status(&self) -> Option<TopologyStatus> {
        self.current_status.lock().await.clone()
    }

    /// Starts the tick loop.
    ///
    /// # Errors
    /// Returns [`Error::AlreadyRunning`] when called twice.
    pub fn start(&self) -> Result<(), Error> {
        if self.task_tracker.is_closed() {
            return Err(Error::AlreadyRunning);
        }

        self.task_tracker.spawn(Self::run_loop(self.clone()));
        self.task_tracker.close();

        info!("cluster monitor started");
        Ok(())
    }

    /// Stops the tick loop. Idempotent; returns once stopped.
    pub async fn terminate(&self) {
        self.shutdown_token.cancel();
        self.task_tracker.close();

        if tokio::time::timeout(self.settings.shutdown_timeout, self.task_tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "monitor tick loop did not stop within {:?}",
                self.settings.shutdown_timeout
            );
        }

        info!("cluster monitor terminated");
    }

    async fn run_loop(monitor: Self) {
        let mut failures: u32 = 0;
        let mut interval = tokio::time::interval(monitor.settings.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = monitor.shutdown_token.cancelled() => {
                    debug!("monitor tick loop shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if monitor.tick(&mut failures).await.is_break() {
                        break;
                    }
                }
            }
        }
    }

    /// One serialized tick. Everything is contained here; only the
    /// threshold escalation breaks the loop.
    async fn tick(&self, failures: &mut u32) -> ControlFlow<()> {
        match self.driver.topology_status().await {
            Ok(status) if !status.members.is_empty() => {
                *failures = 0;
                *self.current_status.lock().await = Some(status.clone());

                for listener in self.listeners_snapshot().await {
                    listener.on_new_status(&status).await;
                }

                self.reconcile_seed(&status).await;
                ControlFlow::Continue(())
            }
            other => {
                *failures += 1;
                match other {
                    Ok(_) => warn!(
                        failures = *failures,
                        "topology status came back empty"
                    ),
                    Err(e) => warn!(failures = *failures, "topology status fetch failed: {e}"),
                }

                for listener in self.listeners_snapshot().await {
                    listener.on_get_status_failure(*failures).await;
                }

                if *failures > MAX_STATUS_FAILURES {
                    error!(
                        failures = *failures,
                        "status failure threshold exceeded, aborting monitoring"
                    );
                    for listener in self.listeners_snapshot().await {
                        listener.on_monitor_abort(*failures).await;
                    }
                    self.config.disable_monitoring();
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            }
        }
    }

    /// Folds the fetched status into the shared host seed: newly seen
    /// hosts are added, vanished hosts removed with a host-down event.
    async fn reconcile_seed(&self, status: &TopologyStatus) {
        let active = status.active_hosts();
        let seed = self.config.host_seed();
        let (new_seed, added, lost) = reconcile(&seed, &active);

        if added.is_empty() && lost.is_empty() {
            return;
        }

        debug!(?added, ?lost, "host seed reconciled");
        self.config.set_host_seed(new_seed.clone());

        if !lost.is_empty() {
            for listener in self.listeners_snapshot().await {
                listener.on_host_down(&lost, &new_seed).await;
            }
        }
    }

    async fn listeners_snapshot(&self) -> Vec<Arc<dyn MonitorListener>> {
        self.listeners.read().await.clone()
    }
}

/// Splits the seed/active host sets into the surviving seed list plus
/// what was added and what was lost, preserving order.
fn reconcile(
    seed: &[String],
    active: &[String],
) -> (Vec<String>, Vec<String>, Vec<String>) {
    let mut new_seed: Vec<String> = seed
        .iter()
        .filter(|host| active.contains(host))
        .cloned()
        .collect();
    let lost: Vec<String> = seed
        .iter()
        .filter(|host| !active.contains(host))
        .cloned()
        .collect();
    let added: Vec<String> = active
        .iter()
        .filter(|host| !seed.contains(host))
        .cloned()
        .collect();

    new_seed.extend(added.iter().cloned());
    (new_seed, added, lost)
}
