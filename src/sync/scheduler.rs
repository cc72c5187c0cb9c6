use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::network::NetworkMonitor;
use crate::state::SyncStateStore;
use crate::sync::{NoopProgress, ReferenceSynchronizer, RetryPolicy, SyncReport, SyncStatus};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// How often the queue is drained while online and non-empty.
    pub sync_interval: Duration,
    /// How often stale reference caches are refreshed while online.
    pub reference_refresh_interval: Duration,
    pub retry: RetryPolicy,
}

/// Spaces out runs after consecutive failing drains.
#[derive(Debug, Default)]
struct Backoff {
    failures: u32,
    not_before: Option<Instant>,
}

impl Backoff {
    fn ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |t| now >= t)
    }

    fn record(&mut self, report: &SyncReport, policy: &RetryPolicy, now: Instant) {
        match report.status {
            SyncStatus::Skipped => {}
            SyncStatus::Success => self.reset(),
            SyncStatus::PartialFailure | SyncStatus::Failed => {
                self.failures += 1;
                let delay = policy.delay_for(self.failures);
                log::debug!("Next automatic drain in {delay:?} ({} failing runs)", self.failures);
                self.not_before = Some(now + delay);
            }
        }
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.not_before = None;
    }
}

/// Background driver: drains after every reconnect and on a timer, refreshes
/// reference data after reconnect and when it goes stale.
pub struct Scheduler {
    state: SyncStateStore,
    references: Arc<ReferenceSynchronizer>,
    monitor: NetworkMonitor,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        state: SyncStateStore,
        references: Arc<ReferenceSynchronizer>,
        monitor: NetworkMonitor,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            state,
            references,
            monitor,
            config,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        // Capture the state now so a reconnect racing the task start is seen.
        let mut online_rx = self.monitor.subscribe();
        let was_online = *online_rx.borrow_and_update();
        tokio::spawn(self.run(online_rx, was_online))
    }

    async fn run(self, mut online_rx: watch::Receiver<bool>, mut was_online: bool) {
        let mut sync_tick = tokio::time::interval(self.config.sync_interval);
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reference_tick = tokio::time::interval(self.config.reference_refresh_interval);
        reference_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut backoff = Backoff::default();

        loop {
            tokio::select! {
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let online = *online_rx.borrow_and_update();
                    if online && !was_online {
                        log::info!("Connectivity restored; refreshing references and draining queue");
                        if let Err(e) = self.references.refresh_all(&NoopProgress).await {
                            log::error!("Reference refresh failed: {e}");
                        }
                        backoff.reset();
                        self.drain(&mut backoff).await;
                    }
                    was_online = online;
                }
                _ = sync_tick.tick() => {
                    if self.monitor.is_online()
                        && self.state.snapshot().pending_count > 0
                        && backoff.ready(Instant::now())
                    {
                        self.drain(&mut backoff).await;
                    }
                }
                _ = reference_tick.tick() => {
                    if self.monitor.is_online() {
                        let max_age = self.config.reference_refresh_interval;
                        if let Err(e) = self.references.refresh_stale(max_age).await {
                            log::error!("Reference refresh failed: {e}");
                        }
                    }
                }
            }
        }
    }

    async fn drain(&self, backoff: &mut Backoff) {
        match self.state.sync_now().await {
            Ok(report) => backoff.record(&report, &self.config.retry, Instant::now()),
            Err(e) => log::error!("Drain failed: {e}"),
        }
    }
}
