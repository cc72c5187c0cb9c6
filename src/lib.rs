pub mod config;
pub mod date_util;
pub mod error;
pub mod facade;
pub mod model;
pub mod network;
pub mod remote;
pub mod state;
pub mod storage;
pub mod sync;

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use facade::{OfflineFacade, Stats};
pub use model::{
    Breakdown, FuelDotation, QueueAction, RecordPayload, ReferenceKind, ReferenceRecord,
    RentalBon, StockExit, SyncQueueItem, TransactionalEntity, TransactionalKind,
    TransactionalRecord, TransportBon,
};
pub use network::{NetworkMonitor, ReachabilityProbe, RemoteProbe};
pub use remote::{HttpRemote, MockRemote, RemoteApi, RemoteError};
pub use state::{SyncAction, SyncState, SyncStateStore};
pub use storage::{Database, LiveQuery};
pub use sync::{NoopProgress, RetryPolicy, SyncProgress, SyncReport, SyncStatus};

// Re-export repository types needed by the binary crate, but not the module itself
pub use storage::repository::ClearOutcome;

use remote::bounded;
use sync::{QueueProcessor, ReferenceSynchronizer, Scheduler};

/// Main entry point: owns the store, the remote collaborator and every
/// component built on them. Construct one and hand it (or its parts) to
/// whatever needs it; nothing here is global.
pub struct FleetSync {
    db: Database,
    remote: Arc<dyn RemoteApi>,
    config: EngineConfig,
    monitor: NetworkMonitor,
    processor: Arc<QueueProcessor>,
    references: Arc<ReferenceSynchronizer>,
    state: SyncStateStore,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FleetSync {
    /// Wire the engine. Starts out offline until a probe or `set_online`
    /// says otherwise.
    pub fn new(db: Database, remote: Arc<dyn RemoteApi>, config: EngineConfig) -> Self {
        let monitor = NetworkMonitor::new(false, config.debounce);
        let processor = Arc::new(QueueProcessor::new(
            db.clone(),
            Arc::clone(&remote),
            config.retry,
            config.request_timeout,
        ));
        let references = Arc::new(ReferenceSynchronizer::new(
            db.clone(),
            Arc::clone(&remote),
            config.request_timeout,
        ));
        let state = SyncStateStore::new(db.clone(), Arc::clone(&processor), monitor.clone());
        Self {
            db,
            remote,
            config,
            monitor,
            processor,
            references,
            state,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Load configuration from the store and the environment and talk to the
    /// configured server over HTTP.
    pub async fn connect(db: Database) -> Result<Self> {
        let config = EngineConfig::load(&db).await?;
        let url = config.api_base_url.clone().ok_or_else(|| {
            Error::Config(format!(
                "no server configured. Set {} or run: fleetsync config set api_base_url <URL>",
                config::ENV_API_URL
            ))
        })?;
        let remote = HttpRemote::new(&url, config.api_token.clone(), config.request_timeout)?;
        Ok(Self::new(db, Arc::new(remote), config))
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn remote(&self) -> &Arc<dyn RemoteApi> {
        &self.remote
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    pub fn state(&self) -> &SyncStateStore {
        &self.state
    }

    pub fn references(&self) -> &ReferenceSynchronizer {
        &self.references
    }

    pub fn processor(&self) -> &QueueProcessor {
        &self.processor
    }

    pub fn facade<T: TransactionalEntity>(&self) -> OfflineFacade<T> {
        OfflineFacade::new(
            self.db.clone(),
            Arc::clone(&self.remote),
            self.monitor.clone(),
            self.config.request_timeout,
        )
    }

    pub fn fuel_dotations(&self) -> OfflineFacade<FuelDotation> {
        self.facade()
    }

    pub fn stock_exits(&self) -> OfflineFacade<StockExit> {
        self.facade()
    }

    pub fn transport_bons(&self) -> OfflineFacade<TransportBon> {
        self.facade()
    }

    pub fn rental_bons(&self) -> OfflineFacade<RentalBon> {
        self.facade()
    }

    pub fn breakdowns(&self) -> OfflineFacade<Breakdown> {
        self.facade()
    }

    /// Ping the server once and commit the result without debouncing.
    /// Does nothing while the state is pinned.
    pub async fn probe_now(&self) -> bool {
        if self.monitor.is_forced() {
            return self.monitor.is_online();
        }
        let reachable = bounded(self.config.request_timeout, self.remote.ping())
            .await
            .is_ok();
        self.monitor.set_online(reachable);
        reachable
    }

    /// Pin the engine offline: no remote calls until released.
    pub fn force_offline(&self, offline: bool) {
        self.monitor.set_forced(offline.then_some(false));
    }

    /// Start the background machinery: state watchers, the reachability
    /// probe (unless pinned) and the scheduler.
    pub async fn start(&self) -> Result<()> {
        self.state.refresh().await?;

        let mut handles = self.state.spawn_watchers();
        if !self.monitor.is_forced() {
            let probe = Arc::new(RemoteProbe::new(
                Arc::clone(&self.remote),
                self.config.request_timeout,
            ));
            handles.push(self.monitor.spawn_probe_loop(probe, self.config.probe_interval));
        }
        handles.push(
            Scheduler::new(
                self.state.clone(),
                Arc::clone(&self.references),
                self.monitor.clone(),
                self.config.scheduler(),
            )
            .spawn(),
        );

        log::info!("Sync engine started");
        self.lock_tasks().extend(handles);
        Ok(())
    }

    /// Stop every background task. In-flight remote calls are abandoned;
    /// the queue is durable, so nothing is lost.
    pub fn shutdown(&self) {
        let handles: Vec<_> = self.lock_tasks().drain(..).collect();
        if !handles.is_empty() {
            log::info!("Stopping sync engine");
        }
        for handle in handles {
            handle.abort();
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for FleetSync {
    fn drop(&mut self) {
        self.shutdown();
    }
}
