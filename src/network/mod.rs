//! Connectivity tracking.
//!
//! Raw observations (platform events, probe results) go through [`NetworkMonitor::observe`].
//! A change of state is only committed once it has held for the debounce
//! window, so a flapping link produces no transitions at all.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::remote::{bounded, RemoteApi};

/// Something that can tell whether the server is reachable right now.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// Probe that pings the remote API under a deadline.
pub struct RemoteProbe {
    remote: Arc<dyn RemoteApi>,
    timeout: Duration,
}

impl RemoteProbe {
    pub fn new(remote: Arc<dyn RemoteApi>, timeout: Duration) -> Self {
        Self { remote, timeout }
    }
}

#[async_trait]
impl ReachabilityProbe for RemoteProbe {
    async fn probe(&self) -> bool {
        match bounded(self.timeout, self.remote.ping()).await {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Reachability probe failed: {e}");
                false
            }
        }
    }
}

struct Observation {
    last: bool,
    /// Bumped whenever the observed value flips; a pending commit only fires
    /// if the generation it was armed with is still current.
    generation: u64,
    forced: Option<bool>,
}

struct Inner {
    online: watch::Sender<bool>,
    debounce: Duration,
    observation: Mutex<Observation>,
}

impl Inner {
    fn commit(&self, online: bool) {
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            log::info!("Network is now {}", if online { "online" } else { "offline" });
        }
    }

    fn observation(&self) -> std::sync::MutexGuard<'_, Observation> {
        self.observation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Debounced online/offline signal. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<Inner>,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool, debounce: Duration) -> Self {
        let (online, _) = watch::channel(initially_online);
        Self {
            inner: Arc::new(Inner {
                online,
                debounce,
                observation: Mutex::new(Observation {
                    last: initially_online,
                    generation: 0,
                    forced: None,
                }),
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    pub fn debounce(&self) -> Duration {
        self.inner.debounce
    }

    /// Receiver that wakes on every committed transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.online.subscribe()
    }

    /// Feed a raw connectivity observation. Repeating the same observation
    /// does not restart the debounce window.
    pub fn observe(&self, online: bool) {
        let generation = {
            let mut obs = self.inner.observation();
            if obs.forced.is_some() || obs.last == online {
                return;
            }
            obs.last = online;
            obs.generation += 1;
            obs.generation
        };

        if online == self.is_online() {
            // Flapped back before the window closed; the pending commit is void.
            log::debug!("Discarding connectivity flap");
            return;
        }
        if self.inner.debounce.is_zero() {
            self.inner.commit(online);
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            let current = inner.observation().generation;
            if current == generation {
                inner.commit(online);
            }
        });
    }

    /// Commit a state immediately, skipping the debounce window.
    pub fn set_online(&self, online: bool) {
        {
            let mut obs = self.inner.observation();
            obs.last = online;
            obs.generation += 1;
        }
        self.inner.commit(online);
    }

    /// Pin the state (e.g. an operator forcing offline mode); observations
    /// are ignored until released with `None`.
    pub fn set_forced(&self, forced: Option<bool>) {
        self.inner.observation().forced = forced;
        if let Some(online) = forced {
            self.set_online(online);
        }
    }

    pub fn is_forced(&self) -> bool {
        self.inner.observation().forced.is_some()
    }

    /// Invoke `callback` once per committed transition, with the new state.
    pub fn on_change<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(bool) + Send + 'static,
    {
        let mut rx = self.subscribe();
        let mut delivered = *rx.borrow_and_update();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                // Two quick flips may coalesce into no net change.
                if online != delivered {
                    delivered = online;
                    callback(online);
                }
            }
        })
    }

    /// Probe reachability every `interval` and feed the results in.
    pub fn spawn_probe_loop(
        &self,
        probe: Arc<dyn ReachabilityProbe>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reachable = probe.probe().await;
                monitor.observe(reachable);
            }
        })
    }
}
