//! Background eviction of idle registry entries

use super::entry::PoolEntry;
use super::RegistryInner;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Periodic sweep over a registry's entries
///
/// The task only holds a weak reference to the registry, so it ends on its
/// own once the registry is dropped.
pub struct Reaper {
    shutdown: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reaper {
    /// Spawn the sweep loop on the current tokio runtime
    pub(crate) fn start(inner: Weak<RegistryInner>, period: Duration) -> Self {
        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(Self::run(inner, period, Arc::clone(&shutdown)));

        log::debug!("Reaper started (period {:?})", period);

        Self {
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    async fn run(inner: Weak<RegistryInner>, period: Duration, shutdown: Arc<Notify>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    log::debug!("Reaper stopped");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let Some(inner) = inner.upgrade() else {
                log::debug!("Registry dropped; reaper exiting");
                break;
            };

            // a panicking sweep must not end the loop
            let sweep = tokio::spawn(async move { Self::sweep_once(&inner).await });
            match sweep.await {
                Ok(evicted) if !evicted.is_empty() => {
                    log::info!("Reaper evicted {} idle database(s): {:?}", evicted.len(), evicted);
                }
                Ok(_) => {}
                Err(e) => log::error!("Reaper sweep failed: {}", e),
            }
        }
    }

    /// Evict every entry idle for at least its threshold
    ///
    /// Stale identifiers are collected under the lock, which is then
    /// released and re-taken to remove them. Pools are closed after the
    /// lock is dropped. Returns the evicted identifiers.
    pub(crate) async fn sweep_once(inner: &RegistryInner) -> Vec<String> {
        let now = Instant::now();

        let stale: Vec<String> = {
            let entries = inner.entries.lock().await;
            entries
                .iter()
                .filter(|(_, entry)| entry.is_idle(now))
                .map(|(id, _)| id.clone())
                .collect()
        };

        if stale.is_empty() {
            return stale;
        }

        let mut removed: Vec<(String, PoolEntry)> = Vec::with_capacity(stale.len());
        {
            let mut entries = inner.entries.lock().await;
            for id in &stale {
                // touched or recreated since the scan
                if !entries.get(id).map(|e| e.is_idle(now)).unwrap_or(false) {
                    continue;
                }
                if let Some(pair) = entries.remove_entry(id) {
                    removed.push(pair);
                }
            }
        }

        let mut evicted = Vec::with_capacity(removed.len());
        for (database_id, entry) in removed {
            entry.close(&database_id).await;
            evicted.push(database_id);
        }
        evicted
    }

    /// Signal the loop to stop; returns immediately
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    /// Stop the loop and wait for it to finish
    pub async fn join(&self) {
        self.stop();

        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("Reaper task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        match self.handle.lock() {
            Ok(guard) => guard.as_ref().map(|h| !h.is_finished()).unwrap_or(false),
            Err(poisoned) => poisoned
                .into_inner()
                .as_ref()
                .map(|h| !h.is_finished())
                .unwrap_or(false),
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}
