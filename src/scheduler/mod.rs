//! Refresh scheduler.
//!
//! Runs one independent loop per source. Each loop fetches, writes into the
//! freshness cache, then sleeps for the refresh interval, or for the shorter
//! backoff interval when the fetch failed. Loops share nothing but the cache.

pub mod adapters;

pub use adapters::{HttpJsonAdapter, SourceAdapter, StaticAdapter};

use crate::cache::FreshnessCache;
use crate::error::{panic_message, RefreshError, SourceFetchError};
use crate::models::{CacheEntry, SchedulerStatus, SourceDescriptor};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A running set of refresh loops.
struct LoopSet {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Owns the per-source refresh loops and the cache they write into.
pub struct RefreshScheduler {
    cache: Arc<FreshnessCache>,
    adapters: HashMap<String, Arc<dyn SourceAdapter>>,
    shutdown_grace: Duration,
    loops: Mutex<Option<LoopSet>>,
}

impl RefreshScheduler {
    /// Create a scheduler for a fixed set of sources.
    pub fn new(
        sources: Vec<(SourceDescriptor, Arc<dyn SourceAdapter>)>,
        shutdown_grace: Duration,
    ) -> Self {
        let mut adapters = HashMap::new();
        let mut descriptors = Vec::new();

        for (descriptor, adapter) in sources {
            adapters.entry(descriptor.name.clone()).or_insert(adapter);
            descriptors.push(descriptor);
        }

        Self {
            cache: Arc::new(FreshnessCache::new(descriptors)),
            adapters,
            shutdown_grace,
            loops: Mutex::new(None),
        }
    }

    /// The cache this scheduler writes into.
    pub fn cache(&self) -> &Arc<FreshnessCache> {
        &self.cache
    }

    /// Launch one loop per source. Returns false if already running.
    pub fn start(&self) -> bool {
        let mut loops = self.lock_loops();
        if loops.is_some() {
            warn!("Refresh scheduler already running");
            return false;
        }

        let token = CancellationToken::new();
        let handles: Vec<JoinHandle<()>> = self
            .cache
            .descriptors()
            .filter_map(|descriptor| {
                let adapter = self.adapters.get(&descriptor.name)?;
                Some(tokio::spawn(refresh_loop(
                    descriptor.clone(),
                    Arc::clone(adapter),
                    Arc::clone(&self.cache),
                    token.clone(),
                )))
            })
            .collect();

        info!("Refresh scheduler started with {} source loops", handles.len());
        *loops = Some(LoopSet { token, handles });
        true
    }

    /// Signal every loop to stop and wait for them to exit.
    ///
    /// Loops still running after the grace period are aborted.
    pub async fn stop(&self) {
        let taken = self.lock_loops().take();
        let Some(set) = taken else {
            debug!("Refresh scheduler not running");
            return;
        };

        set.token.cancel();
        let aborts: Vec<AbortHandle> = set.handles.iter().map(|h| h.abort_handle()).collect();

        match tokio::time::timeout(self.shutdown_grace, join_all(set.handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!("Refresh loop ended abnormally: {}", e);
                    }
                }
                info!("Refresh scheduler stopped");
            }
            Err(_) => {
                warn!(
                    "Refresh loops did not exit within {:.1}s, aborting",
                    self.shutdown_grace.as_secs_f64()
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_loops().is_some()
    }

    /// Freshness of every source plus loop bookkeeping.
    pub fn status(&self) -> SchedulerStatus {
        let (running, active_loops) = match self.lock_loops().as_ref() {
            Some(set) => (
                true,
                set.handles.iter().filter(|h| !h.is_finished()).count(),
            ),
            None => (false, 0),
        };

        SchedulerStatus {
            running,
            total_sources: self.cache.len(),
            active_loops,
            sources: self.cache.status_all(),
        }
    }

    /// Fetch one source now, bypassing its loop's timer.
    ///
    /// Races the background loop; whichever write lands last wins.
    pub async fn force_refresh(&self, source: &str) -> Result<DateTime<Utc>, RefreshError> {
        let adapter = self
            .adapters
            .get(source)
            .ok_or_else(|| RefreshError::UnknownSource(source.to_string()))?;

        info!(source = %source, "Forced refresh");
        let entry = fetch_into_cache(source, adapter.as_ref(), &self.cache).await?;
        Ok(entry.fetched_at)
    }

    /// Force-refresh every source concurrently.
    pub async fn refresh_all(&self) -> Vec<(String, Result<DateTime<Utc>, RefreshError>)> {
        let names: Vec<String> = self.cache.descriptors().map(|d| d.name.clone()).collect();
        let outcomes = join_all(names.iter().map(|name| self.force_refresh(name))).await;
        names.into_iter().zip(outcomes).collect()
    }

    fn lock_loops(&self) -> MutexGuard<'_, Option<LoopSet>> {
        self.loops.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RefreshScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshScheduler")
            .field("cache", &self.cache)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Invoke an adapter and write its payload into the cache.
async fn fetch_into_cache(
    source: &str,
    adapter: &dyn SourceAdapter,
    cache: &FreshnessCache,
) -> Result<Arc<CacheEntry>, SourceFetchError> {
    let fetched = AssertUnwindSafe(adapter.fetch()).catch_unwind().await;

    let payload = match fetched {
        Ok(Ok(payload)) => payload,
        Ok(Err(e)) => {
            return Err(SourceFetchError {
                source_name: source.to_string(),
                message: format!("{:#}", e),
            })
        }
        Err(panic) => {
            return Err(SourceFetchError {
                source_name: source.to_string(),
                message: format!("adapter panicked: {}", panic_message(&*panic)),
            })
        }
    };

    cache.put(source, payload).map_err(|e| SourceFetchError {
        source_name: source.to_string(),
        message: e.to_string(),
    })
}

/// Perpetual refresh loop for one source.
async fn refresh_loop(
    descriptor: SourceDescriptor,
    adapter: Arc<dyn SourceAdapter>,
    cache: Arc<FreshnessCache>,
    shutdown: CancellationToken,
) {
    let source = descriptor.name.as_str();
    debug!(source = %source, "Refresh loop started");

    loop {
        let pause = tokio::select! {
            _ = shutdown.cancelled() => break,
            outcome = fetch_into_cache(source, adapter.as_ref(), &cache) => match outcome {
                Ok(_) => {
                    debug!(source = %source, "Refresh succeeded");
                    descriptor.refresh_interval
                }
                Err(e) => {
                    error!(
                        source = %source,
                        retry_in_secs = descriptor.error_backoff_interval.as_secs_f64(),
                        "{}", e
                    );
                    descriptor.error_backoff_interval
                }
            },
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }

    debug!(source = %source, "Refresh loop stopped");
}
