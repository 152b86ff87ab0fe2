//! Freshness cache.
//!
//! Holds the latest successful payload per source. The whole map is swapped
//! atomically on every write, so readers always see complete entries and
//! never take a lock.

use crate::error::CacheError;
use crate::models::{CacheEntry, FreshData, SourceDescriptor, SourceStatus};
use arc_swap::ArcSwap;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A cache hit with its derived freshness.
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub entry: Arc<CacheEntry>,
    pub age: Duration,
    pub is_stale: bool,
}

/// Keyed store of the latest payload per registered source.
pub struct FreshnessCache {
    descriptors: HashMap<String, SourceDescriptor>,
    /// Registration order, for stable status listings.
    order: Vec<String>,
    entries: ArcSwap<HashMap<String, Arc<CacheEntry>>>,
}

impl FreshnessCache {
    /// Create a cache for a fixed set of sources.
    pub fn new(descriptors: impl IntoIterator<Item = SourceDescriptor>) -> Self {
        let mut map = HashMap::new();
        let mut order = Vec::new();

        for descriptor in descriptors {
            if map.contains_key(&descriptor.name) {
                warn!(source = %descriptor.name, "Duplicate source descriptor ignored");
                continue;
            }
            order.push(descriptor.name.clone());
            map.insert(descriptor.name.clone(), descriptor);
        }

        Self {
            descriptors: map,
            order,
            entries: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Descriptor of a registered source.
    pub fn descriptor(&self, source: &str) -> Option<&SourceDescriptor> {
        self.descriptors.get(source)
    }

    /// All descriptors in registration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &SourceDescriptor> {
        self.order.iter().filter_map(|name| self.descriptors.get(name))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Latest entry for a source, with its age and staleness.
    pub fn get(&self, source: &str) -> Option<CacheLookup> {
        let descriptor = self.descriptors.get(source)?;
        let entry = self.entries.load().get(source).cloned()?;
        let age = entry.age_at(Instant::now());

        Some(CacheLookup {
            is_stale: descriptor.is_stale_age(age),
            entry,
            age,
        })
    }

    /// Replace the whole entry for a source, stamping the current time.
    pub fn put(&self, source: &str, payload: Value) -> Result<Arc<CacheEntry>, CacheError> {
        if !self.descriptors.contains_key(source) {
            return Err(CacheError::UnknownSource(source.to_string()));
        }

        let entry = Arc::new(CacheEntry {
            source_name: source.to_string(),
            payload,
            fetched_at: Utc::now(),
            fetched_instant: Instant::now(),
        });

        // Read-copy-update: concurrent writers to other sources are retried,
        // never overwritten.
        self.entries.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(source.to_string(), Arc::clone(&entry));
            next
        });

        debug!(source = %source, "Cache entry replaced");
        Ok(entry)
    }

    /// Whether a source is stale. Sources without data are stale.
    pub fn is_stale(&self, source: &str) -> bool {
        self.get(source).map(|hit| hit.is_stale).unwrap_or(true)
    }

    /// Status of one registered source.
    pub fn status(&self, source: &str) -> Option<SourceStatus> {
        let descriptor = self.descriptors.get(source)?;
        let entries = self.entries.load();
        Some(Self::status_of(
            descriptor,
            entries.get(source).map(Arc::as_ref),
            Instant::now(),
        ))
    }

    /// Status of every registered source, in registration order.
    pub fn status_all(&self) -> Vec<SourceStatus> {
        let entries = self.entries.load();
        let now = Instant::now();

        self.descriptors()
            .map(|d| Self::status_of(d, entries.get(&d.name).map(Arc::as_ref), now))
            .collect()
    }

    /// Payload, timestamp and age for each requested source.
    ///
    /// Unknown or empty sources are reported with no data.
    pub fn fresh_data(&self, sources: &[&str]) -> BTreeMap<String, FreshData> {
        let entries = self.entries.load();
        let now = Instant::now();

        sources
            .iter()
            .map(|&name| {
                let fresh = match entries.get(name) {
                    Some(entry) => FreshData {
                        data: Some(entry.payload.clone()),
                        last_updated: Some(entry.fetched_at),
                        age: Some(entry.age_at(now)),
                    },
                    None => FreshData {
                        data: None,
                        last_updated: None,
                        age: None,
                    },
                };
                (name.to_string(), fresh)
            })
            .collect()
    }

    fn status_of(
        descriptor: &SourceDescriptor,
        entry: Option<&CacheEntry>,
        now: Instant,
    ) -> SourceStatus {
        match entry {
            Some(entry) => {
                let age = entry.age_at(now);
                SourceStatus {
                    name: descriptor.name.clone(),
                    has_data: true,
                    last_updated: Some(entry.fetched_at),
                    age: Some(age),
                    is_stale: descriptor.is_stale_age(age),
                }
            }
            None => SourceStatus {
                name: descriptor.name.clone(),
                has_data: false,
                last_updated: None,
                age: None,
                is_stale: true,
            },
        }
    }
}

impl std::fmt::Debug for FreshnessCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreshnessCache")
            .field("sources", &self.order)
            .field("populated", &self.entries.load().len())
            .finish()
    }
}
