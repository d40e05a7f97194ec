//! Statistics for filter devices.
//!
//! Counters are lock-free atomics, updated by request handlers and read through
//! serializable snapshots. A device hands its [`FilterStats`] to a
//! [`StatsRegistry`] once during setup and withdraws it during teardown.
//!
//! # Usage
//!
//! ```
//! use oxlu_core::stats::{FilterStats, MemoryStatsRegistry, StatsRegistry};
//! use std::sync::Arc;
//!
//! let stats = Arc::new(FilterStats::new());
//! stats.record_read(1, 4096);
//! stats.record_write(1, 512);
//!
//! let registry = MemoryStatsRegistry::new();
//! registry.register("OST0000", Arc::clone(&stats)).unwrap();
//!
//! let snapshot = registry.get("OST0000").unwrap().snapshot();
//! assert_eq!(snapshot.read_bytes.sum, 4096);
//! assert_eq!(snapshot.exports.len(), 1);
//! ```

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::debug;

use crate::error::StatsError;

/// Sample counter tracking count, sum, minimum and maximum.
#[derive(Debug)]
pub struct AvgMinMax {
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl Default for AvgMinMax {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }
}

impl AvgMinMax {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record(&self, value: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.min.fetch_min(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.sum.store(0, Ordering::Relaxed);
        self.min.store(u64::MAX, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AvgMinMaxSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        AvgMinMaxSnapshot {
            count,
            sum: self.sum.load(Ordering::Relaxed),
            // No samples yet reads as zero rather than u64::MAX.
            min: if count == 0 {
                0
            } else {
                self.min.load(Ordering::Relaxed)
            },
            max: self.max.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvgMinMaxSnapshot {
    pub count: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
}

impl AvgMinMaxSnapshot {
    /// Mean sample value, 0.0 without samples.
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }
}

/// Per-export I/O statistics.
#[derive(Debug, Default)]
pub struct ExportStats {
    pub read_bytes: AvgMinMax,
    pub write_bytes: AvgMinMax,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportStatsSnapshot {
    pub export_id: u64,
    pub read_bytes: AvgMinMaxSnapshot,
    pub write_bytes: AvgMinMaxSnapshot,
}

/// Counters of one filter device.
#[derive(Debug)]
pub struct FilterStats {
    read_bytes: AvgMinMax,
    write_bytes: AvgMinMax,

    // Intent resolver outcomes
    glimpse_callbacks: AtomicU64,
    glimpse_failures: AtomicU64,
    intent_replaced: AtomicU64,
    intent_aborted: AtomicU64,
    forced_refreshes: AtomicU64,
    stale_candidates: AtomicU64,
    tree_scans: AtomicU64,

    exports: DashMap<u64, Arc<ExportStats>>,
    since: RwLock<SystemTime>,
}

impl Default for FilterStats {
    fn default() -> Self {
        Self {
            read_bytes: AvgMinMax::new(),
            write_bytes: AvgMinMax::new(),
            glimpse_callbacks: AtomicU64::new(0),
            glimpse_failures: AtomicU64::new(0),
            intent_replaced: AtomicU64::new(0),
            intent_aborted: AtomicU64::new(0),
            forced_refreshes: AtomicU64::new(0),
            stale_candidates: AtomicU64::new(0),
            tree_scans: AtomicU64::new(0),
            exports: DashMap::new(),
            since: RwLock::new(SystemTime::now()),
        }
    }
}

impl FilterStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a read of `bytes` on behalf of `export_id`.
    pub fn record_read(&self, export_id: u64, bytes: u64) {
        self.read_bytes.record(bytes);
        self.export(export_id).read_bytes.record(bytes);
    }

    /// Record a write of `bytes` on behalf of `export_id`.
    pub fn record_write(&self, export_id: u64, bytes: u64) {
        self.write_bytes.record(bytes);
        self.export(export_id).write_bytes.record(bytes);
    }

    /// Statistics of one export, created on first use.
    pub fn export(&self, export_id: u64) -> Arc<ExportStats> {
        Arc::clone(self.exports.entry(export_id).or_default().value())
    }

    pub fn remove_export(&self, export_id: u64) {
        self.exports.remove(&export_id);
    }

    /// Drop every per-export entry. Device-wide counters are kept.
    pub fn clear_exports(&self) {
        let cleared = self.exports.len();
        self.exports.clear();
        debug!(cleared, "Cleared per-export statistics");
    }

    #[inline]
    pub(crate) fn record_glimpse_callback(&self, ok: bool) {
        self.glimpse_callbacks.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.glimpse_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn record_intent_replaced(&self) {
        self.intent_replaced.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_intent_aborted(&self) {
        self.intent_aborted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_forced_refresh(&self) {
        self.forced_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_stale_candidate(&self) {
        self.stale_candidates.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_tree_scan(&self) {
        self.tree_scans.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset every counter and drop per-export entries.
    pub fn reset(&self) {
        self.read_bytes.reset();
        self.write_bytes.reset();
        for counter in [
            &self.glimpse_callbacks,
            &self.glimpse_failures,
            &self.intent_replaced,
            &self.intent_aborted,
            &self.forced_refreshes,
            &self.stale_candidates,
            &self.tree_scans,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.exports.clear();
        *self.since.write() = SystemTime::now();
    }

    pub fn snapshot(&self) -> FilterStatsSnapshot {
        let mut exports: Vec<ExportStatsSnapshot> = self
            .exports
            .iter()
            .map(|entry| ExportStatsSnapshot {
                export_id: *entry.key(),
                read_bytes: entry.read_bytes.snapshot(),
                write_bytes: entry.write_bytes.snapshot(),
            })
            .collect();
        exports.sort_by_key(|export| export.export_id);

        FilterStatsSnapshot {
            read_bytes: self.read_bytes.snapshot(),
            write_bytes: self.write_bytes.snapshot(),
            glimpse_callbacks: self.glimpse_callbacks.load(Ordering::Relaxed),
            glimpse_failures: self.glimpse_failures.load(Ordering::Relaxed),
            intent_replaced: self.intent_replaced.load(Ordering::Relaxed),
            intent_aborted: self.intent_aborted.load(Ordering::Relaxed),
            forced_refreshes: self.forced_refreshes.load(Ordering::Relaxed),
            stale_candidates: self.stale_candidates.load(Ordering::Relaxed),
            tree_scans: self.tree_scans.load(Ordering::Relaxed),
            exports,
            since: *self.since.read(),
        }
    }
}

/// A serializable snapshot of filter statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterStatsSnapshot {
    pub read_bytes: AvgMinMaxSnapshot,
    pub write_bytes: AvgMinMaxSnapshot,
    /// Glimpse callbacks sent to lock holders.
    pub glimpse_callbacks: u64,
    /// Glimpse callbacks that returned an error.
    pub glimpse_failures: u64,
    /// Intent requests answered by granting a lock.
    pub intent_replaced: u64,
    /// Intent requests answered without a lock.
    pub intent_aborted: u64,
    /// Value blocks refreshed straight from storage.
    pub forced_refreshes: u64,
    /// Candidates skipped because their object was being destroyed.
    pub stale_candidates: u64,
    /// Interval trees walked by the resolver.
    pub tree_scans: u64,
    pub exports: Vec<ExportStatsSnapshot>,
    /// When counting started.
    #[serde(with = "humantime_serde")]
    pub since: SystemTime,
}

/// Where devices publish their statistics.
pub trait StatsRegistry: Send + Sync {
    fn register(&self, device: &str, stats: Arc<FilterStats>) -> Result<(), StatsError>;

    fn unregister(&self, device: &str);
}

/// Registry keeping statistics in memory, keyed by device name.
#[derive(Debug, Default)]
pub struct MemoryStatsRegistry {
    devices: DashMap<String, Arc<FilterStats>>,
    registrations: AtomicU64,
}

impl MemoryStatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device: &str) -> Option<Arc<FilterStats>> {
        self.devices.get(device).map(|stats| Arc::clone(stats.value()))
    }

    /// Number of successful `register` calls since creation.
    pub fn registrations(&self) -> u64 {
        self.registrations.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl StatsRegistry for MemoryStatsRegistry {
    fn register(&self, device: &str, stats: Arc<FilterStats>) -> Result<(), StatsError> {
        use dashmap::mapref::entry::Entry;

        match self.devices.entry(device.to_string()) {
            Entry::Occupied(_) => Err(StatsError::AlreadyRegistered {
                device: device.to_string(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(stats);
                self.registrations.fetch_add(1, Ordering::Relaxed);
                debug!(device, "Registered statistics");
                Ok(())
            }
        }
    }

    fn unregister(&self, device: &str) {
        if self.devices.remove(device).is_some() {
            debug!(device, "Unregistered statistics");
        }
    }
}
