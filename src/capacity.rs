// Capacity watchdog - keeps the cache tiers under their usage thresholds

use crate::cache::{ActiveBackend, CacheBackend, CacheManager, SetOptions};
use crate::config::CapacityConfig;
use crate::error::{EdgeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Share of L1 items migrated (or evicted) when L1 crosses its threshold.
const L1_BATCH_PERCENT: u64 = 20;
/// Share of L2 items evicted when L2 crosses its threshold.
const L2_BATCH_PERCENT: u64 = 10;

/// Outcome of one watchdog cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleReport {
    /// Mode the cycle ran against.
    pub mode: String,
    pub l1_used_percentage: Option<f64>,
    pub l2_used_percentage: Option<f64>,
    pub evicted: u64,
    pub migrated: u64,
    pub migration_failures: u64,
}

/// Cumulative watchdog statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapacityStats {
    pub cycles: u64,
    pub evicted: u64,
    pub migrated: u64,
    pub migration_failures: u64,
    pub last_run: Option<DateTime<Utc>>,
}

/// Periodic watchdog enforcing tier capacity.
///
/// Each tick reads the active backend's capacity and, per mode:
/// Redis over its threshold sheds ~20% of its lowest-hit-count items;
/// Cassandra over its threshold sheds ~10%; in hybrid mode the tiers are
/// checked independently and an overfull L1 *migrates* its batch into L2
/// instead of dropping it. The memory backend manages itself through
/// admission eviction, so the watchdog leaves it alone.
///
/// The cycle never takes locks across its read-then-act sequence; a key
/// selected for migration may be deleted or replaced mid-flight, and every
/// such not-found is benign.
pub struct CapacityManager {
    manager: Arc<CacheManager>,
    interval: Duration,
    redis_threshold: AtomicU64,
    cassandra_threshold: AtomicU64,
    stats: tokio::sync::RwLock<CapacityStats>,
    stop: watch::Sender<bool>,
    started: AtomicBool,
}

impl CapacityManager {
    pub fn new(manager: Arc<CacheManager>, config: &CapacityConfig) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            manager,
            interval: config.check_interval,
            redis_threshold: AtomicU64::new(config.redis_threshold.to_bits()),
            cassandra_threshold: AtomicU64::new(config.cassandra_threshold.to_bits()),
            stats: tokio::sync::RwLock::new(CapacityStats::default()),
            stop,
            started: AtomicBool::new(false),
        }
    }

    /// Current (redis, cassandra) thresholds in percent.
    pub fn thresholds(&self) -> (f64, f64) {
        (
            f64::from_bits(self.redis_threshold.load(Ordering::Relaxed)),
            f64::from_bits(self.cassandra_threshold.load(Ordering::Relaxed)),
        )
    }

    /// Update thresholds at runtime. Each must lie strictly inside (0, 100).
    pub fn set_thresholds(&self, redis: Option<f64>, cassandra: Option<f64>) -> Result<()> {
        for value in [redis, cassandra].into_iter().flatten() {
            if !(value > 0.0 && value < 100.0) {
                return Err(EdgeError::BadRequest(format!(
                    "threshold {value} outside (0, 100)"
                )));
            }
        }
        if let Some(value) = redis {
            self.redis_threshold.store(value.to_bits(), Ordering::Relaxed);
        }
        if let Some(value) = cassandra {
            self.cassandra_threshold.store(value.to_bits(), Ordering::Relaxed);
        }
        info!(?redis, ?cassandra, "Capacity thresholds updated");
        Ok(())
    }

    /// Cumulative statistics.
    pub async fn stats(&self) -> CapacityStats {
        self.stats.read().await.clone()
    }

    /// Launch the periodic watchdog. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let watchdog = Arc::clone(self);
        let mut stop = self.stop.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(watchdog.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so startup stays quiet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        watchdog.run_cycle().await;
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Capacity watchdog stopped");
        });
        info!(interval_secs = self.interval.as_secs(), "Capacity watchdog started");
    }

    /// Stop the periodic watchdog; an in-flight cycle finishes first.
    pub fn stop_monitoring(&self) {
        let _ = self.stop.send(true);
    }

    /// Run one enforcement cycle on demand.
    pub async fn force_capacity_check(&self) -> CycleReport {
        self.run_cycle().await
    }

    async fn run_cycle(&self) -> CycleReport {
        let (redis_threshold, cassandra_threshold) = self.thresholds();
        let mut report = CycleReport::default();

        let Some(active) = self.manager.active().await else {
            return report;
        };
        report.mode = active.mode().to_string();

        match active {
            ActiveBackend::Memory(_) => {
                // Self-managing via admission eviction.
            }
            ActiveBackend::Redis(backend) => {
                let (used, evicted) =
                    evict_tier(backend.as_ref(), redis_threshold, L1_BATCH_PERCENT).await;
                report.l1_used_percentage = Some(used);
                report.evicted += evicted;
            }
            ActiveBackend::Cassandra(backend) => {
                let (used, evicted) =
                    evict_tier(backend.as_ref(), cassandra_threshold, L2_BATCH_PERCENT).await;
                report.l2_used_percentage = Some(used);
                report.evicted += evicted;
            }
            ActiveBackend::Hybrid(hybrid) => {
                let l1 = hybrid.l1();
                let l2 = hybrid.l2();

                let (used, migrated, failures) =
                    migrate_tier(l1.as_ref(), l2.as_ref(), redis_threshold, L1_BATCH_PERCENT)
                        .await;
                report.l1_used_percentage = Some(used);
                report.migrated += migrated;
                report.migration_failures += failures;

                let (used, evicted) =
                    evict_tier(l2.as_ref(), cassandra_threshold, L2_BATCH_PERCENT).await;
                report.l2_used_percentage = Some(used);
                report.evicted += evicted;
            }
        }

        let mut stats = self.stats.write().await;
        stats.cycles += 1;
        stats.evicted += report.evicted;
        stats.migrated += report.migrated;
        stats.migration_failures += report.migration_failures;
        stats.last_run = Some(Utc::now());

        if report.evicted > 0 || report.migrated > 0 || report.migration_failures > 0 {
            info!(
                mode = %report.mode,
                evicted = report.evicted,
                migrated = report.migrated,
                failures = report.migration_failures,
                "Capacity cycle enforced"
            );
        } else {
            debug!(mode = %report.mode, "Capacity cycle idle");
        }
        report
    }
}

/// Batch size for a tier: `percent` of its resident items, at least one.
fn batch_size(item_count: u64, percent: u64) -> usize {
    ((item_count * percent / 100).max(1)) as usize
}

/// Evict the tier's lowest-hit-count batch when it sits at or above the
/// threshold. Returns `(used_percentage, evicted)`.
async fn evict_tier<B: CacheBackend + ?Sized>(
    tier: &B,
    threshold: f64,
    percent: u64,
) -> (f64, u64) {
    let capacity = tier.capacity().await;
    if capacity.used_percentage < threshold || capacity.item_count == 0 {
        return (capacity.used_percentage, 0);
    }

    let batch = batch_size(capacity.item_count, percent);
    let victims = tier.items_by_hit_count(batch).await;
    let mut evicted = 0u64;

    for victim in victims {
        // Selection raced a delete or replacement; absence is benign.
        if tier.delete(&victim.key).await {
            evicted += 1;
        }
    }

    debug!(
        used = capacity.used_percentage,
        threshold,
        evicted,
        "Tier eviction pass"
    );
    (capacity.used_percentage, evicted)
}

/// Migrate the L1 tier's lowest-hit-count batch into L2 when L1 sits at or
/// above the threshold. Returns `(used_percentage, migrated, failures)`.
async fn migrate_tier<L1, L2>(l1: &L1, l2: &L2, threshold: f64, percent: u64) -> (f64, u64, u64)
where
    L1: CacheBackend + ?Sized,
    L2: CacheBackend + ?Sized,
{
    let capacity = l1.capacity().await;
    if capacity.used_percentage < threshold || capacity.item_count == 0 {
        return (capacity.used_percentage, 0, 0);
    }

    let batch = batch_size(capacity.item_count, percent);
    let candidates = l1.items_by_hit_count(batch).await;
    let mut migrated = 0u64;
    let mut failures = 0u64;

    for candidate in candidates {
        let Some(item) = l1.get(&candidate.key).await else {
            // Deleted or expired since selection; nothing to move.
            continue;
        };

        let opts = SetOptions {
            ttl: Some(item.remaining_ttl(Utc::now())),
            content_type: item.content_type.clone(),
            etag: item.etag.clone(),
            last_modified: item.last_modified,
        };

        if l2.set(&candidate.key, item.data.clone(), opts).await {
            l1.delete(&candidate.key).await;
            migrated += 1;
        } else {
            warn!(key = %candidate.key, "Migration write rejected by L2");
            failures += 1;
        }
    }

    (capacity.used_percentage, migrated, failures)
}
