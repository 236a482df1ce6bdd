//! Tiered-storage migration policy engine.
//!
//! Decides when items move hot→warm→cold and assembles migration
//! batches. The engine only decides; executing a migration (copying
//! bytes, updating manifests) belongs to the host.
//!
//! # Decision priority (hot→warm)
//!
//! 1. Emergency: the hot tier is at ≥ 99% - migrate no matter what.
//! 2. Access frequency: recently-hot items stay put short of emergency.
//! 3. TTL: items past `max_age_ms` migrate.
//! 4. Size threshold: tier past `max_hot_size_percent` migrates items.
//! 5. Otherwise the item stays.

use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, ValidationError};
use crate::types::Timestamp;

/// Storage tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Instance-local, lowest latency.
    Hot,
    /// Instance-local, compacted.
    Warm,
    /// Object storage, highest latency.
    Cold,
}

/// Hot→warm section of the policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HotToWarmPolicy {
    /// Age after which an item is eligible to leave the hot tier.
    pub max_age_ms: i64,
    /// Accesses within the window that veto migration.
    pub min_access_count: u64,
    /// Tier fill percentage that forces migrations.
    pub max_hot_size_percent: f64,
    /// Window the access counter is measured over.
    pub access_window_ms: Option<i64>,
}

impl Default for HotToWarmPolicy {
    fn default() -> Self {
        Self {
            max_age_ms: 24 * 60 * 60 * 1000,
            min_access_count: 5,
            max_hot_size_percent: 80.0,
            access_window_ms: Some(60 * 60 * 1000),
        }
    }
}

/// Warm→cold section of the policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WarmToColdPolicy {
    /// Retention period in the warm tier.
    pub max_age_ms: i64,
    /// Minimum aggregate bytes before a cold partition is worth writing.
    pub min_partition_size_bytes: u64,
    /// How long cold artifacts are kept, if bounded.
    pub retention_period_ms: Option<i64>,
}

impl Default for WarmToColdPolicy {
    fn default() -> Self {
        Self {
            max_age_ms: 7 * 24 * 60 * 60 * 1000,
            min_partition_size_bytes: 4 * 1024 * 1024,
            retention_period_ms: None,
        }
    }
}

/// Batch-sizing section of the policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchPolicy {
    /// Below this many candidates a non-urgent batch is skipped.
    pub min: usize,
    /// Hard cap on items per batch.
    pub max: usize,
    /// Byte budget per batch (20% overshoot allowed).
    pub target_bytes: u64,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            min: 10,
            max: 1000,
            target_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Complete migration policy.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationPolicy {
    /// Hot→warm rules.
    pub hot_to_warm: HotToWarmPolicy,
    /// Warm→cold rules.
    pub warm_to_cold: WarmToColdPolicy,
    /// Batch sizing.
    pub batch: BatchPolicy,
}

impl MigrationPolicy {
    /// Validates the policy.
    ///
    /// # Errors
    /// Rejects non-positive ages and fill percentages outside `[0, 100]`.
    pub fn validate(&self) -> Result<()> {
        if self.hot_to_warm.max_age_ms <= 0 {
            return Err(ValidationError::invalid_field(
                "hot_to_warm.max_age_ms",
                "must be positive",
            )
            .into());
        }
        if self.warm_to_cold.max_age_ms <= 0 {
            return Err(ValidationError::invalid_field(
                "warm_to_cold.max_age_ms",
                "must be positive",
            )
            .into());
        }
        if !(0.0..=100.0).contains(&self.hot_to_warm.max_hot_size_percent) {
            return Err(ValidationError::invalid_field(
                "hot_to_warm.max_hot_size_percent",
                "must be between 0 and 100",
            )
            .into());
        }
        Ok(())
    }
}

/// Per-section partial update; `None` sections keep their prior value.
#[derive(Clone, Debug, Default)]
pub struct PolicyUpdate {
    /// Replacement hot→warm section.
    pub hot_to_warm: Option<HotToWarmPolicy>,
    /// Replacement warm→cold section.
    pub warm_to_cold: Option<WarmToColdPolicy>,
    /// Replacement batch section.
    pub batch: Option<BatchPolicy>,
}

/// A migratable item as the policy sees it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MigrationItem {
    /// Item identity.
    pub id: String,
    /// Creation time.
    pub created_at: Timestamp,
    /// Size on the current tier.
    pub size_bytes: u64,
}

/// Current fill state of a tier.
#[derive(Clone, Copy, Debug, Default)]
pub struct TierUsage {
    /// Percentage of capacity in use, `0..=100`.
    pub percent_full: f64,
}

/// Access statistics for one item.
#[derive(Clone, Copy, Debug, Default)]
pub struct AccessStats {
    /// Accesses inside the policy's window.
    pub recent_accesses: u64,
    /// Most recent access, if any.
    pub last_access_at: Option<Timestamp>,
}

/// Why a decision came out the way it did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionReason {
    /// The hot tier is critically full.
    Emergency,
    /// The item is accessed too often to migrate.
    FrequentlyAccessed,
    /// The item aged out.
    TtlExceeded,
    /// The tier crossed its size threshold.
    SizeThreshold,
    /// Nothing forces a move yet.
    BelowTtl,
    /// Warm item past its retention period.
    RetentionExceeded,
    /// Warm item still within retention.
    WithinRetention,
}

impl DecisionReason {
    /// Human-readable reason string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Emergency => "emergency",
            Self::FrequentlyAccessed => "frequently accessed",
            Self::TtlExceeded => "TTL exceeded",
            Self::SizeThreshold => "size threshold",
            Self::BelowTtl => "below TTL",
            Self::RetentionExceeded => "retention period exceeded",
            Self::WithinRetention => "within retention period",
        }
    }
}

/// Which rule won the decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionPriority {
    /// Emergency tier pressure.
    Emergency,
    /// Access-frequency veto.
    AccessFrequency,
    /// Time-to-live rule.
    Ttl,
    /// Size-threshold rule.
    SizePressure,
}

impl DecisionPriority {
    /// Priority label used in decision records.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Emergency => "emergency",
            Self::AccessFrequency => "access-frequency",
            Self::Ttl => "ttl",
            Self::SizePressure => "size-pressure",
        }
    }
}

/// Outcome of evaluating one item.
#[derive(Clone, Debug)]
pub struct MigrationDecision {
    /// Item the decision concerns.
    pub item_id: String,
    /// Whether to migrate now.
    pub should_migrate: bool,
    /// True only for the ≥ 99% emergency path.
    pub is_emergency: bool,
    /// Rule that decided.
    pub priority: Option<DecisionPriority>,
    /// Reason for the outcome.
    pub reason: DecisionReason,
    /// Tier the item is on.
    pub source_tier: Tier,
    /// Tier the item would move to.
    pub target_tier: Tier,
}

/// A selected migration batch.
#[derive(Clone, Debug)]
pub struct MigrationBatch {
    /// Items to migrate, in priority order.
    pub items: Vec<MigrationItem>,
    /// Sum of `size_bytes` over `items`.
    pub total_bytes: u64,
    /// False when the batch is below policy minimums.
    pub should_proceed: bool,
    /// Why the batch proceeds or not.
    pub reason: String,
    /// When selection ran.
    pub started_at: Timestamp,
    /// Set by the executor once the batch lands.
    pub completed_at: Option<Timestamp>,
}

/// Rolling statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MigrationStats {
    /// Items run through `evaluate_*`.
    pub total_migrations_evaluated: u64,
    /// Bytes reported migrated via [`MigrationEngine::record_migration`].
    pub total_bytes_migrated: u64,
    /// Mean recorded migration duration.
    pub average_migration_time_ms: f64,
    /// Most recent recorded migration.
    pub last_migration_at: Option<Timestamp>,
}

#[derive(Debug, Default)]
struct StatsInner {
    evaluated: u64,
    bytes: u64,
    time_total_ms: u64,
    migrations: u64,
    last_at: Option<Timestamp>,
}

/// Policy engine: per-item decisions plus batch assembly.
#[derive(Debug)]
pub struct MigrationEngine {
    policy: RwLock<MigrationPolicy>,
    stats: Mutex<StatsInner>,
}

impl MigrationEngine {
    /// Creates an engine with a validated policy.
    pub fn new(policy: MigrationPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            policy: RwLock::new(policy),
            stats: Mutex::new(StatsInner::default()),
        })
    }

    /// Returns a copy of the current policy.
    pub fn policy(&self) -> MigrationPolicy {
        self.policy.read().unwrap().clone()
    }

    /// Applies a partial update, replacing only the supplied sections.
    ///
    /// # Errors
    /// The merged policy is re-validated; on failure nothing changes.
    pub fn update_policy(&self, update: PolicyUpdate) -> Result<()> {
        let mut merged = self.policy();
        if let Some(section) = update.hot_to_warm {
            merged.hot_to_warm = section;
        }
        if let Some(section) = update.warm_to_cold {
            merged.warm_to_cold = section;
        }
        if let Some(section) = update.batch {
            merged.batch = section;
        }
        merged.validate()?;
        *self.policy.write().unwrap() = merged;
        Ok(())
    }

    /// Decides whether one hot item should move to warm.
    pub fn evaluate_hot_to_warm(
        &self,
        item: &MigrationItem,
        tier_usage: &TierUsage,
        access: Option<&AccessStats>,
    ) -> MigrationDecision {
        self.stats.lock().unwrap().evaluated += 1;
        let policy = self.policy.read().unwrap();
        let now = Timestamp::now();
        // Future timestamps count as age zero
        let age_ms = now.millis_since(item.created_at);

        let decide = |should_migrate, is_emergency, priority, reason| MigrationDecision {
            item_id: item.id.clone(),
            should_migrate,
            is_emergency,
            priority,
            reason,
            source_tier: Tier::Hot,
            target_tier: Tier::Warm,
        };

        if tier_usage.percent_full >= 99.0 {
            return decide(
                true,
                true,
                Some(DecisionPriority::Emergency),
                DecisionReason::Emergency,
            );
        }

        if let Some(access) = access {
            let in_window = match (policy.hot_to_warm.access_window_ms, access.last_access_at) {
                (Some(window), Some(last)) => now.millis_since(last) <= window,
                (Some(_), None) => false,
                (None, _) => true,
            };
            if in_window && access.recent_accesses >= policy.hot_to_warm.min_access_count {
                return decide(
                    false,
                    false,
                    Some(DecisionPriority::AccessFrequency),
                    DecisionReason::FrequentlyAccessed,
                );
            }
        }

        if age_ms >= policy.hot_to_warm.max_age_ms {
            return decide(
                true,
                false,
                Some(DecisionPriority::Ttl),
                DecisionReason::TtlExceeded,
            );
        }

        if tier_usage.percent_full >= policy.hot_to_warm.max_hot_size_percent {
            return decide(
                true,
                false,
                Some(DecisionPriority::SizePressure),
                DecisionReason::SizeThreshold,
            );
        }

        decide(false, false, None, DecisionReason::BelowTtl)
    }

    /// Decides whether one warm item should move to cold.
    pub fn evaluate_warm_to_cold(&self, item: &MigrationItem) -> MigrationDecision {
        self.stats.lock().unwrap().evaluated += 1;
        let policy = self.policy.read().unwrap();
        let age_ms = Timestamp::now().millis_since(item.created_at);
        let expired = age_ms >= policy.warm_to_cold.max_age_ms;
        MigrationDecision {
            item_id: item.id.clone(),
            should_migrate: expired,
            is_emergency: false,
            priority: expired.then_some(DecisionPriority::Ttl),
            reason: if expired {
                DecisionReason::RetentionExceeded
            } else {
                DecisionReason::WithinRetention
            },
            source_tier: Tier::Warm,
            target_tier: Tier::Cold,
        }
    }

    /// Selects a hot→warm batch from candidate items.
    ///
    /// Items whose individual decision is "stay" are filtered out;
    /// survivors are taken oldest-first (least-accessed items age
    /// fastest, so creation order is the access-pressure order the
    /// policy wants) until the byte budget or item cap is hit.
    pub fn select_hot_to_warm_batch(
        &self,
        items: &[(MigrationItem, Option<AccessStats>)],
        tier_usage: &TierUsage,
    ) -> MigrationBatch {
        let started_at = Timestamp::now();
        let policy = self.policy();

        let mut eligible: Vec<&MigrationItem> = items
            .iter()
            .filter(|(item, access)| {
                self.evaluate_hot_to_warm(item, tier_usage, access.as_ref())
                    .should_migrate
            })
            .map(|(item, _)| item)
            .collect();

        if eligible.len() < policy.batch.min
            && tier_usage.percent_full < policy.hot_to_warm.max_hot_size_percent
        {
            debug!(
                candidates = eligible.len(),
                min = policy.batch.min,
                "Batch below minimum; deferring"
            );
            return MigrationBatch {
                items: Vec::new(),
                total_bytes: 0,
                should_proceed: false,
                reason: "minimum batch".to_string(),
                started_at,
                completed_at: None,
            };
        }

        eligible.sort_by_key(|item| item.created_at);
        let (selected, total_bytes) = accumulate(&eligible, &policy.batch);

        MigrationBatch {
            items: selected,
            total_bytes,
            should_proceed: true,
            reason: "hot tier policy".to_string(),
            started_at,
            completed_at: None,
        }
    }

    /// Selects a warm→cold batch from candidate items.
    pub fn select_warm_to_cold_batch(&self, items: &[MigrationItem]) -> MigrationBatch {
        let started_at = Timestamp::now();
        let policy = self.policy();

        let candidate_bytes: u64 = items.iter().map(|item| item.size_bytes).sum();
        if candidate_bytes < policy.warm_to_cold.min_partition_size_bytes {
            return MigrationBatch {
                items: Vec::new(),
                total_bytes: 0,
                should_proceed: false,
                reason: "minimum partition size".to_string(),
                started_at,
                completed_at: None,
            };
        }

        let mut ordered: Vec<&MigrationItem> = items.iter().collect();
        ordered.sort_by_key(|item| item.created_at);
        let (selected, total_bytes) = accumulate(&ordered, &policy.batch);

        MigrationBatch {
            items: selected,
            total_bytes,
            should_proceed: true,
            reason: "warm tier retention".to_string(),
            started_at,
            completed_at: None,
        }
    }

    /// Records a completed migration for the statistics.
    pub fn record_migration(&self, bytes: u64, duration_ms: u64) {
        let mut stats = self.stats.lock().unwrap();
        stats.bytes += bytes;
        stats.time_total_ms += duration_ms;
        stats.migrations += 1;
        stats.last_at = Some(Timestamp::now());
    }

    /// Returns accumulated statistics.
    pub fn stats(&self) -> MigrationStats {
        let stats = self.stats.lock().unwrap();
        MigrationStats {
            total_migrations_evaluated: stats.evaluated,
            total_bytes_migrated: stats.bytes,
            average_migration_time_ms: if stats.migrations == 0 {
                0.0
            } else {
                stats.time_total_ms as f64 / stats.migrations as f64
            },
            last_migration_at: stats.last_at,
        }
    }
}

/// Accumulates items until the byte budget (with 20% overshoot) or the
/// item cap is reached, whichever comes first.
fn accumulate(ordered: &[&MigrationItem], batch: &BatchPolicy) -> (Vec<MigrationItem>, u64) {
    let budget = batch.target_bytes + batch.target_bytes / 5;
    let mut selected = Vec::new();
    let mut total = 0u64;
    for item in ordered {
        if selected.len() >= batch.max {
            break;
        }
        if total >= batch.target_bytes {
            break;
        }
        if total + item.size_bytes > budget && !selected.is_empty() {
            break;
        }
        total += item.size_bytes;
        selected.push((*item).clone());
    }
    (selected, total)
}
