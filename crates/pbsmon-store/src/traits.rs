use pbsmon_core::{
    CollectionEvent, EntityKind, EntityRecord, HistoryRecord, PassCounts, PassKind, PassOutcome,
    PassPlan, SystemUtilization, UtilizationBatch,
};

use crate::{CleanupCounts, EntityFilter, HistoryQuery, RetentionHorizons, Result};

/// Durable storage for the reconciliation engine.
///
/// One current-state table and one append-only history table per entity
/// kind, utilization snapshot tables, and the collection-event audit
/// trail. Implementations must apply each pass atomically and keep reads
/// free of partially applied batches.
pub trait Store: Send + Sync {
    fn schema_version(&self) -> Result<i32>;

    /// All current-state rows for a kind, keyed material for the reconciler.
    fn load_current(&self, kind: EntityKind) -> Result<Vec<EntityRecord>>;

    /// Open the audit row for a pass. Runs outside the pass transaction so
    /// a failed pass still leaves its event behind.
    fn begin_event(&self, kind: PassKind, started_at: i64) -> Result<i64>;

    /// Apply one pass's writes in a single transaction: all entity upserts
    /// and history appends commit or roll back together.
    fn apply_pass(&self, kind: EntityKind, event_id: i64, plan: &PassPlan) -> Result<()>;

    /// Persist one utilization batch (queue, node and system rows) in a
    /// single transaction.
    fn insert_utilization(&self, event_id: i64, batch: &UtilizationBatch) -> Result<()>;

    /// Close the audit row. Called unconditionally, success or failure.
    fn finish_event(
        &self,
        event_id: i64,
        finished_at: i64,
        outcome: PassOutcome,
        counts: &PassCounts,
        error_message: Option<&str>,
    ) -> Result<()>;

    fn get_current(&self, kind: EntityKind, filter: &EntityFilter) -> Result<Vec<EntityRecord>>;

    fn get_history(&self, kind: EntityKind, query: &HistoryQuery) -> Result<Vec<HistoryRecord>>;

    /// Events within `window_secs` of `now`, most recent first.
    fn recent_events(
        &self,
        kind: Option<PassKind>,
        now: i64,
        window_secs: i64,
    ) -> Result<Vec<CollectionEvent>>;

    fn latest_system_snapshot(&self) -> Result<Option<(i64, SystemUtilization)>>;

    /// Prune history/snapshot/event rows older than the horizons. Never
    /// removes a current-state row, any identifier's most recent history
    /// row, the most recent row of a snapshot table, or an event a
    /// surviving row still references; expired rows kept by those rules
    /// are reported in `protected_kept`.
    fn cleanup(&self, now: i64, horizons: &RetentionHorizons) -> Result<CleanupCounts>;
}
