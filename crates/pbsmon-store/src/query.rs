use serde::{Deserialize, Serialize};

/// Filter for current-state reads.
#[derive(Clone, Debug, Default)]
pub struct EntityFilter {
    pub state: Option<String>,
    /// When false, finalized entities are excluded.
    pub include_final: bool,
    pub limit: Option<u32>,
}

impl EntityFilter {
    pub fn all() -> Self {
        Self { include_final: true, ..Default::default() }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// History read: by identifier and/or time range, bounded and ordered by
/// acceptance time.
#[derive(Clone, Debug, Default)]
pub struct HistoryQuery {
    pub entity_id: Option<String>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<u32>,
    pub order: SortOrder,
}

impl HistoryQuery {
    pub fn for_entity(id: impl Into<String>) -> Self {
        Self { entity_id: Some(id.into()), ..Default::default() }
    }
}

/// Maximum age of prunable rows, in days.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RetentionHorizons {
    pub history_days: i64,
    pub snapshot_days: i64,
}

impl RetentionHorizons {
    pub fn history_cutoff(&self, now: i64) -> i64 {
        now - self.history_days * 86_400
    }

    pub fn snapshot_cutoff(&self, now: i64) -> i64 {
        now - self.snapshot_days * 86_400
    }
}

impl Default for RetentionHorizons {
    fn default() -> Self {
        Self { history_days: 365, snapshot_days: 90 }
    }
}

/// What one cleanup run removed, and how many expired rows the keep-latest
/// invariant protected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupCounts {
    pub history_removed: u64,
    pub snapshots_removed: u64,
    pub events_removed: u64,
    pub protected_kept: u64,
}

impl CleanupCounts {
    pub fn total_removed(&self) -> u64 {
        self.history_removed + self.snapshots_removed + self.events_removed
    }
}
