use anyhow::Result;
use tracing::info;

use pbsmon_store::{CleanupCounts, Store};

use crate::RetentionConfig;

/// Periodic pruning of history, snapshot and event rows. Runs inside the
/// daemon loop on its own cadence; the store enforces the keep-latest
/// rules, this just decides when to ask.
pub struct RetentionManager {
    config: RetentionConfig,
    last_run: Option<i64>,
}

impl RetentionManager {
    pub fn new(config: RetentionConfig) -> Self {
        Self { config, last_run: None }
    }

    pub fn is_due(&self, now: i64) -> bool {
        if self.config.sweep_interval_secs <= 0 {
            return false;
        }
        match self.last_run {
            None => true,
            Some(last) => now - last >= self.config.sweep_interval_secs,
        }
    }

    /// Run cleanup when due; returns what was removed, or None when it
    /// was not yet time.
    pub fn maybe_run(&mut self, now: i64, store: &dyn Store) -> Result<Option<CleanupCounts>> {
        if !self.is_due(now) {
            return Ok(None);
        }
        self.last_run = Some(now);
        let counts = store.cleanup(now, &self.config.horizons())?;
        if counts.total_removed() > 0 || counts.protected_kept > 0 {
            info!(
                history = counts.history_removed,
                snapshots = counts.snapshots_removed,
                events = counts.events_removed,
                protected = counts.protected_kept,
                "retention sweep finished"
            );
        }
        Ok(Some(counts))
    }
}
