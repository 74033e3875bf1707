use std::collections::BTreeMap;

use pbsmon_core::PassKind;

use crate::CollectionConfig;

/// Decides which passes are due. Pure bookkeeping over supplied
/// timestamps; the daemon owns the clock and runs due passes in a fixed
/// order so jobs are always freshest.
#[derive(Clone, Debug)]
pub struct SchedulerContext {
    intervals: BTreeMap<PassKind, i64>,
    last_run: BTreeMap<PassKind, i64>,
}

impl SchedulerContext {
    pub fn new(config: &CollectionConfig) -> Self {
        let intervals = PassKind::ALL
            .into_iter()
            .map(|p| (p, config.interval_for(p)))
            .collect();
        Self { intervals, last_run: BTreeMap::new() }
    }

    /// Passes whose interval has elapsed, in declaration order. A pass
    /// that has never run is always due. A nonpositive interval disables
    /// the pass.
    pub fn due(&self, now: i64) -> Vec<PassKind> {
        PassKind::ALL
            .into_iter()
            .filter(|p| {
                let interval = self.intervals.get(p).copied().unwrap_or(0);
                if interval <= 0 {
                    return false;
                }
                match self.last_run.get(p) {
                    None => true,
                    Some(last) => now - last >= interval,
                }
            })
            .collect()
    }

    pub fn mark_ran(&mut self, pass: PassKind, now: i64) {
        self.last_run.insert(pass, now);
    }
}
