use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::warn;

use crate::{EntityRecord, EntityState, HistoryInsert, ObservedRecord, PassCounts, TerminalStates};

/// The writes one reconciliation pass wants applied atomically: entity
/// upserts (full replacement rows) plus history appends.
#[derive(Clone, Debug, Default)]
pub struct PassPlan {
    pub upserts: Vec<EntityRecord>,
    pub history: Vec<HistoryInsert>,
    pub counts: PassCounts,
}

impl PassPlan {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.history.is_empty()
    }

    pub fn merge(&mut self, other: PassPlan) {
        self.upserts.extend(other.upserts);
        self.history.extend(other.history);
        self.counts.add(&other.counts);
    }
}

/// Compare one observation set against the persisted current-state rows
/// and decide what to write. Pure: the shell supplies `now` and the rows,
/// and applies the resulting plan in a single transaction.
///
/// Per observed record:
/// - unseen identifier: new entity row plus one history row
/// - finalized entity: bookkeeping only; a differing state is rejected
///   and counted, never applied
/// - same state: attrs and `last_updated` refresh, no history
/// - changed state: history append, state overwrite, finalize if the new
///   state is terminal
///
/// Records with an empty identifier or empty state are malformed: they
/// are skipped and counted, and the rest of the batch proceeds.
pub fn reconcile(
    now: i64,
    observed: &[ObservedRecord],
    current: &HashMap<String, EntityRecord>,
    terminal: &TerminalStates,
) -> PassPlan {
    let mut counts = PassCounts::default();
    let mut history = Vec::new();
    // Keyed so a duplicate identifier within one batch resolves to a
    // single row, later observation winning.
    let mut upserts: BTreeMap<String, EntityRecord> = BTreeMap::new();

    for obs in observed {
        if obs.id.is_empty() || obs.state.is_empty() {
            warn!(id = %obs.id, "skipping malformed observation");
            counts.parse_errors += 1;
            continue;
        }
        counts.observed += 1;

        let existing = upserts.get(&obs.id).cloned().or_else(|| current.get(&obs.id).cloned());
        match existing {
            None => {
                counts.new_entities += 1;
                history.push(HistoryInsert {
                    entity_id: obs.id.clone(),
                    timestamp: now,
                    state: obs.state.clone(),
                });
                upserts.insert(
                    obs.id.clone(),
                    EntityRecord {
                        id: obs.id.clone(),
                        state: obs.state.clone(),
                        attrs: obs.attrs.clone(),
                        first_seen: now,
                        last_updated: now,
                        is_final: terminal.contains(&obs.state),
                        raw: obs.raw.clone(),
                    },
                );
            }
            Some(mut row) if row.is_final => {
                // Protects completed records from stale re-queries and
                // identifier reuse after upstream purge.
                if row.state != obs.state {
                    counts.finality_rejections += 1;
                }
                row.last_updated = now;
                upserts.insert(obs.id.clone(), row);
            }
            Some(mut row) if row.state == obs.state => {
                row.attrs = obs.attrs.clone();
                row.last_updated = now;
                row.raw = obs.raw.clone();
                upserts.insert(obs.id.clone(), row);
            }
            Some(mut row) => {
                counts.state_changes += 1;
                history.push(HistoryInsert {
                    entity_id: obs.id.clone(),
                    timestamp: now,
                    state: obs.state.clone(),
                });
                row.state = obs.state.clone();
                row.attrs = obs.attrs.clone();
                row.last_updated = now;
                row.is_final = terminal.contains(&obs.state);
                row.raw = obs.raw.clone();
                upserts.insert(obs.id.clone(), row);
            }
        }
    }

    PassPlan { upserts: upserts.into_values().collect(), history, counts }
}

/// Staleness policy: close out non-final entities that neither source has
/// reconfirmed within the horizon, marking them final with the reserved
/// `unknown` state. Policy knob, not a correctness requirement; the
/// caller merges the result into the main plan so it commits in the same
/// transaction.
pub fn sweep_stale(
    now: i64,
    observed_ids: &HashSet<String>,
    current: &HashMap<String, EntityRecord>,
    stale_after_secs: i64,
) -> PassPlan {
    let mut plan = PassPlan::default();
    for row in current.values() {
        if row.is_final || observed_ids.contains(&row.id) {
            continue;
        }
        if now - row.last_updated < stale_after_secs {
            continue;
        }
        warn!(id = %row.id, last_updated = row.last_updated, "closing stale entity as unknown-terminal");
        let mut row = row.clone();
        plan.history.push(HistoryInsert {
            entity_id: row.id.clone(),
            timestamp: now,
            state: EntityState::unknown(),
        });
        row.state = EntityState::unknown();
        row.last_updated = now;
        row.is_final = true;
        plan.counts.state_changes += 1;
        plan.upserts.push(row);
    }
    plan
}
