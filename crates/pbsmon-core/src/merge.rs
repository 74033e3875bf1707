use std::collections::BTreeMap;

use crate::{ObservedRecord, TerminalStates};

/// Merge the live job listing with the best-effort recently-terminal
/// query so a job that transitions and vanishes within one polling
/// interval is still captured. On an identifier collision the
/// recently-terminal record wins only when its state is terminal: a
/// terminal observation is strictly later information, while a non-
/// terminal duplicate from the historical query is stale.
pub fn merge_observations(
    live: Vec<ObservedRecord>,
    recently_terminal: Vec<ObservedRecord>,
    terminal: &TerminalStates,
) -> Vec<ObservedRecord> {
    let mut merged: BTreeMap<String, ObservedRecord> = BTreeMap::new();
    for rec in live {
        merged.insert(rec.id.clone(), rec);
    }
    for rec in recently_terminal {
        match merged.get(&rec.id) {
            Some(_) if !terminal.contains(&rec.state) => {}
            _ => {
                merged.insert(rec.id.clone(), rec);
            }
        }
    }
    merged.into_values().collect()
}
