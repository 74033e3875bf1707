use std::collections::BTreeMap;
use std::sync::Mutex;

use pbsmon_core::{
    CollectionEvent, EntityKind, EntityRecord, HistoryRecord, NodeUtilization, PassCounts,
    PassKind, PassOutcome, PassPlan, QueueUtilization, SystemUtilization, UtilizationBatch,
};

use crate::{
    CleanupCounts, EntityFilter, HistoryQuery, Result, RetentionHorizons, SortOrder, Store,
    SCHEMA_VERSION,
};

/// In-memory store for tests. Not durable, but implements the same
/// semantics as the SQLite backend, keep-latest pruning included.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Clone, Debug)]
struct SnapshotRow<T> {
    id: i64,
    timestamp: i64,
    event_id: i64,
    data: T,
}

#[derive(Default)]
struct Inner {
    entities: BTreeMap<EntityKind, BTreeMap<String, EntityRecord>>,
    history: BTreeMap<EntityKind, Vec<HistoryRecord>>,
    next_history_id: i64,
    events: Vec<CollectionEvent>,
    next_event_id: i64,
    queue_snapshots: Vec<SnapshotRow<QueueUtilization>>,
    node_snapshots: Vec<SnapshotRow<NodeUtilization>>,
    system_snapshots: Vec<SnapshotRow<SystemUtilization>>,
    next_snapshot_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn prune_history(rows: &mut Vec<HistoryRecord>, cutoff: i64, counts: &mut CleanupCounts) {
    // Latest row per identifier is protected whatever its age.
    let mut latest: BTreeMap<&str, i64> = BTreeMap::new();
    for r in rows.iter() {
        let e = latest.entry(r.entity_id.as_str()).or_insert(r.id);
        if r.id > *e {
            *e = r.id;
        }
    }
    let protected: Vec<i64> = latest.values().copied().collect();
    let before = rows.len();
    counts.protected_kept += rows
        .iter()
        .filter(|r| r.timestamp < cutoff && protected.contains(&r.id))
        .count() as u64;
    rows.retain(|r| r.timestamp >= cutoff || protected.contains(&r.id));
    counts.history_removed += (before - rows.len()) as u64;
}

fn prune_snapshots<T>(rows: &mut Vec<SnapshotRow<T>>, cutoff: i64, counts: &mut CleanupCounts) {
    let latest = rows.iter().map(|r| r.id).max();
    let before = rows.len();
    counts.protected_kept += rows
        .iter()
        .filter(|r| r.timestamp < cutoff && Some(r.id) == latest)
        .count() as u64;
    rows.retain(|r| r.timestamp >= cutoff || Some(r.id) == latest);
    counts.snapshots_removed += (before - rows.len()) as u64;
}

impl Store for MemoryStore {
    fn schema_version(&self) -> Result<i32> {
        Ok(SCHEMA_VERSION)
    }

    fn load_current(&self, kind: EntityKind) -> Result<Vec<EntityRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.entities.get(&kind).map(|m| m.values().cloned().collect()).unwrap_or_default())
    }

    fn begin_event(&self, kind: PassKind, started_at: i64) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_event_id += 1;
        let id = inner.next_event_id;
        inner.events.push(CollectionEvent {
            id,
            kind,
            started_at,
            finished_at: None,
            outcome: PassOutcome::Failed,
            counts: PassCounts::default(),
            error_message: None,
        });
        Ok(id)
    }

    fn apply_pass(&self, kind: EntityKind, event_id: i64, plan: &PassPlan) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for h in &plan.history {
            inner.next_history_id += 1;
            let id = inner.next_history_id;
            inner.history.entry(kind).or_default().push(HistoryRecord {
                id,
                entity_id: h.entity_id.clone(),
                timestamp: h.timestamp,
                state: h.state.clone(),
                collection_event_id: Some(event_id),
            });
        }
        let entities = inner.entities.entry(kind).or_default();
        for row in &plan.upserts {
            entities.insert(row.id.clone(), row.clone());
        }
        Ok(())
    }

    fn insert_utilization(&self, event_id: i64, batch: &UtilizationBatch) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for q in &batch.queues {
            inner.next_snapshot_id += 1;
            let id = inner.next_snapshot_id;
            inner
                .queue_snapshots
                .push(SnapshotRow { id, timestamp: batch.timestamp, event_id, data: q.clone() });
        }
        for n in &batch.nodes {
            inner.next_snapshot_id += 1;
            let id = inner.next_snapshot_id;
            inner
                .node_snapshots
                .push(SnapshotRow { id, timestamp: batch.timestamp, event_id, data: n.clone() });
        }
        inner.next_snapshot_id += 1;
        let id = inner.next_snapshot_id;
        inner.system_snapshots.push(SnapshotRow {
            id,
            timestamp: batch.timestamp,
            event_id,
            data: batch.system.clone(),
        });
        Ok(())
    }

    fn finish_event(
        &self,
        event_id: i64,
        finished_at: i64,
        outcome: PassOutcome,
        counts: &PassCounts,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ev) = inner.events.iter_mut().find(|e| e.id == event_id) {
            ev.finished_at = Some(finished_at);
            ev.outcome = outcome;
            ev.counts = *counts;
            ev.error_message = error_message.map(str::to_string);
        }
        Ok(())
    }

    fn get_current(&self, kind: EntityKind, filter: &EntityFilter) -> Result<Vec<EntityRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<EntityRecord> = inner
            .entities
            .get(&kind)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        if let Some(state) = &filter.state {
            rows.retain(|r| r.state.as_str() == state);
        }
        if !filter.include_final {
            rows.retain(|r| !r.is_final);
        }
        if let Some(limit) = filter.limit {
            rows.truncate(limit as usize);
        }
        Ok(rows)
    }

    fn get_history(&self, kind: EntityKind, query: &HistoryQuery) -> Result<Vec<HistoryRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<HistoryRecord> = inner
            .history
            .get(&kind)
            .map(|v| v.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|r| query.entity_id.as_deref().map_or(true, |id| r.entity_id == id))
            .filter(|r| query.since.map_or(true, |s| r.timestamp >= s))
            .filter(|r| query.until.map_or(true, |u| r.timestamp <= u))
            .collect();
        rows.sort_by_key(|r| (r.timestamp, r.id));
        if query.order == SortOrder::Descending {
            rows.reverse();
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit as usize);
        }
        Ok(rows)
    }

    fn recent_events(
        &self,
        kind: Option<PassKind>,
        now: i64,
        window_secs: i64,
    ) -> Result<Vec<CollectionEvent>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<CollectionEvent> = inner
            .events
            .iter()
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .filter(|e| e.started_at >= now - window_secs)
            .cloned()
            .collect();
        rows.sort_by_key(|e| (std::cmp::Reverse(e.started_at), std::cmp::Reverse(e.id)));
        Ok(rows)
    }

    fn latest_system_snapshot(&self) -> Result<Option<(i64, SystemUtilization)>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .system_snapshots
            .iter()
            .max_by_key(|r| r.id)
            .map(|r| (r.timestamp, r.data.clone())))
    }

    fn cleanup(&self, now: i64, horizons: &RetentionHorizons) -> Result<CleanupCounts> {
        let mut inner = self.inner.lock().unwrap();
        let history_cutoff = horizons.history_cutoff(now);
        let snapshot_cutoff = horizons.snapshot_cutoff(now);
        let mut counts = CleanupCounts::default();

        let Inner { history, queue_snapshots, node_snapshots, system_snapshots, events, .. } =
            &mut *inner;
        for kind in EntityKind::ALL {
            if let Some(rows) = history.get_mut(&kind) {
                prune_history(rows, history_cutoff, &mut counts);
            }
        }
        prune_snapshots(queue_snapshots, snapshot_cutoff, &mut counts);
        prune_snapshots(node_snapshots, snapshot_cutoff, &mut counts);
        prune_snapshots(system_snapshots, snapshot_cutoff, &mut counts);

        // An event stays for as long as a surviving history or snapshot
        // row still points at it, matching the SQLite foreign keys.
        let mut referenced: std::collections::BTreeSet<i64> = std::collections::BTreeSet::new();
        for rows in history.values() {
            referenced.extend(rows.iter().filter_map(|r| r.collection_event_id));
        }
        referenced.extend(queue_snapshots.iter().map(|r| r.event_id));
        referenced.extend(node_snapshots.iter().map(|r| r.event_id));
        referenced.extend(system_snapshots.iter().map(|r| r.event_id));

        let before = events.len();
        counts.protected_kept += events
            .iter()
            .filter(|e| e.started_at < history_cutoff && referenced.contains(&e.id))
            .count() as u64;
        events.retain(|e| e.started_at >= history_cutoff || referenced.contains(&e.id));
        counts.events_removed += (before - events.len()) as u64;

        Ok(counts)
    }
}
