use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::{Map, Value};
use tracing::debug;

use pbsmon_core::{
    CollectionEvent, EntityKind, EntityRecord, EntityState, HistoryRecord, PassCounts, PassKind,
    PassOutcome, PassPlan, SystemUtilization, UtilizationBatch,
};
use pbsmon_store::{
    CleanupCounts, EntityFilter, HistoryQuery, Result, RetentionHorizons, SortOrder, Store,
    StoreError, SCHEMA_VERSION,
};

const INIT_SQL: &str = include_str!("../migrations/0001_init.sql");

/// SQLite-backed store. A single connection behind a mutex; WAL mode and
/// a busy timeout let concurrent processes share the file, and every pass
/// commits through one immediate transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open an existing database. Refuses to proceed unless the schema
    /// version matches exactly; a missing or older schema means `migrate`
    /// has to run first, a newer one means this binary is too old.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_connection(path.as_ref())?;
        let found = read_schema_version(&conn)?;
        if found != SCHEMA_VERSION {
            return Err(StoreError::SchemaVersion { found, expected: SCHEMA_VERSION });
        }
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Create or upgrade the schema, then open. The only operation allowed
    /// to change `schema_version`.
    pub fn migrate(path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_connection(path.as_ref())?;
        let found = read_schema_version(&conn)?;
        if found > SCHEMA_VERSION {
            return Err(StoreError::SchemaVersion { found, expected: SCHEMA_VERSION });
        }
        conn.execute_batch(INIT_SQL).map_err(map_sqlite)?;
        if found == 0 {
            conn.execute("INSERT INTO schema_version (version) VALUES (?1)", params![SCHEMA_VERSION])
                .map_err(map_sqlite)?;
        } else if found < SCHEMA_VERSION {
            conn.execute("UPDATE schema_version SET version = ?1", params![SCHEMA_VERSION])
                .map_err(map_sqlite)?;
        }
        debug!(path = %path.as_ref().display(), version = SCHEMA_VERSION, "schema ready");
        Ok(Self { conn: Mutex::new(conn) })
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).map_err(map_sqlite)?;
    conn.execute_batch(
        "PRAGMA foreign_keys=ON;
         PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA busy_timeout=5000;",
    )
    .map_err(map_sqlite)?;
    Ok(conn)
}

/// 0 when the database has never been migrated.
fn read_schema_version(conn: &Connection) -> Result<i32> {
    let exists: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_sqlite)?;
    if exists.is_none() {
        return Ok(0);
    }
    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
        .optional()
        .map_err(map_sqlite)?;
    Ok(version.unwrap_or(0))
}

fn map_sqlite(err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(e, _) = &err {
        if matches!(
            e.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ) {
            return StoreError::Busy;
        }
    }
    StoreError::Backend(err.to_string())
}

fn entity_table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Job => "jobs",
        EntityKind::Node => "nodes",
        EntityKind::Queue => "queues",
    }
}

fn history_table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Job => "job_history",
        EntityKind::Node => "node_history",
        EntityKind::Queue => "queue_history",
    }
}

fn row_to_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRecord> {
    let attrs_json: String = row.get(2)?;
    let raw_json: Option<String> = row.get(6)?;
    Ok(EntityRecord {
        id: row.get(0)?,
        state: EntityState::new(row.get::<_, String>(1)?),
        attrs: serde_json::from_str::<Map<String, Value>>(&attrs_json).unwrap_or_default(),
        first_seen: row.get(3)?,
        last_updated: row.get(4)?,
        is_final: row.get(5)?,
        raw: raw_json.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<CollectionEvent> {
    let kind_str: String = row.get(1)?;
    let outcome_str: String = row.get(4)?;
    let kind = PassKind::parse(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown pass kind: {kind_str}").into(),
        )
    })?;
    let outcome = PassOutcome::parse(&outcome_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown outcome: {outcome_str}").into(),
        )
    })?;
    Ok(CollectionEvent {
        id: row.get(0)?,
        kind,
        started_at: row.get(2)?,
        finished_at: row.get(3)?,
        outcome,
        counts: PassCounts {
            observed: row.get(5)?,
            new_entities: row.get(6)?,
            state_changes: row.get(7)?,
            finality_rejections: row.get(8)?,
            parse_errors: row.get(9)?,
        },
        error_message: row.get(10)?,
    })
}

const EVENT_COLUMNS: &str = "id, kind, started_at, finished_at, outcome, records_observed, \
     records_new, state_changes, finality_rejections, parse_errors, error_message";

impl Store for SqliteStore {
    fn schema_version(&self) -> Result<i32> {
        let conn = self.conn.lock().unwrap();
        read_schema_version(&conn)
    }

    fn load_current(&self, kind: EntityKind) -> Result<Vec<EntityRecord>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT id, state, attrs_json, first_seen, last_updated, is_final, raw_json FROM {}",
            entity_table(kind)
        );
        let mut stmt = conn.prepare(&sql).map_err(map_sqlite)?;
        let rows = stmt
            .query_map([], row_to_entity)
            .map_err(map_sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite)?;
        Ok(rows)
    }

    fn begin_event(&self, kind: PassKind, started_at: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO collection_events (kind, started_at, outcome) VALUES (?1, ?2, 'failed')",
            params![kind.as_str(), started_at],
        )
        .map_err(map_sqlite)?;
        Ok(conn.last_insert_rowid())
    }

    fn apply_pass(&self, kind: EntityKind, event_id: i64, plan: &PassPlan) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)
            .map_err(map_sqlite)?;

        let history_sql = format!(
            "INSERT INTO {} (entity_id, timestamp, state, collection_event_id) \
             VALUES (?1, ?2, ?3, ?4)",
            history_table(kind)
        );
        for h in &plan.history {
            tx.execute(&history_sql, params![h.entity_id, h.timestamp, h.state.as_str(), event_id])
                .map_err(map_sqlite)?;
        }

        let upsert_sql = format!(
            "INSERT OR REPLACE INTO {} \
             (id, state, attrs_json, first_seen, last_updated, is_final, raw_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            entity_table(kind)
        );
        for rec in &plan.upserts {
            let attrs_json = serde_json::to_string(&rec.attrs)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            let raw_json = match &rec.raw {
                Some(v) => {
                    Some(serde_json::to_string(v).map_err(|e| StoreError::Backend(e.to_string()))?)
                }
                None => None,
            };
            tx.execute(
                &upsert_sql,
                params![
                    rec.id,
                    rec.state.as_str(),
                    attrs_json,
                    rec.first_seen,
                    rec.last_updated,
                    rec.is_final,
                    raw_json
                ],
            )
            .map_err(map_sqlite)?;
        }

        tx.commit().map_err(map_sqlite)
    }

    fn insert_utilization(&self, event_id: i64, batch: &UtilizationBatch) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)
            .map_err(map_sqlite)?;

        for q in &batch.queues {
            tx.execute(
                "INSERT INTO queue_snapshots \
                 (queue_name, timestamp, state, total_jobs, running_jobs, queued_jobs, \
                  held_jobs, utilization_percent, collection_event_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    q.queue,
                    batch.timestamp,
                    q.state.as_str(),
                    q.total_jobs,
                    q.running_jobs,
                    q.queued_jobs,
                    q.held_jobs,
                    q.utilization_percent,
                    event_id
                ],
            )
            .map_err(map_sqlite)?;
        }

        for n in &batch.nodes {
            tx.execute(
                "INSERT INTO node_snapshots \
                 (node_name, timestamp, state, jobs_running, load_average, collection_event_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    n.node,
                    batch.timestamp,
                    n.state.as_str(),
                    n.jobs_running,
                    n.load_average,
                    event_id
                ],
            )
            .map_err(map_sqlite)?;
        }

        let s = &batch.system;
        tx.execute(
            "INSERT INTO system_snapshots \
             (timestamp, total_jobs, running_jobs, queued_jobs, held_jobs, total_nodes, \
              available_nodes, total_cores, used_cores, utilization_percent, collection_event_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                batch.timestamp,
                s.total_jobs,
                s.running_jobs,
                s.queued_jobs,
                s.held_jobs,
                s.total_nodes,
                s.available_nodes,
                s.total_cores,
                s.used_cores,
                s.utilization_percent,
                event_id
            ],
        )
        .map_err(map_sqlite)?;

        tx.commit().map_err(map_sqlite)
    }

    fn finish_event(
        &self,
        event_id: i64,
        finished_at: i64,
        outcome: PassOutcome,
        counts: &PassCounts,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE collection_events SET finished_at = ?1, outcome = ?2, \
             records_observed = ?3, records_new = ?4, state_changes = ?5, \
             finality_rejections = ?6, parse_errors = ?7, error_message = ?8 \
             WHERE id = ?9",
            params![
                finished_at,
                outcome.as_str(),
                counts.observed,
                counts.new_entities,
                counts.state_changes,
                counts.finality_rejections,
                counts.parse_errors,
                error_message,
                event_id
            ],
        )
        .map_err(map_sqlite)?;
        Ok(())
    }

    fn get_current(&self, kind: EntityKind, filter: &EntityFilter) -> Result<Vec<EntityRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = format!(
            "SELECT id, state, attrs_json, first_seen, last_updated, is_final, raw_json \
             FROM {} WHERE 1 = 1",
            entity_table(kind)
        );
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(state) = &filter.state {
            sql.push_str(" AND state = ?");
            binds.push(Box::new(state.clone()));
        }
        if !filter.include_final {
            sql.push_str(" AND is_final = 0");
        }
        sql.push_str(" ORDER BY id");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            binds.push(Box::new(limit));
        }
        let mut stmt = conn.prepare(&sql).map_err(map_sqlite)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(binds.iter().map(|b| b.as_ref())),
                row_to_entity,
            )
            .map_err(map_sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite)?;
        Ok(rows)
    }

    fn get_history(&self, kind: EntityKind, query: &HistoryQuery) -> Result<Vec<HistoryRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = format!(
            "SELECT id, entity_id, timestamp, state, collection_event_id \
             FROM {} WHERE 1 = 1",
            history_table(kind)
        );
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(id) = &query.entity_id {
            sql.push_str(" AND entity_id = ?");
            binds.push(Box::new(id.clone()));
        }
        if let Some(since) = query.since {
            sql.push_str(" AND timestamp >= ?");
            binds.push(Box::new(since));
        }
        if let Some(until) = query.until {
            sql.push_str(" AND timestamp <= ?");
            binds.push(Box::new(until));
        }
        match query.order {
            SortOrder::Ascending => sql.push_str(" ORDER BY timestamp ASC, id ASC"),
            SortOrder::Descending => sql.push_str(" ORDER BY timestamp DESC, id DESC"),
        }
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            binds.push(Box::new(limit));
        }
        let mut stmt = conn.prepare(&sql).map_err(map_sqlite)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(binds.iter().map(|b| b.as_ref())), |row| {
                Ok(HistoryRecord {
                    id: row.get(0)?,
                    entity_id: row.get(1)?,
                    timestamp: row.get(2)?,
                    state: EntityState::new(row.get::<_, String>(3)?),
                    collection_event_id: row.get(4)?,
                })
            })
            .map_err(map_sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite)?;
        Ok(rows)
    }

    fn recent_events(
        &self,
        kind: Option<PassKind>,
        now: i64,
        window_secs: i64,
    ) -> Result<Vec<CollectionEvent>> {
        let conn = self.conn.lock().unwrap();
        let since = now - window_secs;
        let mut sql = format!(
            "SELECT {EVENT_COLUMNS} FROM collection_events WHERE started_at >= ?"
        );
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(since)];
        if let Some(kind) = kind {
            sql.push_str(" AND kind = ?");
            binds.push(Box::new(kind.as_str()));
        }
        sql.push_str(" ORDER BY started_at DESC, id DESC");
        let mut stmt = conn.prepare(&sql).map_err(map_sqlite)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(binds.iter().map(|b| b.as_ref())), row_to_event)
            .map_err(map_sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite)?;
        Ok(rows)
    }

    fn latest_system_snapshot(&self) -> Result<Option<(i64, SystemUtilization)>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT timestamp, total_jobs, running_jobs, queued_jobs, held_jobs, total_nodes, \
             available_nodes, total_cores, used_cores, utilization_percent \
             FROM system_snapshots ORDER BY id DESC LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    SystemUtilization {
                        total_jobs: row.get(1)?,
                        running_jobs: row.get(2)?,
                        queued_jobs: row.get(3)?,
                        held_jobs: row.get(4)?,
                        total_nodes: row.get(5)?,
                        available_nodes: row.get(6)?,
                        total_cores: row.get(7)?,
                        used_cores: row.get(8)?,
                        utilization_percent: row.get(9)?,
                    },
                ))
            },
        )
        .optional()
        .map_err(map_sqlite)
    }

    fn cleanup(&self, now: i64, horizons: &RetentionHorizons) -> Result<CleanupCounts> {
        let conn = self.conn.lock().unwrap();
        let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)
            .map_err(map_sqlite)?;
        let history_cutoff = horizons.history_cutoff(now);
        let snapshot_cutoff = horizons.snapshot_cutoff(now);
        let mut counts = CleanupCounts::default();

        // Expired history rows go, except each identifier's most recent row.
        for kind in EntityKind::ALL {
            let table = history_table(kind);
            let protected: u64 = tx
                .query_row(
                    &format!(
                        "SELECT COUNT(*) FROM {table} WHERE timestamp < ?1 \
                         AND id IN (SELECT MAX(id) FROM {table} GROUP BY entity_id)"
                    ),
                    params![history_cutoff],
                    |row| row.get(0),
                )
                .map_err(map_sqlite)?;
            let removed = tx
                .execute(
                    &format!(
                        "DELETE FROM {table} WHERE timestamp < ?1 \
                         AND id NOT IN (SELECT MAX(id) FROM {table} GROUP BY entity_id)"
                    ),
                    params![history_cutoff],
                )
                .map_err(map_sqlite)?;
            counts.history_removed += removed as u64;
            counts.protected_kept += protected;
        }

        // Snapshot tables keep their single most recent row so a status
        // read never comes up empty after cleanup.
        for table in ["queue_snapshots", "node_snapshots", "system_snapshots"] {
            let protected: u64 = tx
                .query_row(
                    &format!(
                        "SELECT COUNT(*) FROM {table} WHERE timestamp < ?1 \
                         AND id = (SELECT MAX(id) FROM {table})"
                    ),
                    params![snapshot_cutoff],
                    |row| row.get(0),
                )
                .map_err(map_sqlite)?;
            let removed = tx
                .execute(
                    &format!(
                        "DELETE FROM {table} WHERE timestamp < ?1 \
                         AND id != (SELECT MAX(id) FROM {table})"
                    ),
                    params![snapshot_cutoff],
                )
                .map_err(map_sqlite)?;
            counts.snapshots_removed += removed as u64;
            counts.protected_kept += protected;
        }

        // Events annotate history and snapshot rows, so an event stays
        // for as long as any surviving row still points at it. Without
        // this the delete trips the foreign keys.
        let referenced = "SELECT collection_event_id FROM job_history WHERE collection_event_id IS NOT NULL \
             UNION SELECT collection_event_id FROM node_history WHERE collection_event_id IS NOT NULL \
             UNION SELECT collection_event_id FROM queue_history WHERE collection_event_id IS NOT NULL \
             UNION SELECT collection_event_id FROM queue_snapshots WHERE collection_event_id IS NOT NULL \
             UNION SELECT collection_event_id FROM node_snapshots WHERE collection_event_id IS NOT NULL \
             UNION SELECT collection_event_id FROM system_snapshots WHERE collection_event_id IS NOT NULL";
        let protected: u64 = tx
            .query_row(
                &format!(
                    "SELECT COUNT(*) FROM collection_events \
                     WHERE started_at < ?1 AND id IN ({referenced})"
                ),
                params![history_cutoff],
                |row| row.get(0),
            )
            .map_err(map_sqlite)?;
        let events_removed = tx
            .execute(
                &format!(
                    "DELETE FROM collection_events \
                     WHERE started_at < ?1 AND id NOT IN ({referenced})"
                ),
                params![history_cutoff],
            )
            .map_err(map_sqlite)?;
        counts.events_removed = events_removed as u64;
        counts.protected_kept += protected;

        tx.commit().map_err(map_sqlite)?;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbsmon_core::{reconcile, ObservedRecord, TerminalStates};
    use std::collections::HashMap;

    fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::migrate(dir.path().join("monitor.db")).unwrap();
        (dir, store)
    }

    fn run_pass(store: &SqliteStore, now: i64, observed: &[ObservedRecord]) -> CollectionEvent {
        let terminal = TerminalStates::default_for(EntityKind::Job);
        let current: HashMap<String, EntityRecord> = store
            .load_current(EntityKind::Job)
            .unwrap()
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        let event_id = store.begin_event(PassKind::Entities(EntityKind::Job), now).unwrap();
        let plan = reconcile(now, observed, &current, &terminal);
        store.apply_pass(EntityKind::Job, event_id, &plan).unwrap();
        store
            .finish_event(event_id, now + 1, plan.counts.outcome_on_commit(), &plan.counts, None)
            .unwrap();
        store
            .recent_events(None, now, 3600)
            .unwrap()
            .into_iter()
            .find(|e| e.id == event_id)
            .unwrap()
    }

    #[test]
    fn open_refuses_unmigrated_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.db");
        match SqliteStore::open(&path) {
            Err(StoreError::SchemaVersion { found: 0, expected }) => {
                assert_eq!(expected, SCHEMA_VERSION)
            }
            Err(other) => panic!("expected schema version error, got {other:?}"),
            Ok(_) => panic!("open succeeded on an unmigrated database"),
        }
        SqliteStore::migrate(&path).unwrap();
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn migrate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.db");
        SqliteStore::migrate(&path).unwrap();
        let store = SqliteStore::migrate(&path).unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn lifecycle_persists_history_and_finality() {
        let (_dir, store) = temp_store();

        run_pass(&store, 100, &[ObservedRecord::new("1.pbs01", "Q")]);
        run_pass(&store, 200, &[ObservedRecord::new("1.pbs01", "R")]);
        let done = run_pass(&store, 300, &[ObservedRecord::new("1.pbs01", "F")]);
        assert_eq!(done.outcome, PassOutcome::Success);

        // A late contradictory report is rejected, not applied.
        let late = run_pass(&store, 400, &[ObservedRecord::new("1.pbs01", "R")]);
        assert_eq!(late.outcome, PassOutcome::PartialSuccess);
        assert_eq!(late.counts.finality_rejections, 1);

        let current = store.get_current(EntityKind::Job, &EntityFilter::all()).unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].state.as_str(), "F");
        assert!(current[0].is_final);
        assert_eq!(current[0].first_seen, 100);
        assert_eq!(current[0].last_updated, 400);

        let history = store
            .get_history(EntityKind::Job, &HistoryQuery::for_entity("1.pbs01"))
            .unwrap();
        let states: Vec<&str> = history.iter().map(|h| h.state.as_str()).collect();
        assert_eq!(states, ["Q", "R", "F"]);
        assert!(history.iter().all(|h| h.collection_event_id.is_some()));
    }

    #[test]
    fn current_filter_excludes_finalized() {
        let (_dir, store) = temp_store();
        run_pass(
            &store,
            100,
            &[ObservedRecord::new("1.pbs01", "R"), ObservedRecord::new("2.pbs01", "F")],
        );
        let live = store
            .get_current(EntityKind::Job, &EntityFilter::default())
            .unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, "1.pbs01");

        let running = store
            .get_current(
                EntityKind::Job,
                &EntityFilter { state: Some("R".into()), include_final: true, limit: None },
            )
            .unwrap();
        assert_eq!(running.len(), 1);
    }

    #[test]
    fn failed_pass_still_leaves_audit_row() {
        let (_dir, store) = temp_store();
        let event_id = store.begin_event(PassKind::Entities(EntityKind::Job), 100).unwrap();
        store
            .finish_event(
                event_id,
                101,
                PassOutcome::Failed,
                &PassCounts::default(),
                Some("qstat timed out after 30s"),
            )
            .unwrap();
        let events = store.recent_events(Some(PassKind::Entities(EntityKind::Job)), 120, 60).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, PassOutcome::Failed);
        assert_eq!(events[0].error_message.as_deref(), Some("qstat timed out after 30s"));
        assert!(store.load_current(EntityKind::Job).unwrap().is_empty());
    }

    #[test]
    fn utilization_batch_round_trips_latest() {
        let (_dir, store) = temp_store();
        let event_id = store.begin_event(PassKind::Utilization, 100).unwrap();
        let jobs = vec![ObservedRecord::new("1", "R"), ObservedRecord::new("2", "Q")];
        let nodes = vec![ObservedRecord::new("n1", "free")
            .with_attr("ncpus", serde_json::json!(16))
            .with_attr("jobs", serde_json::json!(["1"]))];
        let batch = pbsmon_core::build_utilization(100, &jobs, &[], &nodes);
        store.insert_utilization(event_id, &batch).unwrap();

        let (ts, system) = store.latest_system_snapshot().unwrap().unwrap();
        assert_eq!(ts, 100);
        assert_eq!(system.total_jobs, 2);
        assert_eq!(system.running_jobs, 1);
        assert_eq!(system.total_cores, 16);
        assert_eq!(system.used_cores, 1);
    }

    #[test]
    fn cleanup_keeps_latest_history_per_entity() {
        let (_dir, store) = temp_store();
        run_pass(&store, 100, &[ObservedRecord::new("1.pbs01", "Q")]);
        run_pass(&store, 200, &[ObservedRecord::new("1.pbs01", "R")]);
        run_pass(&store, 300, &[ObservedRecord::new("1.pbs01", "F")]);

        // Zero-day horizon expires everything; the latest row must survive.
        let horizons = RetentionHorizons { history_days: 0, snapshot_days: 0 };
        let counts = store.cleanup(1_000, &horizons).unwrap();
        assert_eq!(counts.history_removed, 2);
        assert!(counts.protected_kept >= 1);

        let history = store
            .get_history(EntityKind::Job, &HistoryQuery::for_entity("1.pbs01"))
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state.as_str(), "F");
        // Current-state rows are never touched by cleanup.
        assert_eq!(store.load_current(EntityKind::Job).unwrap().len(), 1);
    }

    #[test]
    fn cleanup_commits_when_kept_rows_still_reference_events() {
        let (_dir, store) = temp_store();
        run_pass(&store, 100, &[ObservedRecord::new("1.pbs01", "Q")]);
        run_pass(&store, 200, &[ObservedRecord::new("1.pbs01", "R")]);
        run_pass(&store, 300, &[ObservedRecord::new("1.pbs01", "F")]);

        // Every row is expired, but the latest history row survives and
        // its event must survive with it or the foreign keys abort the
        // whole transaction.
        let horizons = RetentionHorizons { history_days: 0, snapshot_days: 0 };
        let counts = store.cleanup(1_000, &horizons).unwrap();
        assert_eq!(counts.history_removed, 2);
        assert_eq!(counts.events_removed, 2);

        let history = store
            .get_history(EntityKind::Job, &HistoryQuery::for_entity("1.pbs01"))
            .unwrap();
        let kept_event = history[0].collection_event_id.unwrap();
        let events = store.recent_events(None, 1_000, 1_000).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, kept_event);
    }

    #[test]
    fn cleanup_keeps_most_recent_snapshot() {
        let (_dir, store) = temp_store();
        for now in [100, 200] {
            let event_id = store.begin_event(PassKind::Utilization, now).unwrap();
            let batch = pbsmon_core::build_utilization(now, &[], &[], &[]);
            store.insert_utilization(event_id, &batch).unwrap();
        }
        let horizons = RetentionHorizons { history_days: 0, snapshot_days: 0 };
        store.cleanup(1_000, &horizons).unwrap();
        let (ts, _) = store.latest_system_snapshot().unwrap().unwrap();
        assert_eq!(ts, 200);
    }

    #[test]
    fn busy_maps_to_its_own_error() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(map_sqlite(err), StoreError::Busy));
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
            None,
        );
        assert!(matches!(map_sqlite(err), StoreError::Busy));
    }

    #[test]
    fn concurrent_writers_lose_no_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.db");
        SqliteStore::migrate(&path).unwrap();

        // Two handles on one file, like the daemon plus an on-demand
        // invocation. Immediate transactions plus the busy timeout
        // serialize the writers; every pass must land.
        let mut workers = Vec::new();
        for w in 0..2 {
            let path = path.clone();
            workers.push(std::thread::spawn(move || {
                let store = SqliteStore::open(&path).unwrap();
                let terminal = TerminalStates::default_for(EntityKind::Job);
                for i in 0..20i64 {
                    let obs = [ObservedRecord::new(format!("{w}-{i}.pbs01"), "Q")];
                    let current: HashMap<String, EntityRecord> = store
                        .load_current(EntityKind::Job)
                        .unwrap()
                        .into_iter()
                        .map(|r| (r.id.clone(), r))
                        .collect();
                    let event_id =
                        store.begin_event(PassKind::Entities(EntityKind::Job), i).unwrap();
                    let plan = reconcile(i, &obs, &current, &terminal);
                    store.apply_pass(EntityKind::Job, event_id, &plan).unwrap();
                    store
                        .finish_event(event_id, i + 1, plan.counts.outcome_on_commit(), &plan.counts, None)
                        .unwrap();
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.load_current(EntityKind::Job).unwrap().len(), 40);
        let history = store.get_history(EntityKind::Job, &HistoryQuery::default()).unwrap();
        assert_eq!(history.len(), 40);
    }
}
