use std::collections::{HashMap, HashSet};

use anyhow::Result;
use tracing::{debug, info, warn};

use pbsmon_client::SchedulerClient;
use pbsmon_core::{
    build_utilization, merge_observations, persist_backoff_ms, reconcile, sweep_stale,
    CollectionEvent, EntityKind, EntityRecord, ObservedRecord, PassCounts, PassKind, PassOutcome,
    PassPlan, MAX_PERSIST_ATTEMPTS,
};
use pbsmon_store::{Store, StoreError};

use crate::PolicyConfig;

/// Runs one collection pass end to end: open the audit row, fetch,
/// reconcile, persist atomically, close the audit row. The audit row is
/// opened before the fetch so a pass that dies mid-flight still leaves a
/// record behind.
pub struct Collector<C, S> {
    client: C,
    store: S,
    policy: PolicyConfig,
}

impl<C: SchedulerClient, S: Store> Collector<C, S> {
    pub fn new(client: C, store: S, policy: PolicyConfig) -> Self {
        Self { client, store, policy }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// One reconciliation pass for a kind. A fetch failure closes the
    /// event as failed and writes nothing else; store errors propagate.
    pub async fn collect(&self, kind: EntityKind, now: i64) -> Result<CollectionEvent> {
        let pass = PassKind::Entities(kind);
        let event_id = self.store.begin_event(pass, now)?;

        let observed = match self.fetch(kind).await {
            Ok(observed) => observed,
            Err(e) => {
                warn!(kind = kind.as_str(), error = %e, "collection fetch failed");
                return self.fail_event(event_id, pass, now, &e.to_string());
            }
        };

        let current = self.load_current_map(kind)?;
        let terminal = self.policy.terminal_for(kind);
        let mut plan = reconcile(now, &observed, &current, &terminal);

        if kind == EntityKind::Job {
            if let Some(stale_after) = self.policy.stale_after_secs() {
                let confirmed: HashSet<String> = observed
                    .iter()
                    .filter(|o| !o.id.is_empty())
                    .map(|o| o.id.clone())
                    .collect();
                plan.merge(sweep_stale(now, &confirmed, &current, stale_after));
            }
        }

        if let Err(e) = self.apply_with_retry(kind, event_id, &plan).await {
            warn!(kind = kind.as_str(), error = %e, "pass commit failed");
            return self.fail_event(event_id, pass, now, &e.to_string());
        }

        let counts = plan.counts;
        let outcome = counts.outcome_on_commit();
        let finished_at = crate::now_unix().max(now);
        self.store.finish_event(event_id, finished_at, outcome, &counts, None)?;
        info!(
            kind = kind.as_str(),
            observed = counts.observed,
            new = counts.new_entities,
            changes = counts.state_changes,
            outcome = outcome.as_str(),
            "collection pass finished"
        );
        Ok(CollectionEvent {
            id: event_id,
            kind: pass,
            started_at: now,
            finished_at: Some(finished_at),
            outcome,
            counts,
            error_message: None,
        })
    }

    /// One utilization snapshot pass: raw fetches of all three kinds,
    /// folded into per-queue, per-node and system rows.
    pub async fn collect_utilization(&self, now: i64) -> Result<CollectionEvent> {
        let event_id = self.store.begin_event(PassKind::Utilization, now)?;

        let fetched = async {
            let jobs = self.client.fetch_current(EntityKind::Job).await?;
            let queues = self.client.fetch_current(EntityKind::Queue).await?;
            let nodes = self.client.fetch_current(EntityKind::Node).await?;
            Ok::<_, pbsmon_client::ClientError>((jobs, queues, nodes))
        }
        .await;
        let (jobs, queues, nodes) = match fetched {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "utilization fetch failed");
                return self.fail_event(event_id, PassKind::Utilization, now, &e.to_string());
            }
        };

        let batch = build_utilization(now, &jobs, &queues, &nodes);
        if let Err(e) = self.store.insert_utilization(event_id, &batch) {
            warn!(error = %e, "utilization commit failed");
            return self.fail_event(event_id, PassKind::Utilization, now, &e.to_string());
        }

        let counts =
            PassCounts { observed: (jobs.len() + queues.len() + nodes.len()) as u32, ..Default::default() };
        let finished_at = crate::now_unix().max(now);
        self.store.finish_event(event_id, finished_at, PassOutcome::Success, &counts, None)?;
        debug!(
            queues = batch.queues.len(),
            nodes = batch.nodes.len(),
            "utilization snapshot recorded"
        );
        Ok(CollectionEvent {
            id: event_id,
            kind: PassKind::Utilization,
            started_at: now,
            finished_at: Some(finished_at),
            outcome: PassOutcome::Success,
            counts,
            error_message: None,
        })
    }

    /// Live view for the kind; for jobs the finished-job history is
    /// merged in so terminal states are not lost between polls. A history
    /// fetch failure degrades to the live view alone.
    async fn fetch(&self, kind: EntityKind) -> pbsmon_client::Result<Vec<ObservedRecord>> {
        let live = self.client.fetch_current(kind).await?;
        if kind != EntityKind::Job {
            return Ok(live);
        }
        match self.client.fetch_recently_terminal().await {
            Ok(recent) => {
                let terminal = self.policy.terminal_for(EntityKind::Job);
                Ok(merge_observations(live, recent, &terminal))
            }
            Err(e) => {
                warn!(error = %e, "finished-job fetch failed, using live view only");
                Ok(live)
            }
        }
    }

    fn load_current_map(&self, kind: EntityKind) -> Result<HashMap<String, EntityRecord>> {
        Ok(self
            .store
            .load_current(kind)?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect())
    }

    /// Bounded retry on write contention; anything else fails the pass
    /// immediately.
    async fn apply_with_retry(
        &self,
        kind: EntityKind,
        event_id: i64,
        plan: &PassPlan,
    ) -> Result<(), StoreError> {
        let mut attempt = 0u32;
        loop {
            match self.store.apply_pass(kind, event_id, plan) {
                Ok(()) => return Ok(()),
                Err(StoreError::Busy) if attempt + 1 < MAX_PERSIST_ATTEMPTS => {
                    let backoff = persist_backoff_ms(attempt);
                    debug!(kind = kind.as_str(), attempt, backoff_ms = backoff, "store busy, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn fail_event(
        &self,
        event_id: i64,
        pass: PassKind,
        started_at: i64,
        message: &str,
    ) -> Result<CollectionEvent> {
        let counts = PassCounts::default();
        let finished_at = crate::now_unix().max(started_at);
        self.store
            .finish_event(event_id, finished_at, PassOutcome::Failed, &counts, Some(message))?;
        Ok(CollectionEvent {
            id: event_id,
            kind: pass,
            started_at,
            finished_at: Some(finished_at),
            outcome: PassOutcome::Failed,
            counts,
            error_message: Some(message.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pbsmon_client::ClientError;
    use pbsmon_store::{EntityFilter, HistoryQuery, MemoryStore};
    use std::sync::Mutex;

    type Canned = Mutex<Result<Vec<ObservedRecord>, String>>;

    /// Canned scheduler: per-kind batches plus a finished-job batch, any
    /// of which can be swapped for an error.
    struct FakeClient {
        jobs: Canned,
        queues: Canned,
        nodes: Canned,
        finished: Canned,
    }

    impl Default for FakeClient {
        fn default() -> Self {
            Self {
                jobs: Mutex::new(Ok(Vec::new())),
                queues: Mutex::new(Ok(Vec::new())),
                nodes: Mutex::new(Ok(Vec::new())),
                finished: Mutex::new(Ok(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl SchedulerClient for FakeClient {
        async fn fetch_current(&self, kind: EntityKind) -> pbsmon_client::Result<Vec<ObservedRecord>> {
            let slot = match kind {
                EntityKind::Job => &self.jobs,
                EntityKind::Queue => &self.queues,
                EntityKind::Node => &self.nodes,
            };
            slot.lock().unwrap().clone().map_err(ClientError::Unavailable)
        }

        async fn fetch_recently_terminal(&self) -> pbsmon_client::Result<Vec<ObservedRecord>> {
            self.finished.lock().unwrap().clone().map_err(ClientError::Unavailable)
        }
    }

    fn collector(client: FakeClient) -> Collector<FakeClient, MemoryStore> {
        Collector::new(client, MemoryStore::new(), PolicyConfig::default())
    }

    #[tokio::test]
    async fn fetch_failure_writes_nothing_but_the_event() {
        let client = FakeClient::default();
        *client.jobs.lock().unwrap() = Err("connection refused".to_string());
        let c = collector(client);

        let event = c.collect(EntityKind::Job, 100).await.unwrap();
        assert_eq!(event.outcome, PassOutcome::Failed);
        assert!(event.error_message.as_deref().unwrap().contains("connection refused"));

        assert!(c.store().load_current(EntityKind::Job).unwrap().is_empty());
        let events = c.store().recent_events(None, 100, 60).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, PassOutcome::Failed);
    }

    #[tokio::test]
    async fn finished_job_merge_captures_terminal_state() {
        let client = FakeClient::default();
        *client.jobs.lock().unwrap() = Ok(vec![ObservedRecord::new("1.pbs01", "R")]);
        let c = collector(client);
        c.collect(EntityKind::Job, 100).await.unwrap();

        // The job left the live view; only the history query still sees it.
        *c.client.jobs.lock().unwrap() = Ok(vec![]);
        *c.client.finished.lock().unwrap() = Ok(vec![ObservedRecord::new("1.pbs01", "F")]);
        let event = c.collect(EntityKind::Job, 200).await.unwrap();
        assert_eq!(event.outcome, PassOutcome::Success);

        let current = c.store().get_current(EntityKind::Job, &EntityFilter::all()).unwrap();
        assert_eq!(current[0].state.as_str(), "F");
        assert!(current[0].is_final);
        let history = c
            .store()
            .get_history(EntityKind::Job, &HistoryQuery::for_entity("1.pbs01"))
            .unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn history_fetch_failure_degrades_to_live_view() {
        let client = FakeClient::default();
        *client.jobs.lock().unwrap() = Ok(vec![ObservedRecord::new("1.pbs01", "R")]);
        *client.finished.lock().unwrap() = Err("qstat -x timed out".to_string());
        let c = collector(client);
        let event = c.collect(EntityKind::Job, 100).await.unwrap();
        assert_eq!(event.outcome, PassOutcome::Success);
        assert_eq!(c.store().load_current(EntityKind::Job).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_jobs_close_as_unknown_when_enabled() {
        let client = FakeClient::default();
        *client.jobs.lock().unwrap() = Ok(vec![ObservedRecord::new("1.pbs01", "R")]);
        let mut policy = PolicyConfig::default();
        policy.stale_job_horizon_hours = Some(1);
        let c = Collector::new(client, MemoryStore::new(), policy);

        c.collect(EntityKind::Job, 100).await.unwrap();
        *c.client.jobs.lock().unwrap() = Ok(vec![]);
        c.collect(EntityKind::Job, 100 + 2 * 3600).await.unwrap();

        let current = c.store().get_current(EntityKind::Job, &EntityFilter::all()).unwrap();
        assert_eq!(current[0].state.as_str(), "unknown");
        assert!(current[0].is_final);
    }

    #[tokio::test]
    async fn utilization_pass_records_snapshot() {
        let client = FakeClient::default();
        *client.jobs.lock().unwrap() =
            Ok(vec![ObservedRecord::new("1", "R"), ObservedRecord::new("2", "Q")]);
        *client.nodes.lock().unwrap() = Ok(vec![ObservedRecord::new("n1", "free")
            .with_attr("ncpus", serde_json::json!(8))
            .with_attr("jobs", serde_json::json!(["1"]))]);
        let c = collector(client);

        let event = c.collect_utilization(500).await.unwrap();
        assert_eq!(event.outcome, PassOutcome::Success);
        let (ts, system) = c.store().latest_system_snapshot().unwrap().unwrap();
        assert_eq!(ts, 500);
        assert_eq!(system.total_jobs, 2);
        assert_eq!(system.used_cores, 1);
    }
}
