use serde::{Deserialize, Serialize};

use crate::{EntityState, ObservedRecord};

// Live PBS job states the aggregates bucket on. The state enumeration
// stays open; these are just the well-known values the counters use.
const JOB_RUNNING: &str = "R";
const JOB_QUEUED: &str = "Q";
const JOB_HELD: &str = "H";

const NODE_AVAILABLE: [&str; 2] = ["free", "job-sharing"];

/// Point-in-time utilization of one queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueUtilization {
    pub queue: String,
    pub state: EntityState,
    pub total_jobs: i64,
    pub running_jobs: i64,
    pub queued_jobs: i64,
    pub held_jobs: i64,
    pub utilization_percent: Option<f64>,
}

/// Point-in-time utilization of one node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeUtilization {
    pub node: String,
    pub state: EntityState,
    pub jobs_running: i64,
    pub load_average: Option<f64>,
}

/// Whole-system aggregate for one collection instant.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemUtilization {
    pub total_jobs: i64,
    pub running_jobs: i64,
    pub queued_jobs: i64,
    pub held_jobs: i64,
    pub total_nodes: i64,
    pub available_nodes: i64,
    pub total_cores: i64,
    pub used_cores: i64,
    pub utilization_percent: Option<f64>,
}

/// Everything one utilization pass writes, immutable once committed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UtilizationBatch {
    pub timestamp: i64,
    pub queues: Vec<QueueUtilization>,
    pub nodes: Vec<NodeUtilization>,
    pub system: SystemUtilization,
}

/// Fold one cycle's raw observations into the per-queue, per-node and
/// system-wide snapshot rows. Pure; the shell persists the batch in a
/// single transaction.
pub fn build_utilization(
    now: i64,
    jobs: &[ObservedRecord],
    queues: &[ObservedRecord],
    nodes: &[ObservedRecord],
) -> UtilizationBatch {
    let queues: Vec<QueueUtilization> = queues
        .iter()
        .filter(|q| !q.id.is_empty())
        .map(|q| {
            let running = q.attr_i64("running_jobs").unwrap_or(0);
            let utilization = q
                .attr_i64("max_running")
                .filter(|max| *max > 0)
                .map(|max| running as f64 / max as f64 * 100.0);
            QueueUtilization {
                queue: q.id.clone(),
                state: q.state.clone(),
                total_jobs: q.attr_i64("total_jobs").unwrap_or(0),
                running_jobs: running,
                queued_jobs: q.attr_i64("queued_jobs").unwrap_or(0),
                held_jobs: q.attr_i64("held_jobs").unwrap_or(0),
                utilization_percent: utilization,
            }
        })
        .collect();

    let node_rows: Vec<NodeUtilization> = nodes
        .iter()
        .filter(|n| !n.id.is_empty())
        .map(|n| NodeUtilization {
            node: n.id.clone(),
            state: n.state.clone(),
            jobs_running: n.attr_array_len("jobs") as i64,
            load_average: n.attr_f64("load_average"),
        })
        .collect();

    let count_jobs = |state: &str| jobs.iter().filter(|j| j.state.as_str() == state).count() as i64;
    let total_cores: i64 = nodes.iter().filter_map(|n| n.attr_i64("ncpus")).sum();
    let used_cores: i64 = nodes.iter().map(|n| n.attr_array_len("jobs") as i64).sum();
    let available_nodes = nodes
        .iter()
        .filter(|n| NODE_AVAILABLE.contains(&n.state.as_str()))
        .count() as i64;

    let system = SystemUtilization {
        total_jobs: jobs.len() as i64,
        running_jobs: count_jobs(JOB_RUNNING),
        queued_jobs: count_jobs(JOB_QUEUED),
        held_jobs: count_jobs(JOB_HELD),
        total_nodes: nodes.len() as i64,
        available_nodes,
        total_cores,
        used_cores,
        utilization_percent: (total_cores > 0).then(|| used_cores as f64 / total_cores as f64 * 100.0),
    };

    UtilizationBatch { timestamp: now, queues, nodes: node_rows, system }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn system_aggregates_from_observations() {
        let jobs = vec![
            ObservedRecord::new("1", "R"),
            ObservedRecord::new("2", "R"),
            ObservedRecord::new("3", "Q"),
            ObservedRecord::new("4", "H"),
        ];
        let nodes = vec![
            ObservedRecord::new("n1", "free")
                .with_attr("ncpus", json!(32))
                .with_attr("jobs", json!([])),
            ObservedRecord::new("n2", "job-exclusive")
                .with_attr("ncpus", json!(32))
                .with_attr("jobs", json!(["1", "2"])),
        ];
        let batch = build_utilization(500, &jobs, &[], &nodes);
        assert_eq!(batch.system.total_jobs, 4);
        assert_eq!(batch.system.running_jobs, 2);
        assert_eq!(batch.system.queued_jobs, 1);
        assert_eq!(batch.system.held_jobs, 1);
        assert_eq!(batch.system.total_cores, 64);
        assert_eq!(batch.system.used_cores, 2);
        assert_eq!(batch.system.available_nodes, 1);
        assert_eq!(batch.nodes[1].jobs_running, 2);
    }

    #[test]
    fn queue_utilization_needs_positive_max() {
        let queues = vec![
            ObservedRecord::new("prod", "enabled_started")
                .with_attr("running_jobs", json!(5))
                .with_attr("max_running", json!(10)),
            ObservedRecord::new("debug", "enabled_started").with_attr("running_jobs", json!(2)),
        ];
        let batch = build_utilization(500, &[], &queues, &[]);
        assert_eq!(batch.queues[0].utilization_percent, Some(50.0));
        assert_eq!(batch.queues[1].utilization_percent, None);
    }

    #[test]
    fn zero_cores_yields_no_percentage() {
        let batch = build_utilization(500, &[], &[], &[]);
        assert_eq!(batch.system.utilization_percent, None);
    }
}
