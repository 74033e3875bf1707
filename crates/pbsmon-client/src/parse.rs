//! Pure parsers for the JSON emitted by `qstat -F json` and
//! `pbsnodes -F json`. Payload-level failures are errors; a malformed
//! entry becomes a record with an empty state so the reconciler can count
//! and skip it without losing the rest of the batch.

use serde_json::{Map, Value};

use pbsmon_core::{EntityState, ObservedRecord};

use crate::{ClientError, Result};

fn parse_root(text: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(|e| ClientError::Parse(e.to_string()))
}

fn object_entries<'a>(root: &'a Value, key: &str) -> Vec<(&'a String, &'a Value)> {
    // A scheduler with nothing to report omits the container key entirely.
    root.get(key)
        .and_then(Value::as_object)
        .map(|m| m.iter().collect())
        .unwrap_or_default()
}

fn attrs_of(entry: &Value) -> Map<String, Value> {
    entry.as_object().cloned().unwrap_or_default()
}

/// `qstat -f -F json` (and `-x` for finished jobs): a `Jobs` object keyed
/// by full job identifier, each entry carrying `job_state`.
pub fn parse_jobs(text: &str) -> Result<Vec<ObservedRecord>> {
    let root = parse_root(text)?;
    Ok(object_entries(&root, "Jobs")
        .into_iter()
        .map(|(id, entry)| {
            let state = entry.get("job_state").and_then(Value::as_str).unwrap_or("");
            ObservedRecord {
                id: id.clone(),
                state: EntityState::new(state),
                attrs: attrs_of(entry),
                raw: Some(entry.clone()),
            }
        })
        .collect())
}

/// `qstat -Q -f -F json`: a `Queue` object keyed by queue name. PBS
/// reports enablement as two booleans; they collapse into one state
/// string, and `state_count` is unpacked into per-state job tallies.
pub fn parse_queues(text: &str) -> Result<Vec<ObservedRecord>> {
    let root = parse_root(text)?;
    Ok(object_entries(&root, "Queue")
        .into_iter()
        .map(|(id, entry)| {
            let enabled = bool_attr(entry, "enabled");
            let started = bool_attr(entry, "started");
            let state = match (enabled, started) {
                (true, true) => "enabled_started",
                (true, false) => "enabled_stopped",
                (false, _) => "disabled",
            };
            let mut attrs = attrs_of(entry);
            if let Some(counts) = entry.get("state_count").and_then(Value::as_str) {
                for (key, value) in parse_state_count(counts) {
                    attrs.insert(key.to_string(), Value::from(value));
                }
            }
            ObservedRecord {
                id: id.clone(),
                state: EntityState::new(state),
                attrs,
                raw: Some(entry.clone()),
            }
        })
        .collect())
}

/// `pbsnodes -a -F json`: a `nodes` object keyed by hostname. Core counts
/// and load live under `resources_available`; the running-job list is
/// lifted to a `jobs` array attribute.
pub fn parse_nodes(text: &str) -> Result<Vec<ObservedRecord>> {
    let root = parse_root(text)?;
    Ok(object_entries(&root, "nodes")
        .into_iter()
        .map(|(id, entry)| {
            let state = entry.get("state").and_then(Value::as_str).unwrap_or("");
            let mut attrs = attrs_of(entry);
            let resources = entry.get("resources_available");
            if let Some(ncpus) = resources.and_then(|r| r.get("ncpus")).cloned() {
                attrs.insert("ncpus".to_string(), ncpus);
            } else if let Some(pcpus) = entry.get("pcpus").cloned() {
                attrs.insert("ncpus".to_string(), pcpus);
            }
            if let Some(load) = resources.and_then(|r| r.get("load")).cloned() {
                attrs.insert("load_average".to_string(), load);
            }
            attrs.insert("jobs".to_string(), Value::Array(node_jobs(entry)));
            ObservedRecord {
                id: id.clone(),
                state: EntityState::new(state),
                attrs,
                raw: Some(entry.clone()),
            }
        })
        .collect())
}

fn bool_attr(entry: &Value, key: &str) -> bool {
    match entry.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// `state_count` is a space-separated `Name:count` list, e.g.
/// `Transit:0 Queued:5 Held:1 Waiting:0 Running:3 Exiting:0 Begun:0`.
fn parse_state_count(s: &str) -> Vec<(&'static str, i64)> {
    let mut out = Vec::new();
    for part in s.split_whitespace() {
        let Some((name, count)) = part.split_once(':') else { continue };
        let Ok(count) = count.parse::<i64>() else { continue };
        let key = match name {
            "Queued" => "queued_jobs",
            "Running" => "running_jobs",
            "Held" => "held_jobs",
            _ => continue,
        };
        out.push((key, count));
    }
    out
}

/// Older PBS versions report `jobs` as one comma-separated string.
fn node_jobs(entry: &Value) -> Vec<Value> {
    match entry.get("jobs") {
        Some(Value::Array(a)) => a.clone(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| Value::from(p.to_string()))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_parse_with_state_and_attrs() {
        let text = r#"{
            "timestamp": 1700000000,
            "Jobs": {
                "1234.pbs01": {
                    "Job_Name": "sim", "job_state": "R", "queue": "prod",
                    "Resource_List": {"ncpus": 64}
                },
                "1235.pbs01": {"Job_Name": "broken"}
            }
        }"#;
        let mut jobs = parse_jobs(text).unwrap();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, "1234.pbs01");
        assert_eq!(jobs[0].state.as_str(), "R");
        assert_eq!(jobs[0].attr_str("queue"), Some("prod"));
        // Missing job_state flows through as empty so the pass counts it.
        assert!(jobs[1].state.is_empty());
    }

    #[test]
    fn empty_scheduler_omits_container_key() {
        let jobs = parse_jobs(r#"{"timestamp": 1700000000}"#).unwrap();
        assert!(jobs.is_empty());
    }

    #[test]
    fn garbage_payload_is_a_parse_error() {
        assert!(matches!(parse_jobs("qstat: cannot connect"), Err(ClientError::Parse(_))));
    }

    #[test]
    fn queue_state_collapses_enablement_flags() {
        let text = r#"{
            "Queue": {
                "prod": {
                    "enabled": "True", "started": "True", "total_jobs": 9,
                    "state_count": "Transit:0 Queued:5 Held:1 Waiting:0 Running:3 Exiting:0 Begun:0"
                },
                "drain": {"enabled": "True", "started": "False"},
                "off": {"enabled": "False", "started": "True"}
            }
        }"#;
        let mut queues = parse_queues(text).unwrap();
        queues.sort_by(|a, b| a.id.cmp(&b.id));
        let by_id = |id: &str| queues.iter().find(|q| q.id == id).unwrap();
        assert_eq!(by_id("prod").state.as_str(), "enabled_started");
        assert_eq!(by_id("drain").state.as_str(), "enabled_stopped");
        assert_eq!(by_id("off").state.as_str(), "disabled");
        assert_eq!(by_id("prod").attr_i64("queued_jobs"), Some(5));
        assert_eq!(by_id("prod").attr_i64("running_jobs"), Some(3));
        assert_eq!(by_id("prod").attr_i64("held_jobs"), Some(1));
        assert_eq!(by_id("prod").attr_i64("total_jobs"), Some(9));
    }

    #[test]
    fn nodes_parse_cores_and_job_list() {
        let text = r#"{
            "nodes": {
                "n001": {
                    "state": "free",
                    "pcpus": 64,
                    "resources_available": {"ncpus": 32, "load": 1.25},
                    "jobs": ["1234.pbs01/0", "1235.pbs01/1"]
                },
                "n002": {"state": "down,offline", "jobs": "9.pbs01/0, 10.pbs01/0"}
            }
        }"#;
        let nodes = parse_nodes(text).unwrap();
        let by_id = |id: &str| nodes.iter().find(|n| n.id == id).unwrap();
        assert_eq!(by_id("n001").attr_i64("ncpus"), Some(32));
        assert_eq!(by_id("n001").attr_f64("load_average"), Some(1.25));
        assert_eq!(by_id("n001").attr_array_len("jobs"), 2);
        assert_eq!(by_id("n002").state.as_str(), "down,offline");
        assert_eq!(by_id("n002").attr_array_len("jobs"), 2);
    }
}
