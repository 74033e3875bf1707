use serde::{Deserialize, Serialize};

/// The entity families tracked by the monitor. Each kind has its own
/// current-state and history tables and its own polling interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Job,
    Node,
    Queue,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Job, EntityKind::Node, EntityKind::Queue];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Job => "job",
            EntityKind::Node => "node",
            EntityKind::Queue => "queue",
        }
    }

    pub fn parse(s: &str) -> Option<EntityKind> {
        match s {
            "job" | "jobs" => Some(EntityKind::Job),
            "node" | "nodes" => Some(EntityKind::Node),
            "queue" | "queues" => Some(EntityKind::Queue),
            _ => None,
        }
    }
}

/// One scheduled unit of work for the collection loop: a reconciliation
/// pass for an entity kind, or a utilization snapshot pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PassKind {
    Entities(EntityKind),
    Utilization,
}

impl PassKind {
    pub const ALL: [PassKind; 4] = [
        PassKind::Entities(EntityKind::Job),
        PassKind::Entities(EntityKind::Node),
        PassKind::Entities(EntityKind::Queue),
        PassKind::Utilization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PassKind::Entities(k) => k.as_str(),
            PassKind::Utilization => "utilization",
        }
    }

    pub fn parse(s: &str) -> Option<PassKind> {
        if s == "utilization" {
            return Some(PassKind::Utilization);
        }
        EntityKind::parse(s).map(PassKind::Entities)
    }
}
