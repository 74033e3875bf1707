use serde::{Deserialize, Serialize};

use crate::PassKind;

/// Outcome of one reconciliation or snapshot pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassOutcome {
    Success,
    /// The pass committed but skipped malformed records or rejected
    /// observations against finalized entities.
    PartialSuccess,
    Failed,
}

impl PassOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassOutcome::Success => "success",
            PassOutcome::PartialSuccess => "partial_success",
            PassOutcome::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<PassOutcome> {
        match s {
            "success" => Some(PassOutcome::Success),
            "partial_success" => Some(PassOutcome::PartialSuccess),
            "failed" => Some(PassOutcome::Failed),
            _ => None,
        }
    }
}

/// Per-pass tallies recorded in the audit trail.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassCounts {
    pub observed: u32,
    pub new_entities: u32,
    pub state_changes: u32,
    pub finality_rejections: u32,
    pub parse_errors: u32,
}

impl PassCounts {
    pub fn add(&mut self, other: &PassCounts) {
        self.observed += other.observed;
        self.new_entities += other.new_entities;
        self.state_changes += other.state_changes;
        self.finality_rejections += other.finality_rejections;
        self.parse_errors += other.parse_errors;
    }

    /// A pass that committed is only fully successful when nothing was
    /// skipped or rejected along the way.
    pub fn outcome_on_commit(&self) -> PassOutcome {
        if self.parse_errors > 0 || self.finality_rejections > 0 {
            PassOutcome::PartialSuccess
        } else {
            PassOutcome::Success
        }
    }
}

/// Audit record of one pass. Exactly one row exists per pass, success or
/// failure; rows are append-only apart from completion bookkeeping.
#[derive(Clone, Debug)]
pub struct CollectionEvent {
    pub id: i64,
    pub kind: PassKind,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub outcome: PassOutcome,
    pub counts: PassCounts,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_reflects_skips() {
        let mut c = PassCounts::default();
        assert_eq!(c.outcome_on_commit(), PassOutcome::Success);
        c.parse_errors = 1;
        assert_eq!(c.outcome_on_commit(), PassOutcome::PartialSuccess);
        c = PassCounts { finality_rejections: 2, ..Default::default() };
        assert_eq!(c.outcome_on_commit(), PassOutcome::PartialSuccess);
    }

    #[test]
    fn outcome_round_trips() {
        for o in [PassOutcome::Success, PassOutcome::PartialSuccess, PassOutcome::Failed] {
            assert_eq!(PassOutcome::parse(o.as_str()), Some(o));
        }
    }
}
