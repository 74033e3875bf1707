use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::EntityKind;

/// Scheduler-reported state, kept as an open string-valued enumeration.
/// New scheduler versions introduce new values, so terminal-ness is a
/// set-membership check rather than a sealed variant.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityState(pub String);

impl EntityState {
    /// Reserved state assigned when a never-reconfirmed entity is closed
    /// out by the staleness policy.
    pub const UNKNOWN: &'static str = "unknown";

    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for EntityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The configurable set of states from which the scheduler will not
/// transition an entity further.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TerminalStates {
    states: BTreeSet<String>,
}

impl TerminalStates {
    pub fn new<I, S>(states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { states: states.into_iter().map(Into::into).collect() }
    }

    /// Defaults recovered from PBS semantics: jobs finish in C (completed)
    /// or F (finished); nodes and queues never terminalize.
    pub fn default_for(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Job => Self::new(["C", "F"]),
            EntityKind::Node | EntityKind::Queue => Self::default(),
        }
    }

    pub fn contains(&self, state: &EntityState) -> bool {
        // The staleness sweep's reserved state is always terminal.
        state.as_str() == EntityState::UNKNOWN || self.states.contains(state.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
