use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::EntityState;

/// One snapshot of an entity as reported by the scheduler client.
/// `raw` is the opaque original payload, kept for debugging only; it
/// never participates in state-change detection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObservedRecord {
    pub id: String,
    pub state: EntityState,
    #[serde(default)]
    pub attrs: Map<String, Value>,
    #[serde(default)]
    pub raw: Option<Value>,
}

impl ObservedRecord {
    pub fn new(id: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: EntityState::new(state),
            attrs: Map::new(),
            raw: None,
        }
    }

    pub fn with_attr(mut self, key: &str, value: Value) -> Self {
        self.attrs.insert(key.to_string(), value);
        self
    }

    pub fn attr_i64(&self, key: &str) -> Option<i64> {
        match self.attrs.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn attr_f64(&self, key: &str) -> Option<f64> {
        match self.attrs.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key)?.as_str()
    }

    pub fn attr_array_len(&self, key: &str) -> usize {
        self.attrs.get(key).and_then(Value::as_array).map_or(0, Vec::len)
    }
}

/// Current-state row for one identifier. Owned by the reconciler, one row
/// per identifier, never deleted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    pub state: EntityState,
    pub attrs: Map<String, Value>,
    /// Unix seconds of the first accepted observation.
    pub first_seen: i64,
    /// Unix seconds of the most recent accepted observation.
    pub last_updated: i64,
    /// Once true the row is immutable apart from `last_updated`.
    pub is_final: bool,
    pub raw: Option<Value>,
}

/// Append-only state transition for one identifier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub entity_id: String,
    pub timestamp: i64,
    pub state: EntityState,
    pub collection_event_id: Option<i64>,
}

/// A history row pending insertion; the store assigns the row id and the
/// collection event id at commit time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryInsert {
    pub entity_id: String,
    pub timestamp: i64,
    pub state: EntityState,
}
