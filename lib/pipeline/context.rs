use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Per-message state carried through the stages of one execution.
///
/// Wire form: `{"sequence_id": 42, "attributes": {...}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub sequence_id: u64,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new(sequence_id: u64) -> Self {
        Self {
            sequence_id,
            attributes: Map::new(),
        }
    }

    pub fn decode(message: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(message)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.attributes.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.attributes.remove(key)
    }

    /// Pretty JSON for fault logs. Never fails: falls back to the debug form.
    pub fn snapshot(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}
