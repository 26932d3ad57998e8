//! Shared value types used across the orchestration core.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Free-form parameters attached to an operation and handed to the
/// distributor on every dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameters(HashMap<String, Value>);

impl Parameters {
    /// Create an empty parameter map
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Get a parameter by name
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Set a parameter, returning self for chaining
    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.0.insert(name.to_string(), value);
        self
    }

    /// Insert a parameter
    pub fn insert(&mut self, name: &str, value: Value) {
        self.0.insert(name.to_string(), value);
    }

    /// Merge another parameter map into this one, overwriting duplicates
    pub fn merge(&mut self, other: &Parameters) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no parameters are set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over entries
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl From<HashMap<String, Value>> for Parameters {
    fn from(map: HashMap<String, Value>) -> Self {
        Self(map)
    }
}

/// Identity of the server instance owning persisted snapshots. Each
/// operation is owned by exactly one server at a time; the identity tag
/// namespaces the snapshot store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerIdentity(pub String);

impl ServerIdentity {
    /// Identity from an explicit tag
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Severity of an operator alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertLevel {
    /// Informational notice
    Info,
    /// Degraded but recoverable situation
    Warning,
    /// Operator attention required
    Critical,
}
