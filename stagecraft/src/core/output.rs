//! Stage output type with factory methods.

use crate::governor::ResourceUsage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The output of a successful stage execution.
///
/// Outputs are what the result cache stores for cacheable stages, so they
/// must round-trip through JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// The output payload.
    #[serde(default)]
    pub data: serde_json::Value,

    /// Resources consumed while producing the output.
    #[serde(default, skip_serializing_if = "ResourceUsage::is_empty")]
    pub usage: ResourceUsage,

    /// Additional metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Default for StageOutput {
    fn default() -> Self {
        Self::ok_empty()
    }
}

impl StageOutput {
    /// Creates an output with a payload.
    #[must_use]
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            data,
            usage: ResourceUsage::default(),
            metadata: HashMap::new(),
        }
    }

    /// Creates an output with no payload.
    #[must_use]
    pub fn ok_empty() -> Self {
        Self::ok(serde_json::Value::Null)
    }

    /// Creates an output holding a single keyed value.
    #[must_use]
    pub fn ok_value(key: impl Into<String>, value: serde_json::Value) -> Self {
        let mut map = serde_json::Map::new();
        map.insert(key.into(), value);
        Self::ok(serde_json::Value::Object(map))
    }

    /// Records the resources consumed.
    #[must_use]
    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Looks up a key in an object payload.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ok_value() {
        let output = StageOutput::ok_value("docs", json!(["a", "b"]));
        assert_eq!(output.get("docs"), Some(&json!(["a", "b"])));
        assert!(output.usage.is_empty());
    }

    #[test]
    fn test_empty_usage_not_serialized() {
        let json = serde_json::to_value(StageOutput::ok(json!(1))).unwrap();
        assert!(json.get("usage").is_none());

        let with_usage = StageOutput::ok_empty().with_usage(ResourceUsage::new(10, 1, 0));
        let json = serde_json::to_value(&with_usage).unwrap();
        assert_eq!(json["usage"]["tokens"], 10);
    }

    #[test]
    fn test_serde_roundtrip_keeps_metadata() {
        let output = StageOutput::ok(json!({"k": 1})).with_metadata("source", json!("vector"));
        let bytes = serde_json::to_vec(&output).unwrap();
        let back: StageOutput = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, output);
    }
}
