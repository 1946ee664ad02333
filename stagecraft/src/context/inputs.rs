//! Stage inputs with strictness enforcement.

use crate::core::StageOutput;
use crate::errors::StageError;
use std::collections::BTreeMap;

/// An immutable view of the outputs of a stage's declared dependencies.
///
/// Only declared dependencies are visible; asking for any other stage is a
/// validation error rather than a silent `None`.
#[derive(Debug, Clone, Default)]
pub struct StageInputs {
    /// Outputs of declared dependencies, keyed by stage id.
    outputs: BTreeMap<String, StageOutput>,
    /// The id of the stage reading these inputs (for error messages).
    stage_id: String,
}

impl StageInputs {
    /// Creates new stage inputs.
    #[must_use]
    pub fn new(outputs: BTreeMap<String, StageOutput>, stage_id: impl Into<String>) -> Self {
        Self {
            outputs,
            stage_id: stage_id.into(),
        }
    }

    /// Gets the output of a declared dependency.
    ///
    /// # Errors
    ///
    /// Returns `StageError::Validation` if `stage` is not a declared
    /// dependency of the reading stage.
    pub fn get(&self, stage: &str) -> Result<&StageOutput, StageError> {
        self.outputs.get(stage).ok_or_else(|| {
            StageError::validation(format!(
                "stage '{}' read output of '{}' which is not a declared dependency",
                self.stage_id, stage
            ))
        })
    }

    /// Gets a specific value from a dependency's output payload.
    ///
    /// # Errors
    ///
    /// Returns `StageError::Validation` for undeclared dependencies.
    pub fn get_value(&self, stage: &str, key: &str) -> Result<Option<&serde_json::Value>, StageError> {
        Ok(self.get(stage)?.get(key))
    }

    /// Checks if output exists for a stage.
    #[must_use]
    pub fn contains(&self, stage: &str) -> bool {
        self.outputs.contains_key(stage)
    }

    /// Iterates over the visible outputs in stage-id order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &StageOutput)> {
        self.outputs.iter()
    }

    /// Returns the number of visible outputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    /// Returns true if the stage has no dependencies.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Returns the outputs as one JSON object keyed by stage id.
    ///
    /// Map ordering is deterministic, so the result is usable in cache keys.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .outputs
            .iter()
            .map(|(k, v)| (k.clone(), v.data.clone()))
            .collect();
        serde_json::Value::Object(map)
    }
}
