//! Stage trait and implementations.
//!
//! Stages are the fundamental units of work in a stagecraft pipeline. Each
//! stage is described by a [`StageDescriptor`] that the registry uses to
//! build execution plans.

mod registry;

pub use registry::{ExecutionPlan, StageRegistry};

use crate::context::StageContext;
use crate::core::StageOutput;
use crate::errors::StageError;
use crate::governor::ProposedEdit;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt::Debug;

/// Static description of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Unique stage id.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Ids of stages that must succeed first.
    #[serde(default)]
    pub dependencies: HashSet<String>,
    /// Whether outputs may be served from the result cache.
    #[serde(default)]
    pub cacheable: bool,
    /// Whether the stage proposes file edits that must pass the scope check.
    #[serde(default)]
    pub edits_files: bool,
    /// Tools this stage serves; empty means every tool.
    #[serde(default)]
    pub tools: BTreeSet<String>,
}

impl StageDescriptor {
    /// Creates a descriptor whose name equals its id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            dependencies: HashSet::new(),
            cacheable: false,
            edits_files: false,
            tools: BTreeSet::new(),
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Marks outputs as cacheable.
    #[must_use]
    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    /// Marks the stage as edit-capable.
    #[must_use]
    pub fn edits_files(mut self) -> Self {
        self.edits_files = true;
        self
    }

    /// Restricts the stage to a tool. May be called repeatedly.
    #[must_use]
    pub fn for_tool(mut self, tool: impl Into<String>) -> Self {
        self.tools.insert(tool.into());
        self
    }

    /// Returns true if the stage takes part in plans for `tool`.
    #[must_use]
    pub fn serves(&self, tool: &str) -> bool {
        self.tools.is_empty() || self.tools.contains(tool)
    }
}

/// Trait for pipeline stages.
///
/// Stages are immutable once registered; any per-request state lives in the
/// [`StageContext`].
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the stage's static description.
    fn descriptor(&self) -> &StageDescriptor;

    /// Returns the stage id.
    fn id(&self) -> &str {
        &self.descriptor().id
    }

    /// Executes one attempt of the stage.
    ///
    /// # Errors
    ///
    /// Returns a [`StageError`]; only `StageError::Execution` is retried.
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, StageError>;

    /// Returns the edit this stage intends to make under the attempt's scope.
    ///
    /// Only consulted for stages whose descriptor sets `edits_files`.
    async fn propose_edit(&self, _ctx: &StageContext) -> Option<ProposedEdit> {
        None
    }
}

/// A simple function-based stage.
pub struct FnStage<F>
where
    F: Fn(&StageContext) -> Result<StageOutput, StageError> + Send + Sync,
{
    descriptor: StageDescriptor,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(&StageContext) -> Result<StageOutput, StageError> + Send + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(descriptor: StageDescriptor, func: F) -> Self {
        Self { descriptor, func }
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(&StageContext) -> Result<StageOutput, StageError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage")
            .field("id", &self.descriptor.id)
            .finish()
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(&StageContext) -> Result<StageOutput, StageError> + Send + Sync,
{
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
        (self.func)(ctx)
    }
}

/// A stage that succeeds immediately with an empty output.
#[derive(Debug, Clone)]
pub struct NoOpStage {
    descriptor: StageDescriptor,
}

impl NoOpStage {
    /// Creates a new no-op stage.
    #[must_use]
    pub fn new(descriptor: StageDescriptor) -> Self {
        Self { descriptor }
    }
}

#[async_trait]
impl Stage for NoOpStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput, StageError> {
        Ok(StageOutput::ok_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use crate::context::PipelineContext;
    use serde_json::json;
    use std::sync::Arc;

    fn test_stage_context() -> StageContext {
        PipelineContext::new("analyze", json!({"q": "x"})).stage_context(
            "test",
            &HashSet::new(),
            Arc::new(CancellationToken::new()),
        )
    }

    #[test]
    fn test_descriptor_builder() {
        let d = StageDescriptor::new("retrieve")
            .with_name("Vector retrieval")
            .with_dependency("docs")
            .cacheable()
            .for_tool("analyze");
        assert_eq!(d.id, "retrieve");
        assert_eq!(d.name, "Vector retrieval");
        assert!(d.dependencies.contains("docs"));
        assert!(d.cacheable);
        assert!(!d.edits_files);
        assert!(d.serves("analyze"));
        assert!(!d.serves("fix"));
    }

    #[test]
    fn test_descriptor_without_tools_serves_all() {
        assert!(StageDescriptor::new("a").serves("learn"));
    }

    #[tokio::test]
    async fn test_fn_stage() {
        let stage = FnStage::new(StageDescriptor::new("echo"), |ctx| {
            Ok(StageOutput::ok(ctx.input().clone()))
        });
        assert_eq!(stage.id(), "echo");
        let output = stage.execute(&test_stage_context()).await.unwrap();
        assert_eq!(output.data, json!({"q": "x"}));
    }

    #[tokio::test]
    async fn test_noop_stage() {
        let stage = NoOpStage::new(StageDescriptor::new("noop"));
        let output = stage.execute(&test_stage_context()).await.unwrap();
        assert_eq!(output, StageOutput::ok_empty());
        assert!(stage.propose_edit(&test_stage_context()).await.is_none());
    }
}
