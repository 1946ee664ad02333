//! Scripted stages for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::context::StageContext;
use crate::core::StageOutput;
use crate::errors::StageError;
use crate::governor::{ProposedEdit, Scope};
use crate::stages::{Stage, StageDescriptor};

/// What a stage saw on one call.
#[derive(Debug, Clone, PartialEq)]
pub struct SeenAttempt {
    /// Attempt number from the context.
    pub attempt: u32,
    /// Scope handed to the attempt.
    pub scope: Scope,
    /// Chunk allowance handed to the attempt.
    pub chunks: u64,
    /// Ids of the dependency outputs visible to the attempt.
    pub inputs: Vec<String>,
}

impl SeenAttempt {
    fn from_ctx(ctx: &StageContext) -> Self {
        Self {
            attempt: ctx.attempt(),
            scope: ctx.scope().clone(),
            chunks: ctx.budget().chunks_remaining(),
            inputs: ctx.inputs().iter().map(|(id, _)| id.clone()).collect(),
        }
    }
}

/// A stage that replays a script of results, one per call.
///
/// Once the script runs out the fallback result is returned on every call.
#[derive(Debug)]
pub struct ScriptedStage {
    descriptor: StageDescriptor,
    script: Mutex<VecDeque<Result<StageOutput, StageError>>>,
    fallback: Result<StageOutput, StageError>,
    edit: Option<ProposedEdit>,
    seen: Mutex<Vec<SeenAttempt>>,
}

impl ScriptedStage {
    /// Creates a stage that always succeeds with an empty output.
    #[must_use]
    pub fn new(descriptor: StageDescriptor) -> Self {
        Self {
            descriptor,
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(StageOutput::ok_empty()),
            edit: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Queues a result for the next unscripted call.
    #[must_use]
    pub fn then(self, result: Result<StageOutput, StageError>) -> Self {
        self.script.lock().push_back(result);
        self
    }

    /// Sets the result returned once the script is used up.
    #[must_use]
    pub fn otherwise(mut self, result: Result<StageOutput, StageError>) -> Self {
        self.fallback = result;
        self
    }

    /// Sets the edit proposed on every call.
    #[must_use]
    pub fn proposing(mut self, edit: ProposedEdit) -> Self {
        self.edit = Some(edit);
        self
    }

    /// Number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.seen.lock().len()
    }

    /// Every call, in order.
    #[must_use]
    pub fn seen(&self) -> Vec<SeenAttempt> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
        self.seen.lock().push(SeenAttempt::from_ctx(ctx));
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }

    async fn propose_edit(&self, _ctx: &StageContext) -> Option<ProposedEdit> {
        self.edit.clone()
    }
}

/// A stage that fails with a retryable error a fixed number of times.
#[derive(Debug)]
pub struct FlakyStage {
    descriptor: StageDescriptor,
    failures: usize,
    output: StageOutput,
    calls: AtomicUsize,
    seen: Mutex<Vec<SeenAttempt>>,
}

impl FlakyStage {
    /// Creates a stage that fails `failures` times, then succeeds.
    #[must_use]
    pub fn new(descriptor: StageDescriptor, failures: usize) -> Self {
        Self {
            descriptor,
            failures,
            output: StageOutput::ok_empty(),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Creates a stage that never succeeds.
    #[must_use]
    pub fn always(descriptor: StageDescriptor) -> Self {
        Self::new(descriptor, usize::MAX)
    }

    /// Sets the output of the successful call.
    #[must_use]
    pub fn with_output(mut self, output: StageOutput) -> Self {
        self.output = output;
        self
    }

    /// Number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every call, in order.
    #[must_use]
    pub fn seen(&self) -> Vec<SeenAttempt> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Stage for FlakyStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
        self.seen.lock().push(SeenAttempt::from_ctx(ctx));
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(StageError::execution(format!(
                "{} unavailable (call {})",
                self.descriptor.id,
                call + 1
            )))
        } else {
            Ok(self.output.clone())
        }
    }
}

/// A stage that sleeps before succeeding.
#[derive(Debug)]
pub struct SlowStage {
    descriptor: StageDescriptor,
    delay: Duration,
    output: StageOutput,
    calls: AtomicUsize,
}

impl SlowStage {
    /// Creates a slow stage.
    #[must_use]
    pub fn new(descriptor: StageDescriptor, delay: Duration) -> Self {
        Self {
            descriptor,
            delay,
            output: StageOutput::ok_empty(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Sets the output.
    #[must_use]
    pub fn with_output(mut self, output: StageOutput) -> Self {
        self.output = output;
        self
    }

    /// Number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for SlowStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.output.clone())
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    running: AtomicUsize,
    peak: AtomicUsize,
    timeline: Mutex<Vec<ProbeEvent>>,
}

/// A start or end observed by a [`ConcurrencyProbe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeEvent {
    /// The stage began executing.
    Started(String),
    /// The stage finished executing.
    Finished(String),
}

/// Tracks how many probed stages run at once.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyProbe {
    state: Arc<ProbeState>,
}

impl ConcurrencyProbe {
    /// Creates a probe.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A stage that holds a slot for `hold` while the probe watches.
    #[must_use]
    pub fn stage(&self, descriptor: StageDescriptor, hold: Duration) -> ProbeStage {
        ProbeStage {
            descriptor,
            hold,
            probe: self.clone(),
        }
    }

    /// Highest number of probed stages seen running together.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    /// Every start and end, in the order observed.
    #[must_use]
    pub fn timeline(&self) -> Vec<ProbeEvent> {
        self.state.timeline.lock().clone()
    }

    /// Position of an event in the timeline.
    #[must_use]
    pub fn position(&self, event: &ProbeEvent) -> Option<usize> {
        self.state.timeline.lock().iter().position(|e| e == event)
    }

    fn enter(&self, id: &str) {
        self.state.timeline.lock().push(ProbeEvent::Started(id.to_string()));
        let now = self.state.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self, id: &str) {
        self.state.running.fetch_sub(1, Ordering::SeqCst);
        self.state.timeline.lock().push(ProbeEvent::Finished(id.to_string()));
    }
}

/// A stage reporting to a [`ConcurrencyProbe`].
#[derive(Debug)]
pub struct ProbeStage {
    descriptor: StageDescriptor,
    hold: Duration,
    probe: ConcurrencyProbe,
}

#[async_trait]
impl Stage for ProbeStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput, StageError> {
        self.probe.enter(&self.descriptor.id);
        tokio::time::sleep(self.hold).await;
        self.probe.exit(&self.descriptor.id);
        Ok(StageOutput::ok_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use crate::context::PipelineContext;
    use std::collections::HashSet;

    fn ctx(stage: &str) -> StageContext {
        PipelineContext::new("analyze", serde_json::json!({}))
            .stage_context(stage, &HashSet::new(), Arc::new(CancellationToken::new()))
    }

    #[tokio::test]
    async fn test_scripted_stage_replays_then_falls_back() {
        let stage = ScriptedStage::new(StageDescriptor::new("s"))
            .then(Err(StageError::execution("first")))
            .otherwise(Ok(StageOutput::ok_value("n", serde_json::json!(1))));

        assert!(stage.execute(&ctx("s")).await.is_err());
        assert!(stage.execute(&ctx("s")).await.is_ok());
        assert!(stage.execute(&ctx("s")).await.is_ok());
        assert_eq!(stage.calls(), 3);
    }

    #[tokio::test]
    async fn test_flaky_stage_recovers() {
        let stage = FlakyStage::new(StageDescriptor::new("f"), 2);
        assert!(stage.execute(&ctx("f")).await.is_err());
        assert!(stage.execute(&ctx("f")).await.is_err());
        assert!(stage.execute(&ctx("f")).await.is_ok());
        assert_eq!(stage.calls(), 3);
    }

    #[tokio::test]
    async fn test_probe_tracks_peak() {
        let probe = ConcurrencyProbe::new();
        let a = probe.stage(StageDescriptor::new("a"), Duration::from_millis(20));
        let b = probe.stage(StageDescriptor::new("b"), Duration::from_millis(20));
        let (ca, cb) = (ctx("a"), ctx("b"));

        let (ra, rb) = tokio::join!(a.execute(&ca), b.execute(&cb));
        assert!(ra.is_ok() && rb.is_ok());
        assert_eq!(probe.peak(), 2);
        assert_eq!(probe.timeline().len(), 4);
    }
}
