//! End-to-end tests of the engine.

#[cfg(test)]
mod tests {
    use crate::cache::CacheStore;
    use crate::config::{CacheConfig, ExecutionConfig};
    use crate::core::{StageOutput, StageState};
    use crate::errors::{ErrorKind, StageError};
    use crate::events::{CollectingEventSink, EventSink};
    use crate::governor::{
        Budget, BudgetLimits, FileEdit, ProposedEdit, ResourceUsage, Scope, ScopeLimits,
    };
    use crate::pipeline::{Engine, ExecuteOptions, ExecutionStrategy};
    use crate::stages::{NoOpStage, Stage, StageDescriptor};
    use crate::testing::{
        assert_error_kind, assert_execution_failed, assert_execution_succeeded,
        assert_stage_state, assert_starts_after, budget_fixture, engine_config, fast_retry,
        registry_with, scope_fixture, ConcurrencyProbe, FlakyStage, ProbeEvent, ScriptedStage,
        SlowStage,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn engine(stages: Vec<Arc<dyn Stage>>, strategy: ExecutionStrategy) -> Engine {
        Engine::new(registry_with(stages).unwrap(), engine_config(strategy)).unwrap()
    }

    fn engine_with_events(
        stages: Vec<Arc<dyn Stage>>,
        strategy: ExecutionStrategy,
    ) -> (Engine, Arc<CollectingEventSink>) {
        let sink = Arc::new(CollectingEventSink::new());
        let engine = Engine::builder(registry_with(stages).unwrap())
            .config(engine_config(strategy))
            .event_sink(sink.clone() as Arc<dyn EventSink>)
            .build()
            .unwrap();
        (engine, sink)
    }

    fn using(tokens: u64, chunks: u64, files: u64) -> Result<StageOutput, StageError> {
        Ok(StageOutput::ok_value("done", json!(true))
            .with_usage(ResourceUsage::new(tokens, chunks, files)))
    }

    fn options(budget: Budget) -> ExecuteOptions {
        ExecuteOptions::new()
            .with_budget(budget)
            .with_scope(scope_fixture())
    }

    #[tokio::test]
    async fn test_sequential_chain_end_to_end() {
        let a = Arc::new(ScriptedStage::new(StageDescriptor::new("a")).otherwise(using(1000, 1, 0)));
        let b = Arc::new(
            ScriptedStage::new(StageDescriptor::new("b").with_dependency("a"))
                .otherwise(using(1000, 2, 0)),
        );
        let c = Arc::new(
            ScriptedStage::new(StageDescriptor::new("c").with_dependency("b"))
                .otherwise(using(500, 1, 1)),
        );
        let engine = engine(
            vec![a.clone(), b.clone(), c.clone()],
            ExecutionStrategy::Sequential,
        );

        let result = engine
            .execute("fix", json!({"path": "src/lib.rs"}), options(budget_fixture()))
            .await;

        assert_execution_succeeded(&result);
        assert_eq!(result.resolved_strategy, ExecutionStrategy::Sequential);
        assert_eq!(result.plan, vec!["a", "b", "c"]);
        assert_eq!(result.stages_executed, vec!["a", "b", "c"]);
        assert_eq!(result.budget_used.tokens_remaining(), 2500);
        assert_eq!(result.budget_used.chunks_remaining(), 4);
        assert_eq!(result.budget_used.files_remaining(), 1);
        assert!(result.budget_used.fits_within(&budget_fixture()));
        assert_eq!(result.outputs.len(), 3);
        assert!(result.errors.is_empty());

        assert_eq!(b.seen()[0].inputs, vec!["a"]);
        assert_eq!(c.seen()[0].inputs, vec!["b"]);
        assert_starts_after(&result, "c", "b");
    }

    #[tokio::test]
    async fn test_independent_stages_run_in_registration_order() {
        let stages: Vec<Arc<dyn Stage>> = ["A", "B", "C"]
            .into_iter()
            .map(|id| Arc::new(NoOpStage::new(StageDescriptor::new(id))) as Arc<dyn Stage>)
            .collect();
        let engine = engine(stages, ExecutionStrategy::Sequential);

        let budget = Budget::new(Duration::from_millis(60_000), 4000, 5, 2);
        let result = engine.execute("fix", json!({}), options(budget)).await;

        assert_execution_succeeded(&result);
        assert!(result.success);
        assert_eq!(result.stages_executed, vec!["A", "B", "C"]);
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn test_zero_budget_runs_nothing() {
        let a = Arc::new(ScriptedStage::new(StageDescriptor::new("a")));
        let engine = engine(vec![a.clone()], ExecutionStrategy::Sequential);

        let budget = Budget::new(Duration::from_secs(60), 0, 5, 2);
        let result = engine.execute("fix", json!({}), options(budget)).await;

        assert_execution_failed(&result);
        assert!(result.stages_executed.is_empty());
        assert_eq!(a.calls(), 0);
        assert_stage_state(&result, "a", StageState::Skipped);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].kind, ErrorKind::BudgetExceeded);
    }

    #[tokio::test]
    async fn test_exhausted_budget_stops_remaining_stages() {
        let a = Arc::new(ScriptedStage::new(StageDescriptor::new("a")).otherwise(using(4000, 0, 0)));
        let b = Arc::new(ScriptedStage::new(StageDescriptor::new("b")));
        let engine = engine(vec![a, b.clone()], ExecutionStrategy::Sequential);

        let result = engine
            .execute("fix", json!({}), options(budget_fixture()))
            .await;

        assert_execution_failed(&result);
        assert_stage_state(&result, "a", StageState::Succeeded);
        assert_stage_state(&result, "b", StageState::Skipped);
        assert_eq!(b.calls(), 0);
        assert!(result.errors.iter().any(|e| e.kind == ErrorKind::BudgetExceeded));
    }

    #[tokio::test]
    async fn test_parallel_respects_dependencies() {
        let probe = ConcurrencyProbe::new();
        let hold = Duration::from_millis(15);
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(probe.stage(StageDescriptor::new("root"), hold)),
            Arc::new(probe.stage(StageDescriptor::new("left").with_dependency("root"), hold)),
            Arc::new(probe.stage(StageDescriptor::new("right").with_dependency("root"), hold)),
            Arc::new(probe.stage(
                StageDescriptor::new("join").with_dependencies(["left", "right"]),
                hold,
            )),
        ];
        let engine = engine(stages, ExecutionStrategy::Parallel);

        let result = engine
            .execute("fix", json!({}), options(budget_fixture()))
            .await;

        assert_execution_succeeded(&result);
        assert_eq!(result.resolved_strategy, ExecutionStrategy::Parallel);
        assert_starts_after(&result, "left", "root");
        assert_starts_after(&result, "right", "root");
        assert_starts_after(&result, "join", "left");
        assert_starts_after(&result, "join", "right");

        let pos = |e: ProbeEvent| probe.position(&e).unwrap();
        assert!(pos(ProbeEvent::Finished("root".into())) < pos(ProbeEvent::Started("left".into())));
        assert!(pos(ProbeEvent::Finished("left".into())) < pos(ProbeEvent::Started("join".into())));
        assert!(pos(ProbeEvent::Finished("right".into())) < pos(ProbeEvent::Started("join".into())));
        assert_eq!(probe.peak(), 2);
    }

    #[tokio::test]
    async fn test_parallel_bounds_concurrency() {
        let probe = ConcurrencyProbe::new();
        let stages: Vec<Arc<dyn Stage>> = (0..6)
            .map(|i| {
                Arc::new(probe.stage(
                    StageDescriptor::new(format!("s{i}")),
                    Duration::from_millis(25),
                )) as Arc<dyn Stage>
            })
            .collect();
        let mut config = engine_config(ExecutionStrategy::Parallel);
        config.execution = ExecutionConfig::default()
            .with_strategy(ExecutionStrategy::Parallel)
            .with_max_concurrent_stages(2)
            .with_retry(fast_retry(3));
        let engine = Engine::new(registry_with(stages).unwrap(), config).unwrap();

        let result = engine
            .execute("fix", json!({}), options(budget_fixture()))
            .await;

        assert_execution_succeeded(&result);
        assert_eq!(result.stages_executed.len(), 6);
        assert!(probe.peak() <= 2, "peak was {}", probe.peak());
        assert_eq!(probe.peak(), 2);
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_dependents() {
        let a = Arc::new(ScriptedStage::new(StageDescriptor::new("a")));
        let b = Arc::new(
            ScriptedStage::new(StageDescriptor::new("b").with_dependency("a"))
                .otherwise(Err(StageError::validation("bad diff"))),
        );
        let c = Arc::new(ScriptedStage::new(StageDescriptor::new("c").with_dependency("b")));
        let d = Arc::new(ScriptedStage::new(StageDescriptor::new("d")));
        let (engine, sink) = engine_with_events(
            vec![a, b.clone(), c.clone(), d],
            ExecutionStrategy::Parallel,
        );

        let result = engine
            .execute("fix", json!({}), options(budget_fixture()))
            .await;

        assert_execution_failed(&result);
        assert_stage_state(&result, "a", StageState::Succeeded);
        assert_stage_state(&result, "b", StageState::Failed);
        assert_stage_state(&result, "c", StageState::Skipped);
        assert_stage_state(&result, "d", StageState::Succeeded);
        assert_error_kind(&result, "b", ErrorKind::Validation);
        assert_error_kind(&result, "c", ErrorKind::DependencyFailed);
        assert_eq!(b.calls(), 1, "validation errors are not retried");
        assert_eq!(c.calls(), 0);
        assert!(!result.stages_executed.contains(&"c".to_string()));

        assert_eq!(sink.stages_for("stage.skipped"), vec!["c"]);
        assert_eq!(sink.stages_for("stage.failed"), vec!["b"]);
    }

    #[tokio::test]
    async fn test_deadline_times_out_running_stage() {
        let slow = Arc::new(SlowStage::new(
            StageDescriptor::new("slow"),
            Duration::from_millis(500),
        ));
        let after = Arc::new(ScriptedStage::new(
            StageDescriptor::new("after").with_dependency("slow"),
        ));
        let engine = engine(vec![slow, after.clone()], ExecutionStrategy::Sequential);

        let budget = Budget::new(Duration::from_millis(50), 4000, 5, 2);
        let result = engine.execute("fix", json!({}), options(budget)).await;

        assert_execution_failed(&result);
        assert_stage_state(&result, "slow", StageState::Failed);
        assert_stage_state(&result, "after", StageState::Skipped);
        assert_error_kind(&result, "slow", ErrorKind::Timeout);
        assert_eq!(after.calls(), 0);
        assert!(result.duration_ms < 400.0, "took {} ms", result.duration_ms);
        assert_eq!(result.attempts_for("slow").len(), 1);
    }

    #[tokio::test]
    async fn test_retries_narrow_scope_and_chunks() {
        let flaky = Arc::new(
            FlakyStage::new(StageDescriptor::new("retrieve"), 2)
                .with_output(StageOutput::ok_empty().with_usage(ResourceUsage::new(10, 1, 0))),
        );
        let (engine, sink) =
            engine_with_events(vec![flaky.clone()], ExecutionStrategy::Sequential);

        let result = engine
            .execute("fix", json!({}), options(budget_fixture()))
            .await;

        assert_execution_succeeded(&result);
        let attempts = result.attempts_for("retrieve");
        assert_eq!(attempts.len(), 3);
        assert_eq!(
            attempts.iter().map(|a| a.chunk_allowance).collect::<Vec<_>>(),
            vec![5, 2, 1]
        );
        assert_eq!(
            attempts.iter().map(|a| a.scope.max_files()).collect::<Vec<_>>(),
            vec![8, 4, 2]
        );
        for pair in attempts.windows(2) {
            assert!(pair[1].scope.fits_within(&pair[0].scope));
            assert!(pair[1].started_offset_ms >= pair[0].ended_offset_ms);
        }
        assert_eq!(flaky.seen().iter().map(|s| s.chunks).collect::<Vec<_>>(), vec![5, 2, 1]);
        assert_eq!(result.stages_executed, vec!["retrieve"]);
        assert_eq!(sink.events_of_type("stage.retrying").len(), 2);
        assert_eq!(result.budget_used.chunks_remaining(), 1);
    }

    #[tokio::test]
    async fn test_scope_violation_fails_without_retry() {
        let edit = ProposedEdit::new(vec![
            FileEdit::new("src/a.rs", 5, 1),
            FileEdit::new("src/b.rs", 5, 1),
            FileEdit::new("src/c.rs", 5, 1),
        ]);
        let editor = Arc::new(
            ScriptedStage::new(StageDescriptor::new("edit").edits_files()).proposing(edit),
        );
        let engine = engine(vec![editor.clone()], ExecutionStrategy::Sequential);

        let scope = Scope::new(2, 100, 5).unwrap();
        let result = engine
            .execute(
                "fix",
                json!({}),
                ExecuteOptions::new().with_budget(budget_fixture()).with_scope(scope),
            )
            .await;

        assert_execution_failed(&result);
        assert_error_kind(&result, "edit", ErrorKind::ScopeViolation);
        assert_eq!(result.attempts_for("edit").len(), 1);
        assert_eq!(editor.calls(), 0);
    }

    #[tokio::test]
    async fn test_optimized_serves_second_run_from_cache() {
        let docs = Arc::new(
            ScriptedStage::new(StageDescriptor::new("docs").cacheable())
                .otherwise(using(300, 2, 0)),
        );
        let (engine, sink) = engine_with_events(vec![docs.clone()], ExecutionStrategy::Optimized);
        let input = json!({"query": "tokio select"});

        let first = engine
            .execute("docs", input.clone(), options(budget_fixture()))
            .await;
        let second = engine.execute("docs", input, options(budget_fixture())).await;

        assert_execution_succeeded(&first);
        assert_execution_succeeded(&second);
        assert!(!first.is_cache_hit("docs"));
        assert!(second.is_cache_hit("docs"));
        assert_eq!(docs.calls(), 1);
        assert_eq!(second.budget_used.tokens_remaining(), 0);
        assert_eq!(second.budget_used.chunks_remaining(), 0);
        assert_eq!(second.output("docs"), first.output("docs"));
        assert_eq!(second.plan, vec!["docs"]);

        let stats = engine.get_cache_stats().unwrap();
        assert!(stats.hits >= 1);
        assert_eq!(sink.events_of_type("cache.hit").len(), 1);
        assert_eq!(sink.events_of_type("cache.miss").len(), 1);
    }

    #[tokio::test]
    async fn test_waiting_on_shared_cache_respects_deadline() {
        let index = Arc::new(SlowStage::new(
            StageDescriptor::new("index").cacheable(),
            Duration::from_millis(600),
        ));
        let cache = Arc::new(CacheStore::in_memory(&CacheConfig::default()));
        let on_shared_cache = || {
            Engine::builder(registry_with(vec![index.clone() as Arc<dyn Stage>]).unwrap())
                .config(engine_config(ExecutionStrategy::Optimized))
                .cache(cache.clone())
                .build()
                .unwrap()
        };
        let leader = on_shared_cache();
        let follower = on_shared_cache();
        let input = json!({"repo": "stagecraft"});

        let (led, (followed, waited)) = tokio::join!(
            leader.execute("index", input.clone(), options(budget_fixture())),
            async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                let started = std::time::Instant::now();
                let budget = Budget::new(Duration::from_millis(100), 4000, 5, 2);
                let result = follower.execute("index", input.clone(), options(budget)).await;
                (result, started.elapsed())
            }
        );

        assert!(waited < Duration::from_millis(400), "waited {waited:?}");
        assert_execution_failed(&followed);
        assert_error_kind(&followed, "index", ErrorKind::Timeout);
        assert!(!followed.is_cache_hit("index"));
        assert_eq!(followed.attempts_for("index").len(), 1);

        assert_execution_succeeded(&led);
        assert_eq!(index.calls(), 1);
    }

    #[tokio::test]
    async fn test_sequential_strategy_ignores_cache() {
        let docs = Arc::new(ScriptedStage::new(StageDescriptor::new("docs").cacheable()));
        let engine = engine(vec![docs.clone()], ExecutionStrategy::Sequential);

        for _ in 0..2 {
            let result = engine
                .execute("docs", json!({}), options(budget_fixture()))
                .await;
            assert!(!result.is_cache_hit("docs"));
        }
        assert_eq!(docs.calls(), 2);
    }

    #[tokio::test]
    async fn test_adaptive_selection() {
        let wide: Vec<Arc<dyn Stage>> = vec![
            Arc::new(NoOpStage::new(StageDescriptor::new("a").for_tool("wide"))),
            Arc::new(NoOpStage::new(StageDescriptor::new("b").for_tool("wide"))),
            Arc::new(NoOpStage::new(StageDescriptor::new("x").for_tool("chain"))),
            Arc::new(NoOpStage::new(
                StageDescriptor::new("y").for_tool("chain").with_dependency("x"),
            )),
        ];
        let engine = engine(wide, ExecutionStrategy::Adaptive);

        let wide = engine
            .execute("wide", json!({}), options(budget_fixture()))
            .await;
        let chain = engine
            .execute("chain", json!({}), options(budget_fixture()))
            .await;

        assert_eq!(wide.strategy, ExecutionStrategy::Adaptive);
        assert_eq!(wide.resolved_strategy, ExecutionStrategy::Parallel);
        assert_eq!(chain.resolved_strategy, ExecutionStrategy::Sequential);
        assert_execution_succeeded(&wide);
        assert_execution_succeeded(&chain);
    }

    #[tokio::test]
    async fn test_history_and_replay() {
        let engine = engine(
            vec![Arc::new(NoOpStage::new(StageDescriptor::new("a")))],
            ExecutionStrategy::Sequential,
        );

        let first = engine
            .execute("fix", json!({"n": 1}), options(budget_fixture()))
            .await;
        let second = engine
            .execute(
                "fix",
                json!({"n": 2}),
                options(budget_fixture()).with_correlation_id("req-42"),
            )
            .await;

        let history = engine.get_execution_history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].execution_id, second.execution_id);
        assert_eq!(history[1].execution_id, first.execution_id);
        assert_eq!(second.correlation_id, "req-42");

        assert_eq!(engine.replay_execution(first.execution_id), Some(first));
        assert_eq!(engine.replay_execution(uuid::Uuid::new_v4()), None);
    }

    #[tokio::test]
    async fn test_bottleneck_detection() {
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(NoOpStage::new(StageDescriptor::new("parse"))),
            Arc::new(NoOpStage::new(StageDescriptor::new("plan"))),
            Arc::new(NoOpStage::new(StageDescriptor::new("lint"))),
            Arc::new(SlowStage::new(
                StageDescriptor::new("model"),
                Duration::from_millis(60),
            )),
        ];
        let engine = engine(stages, ExecutionStrategy::Sequential);

        for _ in 0..2 {
            let result = engine
                .execute("fix", json!({}), options(budget_fixture()))
                .await;
            assert_execution_succeeded(&result);
        }

        let report = engine.get_performance_analytics();
        assert_eq!(report.execution_count, 2);
        assert!((report.success_rate - 1.0).abs() < f64::EPSILON);
        assert!(report.is_bottleneck("model"));
        assert!(!report.is_bottleneck("parse"));
        assert_eq!(report.stage("model").unwrap().count, 2);
        assert!(report.stage("model").unwrap().p50_ms >= 60.0);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_rejected() {
        let engine = engine(
            vec![Arc::new(NoOpStage::new(StageDescriptor::new("a").for_tool("fix")))],
            ExecutionStrategy::Sequential,
        );

        let result = engine
            .execute("deploy", json!({}), ExecuteOptions::new())
            .await;

        assert_execution_failed(&result);
        assert!(result.plan.is_empty());
        assert_eq!(result.errors[0].kind, ErrorKind::Validation);
        assert!(result.errors[0].message.contains("deploy"));
        assert_eq!(engine.replay_execution(result.execution_id), Some(result));
    }

    #[tokio::test]
    async fn test_execute_with_limits_validates_payload() {
        let a = Arc::new(ScriptedStage::new(StageDescriptor::new("a")));
        let engine = engine(vec![a.clone()], ExecutionStrategy::Sequential);

        let rejected = engine
            .execute_with_limits(
                "fix",
                json!({}),
                BudgetLimits {
                    tokens: Some(-1),
                    ..BudgetLimits::default()
                },
                ScopeLimits::default(),
                None,
            )
            .await;
        assert_execution_failed(&rejected);
        assert_eq!(rejected.errors[0].kind, ErrorKind::Validation);
        assert_eq!(a.calls(), 0);

        let accepted = engine
            .execute_with_limits(
                "fix",
                json!({}),
                BudgetLimits {
                    tokens: Some(100),
                    ..BudgetLimits::default()
                },
                ScopeLimits {
                    max_files: Some(3),
                    ..ScopeLimits::default()
                },
                Some(ExecutionStrategy::Sequential),
            )
            .await;
        assert_execution_succeeded(&accepted);
        assert_eq!(a.seen()[0].scope.max_files(), 3);
    }

    #[tokio::test]
    async fn test_lifecycle_events_bracket_execution() {
        let (engine, sink) = engine_with_events(
            vec![Arc::new(NoOpStage::new(StageDescriptor::new("a")))],
            ExecutionStrategy::Sequential,
        );

        let _ = engine
            .execute("fix", json!({}), options(budget_fixture()))
            .await;

        assert_eq!(
            sink.types(),
            vec![
                "execution.started",
                "stage.started",
                "stage.completed",
                "execution.completed",
            ]
        );
    }
}
