//! End-to-end scenarios against the full `run_pipeline` state machine,
//! using `InMemoryStateStore` and deterministic stage executors — no
//! network, no real LLM calls.

use async_trait::async_trait;
use llm_pipeline::error::{PipelineError, Result};
use llm_pipeline::model::{
    BaseClaim, ClaimsTree, Comment, LlmStageConfig, PartialTopic, Subtopic, Usage,
};
use llm_pipeline::runner::{
    run_pipeline, Executors, PipelineInput, RunConfig,
};
use llm_pipeline::stages::claims::{ClaimsExecutor, ClaimsInput, ClaimsOutput, MockClaimsExecutor};
use llm_pipeline::stages::clustering::{
    ClusteringExecutor, ClusteringInput, ClusteringOutput, MockClusteringExecutor,
};
use llm_pipeline::stages::cruxes::MockCruxesExecutor;
use llm_pipeline::stages::dedup::MockDedupExecutor;
use llm_pipeline::stages::summaries::MockSummariesExecutor;
use llm_pipeline::state::{RunStatus, StepName, StepStatus};
use llm_pipeline::store::{InMemoryStateStore, StateStore};

fn taxonomy() -> Vec<PartialTopic> {
    vec![PartialTopic {
        topic_name: "Animals".into(),
        topic_short_description: "Pets and wildlife".into(),
        subtopics: vec![Subtopic {
            subtopic_name: "Pets".into(),
            subtopic_short_description: "Domesticated animals".into(),
        }],
    }]
}

fn sample_claim() -> BaseClaim {
    BaseClaim {
        claim: "Dogs are loyal".into(),
        quote: "Dogs are loyal".into(),
        speaker: "A".into(),
        topic_name: "Animals".into(),
        subtopic_name: "Pets".into(),
        comment_id: "c1".into(),
    }
}

fn mock_executors() -> Executors {
    Executors {
        clustering: Box::new(MockClusteringExecutor {
            topics: taxonomy(),
        }),
        claims: Box::new(MockClaimsExecutor {
            claims: vec![sample_claim()],
        }),
        dedup: Box::new(MockDedupExecutor),
        summaries: Box::new(MockSummariesExecutor),
        cruxes: Box::new(MockCruxesExecutor),
    }
}

fn sample_input() -> PipelineInput {
    PipelineInput {
        comments: vec![Comment {
            id: "c1".into(),
            text: "Dogs are loyal".into(),
            speaker: "A".into(),
        }],
        clustering_config: LlmStageConfig::new("m", "s", "${comments}"),
        claims_config: LlmStageConfig::new("m", "s", "${taxonomy} ${comment}"),
        dedup_config: LlmStageConfig::new("m", "s", "${claims}"),
        summaries_config: LlmStageConfig::new("m", "s", "${topic}"),
        cruxes_config: None,
        sort_strategy: "speakers_then_claims".to_string(),
        enable_cruxes: false,
        cruxes_top_k: 3,
    }
}

/// Always fails with an upstream error, for the stage-failure scenario.
struct FailingClaimsExecutor;

#[async_trait]
impl ClaimsExecutor for FailingClaimsExecutor {
    async fn execute(&self, _input: ClaimsInput) -> Result<ClaimsOutput> {
        Err(PipelineError::UpstreamInvalidResponse(
            "model returned unparseable claims".into(),
        ))
    }
}

/// Steals the pipeline's own lease mid-invocation, simulating another
/// worker grabbing the lock after it expired.
struct LockStealingClusteringExecutor {
    store: std::sync::Arc<InMemoryStateStore>,
    report_id: String,
}

#[async_trait]
impl ClusteringExecutor for LockStealingClusteringExecutor {
    async fn execute(&self, input: ClusteringInput) -> Result<ClusteringOutput> {
        self.store.expire_lock_for_test(&self.report_id);
        if input.comments.is_empty() {
            return Err(PipelineError::InvalidInput("no comments".into()));
        }
        Ok(ClusteringOutput {
            data: taxonomy(),
            usage: Usage::new(10, 10),
            cost: 0.001,
        })
    }
}

#[tokio::test]
async fn test_full_happy_path_produces_all_outputs() {
    let store = InMemoryStateStore::new();
    let executors = mock_executors();
    let config = RunConfig::new("report-happy", "user-1");

    let result = run_pipeline(sample_input(), config, &store, &executors)
        .await
        .expect("pipeline should succeed");

    assert!(result.success);
    assert_eq!(result.state.status, RunStatus::Completed);
    let outputs = result.outputs.expect("outputs present on success");
    assert_eq!(outputs.topic_tree.len(), 1);
    assert_eq!(outputs.claims_tree.total(), 1);
    assert_eq!(outputs.sorted_tree.topics.len(), 1);
    assert_eq!(outputs.summaries.len(), 1);
    assert!(outputs.cruxes.is_none());

    for step in [
        StepName::Clustering,
        StepName::Claims,
        StepName::SortAndDeduplicate,
        StepName::Summaries,
    ] {
        assert_eq!(
            result.state.step(step).unwrap().status,
            Some(StepStatus::Completed)
        );
    }
    assert_eq!(
        result.state.step(StepName::Cruxes).unwrap().status,
        Some(StepStatus::Skipped)
    );
}

#[tokio::test]
async fn test_resume_after_clustering_does_not_rerun_it() {
    let store = InMemoryStateStore::new();
    let executors = mock_executors();

    // Run to completion once, then roll the persisted state back to
    // "only clustering done" so a resumed run has real work to skip.
    let first = run_pipeline(sample_input(), RunConfig::new("report-resume", "user-1"), &store, &executors)
        .await
        .unwrap();
    let mut state = first.state;
    for step in [StepName::Claims, StepName::SortAndDeduplicate, StepName::Summaries] {
        state.completed_results.remove(step.as_str());
        *state.step_mut(step) = llm_pipeline::state::StepState::pending();
    }
    state.status = RunStatus::Running;
    store.save(&state).await.unwrap();

    let mut resume_config = RunConfig::new("report-resume", "user-1");
    resume_config.resume_from_state = true;
    let resumed = run_pipeline(sample_input(), resume_config, &store, &executors)
        .await
        .expect("resumed run should succeed");

    assert!(resumed.success);
    assert_eq!(
        resumed.state.step(StepName::Clustering).unwrap().status,
        Some(StepStatus::Completed)
    );
    assert_eq!(
        resumed.state.step(StepName::Claims).unwrap().status,
        Some(StepStatus::Completed)
    );
}

#[tokio::test]
async fn test_corrupted_cache_beyond_ceiling_aborts_resume() {
    let store = InMemoryStateStore::new();
    let executors = mock_executors();

    let mut state = llm_pipeline::state::PipelineState::fresh("report-corrupt", "user-1");
    state.status = RunStatus::Running;
    // A structurally invalid cached clustering result — missing `data`.
    state.completed_results.insert(
        StepName::Clustering.as_str().to_string(),
        serde_json::json!({ "usage": {}, "cost": 0 }),
    );
    state.step_mut(StepName::Clustering).status = Some(StepStatus::Completed);
    store.save(&state).await.unwrap();

    // Push the failure counter to the ceiling before the resume attempt,
    // so this resume is the one that tips it over.
    for _ in 0..3 {
        store
            .increment_validation_failure("report-corrupt", StepName::Clustering.as_str())
            .await
            .unwrap();
    }

    let mut config = RunConfig::new("report-corrupt", "user-1");
    config.resume_from_state = true;
    config.validation_failure_ceiling = 3;

    let result = run_pipeline(sample_input(), config, &store, &executors).await;
    match result {
        Err(PipelineError::CorruptedState { step, .. }) => {
            assert_eq!(step, StepName::Clustering.as_str());
        }
        other => panic!("expected CorruptedState, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stage_failure_marks_run_failed_and_persists_error() {
    let store = InMemoryStateStore::new();
    let mut executors = mock_executors();
    executors.claims = Box::new(FailingClaimsExecutor);

    let config = RunConfig::new("report-fail", "user-1");
    let result = run_pipeline(sample_input(), config, &store, &executors).await;
    assert!(result.is_err());

    let persisted = store.get("report-fail").await.unwrap().unwrap();
    assert_eq!(persisted.status, RunStatus::Failed);
    assert_eq!(
        persisted.step(StepName::Claims).unwrap().status,
        Some(StepStatus::Failed)
    );
    assert_eq!(
        persisted.error.as_ref().unwrap().name,
        "upstream_invalid_response"
    );
    // Clustering's own output is still cached even though claims failed.
    assert!(persisted.has_cached(StepName::Clustering));
}

#[tokio::test]
async fn test_lock_lost_mid_stage_does_not_persist_that_stage() {
    let store = std::sync::Arc::new(InMemoryStateStore::new());
    let mut executors = mock_executors();
    executors.clustering = Box::new(LockStealingClusteringExecutor {
        store: store.clone(),
        report_id: "report-lock".to_string(),
    });

    let config = RunConfig::new("report-lock", "user-1");
    let result = run_pipeline(sample_input(), config, &*store, &executors).await;
    assert!(result.is_err());

    // The lease was stolen before the wrapper's post-execution persist, so
    // clustering's result must never have reached durable state.
    let persisted = store.get("report-lock").await.unwrap();
    if let Some(state) = persisted {
        assert!(!state.has_cached(StepName::Clustering));
    }
}

#[tokio::test]
async fn test_claims_tree_survives_round_trip_through_state() {
    let store = InMemoryStateStore::new();
    let executors = mock_executors();
    let result = run_pipeline(sample_input(), RunConfig::new("report-roundtrip", "user-1"), &store, &executors)
        .await
        .unwrap();

    let persisted = store.get("report-roundtrip").await.unwrap().unwrap();
    let cached: serde_json::Value = persisted
        .completed_results
        .get(StepName::Claims.as_str())
        .cloned()
        .unwrap();
    let decoded: ClaimsTree = serde_json::from_value(cached.get("data").unwrap().clone()).unwrap();
    assert_eq!(decoded.total(), 1);
    assert_eq!(result.outputs.unwrap().claims_tree.total(), decoded.total());
}
