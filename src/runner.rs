//! The top-level state machine (spec §4.4): initializes or resumes state,
//! validates recovered cached results, walks the stage DAG skipping
//! already-completed stages, races the whole run against a pipeline-wide
//! timeout, and finalizes status.
//!
//! The cooperative-cancellation shape (`Arc<AtomicBool>` checked between
//! stage boundaries) is grounded on the teacher's
//! `Pipeline::execute_with_progress` sequential loop; the timeout race itself
//! uses `tokio::select!` against `tokio::time::sleep`, the idiom used across
//! the pack's async services for a cancellable wall-clock budget.

use crate::backend::{Backend, BackoffConfig};
use crate::callbacks::{NoopCallbacks, PipelineCallbacks};
use crate::error::{PipelineError, Result};
use crate::model::{
    ClaimsTree, Comment, CruxesResult, LlmStageConfig, PartialTopic, SortStrategy, SortedTree,
    TopicSummary,
};
use crate::stages::claims::{ClaimsExecutor, ClaimsInput, ClaimsOutput, LlmClaimsExecutor};
use crate::stages::clustering::{
    ClusteringExecutor, ClusteringInput, ClusteringOutput, LlmClusteringExecutor,
};
use crate::stages::cruxes::{CruxesExecutor, CruxesInput, LlmCruxesExecutor};
use crate::stages::dedup::{DedupExecutor, DedupInput, DedupOutput, LlmDedupExecutor};
use crate::stages::summaries::{
    LlmSummariesExecutor, SummariesExecutor, SummariesInput, SummariesOutput,
};
use crate::stages::StageTelemetry;
use crate::state::{validate_cached, PipelineState, RunError, RunStatus, StepName, StepState, StepStatus};
use crate::store::StateStore;
use crate::wrapper::execute_step;
use reqwest::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// `{ comments, apiKey, clusteringConfig, claimsConfig, dedupConfig,
/// summariesConfig, cruxesConfig?, sortStrategy, enableCruxes }` (spec §6).
pub struct PipelineInput {
    pub comments: Vec<Comment>,
    pub clustering_config: LlmStageConfig,
    pub claims_config: LlmStageConfig,
    pub dedup_config: LlmStageConfig,
    pub summaries_config: LlmStageConfig,
    pub cruxes_config: Option<LlmStageConfig>,
    pub sort_strategy: String,
    pub enable_cruxes: bool,
    pub cruxes_top_k: u32,
}

/// `{ reportId, userId, resumeFromState?, lockValue?, onStepUpdate?, onProgress? }`.
pub struct RunConfig<'a> {
    pub report_id: String,
    pub user_id: String,
    pub resume_from_state: bool,
    pub pipeline_timeout: Duration,
    pub validation_failure_ceiling: u32,
    pub lock_lease_ms: u64,
    pub callbacks: &'a dyn PipelineCallbacks,
    pub cancel: Arc<AtomicBool>,
}

impl<'a> RunConfig<'a> {
    pub fn new(report_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            report_id: report_id.into(),
            user_id: user_id.into(),
            resume_from_state: false,
            pipeline_timeout: Duration::from_secs(1800),
            validation_failure_ceiling: 3,
            lock_lease_ms: 60_000,
            callbacks: &NoopCallbacks,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[derive(Debug)]
pub struct PipelineOutputs {
    pub topic_tree: Vec<PartialTopic>,
    pub claims_tree: ClaimsTree,
    pub sorted_tree: SortedTree,
    pub summaries: Vec<TopicSummary>,
    pub cruxes: Option<CruxesResult>,
}

#[derive(Debug)]
pub struct PipelineResult {
    pub success: bool,
    pub state: PipelineState,
    pub outputs: Option<PipelineOutputs>,
}

/// Bundled LLM-backed executors, built once per run from a shared
/// `Backend`/`Client`/`BackoffConfig` triple.
pub struct Executors {
    pub clustering: Box<dyn ClusteringExecutor>,
    pub claims: Box<dyn ClaimsExecutor>,
    pub dedup: Box<dyn DedupExecutor>,
    pub summaries: Box<dyn SummariesExecutor>,
    pub cruxes: Box<dyn CruxesExecutor>,
}

impl Executors {
    pub fn llm_backed(
        client: Client,
        base_url: String,
        backend: Arc<dyn Backend>,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            clustering: Box::new(LlmClusteringExecutor {
                client: client.clone(),
                base_url: base_url.clone(),
                backend: backend.clone(),
                backoff: backoff.clone(),
            }),
            claims: Box::new(LlmClaimsExecutor {
                client: client.clone(),
                base_url: base_url.clone(),
                backend: backend.clone(),
                backoff: backoff.clone(),
            }),
            dedup: Box::new(LlmDedupExecutor {
                client: client.clone(),
                base_url: base_url.clone(),
                backend: backend.clone(),
                backoff: backoff.clone(),
            }),
            summaries: Box::new(LlmSummariesExecutor {
                client: client.clone(),
                base_url: base_url.clone(),
                backend: backend.clone(),
                backoff: backoff.clone(),
            }),
            cruxes: Box::new(LlmCruxesExecutor {
                client,
                base_url,
                backend,
                backoff,
            }),
        }
    }
}

/// Pull a previously-cached, already-validated stage result back out of
/// `completed_results` as a typed value. Only ever called on entries
/// `validate_cached` has already accepted, so a deserialize failure here is
/// state corruption the validator missed — surfaced as `Internal`, not
/// `CorruptedState` (that variant is reserved for the resume-time check
/// itself, which has its own retry ceiling).
fn decode_cached<T: serde::de::DeserializeOwned>(
    state: &PipelineState,
    step: StepName,
) -> Result<T> {
    let value = state
        .completed_results
        .get(step.as_str())
        .cloned()
        .ok_or_else(|| PipelineError::MissingDependency {
            step: step.as_str().to_string(),
            dependency: step.as_str().to_string(),
        })?;
    serde_json::from_value(value)
        .map_err(|e| PipelineError::Internal(format!("cached '{step}' decode failed: {e}")))
}

fn is_done(state: &PipelineState, step: StepName) -> bool {
    state.has_cached(step)
        && matches!(
            state.step(step).and_then(|s| s.status),
            Some(StepStatus::Completed)
        )
}

/// `runPipeline(input, config, stateStore) → PipelineResult` (spec §6).
pub async fn run_pipeline(
    input: PipelineInput,
    config: RunConfig<'_>,
    store: &dyn StateStore,
    executors: &Executors,
) -> Result<PipelineResult> {
    let report_id = config.report_id.clone();
    let user_id = config.user_id.clone();

    let sort_strategy = SortStrategy::parse(&input.sort_strategy).ok_or_else(|| {
        PipelineError::InvalidInput(format!("unknown sort strategy '{}'", input.sort_strategy))
    })?;
    if input.comments.is_empty() {
        return Err(PipelineError::InvalidInput(
            "pipeline requires at least one comment".into(),
        ));
    }

    // Acquired here, not inside the raced future, so the timeout arm always
    // has the token in hand to release — spec §5's lock must be torn down
    // on every exit path, including timeout.
    let lock_token = store
        .acquire_pipeline_lock(&report_id, config.lock_lease_ms)
        .await?
        .ok_or_else(|| PipelineError::LockLost {
            report_id: report_id.clone(),
        })?;

    tokio::select! {
        result = run_pipeline_inner(input, &config, store, executors, sort_strategy, &lock_token) => result,
        _ = tokio::time::sleep(config.pipeline_timeout) => {
            config.cancel.store(true, Ordering::Relaxed);
            let _ = store.release_pipeline_lock(&report_id, &lock_token).await;
            handle_timeout(store, &report_id, &user_id).await
        }
    }
}

async fn handle_timeout(
    store: &dyn StateStore,
    report_id: &str,
    user_id: &str,
) -> Result<PipelineResult> {
    let mut state = store
        .get(report_id)
        .await?
        .unwrap_or_else(|| PipelineState::fresh(report_id, user_id));
    state.status = RunStatus::Failed;
    state.error = Some(RunError {
        message: "pipeline timed out".to_string(),
        name: PipelineError::Cancellation("timeout".to_string()).kind().to_string(),
        step: state.current_step.map(|s| s.as_str().to_string()),
    });
    // Best-effort: a lost lock here means another worker already owns
    // recovery, which is an acceptable outcome for a timed-out run.
    let _ = store.save(&state).await;
    Ok(PipelineResult {
        success: false,
        state,
        outputs: None,
    })
}

async fn run_pipeline_inner(
    input: PipelineInput,
    config: &RunConfig<'_>,
    store: &dyn StateStore,
    executors: &Executors,
    sort_strategy: SortStrategy,
    lock_token: &str,
) -> Result<PipelineResult> {
    let prepared: Result<PipelineState> = async {
        let mut state = if config.resume_from_state {
            let mut loaded = store.get(&config.report_id).await?.ok_or_else(|| {
                PipelineError::Internal("no_state_to_resume".to_string())
            })?;
            if loaded.status == RunStatus::Completed {
                return Err(PipelineError::Internal("already_completed".to_string()));
            }
            discard_corrupt_cache(&mut loaded, store, config).await?;
            loaded
        } else {
            PipelineState::fresh(&config.report_id, &config.user_id)
        };
        state.status = RunStatus::Running;
        verify_and_save(store, &config.report_id, lock_token, &state).await?;
        Ok(state)
    }
    .await;

    let mut state = match prepared {
        Ok(state) => state,
        Err(e) => {
            let _ = store.release_pipeline_lock(&config.report_id, lock_token).await;
            return Err(e);
        }
    };

    let total_steps: u32 = if input.enable_cruxes { 5 } else { 4 };
    let mut completed_steps = state
        .steps
        .values()
        .filter(|s| s.status == Some(StepStatus::Completed))
        .count() as u32;

    let telemetry = StageTelemetry {
        report_id: config.report_id.clone(),
        user_id: config.user_id.clone(),
    };

    let walk = walk_stages(
        &input,
        &mut state,
        store,
        executors,
        config,
        &telemetry,
        lock_token,
        sort_strategy,
        total_steps,
        &mut completed_steps,
    )
    .await;

    match walk {
        Err(e) => {
            let _ = store.release_pipeline_lock(&config.report_id, lock_token).await;
            Err(e)
        }
        Ok(outputs) => {
            state.status = RunStatus::Completed;
            state.current_step = None;
            verify_and_save(store, &config.report_id, lock_token, &state).await?;
            store.release_pipeline_lock(&config.report_id, lock_token).await?;
            Ok(PipelineResult {
                success: true,
                state,
                outputs: Some(outputs),
            })
        }
    }
}

async fn verify_and_save(
    store: &dyn StateStore,
    report_id: &str,
    lock_token: &str,
    state: &PipelineState,
) -> Result<()> {
    if !store.verify_pipeline_lock(report_id, lock_token).await? {
        return Err(PipelineError::LockLost {
            report_id: report_id.to_string(),
        });
    }
    store.save(state).await
}

/// Resume-time validation of every cached result (spec §4.4): a result
/// failing its structural shape check is discarded and its step reset to
/// `pending` so the walk re-runs it, unless the per-step failure counter
/// has already exceeded `validation_failure_ceiling`, in which case the
/// whole resume aborts with `corrupted_state`.
async fn discard_corrupt_cache(
    state: &mut PipelineState,
    store: &dyn StateStore,
    config: &RunConfig<'_>,
) -> Result<()> {
    for step in StepName::ALL {
        let Some(value) = state.completed_results.get(step.as_str()).cloned() else {
            continue;
        };
        if validate_cached(step, &value) {
            continue;
        }
        let count = store
            .increment_validation_failure(&config.report_id, step.as_str())
            .await?;
        if count > config.validation_failure_ceiling {
            return Err(PipelineError::CorruptedState {
                step: step.as_str().to_string(),
                reason: format!(
                    "cached result failed validation {count} times, exceeding ceiling of {}",
                    config.validation_failure_ceiling
                ),
            });
        }
        state.completed_results.remove(step.as_str());
        state.validation_failures.insert(step.as_str().to_string(), count);
        *state.step_mut(step) = StepState::pending();
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn walk_stages(
    input: &PipelineInput,
    state: &mut PipelineState,
    store: &dyn StateStore,
    executors: &Executors,
    config: &RunConfig<'_>,
    telemetry: &StageTelemetry,
    lock_token: &str,
    sort_strategy: SortStrategy,
    total_steps: u32,
    completed_steps: &mut u32,
) -> Result<PipelineOutputs> {
    macro_rules! bail_if_cancelled {
        () => {
            if config.cancel.load(Ordering::Relaxed) {
                return Err(PipelineError::Cancellation(
                    "pipeline cancelled".to_string(),
                ));
            }
        };
    }

    bail_if_cancelled!();
    let topic_tree: Vec<PartialTopic> = if is_done(state, StepName::Clustering) {
        decode_cached::<ClusteringOutput>(state, StepName::Clustering)?.data
    } else {
        let executor = &executors.clustering;
        let out = execute_step(
            store,
            config.callbacks,
            state,
            &config.report_id,
            lock_token,
            StepName::Clustering,
            total_steps,
            *completed_steps,
            || {
                executor.execute(ClusteringInput {
                    comments: input.comments.clone(),
                    llm_config: input.clustering_config.clone(),
                    telemetry: telemetry.clone(),
                })
            },
        )
        .await
        .map_err(|e| e.source)?;
        *completed_steps += 1;
        out.data
    };

    bail_if_cancelled!();
    let claims_tree: ClaimsTree = if is_done(state, StepName::Claims) {
        decode_cached::<ClaimsOutput>(state, StepName::Claims)?.data
    } else {
        let executor = &executors.claims;
        let taxonomy = topic_tree.clone();
        let comments = input.comments.clone();
        let llm_config = input.claims_config.clone();
        let out = execute_step(
            store,
            config.callbacks,
            state,
            &config.report_id,
            lock_token,
            StepName::Claims,
            total_steps,
            *completed_steps,
            || {
                executor.execute(ClaimsInput {
                    comments,
                    taxonomy,
                    llm_config,
                    telemetry: telemetry.clone(),
                })
            },
        )
        .await
        .map_err(|e| e.source)?;
        *completed_steps += 1;
        out.data
    };

    bail_if_cancelled!();
    let sorted_tree: SortedTree = if is_done(state, StepName::SortAndDeduplicate) {
        decode_cached::<DedupOutput>(state, StepName::SortAndDeduplicate)?.data
    } else {
        let executor = &executors.dedup;
        let tree = claims_tree.clone();
        let llm_config = input.dedup_config.clone();
        let out = execute_step(
            store,
            config.callbacks,
            state,
            &config.report_id,
            lock_token,
            StepName::SortAndDeduplicate,
            total_steps,
            *completed_steps,
            || {
                executor.execute(DedupInput {
                    tree,
                    llm_config,
                    sort_strategy,
                    telemetry: telemetry.clone(),
                })
            },
        )
        .await
        .map_err(|e| e.source)?;
        *completed_steps += 1;
        out.data
    };

    bail_if_cancelled!();
    let summaries: Vec<TopicSummary> = if is_done(state, StepName::Summaries) {
        decode_cached::<SummariesOutput>(state, StepName::Summaries)?.data
    } else {
        let executor = &executors.summaries;
        let tree = sorted_tree.clone();
        let llm_config = input.summaries_config.clone();
        let out = execute_step(
            store,
            config.callbacks,
            state,
            &config.report_id,
            lock_token,
            StepName::Summaries,
            total_steps,
            *completed_steps,
            || {
                executor.execute(SummariesInput {
                    tree,
                    llm_config,
                    telemetry: telemetry.clone(),
                })
            },
        )
        .await
        .map_err(|e| e.source)?;
        *completed_steps += 1;
        out.data
    };

    bail_if_cancelled!();
    let cruxes: Option<CruxesResult> = if !input.enable_cruxes {
        state.step_mut(StepName::Cruxes).status = Some(StepStatus::Skipped);
        crate::callbacks::fire_step_update(
            config.callbacks,
            StepName::Cruxes,
            crate::callbacks::StepUpdateStatus::Skipped,
        );
        None
    } else if is_done(state, StepName::Cruxes) {
        Some(decode_cached::<CruxesResult>(state, StepName::Cruxes)?)
    } else {
        let cruxes_config = input.cruxes_config.clone().ok_or_else(|| {
            PipelineError::InvalidInput(
                "cruxes enabled but no cruxesConfig supplied".to_string(),
            )
        })?;
        let executor = &executors.cruxes;
        let tree = claims_tree.clone();
        let topics = topic_tree.clone();
        let top_k = input.cruxes_top_k;
        let out = execute_step(
            store,
            config.callbacks,
            state,
            &config.report_id,
            lock_token,
            StepName::Cruxes,
            total_steps,
            *completed_steps,
            || {
                executor.execute(CruxesInput {
                    tree,
                    topics,
                    llm_config: cruxes_config,
                    top_k,
                    telemetry: telemetry.clone(),
                })
            },
        )
        .await
        .map_err(|e| e.source)?;
        *completed_steps += 1;
        Some(out)
    };

    if topic_tree.is_empty() {
        return Err(PipelineError::MissingOutput("topicTree".to_string()));
    }
    if summaries.is_empty() {
        return Err(PipelineError::MissingOutput("summaries".to_string()));
    }

    Ok(PipelineOutputs {
        topic_tree,
        claims_tree,
        sorted_tree,
        summaries,
        cruxes,
    })
}

/// `getPipelineStatus(reportId, stateStore) → PipelineState | null` (spec §6).
pub async fn get_pipeline_status(
    report_id: &str,
    store: &dyn StateStore,
) -> Result<Option<PipelineState>> {
    store.get(report_id).await
}

/// `cancelPipeline(reportId, stateStore) → bool` (spec §6). Cooperative only:
/// flips the run's recorded status and releases any held lock so a fresh
/// `run_pipeline` call can pick it back up; does not itself interrupt an
/// in-flight stage call — callers needing that must also flip the
/// `RunConfig::cancel` flag they passed in.
pub async fn cancel_pipeline(report_id: &str, store: &dyn StateStore) -> Result<bool> {
    let Some(mut state) = store.get(report_id).await? else {
        return Ok(false);
    };
    if matches!(state.status, RunStatus::Completed | RunStatus::Failed) {
        return Ok(false);
    }
    state.status = RunStatus::Failed;
    state.error = Some(RunError {
        message: "pipeline was cancelled".to_string(),
        name: PipelineError::Cancellation("cancelled".to_string()).kind().to_string(),
        step: state.current_step.map(|s| s.as_str().to_string()),
    });
    store.save(&state).await?;
    Ok(true)
}

/// `cleanupPipelineState(reportId, stateStore)` (spec §6): drop the durable
/// record entirely, e.g. after the caller has persisted the outputs
/// elsewhere and no longer needs resumability.
pub async fn cleanup_pipeline_state(report_id: &str, store: &dyn StateStore) -> Result<()> {
    store.delete(report_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BaseClaim, Subtopic};
    use crate::stages::claims::MockClaimsExecutor;
    use crate::stages::clustering::MockClusteringExecutor;
    use crate::stages::cruxes::MockCruxesExecutor;
    use crate::stages::dedup::MockDedupExecutor;
    use crate::stages::summaries::MockSummariesExecutor;
    use crate::store::InMemoryStateStore;

    fn mock_executors() -> Executors {
        Executors {
            clustering: Box::new(MockClusteringExecutor {
                topics: vec![PartialTopic {
                    topic_name: "Animals".into(),
                    topic_short_description: "".into(),
                    subtopics: vec![Subtopic {
                        subtopic_name: "Pets".into(),
                        subtopic_short_description: "".into(),
                    }],
                }],
            }),
            claims: Box::new(MockClaimsExecutor {
                claims: vec![BaseClaim {
                    claim: "Dogs are loyal".into(),
                    quote: "Dogs are loyal".into(),
                    speaker: "A".into(),
                    topic_name: "Animals".into(),
                    subtopic_name: "Pets".into(),
                    comment_id: "c1".into(),
                }],
            }),
            dedup: Box::new(MockDedupExecutor),
            summaries: Box::new(MockSummariesExecutor),
            cruxes: Box::new(MockCruxesExecutor),
        }
    }

    fn sample_input(enable_cruxes: bool) -> PipelineInput {
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
            cruxes_config: enable_cruxes.then(|| LlmStageConfig::new("m", "s", "${topic}")),
            sort_strategy: "speakers_then_claims".to_string(),
            enable_cruxes,
            cruxes_top_k: 3,
        }
    }

    #[tokio::test]
    async fn test_happy_path_cruxes_disabled() {
        let store = InMemoryStateStore::new();
        let executors = mock_executors();
        let config = RunConfig::new("r1", "u1");
        let result = run_pipeline(sample_input(false), config, &store, &executors)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.state.status, RunStatus::Completed);
        let outputs = result.outputs.unwrap();
        assert_eq!(outputs.topic_tree.len(), 1);
        assert_eq!(outputs.summaries.len(), 1);
        assert!(outputs.cruxes.is_none());
        assert_eq!(
            result.state.step(StepName::Cruxes).unwrap().status,
            Some(StepStatus::Skipped)
        );
    }

    #[tokio::test]
    async fn test_happy_path_cruxes_enabled() {
        let store = InMemoryStateStore::new();
        let executors = mock_executors();
        let config = RunConfig::new("r1", "u1");
        let result = run_pipeline(sample_input(true), config, &store, &executors)
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.outputs.unwrap().cruxes.is_some());
    }

    #[tokio::test]
    async fn test_resume_after_clustering_skips_completed_stage() {
        let store = InMemoryStateStore::new();
        let executors = mock_executors();

        // First run: let it fail deliberately after clustering by disabling
        // claims via an empty taxonomy check — simpler to just run it fully
        // once, then doctor the state back to "only clustering done" to
        // exercise the resume path in isolation.
        let config = RunConfig::new("r1", "u1");
        let full = run_pipeline(sample_input(false), config, &store, &executors)
            .await
            .unwrap();
        let mut state = full.state;
        for step in [
            StepName::Claims,
            StepName::SortAndDeduplicate,
            StepName::Summaries,
        ] {
            state.completed_results.remove(step.as_str());
            *state.step_mut(step) = StepState::pending();
        }
        state.status = RunStatus::Running;
        store.save(&state).await.unwrap();

        let mut resume_config = RunConfig::new("r1", "u1");
        resume_config.resume_from_state = true;
        let resumed = run_pipeline(sample_input(false), resume_config, &store, &executors)
            .await
            .unwrap();
        assert!(resumed.success);
        assert_eq!(
            resumed.state.step(StepName::Clustering).unwrap().status,
            Some(StepStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_resume_requires_existing_state() {
        let store = InMemoryStateStore::new();
        let executors = mock_executors();
        let mut config = RunConfig::new("missing", "u1");
        config.resume_from_state = true;
        let result = run_pipeline(sample_input(false), config, &store, &executors).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_rejects_empty_comments() {
        let store = InMemoryStateStore::new();
        let executors = mock_executors();
        let config = RunConfig::new("r1", "u1");
        let mut input = sample_input(false);
        input.comments.clear();
        let result = run_pipeline(input, config, &store, &executors).await;
        assert!(matches!(result, Err(PipelineError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_cancel_pipeline_marks_failed() {
        let store = InMemoryStateStore::new();
        store.save(&PipelineState::fresh("r1", "u1")).await.unwrap();
        let cancelled = cancel_pipeline("r1", &store).await.unwrap();
        assert!(cancelled);
        let state = store.get("r1").await.unwrap().unwrap();
        assert_eq!(state.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_pipeline_missing_report_returns_false() {
        let store = InMemoryStateStore::new();
        assert!(!cancel_pipeline("ghost", &store).await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_pipeline_state_deletes_record() {
        let store = InMemoryStateStore::new();
        store.save(&PipelineState::fresh("r1", "u1")).await.unwrap();
        cleanup_pipeline_state("r1", &store).await.unwrap();
        assert!(get_pipeline_status("r1", &store).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_marks_failed_without_hanging() {
        struct HangingClusteringExecutor;
        #[async_trait::async_trait]
        impl ClusteringExecutor for HangingClusteringExecutor {
            async fn execute(&self, _input: ClusteringInput) -> Result<ClusteringOutput> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!("timeout should have won the race")
            }
        }

        let store = InMemoryStateStore::new();
        let mut executors = mock_executors();
        executors.clustering = Box::new(HangingClusteringExecutor);

        let mut config = RunConfig::new("r1", "u1");
        config.pipeline_timeout = Duration::from_secs(1);

        let result = run_pipeline(sample_input(false), config, &store, &executors)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.state.status, RunStatus::Failed);
        assert_eq!(
            result.state.error.as_ref().unwrap().name,
            "cancellation"
        );
    }
}
