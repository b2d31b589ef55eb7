//! Step-execution wrapper (spec §4.3): the generic harness every stage runs
//! inside. Re-verifies the lock, marks lifecycle transitions, times the
//! executor call, validates the result's structural shape as a warning (not
//! a failure), caches the result, aggregates analytics, persists, and fires
//! callbacks — the same "wrap a bounded unit of work with retry/telemetry/
//! persistence" shape as the teacher's [`backend::with_backoff`], generalized
//! from transport retries to whole-stage lifecycle management.

use crate::callbacks::{fire_progress, fire_step_update, PipelineCallbacks, ProgressUpdate, StepUpdateStatus};
use crate::error::{PipelineError, PipelineStepError, Result};
use crate::model::Usage;
use crate::state::{validate_cached, PipelineState, RunError, RunStatus, StepError, StepName, StepStatus};
use crate::store::StateStore;
use serde::Serialize;
use std::future::Future;
use std::time::Instant;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Anything a stage executor can return: every stage output carries a usage
/// envelope and a cost scalar alongside its typed payload (spec §4.1's
/// uniform `{usage, cost}` analytics envelope).
pub trait StageResult: Serialize {
    fn usage(&self) -> Usage;
    fn cost(&self) -> f64;
}

impl StageResult for crate::stages::clustering::ClusteringOutput {
    fn usage(&self) -> Usage {
        self.usage
    }
    fn cost(&self) -> f64 {
        self.cost
    }
}

impl StageResult for crate::stages::claims::ClaimsOutput {
    fn usage(&self) -> Usage {
        self.usage
    }
    fn cost(&self) -> f64 {
        self.cost
    }
}

impl StageResult for crate::stages::dedup::DedupOutput {
    fn usage(&self) -> Usage {
        self.usage
    }
    fn cost(&self) -> f64 {
        self.cost
    }
}

impl StageResult for crate::stages::summaries::SummariesOutput {
    fn usage(&self) -> Usage {
        self.usage
    }
    fn cost(&self) -> f64 {
        self.cost
    }
}

impl StageResult for crate::model::CruxesResult {
    fn usage(&self) -> Usage {
        self.usage
    }
    fn cost(&self) -> f64 {
        self.cost
    }
}

fn step_error(step: StepName, source: PipelineError, state: &PipelineState) -> PipelineStepError {
    PipelineStepError {
        step: step.as_str().to_string(),
        source,
        state: state.clone(),
    }
}

/// Re-verify the lease and, only if it still holds, write `state`. Every
/// write in the wrapper and runner goes through this — spec §4.4 "lock
/// verification before every write".
async fn persist_locked(
    store: &dyn StateStore,
    report_id: &str,
    lock_token: &str,
    state: &PipelineState,
) -> Result<()> {
    let held = store.verify_pipeline_lock(report_id, lock_token).await?;
    if !held {
        return Err(PipelineError::LockLost {
            report_id: report_id.to_string(),
        });
    }
    store.save(state).await
}

/// Run one stage inside the full lifecycle harness. `completed_steps_so_far`
/// is the count *before* this step; on success the wrapper reports
/// `completed_steps_so_far + 1` in its progress callback.
pub async fn execute_step<T, Fut>(
    store: &dyn StateStore,
    callbacks: &dyn PipelineCallbacks,
    state: &mut PipelineState,
    report_id: &str,
    lock_token: &str,
    step: StepName,
    total_steps: u32,
    completed_steps_so_far: u32,
    run: impl FnOnce() -> Fut,
) -> std::result::Result<T, PipelineStepError>
where
    T: StageResult + Clone,
    Fut: Future<Output = Result<T>>,
{
    {
        let step_state = state.step_mut(step);
        step_state.status = Some(StepStatus::InProgress);
        step_state.started_at = Some(now_ms());
    }
    state.current_step = Some(step);

    if let Err(e) = persist_locked(store, report_id, lock_token, state).await {
        return Err(step_error(step, e, state));
    }
    fire_step_update(callbacks, step, StepUpdateStatus::InProgress);

    let started = Instant::now();
    let outcome = run().await;
    let elapsed_ms = started.elapsed().as_millis().max(1) as u64;

    match outcome {
        Err(e) => {
            {
                let step_state = state.step_mut(step);
                step_state.status = Some(StepStatus::Failed);
                step_state.completed_at = Some(now_ms());
                step_state.duration_ms = Some(elapsed_ms);
                step_state.error = Some(StepError {
                    message: e.to_string(),
                    name: e.kind().to_string(),
                });
            }
            state.status = RunStatus::Failed;
            state.error = Some(RunError {
                message: e.to_string(),
                name: e.kind().to_string(),
                step: Some(step.as_str().to_string()),
            });

            match persist_locked(store, report_id, lock_token, state).await {
                Ok(()) => {
                    fire_step_update(callbacks, step, StepUpdateStatus::Failed);
                    Err(step_error(step, e, state))
                }
                Err(persist_err) => Err(step_error(step, persist_err, state)),
            }
        }
        Ok(result) => {
            let value = match serde_json::to_value(&result) {
                Ok(value) => value,
                Err(e) => return Err(step_error(step, e.into(), state)),
            };
            if !validate_cached(step, &value) {
                tracing::warn!(
                    step = step.as_str(),
                    "stage output failed the structural shape check; caching anyway"
                );
            }

            state
                .completed_results
                .insert(step.as_str().to_string(), value);
            state.validation_failures.remove(step.as_str());

            let usage = result.usage();
            let cost = result.cost();
            {
                let step_state = state.step_mut(step);
                step_state.status = Some(StepStatus::Completed);
                step_state.completed_at = Some(now_ms());
                step_state.duration_ms = Some(elapsed_ms);
                step_state.input_tokens = Some(usage.input_tokens);
                step_state.output_tokens = Some(usage.output_tokens);
                step_state.total_tokens = Some(usage.total_tokens);
                step_state.cost = Some(cost);
            }
            state.total_duration_ms += elapsed_ms;
            state.total_tokens += usage.total_tokens;
            state.total_cost += cost;

            match persist_locked(store, report_id, lock_token, state).await {
                Ok(()) => {
                    if let Err(e) = store.reset_validation_failure(report_id, step.as_str()).await {
                        return Err(step_error(step, e, state));
                    }
                    fire_step_update(callbacks, step, StepUpdateStatus::Completed);
                    let completed_steps = completed_steps_so_far + 1;
                    let percent_complete =
                        ((completed_steps as f64 / total_steps as f64) * 100.0).round() as u32;
                    fire_progress(
                        callbacks,
                        ProgressUpdate {
                            current_step: step,
                            total_steps,
                            completed_steps,
                            percent_complete,
                        },
                    );
                    Ok(result)
                }
                Err(persist_err) => Err(step_error(step, persist_err, state)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::NoopCallbacks;
    use crate::model::{Comment, PartialTopic, Subtopic};
    use crate::stages::clustering::{ClusteringExecutor, ClusteringOutput, MockClusteringExecutor};
    use crate::store::InMemoryStateStore;

    fn sample_output() -> ClusteringOutput {
        ClusteringOutput {
            data: vec![PartialTopic {
                topic_name: "Animals".into(),
                topic_short_description: "".into(),
                subtopics: vec![Subtopic {
                    subtopic_name: "Pets".into(),
                    subtopic_short_description: "".into(),
                }],
            }],
            usage: Usage::new(10, 10),
            cost: 0.001,
        }
    }

    #[tokio::test]
    async fn test_execute_step_happy_path_caches_and_persists() {
        let store = InMemoryStateStore::new();
        let callbacks = NoopCallbacks;
        let mut state = PipelineState::fresh("r1", "u1");
        let token = store.acquire_pipeline_lock("r1", 60_000).await.unwrap().unwrap();

        let result = execute_step(
            &store,
            &callbacks,
            &mut state,
            "r1",
            &token,
            StepName::Clustering,
            5,
            0,
            || async { Ok(sample_output()) },
        )
        .await
        .unwrap();

        assert_eq!(result.data.len(), 1);
        assert!(state.has_cached(StepName::Clustering));
        assert_eq!(
            state.step(StepName::Clustering).unwrap().status,
            Some(StepStatus::Completed)
        );
        let persisted = store.get("r1").await.unwrap().unwrap();
        assert!(persisted.has_cached(StepName::Clustering));
    }

    #[tokio::test]
    async fn test_execute_step_failure_marks_failed_and_persists() {
        let store = InMemoryStateStore::new();
        let callbacks = NoopCallbacks;
        let mut state = PipelineState::fresh("r1", "u1");
        let token = store.acquire_pipeline_lock("r1", 60_000).await.unwrap().unwrap();

        let result = execute_step::<ClusteringOutput, _>(
            &store,
            &callbacks,
            &mut state,
            "r1",
            &token,
            StepName::Clustering,
            5,
            0,
            || async { Err(PipelineError::UpstreamRateLimited { message: "slow down".into(), retry_after: None }) },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(
            state.step(StepName::Clustering).unwrap().status,
            Some(StepStatus::Failed)
        );
        let persisted = store.get("r1").await.unwrap().unwrap();
        assert_eq!(persisted.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_execute_step_lock_lost_does_not_persist_completion() {
        let store = InMemoryStateStore::new();
        let callbacks = NoopCallbacks;
        let mut state = PipelineState::fresh("r1", "u1");
        let token = store.acquire_pipeline_lock("r1", 60_000).await.unwrap().unwrap();

        let outcome = execute_step(
            &store,
            &callbacks,
            &mut state,
            "r1",
            &token,
            StepName::Claims,
            5,
            0,
            || async {
                // Simulate another worker stealing the lease while the
                // executor was in flight.
                store.expire_lock_for_test("r1");
                Ok(sample_output())
            },
        )
        .await;

        assert!(outcome.is_err());
        let persisted = store.get("r1").await.unwrap().unwrap();
        assert!(!persisted.has_cached(StepName::Claims));
    }

    #[tokio::test]
    async fn test_mock_executor_via_wrapper_fires_no_callbacks_on_noop() {
        let store = InMemoryStateStore::new();
        let callbacks = NoopCallbacks;
        let mut state = PipelineState::fresh("r1", "u1");
        let token = store.acquire_pipeline_lock("r1", 60_000).await.unwrap().unwrap();
        let executor = MockClusteringExecutor {
            topics: sample_output().data,
        };
        let input = crate::stages::clustering::ClusteringInput {
            comments: vec![Comment {
                id: "c1".into(),
                text: "Dogs are loyal".into(),
                speaker: "A".into(),
            }],
            llm_config: crate::model::LlmStageConfig::new("m", "s", "${comments}"),
            telemetry: crate::stages::StageTelemetry {
                report_id: "r1".into(),
                user_id: "u1".into(),
            },
        };
        let result = execute_step(
            &store,
            &callbacks,
            &mut state,
            "r1",
            &token,
            StepName::Clustering,
            5,
            0,
            || async move { executor.execute(input).await },
        )
        .await
        .unwrap();
        assert_eq!(result.data.len(), 1);
    }
}
