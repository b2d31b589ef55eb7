//! Cruxes stage: optional controversy-axis analysis over the claims tree.
//! Depends on both clustering's and claims' output directly (not on the
//! sorted tree) — skipped entirely when the caller disables it.

use super::{extract_usage, hydrate_template, map_backend_error, StageTelemetry};
use crate::backend::{with_backoff, Backend, BackoffConfig, ChatMessage, LlmRequest, Role};
use crate::error::{PipelineError, Result};
use crate::model::{ClaimsTree, CruxesResult, LlmStageConfig, PartialTopic};
use crate::output_parser::parse_json_value;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct CruxesInput {
    pub tree: ClaimsTree,
    pub topics: Vec<PartialTopic>,
    pub llm_config: LlmStageConfig,
    /// How many crux axes per subtopic the model should surface; exposed to
    /// the prompt as `${topK}` (spec §4.1) so the selection itself is the
    /// model's call, not a client-side truncation of an opaque result.
    pub top_k: u32,
    pub telemetry: StageTelemetry,
}

#[async_trait]
pub trait CruxesExecutor: Send + Sync {
    async fn execute(&self, input: CruxesInput) -> Result<CruxesResult>;
}

pub struct LlmCruxesExecutor {
    pub client: Client,
    pub base_url: String,
    pub backend: Arc<dyn Backend>,
    pub backoff: BackoffConfig,
}

#[async_trait]
impl CruxesExecutor for LlmCruxesExecutor {
    async fn execute(&self, input: CruxesInput) -> Result<CruxesResult> {
        if input.topics.is_empty() || input.tree.topics.is_empty() {
            return Err(PipelineError::InvalidInput(
                "cruxes requires both a non-empty taxonomy and a non-empty claims tree".into(),
            ));
        }

        let mut usage_total = crate::model::Usage::default();
        let mut subtopic_cruxes = serde_json::Map::new();
        let mut topic_scores = serde_json::Map::new();
        let mut speaker_crux_matrix = serde_json::Map::new();

        let top_k_text = input.top_k.to_string();
        for topic in &input.topics {
            let topic_text = serde_json::to_string(topic)?;
            let user_prompt = hydrate_template(
                &input.llm_config.user_prompt,
                &[("topic", &topic_text), ("topK", &top_k_text)],
            )?;

            let request = LlmRequest {
                model: input.llm_config.model_name.clone(),
                system_prompt: Some(input.llm_config.system_prompt.clone()),
                prompt: user_prompt,
                messages: vec![ChatMessage {
                    role: Role::User,
                    content: topic_text,
                }],
                config: crate::client::LlmConfig::default().with_json_mode(true),
                stream: false,
            };

            let response = with_backoff(
                &self.backend,
                &self.client,
                &self.base_url,
                &request,
                &self.backoff,
                None,
                None,
            )
            .await
            .map_err(map_backend_error)?;

            let parsed = parse_json_value(&response.text)
                .map_err(|e| PipelineError::UpstreamInvalidResponse(e.to_string()))?;

            subtopic_cruxes.insert(
                topic.topic_name.clone(),
                parsed.get("subtopicCruxes").cloned().unwrap_or(serde_json::Value::Null),
            );
            topic_scores.insert(
                topic.topic_name.clone(),
                parsed.get("topicScore").cloned().unwrap_or(serde_json::Value::Null),
            );
            speaker_crux_matrix.insert(
                topic.topic_name.clone(),
                parsed
                    .get("speakerCruxMatrix")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
            );
            usage_total.add(&extract_usage(&response.metadata));
        }

        Ok(CruxesResult {
            subtopic_cruxes: serde_json::Value::Object(subtopic_cruxes),
            topic_scores: serde_json::Value::Object(topic_scores),
            speaker_crux_matrix: serde_json::Value::Object(speaker_crux_matrix),
            usage: usage_total,
            cost: 0.0,
        })
    }
}

pub struct MockCruxesExecutor;

#[async_trait]
impl CruxesExecutor for MockCruxesExecutor {
    async fn execute(&self, input: CruxesInput) -> Result<CruxesResult> {
        if input.topics.is_empty() || input.tree.topics.is_empty() {
            return Err(PipelineError::InvalidInput(
                "cruxes requires both a non-empty taxonomy and a non-empty claims tree".into(),
            ));
        }
        Ok(CruxesResult {
            subtopic_cruxes: serde_json::json!({ "mock": true }),
            topic_scores: serde_json::json!({ "mock": true }),
            speaker_crux_matrix: serde_json::json!({ "mock": true }),
            usage: crate::model::Usage::new(30, 30),
            cost: 0.003,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BaseClaim, Subtopic};

    fn taxonomy() -> Vec<PartialTopic> {
        vec![PartialTopic {
            topic_name: "Animals".into(),
            topic_short_description: "".into(),
            subtopics: vec![Subtopic {
                subtopic_name: "Pets".into(),
                subtopic_short_description: "".into(),
            }],
        }]
    }

    fn tree() -> ClaimsTree {
        let mut tree = ClaimsTree::default();
        tree.insert(BaseClaim {
            claim: "x".into(),
            quote: "x".into(),
            speaker: "A".into(),
            topic_name: "Animals".into(),
            subtopic_name: "Pets".into(),
            comment_id: "c1".into(),
        });
        tree
    }

    #[tokio::test]
    async fn test_mock_cruxes_returns_opaque_shapes() {
        let executor = MockCruxesExecutor;
        let input = CruxesInput {
            tree: tree(),
            topics: taxonomy(),
            llm_config: LlmStageConfig::new("m", "s", "${topic}"),
            top_k: 3,
            telemetry: StageTelemetry {
                report_id: "r1".into(),
                user_id: "u1".into(),
            },
        };
        let result = executor.execute(input).await.unwrap();
        assert!(result.subtopic_cruxes.is_object());
        assert!(result.topic_scores.is_object());
        assert!(result.speaker_crux_matrix.is_object());
    }

    #[tokio::test]
    async fn test_cruxes_rejects_missing_taxonomy() {
        let executor = MockCruxesExecutor;
        let input = CruxesInput {
            tree: tree(),
            topics: vec![],
            llm_config: LlmStageConfig::new("m", "s", "${topic}"),
            top_k: 3,
            telemetry: StageTelemetry {
                report_id: "r1".into(),
                user_id: "u1".into(),
            },
        };
        let result = executor.execute(input).await;
        assert!(matches!(result, Err(PipelineError::InvalidInput(_))));
    }
}
