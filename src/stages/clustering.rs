//! Clustering stage: comments in, a topic/subtopic taxonomy out. First stage
//! in the DAG, no dependencies.

use super::{extract_usage, hydrate_template, map_backend_error, StageTelemetry};
use crate::backend::{with_backoff, Backend, BackoffConfig, ChatMessage, LlmRequest, Role};
use crate::error::{PipelineError, Result};
use crate::model::{Comment, LlmStageConfig, PartialTopic, Usage};
use crate::output_parser::parse_json;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ClusteringInput {
    pub comments: Vec<Comment>,
    pub llm_config: LlmStageConfig,
    pub telemetry: StageTelemetry,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClusteringOutput {
    pub data: Vec<PartialTopic>,
    pub usage: Usage,
    pub cost: f64,
}

/// Object-safe contract every clustering implementation satisfies — the
/// default LLM-backed [`LlmClusteringExecutor`] and a deterministic mock for
/// tests.
#[async_trait]
pub trait ClusteringExecutor: Send + Sync {
    async fn execute(&self, input: ClusteringInput) -> Result<ClusteringOutput>;
}

/// Default clustering executor: hydrates `${comments}` into the user prompt,
/// calls the LLM, defensively parses the JSON array response.
pub struct LlmClusteringExecutor {
    pub client: Client,
    pub base_url: String,
    pub backend: Arc<dyn Backend>,
    pub backoff: BackoffConfig,
}

#[async_trait]
impl ClusteringExecutor for LlmClusteringExecutor {
    async fn execute(&self, input: ClusteringInput) -> Result<ClusteringOutput> {
        if input.comments.is_empty() {
            return Err(PipelineError::InvalidInput(
                "clustering requires at least one comment".into(),
            ));
        }

        let comments_text = input
            .comments
            .iter()
            .map(|c| format!("[{}] ({}): {}", c.id, c.speaker, c.text))
            .collect::<Vec<_>>()
            .join("\n");

        let user_prompt =
            hydrate_template(&input.llm_config.user_prompt, &[("comments", &comments_text)])?;

        let request = LlmRequest {
            model: input.llm_config.model_name.clone(),
            system_prompt: Some(input.llm_config.system_prompt.clone()),
            prompt: user_prompt,
            messages: vec![ChatMessage {
                role: Role::User,
                content: comments_text,
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

        let data: Vec<PartialTopic> = parse_json(&response.text)
            .map_err(|e| PipelineError::UpstreamInvalidResponse(e.to_string()))?;

        Ok(ClusteringOutput {
            data,
            usage: extract_usage(&response.metadata),
            cost: 0.0,
        })
    }
}

/// Deterministic substitute for tests: returns a fixed taxonomy regardless
/// of input, mirroring the role of [`crate::backend::MockBackend`].
pub struct MockClusteringExecutor {
    pub topics: Vec<PartialTopic>,
}

#[async_trait]
impl ClusteringExecutor for MockClusteringExecutor {
    async fn execute(&self, input: ClusteringInput) -> Result<ClusteringOutput> {
        if input.comments.is_empty() {
            return Err(PipelineError::InvalidInput(
                "clustering requires at least one comment".into(),
            ));
        }
        Ok(ClusteringOutput {
            data: self.topics.clone(),
            usage: Usage::new(10, 10),
            cost: 0.001,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Subtopic;

    fn sample_topics() -> Vec<PartialTopic> {
        vec![PartialTopic {
            topic_name: "Animals".into(),
            topic_short_description: "Pets and wildlife".into(),
            subtopics: vec![Subtopic {
                subtopic_name: "Pets".into(),
                subtopic_short_description: "Domesticated animals".into(),
            }],
        }]
    }

    #[tokio::test]
    async fn test_mock_clustering_returns_fixed_taxonomy() {
        let executor = MockClusteringExecutor {
            topics: sample_topics(),
        };
        let input = ClusteringInput {
            comments: vec![Comment {
                id: "c1".into(),
                text: "Dogs are loyal".into(),
                speaker: "A".into(),
            }],
            llm_config: LlmStageConfig::new("test-model", "sys", "${comments}"),
            telemetry: StageTelemetry {
                report_id: "r1".into(),
                user_id: "u1".into(),
            },
        };
        let output = executor.execute(input).await.unwrap();
        assert_eq!(output.data.len(), 1);
        assert_eq!(output.data[0].topic_name, "Animals");
    }

    #[tokio::test]
    async fn test_clustering_rejects_empty_comments() {
        let executor = MockClusteringExecutor {
            topics: sample_topics(),
        };
        let input = ClusteringInput {
            comments: vec![],
            llm_config: LlmStageConfig::new("test-model", "sys", "${comments}"),
            telemetry: StageTelemetry {
                report_id: "r1".into(),
                user_id: "u1".into(),
            },
        };
        let result = executor.execute(input).await;
        assert!(matches!(result, Err(PipelineError::InvalidInput(_))));
    }
}
