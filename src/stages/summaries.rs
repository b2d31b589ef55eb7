//! Summaries stage: one free-text narrative per topic, derived from the
//! sorted-and-deduplicated tree. Depends on `sort_and_deduplicate`'s output.

use super::{extract_usage, hydrate_template, map_backend_error, StageTelemetry};
use crate::backend::{with_backoff, Backend, BackoffConfig, ChatMessage, LlmRequest, Role};
use crate::error::{PipelineError, Result};
use crate::model::{LlmStageConfig, SortedTree, TopicSummary, Usage};
use crate::output_parser::parse_text;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SummariesInput {
    pub tree: SortedTree,
    pub llm_config: LlmStageConfig,
    pub telemetry: StageTelemetry,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SummariesOutput {
    pub data: Vec<TopicSummary>,
    pub usage: Usage,
    pub cost: f64,
}

#[async_trait]
pub trait SummariesExecutor: Send + Sync {
    async fn execute(&self, input: SummariesInput) -> Result<SummariesOutput>;
}

pub struct LlmSummariesExecutor {
    pub client: Client,
    pub base_url: String,
    pub backend: Arc<dyn Backend>,
    pub backoff: BackoffConfig,
}

#[async_trait]
impl SummariesExecutor for LlmSummariesExecutor {
    async fn execute(&self, input: SummariesInput) -> Result<SummariesOutput> {
        if input.tree.topics.is_empty() {
            return Err(PipelineError::InvalidInput(
                "summaries requires a non-empty sorted tree".into(),
            ));
        }

        let mut usage_total = Usage::default();
        let mut summaries = Vec::new();

        for topic in &input.tree.topics {
            let topic_text = serde_json::to_string(topic)?;
            let user_prompt =
                hydrate_template(&input.llm_config.user_prompt, &[("topic", &topic_text)])?;

            let request = LlmRequest {
                model: input.llm_config.model_name.clone(),
                system_prompt: Some(input.llm_config.system_prompt.clone()),
                prompt: user_prompt,
                messages: vec![ChatMessage {
                    role: Role::User,
                    content: topic_text,
                }],
                config: crate::client::LlmConfig::default(),
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

            let summary = parse_text(&response.text).map_err(|e| {
                PipelineError::UpstreamInvalidResponse(format!(
                    "empty summary for topic '{}': {e}",
                    topic.topic_name
                ))
            })?;

            summaries.push(TopicSummary {
                topic_name: topic.topic_name.clone(),
                summary,
            });
            usage_total.add(&extract_usage(&response.metadata));
        }

        Ok(SummariesOutput {
            data: summaries,
            usage: usage_total,
            cost: 0.0,
        })
    }
}

pub struct MockSummariesExecutor;

#[async_trait]
impl SummariesExecutor for MockSummariesExecutor {
    async fn execute(&self, input: SummariesInput) -> Result<SummariesOutput> {
        if input.tree.topics.is_empty() {
            return Err(PipelineError::InvalidInput(
                "summaries requires a non-empty sorted tree".into(),
            ));
        }
        let data = input
            .tree
            .topics
            .iter()
            .map(|t| TopicSummary {
                topic_name: t.topic_name.clone(),
                summary: format!("Summary of {}", t.topic_name),
            })
            .collect();
        Ok(SummariesOutput {
            data,
            usage: Usage::new(8, 8),
            cost: 0.0008,
        })
    }
}
