//! Claims stage: extracts atomic claims per comment and attaches them to the
//! clustering taxonomy. Depends on clustering's output.

use super::{extract_usage, hydrate_template, map_backend_error, StageTelemetry};
use crate::backend::{with_backoff, Backend, BackoffConfig, ChatMessage, LlmRequest, Role};
use crate::error::{PipelineError, Result};
use crate::model::{BaseClaim, ClaimsTree, Comment, LlmStageConfig, PartialTopic, Usage};
use crate::output_parser::parse_json;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ClaimsInput {
    pub comments: Vec<Comment>,
    pub taxonomy: Vec<PartialTopic>,
    pub llm_config: LlmStageConfig,
    pub telemetry: StageTelemetry,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClaimsOutput {
    pub data: ClaimsTree,
    pub usage: Usage,
    pub cost: f64,
    /// Count of claims dropped for failing referential integrity. Additive
    /// diagnostic (SPEC_FULL §2) — the typed contract (`data: ClaimsTree`)
    /// is unchanged; the wrapper logs this at `warn` level.
    #[serde(skip)]
    pub dropped: usize,
}

#[async_trait]
pub trait ClaimsExecutor: Send + Sync {
    async fn execute(&self, input: ClaimsInput) -> Result<ClaimsOutput>;
}

/// Drop claims whose `(topic_name, subtopic_name)` isn't present in
/// `taxonomy` or whose `comment_id` isn't present in `comments`. Per spec
/// §4.1: "a claim failing either rule is dropped with a warning, not an
/// error."
pub fn filter_referentially_valid(
    claims: Vec<BaseClaim>,
    taxonomy: &[PartialTopic],
    comments: &[Comment],
) -> (ClaimsTree, usize) {
    let comment_ids: HashSet<&str> = comments.iter().map(|c| c.id.as_str()).collect();
    let mut tree = ClaimsTree::default();
    let mut dropped = 0;
    for claim in claims {
        let topic_valid = taxonomy
            .iter()
            .find(|t| t.topic_name == claim.topic_name)
            .is_some_and(|t| t.has_subtopic(&claim.subtopic_name));
        let comment_valid = comment_ids.contains(claim.comment_id.as_str());
        if topic_valid && comment_valid {
            tree.insert(claim);
        } else {
            dropped += 1;
        }
    }
    (tree, dropped)
}

pub struct LlmClaimsExecutor {
    pub client: Client,
    pub base_url: String,
    pub backend: Arc<dyn Backend>,
    pub backoff: BackoffConfig,
}

#[async_trait]
impl ClaimsExecutor for LlmClaimsExecutor {
    async fn execute(&self, input: ClaimsInput) -> Result<ClaimsOutput> {
        if input.taxonomy.is_empty() {
            return Err(PipelineError::InvalidInput(
                "claims requires a non-empty taxonomy".into(),
            ));
        }

        let taxonomy_text = serde_json::to_string(&input.taxonomy)?;
        let mut usage_total = Usage::default();
        let mut all_claims = Vec::new();

        for comment in &input.comments {
            let user_prompt = hydrate_template(
                &input.llm_config.user_prompt,
                &[("taxonomy", &taxonomy_text), ("comment", &comment.text)],
            )?;

            let request = LlmRequest {
                model: input.llm_config.model_name.clone(),
                system_prompt: Some(input.llm_config.system_prompt.clone()),
                prompt: user_prompt,
                messages: vec![ChatMessage {
                    role: Role::User,
                    content: comment.text.clone(),
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

            let claims: Vec<BaseClaim> = parse_json(&response.text)
                .map_err(|e| PipelineError::UpstreamInvalidResponse(e.to_string()))?;
            all_claims.extend(claims);
            usage_total.add(&extract_usage(&response.metadata));
        }

        let (data, dropped) =
            filter_referentially_valid(all_claims, &input.taxonomy, &input.comments);

        Ok(ClaimsOutput {
            data,
            usage: usage_total,
            cost: 0.0,
            dropped,
        })
    }
}

pub struct MockClaimsExecutor {
    pub claims: Vec<BaseClaim>,
}

#[async_trait]
impl ClaimsExecutor for MockClaimsExecutor {
    async fn execute(&self, input: ClaimsInput) -> Result<ClaimsOutput> {
        if input.taxonomy.is_empty() {
            return Err(PipelineError::InvalidInput(
                "claims requires a non-empty taxonomy".into(),
            ));
        }
        let (data, dropped) =
            filter_referentially_valid(self.claims.clone(), &input.taxonomy, &input.comments);
        Ok(ClaimsOutput {
            data,
            usage: Usage::new(20, 20),
            cost: 0.002,
            dropped,
        })
    }
}
