//! `sort_and_deduplicate` stage: collapses near-duplicate claims within each
//! subtopic and orders the tree top-to-bottom by a chosen [`SortStrategy`].
//! Depends on the claims stage's output.

use super::{extract_usage, hydrate_template, map_backend_error, StageTelemetry};
use crate::backend::{with_backoff, Backend, BackoffConfig, ChatMessage, LlmRequest, Role};
use crate::error::{PipelineError, Result};
use crate::model::{
    BaseClaim, ClaimWithDuplicates, ClaimsTree, Counts, LlmStageConfig, SortStrategy,
    SortedSubtopic, SortedTopic, SortedTree, Usage,
};
use crate::output_parser::parse_json;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct DedupInput {
    pub tree: ClaimsTree,
    pub llm_config: LlmStageConfig,
    pub sort_strategy: SortStrategy,
    pub telemetry: StageTelemetry,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DedupOutput {
    pub data: SortedTree,
    pub usage: Usage,
    pub cost: f64,
}

#[async_trait]
pub trait DedupExecutor: Send + Sync {
    async fn execute(&self, input: DedupInput) -> Result<DedupOutput>;
}

fn counts_for(groups: &[ClaimWithDuplicates]) -> Counts {
    let mut speakers = HashSet::new();
    let mut claims = 0usize;
    for group in groups {
        speakers.insert(group.claim.speaker.as_str());
        claims += 1;
        for dup in &group.duplicates {
            speakers.insert(dup.speaker.as_str());
            claims += 1;
        }
    }
    Counts {
        claims,
        speakers: speakers.len(),
    }
}

/// Order topics, then their subtopics, by `strategy`. Ties break on name
/// ascending so identical counts always produce identical order (spec §9
/// Open Question 2).
pub fn sort_tree(mut tree: SortedTree, strategy: SortStrategy) -> SortedTree {
    let key = |counts: &Counts, name: &str| -> (i64, i64, String) {
        match strategy {
            SortStrategy::SpeakersThenClaims => {
                (-(counts.speakers as i64), -(counts.claims as i64), name.to_string())
            }
            SortStrategy::ClaimsThenSpeakers => {
                (-(counts.claims as i64), -(counts.speakers as i64), name.to_string())
            }
            SortStrategy::Alphabetical => (0, 0, name.to_string()),
        }
    };

    for topic in tree.topics.iter_mut() {
        topic
            .topics
            .sort_by(|a, b| key(&a.counts, &a.subtopic_name).cmp(&key(&b.counts, &b.subtopic_name)));
    }
    tree.topics
        .sort_by(|a, b| key(&a.counts, &a.topic_name).cmp(&key(&b.counts, &b.topic_name)));
    tree
}

pub struct LlmDedupExecutor {
    pub client: Client,
    pub base_url: String,
    pub backend: Arc<dyn Backend>,
    pub backoff: BackoffConfig,
}

#[async_trait]
impl DedupExecutor for LlmDedupExecutor {
    async fn execute(&self, input: DedupInput) -> Result<DedupOutput> {
        if input.tree.topics.is_empty() {
            return Err(PipelineError::InvalidInput(
                "sort_and_deduplicate requires a non-empty claims tree".into(),
            ));
        }

        let mut usage_total = Usage::default();
        let mut sorted_topics = Vec::new();

        for (topic_name, topic_claims) in &input.tree.topics {
            let mut sorted_subtopics = Vec::new();
            for (subtopic_name, subtopic_claims) in &topic_claims.subtopics {
                if subtopic_claims.claims.is_empty() {
                    continue;
                }
                let claims_text = serde_json::to_string(&subtopic_claims.claims)?;
                let user_prompt =
                    hydrate_template(&input.llm_config.user_prompt, &[("claims", &claims_text)])?;

                let request = LlmRequest {
                    model: input.llm_config.model_name.clone(),
                    system_prompt: Some(input.llm_config.system_prompt.clone()),
                    prompt: user_prompt,
                    messages: vec![ChatMessage {
                        role: Role::User,
                        content: claims_text,
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

                let groups: Vec<ClaimWithDuplicates> = parse_json(&response.text)
                    .map_err(|e| PipelineError::UpstreamInvalidResponse(e.to_string()))?;
                usage_total.add(&extract_usage(&response.metadata));

                sorted_subtopics.push(SortedSubtopic {
                    subtopic_name: subtopic_name.clone(),
                    counts: counts_for(&groups),
                    claims: groups,
                });
            }

            let topic_counts = Counts {
                claims: sorted_subtopics.iter().map(|s| s.counts.claims).sum(),
                speakers: sorted_subtopics
                    .iter()
                    .flat_map(|s| s.claims.iter())
                    .flat_map(|g| std::iter::once(&g.claim).chain(g.duplicates.iter()))
                    .map(|c| c.speaker.as_str())
                    .collect::<HashSet<_>>()
                    .len(),
            };

            sorted_topics.push(SortedTopic {
                topic_name: topic_name.clone(),
                counts: topic_counts,
                topics: sorted_subtopics,
            });
        }

        let tree = sort_tree(SortedTree { topics: sorted_topics }, input.sort_strategy);

        Ok(DedupOutput {
            data: tree,
            usage: usage_total,
            cost: 0.0,
        })
    }
}

pub struct MockDedupExecutor;

#[async_trait]
impl DedupExecutor for MockDedupExecutor {
    async fn execute(&self, input: DedupInput) -> Result<DedupOutput> {
        if input.tree.topics.is_empty() {
            return Err(PipelineError::InvalidInput(
                "sort_and_deduplicate requires a non-empty claims tree".into(),
            ));
        }
        let mut sorted_topics = Vec::new();
        for (topic_name, topic_claims) in &input.tree.topics {
            let mut sorted_subtopics = Vec::new();
            for (subtopic_name, subtopic_claims) in &topic_claims.subtopics {
                let groups: Vec<ClaimWithDuplicates> = subtopic_claims
                    .claims
                    .iter()
                    .cloned()
                    .map(|c| ClaimWithDuplicates {
                        claim: c,
                        duplicates: Vec::new(),
                    })
                    .collect();
                sorted_subtopics.push(SortedSubtopic {
                    subtopic_name: subtopic_name.clone(),
                    counts: counts_for(&groups),
                    claims: groups,
                });
            }
            let topic_counts = Counts {
                claims: sorted_subtopics.iter().map(|s| s.counts.claims).sum(),
                speakers: sorted_subtopics.iter().map(|s| s.counts.speakers).sum(),
            };
            sorted_topics.push(SortedTopic {
                topic_name: topic_name.clone(),
                counts: topic_counts,
                topics: sorted_subtopics,
            });
        }
        let tree = sort_tree(SortedTree { topics: sorted_topics }, input.sort_strategy);
        Ok(DedupOutput {
            data: tree,
            usage: Usage::new(15, 15),
            cost: 0.001,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(speaker: &str, id: &str) -> BaseClaim {
        BaseClaim {
            claim: "x".into(),
            quote: "x".into(),
            speaker: speaker.into(),
            topic_name: "Animals".into(),
            subtopic_name: "Pets".into(),
            comment_id: id.into(),
        }
    }

    fn tree() -> ClaimsTree {
        let mut tree = ClaimsTree::default();
        tree.insert(claim("A", "c1"));
        tree.insert(claim("B", "c2"));
        tree
    }

    #[tokio::test]
    async fn test_mock_dedup_produces_sorted_tree() {
        let executor = MockDedupExecutor;
        let input = DedupInput {
            tree: tree(),
            llm_config: LlmStageConfig::new("m", "s", "${claims}"),
            sort_strategy: SortStrategy::SpeakersThenClaims,
            telemetry: StageTelemetry {
                report_id: "r1".into(),
                user_id: "u1".into(),
            },
        };
        let output = executor.execute(input).await.unwrap();
        assert_eq!(output.data.topics.len(), 1);
        assert_eq!(output.data.topics[0].counts.claims, 2);
        assert_eq!(output.data.topics[0].counts.speakers, 2);
    }

    #[tokio::test]
    async fn test_dedup_rejects_empty_tree() {
        let executor = MockDedupExecutor;
        let input = DedupInput {
            tree: ClaimsTree::default(),
            llm_config: LlmStageConfig::new("m", "s", "${claims}"),
            sort_strategy: SortStrategy::Alphabetical,
            telemetry: StageTelemetry {
                report_id: "r1".into(),
                user_id: "u1".into(),
            },
        };
        let result = executor.execute(input).await;
        assert!(matches!(result, Err(PipelineError::InvalidInput(_))));
    }

    #[test]
    fn test_sort_tree_alphabetical_is_name_ascending() {
        let tree = SortedTree {
            topics: vec![
                SortedTopic {
                    topic_name: "Zebras".into(),
                    counts: Counts::default(),
                    topics: vec![],
                },
                SortedTopic {
                    topic_name: "Ants".into(),
                    counts: Counts::default(),
                    topics: vec![],
                },
            ],
        };
        let sorted = sort_tree(tree, SortStrategy::Alphabetical);
        assert_eq!(sorted.topics[0].topic_name, "Ants");
        assert_eq!(sorted.topics[1].topic_name, "Zebras");
    }

    #[test]
    fn test_sort_tree_speakers_then_claims_descending() {
        let tree = SortedTree {
            topics: vec![
                SortedTopic {
                    topic_name: "Low".into(),
                    counts: Counts { claims: 1, speakers: 1 },
                    topics: vec![],
                },
                SortedTopic {
                    topic_name: "High".into(),
                    counts: Counts { claims: 5, speakers: 3 },
                    topics: vec![],
                },
            ],
        };
        let sorted = sort_tree(tree, SortStrategy::SpeakersThenClaims);
        assert_eq!(sorted.topics[0].topic_name, "High");
    }
}
