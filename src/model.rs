//! Shared typed shapes flowing through the pipeline: comments, the clustering
//! taxonomy, claims and their trees, summaries, cruxes, and usage accounting.
//!
//! Mirrors the teacher's `types.rs` in derive conventions (`Serialize` +
//! `Deserialize` on every wire shape, builder methods on the types callers
//! construct by hand) but the shapes themselves are specific to this
//! pipeline's five-stage DAG rather than a generic `T`-typed chain.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One participant utterance. Immutable pipeline input.
///
/// Invariant: `id` is unique within a run; `text` is non-empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Comment {
    pub id: String,
    pub text: String,
    pub speaker: String,
}

/// Per-stage LLM configuration: model name plus the system/user prompt
/// templates. The user prompt is hydrated with a closed set of named
/// `${placeholder}` variables enumerated per stage (see `stages` module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmStageConfig {
    pub model_name: String,
    pub system_prompt: String,
    pub user_prompt: String,
}

impl LlmStageConfig {
    pub fn new(
        model_name: impl Into<String>,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
        }
    }
}

/// The clustering stage's output: a topic with its subtopics, no IDs yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subtopic {
    pub subtopic_name: String,
    pub subtopic_short_description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartialTopic {
    pub topic_name: String,
    pub topic_short_description: String,
    pub subtopics: Vec<Subtopic>,
}

impl PartialTopic {
    /// Whether `(topic_name, subtopic_name)` names a subtopic under this topic.
    pub fn has_subtopic(&self, subtopic_name: &str) -> bool {
        self.subtopics.iter().any(|s| s.subtopic_name == subtopic_name)
    }
}

/// An atomic, debatable position attributed to a comment, bound to a
/// `(topic, subtopic)` pair produced by the clustering stage.
///
/// Invariant (enforced by the claims stage executor, not at construction):
/// `topic_name`/`subtopic_name` must reference a pair present in the
/// clustering output; `comment_id` must reference an input comment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BaseClaim {
    pub claim: String,
    pub quote: String,
    pub speaker: String,
    pub topic_name: String,
    pub subtopic_name: String,
    pub comment_id: String,
}

/// Claims grouped under a subtopic, with a running total.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SubtopicClaims {
    pub total: usize,
    pub claims: Vec<BaseClaim>,
}

/// Claims grouped under a topic, with a running total over its subtopics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TopicClaims {
    pub total: usize,
    pub subtopics: HashMap<String, SubtopicClaims>,
}

/// `topicName -> { total, subtopics: subtopicName -> { total, claims } }`.
/// Mapping key order is not significant; `total` at every level equals the
/// sum of the claim counts beneath it.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ClaimsTree {
    pub topics: HashMap<String, TopicClaims>,
}

impl ClaimsTree {
    /// Total claim count across the whole tree.
    pub fn total(&self) -> usize {
        self.topics.values().map(|t| t.total).sum()
    }

    /// Insert a validated claim, updating totals along the way. Callers are
    /// responsible for referential-integrity checks before calling this —
    /// see `stages::claims`.
    pub fn insert(&mut self, claim: BaseClaim) {
        let topic = self.topics.entry(claim.topic_name.clone()).or_default();
        let subtopic = topic
            .subtopics
            .entry(claim.subtopic_name.clone())
            .or_default();
        subtopic.claims.push(claim);
        subtopic.total = subtopic.claims.len();
        topic.total = topic.subtopics.values().map(|s| s.total).sum();
    }
}

/// A claim plus the list of near-duplicate claims absorbed under it during
/// `sort_and_deduplicate`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaimWithDuplicates {
    pub claim: BaseClaim,
    pub duplicates: Vec<BaseClaim>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Counts {
    pub claims: usize,
    pub speakers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SortedSubtopic {
    pub subtopic_name: String,
    pub counts: Counts,
    pub claims: Vec<ClaimWithDuplicates>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SortedTopic {
    pub topic_name: String,
    pub counts: Counts,
    pub topics: Vec<SortedSubtopic>,
}

/// `ClaimsTree` with deduplication applied, ordered top-to-bottom by
/// [`crate::model::SortStrategy`]'s documented tie-break rule, and
/// speaker-counted.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SortedTree {
    pub topics: Vec<SortedTopic>,
}

/// One free-text narrative per topic, ≤ 140 words.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicSummary {
    pub topic_name: String,
    pub summary: String,
}

/// The crux stage's result. Per spec §9 / Open Question 3, the first three
/// fields are opaque JSON shapes to the runner — it only asserts presence,
/// never shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CruxesResult {
    pub subtopic_cruxes: serde_json::Value,
    pub topic_scores: serde_json::Value,
    pub speaker_crux_matrix: serde_json::Value,
    pub usage: Usage,
    pub cost: f64,
}

/// Token accounting returned by every stage. Aggregates are summed into
/// `PipelineState` totals by the step-execution wrapper.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Closed set of sort-strategy identifiers accepted by `sort_and_deduplicate`.
/// Resolves spec §9 Open Question 2 with a documented deterministic total
/// order: primary key descending, secondary key descending, final tie-break
/// by name ascending, so identical input counts always produce identical
/// output order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortStrategy {
    /// Sort by unique-speaker count, then claim count, both descending.
    SpeakersThenClaims,
    /// Sort by claim count, then unique-speaker count, both descending.
    ClaimsThenSpeakers,
    /// Sort by topic/subtopic name, ascending.
    Alphabetical,
}

impl SortStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "speakers_then_claims" => Some(Self::SpeakersThenClaims),
            "claims_then_speakers" => Some(Self::ClaimsThenSpeakers),
            "alphabetical" => Some(Self::Alphabetical),
            _ => None,
        }
    }
}
