//! The durable per-report record: `PipelineState`. Captures pipeline status,
//! per-stage lifecycle, cached stage outputs, analytics aggregates, and the
//! corruption-retry counters the runner consults on resume.
//!
//! Structured the way `examples/other_examples/.../decision-gate-core`'s
//! `core::state` module documents its invariants — a `# Invariants` doc
//! block on the aggregate type, one line per invariant — generalized here
//! to a mutable-with-versioning record rather than an append-only log,
//! since the pipeline state is replaced wholesale on every write (spec
//! §4.2: `save(state)` is "atomic replace of the JSON blob", not an event
//! append).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Closed set of stage names, in DAG order. `cruxes` is the only
/// conditionally-executed stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Clustering,
    Claims,
    SortAndDeduplicate,
    Summaries,
    Cruxes,
}

impl StepName {
    pub const ALL: [StepName; 5] = [
        StepName::Clustering,
        StepName::Claims,
        StepName::SortAndDeduplicate,
        StepName::Summaries,
        StepName::Cruxes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::Clustering => "clustering",
            StepName::Claims => "claims",
            StepName::SortAndDeduplicate => "sort_and_deduplicate",
            StepName::Summaries => "summaries",
            StepName::Cruxes => "cruxes",
        }
    }
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of the pipeline run as a whole.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Status of a single step within the run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
    Failed,
}

/// Per-step lifecycle record: timing, analytics, and an optional error.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StepState {
    pub status: Option<StepStatus>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<u64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub cost: Option<f64>,
    pub error: Option<StepError>,
}

impl StepState {
    pub fn pending() -> Self {
        Self {
            status: Some(StepStatus::Pending),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepError {
    pub message: String,
    pub name: String,
}

/// Top-level error recorded on the state when a run fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    pub message: String,
    pub name: String,
    pub step: Option<String>,
}

/// The durable record, keyed by `report_id`.
///
/// # Invariants
/// - At most one step is `in_progress` at a time.
/// - `current_step` equals the `in_progress` step's name, if any.
/// - `total_tokens` and `total_cost` equal the sum over `completed` steps'
///   analytics.
/// - If `status == Completed` then every non-skipped step is `Completed`.
/// - `validation_failures[s]` resets to zero on a `completed` write of `s`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub report_id: String,
    pub user_id: String,
    pub status: RunStatus,
    pub current_step: Option<StepName>,
    pub steps: HashMap<String, StepState>,
    pub completed_results: HashMap<String, serde_json::Value>,
    pub validation_failures: HashMap<String, u32>,
    pub total_duration_ms: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub error: Option<RunError>,
}

impl PipelineState {
    /// A brand-new record for a fresh run: every step `pending`, nothing
    /// cached, status `pending` (the runner flips it to `running` once the
    /// lock is held).
    pub fn fresh(report_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let mut steps = HashMap::new();
        for name in StepName::ALL {
            steps.insert(name.as_str().to_string(), StepState::pending());
        }
        Self {
            report_id: report_id.into(),
            user_id: user_id.into(),
            status: RunStatus::Pending,
            current_step: None,
            steps,
            completed_results: HashMap::new(),
            validation_failures: HashMap::new(),
            total_duration_ms: 0,
            total_tokens: 0,
            total_cost: 0.0,
            error: None,
        }
    }

    pub fn step(&self, name: StepName) -> Option<&StepState> {
        self.steps.get(name.as_str())
    }

    pub fn step_mut(&mut self, name: StepName) -> &mut StepState {
        self.steps
            .entry(name.as_str().to_string())
            .or_insert_with(StepState::pending)
    }

    /// Whether `name` has a cached result waiting in `completed_results`.
    pub fn has_cached(&self, name: StepName) -> bool {
        self.completed_results.contains_key(name.as_str())
    }

    pub fn validation_failure_count(&self, name: StepName) -> u32 {
        *self.validation_failures.get(name.as_str()).unwrap_or(&0)
    }
}

/// Structural contract a cached stage result must satisfy before the runner
/// will trust it on resume. Factored out as its own unit (per SPEC_FULL §2)
/// because the runner, the wrapper, and `get_pipeline_status` callers all
/// need the identical check.
///
/// Per spec §4.4:
/// - every stage's cached value must be an object with both `usage` and
///   `cost` keys;
/// - `clustering|claims|sort_and_deduplicate|summaries` additionally need a
///   `data` key;
/// - `cruxes` additionally needs `subtopic_cruxes`, `topic_scores`,
///   `speaker_crux_matrix`.
pub fn validate_cached(name: StepName, value: &serde_json::Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    if !obj.contains_key("usage") || !obj.contains_key("cost") {
        return false;
    }
    match name {
        StepName::Clustering | StepName::Claims | StepName::SortAndDeduplicate | StepName::Summaries => {
            obj.contains_key("data")
        }
        StepName::Cruxes => {
            obj.contains_key("subtopic_cruxes")
                && obj.contains_key("topic_scores")
                && obj.contains_key("speaker_crux_matrix")
        }
    }
}
