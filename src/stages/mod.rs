//! The five stage executors: `clustering`, `claims`, `sort_and_deduplicate`,
//! `summaries`, `cruxes`. Each is a narrow, object-safe trait so a default
//! HTTP-backed implementation and a deterministic mock implementation
//! satisfy the same contract — the same shape as the teacher's
//! [`Backend`](crate::backend::Backend) trait, generalized from one
//! provider-agnostic request/response pair to five stage-specific,
//! heterogeneously-typed contracts.
//!
//! All five share the placeholder-hydration contract from spec §6: a closed
//! set of named `${placeholder}` variables per stage; an unknown placeholder
//! in a template is an `invalid_input` failure at stage entry.

pub mod clustering;
pub mod claims;
pub mod cruxes;
pub mod dedup;
pub mod summaries;

pub use clustering::ClusteringExecutor;
pub use claims::ClaimsExecutor;
pub use cruxes::CruxesExecutor;
pub use dedup::DedupExecutor;
pub use summaries::SummariesExecutor;

use crate::error::{PipelineError, Result};
use crate::model::Usage;

/// Best-effort token usage extraction from a backend response's provider
/// metadata. Each provider reports usage differently (Ollama: `eval_count`/
/// `prompt_eval_count`; OpenAI-style: `usage.prompt_tokens`/
/// `usage.completion_tokens`); stages fall back to zeroed usage rather than
/// failing when metadata is absent, matching the wrapper's "missing
/// analytics is a warning, not a failure" rule (spec §4.3).
pub fn extract_usage(metadata: &Option<serde_json::Value>) -> Usage {
    let Some(meta) = metadata else {
        return Usage::default();
    };
    if let (Some(prompt), Some(completion)) = (
        meta.get("prompt_eval_count").and_then(|v| v.as_u64()),
        meta.get("eval_count").and_then(|v| v.as_u64()),
    ) {
        return Usage::new(prompt, completion);
    }
    if let Some(usage) = meta.get("usage") {
        let input = usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        let output = usage
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        return Usage::new(input, output);
    }
    Usage::default()
}

/// Map a transport-level [`PipelineError`] (as returned by
/// [`crate::backend::Backend::complete`]) into the stage failure taxonomy
/// from spec §4.1.
pub fn map_backend_error(err: PipelineError) -> PipelineError {
    match err {
        PipelineError::HttpError { status: 429, body, retry_after } => {
            PipelineError::UpstreamRateLimited { message: body, retry_after }
        }
        PipelineError::HttpError { status, body, .. } if (500..600).contains(&status) => {
            PipelineError::UpstreamUnavailable(format!("HTTP {status}: {body}"))
        }
        PipelineError::HttpError { status, body, .. } => {
            PipelineError::UpstreamInvalidResponse(format!("HTTP {status}: {body}"))
        }
        PipelineError::Request(e) => PipelineError::UpstreamUnavailable(e.to_string()),
        PipelineError::Json(e) => PipelineError::UpstreamInvalidResponse(e.to_string()),
        other => other,
    }
}

/// Telemetry-correlation fields threaded through every stage call. Used only
/// for correlation — stages must not branch their behavior on these values.
#[derive(Debug, Clone)]
pub struct StageTelemetry {
    pub report_id: String,
    pub user_id: String,
}

/// Replace `${name}` placeholders in `template` with the matching entry from
/// `vars`. Any `${...}` placeholder not present in `vars` is an
/// `invalid_input` failure — the closed set is documented per stage in
/// spec §6.
pub fn hydrate_template(template: &str, vars: &[(&str, &str)]) -> Result<String> {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find('}') else {
            return Err(PipelineError::InvalidInput(format!(
                "unterminated placeholder in template: '{}'",
                &rest[start..]
            )));
        };
        let name = &after_open[..end];
        match vars.iter().find(|(k, _)| *k == name) {
            Some((_, value)) => result.push_str(value),
            None => {
                return Err(PipelineError::InvalidInput(format!(
                    "unknown placeholder '${{{name}}}' in template"
                )))
            }
        }
        rest = &after_open[end + 1..];
    }
    result.push_str(rest);
    Ok(result)
}
