//! Structured error taxonomy for the pipeline.
//!
//! Stages, the state store, the step-execution wrapper, and the runner all
//! speak the same closed set of error kinds — no stringly-typed errors, no
//! downcasting on class identity. Every variant that can reach a caller
//! carries enough context to explain *and* to resume.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the pipeline and its components.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Payload or configuration malformed (bad stage input, unknown
    /// placeholder, unknown sort strategy).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The LLM or compute service is unreachable, timed out, or returned 5xx.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The upstream rejected the request for rate limiting; may carry a
    /// `Retry-After` hint.
    #[error("upstream rate limited: {message}")]
    UpstreamRateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The upstream responded with non-JSON or schema-mismatched content.
    #[error("upstream returned invalid response: {0}")]
    UpstreamInvalidResponse(String),

    /// The provider refused the request on content-policy grounds.
    #[error("content policy violation: {0}")]
    ContentPolicy(String),

    /// The runner's lease expired or was stolen by another worker.
    #[error("lock lost for report {report_id}")]
    LockLost { report_id: String },

    /// The state store's I/O failed; the runner cannot continue.
    #[error("state store unavailable: {0}")]
    StateUnavailable(String),

    /// A recovered cached result failed structural validation beyond the
    /// configured retry ceiling.
    #[error("corrupted state for step '{step}': {reason}")]
    CorruptedState { step: String, reason: String },

    /// A runtime-detected absence of a prerequisite stage's output — state
    /// corruption the validator missed.
    #[error("missing dependency: step '{step}' requires '{dependency}'")]
    MissingDependency { step: String, dependency: String },

    /// The pipeline reached "success" without producing a required artifact.
    #[error("missing output: '{0}'")]
    MissingOutput(String),

    /// Explicit cancellation or timeout.
    #[error("cancelled: {0}")]
    Cancellation(String),

    /// Programmer error; not expected to recover.
    #[error("internal error: {0}")]
    Internal(String),

    /// Low-level HTTP transport failure (connection refused, timeout, etc.),
    /// kept distinct from [`Self::UpstreamUnavailable`] so transport-level
    /// retry (`backend::with_backoff`) can match on it directly.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Redis transport or protocol error underlying a `StateUnavailable`.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// HTTP error with status code, response body, and optional Retry-After
    /// hint. Returned by [`Backend`](crate::backend::Backend) implementations
    /// before being mapped into the taxonomy above by a stage executor.
    #[error("HTTP {status}: {body}")]
    HttpError {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    /// Invalid configuration detected at build time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The pipeline or payload was cancelled via the cancellation flag.
    #[error("pipeline was cancelled")]
    Cancelled,

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// The closed error-kind tag used in `PipelineState.error.name` and in
    /// any structured report surfaced to callers. Mirrors the taxonomy in
    /// the error-handling design: `invalid_input`, `upstream_unavailable`, etc.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidInput(_) => "invalid_input",
            PipelineError::UpstreamUnavailable(_) => "upstream_unavailable",
            PipelineError::UpstreamRateLimited { .. } => "upstream_rate_limited",
            PipelineError::UpstreamInvalidResponse(_) => "upstream_invalid_response",
            PipelineError::ContentPolicy(_) => "content_policy",
            PipelineError::LockLost { .. } => "lock_lost",
            PipelineError::StateUnavailable(_) => "state_unavailable",
            PipelineError::CorruptedState { .. } => "corrupted_state",
            PipelineError::MissingDependency { .. } => "missing_dependency",
            PipelineError::MissingOutput(_) => "missing_output",
            PipelineError::Cancellation(_) | PipelineError::Cancelled => "cancellation",
            PipelineError::Internal(_) => "internal",
            PipelineError::Request(_)
            | PipelineError::Json(_)
            | PipelineError::Redis(_)
            | PipelineError::HttpError { .. }
            | PipelineError::InvalidConfig(_)
            | PipelineError::Other(_) => "internal",
        }
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// A stage failed while running inside the step-execution wrapper. Carries
/// the step name, the underlying error, and the post-failure state so the
/// caller can inspect what was durably recorded.
#[derive(Debug)]
pub struct PipelineStepError {
    pub step: String,
    pub source: PipelineError,
    pub state: crate::state::PipelineState,
}

impl std::fmt::Display for PipelineStepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "step '{}' failed: {}", self.step, self.source)
    }
}

impl std::error::Error for PipelineStepError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
