//! Callbacks as one-way ports, not hooks (spec §9). `onStepUpdate` and
//! `onProgress` are message sinks the wrapper fires synchronously; a
//! panicking or otherwise misbehaving callback must never break the
//! pipeline.
//!
//! Generalizes the teacher's `EventHandler` trait — an object-safe port for
//! streaming token/lifecycle events — from per-token callbacks to
//! pipeline-lifecycle callbacks.

use crate::state::StepName;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Status reported alongside a step name in `onStepUpdate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepUpdateStatus {
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepUpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepUpdateStatus::InProgress => "in_progress",
            StepUpdateStatus::Completed => "completed",
            StepUpdateStatus::Failed => "failed",
            StepUpdateStatus::Skipped => "skipped",
        }
    }
}

/// `onProgress({currentStep, totalSteps, completedSteps, percentComplete})`.
#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    pub current_step: StepName,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub percent_complete: u32,
}

/// Caller-supplied callback ports. Both are optional; neither can abort the
/// pipeline (spec §6).
pub trait PipelineCallbacks: Send + Sync {
    fn on_step_update(&self, _step: StepName, _status: StepUpdateStatus) {}
    fn on_progress(&self, _update: ProgressUpdate) {}
}

/// A no-op implementation for callers who don't need callbacks.
pub struct NoopCallbacks;
impl PipelineCallbacks for NoopCallbacks {}

/// Invoke `f` against the callback port, guarding against panics. A
/// panicking callback logs a warning and is swallowed — it never
/// propagates up into the runner's control flow.
pub(crate) fn guarded<F: FnOnce() + std::panic::UnwindSafe>(label: &str, f: F) {
    if let Err(_panic) = catch_unwind(AssertUnwindSafe(f)) {
        tracing::warn!(callback = label, "pipeline callback panicked; ignoring");
    }
}

pub(crate) fn fire_step_update(
    callbacks: &dyn PipelineCallbacks,
    step: StepName,
    status: StepUpdateStatus,
) {
    guarded(
        "on_step_update",
        AssertUnwindSafe(|| callbacks.on_step_update(step, status)),
    );
}

pub(crate) fn fire_progress(callbacks: &dyn PipelineCallbacks, update: ProgressUpdate) {
    guarded("on_progress", AssertUnwindSafe(|| callbacks.on_progress(update)));
}
