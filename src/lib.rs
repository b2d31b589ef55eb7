//! # Deliberation Pipeline
//!
//! Turns a batch of participant comments into a topic taxonomy, grounded
//! claims, deduplicated and sorted claim groups, per-topic summaries, and
//! (optionally) a controversy-axis "cruxes" analysis — a fixed five-stage
//! DAG run as one durable, resumable, distributedly-locked job per report.
//!
//! ## Core Concepts
//!
//! - **[`runner::run_pipeline`]** — the entry point. Drives the DAG
//!   (`clustering → claims → sort_and_deduplicate → summaries → cruxes?`)
//!   through [`wrapper::execute_step`], persisting after every stage and
//!   re-verifying the distributed lock before every write.
//! - **[`state::PipelineState`]** — the durable per-report record a
//!   [`store::StateStore`] implementation persists; what a resumed run reads
//!   back and validates.
//! - **[`stages`]** — one object-safe executor trait per DAG stage, each with
//!   a default LLM-backed implementation and a deterministic test double.
//! - **[`callbacks::PipelineCallbacks`]** — optional `onStepUpdate`/
//!   `onProgress` ports fired synchronously and panic-guarded.
//!
//! ## Quick Start
//!
//! ```no_run
//! use llm_pipeline::backend::{BackoffConfig, MockBackend};
//! use llm_pipeline::model::{Comment, LlmStageConfig};
//! use llm_pipeline::runner::{run_pipeline, Executors, PipelineInput, RunConfig};
//! use llm_pipeline::store::InMemoryStateStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = InMemoryStateStore::new();
//!     let executors = Executors::llm_backed(
//!         reqwest::Client::new(),
//!         "http://localhost:11434".to_string(),
//!         Arc::new(MockBackend::fixed("{}")),
//!         BackoffConfig::none(),
//!     );
//!
//!     let input = PipelineInput {
//!         comments: vec![Comment { id: "c1".into(), text: "Dogs are loyal".into(), speaker: "A".into() }],
//!         clustering_config: LlmStageConfig::new("m", "s", "${comments}"),
//!         claims_config: LlmStageConfig::new("m", "s", "${taxonomy} ${comment}"),
//!         dedup_config: LlmStageConfig::new("m", "s", "${claims}"),
//!         summaries_config: LlmStageConfig::new("m", "s", "${topic}"),
//!         cruxes_config: None,
//!         sort_strategy: "speakers_then_claims".to_string(),
//!         enable_cruxes: false,
//!         cruxes_top_k: 3,
//!     };
//!
//!     let result = run_pipeline(input, RunConfig::new("report-1", "user-1"), &store, &executors).await?;
//!     println!("completed: {}", result.success);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod callbacks;
pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod output_parser;
pub mod runner;
pub mod stages;
pub mod state;
pub mod store;
pub mod streaming;
pub mod wrapper;

pub use client::LlmConfig;
pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineStepError, Result};
pub use runner::{
    cancel_pipeline, cleanup_pipeline_state, get_pipeline_status, run_pipeline, Executors,
    PipelineInput, PipelineOutputs, PipelineResult, RunConfig,
};
pub use state::PipelineState;
pub use store::StateStore;
pub use streaming::StreamingDecoder;
