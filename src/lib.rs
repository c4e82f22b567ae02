//! # LLM Costpipe
//!
//! Cost-aware LLM pipeline orchestrator with classification routing,
//! result caching, and per-request cost accounting.
//!
//! This library executes a directed sequence of LLM-backed steps over a
//! shared piece of request state, skipping steps that are unnecessary for
//! a given input, caching step outputs to avoid redundant paid calls,
//! selecting among model tiers by cost/quality tradeoff, and accounting
//! for token usage and dollar cost per request.
//!
//! ## Features
//!
//! - **Classification routing** — a cheap triage step labels each query
//!   `simple`/`retrieval`/`complex`; a lookup-table router early-exits the
//!   steps the query doesn't need
//! - **Result caching** — step outputs are cached under sha256
//!   fingerprints with TTL; a repeat query costs nothing
//! - **Model tiers** — steps ask for `cheap`/`medium`/`expensive`
//!   quality; the tier table maps that to concrete models and prices
//! - **Cost ledger** — append-only token/dollar accounting, aggregated
//!   per step, per model, and per request
//! - **Bounded failure** — per-call timeouts pinned to the offending step,
//!   bounded retry with backoff, and a transition cap against routing loops
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use llm_costpipe::{
//!     KeywordRetriever, OllamaClient, PipelineContext, PipelineExecutor,
//!     PipelineRequest, TierTable,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let context = Arc::new(PipelineContext::new(
//!         TierTable::ollama_default(),
//!         Arc::new(OllamaClient::new("http://localhost:11434")),
//!         Arc::new(KeywordRetriever::from_texts([
//!             "Tokio is an asynchronous runtime for Rust.",
//!         ])),
//!     ));
//!
//!     let executor = PipelineExecutor::canonical(context);
//!     let response = executor
//!         .run(PipelineRequest::new("What is Tokio?"))
//!         .await?;
//!
//!     println!("{}", response.answer);
//!     println!("steps: {:?}", response.debug.nodes_executed);
//!     println!("cost: ${:.6}", response.debug.cost_breakdown.total_cost_usd);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod client;
pub mod error;
pub mod ledger;
pub mod models;
pub mod pipeline;
pub mod prompt;
pub mod retrieval;
pub mod router;
pub mod step;
pub mod types;

pub use cache::{CacheBackend, CacheEntry, CacheUnavailable, MemoryCache, ResultCache};
pub use client::{
    call_with_retry, Completion, CompletionRequest, MockClient, ModelClient, OllamaClient,
};
pub use error::{PipelineError, Result};
pub use ledger::CostLedger;
pub use models::{ModelDescriptor, ModelTier, TierConfig, TierTable};
pub use pipeline::{PipelineContext, PipelineExecutor, PipelineExecutorBuilder, PipelineFailure};
pub use retrieval::{Document, KeywordRetriever, Retriever};
pub use router::{Route, Router, RouterBuilder};
pub use step::{ReasoningStep, RetrievalStep, Step, SummaryStep, TriageStep};
pub use types::{
    Classification, CostBreakdown, CostRecord, DebugInfo, PipelineRequest, PipelineResponse,
    RequestState, StateUpdate,
};
