use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::client::{call_with_retry, CompletionRequest};
use crate::error::Result;
use crate::models::ModelTier;
use crate::pipeline::PipelineContext;
use crate::prompt::{numbered_list, render, section};
use crate::types::{Classification, CostRecord, RequestState, StateUpdate};

/// Default freshness window for cached step outputs.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// A unit of pipeline work.
///
/// A step reads the shared request state, may consult the model via the
/// tier table and the cache via its own namespace, and returns a partial
/// [`StateUpdate`] that the executor merges. `applicable` is checked by
/// the executor before `execute`, so an inapplicable step performs no
/// model call and no cache I/O at all.
#[async_trait]
pub trait Step: Send + Sync {
    /// Stable name: cache namespace prefix and routing-table key.
    /// Must be unique among registered steps.
    fn name(&self) -> &str;

    /// Whether this step applies for the given classification.
    fn applicable(&self, _classification: Option<Classification>) -> bool {
        true
    }

    async fn execute(&self, state: &RequestState, ctx: &PipelineContext) -> Result<StateUpdate>;
}

/// Result of the shared cache-or-call protocol.
pub(crate) struct Exchange {
    pub content: String,
    pub cache_hit: bool,
    /// Model identifier, present only when a call actually happened.
    pub model: Option<String>,
}

fn exchange_update(name: &str, exchange: &Exchange) -> StateUpdate {
    let mut update = StateUpdate::executed(name, exchange.cache_hit);
    if let Some(model) = &exchange.model {
        update = update.with_model(model.clone());
    }
    update
}

/// One paid model call: resolve the tier, call with retry and deadline,
/// record the cost. Returns the content and the model id used.
pub(crate) async fn priced_completion(
    ctx: &PipelineContext,
    state: &RequestState,
    step: &str,
    tier: ModelTier,
    max_tokens: u32,
    temperature: f64,
    prompt_text: String,
) -> Result<(String, String)> {
    let descriptor = ctx.models.resolve(tier);
    let request = CompletionRequest {
        prompt: prompt_text,
        model: descriptor.id.clone(),
        max_tokens,
        temperature,
    };
    let completion = call_with_retry(ctx.client.as_ref(), &request, ctx.call_timeout, step).await?;
    ctx.ledger.record(CostRecord {
        request_id: state.request_id.clone(),
        model: descriptor.id.clone(),
        step: step.to_string(),
        input_tokens: completion.input_tokens,
        output_tokens: completion.output_tokens,
        cost_usd: descriptor.cost(completion.input_tokens, completion.output_tokens),
        timestamp: Utc::now(),
    });
    Ok((completion.content, descriptor.id.clone()))
}

/// The cache-or-call protocol shared by model-backed steps: try the cache
/// under the step's namespace first; on a miss, make one paid call and
/// write the result back.
pub(crate) async fn cached_completion(
    ctx: &PipelineContext,
    state: &RequestState,
    step: &str,
    tier: ModelTier,
    max_tokens: u32,
    temperature: f64,
    ttl: Duration,
    cache_content: &str,
    prompt_text: String,
) -> Result<Exchange> {
    if let Some(content) = ctx.cache.get(step, cache_content).await {
        info!(step, "cache hit");
        return Ok(Exchange {
            content,
            cache_hit: true,
            model: None,
        });
    }
    let (content, model) =
        priced_completion(ctx, state, step, tier, max_tokens, temperature, prompt_text).await?;
    ctx.cache.set(step, cache_content, content.clone(), ttl).await;
    Ok(Exchange {
        content,
        cache_hit: false,
        model: Some(model),
    })
}

// ---------------------------------------------------------------------------
// Built-in steps
// ---------------------------------------------------------------------------

const TRIAGE_PROMPT: &str = "\
Classify the user question into exactly one label:
- simple: answerable directly, no lookup needed
- retrieval: needs facts from the knowledge base
- complex: needs retrieved facts plus multi-step analysis

Respond with only the label.

## Question
{input}

Label:";

/// Classifies the input. Cheapest tier, tiny output ceiling, always runs
/// first in the canonical policy.
pub struct TriageStep {
    cache_ttl: Duration,
}

impl TriageStep {
    pub fn new() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }
}

impl Default for TriageStep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Step for TriageStep {
    fn name(&self) -> &str {
        "triage"
    }

    async fn execute(&self, state: &RequestState, ctx: &PipelineContext) -> Result<StateUpdate> {
        let prompt_text = render(TRIAGE_PROMPT, &[("input", state.input.as_str())]);
        let exchange = cached_completion(
            ctx,
            state,
            self.name(),
            ModelTier::Cheap,
            4,
            0.0,
            self.cache_ttl,
            &state.input,
            prompt_text,
        )
        .await?;

        let classification = Classification::parse_lenient(&exchange.content).unwrap_or_else(|| {
            // Garbled label: take the conservative full path instead of
            // failing or guessing cheap.
            warn!(
                raw = %exchange.content,
                "unparseable classification, defaulting to complex"
            );
            Classification::Complex
        });
        info!(%classification, cache_hit = exchange.cache_hit, "triage classified input");

        Ok(exchange_update(self.name(), &exchange).with_classification(classification))
    }
}

const CONDENSE_PROMPT: &str = "\
Condense the following documents into background context for answering the
question. Keep only facts relevant to the question.

## Question
{input}

{documents}

Context:";

/// Fetches knowledge-base documents and condenses them into context.
/// Runs only for retrieval-grade and complex queries.
pub struct RetrievalStep {
    cache_ttl: Duration,
}

impl RetrievalStep {
    pub fn new() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }
}

impl Default for RetrievalStep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Step for RetrievalStep {
    fn name(&self) -> &str {
        "retrieval"
    }

    fn applicable(&self, classification: Option<Classification>) -> bool {
        // Unclassified input is treated conservatively: retrieve.
        !matches!(classification, Some(Classification::Simple))
    }

    async fn execute(&self, state: &RequestState, ctx: &PipelineContext) -> Result<StateUpdate> {
        if let Some(cached) = ctx.cache.get(self.name(), &state.input).await {
            info!(step = self.name(), "cache hit");
            let exchange = Exchange {
                content: cached,
                cache_hit: true,
                model: None,
            };
            let mut update = exchange_update(self.name(), &exchange);
            if !exchange.content.is_empty() {
                update = update.with_context(exchange.content);
            }
            return Ok(update);
        }

        let embedding = ctx.retriever.embed(&state.input).await?;
        let documents = ctx.retriever.retrieve(&state.input, &embedding).await?;
        info!(step = self.name(), count = documents.len(), "documents retrieved");

        if documents.is_empty() {
            // Nothing to condense: cache the empty result so repeat
            // queries skip the retriever too, and spend nothing.
            ctx.cache
                .set(self.name(), &state.input, String::new(), self.cache_ttl)
                .await;
            return Ok(StateUpdate::executed(self.name(), false));
        }

        let doc_texts: Vec<String> = documents.into_iter().map(|d| d.content).collect();
        let doc_section = section("Documents", &numbered_list(&doc_texts));
        let prompt_text = render(
            CONDENSE_PROMPT,
            &[
                ("input", state.input.as_str()),
                ("documents", doc_section.as_str()),
            ],
        );
        let (context, model) = priced_completion(
            ctx,
            state,
            self.name(),
            ModelTier::Cheap,
            256,
            0.3,
            prompt_text,
        )
        .await?;
        ctx.cache
            .set(self.name(), &state.input, context.clone(), self.cache_ttl)
            .await;

        Ok(StateUpdate::executed(self.name(), false)
            .with_context(context)
            .with_model(model))
    }
}

const REASONING_PROMPT: &str = "\
Work through the question step by step using the background context.
Produce a focused analysis, not a final answer.

## Question
{input}

## Background
{context}

Analysis:";

/// Deep analysis on the expensive tier. Runs only for complex queries.
pub struct ReasoningStep {
    cache_ttl: Duration,
}

impl ReasoningStep {
    pub fn new() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }
}

impl Default for ReasoningStep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Step for ReasoningStep {
    fn name(&self) -> &str {
        "reasoning"
    }

    fn applicable(&self, classification: Option<Classification>) -> bool {
        matches!(classification, None | Some(Classification::Complex))
    }

    async fn execute(&self, state: &RequestState, ctx: &PipelineContext) -> Result<StateUpdate> {
        // The analysis depends on what retrieval produced, so the
        // fingerprint covers input plus context.
        let context_text = state.context_text();
        let cache_content = format!("{}\n{}", state.input, context_text);
        let prompt_text = render(
            REASONING_PROMPT,
            &[
                ("input", state.input.as_str()),
                ("context", context_text.as_str()),
            ],
        );
        let exchange = cached_completion(
            ctx,
            state,
            self.name(),
            ModelTier::Expensive,
            512,
            0.7,
            self.cache_ttl,
            &cache_content,
            prompt_text,
        )
        .await?;

        let mut update = exchange_update(self.name(), &exchange);
        update = update.with_reasoning(exchange.content);
        Ok(update)
    }
}

/// Final synthesis on the medium tier. Always runs last and consumes
/// whatever context and reasoning exist in state.
pub struct SummaryStep {
    cache_ttl: Duration,
}

impl SummaryStep {
    pub fn new() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    fn build_prompt(state: &RequestState) -> String {
        let mut sections = vec![section("Question", &state.input)];
        if !state.context.is_empty() {
            sections.push(section("Background", &state.context_text()));
        }
        if !state.reasoning.is_empty() {
            sections.push(section("Analysis", &state.reasoning_text()));
        }
        format!(
            "Answer the user's question clearly and concisely, using the \
             provided sections where present.\n\n{}\n\nAnswer:",
            sections.join("\n\n")
        )
    }
}

impl Default for SummaryStep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Step for SummaryStep {
    fn name(&self) -> &str {
        "summary"
    }

    async fn execute(&self, state: &RequestState, ctx: &PipelineContext) -> Result<StateUpdate> {
        // The answer depends on everything accumulated so far.
        let cache_content = format!(
            "{}\n{}\n{}",
            state.input,
            state.context_text(),
            state.reasoning_text()
        );
        let exchange = cached_completion(
            ctx,
            state,
            self.name(),
            ModelTier::Medium,
            384,
            0.7,
            self.cache_ttl,
            &cache_content,
            Self::build_prompt(state),
        )
        .await?;

        let mut update = exchange_update(self.name(), &exchange);
        update = update.with_answer(exchange.content);
        Ok(update)
    }
}
