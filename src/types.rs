use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Query classification produced by the triage step.
///
/// Drives routing: `Simple` queries skip retrieval and reasoning entirely,
/// `Retrieval` queries skip reasoning, `Complex` queries run the full chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Simple,
    Retrieval,
    Complex,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Simple => "simple",
            Classification::Retrieval => "retrieval",
            Classification::Complex => "complex",
        }
    }

    /// Lenient parse of a model-produced label.
    ///
    /// Models rarely return the bare label: trims whitespace, lowercases,
    /// and falls back to substring matching before giving up. Garbled output
    /// returns `None` so the caller can pick the conservative path.
    pub fn parse_lenient(text: &str) -> Option<Self> {
        let cleaned = text.trim().trim_matches(|c: char| !c.is_alphanumeric());
        let lower = cleaned.to_lowercase();
        match lower.as_str() {
            "simple" => return Some(Classification::Simple),
            "retrieval" => return Some(Classification::Retrieval),
            "complex" => return Some(Classification::Complex),
            _ => {}
        }
        let lower_all = text.to_lowercase();
        for (needle, label) in [
            ("simple", Classification::Simple),
            ("retrieval", Classification::Retrieval),
            ("complex", Classification::Complex),
        ] {
            if lower_all.contains(needle) {
                return Some(label);
            }
        }
        None
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable per-request state threaded through the pipeline.
///
/// Owned exclusively by one in-flight request. Steps never touch it
/// directly; they return a [`StateUpdate`] patch that the executor merges.
/// The `trail` is the audit record of what actually ran: entries are
/// appended, never removed or reordered.
#[derive(Debug, Clone, Serialize)]
pub struct RequestState {
    /// Unique id for this run; stamps cost records so the shared ledger
    /// can be sliced per request.
    pub request_id: String,
    /// Original user input, unchanged for the lifetime of the request.
    pub input: String,
    pub session_id: Option<String>,
    pub scenario_hint: Option<String>,
    pub classification: Option<Classification>,
    /// Retrieved context blocks, in retrieval order.
    pub context: Vec<String>,
    /// Intermediate reasoning blocks, in production order.
    pub reasoning: Vec<String>,
    /// Final user-visible answer; absent until the summary step runs.
    pub answer: Option<String>,
    /// Executed step names, including `<name>_skipped` markers.
    pub trail: Vec<String>,
    /// Per-step cache-hit flags, keyed by step name.
    pub cache_hits: BTreeMap<String, bool>,
    /// Model identifiers actually invoked, in invocation order.
    pub models_used: Vec<String>,
    /// Set when a step failed hard; the rest of the state is the partial
    /// progress up to that point.
    pub error: Option<String>,
}

impl RequestState {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            input: input.into(),
            session_id: None,
            scenario_hint: None,
            classification: None,
            context: Vec::new(),
            reasoning: Vec::new(),
            answer: None,
            trail: Vec::new(),
            cache_hits: BTreeMap::new(),
            models_used: Vec::new(),
            error: None,
        }
    }

    /// Retrieved context joined into a single prompt-ready block.
    pub fn context_text(&self) -> String {
        self.context.join("\n\n")
    }

    pub fn reasoning_text(&self) -> String {
        self.reasoning.join("\n\n")
    }
}

/// Partial patch returned by a step and merged into [`RequestState`].
///
/// Merge is field-level: list fields append, option fields overwrite only
/// when set. A step can never replace the whole state or rewrite history.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub classification: Option<Classification>,
    pub context: Vec<String>,
    pub reasoning: Vec<String>,
    pub answer: Option<String>,
    /// Trail entries to append (the step's own name or a skip marker).
    pub trail: Vec<String>,
    pub cache_hit: Option<(String, bool)>,
    pub model_used: Option<String>,
}

impl StateUpdate {
    /// Update for a step that ran (cache hit or model call).
    pub fn executed(name: &str, cache_hit: bool) -> Self {
        Self {
            trail: vec![name.to_string()],
            cache_hit: Some((name.to_string(), cache_hit)),
            ..Self::default()
        }
    }

    /// Update for a step whose execute was suppressed by routing.
    pub fn skipped(name: &str) -> Self {
        Self {
            trail: vec![format!("{name}_skipped")],
            ..Self::default()
        }
    }

    pub fn with_classification(mut self, classification: Classification) -> Self {
        self.classification = Some(classification);
        self
    }

    pub fn with_context(mut self, block: impl Into<String>) -> Self {
        self.context.push(block.into());
        self
    }

    pub fn with_reasoning(mut self, block: impl Into<String>) -> Self {
        self.reasoning.push(block.into());
        self
    }

    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.answer = Some(answer.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_used = Some(model.into());
        self
    }

    /// Merge this patch into `state`.
    pub fn apply(self, state: &mut RequestState) {
        if let Some(c) = self.classification {
            state.classification = Some(c);
        }
        state.context.extend(self.context);
        state.reasoning.extend(self.reasoning);
        if let Some(a) = self.answer {
            state.answer = Some(a);
        }
        state.trail.extend(self.trail);
        if let Some((name, hit)) = self.cache_hit {
            state.cache_hits.insert(name, hit);
        }
        if let Some(m) = self.model_used {
            state.models_used.push(m);
        }
    }
}

/// One model invocation's worth of token usage and dollar cost.
#[derive(Debug, Clone, Serialize)]
pub struct CostRecord {
    pub request_id: String,
    pub model: String,
    pub step: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub timestamp: DateTime<Utc>,
}

/// Aggregates derived from a slice of the cost ledger.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CostBreakdown {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,
    pub by_node: BTreeMap<String, f64>,
    pub by_model: BTreeMap<String, f64>,
}

impl CostBreakdown {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a CostRecord>) -> Self {
        let mut breakdown = CostBreakdown::default();
        for record in records {
            breakdown.total_input_tokens += record.input_tokens;
            breakdown.total_output_tokens += record.output_tokens;
            breakdown.total_cost_usd += record.cost_usd;
            *breakdown.by_node.entry(record.step.clone()).or_insert(0.0) += record.cost_usd;
            *breakdown.by_model.entry(record.model.clone()).or_insert(0.0) += record.cost_usd;
        }
        breakdown
    }
}

/// Inbound request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineRequest {
    pub user_input: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub scenario_hint: Option<String>,
}

impl PipelineRequest {
    pub fn new(user_input: impl Into<String>) -> Self {
        Self {
            user_input: user_input.into(),
            session_id: None,
            scenario_hint: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_scenario_hint(mut self, hint: impl Into<String>) -> Self {
        self.scenario_hint = Some(hint.into());
        self
    }
}

/// Execution trail and cost accounting returned alongside every answer
/// (and alongside every failure, covering the progress made before it).
#[derive(Debug, Clone, Serialize)]
pub struct DebugInfo {
    pub nodes_executed: Vec<String>,
    pub cache_hits: BTreeMap<String, bool>,
    pub models_used: Vec<String>,
    pub cost_breakdown: CostBreakdown,
}

/// Outbound response envelope.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResponse {
    pub answer: String,
    pub debug: DebugInfo,
}
