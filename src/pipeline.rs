use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::cache::ResultCache;
use crate::client::ModelClient;
use crate::error::{PipelineError, Result};
use crate::ledger::CostLedger;
use crate::models::TierTable;
use crate::retrieval::Retriever;
use crate::router::{Route, Router};
use crate::step::Step;
use crate::types::{DebugInfo, PipelineRequest, PipelineResponse, RequestState, StateUpdate};

/// Default deadline for a single model call.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Explicitly constructed, explicitly passed bundle of the shared
/// resources steps consume: the result cache, the cost ledger, the tier
/// table, and the model/retrieval collaborators. One context is shared by
/// all concurrent requests; the cache and ledger serialize their own
/// mutations internally.
pub struct PipelineContext {
    pub cache: ResultCache,
    pub ledger: CostLedger,
    pub models: TierTable,
    pub client: Arc<dyn ModelClient>,
    pub retriever: Arc<dyn Retriever>,
    pub call_timeout: Duration,
}

impl PipelineContext {
    pub fn new(
        models: TierTable,
        client: Arc<dyn ModelClient>,
        retriever: Arc<dyn Retriever>,
    ) -> Self {
        Self {
            cache: ResultCache::in_memory(),
            ledger: CostLedger::new(),
            models,
            client,
            retriever,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// A failed run: the typed error plus the trail and cost accumulated
/// before the failure, so callers can see how far execution got and what
/// it cost. Never a truncated answer dressed up as success.
#[derive(Debug)]
pub struct PipelineFailure {
    pub error: PipelineError,
    pub debug: DebugInfo,
}

impl std::fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for PipelineFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Drives one request from the entry step to terminal.
///
/// Owns the step registry and the routing table; holds the shared
/// [`PipelineContext`]. Execution is strictly sequential within a request
/// (later steps' cache keys and prompts depend on earlier outputs);
/// concurrency happens across requests, each with its own `run` call.
pub struct PipelineExecutor {
    steps: HashMap<String, Arc<dyn Step>>,
    router: Router,
    entry: String,
    context: Arc<PipelineContext>,
    /// Transition cap guaranteeing termination: 2x the registered steps.
    max_invocations: usize,
}

impl PipelineExecutor {
    pub fn builder(context: Arc<PipelineContext>) -> PipelineExecutorBuilder {
        PipelineExecutorBuilder::new(context)
    }

    /// The canonical four-step pipeline: triage, retrieval, reasoning,
    /// summary, wired with [`Router::canonical`].
    pub fn canonical(context: Arc<PipelineContext>) -> Self {
        // Registry and table are statically consistent, so build cannot fail.
        match Self::builder(context)
            .register(crate::step::TriageStep::new())
            .register(crate::step::RetrievalStep::new())
            .register(crate::step::ReasoningStep::new())
            .register(crate::step::SummaryStep::new())
            .router(Router::canonical())
            .entry("triage")
            .build()
        {
            Ok(executor) => executor,
            Err(e) => unreachable!("canonical pipeline failed to build: {e}"),
        }
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.context
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.keys().map(|s| s.as_str()).collect()
    }

    /// Run one request to completion.
    ///
    /// Returns the answer with its debug trail, or a [`PipelineFailure`]
    /// carrying the partial trail and the cost spent before the failure.
    pub async fn run(
        &self,
        request: PipelineRequest,
    ) -> std::result::Result<PipelineResponse, PipelineFailure> {
        if request.user_input.trim().is_empty() {
            // Fail fast, before any state or I/O.
            return Err(PipelineFailure {
                error: PipelineError::EmptyInput,
                debug: DebugInfo {
                    nodes_executed: Vec::new(),
                    cache_hits: Default::default(),
                    models_used: Vec::new(),
                    cost_breakdown: Default::default(),
                },
            });
        }

        let mut state = RequestState::new(request.user_input);
        state.session_id = request.session_id;
        state.scenario_hint = request.scenario_hint;
        info!(
            request_id = %state.request_id,
            session_id = state.session_id.as_deref().unwrap_or("-"),
            scenario_hint = state.scenario_hint.as_deref().unwrap_or("-"),
            "pipeline run started"
        );

        match self.drive(&mut state).await {
            Ok(()) => {
                let debug_info = self.debug_for(&state);
                match state.answer {
                    Some(answer) => {
                        info!(
                            request_id = %state.request_id,
                            cost_usd = debug_info.cost_breakdown.total_cost_usd,
                            "pipeline run completed"
                        );
                        Ok(PipelineResponse {
                            answer,
                            debug: debug_info,
                        })
                    }
                    None => {
                        // Terminal without an answer means a routing table
                        // that never reached a synthesis step.
                        let error = PipelineError::Other(
                            "pipeline terminated without producing an answer".to_string(),
                        );
                        error!(request_id = %state.request_id, %error, "pipeline run failed");
                        Err(PipelineFailure {
                            error,
                            debug: debug_info,
                        })
                    }
                }
            }
            Err(error) => {
                state.error = Some(error.to_string());
                let debug_info = self.debug_for(&state);
                error!(
                    request_id = %state.request_id,
                    %error,
                    trail = ?debug_info.nodes_executed,
                    "pipeline run failed"
                );
                Err(PipelineFailure {
                    error,
                    debug: debug_info,
                })
            }
        }
    }

    /// The state machine loop: invoke, merge, route, repeat.
    async fn drive(&self, state: &mut RequestState) -> Result<()> {
        let mut current = self.entry.clone();
        let mut invocations = 0usize;

        loop {
            invocations += 1;
            if invocations > self.max_invocations {
                return Err(PipelineError::PipelineLoop {
                    cap: self.max_invocations,
                });
            }

            let step = self.steps.get(&current).ok_or_else(|| {
                PipelineError::Configuration(format!("Step '{current}' is not registered"))
            })?;

            if step.applicable(state.classification) {
                info!(step = %current, request_id = %state.request_id, "step start");
                let update = step
                    .execute(state, &self.context)
                    .await
                    .map_err(|e| match e {
                        // Typed errors keep their identity; anything else
                        // is pinned to the step that raised it.
                        e @ (PipelineError::StepTimeout { .. }
                        | PipelineError::ModelCall { .. }) => e,
                        other => PipelineError::StepFailed {
                            step: current.clone(),
                            message: other.to_string(),
                        },
                    })?;
                update.apply(state);
            } else {
                info!(step = %current, request_id = %state.request_id, "step skipped");
                StateUpdate::skipped(&current).apply(state);
            }

            match self.router.next(&current, state) {
                Route::Terminal => return Ok(()),
                Route::Step(next) => {
                    if next == current {
                        warn!(step = %current, "routing table self-loop");
                    }
                    current = next;
                }
            }
        }
    }

    fn debug_for(&self, state: &RequestState) -> DebugInfo {
        DebugInfo {
            nodes_executed: state.trail.clone(),
            cache_hits: state.cache_hits.clone(),
            models_used: state.models_used.clone(),
            cost_breakdown: self.context.ledger.breakdown_for_request(&state.request_id),
        }
    }
}

/// Builder for executors, validating the registry/routing wiring.
pub struct PipelineExecutorBuilder {
    steps: Vec<Arc<dyn Step>>,
    router: Router,
    entry: Option<String>,
    context: Arc<PipelineContext>,
}

impl PipelineExecutorBuilder {
    pub fn new(context: Arc<PipelineContext>) -> Self {
        Self {
            steps: Vec::new(),
            router: Router::default(),
            entry: None,
            context,
        }
    }

    /// Register a step. Names must be unique; checked at build.
    pub fn register(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn register_arc(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    pub fn entry(mut self, step_name: impl Into<String>) -> Self {
        self.entry = Some(step_name.into());
        self
    }

    pub fn build(self) -> Result<PipelineExecutor> {
        if self.steps.is_empty() {
            return Err(PipelineError::Configuration(
                "Pipeline must have at least one step".to_string(),
            ));
        }

        let mut steps: HashMap<String, Arc<dyn Step>> = HashMap::new();
        for step in self.steps {
            let name = step.name().to_string();
            if steps.insert(name.clone(), step).is_some() {
                return Err(PipelineError::Configuration(format!(
                    "Duplicate step name '{name}'"
                )));
            }
        }

        let entry = self.entry.ok_or_else(|| {
            PipelineError::Configuration("Pipeline entry step not set".to_string())
        })?;
        if !steps.contains_key(&entry) {
            return Err(PipelineError::Configuration(format!(
                "Entry step '{entry}' is not registered"
            )));
        }

        if self.router.is_empty() {
            return Err(PipelineError::Configuration(
                "Routing table is empty".to_string(),
            ));
        }
        for target in self.router.targets() {
            if !steps.contains_key(target) {
                return Err(PipelineError::Configuration(format!(
                    "Routing target '{target}' is not registered"
                )));
            }
        }

        let max_invocations = steps.len() * 2;
        Ok(PipelineExecutor {
            steps,
            router: self.router,
            entry,
            context: self.context,
            max_invocations,
        })
    }
}
