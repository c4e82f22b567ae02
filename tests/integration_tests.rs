use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use llm_costpipe::*;

/// Scripted model: distinct needles for each built-in step's prompt.
fn scripted_client(label: &str) -> MockClient {
    MockClient::new()
        .reply_when("Classify", label)
        .reply_when("Condense", "Condensed background facts.")
        .reply_when("Work through", "Step-by-step analysis.")
        .reply_when("Answer the user's question", "The final answer.")
}

fn make_context(client: MockClient) -> (Arc<PipelineContext>, Arc<MockClient>) {
    let client = Arc::new(client);
    let context = Arc::new(PipelineContext::new(
        TierTable::ollama_default(),
        client.clone(),
        Arc::new(KeywordRetriever::from_texts([
            "Tokio is an asynchronous runtime for the Rust language.",
            "Rust guarantees memory safety without garbage collection.",
            "The capital of France is Paris.",
        ])),
    ));
    (context, client)
}

fn canonical(label: &str) -> (PipelineExecutor, Arc<MockClient>) {
    let (context, client) = make_context(scripted_client(label));
    (PipelineExecutor::canonical(context), client)
}

// --- Canonical routing scenarios ---

#[tokio::test]
async fn test_simple_query_runs_two_steps() {
    let (executor, client) = canonical("simple");
    let response = executor
        .run(PipelineRequest::new("What is 2+2?"))
        .await
        .unwrap();

    assert_eq!(response.answer, "The final answer.");
    assert_eq!(response.debug.nodes_executed, vec!["triage", "summary"]);
    assert_eq!(response.debug.cache_hits["triage"], false);
    assert_eq!(response.debug.cache_hits["summary"], false);
    assert_eq!(client.call_count(), 2);

    // Cost is positive but bounded to the two calls made.
    let cost = &response.debug.cost_breakdown;
    assert!(cost.total_cost_usd > 0.0);
    assert_eq!(cost.by_node.len(), 2);
    assert!(cost.by_node.contains_key("triage"));
    assert!(cost.by_node.contains_key("summary"));
}

#[tokio::test]
async fn test_retrieval_query_skips_reasoning() {
    let (executor, _client) = canonical("retrieval");
    let response = executor
        .run(PipelineRequest::new("What language uses Tokio runtime?"))
        .await
        .unwrap();

    assert_eq!(
        response.debug.nodes_executed,
        vec!["triage", "retrieval", "summary"]
    );
    assert!(!response.debug.cost_breakdown.by_node.contains_key("reasoning"));
}

#[tokio::test]
async fn test_complex_query_runs_full_chain() {
    let (executor, _client) = canonical("complex");
    let response = executor
        .run(PipelineRequest::new(
            "Compare Rust memory safety with runtime approaches in Tokio",
        ))
        .await
        .unwrap();

    assert_eq!(
        response.debug.nodes_executed,
        vec!["triage", "retrieval", "reasoning", "summary"]
    );
    // No skip markers on the full path.
    assert!(response
        .debug
        .nodes_executed
        .iter()
        .all(|n| !n.ends_with("_skipped")));
    assert_eq!(response.debug.cost_breakdown.by_node.len(), 4);
}

#[tokio::test]
async fn test_garbled_classification_takes_conservative_path() {
    // Label the model can produce but the parser cannot read.
    let (executor, _client) = canonical("@@@!!!");
    let response = executor
        .run(PipelineRequest::new("Tokio runtime question"))
        .await
        .unwrap();
    assert_eq!(
        response.debug.nodes_executed,
        vec!["triage", "retrieval", "reasoning", "summary"]
    );
}

// --- Caching ---

#[tokio::test]
async fn test_second_run_hits_cache_at_zero_cost() {
    let (executor, client) = canonical("simple");

    let first = executor
        .run(PipelineRequest::new("What is 2+2?"))
        .await
        .unwrap();
    assert_eq!(first.debug.cache_hits["triage"], false);
    let calls_after_first = client.call_count();

    let second = executor
        .run(PipelineRequest::new("What is 2+2?"))
        .await
        .unwrap();
    assert_eq!(second.debug.cache_hits["triage"], true);
    assert_eq!(second.debug.cache_hits["summary"], true);
    assert_eq!(second.debug.cost_breakdown.total_cost_usd, 0.0);
    assert!(second.debug.models_used.is_empty());
    // No model calls at all on the cached run.
    assert_eq!(client.call_count(), calls_after_first);
    // And the answer is identical.
    assert_eq!(second.answer, first.answer);
}

#[tokio::test]
async fn test_different_inputs_do_not_share_cache() {
    let (executor, client) = canonical("simple");
    executor
        .run(PipelineRequest::new("What is 2+2?"))
        .await
        .unwrap();
    let response = executor
        .run(PipelineRequest::new("What is 3+3?"))
        .await
        .unwrap();
    assert_eq!(response.debug.cache_hits["triage"], false);
    assert_eq!(client.call_count(), 4);
}

#[tokio::test]
async fn test_expired_cache_entry_recomputes() {
    let (context, client) = make_context(scripted_client("simple"));
    let executor = PipelineExecutor::builder(context)
        .register(TriageStep::new().with_cache_ttl(Duration::ZERO))
        .register(SummaryStep::new().with_cache_ttl(Duration::ZERO))
        .register(RetrievalStep::new())
        .register(ReasoningStep::new())
        .router(Router::canonical())
        .entry("triage")
        .build()
        .unwrap();

    executor
        .run(PipelineRequest::new("What is 2+2?"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = executor
        .run(PipelineRequest::new("What is 2+2?"))
        .await
        .unwrap();
    assert_eq!(second.debug.cache_hits["triage"], false);
    assert_eq!(client.call_count(), 4);
}

// --- Cost accounting ---

#[tokio::test]
async fn test_ledger_total_equals_sum_of_per_request_breakdowns() {
    let (executor, _client) = canonical("simple");
    let inputs = ["q one", "q two", "q three"];
    let mut per_request_total = 0.0;
    for input in inputs {
        let response = executor.run(PipelineRequest::new(input)).await.unwrap();
        per_request_total += response.debug.cost_breakdown.total_cost_usd;
    }

    let ledger = &executor.context().ledger;
    assert_eq!(ledger.len(), 6);
    assert!((ledger.total_cost_usd() - per_request_total).abs() < 1e-12);
    assert!((ledger.breakdown().total_cost_usd - per_request_total).abs() < 1e-12);
}

#[tokio::test]
async fn test_models_used_follows_tier_table() {
    let (executor, _client) = canonical("simple");
    let response = executor
        .run(PipelineRequest::new("What is 2+2?"))
        .await
        .unwrap();
    // Triage runs on the cheap tier, summary on medium.
    let table = TierTable::ollama_default();
    assert_eq!(
        response.debug.models_used,
        vec![
            table.resolve(ModelTier::Cheap).id.clone(),
            table.resolve(ModelTier::Medium).id.clone(),
        ]
    );
}

#[tokio::test]
async fn test_concurrent_requests_do_not_corrupt_the_ledger() {
    let (executor, client) = canonical("simple");
    let executor = Arc::new(executor);

    let runs = (0..8).map(|i| {
        let executor = executor.clone();
        async move {
            executor
                .run(PipelineRequest::new(format!("question number {i}")))
                .await
        }
    });
    let results = futures::future::join_all(runs).await;

    let mut total = 0.0;
    for result in results {
        let response = result.unwrap();
        assert_eq!(response.debug.nodes_executed, vec!["triage", "summary"]);
        assert!(response.debug.cost_breakdown.total_cost_usd > 0.0);
        total += response.debug.cost_breakdown.total_cost_usd;
    }
    assert_eq!(client.call_count(), 16);
    let ledger = &executor.context().ledger;
    assert_eq!(ledger.len(), 16);
    assert!((ledger.total_cost_usd() - total).abs() < 1e-12);
}

// --- Skip markers ---

#[tokio::test]
async fn test_inapplicable_step_leaves_skip_marker_and_no_cost() {
    // A routing table that walks a simple query through reasoning anyway.
    let (context, client) = make_context(scripted_client("simple"));
    let executor = PipelineExecutor::builder(context)
        .register(TriageStep::new())
        .register(ReasoningStep::new())
        .register(SummaryStep::new())
        .router(
            Router::builder()
                .otherwise("triage", "reasoning")
                .otherwise("reasoning", "summary")
                .terminal("summary")
                .build(),
        )
        .entry("triage")
        .build()
        .unwrap();

    let response = executor
        .run(PipelineRequest::new("What is 2+2?"))
        .await
        .unwrap();
    assert_eq!(
        response.debug.nodes_executed,
        vec!["triage", "reasoning_skipped", "summary"]
    );
    // The skipped step made no model call, recorded no cost, and left no
    // cache-hit flag.
    assert!(!response.debug.cost_breakdown.by_node.contains_key("reasoning"));
    assert!(!response.debug.cache_hits.contains_key("reasoning"));
    assert!(client
        .calls()
        .iter()
        .all(|c| !c.prompt.contains("Work through")));
}

// --- Failure handling ---

#[tokio::test]
async fn test_empty_input_fails_fast() {
    let (executor, client) = canonical("simple");
    let failure = executor
        .run(PipelineRequest::new("   "))
        .await
        .unwrap_err();
    assert!(matches!(failure.error, PipelineError::EmptyInput));
    assert!(failure.debug.nodes_executed.is_empty());
    assert_eq!(client.call_count(), 0);
}

/// Client that stalls only on the reasoning prompt.
struct SlowReasoningClient {
    inner: MockClient,
}

#[async_trait]
impl ModelClient for SlowReasoningClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        if request.prompt.contains("Work through") {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        self.inner.complete(request).await
    }
}

#[tokio::test]
async fn test_timeout_on_reasoning_reports_step_and_partial_trail() {
    let client = Arc::new(SlowReasoningClient {
        inner: scripted_client("complex"),
    });
    let context = Arc::new(
        PipelineContext::new(
            TierTable::ollama_default(),
            client,
            Arc::new(KeywordRetriever::from_texts(["Tokio runtime document"])),
        )
        .with_call_timeout(Duration::from_millis(50)),
    );
    let executor = PipelineExecutor::canonical(context);

    let failure = executor
        .run(PipelineRequest::new("Tokio deep comparison question"))
        .await
        .unwrap_err();

    match &failure.error {
        PipelineError::StepTimeout { step } => assert_eq!(step, "reasoning"),
        other => panic!("Expected StepTimeout, got {other:?}"),
    }
    // Summary never ran; the trail shows exactly how far execution got.
    assert_eq!(failure.debug.nodes_executed, vec!["triage", "retrieval"]);
    // The cost spent before the failure is still reported.
    assert_eq!(failure.debug.cost_breakdown.by_node.len(), 2);
    assert!(failure.debug.cost_breakdown.total_cost_usd > 0.0);
}

#[tokio::test]
async fn test_transient_model_failures_are_retried() {
    // First two attempts fail transiently; the retry loop absorbs them.
    let (context, client) = make_context(scripted_client("simple").fail_first(2));
    let executor = PipelineExecutor::canonical(context);

    let response = executor
        .run(PipelineRequest::new("What is 2+2?"))
        .await
        .unwrap();
    assert_eq!(response.debug.nodes_executed, vec!["triage", "summary"]);
    // 2 failed triage attempts + 1 good triage + 1 summary.
    assert_eq!(client.call_count(), 4);
    // Only successful calls hit the ledger.
    assert_eq!(executor.context().ledger.len(), 2);
}

#[tokio::test]
async fn test_persistent_model_failure_surfaces_with_partial_trail() {
    let client = Arc::new(scripted_client("simple").fail_first(100));
    let context = Arc::new(PipelineContext::new(
        TierTable::ollama_default(),
        client,
        Arc::new(KeywordRetriever::from_texts(["doc"])),
    ));
    let executor = PipelineExecutor::canonical(context);

    let failure = executor
        .run(PipelineRequest::new("What is 2+2?"))
        .await
        .unwrap_err();
    assert!(matches!(failure.error, PipelineError::ModelCall { .. }));
    assert!(failure.debug.nodes_executed.is_empty());
    assert_eq!(failure.debug.cost_breakdown.total_cost_usd, 0.0);
}

#[tokio::test]
async fn test_routing_cycle_hits_invocation_cap() {
    let (context, _client) = make_context(scripted_client("simple"));
    let executor = PipelineExecutor::builder(context)
        .register(TriageStep::new())
        .register(SummaryStep::new())
        .router(
            Router::builder()
                .otherwise("triage", "summary")
                .otherwise("summary", "triage")
                .build(),
        )
        .entry("triage")
        .build()
        .unwrap();

    let failure = executor
        .run(PipelineRequest::new("What is 2+2?"))
        .await
        .unwrap_err();
    match failure.error {
        PipelineError::PipelineLoop { cap } => assert_eq!(cap, 4),
        other => panic!("Expected PipelineLoop, got {other:?}"),
    }
    // The trail shows the cycle before the cap tripped.
    assert_eq!(failure.debug.nodes_executed.len(), 4);
}

// --- Response envelope ---

#[tokio::test]
async fn test_response_serializes_to_expected_shape() {
    let (executor, _client) = canonical("simple");
    let response = executor
        .run(
            PipelineRequest::new("What is 2+2?")
                .with_session("session-1")
                .with_scenario_hint("math"),
        )
        .await
        .unwrap();

    let json = serde_json::to_value(&response).unwrap();
    assert!(json["answer"].is_string());
    assert!(json["debug"]["nodes_executed"].is_array());
    assert!(json["debug"]["cache_hits"]["triage"].is_boolean());
    assert!(json["debug"]["cost_breakdown"]["total_cost_usd"].is_number());
    assert!(json["debug"]["cost_breakdown"]["by_node"].is_object());
    assert!(json["debug"]["cost_breakdown"]["by_model"].is_object());
}

#[tokio::test]
async fn test_request_deserializes_with_optional_fields() {
    let request: PipelineRequest =
        serde_json::from_str(r#"{"user_input": "hello"}"#).unwrap();
    assert_eq!(request.user_input, "hello");
    assert!(request.session_id.is_none());
    assert!(request.scenario_hint.is_none());
}
