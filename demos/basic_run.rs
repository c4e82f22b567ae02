//! Run one request through the canonical pipeline against a local Ollama.
//!
//! ```sh
//! cargo run --example basic_run
//! ```

use std::sync::Arc;

use llm_costpipe::{
    KeywordRetriever, OllamaClient, PipelineContext, PipelineExecutor, PipelineRequest, TierTable,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let context = Arc::new(PipelineContext::new(
        TierTable::ollama_default(),
        Arc::new(OllamaClient::new("http://localhost:11434")),
        Arc::new(KeywordRetriever::from_texts([
            "Tokio is an asynchronous runtime for the Rust programming language.",
            "Rust guarantees memory safety without a garbage collector.",
            "Cargo is Rust's package manager and build tool.",
        ])),
    ));
    let executor = PipelineExecutor::canonical(context);

    let response = executor
        .run(PipelineRequest::new("What is Tokio used for in Rust?"))
        .await?;

    println!("Answer:\n{}\n", response.answer);
    println!("Steps executed: {:?}", response.debug.nodes_executed);
    println!("Cache hits:     {:?}", response.debug.cache_hits);
    println!("Models used:    {:?}", response.debug.models_used);
    println!(
        "Cost:           ${:.6} ({} in / {} out tokens)",
        response.debug.cost_breakdown.total_cost_usd,
        response.debug.cost_breakdown.total_input_tokens,
        response.debug.cost_breakdown.total_output_tokens,
    );
    Ok(())
}
