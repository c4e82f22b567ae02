//! Run a small batch of queries and print the process-wide cost report,
//! including what the cache saved on repeats.
//!
//! ```sh
//! cargo run --example cost_report
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
            "The borrow checker enforces ownership rules at compile time.",
        ])),
    ));
    let executor = PipelineExecutor::canonical(context.clone());

    let queries = [
        "What is 2+2?",
        "How does the borrow checker work?",
        "How does the borrow checker work?", // repeat: should hit the cache
        "Compare Tokio's scheduler with OS threads for IO-bound work",
    ];

    for query in queries {
        match executor.run(PipelineRequest::new(query)).await {
            Ok(response) => println!(
                "{:60} steps={:?} cost=${:.6}",
                query,
                response.debug.nodes_executed,
                response.debug.cost_breakdown.total_cost_usd,
            ),
            Err(failure) => println!(
                "{:60} FAILED ({}) after {:?}",
                query, failure.error, failure.debug.nodes_executed,
            ),
        }
    }

    let breakdown = context.ledger.breakdown();
    println!("\n== Process cost report ==");
    println!(
        "total: ${:.6} ({} in / {} out tokens, {} calls)",
        breakdown.total_cost_usd,
        breakdown.total_input_tokens,
        breakdown.total_output_tokens,
        context.ledger.len(),
    );
    println!("by step:");
    for (step, cost) in &breakdown.by_node {
        println!("  {:12} ${:.6}", step, cost);
    }
    println!("by model:");
    for (model, cost) in &breakdown.by_model {
        println!("  {:24} ${:.6}", model, cost);
    }
    Ok(())
}
