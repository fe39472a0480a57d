//! Parallel research with a merge step, followed by an editor.
//!
//! Three researchers work concurrently on their own branches; a merge
//! agent combines what they found; an editor then polishes the result
//! using the merged text from state.
//!
//! Uses MockProvider with artificial latency.
//!   RUST_LOG=weft=debug cargo run --example parallel_research

use std::sync::Arc;
use std::time::{Duration, Instant};
use weft::*;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let provider = MockProvider::from_fn(|request| match request.agent_name.as_str() {
        "synthesizer" => MockResponse::text(
            "Solar is cheapest, wind is steadiest, storage is the bottleneck.",
        ),
        "editor" => {
            MockResponse::text("Energy in one line: cheap sun, steady wind, scarce batteries.")
        }
        topic => MockResponse::text(format!("Key finding on {}", topic)),
    })
    .with_latency(Duration::from_millis(300));

    let researchers = ["solar", "wind", "storage"]
        .into_iter()
        .map(|topic| {
            Arc::new(
                AgentSpec::llm(topic)
                    .with_description(format!("Researches {} energy", topic))
                    .with_instruction(format!("Research {} energy. One sentence.", topic)),
            )
        })
        .collect();
    let synthesizer = AgentSpec::llm("synthesizer")
        .with_instruction("Combine the researchers' findings into one paragraph.");
    let research = AgentSpec::parallel("research", researchers)
        .with_merge(Arc::new(synthesizer))
        .with_output_key("summary");
    let editor = AgentSpec::llm("editor").with_instruction("Tighten this summary: {summary}");
    let root = AgentSpec::sequential("report", vec![Arc::new(research), Arc::new(editor)]);

    let mut registry = AgentRegistry::new();
    let config = RunConfig::new("research_demo").with_default_model("mock");
    let runner = match registry
        .register(Arc::new(root))
        .and_then(|()| Runner::from_registry(config, &registry, "report", Arc::new(provider)))
    {
        Ok(runner) => runner,
        Err(e) => {
            eprintln!("bad agent tree: {}", e);
            return;
        }
    };
    println!("registered agents: {}\n", registry.names().join(", "));

    let started = Instant::now();
    let events = match runner.run_text("analyst", "energy", "State of clean energy").await {
        Ok(stream) => stream.collect_all().await,
        Err(e) => {
            eprintln!("could not start: {}", e);
            return;
        }
    };
    for event in &events {
        if let Some(text) = event.text() {
            let branch = event.branch.as_deref().unwrap_or("-");
            println!("{:<20} [{}] {}", branch, event.author, text);
        }
    }
    // Three 300ms researchers in parallel, then two sequential calls.
    println!("\ntook {:?}", started.elapsed());
}
