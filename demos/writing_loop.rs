//! Writer/critic refinement loop.
//!
//! A writer drafts, a critic reviews, and the loop ends when the critic
//! says "APPROVED" or after four rounds. Streams events as they happen.
//!
//! With `OPENAI_API_KEY` set (a `.env` file works too) it talks to a real
//! model; otherwise a scripted mock plays both parts.
//!   cargo run --example writing_loop

use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use weft::provider::{OpenAiCompatProvider, OpenAiConfig};
use weft::*;

fn provider() -> Arc<dyn ModelProvider> {
    if let Ok(config) = OpenAiConfig::from_env() {
        return Arc::new(OpenAiCompatProvider::new(config));
    }
    println!("OPENAI_API_KEY not set, using the mock provider\n");
    let rounds = AtomicUsize::new(0);
    Arc::new(MockProvider::from_fn(move |request| {
        match request.agent_name.as_str() {
            "writer" => MockResponse::text("The kettle hums, a small sun in the kitchen."),
            _ if rounds.fetch_add(1, Ordering::SeqCst) == 0 => {
                MockResponse::text("Good image. Make the ending land harder.")
            }
            _ => MockResponse::text("APPROVED"),
        }
    }))
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let writer = AgentSpec::llm("writer")
        .with_instruction("Write or revise a single-sentence story. Feedback so far: {feedback?}")
        .with_output_key("draft");
    let critic = AgentSpec::llm("critic")
        .with_instruction(
            "Review this draft: {draft}\nReply APPROVED if it is ready, otherwise give one note.",
        )
        .with_output_key("feedback");
    let root = AgentSpec::loop_of("refine", vec![Arc::new(writer), Arc::new(critic)])
        .with_max_iterations(4)
        .with_completion_signal(CompletionSignal::new("critic", "APPROVED"));

    let config = RunConfig::new("writing_demo").with_default_model("gpt-4o-mini");
    let runner = Runner::new(config, Arc::new(root), provider());

    let mut stream = match runner.run_text("demo_user", "story", "A story about tea").await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("could not start: {}", e);
            return;
        }
    };
    while let Some(event) = stream.next().await {
        if let Some(text) = event.text() {
            println!("[{}] {}", event.author, text);
        }
        if event.author == "refine" {
            let verdict = if event.actions.escalate {
                "approved"
            } else {
                "ran out of rounds"
            };
            println!("\n--- loop finished: {} ---", verdict);
        }
    }
}
