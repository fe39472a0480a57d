//! Runs against MockProvider: the model turn loop, delegation, callbacks,
//! error handling and session persistence.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use weft::provider::{MockToolCall, ProviderError, StreamEvent};
use weft::*;

const USER: &str = "user_1";
const SESSION: &str = "session_1";

fn runner(root: AgentSpec, provider: Arc<dyn ModelProvider>) -> Runner {
    runner_with(RunConfig::new("test_app"), root, provider)
}

fn runner_with(config: RunConfig, root: AgentSpec, provider: Arc<dyn ModelProvider>) -> Runner {
    Runner::new(config.with_default_model("mock"), Arc::new(root), provider)
}

async fn run(runner: &Runner, text: &str) -> Vec<Event> {
    runner
        .run_text(USER, SESSION, text)
        .await
        .unwrap()
        .collect_all()
        .await
}

async fn saved(runner: &Runner) -> Session {
    runner
        .session_service()
        .get(&SessionKey::new("test_app", USER, SESSION))
        .await
        .unwrap()
        .unwrap()
}

fn after_tool_result(request: &ModelRequest) -> bool {
    matches!(request.messages.last(), Some(Message::ToolResult { .. }))
}

fn noop_tool(name: &str) -> ToolSpec {
    ToolSpec::sync_function(
        name,
        "Does nothing",
        json!({"type": "object", "properties": {}}),
        |_args, _ctx| Ok(json!("done")),
    )
}

fn errors(events: &[Event]) -> Vec<ErrorKind> {
    events.iter().filter_map(Event::error_kind).collect()
}

#[tokio::test]
async fn test_single_agent_answers() {
    let provider = Arc::new(MockProvider::text("Hello, world!"));
    let runner = runner(
        AgentSpec::llm("greeter").with_instruction("Be brief."),
        provider.clone(),
    );

    let events = run(&runner, "Hi").await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].author, "greeter");
    assert_eq!(events[0].text().as_deref(), Some("Hello, world!"));
    assert!(events[0].is_final);

    let requests = provider.requests();
    assert_eq!(requests[0].system_instruction, "Be brief.");
    assert_eq!(requests[0].model, "mock");
    assert_eq!(requests[0].last_user_text().as_deref(), Some("Hi"));

    // user turn + answer
    assert_eq!(saved(&runner).await.events.len(), 2);
}

#[tokio::test]
async fn test_sequential_child_waits_for_predecessor() {
    let log = Arc::new(Mutex::new(Vec::<String>::new()));

    let check_log = log.clone();
    let check = ToolSpec::sync_function(
        "check",
        "Record that this step ran",
        json!({"type": "object", "properties": {}}),
        move |_args, ctx| {
            check_log.lock().unwrap().push(format!("check:{}", ctx.agent_name));
            Ok(json!("noted"))
        },
    );
    let model_log = log.clone();
    let provider = MockProvider::from_fn(move |request| {
        model_log
            .lock()
            .unwrap()
            .push(format!("model:{}", request.agent_name));
        match request.agent_name.as_str() {
            "a" if !after_tool_result(request) => MockResponse::call("check", json!({})),
            "a" => MockResponse::text("A done"),
            _ => MockResponse::text("B done"),
        }
    });
    let provider = Arc::new(provider);
    let root = AgentSpec::sequential(
        "pipeline",
        vec![
            Arc::new(AgentSpec::llm("a").with_tool(check)),
            Arc::new(AgentSpec::llm("b")),
        ],
    );
    let runner = runner(root, provider.clone());

    let events = run(&runner, "go").await;
    assert_eq!(
        *log.lock().unwrap(),
        ["model:a", "check:a", "model:a", "model:b"]
    );

    let a_final = events
        .iter()
        .position(|e| e.author == "a" && e.is_final)
        .unwrap();
    let b_first = events.iter().position(|e| e.author == "b").unwrap();
    assert!(a_final < b_first);

    // B sees A's output as context from another agent.
    let b_request = provider
        .requests()
        .into_iter()
        .find(|r| r.agent_name == "b")
        .unwrap();
    let context = b_request.last_user_text().unwrap();
    assert!(context.starts_with("For context:"));
    assert!(context.contains("[a] said: A done"));
}

#[tokio::test]
async fn test_transfer_to_known_sub_agent() {
    let provider = Arc::new(MockProvider::from_fn(|request| {
        match request.agent_name.as_str() {
            "router" => MockResponse::call("transfer_to_agent", json!({"agent_name": "billing"})),
            _ => MockResponse::text("Your refund has been issued."),
        }
    }));
    let root = AgentSpec::llm("router")
        .with_instruction("Route the customer.")
        .with_sub_agent(Arc::new(
            AgentSpec::llm("billing").with_description("Handles invoices and refunds"),
        ));
    let runner = runner(root, provider.clone());

    let events = run(&runner, "I want my money back").await;
    assert_eq!(events.len(), 3);
    assert!(events[0].has_tool_calls());
    assert_eq!(
        events[1].actions.transfer_to_agent.as_deref(),
        Some("billing")
    );
    assert!(!events[1].is_final);
    assert_eq!(events[2].author, "billing");
    assert_eq!(
        events[2].text().as_deref(),
        Some("Your refund has been issued.")
    );

    let router_request = &provider.requests()[0];
    assert!(router_request
        .system_instruction
        .contains("- billing: Handles invoices and refunds"));
    assert!(router_request
        .tools
        .iter()
        .any(|t| t.name == "transfer_to_agent"));
}

#[tokio::test]
async fn test_transfer_to_unknown_agent_halts_with_one_delegation_error() {
    let provider = Arc::new(MockProvider::from_fn(|request| {
        match request.agent_name.as_str() {
            "router" => MockResponse::call("transfer_to_agent", json!({"agent_name": "ghost"})),
            _ => MockResponse::text("unexpected"),
        }
    }));
    let root = AgentSpec::llm("router").with_sub_agent(Arc::new(AgentSpec::llm("billing")));
    let runner = runner(root, provider.clone());

    let events = run(&runner, "help").await;
    assert_eq!(errors(&events), [ErrorKind::Delegation]);
    let last = events.last().unwrap();
    assert!(last.is_final);
    assert!(last.has_tool_responses());
    assert!(events.iter().all(|e| e.author != "billing"));
    assert_eq!(provider.requests().len(), 1);
}

#[tokio::test]
async fn test_delegation_error_reported_to_model() {
    let provider = Arc::new(MockProvider::from_fn(|request| {
        if after_tool_result(request) {
            MockResponse::text("Sorry, I could not find that department.")
        } else {
            MockResponse::call("transfer_to_agent", json!({"agent_name": "ghost"}))
        }
    }));
    let root = AgentSpec::llm("router").with_sub_agent(Arc::new(AgentSpec::llm("billing")));
    let config = RunConfig::new("test_app").with_error_policy(ErrorPolicy::ReportToModel);
    let runner = runner_with(config, root, provider.clone());

    let events = run(&runner, "help").await;
    assert_eq!(errors(&events), [ErrorKind::Delegation]);
    assert_eq!(
        events.last().unwrap().text().as_deref(),
        Some("Sorry, I could not find that department.")
    );

    let retry = &provider.requests()[1];
    match retry.messages.last() {
        Some(Message::ToolResult {
            is_error, response, ..
        }) => {
            assert!(*is_error);
            assert!(response["error"].as_str().unwrap().contains("ghost"));
        }
        other => panic!("expected an error tool result, got {:?}", other),
    }
}

#[tokio::test]
async fn test_tool_error_halts_by_default() {
    let failing = ToolSpec::sync_function(
        "lookup_order",
        "Look up an order",
        json!({"type": "object", "properties": {}}),
        |_args, _ctx| Err(ToolError::Failed("orders database offline".into())),
    );
    let provider = Arc::new(MockProvider::from_fn(|request| {
        if after_tool_result(request) {
            MockResponse::text("recovered")
        } else {
            MockResponse::call("lookup_order", json!({}))
        }
    }));
    let runner = runner(AgentSpec::llm("support").with_tool(failing), provider.clone());

    let events = run(&runner, "where is my order").await;
    assert_eq!(errors(&events), [ErrorKind::ToolExecution]);
    assert!(events.last().unwrap().is_final);
    assert_eq!(provider.requests().len(), 1);
}

#[tokio::test]
async fn test_model_error_becomes_dependency_event() {
    let provider = Arc::new(MockProvider::new(vec![MockResponse::Error(
        "model overloaded".into(),
    )]));
    let runner = runner(AgentSpec::llm("support"), provider);

    let events = run(&runner, "hello").await;
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert!(event.is_final);
    assert_eq!(event.error_kind(), Some(ErrorKind::Dependency));
    assert!(event.error.as_ref().unwrap().message.contains("model overloaded"));
}

#[tokio::test]
async fn test_llm_call_limit() {
    let provider = Arc::new(MockProvider::from_fn(|_request| {
        MockResponse::call("spin", json!({}))
    }));
    let config = RunConfig::new("test_app").with_max_llm_calls(3);
    let spinner = AgentSpec::llm("spinner").with_tool(noop_tool("spin"));
    let runner = runner_with(config, spinner, provider.clone());

    let events = run(&runner, "go").await;
    assert_eq!(provider.requests().len(), 3);
    assert_eq!(errors(&events), [ErrorKind::LimitExceeded]);
    assert!(events.last().unwrap().is_final);
}

#[tokio::test]
async fn test_several_tool_calls_in_one_turn() {
    let provider = Arc::new(MockProvider::new(vec![
        MockResponse::ToolCalls(vec![
            MockToolCall::new("first", json!({})),
            MockToolCall::new("second", json!({})),
        ]),
        MockResponse::text("both done"),
    ]));
    let runner = runner(
        AgentSpec::llm("worker").with_tools(vec![noop_tool("first"), noop_tool("second")]),
        provider.clone(),
    );

    let events = run(&runner, "do both").await;
    assert_eq!(events.len(), 3);
    assert_eq!(events[1].content.len(), 2);
    let results = provider.requests()[1]
        .messages
        .iter()
        .filter(|m| m.role() == "toolResult")
        .count();
    assert_eq!(results, 2);
}

#[tokio::test]
async fn test_before_agent_override_skips_agent() {
    let callbacks = Callbacks::new().before_agent(|ctx| {
        if ctx.state.get("maintenance") == Some(json!(true)) {
            Ok(HookOutcome::Override("We are down for maintenance.".into()))
        } else {
            Ok(HookOutcome::Continue)
        }
    });
    let provider = Arc::new(MockProvider::text("normal answer"));
    let runner = runner(AgentSpec::llm("support").with_callbacks(callbacks), provider.clone());

    let mut state = StateMap::new();
    state.insert("maintenance".into(), json!(true));
    runner
        .session_service()
        .create(&SessionKey::new("test_app", USER, SESSION), state)
        .await
        .unwrap();

    let events = run(&runner, "hello").await;
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].text().as_deref(),
        Some("We are down for maintenance.")
    );
    assert!(events[0].is_final);
    assert!(provider.requests().is_empty());
}

#[tokio::test]
async fn test_model_hooks_rewrite_request_and_response() {
    let callbacks = Callbacks::new()
        .before_model(|_ctx, request| {
            request.system_instruction.push_str(" Answer in French.");
            Ok(HookOutcome::Continue)
        })
        .after_model(|_ctx, response| {
            if response
                .joined_text()
                .is_some_and(|t| t.contains("password"))
            {
                Ok(HookOutcome::Override(ModelResponse::text("[redacted]")))
            } else {
                Ok(HookOutcome::Continue)
            }
        });
    let provider = Arc::new(MockProvider::text("the password is hunter2"));
    let runner = runner(
        AgentSpec::llm("support")
            .with_instruction("Be helpful.")
            .with_callbacks(callbacks),
        provider.clone(),
    );

    let events = run(&runner, "what is the password").await;
    assert_eq!(events.last().unwrap().text().as_deref(), Some("[redacted]"));
    assert_eq!(
        provider.requests()[0].system_instruction,
        "Be helpful. Answer in French."
    );
}

#[tokio::test]
async fn test_before_model_override_skips_provider() {
    let callbacks = Callbacks::new().before_model(|ctx, _request| {
        if ctx.user_text().as_deref() == Some("ping") {
            Ok(HookOutcome::Override(ModelResponse::text("pong")))
        } else {
            Ok(HookOutcome::Continue)
        }
    });
    let provider = Arc::new(MockProvider::text("from the model"));
    let runner = runner(AgentSpec::llm("echo").with_callbacks(callbacks), provider.clone());

    let events = run(&runner, "ping").await;
    assert_eq!(events[0].text().as_deref(), Some("pong"));
    assert!(provider.requests().is_empty());
}

#[tokio::test]
async fn test_after_agent_hooks_chain() {
    let callbacks = Callbacks::new()
        .after_agent(|_ctx, output| {
            Ok(HookOutcome::Override(format!("{}!", output.unwrap_or(""))))
        })
        .after_agent(|_ctx, output| {
            Ok(HookOutcome::Override(output.unwrap_or("").to_uppercase()))
        });
    let runner = runner(
        AgentSpec::llm("shouter")
            .with_output_key("shout")
            .with_callbacks(callbacks),
        Arc::new(MockProvider::text("hi")),
    );

    let events = run(&runner, "say hi").await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].text().as_deref(), Some("hi"));
    assert_eq!(events[1].text().as_deref(), Some("HI!"));
    assert_eq!(saved(&runner).await.state["shout"], json!("HI!"));
}

#[tokio::test]
async fn test_callback_error_surfaces_as_dependency() {
    let callbacks = Callbacks::new()
        .before_model(|_ctx, _request| Err(CallbackError::new("guardrail service down")));
    let provider = Arc::new(MockProvider::text("never"));
    let runner = runner(AgentSpec::llm("guarded").with_callbacks(callbacks), provider.clone());

    let events = run(&runner, "hello").await;
    assert_eq!(errors(&events), [ErrorKind::Dependency]);
    assert!(events.last().unwrap().is_final);
    assert!(provider.requests().is_empty());
}

#[tokio::test]
async fn test_output_key_feeds_instruction_template() {
    let provider = Arc::new(MockProvider::from_fn(|request| {
        match request.agent_name.as_str() {
            "drafter" => MockResponse::text("Robots dream of gardens."),
            _ => MockResponse::text("Looks good."),
        }
    }));
    let root = AgentSpec::sequential(
        "writing",
        vec![
            Arc::new(AgentSpec::llm("drafter").with_output_key("draft")),
            Arc::new(
                AgentSpec::llm("reviewer")
                    .with_instruction("Review this draft: {draft} Tone: {tone?}."),
            ),
        ],
    );
    let runner = runner(root, provider.clone());

    let events = run(&runner, "write about robots").await;
    assert_eq!(
        events[0].actions.state_delta.get("draft"),
        Some(&json!("Robots dream of gardens."))
    );
    let reviewer = provider
        .requests()
        .into_iter()
        .find(|r| r.agent_name == "reviewer")
        .unwrap();
    assert_eq!(
        reviewer.system_instruction,
        "Review this draft: Robots dream of gardens. Tone: ."
    );
    assert_eq!(
        saved(&runner).await.state["draft"],
        json!("Robots dream of gardens.")
    );
}

#[tokio::test]
async fn test_missing_instruction_key_fails_agent() {
    let provider = Arc::new(MockProvider::text("never"));
    let runner = runner(
        AgentSpec::llm("reviewer").with_instruction("Review {draft}"),
        provider.clone(),
    );

    let events = run(&runner, "review").await;
    assert_eq!(errors(&events), [ErrorKind::NotFound]);
    assert!(events[0].error.as_ref().unwrap().message.contains("draft"));
    assert!(provider.requests().is_empty());
}

#[tokio::test]
async fn test_state_scopes_across_sessions() {
    let remember = ToolSpec::sync_function(
        "remember",
        "Remember the user's name",
        json!({"type": "object", "properties": {"name": {"type": "string"}}, "required": ["name"]}),
        |args, ctx| {
            ctx.state.set("user:name", args["name"].clone());
            ctx.state.set("temp:scratch", "x");
            ctx.state.set("turns", 1);
            Ok(json!("remembered"))
        },
    );
    let provider = Arc::new(MockProvider::from_fn(|request| {
        if request.last_user_text().as_deref() == Some("hello again") {
            MockResponse::text("Welcome back.")
        } else if after_tool_result(request) {
            MockResponse::text("Nice to meet you.")
        } else {
            MockResponse::call("remember", json!({"name": "Ada"}))
        }
    }));
    let runner = runner(
        AgentSpec::llm("concierge")
            .with_tool(remember)
            .with_instruction("The user is {user:name?}."),
        provider.clone(),
    );

    let events = run(&runner, "I'm Ada").await;
    let delta = &events[1].actions.state_delta;
    assert_eq!(delta.get("user:name"), Some(&json!("Ada")));
    assert_eq!(delta.get("temp:scratch"), Some(&json!("x")));

    let session = saved(&runner).await;
    assert_eq!(session.state["user:name"], json!("Ada"));
    assert!(!session.state.contains_key("temp:scratch"));

    // A second session of the same user sees the user-scoped key only.
    runner
        .run_text(USER, "session_2", "hello again")
        .await
        .unwrap()
        .collect_all()
        .await;
    let other = runner
        .session_service()
        .get(&SessionKey::new("test_app", USER, "session_2"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(other.state["user:name"], json!("Ada"));
    assert!(!other.state.contains_key("turns"));
    let last_request = provider.requests().pop().unwrap();
    assert_eq!(last_request.system_instruction, "The user is Ada.");
}

#[tokio::test]
async fn test_streaming_partials_are_not_persisted() {
    let runner = runner_with(
        RunConfig::new("test_app").with_streaming(true),
        AgentSpec::llm("narrator"),
        Arc::new(MockProvider::text("Once upon a time")),
    );

    let events = run(&runner, "tell me a story").await;
    let partial: String = events
        .iter()
        .filter(|e| e.partial)
        .filter_map(Event::text)
        .collect();
    assert_eq!(partial, "Once upon a time");
    let last = events.last().unwrap();
    assert!(last.is_final && !last.partial);

    let stored = saved(&runner).await.events;
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|e| !e.partial));
}

/// Drops the connection on the first attempt, after streaming part of the
/// answer when `stream_first`, then answers in full.
struct DroppedStream {
    attempts: AtomicUsize,
    stream_first: bool,
}

impl DroppedStream {
    fn new(stream_first: bool) -> Self {
        Self {
            attempts: AtomicUsize::new(0),
            stream_first,
        }
    }
}

#[async_trait::async_trait]
impl ModelProvider for DroppedStream {
    async fn generate(
        &self,
        _request: ModelRequest,
        tx: mpsc::UnboundedSender<StreamEvent>,
        _cancel: CancellationToken,
    ) -> Result<ModelResponse, ProviderError> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            if self.stream_first {
                let _ = tx.send(StreamEvent::TextDelta {
                    delta: "Once upon".into(),
                });
            }
            return Err(ProviderError::Network("connection reset".into()));
        }
        let _ = tx.send(StreamEvent::TextDelta {
            delta: "Once upon a time".into(),
        });
        Ok(ModelResponse::text("Once upon a time"))
    }
}

fn streaming_with_fast_retry() -> RunConfig {
    RunConfig::new("test_app")
        .with_streaming(true)
        .with_retry(RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            ..RetryConfig::default()
        })
}

fn partial_text(events: &[Event]) -> String {
    events
        .iter()
        .filter(|e| e.partial)
        .filter_map(Event::text)
        .collect()
}

#[tokio::test]
async fn test_stream_broken_after_partial_is_not_retried() {
    let provider = Arc::new(DroppedStream::new(true));
    let runner = runner_with(
        streaming_with_fast_retry(),
        AgentSpec::llm("narrator"),
        provider.clone(),
    );

    let events = run(&runner, "tell me a story").await;
    assert_eq!(provider.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(partial_text(&events), "Once upon");
    assert_eq!(errors(&events), [ErrorKind::Dependency]);
    assert!(events.last().unwrap().is_final);
}

#[tokio::test]
async fn test_stream_broken_before_output_is_retried_once() {
    let provider = Arc::new(DroppedStream::new(false));
    let runner = runner_with(
        streaming_with_fast_retry(),
        AgentSpec::llm("narrator"),
        provider.clone(),
    );

    let events = run(&runner, "tell me a story").await;
    assert_eq!(provider.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(partial_text(&events), "Once upon a time");
    assert!(errors(&events).is_empty());
    assert_eq!(
        events.last().unwrap().text().as_deref(),
        Some("Once upon a time")
    );
}

fn verdict_schema() -> Value {
    json!({
        "type": "object",
        "properties": {"label": {"enum": ["spam", "ham"]}},
        "required": ["label"]
    })
}

#[tokio::test]
async fn test_structured_output_stored_as_value() {
    let provider = Arc::new(MockProvider::text("```json\n{\"label\": \"spam\"}\n```"));
    let runner = runner(
        AgentSpec::llm("classifier")
            .with_output_key("verdict")
            .with_output_schema(verdict_schema()),
        provider.clone(),
    );

    let events = run(&runner, "WIN A FREE CRUISE").await;
    assert!(errors(&events).is_empty());
    assert!(events.last().unwrap().is_final);
    assert_eq!(saved(&runner).await.state["verdict"], json!({"label": "spam"}));
    assert_eq!(
        provider.requests()[0].output_schema.as_ref(),
        Some(&verdict_schema())
    );
}

#[tokio::test]
async fn test_structured_output_mismatch_fails_agent() {
    for answer in [r#"{"label": "maybe"}"#, "I think it is spam"] {
        let runner = runner(
            AgentSpec::llm("classifier")
                .with_output_key("verdict")
                .with_output_schema(verdict_schema()),
            Arc::new(MockProvider::text(answer)),
        );

        let events = run(&runner, "WIN A FREE CRUISE").await;
        assert_eq!(errors(&events), [ErrorKind::ArgumentValidation], "{}", answer);
        assert_eq!(events.iter().filter(|e| e.is_final).count(), 1);
        assert!(events.last().unwrap().is_error());
        assert!(!saved(&runner).await.state.contains_key("verdict"));
    }
}

#[tokio::test]
async fn test_long_running_tool_pauses_then_resumes() {
    let approval = ToolSpec::sync_function(
        "request_approval",
        "Ask a manager to approve the purchase",
        json!({"type": "object", "properties": {"amount": {"type": "number"}}}),
        |_args, _ctx| Ok(json!({"status": "pending"})),
    )
    .long_running();
    let provider = Arc::new(MockProvider::from_fn(|request| {
        match request.messages.last() {
            Some(Message::ToolResult { response, .. }) if response["status"] == "approved" => {
                MockResponse::text("Approved, placing the order.")
            }
            _ => MockResponse::call("request_approval", json!({"amount": 250})),
        }
    }));
    let runner = runner(AgentSpec::llm("purchaser").with_tool(approval), provider.clone());

    let events = run(&runner, "buy a chair").await;
    let paused = events.last().unwrap();
    assert!(paused.is_final);
    assert_eq!(paused.long_running_tool_ids.len(), 1);
    let call_id = paused.long_running_tool_ids[0].clone();

    let resumed = runner
        .run(
            USER,
            SESSION,
            vec![Content::ToolResponse {
                id: call_id,
                name: "request_approval".into(),
                response: json!({"status": "approved"}),
                is_error: false,
            }],
        )
        .await
        .unwrap()
        .collect_all()
        .await;
    assert_eq!(
        resumed.last().unwrap().text().as_deref(),
        Some("Approved, placing the order.")
    );
    assert_eq!(provider.requests().len(), 2);
}

#[tokio::test]
async fn test_agent_as_tool_runs_isolated() {
    let researcher = Arc::new(AgentSpec::llm("researcher").with_description("Looks up facts"));
    let provider = Arc::new(MockProvider::from_fn(|request| {
        match request.agent_name.as_str() {
            "researcher" => MockResponse::text("Water boils at 100C at sea level."),
            _ if after_tool_result(request) => MockResponse::text("Summary: it boils at 100C."),
            _ => MockResponse::call("researcher", json!({"request": "boiling point of water"})),
        }
    }));
    let runner = runner(
        AgentSpec::llm("planner").with_tool(ToolSpec::agent(researcher)),
        provider.clone(),
    );

    let events = run(&runner, "when does water boil").await;
    let nested = events.iter().find(|e| e.author == "researcher").unwrap();
    assert!(nested
        .branch
        .as_deref()
        .is_some_and(|b| b.starts_with("researcher@")));

    let response = events
        .iter()
        .find(|e| e.author == "planner" && e.has_tool_responses())
        .unwrap();
    match &response.content[0] {
        Content::ToolResponse { response, .. } => {
            assert_eq!(response, &json!("Water boils at 100C at sea level."))
        }
        other => panic!("expected a tool response, got {:?}", other),
    }
    assert_eq!(
        events.last().unwrap().text().as_deref(),
        Some("Summary: it boils at 100C.")
    );

    // The nested agent sees only the request it was handed.
    let nested_request = provider
        .requests()
        .into_iter()
        .find(|r| r.agent_name == "researcher")
        .unwrap();
    assert_eq!(nested_request.messages.len(), 1);
    assert_eq!(
        nested_request.last_user_text().as_deref(),
        Some("boiling point of water")
    );

    // The planner's own follow-up call does not see the nested turns.
    let follow_up = provider.requests().pop().unwrap();
    assert!(follow_up
        .messages
        .iter()
        .filter_map(Message::text)
        .all(|t| !t.contains("[researcher]")));
}

#[tokio::test]
async fn test_one_run_per_session() {
    let provider =
        Arc::new(MockProvider::text("slow answer").with_latency(Duration::from_millis(50)));
    let runner = runner(AgentSpec::llm("slow"), provider);

    let first = runner.run_text(USER, SESSION, "one").await.unwrap();
    let second = runner.run_text(USER, SESSION, "two").await;
    assert!(matches!(second, Err(WeftError::LimitExceeded(_))));

    // Other sessions are independent.
    let other = runner.run_text(USER, "session_2", "three").await.unwrap();

    first.collect_all().await;
    other.collect_all().await;
    let third = runner.run_text(USER, SESSION, "four").await;
    assert!(third.is_ok());
}

#[tokio::test]
async fn test_artifacts_through_tool_context() {
    let save_report = ToolSpec::function(
        "save_report",
        "Save the report",
        json!({"type": "object", "properties": {"text": {"type": "string"}}}),
        |args, ctx| async move {
            let text = args["text"].as_str().unwrap_or_default().to_string();
            let version = ctx.save_artifact("report.txt", Artifact::text(text)).await?;
            Ok(json!({"version": version}))
        },
    );
    let provider = Arc::new(MockProvider::new(vec![
        MockResponse::call("save_report", json!({"text": "hello"})),
        MockResponse::call("load_artifacts", json!({"artifact_names": ["report.txt"]})),
        MockResponse::text("saved and checked"),
    ]));
    let runner = runner(
        AgentSpec::llm("reporter").with_tools(vec![save_report, weft::tools::load_artifacts()]),
        provider.clone(),
    )
    .with_artifact_service(Arc::new(InMemoryArtifactService::new()));

    let events = run(&runner, "write the report").await;
    assert_eq!(events[1].actions.artifact_delta.get("report.txt"), Some(&0));

    let loaded = match provider.requests()[2].messages.last() {
        Some(Message::ToolResult { response, .. }) => response.clone(),
        other => panic!("expected a tool result, got {:?}", other),
    };
    assert_eq!(loaded["artifacts"][0]["mimeType"], "text/plain");
    assert_eq!(loaded["artifacts"][0]["data"], Value::from("aGVsbG8="));
}

#[tokio::test]
async fn test_from_registry_resolves_root() {
    let mut registry = AgentRegistry::new();
    registry.register(Arc::new(AgentSpec::llm("greeter"))).unwrap();

    let provider: Arc<dyn ModelProvider> = Arc::new(MockProvider::text("hi"));
    let config = RunConfig::new("test_app");
    assert!(Runner::from_registry(config.clone(), &registry, "greeter", provider.clone()).is_ok());
    assert!(matches!(
        Runner::from_registry(config, &registry, "nobody", provider),
        Err(WeftError::NotFound { .. })
    ));
}
