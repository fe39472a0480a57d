//! Tool dispatch: validation, the before/after-tool chains, error mapping.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use weft::session::SharedState;
use weft::tools::sanitize_tool_name;
use weft::*;

fn ctx(state: &SharedState) -> ToolContext {
    ToolContext::new("dice_agent", "inv-1", "call-1", State::new(state.clone()))
}

fn roll_die(ran: Arc<AtomicBool>) -> ToolSpec {
    ToolSpec::sync_function(
        "roll_die",
        "Roll a die with the given number of sides",
        json!({
            "type": "object",
            "properties": {"sides": {"type": "integer"}},
            "required": ["sides"]
        }),
        move |args, _ctx| {
            ran.store(true, Ordering::SeqCst);
            Ok(json!(args["sides"].as_i64().unwrap_or(6)))
        },
    )
}

/// Returns its `n` argument unchanged.
fn echo_number() -> ToolSpec {
    ToolSpec::sync_function(
        "echo_number",
        "Echo a number",
        json!({
            "type": "object",
            "properties": {"n": {"type": "integer"}},
            "required": ["n"]
        }),
        |args, _ctx| Ok(args["n"].clone()),
    )
}

fn decrement_odd() -> Callbacks {
    Callbacks::new().after_tool(|_tool, _args, _ctx, result| match result.as_i64() {
        Some(n) if n % 2 != 0 => Ok(HookOutcome::Override(json!(n - 1))),
        _ => Ok(HookOutcome::Continue),
    })
}

#[tokio::test]
async fn test_before_tool_override_skips_body() {
    let ran = Arc::new(AtomicBool::new(false));
    let callbacks = Callbacks::new().before_tool(|tool, _args, _ctx| {
        if tool == "roll_die" {
            Ok(HookOutcome::Override(json!(4)))
        } else {
            Ok(HookOutcome::Continue)
        }
    });
    let dispatcher = ToolDispatcher::new(&[roll_die(ran.clone())], callbacks);

    let result = dispatcher
        .invoke_by_name("roll_die", json!({"sides": 6}), &ctx(&SharedState::default()))
        .await
        .unwrap();
    assert_eq!(result, json!(4));
    assert!(!ran.load(Ordering::SeqCst), "tool body must not run");
}

#[tokio::test]
async fn test_first_before_override_wins() {
    let ran = Arc::new(AtomicBool::new(false));
    let callbacks = Callbacks::new()
        .before_tool(|_tool, _args, _ctx| Ok(HookOutcome::Override(json!("first"))))
        .before_tool(|_tool, _args, _ctx| Ok(HookOutcome::Override(json!("second"))));
    let dispatcher = ToolDispatcher::new(&[roll_die(ran)], callbacks);

    let result = dispatcher
        .invoke_by_name("roll_die", json!({"sides": 6}), &ctx(&SharedState::default()))
        .await
        .unwrap();
    assert_eq!(result, json!("first"));
}

#[tokio::test]
async fn test_override_with_falsy_value_still_overrides() {
    let ran = Arc::new(AtomicBool::new(false));
    let callbacks =
        Callbacks::new().before_tool(|_tool, _args, _ctx| Ok(HookOutcome::Override(json!(0))));
    let dispatcher = ToolDispatcher::new(&[roll_die(ran.clone())], callbacks);

    let result = dispatcher
        .invoke_by_name("roll_die", json!({"sides": 6}), &ctx(&SharedState::default()))
        .await
        .unwrap();
    assert_eq!(result, json!(0));
    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_after_tool_decrements_odd_results() {
    let dispatcher = ToolDispatcher::new(&[echo_number()], decrement_odd());
    let state = SharedState::default();

    let odd = dispatcher
        .invoke_by_name("echo_number", json!({"n": 7}), &ctx(&state))
        .await
        .unwrap();
    assert_eq!(odd, json!(6));

    let even = dispatcher
        .invoke_by_name("echo_number", json!({"n": 4}), &ctx(&state))
        .await
        .unwrap();
    assert_eq!(even, json!(4));
}

#[tokio::test]
async fn test_after_hooks_see_previous_replacement() {
    let callbacks = Callbacks::new()
        .after_tool(|_tool, _args, _ctx, result| {
            Ok(HookOutcome::Override(json!(result.as_i64().unwrap_or(0) * 10)))
        })
        .after_tool(|_tool, _args, _ctx, result| {
            Ok(HookOutcome::Override(json!(result.as_i64().unwrap_or(0) + 1)))
        });
    let dispatcher = ToolDispatcher::new(&[echo_number()], callbacks);

    let result = dispatcher
        .invoke_by_name("echo_number", json!({"n": 3}), &ctx(&SharedState::default()))
        .await
        .unwrap();
    assert_eq!(result, json!(31));
}

#[tokio::test]
async fn test_before_hook_can_rewrite_arguments() {
    let callbacks = Callbacks::new().before_tool(|_tool, args, _ctx| {
        args["n"] = json!(100);
        Ok(HookOutcome::Continue)
    });
    let dispatcher = ToolDispatcher::new(&[echo_number()], callbacks);

    let result = dispatcher
        .invoke_by_name("echo_number", json!({"n": 1}), &ctx(&SharedState::default()))
        .await
        .unwrap();
    assert_eq!(result, json!(100));
}

#[tokio::test]
async fn test_rewritten_arguments_are_revalidated() {
    let callbacks = Callbacks::new().before_tool(|_tool, args, _ctx| {
        args["n"] = json!("not a number");
        Ok(HookOutcome::Continue)
    });
    let dispatcher = ToolDispatcher::new(&[echo_number()], callbacks);

    let err = dispatcher
        .invoke_by_name("echo_number", json!({"n": 1}), &ctx(&SharedState::default()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArgumentValidation);
}

#[tokio::test]
async fn test_unknown_tool_is_not_found() {
    let dispatcher = ToolDispatcher::new(&[echo_number()], Callbacks::new());
    let err = dispatcher
        .invoke_by_name("nope", json!({}), &ctx(&SharedState::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, WeftError::NotFound { what: "tool", .. }));
}

#[tokio::test]
async fn test_argument_validation() {
    let dispatcher = ToolDispatcher::new(&[echo_number()], Callbacks::new());
    let state = SharedState::default();

    for bad in [json!({}), json!({"n": "seven"}), json!([7])] {
        let err = dispatcher
            .invoke_by_name("echo_number", bad.clone(), &ctx(&state))
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                WeftError::ArgumentValidation { ref target, .. } if target == "echo_number"
            ),
            "{} should fail validation, got {:?}",
            bad,
            err
        );
    }
}

#[tokio::test]
async fn test_nested_constraints_block_body() {
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let roll = ToolSpec::sync_function(
        "roll_dice",
        "Roll several dice",
        json!({
            "type": "object",
            "properties": {
                "sides": {"type": "integer", "enum": [4, 6, 8], "minimum": 4},
                "opts": {
                    "type": "object",
                    "properties": {"n": {"type": "integer"}},
                    "required": ["n"]
                },
                "tags": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["sides"]
        }),
        move |_args, _ctx| {
            flag.store(true, Ordering::SeqCst);
            Ok(json!(1))
        },
    );
    let dispatcher = ToolDispatcher::new(&[roll], Callbacks::new());
    let state = SharedState::default();

    for bad in [
        json!({"sides": -7}),
        json!({"sides": 6, "opts": {"n": "x"}}),
        json!({"sides": 6, "opts": {}}),
        json!({"sides": 6, "tags": ["red", 3]}),
    ] {
        let err = dispatcher
            .invoke_by_name("roll_dice", bad.clone(), &ctx(&state))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentValidation, "{}", bad);
    }
    assert!(!ran.load(Ordering::SeqCst), "tool body must not run");

    let ok = dispatcher
        .invoke_by_name("roll_dice", json!({"sides": 8, "opts": {"n": 2}}), &ctx(&state))
        .await
        .unwrap();
    assert_eq!(ok, json!(1));
}

#[tokio::test]
async fn test_body_failure_wraps_cause() {
    let failing = ToolSpec::sync_function(
        "lookup",
        "Always fails",
        json!({"type": "object", "properties": {}}),
        |_args, _ctx| Err(ToolError::Failed("backend unreachable".into())),
    );
    let dispatcher = ToolDispatcher::new(&[failing], Callbacks::new());

    let err = dispatcher
        .invoke_by_name("lookup", json!({}), &ctx(&SharedState::default()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ToolExecution);
    let source = std::error::Error::source(&err).map(ToString::to_string);
    assert_eq!(source.as_deref(), Some("backend unreachable"));
}

#[tokio::test]
async fn test_hook_error_is_dependency() {
    let callbacks = Callbacks::new()
        .before_tool(|_tool, _args, _ctx| Err(CallbackError::new("policy service down")));
    let dispatcher = ToolDispatcher::new(&[echo_number()], callbacks);

    let err = dispatcher
        .invoke_by_name("echo_number", json!({"n": 1}), &ctx(&SharedState::default()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Dependency);
}

#[tokio::test]
async fn test_tools_and_hooks_write_state() {
    let append = ToolSpec::sync_function(
        "remember",
        "Append a note",
        json!({"type": "object", "properties": {"note": {"type": "string"}}}),
        |args, ctx| {
            let note = args["note"].clone();
            ctx.state.update("notes", |old| {
                let mut notes = old.and_then(Value::as_array).cloned().unwrap_or_default();
                notes.push(note);
                Value::Array(notes)
            });
            Ok(json!("ok"))
        },
    );
    let callbacks = Callbacks::new().after_tool(|_tool, _args, ctx, _result| {
        ctx.state.set("last_tool", "remember");
        Ok(HookOutcome::Continue)
    });
    let dispatcher = ToolDispatcher::new(&[append], callbacks);
    let state = SharedState::default();

    for note in ["milk", "eggs"] {
        dispatcher
            .invoke_by_name("remember", json!({"note": note}), &ctx(&state))
            .await
            .unwrap();
    }
    assert_eq!(state.get("notes"), Some(json!(["milk", "eggs"])));
    assert_eq!(state.get("last_tool"), Some(json!("remember")));
}

#[test]
fn test_exposed_names_are_sanitized_and_unique() {
    let tools = vec![
        echo_number().with_name("get weather"),
        echo_number().with_name("get.weather"),
        echo_number().with_name("9lives"),
    ];
    let dispatcher = ToolDispatcher::new(&tools, Callbacks::new());
    let names: Vec<&str> = dispatcher.tools().iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["get_weather", "get_weather_2", "_9lives"]);
    assert_eq!(dispatcher.declarations().len(), 3);
}

#[test]
fn test_sanitize_is_idempotent() {
    let long = "x".repeat(200);
    for name in [
        "roll_die",
        "get weather",
        "ünïcode-tool",
        "9lives",
        "",
        "a/b\\c",
        "already_ok-1",
        long.as_str(),
    ] {
        let once = sanitize_tool_name(name);
        assert_eq!(sanitize_tool_name(&once), once, "not idempotent for {:?}", name);
        assert!(once.len() <= weft::tools::MAX_TOOL_NAME_LEN);
    }
}
