//! End-to-end tests for the Weir engine.
//!
//! Each test exercises the full path: parse description -> build graph ->
//! execute -> inspect the output stream and final summary.

use std::time::Duration;

use serde_json::{json, Value};
use tokio_stream::StreamExt;

use weir_engine::{build, execute_graph, ExecutorConfig};
use weir_types::{FlowEvent, RunLog};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config() -> ExecutorConfig {
    ExecutorConfig::default().with_input_timeout(Duration::from_secs(5))
}

async fn run_flow(spec: Value, message: &str) -> Vec<FlowEvent> {
    run_flow_with(spec, message, config()).await
}

async fn run_flow_with(spec: Value, message: &str, config: ExecutorConfig) -> Vec<FlowEvent> {
    let spec = weir_schema::from_value(spec).expect("graph description should parse");
    let graph = build(spec, message, None).expect("graph should build");
    execute_graph(graph, RunLog::new(), config).collect().await
}

/// The final summary record (legacy flat form).
fn summary(events: &[FlowEvent]) -> &Value {
    match events.last() {
        Some(FlowEvent::DebugSummary { content }) => content,
        other => panic!("expected debug_summary last, got {other:?}"),
    }
}

/// One node's entry in the summary.
fn node_summary<'a>(summary: &'a Value, node_id: &str) -> &'a Value {
    summary["nodes"]
        .as_array()
        .expect("nodes list")
        .iter()
        .find(|n| n["node_id"] == node_id)
        .unwrap_or_else(|| panic!("no summary entry for node '{node_id}'"))
}

fn content_events(events: &[FlowEvent]) -> Vec<&FlowEvent> {
    events.iter().filter(|e| e.is_content()).collect()
}

fn debug_events(events: &[FlowEvent]) -> Vec<&Value> {
    events
        .iter()
        .filter_map(|e| match e {
            FlowEvent::Debug { content, .. } => Some(content),
            _ => None,
        })
        .collect()
}

fn loop_progress_events(events: &[FlowEvent]) -> Vec<&weir_types::LoopProgress> {
    events
        .iter()
        .filter_map(|e| match e {
            FlowEvent::LoopProgress { content } => Some(content),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Scenario 1: three-node linear graph
// ---------------------------------------------------------------------------

#[tokio::test]
async fn three_node_linear() {
    let events = run_flow(
        json!({
            "type": "chat",
            "debug": true,
            "nodes": [
                {"id": "U", "type": "user_input"},
                {"id": "T", "type": "text", "data": {"text": "hello"}},
                {"id": "E", "type": "end"}
            ],
            "edges": [
                {"source": "U", "target": "E", "sourceHandle": "handle_user_message", "targetHandle": "in"},
                {"source": "T", "target": "E", "sourceHandle": "handle_text_output", "targetHandle": "in"}
            ]
        }),
        "hi",
    )
    .await;

    assert!(content_events(&events).is_empty(), "no content expected");

    let summary = summary(&events);
    assert_eq!(summary["executed_nodes"], 3);
    assert_eq!(summary["failed_nodes"], 0);
    assert_eq!(summary["bypassed_nodes"], 0);
}

// ---------------------------------------------------------------------------
// Scenario 2: parallel branches, conditional prune
// ---------------------------------------------------------------------------

fn conditional_spec() -> Value {
    json!({
        "type": "chat",
        "debug": true,
        "nodes": [
            {"id": "U", "type": "user_input"},
            {"id": "C", "type": "conditional", "data": {
                "condition": "{{ 'yes' if value|trim else 'no' }}",
                "output_handles": ["yes", "no"]
            }},
            {"id": "Ty", "type": "text", "data": {"text": "yes path"}},
            {"id": "Tn", "type": "text", "data": {"text": "no path"}},
            {"id": "E", "type": "end"}
        ],
        "edges": [
            {"source": "U", "target": "C", "sourceHandle": "handle_user_message", "targetHandle": "handle_input"},
            {"source": "C", "target": "Ty", "sourceHandle": "yes", "targetHandle": "in"},
            {"source": "C", "target": "Tn", "sourceHandle": "no", "targetHandle": "in"},
            {"source": "Ty", "target": "E", "sourceHandle": "handle_text_output", "targetHandle": "in"},
            {"source": "Tn", "target": "E", "sourceHandle": "handle_text_output", "targetHandle": "in"}
        ]
    })
}

#[tokio::test]
async fn conditional_prunes_no_branch_on_nonempty_message() {
    let events = run_flow(conditional_spec(), "x").await;
    let summary = summary(&events);

    assert_eq!(summary["executed_nodes"], 4, "U, C, Ty, E");
    assert_eq!(summary["bypassed_nodes"], 1);
    assert_eq!(node_summary(summary, "Ty")["was_executed"], true);
    assert_eq!(node_summary(summary, "Tn")["was_bypassed"], true);
    assert_eq!(node_summary(summary, "E")["was_executed"], true);
}

#[tokio::test]
async fn conditional_prunes_yes_branch_on_empty_message() {
    let events = run_flow(conditional_spec(), "").await;
    let summary = summary(&events);

    assert_eq!(summary["executed_nodes"], 4, "U, C, Tn, E");
    assert_eq!(node_summary(summary, "Tn")["was_executed"], true);
    assert_eq!(node_summary(summary, "Ty")["was_bypassed"], true);
    assert_eq!(node_summary(summary, "E")["was_executed"], true);
}

// ---------------------------------------------------------------------------
// Scenario 3: loop over a numeric list with feedback
// ---------------------------------------------------------------------------

fn loop_spec(list: &str) -> Value {
    json!({
        "type": "chat",
        "debug": true,
        "nodes": [
            {"id": "U", "type": "user_input"},
            {"id": "Tlist", "type": "text", "data": {"text": list}},
            {"id": "L", "type": "loop"},
            {"id": "P", "type": "parser", "data": {"text": "item={{ handle_parser_input }}"}},
            {"id": "E", "type": "end"}
        ],
        "edges": [
            {"source": "U", "target": "L", "sourceHandle": "handle_user_message", "targetHandle": "unused"},
            {"source": "Tlist", "target": "L", "sourceHandle": "handle_text_output", "targetHandle": "handle_list"},
            {"source": "L", "target": "P", "sourceHandle": "handle_item", "targetHandle": "handle_parser_input"},
            {"source": "P", "target": "L", "sourceHandle": "handle_parser_output", "targetHandle": "handle_loop"},
            {"source": "L", "target": "E", "sourceHandle": "handle_end", "targetHandle": "in"}
        ]
    })
}

#[tokio::test]
async fn loop_iterates_with_feedback() {
    let events = run_flow(loop_spec("[1,2,3]"), "go").await;

    let progress = loop_progress_events(&events);
    assert_eq!(progress.len(), 3, "one progress record per iteration");
    assert_eq!(progress[0].current, 0);
    assert_eq!(progress[0].total, 3);
    assert_eq!(progress[2].current, 2);

    let summary = summary(&events);
    assert_eq!(summary["bypassed_nodes"], 0);
    // The aggregated feedback reached the end node.
    assert_eq!(
        node_summary(summary, "E")["inputs"]["in"],
        json!(["item=1", "item=2", "item=3"])
    );
    assert_eq!(node_summary(summary, "P")["was_executed"], true);
}

// ---------------------------------------------------------------------------
// Scenario 4: empty loop list
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_loop_list_skips_iteration() {
    let events = run_flow(loop_spec("[]"), "go").await;

    assert!(loop_progress_events(&events).is_empty());

    let summary = summary(&events);
    assert_eq!(node_summary(summary, "E")["inputs"]["in"], json!([]));
    // The parser never ran.
    assert!(summary["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .all(|n| n["node_id"] != "P"));
}

// ---------------------------------------------------------------------------
// Scenario 5: conditional routing error
// ---------------------------------------------------------------------------

#[tokio::test]
async fn routing_error_bypasses_downstream_and_completes() {
    let events = run_flow(
        json!({
            "type": "chat",
            "debug": true,
            "nodes": [
                {"id": "U", "type": "user_input"},
                {"id": "C", "type": "conditional", "data": {"condition": "{{ 'yes' }}"}},
                {"id": "T", "type": "text", "data": {"text": "downstream"}},
                {"id": "E", "type": "end"}
            ],
            "edges": [
                {"source": "U", "target": "C", "sourceHandle": "handle_user_message", "targetHandle": "handle_input"},
                {"source": "C", "target": "T", "sourceHandle": "maybe", "targetHandle": "in"},
                {"source": "T", "target": "E", "sourceHandle": "handle_text_output", "targetHandle": "in"}
            ]
        }),
        "x",
    )
    .await;

    let routing_errors: Vec<_> = debug_events(&events)
        .into_iter()
        .filter(|d| d["error_type"] == "GraphRoutingError")
        .collect();
    assert_eq!(routing_errors.len(), 1);

    let summary = summary(&events);
    assert_eq!(node_summary(summary, "T")["was_bypassed"], true);
    assert_eq!(node_summary(summary, "E")["was_bypassed"], true);
    // The stream still completed normally with a final summary.
    assert!(matches!(events.last(), Some(FlowEvent::DebugSummary { .. })));
}

// ---------------------------------------------------------------------------
// Scenario 6: redaction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sensitive_keys_are_redacted_on_the_stream() {
    let events = run_flow(
        json!({
            "type": "chat",
            "debug": true,
            "nodes": [
                {"id": "U", "type": "user_input"},
                {"id": "CL", "type": "client", "data": {
                    "engine": "openai",
                    "model": "gpt-4o",
                    "api_info": {"api_key": "sekret"}
                }},
                {"id": "E", "type": "end"}
            ],
            "edges": [
                {"source": "U", "target": "E", "sourceHandle": "handle_user_message", "targetHandle": "in"},
                {"source": "CL", "target": "E", "sourceHandle": "handle-client-provider", "targetHandle": "client"}
            ]
        }),
        "q",
    )
    .await;

    // No event anywhere on the stream carries the original secret.
    for debug in debug_events(&events) {
        let text = debug.to_string();
        assert!(!text.contains("sekret"), "secret leaked: {text}");
    }
    let summary = summary(&events);
    assert!(!summary.to_string().contains("sekret"));

    // The client node's captured output shows the marker instead.
    let client = node_summary(summary, "CL");
    let outputs = client["outputs"].to_string();
    assert!(outputs.contains("***REDACTED***"), "outputs: {outputs}");
    assert!(outputs.contains("gpt-4o"), "non-sensitive fields survive");
}

// ---------------------------------------------------------------------------
// Boundary: loop list source bypassed by a conditional
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bypassed_list_source_bypasses_loop_without_error() {
    let events = run_flow(
        json!({
            "type": "chat",
            "debug": true,
            "nodes": [
                {"id": "U", "type": "user_input"},
                {"id": "C", "type": "conditional", "data": {
                    "condition": "{{ 'skip' if value == 'skip' else 'run' }}",
                    "output_handles": ["run", "skip"]
                }},
                {"id": "Tlist", "type": "text", "data": {"text": "[1,2]"}},
                {"id": "Tskip", "type": "text", "data": {"text": "skipped"}},
                {"id": "L", "type": "loop"},
                {"id": "P", "type": "parser", "data": {"text": "{{ handle_parser_input }}"}},
                {"id": "E", "type": "end"}
            ],
            "edges": [
                {"source": "U", "target": "C", "sourceHandle": "handle_user_message", "targetHandle": "handle_input"},
                {"source": "C", "target": "Tlist", "sourceHandle": "run", "targetHandle": "in"},
                {"source": "C", "target": "Tskip", "sourceHandle": "skip", "targetHandle": "in"},
                {"source": "Tlist", "target": "L", "sourceHandle": "handle_text_output", "targetHandle": "handle_list"},
                {"source": "L", "target": "P", "sourceHandle": "handle_item", "targetHandle": "handle_parser_input"},
                {"source": "P", "target": "L", "sourceHandle": "handle_parser_output", "targetHandle": "handle_loop"},
                {"source": "L", "target": "E", "sourceHandle": "handle_end", "targetHandle": "in"},
                {"source": "Tskip", "target": "E", "sourceHandle": "handle_text_output", "targetHandle": "other"}
            ]
        }),
        "skip",
    )
    .await;

    assert!(loop_progress_events(&events).is_empty());
    // No error records: the bypass is clean.
    for debug in debug_events(&events) {
        if let Some(error_type) = debug.get("error_type").and_then(|v| v.as_str()) {
            panic!("unexpected error event: {error_type}");
        }
    }

    let summary = summary(&events);
    assert_eq!(node_summary(summary, "L")["was_bypassed"], true);
    assert_eq!(node_summary(summary, "Tlist")["was_bypassed"], true);
    assert_eq!(node_summary(summary, "Tskip")["was_executed"], true);
}

// ---------------------------------------------------------------------------
// Boundary: per-node input timeout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn input_timeout_errors_node_and_bypasses_downstream() {
    let events = run_flow_with(
        json!({
            "type": "chat",
            "debug": true,
            "nodes": [
                {"id": "U", "type": "user_input"},
                {"id": "P", "type": "parser", "data": {"text": "{{ other }}"}},
                {"id": "E", "type": "end"}
            ],
            "edges": [
                {"source": "U", "target": "P", "sourceHandle": "handle_user_message", "targetHandle": "other"},
                // Self-loop: this input can never arrive.
                {"source": "P", "target": "P", "sourceHandle": "handle_parser_output", "targetHandle": "in"},
                {"source": "P", "target": "E", "sourceHandle": "handle_parser_output", "targetHandle": "in"}
            ]
        }),
        "x",
        config().with_input_timeout(Duration::from_millis(200)),
    )
    .await;

    let timeouts: Vec<_> = debug_events(&events)
        .into_iter()
        .filter(|d| d["error_type"] == "TimeoutError")
        .collect();
    assert!(!timeouts.is_empty(), "expected a timeout error event");

    let summary = summary(&events);
    assert_eq!(summary["failed_nodes"], 1);
    assert_eq!(node_summary(summary, "E")["was_bypassed"], true);
}

// ---------------------------------------------------------------------------
// Streaming: send_message chunks are flushed and ordered before the summary
// ---------------------------------------------------------------------------

#[tokio::test]
async fn streaming_content_reaches_the_stream_before_the_summary() {
    let events = run_flow(
        json!({
            "type": "chat",
            "debug": true,
            "nodes": [
                {"id": "U", "type": "user_input"},
                {"id": "S", "type": "send_message", "data": {"text": "ping"}},
                {"id": "E", "type": "end"}
            ],
            "edges": [
                {"source": "U", "target": "E", "sourceHandle": "handle_user_message", "targetHandle": "in"},
                {"source": "S", "target": "E", "sourceHandle": "handle_message_output", "targetHandle": "msg"}
            ]
        }),
        "x",
    )
    .await;

    let contents = content_events(&events);
    assert_eq!(contents.len(), 1);
    match contents[0] {
        FlowEvent::Content { content, source_node } => {
            assert_eq!(content["content"], "ping");
            assert_eq!(source_node.as_deref(), Some("S"));
        }
        other => panic!("unexpected: {other:?}"),
    }

    // Every content event precedes the summary; the summary is last.
    let summary_index = events.len() - 1;
    for (index, event) in events.iter().enumerate() {
        if event.is_content() {
            assert!(index < summary_index);
        }
    }
    assert!(matches!(events.last(), Some(FlowEvent::DebugSummary { .. })));
}

// ---------------------------------------------------------------------------
// Validation diagnostics surface as debug events but never stop execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn validation_errors_stream_before_execution() {
    let events = run_flow(
        json!({
            "type": "chat",
            "debug": true,
            "nodes": [
                {"id": "U1", "type": "user_input"},
                {"id": "U2", "type": "user_input"},
                {"id": "E", "type": "end"}
            ],
            "edges": [
                {"source": "U1", "target": "E", "sourceHandle": "handle_user_message", "targetHandle": "in"}
            ]
        }),
        "x",
    )
    .await;

    let validation: Vec<_> = debug_events(&events)
        .into_iter()
        .filter(|d| d["error_type"] == "GraphValidationError")
        .collect();
    assert_eq!(validation.len(), 1);

    // The graph still ran to a summary.
    let summary = summary(&events);
    assert_eq!(node_summary(summary, "E")["was_executed"], true);
}

// ---------------------------------------------------------------------------
// Nested flows: inner graphs stream through the outer graph
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inner_flow_streams_into_outer_graph() {
    let events = run_flow(
        json!({
            "type": "chat",
            "debug": true,
            "nodes": [
                {"id": "U", "type": "user_input"},
                {"id": "I", "type": "inner", "data": {"flow": {
                    "type": "chat",
                    "nodes": [
                        {"id": "iu", "type": "user_input"},
                        {"id": "is", "type": "send_message", "data": {"text": "from inside"}},
                        {"id": "ie", "type": "end"}
                    ],
                    "edges": [
                        {"source": "iu", "target": "ie", "sourceHandle": "handle_user_message", "targetHandle": "in"},
                        {"source": "is", "target": "ie", "sourceHandle": "handle_message_output", "targetHandle": "msg"}
                    ]
                }}},
                {"id": "E", "type": "end"}
            ],
            "edges": [
                {"source": "U", "target": "I", "sourceHandle": "handle_user_message", "targetHandle": "handle_user_message"},
                {"source": "I", "target": "E", "sourceHandle": "handle_execution_content", "targetHandle": "in"}
            ]
        }),
        "outer question",
    )
    .await;

    let contents = content_events(&events);
    assert_eq!(contents.len(), 1, "inner content forwarded once");
    match contents[0] {
        FlowEvent::Content { content, .. } => {
            assert_eq!(content["content"], "from inside");
        }
        other => panic!("unexpected: {other:?}"),
    }

    let summary = summary(&events);
    assert_eq!(node_summary(summary, "I")["was_executed"], true);
    assert_eq!(node_summary(summary, "E")["was_executed"], true);
}

// ---------------------------------------------------------------------------
// Debug disabled: no debug records, no summary, content still flows
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disabled_debug_produces_bare_stream() {
    let events = run_flow(
        json!({
            "type": "chat",
            "debug": false,
            "nodes": [
                {"id": "U", "type": "user_input"},
                {"id": "S", "type": "send_message", "data": {"text": "quiet"}},
                {"id": "E", "type": "end"}
            ],
            "edges": [
                {"source": "U", "target": "E", "sourceHandle": "handle_user_message", "targetHandle": "in"},
                {"source": "S", "target": "E", "sourceHandle": "handle_message_output", "targetHandle": "msg"}
            ]
        }),
        "x",
    )
    .await;

    assert!(debug_events(&events).is_empty());
    assert!(!events.iter().any(|e| matches!(e, FlowEvent::DebugSummary { .. })));
    assert_eq!(content_events(&events).len(), 1);
}
