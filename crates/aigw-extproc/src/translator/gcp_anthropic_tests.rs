use serde_json::json;

use super::*;

fn target() -> GcpTarget {
	GcpTarget {
		project: "my-project".to_string(),
		region: "us-east5".to_string(),
	}
}

fn chat(raw: &str) -> ParsedRequest {
	ParsedRequest::Chat(serde_json::from_str(raw).unwrap())
}

fn messages(raw: &str) -> ParsedRequest {
	ParsedRequest::Messages(serde_json::from_str(raw).unwrap())
}

#[test]
fn chat_request_translates_to_messages() {
	let parsed = chat(
		r#"{"model":"claude-sonnet-4","messages":[{"role":"system","content":"be terse"},{"role":"user","content":"hi"}],"max_tokens":256}"#,
	);
	let mut t = GcpAnthropicTranslator::new(target(), None);
	let out = t.request_body(&parsed).unwrap();

	assert_eq!(
		mutation::get_set_header(&out.header_mutation, ":path"),
		Some(
			b"/v1/projects/my-project/locations/us-east5/publishers/anthropic/models/claude-sonnet-4:rawPredict".as_slice()
		)
	);
	let body: serde_json::Value = serde_json::from_slice(out.body.as_deref().unwrap()).unwrap();
	assert_eq!(body["anthropic_version"], json!("vertex-2023-10-16"));
	assert!(body.get("model").is_none());
	assert_eq!(body["system"], json!("be terse"));
	assert_eq!(body["max_tokens"], json!(256));
	assert_eq!(body["messages"][0]["content"], json!("hi"));
}

#[test]
fn chat_request_defaults_max_tokens() {
	let parsed = chat(r#"{"model":"c","messages":[{"role":"user","content":"hi"}]}"#);
	let mut t = GcpAnthropicTranslator::new(target(), None);
	let out = t.request_body(&parsed).unwrap();
	let body: serde_json::Value = serde_json::from_slice(out.body.as_deref().unwrap()).unwrap();
	assert_eq!(body["max_tokens"], json!(4096));
}

#[test]
fn buffered_response_translates() {
	let parsed = chat(r#"{"model":"c","messages":[{"role":"user","content":"hi"}]}"#);
	let mut t = GcpAnthropicTranslator::new(target(), None);
	t.request_body(&parsed).unwrap();

	let upstream = br#"{"id":"msg_1","type":"message","role":"assistant","content":[{"type":"text","text":"hello"}],"model":"claude-sonnet-4-20250514","stop_reason":"end_turn","usage":{"input_tokens":7,"output_tokens":3}}"#;
	let out = t.response_body(upstream, true).unwrap();
	assert_eq!(out.usage, Some(TokenUsage::new(7, 3, 10)));
	assert_eq!(out.response_model.as_deref(), Some("claude-sonnet-4-20250514"));
	let body: serde_json::Value = serde_json::from_slice(out.body.as_deref().unwrap()).unwrap();
	assert_eq!(body["choices"][0]["message"]["content"], json!("hello"));
	assert_eq!(body["choices"][0]["finish_reason"], json!("stop"));
	assert_eq!(body["usage"]["total_tokens"], json!(10));
}

#[test]
fn streaming_translates_events() {
	let parsed = chat(r#"{"model":"c","messages":[],"stream":true}"#);
	let mut t = GcpAnthropicTranslator::new(target(), None);
	let out = t.request_body(&parsed).unwrap();
	let path = mutation::get_set_header(&out.header_mutation, ":path").unwrap();
	assert!(path.ends_with(b":streamRawPredict"));

	let mut body = Vec::new();
	let mut push = |ev: &str, data: serde_json::Value, eos: bool, t: &mut GcpAnthropicTranslator| {
		let frame = format!("event: {ev}\ndata: {data}\n\n");
		let out = t.response_body(frame.as_bytes(), eos).unwrap();
		body.extend(out.body.unwrap());
		out.usage
	};

	assert!(push(
		"message_start",
		json!({"type":"message_start","message":{"id":"msg_1","model":"claude-sonnet-4","role":"assistant","usage":{"input_tokens":5,"output_tokens":0}}}),
		false,
		&mut t,
	)
	.is_none());
	push(
		"content_block_delta",
		json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hey"}}),
		false,
		&mut t,
	);
	let usage = push(
		"message_delta",
		json!({"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":4}}),
		true,
		&mut t,
	);
	assert_eq!(usage, Some(TokenUsage::new(5, 4, 9)));

	let text = String::from_utf8(body).unwrap();
	let chunks: Vec<serde_json::Value> = text
		.lines()
		.filter_map(|l| l.strip_prefix("data: "))
		.filter(|d| *d != "[DONE]")
		.map(|d| serde_json::from_str(d).unwrap())
		.collect();
	assert_eq!(chunks[0]["choices"][0]["delta"]["role"], json!("assistant"));
	assert_eq!(chunks[0]["model"], json!("claude-sonnet-4"));
	assert_eq!(chunks[1]["choices"][0]["delta"]["content"], json!("hey"));
	assert_eq!(chunks[2]["choices"][0]["finish_reason"], json!("stop"));
	assert_eq!(chunks[3]["usage"]["total_tokens"], json!(9));
	assert!(text.ends_with("data: [DONE]\n\n"));
}

#[test]
fn messages_passthrough_rewrites_envelope_only() {
	let parsed = messages(
		r#"{"model":"claude-sonnet-4","messages":[{"role":"user","content":"hi"}],"max_tokens":100}"#,
	);
	let mut t = MessagesPassthroughTranslator::new(target(), None);
	let out = t.request_body(&parsed).unwrap();
	let body: serde_json::Value = serde_json::from_slice(out.body.as_deref().unwrap()).unwrap();
	assert_eq!(body["anthropic_version"], json!("vertex-2023-10-16"));
	assert!(body.get("model").is_none());
	assert_eq!(body["messages"][0]["content"], json!("hi"));
	assert_eq!(
		mutation::get_set_header(&out.header_mutation, ":path"),
		Some(
			b"/v1/projects/my-project/locations/us-east5/publishers/anthropic/models/claude-sonnet-4:rawPredict".as_slice()
		)
	);
}

#[test]
fn messages_passthrough_response_skims_usage() {
	let parsed = messages(r#"{"model":"c","messages":[],"max_tokens":10}"#);
	let mut t = MessagesPassthroughTranslator::new(target(), None);
	t.request_body(&parsed).unwrap();

	let upstream = br#"{"id":"msg_1","type":"message","role":"assistant","content":[{"type":"text","text":"x"}],"model":"claude-sonnet-4-20250514","stop_reason":"end_turn","usage":{"input_tokens":2,"output_tokens":1}}"#;
	let out = t.response_body(upstream, true).unwrap();
	// Body passes through untouched.
	assert!(out.body.is_none());
	assert_eq!(out.usage, Some(TokenUsage::new(2, 1, 3)));
}

#[test]
fn messages_passthrough_streaming_skims_usage() {
	let parsed = messages(r#"{"model":"c","messages":[],"max_tokens":10,"stream":true}"#);
	let mut t = MessagesPassthroughTranslator::new(target(), None);
	t.request_body(&parsed).unwrap();

	let start = br#"event: message_start
data: {"type":"message_start","message":{"id":"m","model":"claude-sonnet-4","role":"assistant","usage":{"input_tokens":11,"output_tokens":0}}}

"#;
	let out = t.response_body(start, false).unwrap();
	assert!(out.body.is_none());
	assert!(out.usage.is_none());

	let end = br#"event: message_delta
data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":6}}

event: message_stop
data: {"type":"message_stop"}

"#;
	let out = t.response_body(end, true).unwrap();
	assert_eq!(out.usage, Some(TokenUsage::new(11, 6, 17)));
	assert_eq!(out.response_model.as_deref(), Some("claude-sonnet-4"));
}

#[test]
fn tool_use_streaming_maps_to_tool_call_chunks() {
	let parsed = chat(r#"{"model":"c","messages":[],"stream":true}"#);
	let mut t = GcpAnthropicTranslator::new(target(), None);
	t.request_body(&parsed).unwrap();

	let frames = br#"event: content_block_start
data: {"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"f","input":{}}}

event: content_block_delta
data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"x\":1}"}}

"#;
	let out = t.response_body(frames, false).unwrap();
	let text = String::from_utf8(out.body.unwrap()).unwrap();
	let chunks: Vec<serde_json::Value> = text
		.lines()
		.filter_map(|l| l.strip_prefix("data: "))
		.map(|d| serde_json::from_str(d).unwrap())
		.collect();
	assert_eq!(
		chunks[0]["choices"][0]["delta"]["tool_calls"][0]["id"],
		json!("toolu_1")
	);
	assert_eq!(
		chunks[1]["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"],
		json!("{\"x\":1}")
	);
}
