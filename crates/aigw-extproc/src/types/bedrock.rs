use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::eventstream;

/// Converse API request body. The model travels in the request path
/// (`/model/<id>/converse`), not the body.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ConverseRequest {
	/// Inference parameters to pass to the model.
	#[serde(rename = "inferenceConfig")]
	pub inference_config: InferenceConfiguration,
	/// The messages that you want to send to the model.
	pub messages: Vec<Message>,
	/// A prompt that provides instructions or context to the model.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub system: Option<Vec<SystemContentBlock>>,
	/// Configuration information for the tools that the model can use.
	#[serde(rename = "toolConfig", skip_serializing_if = "Option::is_none")]
	pub tool_config: Option<ToolConfiguration>,
	/// Additional model request fields.
	#[serde(
		rename = "additionalModelRequestFields",
		skip_serializing_if = "Option::is_none"
	)]
	pub additional_model_request_fields: Option<Value>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct InferenceConfiguration {
	#[serde(rename = "maxTokens", skip_serializing_if = "Option::is_none")]
	pub max_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(rename = "topP", skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(rename = "stopSequences", skip_serializing_if = "Vec::is_empty")]
	pub stop_sequences: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
	#[default]
	User,
	Assistant,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
	pub role: Role,
	pub content: Vec<ContentBlock>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentBlock {
	Text(String),
	ToolUse(ToolUseBlock),
	ToolResult(ToolResultBlock),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseBlock {
	/// The ID for the tool request.
	pub tool_use_id: String,
	/// The name of the tool that the model wants to use.
	pub name: String,
	/// The input to pass to the tool.
	pub input: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultBlock {
	pub tool_use_id: String,
	pub content: Vec<ToolResultContentBlock>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub status: Option<ToolResultStatus>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolResultContentBlock {
	Text(String),
	Json(Value),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolResultStatus {
	Error,
	Success,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemContentBlock {
	Text { text: String },
}

#[derive(Clone, Debug, Serialize)]
pub struct ToolConfiguration {
	pub tools: Vec<Tool>,
	#[serde(rename = "toolChoice", skip_serializing_if = "Option::is_none")]
	pub tool_choice: Option<ToolChoice>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Tool {
	ToolSpec(ToolSpecification),
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpecification {
	pub name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub input_schema: Option<ToolInputSchema>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolInputSchema {
	Json(Value),
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolChoice {
	/// The model must request at least one tool (no text is generated).
	Any,
	/// The model automatically decides between a tool call and text.
	Auto,
	/// The model must request the named tool.
	Tool { name: String },
}

/// Converse response (matches the AWS SDK ConverseOutput shape).
#[derive(Clone, Debug, Deserialize)]
pub struct ConverseResponse {
	pub output: Option<ConverseOutput>,
	#[serde(rename = "stopReason")]
	pub stop_reason: Option<StopReason>,
	pub usage: Option<TokenUsage>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConverseOutput {
	Message(Message),
	#[serde(other)]
	Unknown,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct TokenUsage {
	#[serde(rename = "inputTokens")]
	pub input_tokens: u64,
	#[serde(rename = "outputTokens")]
	pub output_tokens: u64,
	#[serde(rename = "totalTokens")]
	pub total_tokens: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
	ContentFiltered,
	EndTurn,
	GuardrailIntervened,
	MaxTokens,
	ModelContextWindowExceeded,
	StopSequence,
	ToolUse,
}

/// Bedrock error payload. The field name is capitalized by some services and
/// not by others.
#[derive(Clone, Debug, Deserialize)]
pub struct ConverseErrorResponse {
	#[serde(alias = "Message")]
	pub message: String,
}

// Stream events, decoded from the binary event-stream framing. These are not
// deserialized directly; the `:event-type` header selects the payload shape.
#[derive(Clone, Debug)]
pub enum ConverseStreamOutput {
	ContentBlockStart(ContentBlockStartEvent),
	ContentBlockDelta(ContentBlockDeltaEvent),
	ContentBlockStop(ContentBlockStopEvent),
	MessageStart(MessageStartEvent),
	MessageStop(MessageStopEvent),
	Metadata(ConverseStreamMetadataEvent),
}

impl ConverseStreamOutput {
	pub fn deserialize(m: &eventstream::Message) -> anyhow::Result<Self> {
		if m.message_type.as_deref() == Some("exception") {
			let exception_type = m.exception_type.clone().unwrap_or_else(|| "unknown".to_owned());
			let error_message = String::from_utf8_lossy(&m.payload).to_string();
			anyhow::bail!("{exception_type}: {error_message}");
		}
		let Some(event_type) = m.event_type.as_deref() else {
			anyhow::bail!("no event type header")
		};
		let payload = m.payload.as_ref();
		Ok(match event_type {
			"contentBlockStart" => ConverseStreamOutput::ContentBlockStart(serde_json::from_slice(payload)?),
			"contentBlockDelta" => ConverseStreamOutput::ContentBlockDelta(serde_json::from_slice(payload)?),
			"contentBlockStop" => ConverseStreamOutput::ContentBlockStop(serde_json::from_slice(payload)?),
			"messageStart" => ConverseStreamOutput::MessageStart(serde_json::from_slice(payload)?),
			"messageStop" => ConverseStreamOutput::MessageStop(serde_json::from_slice(payload)?),
			"metadata" => ConverseStreamOutput::Metadata(serde_json::from_slice(payload)?),
			other => anyhow::bail!("unexpected event type: {other}"),
		})
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentBlockStartEvent {
	pub start: Option<ContentBlockStart>,
	pub content_block_index: i32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentBlockStart {
	ToolUse(ToolUseBlockStart),
	#[serde(other)]
	Unknown,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseBlockStart {
	pub tool_use_id: String,
	pub name: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentBlockDeltaEvent {
	pub delta: Option<ContentBlockDelta>,
	pub content_block_index: i32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentBlockDelta {
	Text(String),
	ToolUse(ToolUseBlockDelta),
	ReasoningContent(Value),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseBlockDelta {
	pub input: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentBlockStopEvent {
	pub content_block_index: i32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStartEvent {
	pub role: Role,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStopEvent {
	pub stop_reason: StopReason,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseStreamMetadataEvent {
	pub usage: Option<TokenUsage>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn converse_request_minimal_shape() {
		let req = ConverseRequest {
			system: Some(vec![SystemContentBlock::Text {
				text: "You are a chatbot.".to_string(),
			}]),
			..Default::default()
		};
		let got = serde_json::to_value(&req).unwrap();
		assert_eq!(
			got,
			serde_json::json!({
				"inferenceConfig": {},
				"messages": [],
				"system": [{"text": "You are a chatbot."}]
			})
		);
	}

	#[test]
	fn converse_response_parses() {
		let raw = r#"{"output":{"message":{"content":[{"text":"r"}],"role":"assistant"}},"stopReason":"end_turn","usage":{"inputTokens":10,"outputTokens":20,"totalTokens":30}}"#;
		let resp: ConverseResponse = serde_json::from_str(raw).unwrap();
		let usage = resp.usage.unwrap();
		assert_eq!(usage.input_tokens, 10);
		assert_eq!(usage.total_tokens, 30);
		match resp.output {
			Some(ConverseOutput::Message(m)) => {
				assert_eq!(m.role, Role::Assistant);
				assert!(matches!(m.content[0], ContentBlock::Text(ref t) if t == "r"));
			},
			other => panic!("unexpected output {other:?}"),
		}
	}

	#[test]
	fn error_message_alias() {
		let lower: ConverseErrorResponse = serde_json::from_str(r#"{"message":"nope"}"#).unwrap();
		assert_eq!(lower.message, "nope");
		let upper: ConverseErrorResponse = serde_json::from_str(r#"{"Message":"nope"}"#).unwrap();
		assert_eq!(upper.message, "nope");
	}
}
