use serde::{Deserialize, Serialize};
use serde_json::Value;

/// OpenAI chat completion request. Unknown fields are carried through `rest`
/// so passthrough backends see exactly what the client sent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
	pub model: String,
	pub messages: Vec<ChatMessage>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stream: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stream_options: Option<StreamOptions>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_completion_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stop: Option<Stop>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tools: Option<Vec<Tool>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_choice: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub frequency_penalty: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub presence_penalty: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub seed: Option<i64>,
	#[serde(flatten)]
	pub rest: serde_json::Map<String, Value>,
}

impl ChatCompletionRequest {
	pub fn is_streaming(&self) -> bool {
		self.stream.unwrap_or_default()
	}

	/// The effective output token ceiling. Bedrock requires one; Anthropic's
	/// documented default is used when the client sent neither field.
	pub fn max_output_tokens(&self) -> u64 {
		self
			.max_completion_tokens
			.or(self.max_tokens)
			.unwrap_or(4096)
	}

	pub fn stop_sequences(&self) -> Vec<String> {
		match &self.stop {
			Some(Stop::One(s)) => vec![s.clone()],
			Some(Stop::Many(v)) => v.clone(),
			None => Vec::new(),
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Stop {
	One(String),
	Many(Vec<String>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamOptions {
	pub include_usage: bool,
	#[serde(flatten)]
	pub rest: serde_json::Map<String, Value>,
}

pub const SYSTEM_ROLE: &str = "system";
pub const DEVELOPER_ROLE: &str = "developer";
pub const USER_ROLE: &str = "user";
pub const ASSISTANT_ROLE: &str = "assistant";
pub const TOOL_ROLE: &str = "tool";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
	pub role: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<MessageContent>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<ToolCall>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_call_id: Option<String>,
}

impl ChatMessage {
	/// Flattens structured content down to its text parts. Non-text parts
	/// (images, audio) are dropped; translators that support them read the
	/// structured form directly.
	pub fn text(&self) -> Option<String> {
		match &self.content {
			Some(MessageContent::Text(s)) => Some(s.clone()),
			Some(MessageContent::Parts(parts)) => {
				let text = parts
					.iter()
					.filter_map(|p| p.text.as_deref())
					.collect::<Vec<_>>()
					.join("\n");
				if text.is_empty() { None } else { Some(text) }
			},
			None => None,
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
	Text(String),
	Parts(Vec<ContentPart>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentPart {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub text: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub image_url: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tool {
	#[serde(rename = "type")]
	pub kind: String,
	pub function: FunctionDef,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FunctionDef {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub parameters: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
	pub id: String,
	#[serde(rename = "type")]
	pub kind: String,
	pub function: FunctionCall,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FunctionCall {
	pub name: String,
	pub arguments: String,
}

/// Chat completion response. Identity fields are optional so that bodies
/// synthesized from backend dialects omit what the backend never reported.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	pub object: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub created: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	pub choices: Vec<ChatChoice>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatChoice {
	pub index: u32,
	pub message: ResponseMessage,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub finish_reason: Option<FinishReason>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResponseMessage {
	pub role: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
	Stop,
	Length,
	ToolCalls,
	ContentFilter,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
	pub prompt_tokens: u64,
	pub completion_tokens: u64,
	pub total_tokens: u64,
}

/// A single SSE chunk of a streaming chat completion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
	pub id: String,
	pub object: String,
	pub created: i64,
	pub model: String,
	pub choices: Vec<ChunkChoice>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkChoice {
	pub index: u32,
	pub delta: ChunkDelta,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub finish_reason: Option<FinishReason>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub role: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<ToolCallChunk>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallChunk {
	pub index: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	#[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
	pub kind: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub function: Option<FunctionCallChunk>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FunctionCallChunk {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub arguments: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingsRequest {
	pub model: String,
	pub input: EmbeddingsInput,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub encoding_format: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub dimensions: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user: Option<String>,
	#[serde(flatten)]
	pub rest: serde_json::Map<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingsInput {
	Text(String),
	Batch(Vec<Value>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingsResponse {
	pub object: String,
	pub data: Vec<Embedding>,
	pub model: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub usage: Option<EmbeddingsUsage>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Embedding {
	pub object: String,
	pub index: u32,
	pub embedding: Vec<f32>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct EmbeddingsUsage {
	pub prompt_tokens: u64,
	pub total_tokens: u64,
}

/// `GET /v1/models` list entry, returned verbatim from the declared catalog.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Model {
	pub id: String,
	pub object: String,
	pub created: i64,
	pub owned_by: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelList {
	pub object: String,
	pub data: Vec<Model>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
	pub error: ErrorBody,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
	#[serde(rename = "type")]
	pub kind: String,
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub param: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub code: Option<String>,
}

impl ErrorResponse {
	pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			error: ErrorBody {
				kind: kind.into(),
				message: message.into(),
				param: None,
				code: None,
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_roundtrip_preserves_unknown_fields() {
		let raw = r#"{"model":"m","messages":[{"role":"user","content":"hi"}],"logprobs":true}"#;
		let req: ChatCompletionRequest = serde_json::from_str(raw).unwrap();
		assert_eq!(req.model, "m");
		assert!(req.rest.contains_key("logprobs"));
		let out = serde_json::to_value(&req).unwrap();
		assert_eq!(out["logprobs"], serde_json::json!(true));
	}

	#[test]
	fn message_text_flattens_parts() {
		let raw = r#"{"role":"user","content":[{"type":"text","text":"a"},{"type":"text","text":"b"}]}"#;
		let msg: ChatMessage = serde_json::from_str(raw).unwrap();
		assert_eq!(msg.text().as_deref(), Some("a\nb"));
	}

	#[test]
	fn stop_accepts_string_or_list() {
		let one: ChatCompletionRequest =
			serde_json::from_str(r#"{"model":"m","messages":[],"stop":"x"}"#).unwrap();
		assert_eq!(one.stop_sequences(), vec!["x".to_string()]);
		let many: ChatCompletionRequest =
			serde_json::from_str(r#"{"model":"m","messages":[],"stop":["x","y"]}"#).unwrap();
		assert_eq!(many.stop_sequences().len(), 2);
	}
}
