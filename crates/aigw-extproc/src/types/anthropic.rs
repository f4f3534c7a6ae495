use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Version pin sent to Anthropic models hosted on Vertex.
/// https://docs.anthropic.com/en/api/claude-on-vertex-ai
pub const VERTEX_ANTHROPIC_VERSION: &str = "vertex-2023-10-16";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessagesRequest {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	pub messages: Vec<RequestMessage>,
	pub max_tokens: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub system: Option<SystemPrompt>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stream: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub top_k: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stop_sequences: Option<Vec<String>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tools: Option<Vec<ToolDef>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_choice: Option<Value>,
	#[serde(flatten)]
	pub rest: serde_json::Map<String, Value>,
}

impl MessagesRequest {
	pub fn is_streaming(&self) -> bool {
		self.stream.unwrap_or_default()
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
	Text(String),
	Blocks(Vec<SystemBlock>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemBlock {
	#[serde(rename = "type")]
	pub kind: String,
	pub text: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
	User,
	Assistant,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestMessage {
	pub role: Role,
	pub content: MessageContent,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
	Text(String),
	Blocks(Vec<ContentBlock>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
	Text {
		text: String,
	},
	ToolUse {
		id: String,
		name: String,
		input: Value,
	},
	ToolResult {
		tool_use_id: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		content: Option<Value>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		is_error: Option<bool>,
	},
	Thinking {
		thinking: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		signature: Option<String>,
	},
	#[serde(other)]
	Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDef {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub input_schema: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessagesResponse {
	pub id: String,
	#[serde(rename = "type")]
	pub kind: String,
	pub role: Role,
	pub content: Vec<ContentBlock>,
	pub model: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stop_reason: Option<StopReason>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stop_sequence: Option<String>,
	pub usage: MessagesUsage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
	EndTurn,
	MaxTokens,
	StopSequence,
	ToolUse,
	Refusal,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct MessagesUsage {
	#[serde(default)]
	pub input_tokens: u64,
	#[serde(default)]
	pub output_tokens: u64,
}

/// Streaming events for the messages API. Each arrives as an SSE frame with
/// a matching `event:` name; the payload `type` field is authoritative.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
	MessageStart {
		message: MessageStart,
	},
	ContentBlockStart {
		index: u32,
		content_block: ContentBlock,
	},
	ContentBlockDelta {
		index: u32,
		delta: ContentDelta,
	},
	ContentBlockStop {
		index: u32,
	},
	MessageDelta {
		delta: MessageDelta,
		#[serde(default)]
		usage: Option<MessagesUsage>,
	},
	MessageStop,
	Ping,
	Error {
		error: StreamError,
	},
	#[serde(other)]
	Unknown,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MessageStart {
	pub id: String,
	pub model: String,
	pub role: Role,
	#[serde(default)]
	pub usage: Option<MessagesUsage>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
	TextDelta { text: String },
	InputJsonDelta { partial_json: String },
	ThinkingDelta { thinking: String },
	SignatureDelta { signature: String },
	#[serde(other)]
	Unknown,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MessageDelta {
	#[serde(default)]
	pub stop_reason: Option<StopReason>,
	#[serde(default)]
	pub stop_sequence: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StreamError {
	#[serde(rename = "type")]
	pub kind: String,
	pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
	#[serde(rename = "type")]
	pub kind: String,
	pub error: ErrorDetail,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
	#[serde(rename = "type")]
	pub kind: String,
	pub message: String,
}
