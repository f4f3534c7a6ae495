use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Gemini `generateContent` request.
/// https://cloud.google.com/vertex-ai/docs/reference/rest/v1/GenerateContentRequest
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
	pub contents: Vec<Content>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub system_instruction: Option<Content>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub generation_config: Option<GenerationConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tools: Option<Vec<ToolDeclarations>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Content {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub role: Option<String>,
	#[serde(default)]
	pub parts: Vec<Part>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub text: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub function_call: Option<FunctionCall>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub function_response: Option<FunctionResponse>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FunctionCall {
	pub name: String,
	#[serde(default)]
	pub args: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FunctionResponse {
	pub name: String,
	pub response: Value,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_output_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub stop_sequences: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDeclarations {
	pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Clone, Debug, Serialize)]
pub struct FunctionDeclaration {
	pub name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub parameters: Option<Value>,
}

/// `generateContent` / `streamGenerateContent` response. Streaming responses
/// reuse the same shape per SSE event.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
	#[serde(default)]
	pub candidates: Vec<Candidate>,
	#[serde(default)]
	pub usage_metadata: Option<UsageMetadata>,
	#[serde(default)]
	pub model_version: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
	#[serde(default)]
	pub content: Option<Content>,
	#[serde(default)]
	pub finish_reason: Option<String>,
	#[serde(default)]
	pub index: Option<u32>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
	#[serde(default)]
	pub prompt_token_count: u64,
	#[serde(default)]
	pub candidates_token_count: u64,
	#[serde(default)]
	pub total_token_count: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ErrorResponse {
	pub error: ErrorDetail,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ErrorDetail {
	#[serde(default)]
	pub code: Option<i64>,
	pub message: String,
	#[serde(default)]
	pub status: Option<String>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn response_parses_usage() {
		let raw = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"hello"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":2,"totalTokenCount":6},"modelVersion":"gemini-2.0-flash"}"#;
		let resp: GenerateContentResponse = serde_json::from_str(raw).unwrap();
		assert_eq!(resp.usage_metadata.unwrap().total_token_count, 6);
		assert_eq!(
			resp.candidates[0]
				.content
				.as_ref()
				.unwrap()
				.parts[0]
				.text
				.as_deref(),
			Some("hello")
		);
	}
}
