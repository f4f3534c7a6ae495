use std::collections::HashMap;

use rand::Rng;

use super::{Error, GcpTarget, ParsedRequest, RequestOutcome, ResponseOutcome, escape_path_segment};
use crate::mutation;
use crate::proto::HeaderMutation;
use crate::sse::SseParser;
use crate::types::TokenUsage;
use crate::types::{gemini, openai};

/// OpenAI chat completions against Vertex Gemini. Requests map to
/// `generateContent` (or `streamGenerateContent?alt=sse`); responses map
/// candidates back into choices.
pub struct GeminiTranslator {
	target: GcpTarget,
	model_override: Option<String>,
	model: String,
	streaming: bool,
	message_id: String,
	created: i64,
	sse: SseParser,
	sent_role: bool,
	usage_reported: bool,
}

impl GeminiTranslator {
	pub fn new(target: GcpTarget, model_override: Option<String>) -> Self {
		let id: u64 = rand::rng().random();
		Self {
			target,
			model_override,
			model: String::new(),
			streaming: false,
			message_id: format!("chatcmpl-{id:016x}"),
			created: chrono::Utc::now().timestamp(),
			sse: SseParser::new(),
			sent_role: false,
			usage_reported: false,
		}
	}

	pub fn request_body(&mut self, parsed: &ParsedRequest) -> Result<RequestOutcome, Error> {
		let ParsedRequest::Chat(req) = parsed else {
			return Err(Error::Invalid(
				"gemini requires chat completion input".to_string(),
			));
		};
		self.streaming = req.is_streaming();
		self.model = self
			.model_override
			.clone()
			.unwrap_or_else(|| req.model.clone());

		let gemini_req = chat_to_generate_content(req);
		let body = serde_json::to_vec(&gemini_req).map_err(Error::RequestMarshal)?;

		let verb = if self.streaming {
			"streamGenerateContent?alt=sse"
		} else {
			"generateContent"
		};
		let path = format!(
			"/v1/projects/{}/locations/{}/publishers/google/models/{}:{verb}",
			self.target.project,
			self.target.region,
			escape_path_segment(&self.model),
		);

		let mut out = RequestOutcome {
			body: Some(body),
			..Default::default()
		};
		mutation::set_header(&mut out.header_mutation, ":path", path.into_bytes());
		mutation::remove_header(&mut out.header_mutation, "content-length");
		Ok(out)
	}

	pub fn response_headers(
		&mut self,
		_headers: &HashMap<String, String>,
	) -> Result<HeaderMutation, Error> {
		Ok(HeaderMutation::default())
	}

	pub fn response_body(
		&mut self,
		chunk: &[u8],
		end_of_stream: bool,
	) -> Result<ResponseOutcome, Error> {
		if self.streaming {
			return self.stream_chunk(chunk, end_of_stream);
		}
		if !end_of_stream {
			return Ok(ResponseOutcome::default());
		}
		let resp: gemini::GenerateContentResponse =
			serde_json::from_slice(chunk).map_err(Error::ResponseParsing)?;
		let usage = resp.usage_metadata.map(usage_from_metadata);
		let response_model = resp.model_version.clone().or_else(|| Some(self.model.clone()));
		let openai_resp = self.generate_content_to_chat_completion(&resp);
		let body = serde_json::to_vec(&openai_resp).map_err(Error::ResponseMarshal)?;
		Ok(ResponseOutcome {
			body: Some(body),
			usage,
			response_model,
		})
	}

	pub fn response_error(
		&mut self,
		_headers: &HashMap<String, String>,
		body: &[u8],
	) -> Result<ResponseOutcome, Error> {
		let err = match serde_json::from_slice::<gemini::ErrorResponse>(body) {
			Ok(e) => openai::ErrorResponse::new(
				e.error.status.unwrap_or_else(|| "invalid_request_error".to_string()),
				e.error.message,
			),
			Err(_) => openai::ErrorResponse::new(
				"invalid_request_error",
				String::from_utf8_lossy(body).to_string(),
			),
		};
		let body = serde_json::to_vec(&err).map_err(Error::ResponseMarshal)?;
		Ok(ResponseOutcome {
			body: Some(body),
			..Default::default()
		})
	}

	fn stream_chunk(&mut self, chunk: &[u8], end_of_stream: bool) -> Result<ResponseOutcome, Error> {
		let mut events = self.sse.feed(chunk);
		if end_of_stream && let Some(ev) = self.sse.finish() {
			events.push(ev);
		}
		let mut out_buf = Vec::new();
		let mut usage = None;
		let mut response_model = None;
		for ev in events {
			if ev.data.is_empty() || ev.is_done() {
				continue;
			}
			let resp: gemini::GenerateContentResponse = match serde_json::from_str(&ev.data) {
				Ok(r) => r,
				Err(e) => {
					tracing::warn!("dropping undecodable gemini stream event: {e}");
					continue;
				},
			};
			if let Some(u) = resp.usage_metadata {
				usage = Some(usage_from_metadata(u));
			}
			if resp.model_version.is_some() {
				response_model = resp.model_version.clone();
			}
			let cc = self.generate_content_to_chunk(&resp);
			let json = serde_json::to_vec(&cc).map_err(Error::ResponseMarshal)?;
			out_buf.extend_from_slice(&crate::sse::data_frame(&json));
		}
		if end_of_stream {
			out_buf.extend_from_slice(&crate::sse::done_frame());
		}
		let usage = usage.filter(|_| !self.usage_reported);
		if usage.is_some() {
			self.usage_reported = true;
		}
		Ok(ResponseOutcome {
			body: Some(out_buf),
			usage,
			response_model,
		})
	}

	fn generate_content_to_chat_completion(
		&self,
		resp: &gemini::GenerateContentResponse,
	) -> openai::ChatCompletionResponse {
		let choices = resp
			.candidates
			.iter()
			.enumerate()
			.map(|(i, cand)| {
				let (content, tool_calls) = candidate_parts(cand);
				openai::ChatChoice {
					index: cand.index.unwrap_or(i as u32),
					message: openai::ResponseMessage {
						role: openai::ASSISTANT_ROLE.to_string(),
						content,
						tool_calls,
					},
					finish_reason: cand.finish_reason.as_deref().map(map_finish_reason),
				}
			})
			.collect();
		openai::ChatCompletionResponse {
			id: Some(self.message_id.clone()),
			object: "chat.completion".to_string(),
			created: Some(self.created),
			model: resp.model_version.clone().or_else(|| Some(self.model.clone())),
			choices,
			usage: resp.usage_metadata.map(|u| openai::Usage {
				prompt_tokens: u.prompt_token_count,
				completion_tokens: u.candidates_token_count,
				total_tokens: u.total_token_count,
			}),
		}
	}

	fn generate_content_to_chunk(
		&mut self,
		resp: &gemini::GenerateContentResponse,
	) -> openai::ChatCompletionChunk {
		let mut choices = Vec::new();
		for (i, cand) in resp.candidates.iter().enumerate() {
			let (content, tool_calls) = candidate_parts(cand);
			let role = if self.sent_role {
				None
			} else {
				self.sent_role = true;
				Some(openai::ASSISTANT_ROLE.to_string())
			};
			choices.push(openai::ChunkChoice {
				index: cand.index.unwrap_or(i as u32),
				delta: openai::ChunkDelta {
					role,
					content,
					tool_calls: tool_calls.map(|calls| {
						calls
							.into_iter()
							.enumerate()
							.map(|(idx, c)| openai::ToolCallChunk {
								index: idx as u32,
								id: Some(c.id),
								kind: Some(c.kind),
								function: Some(openai::FunctionCallChunk {
									name: Some(c.function.name),
									arguments: Some(c.function.arguments),
								}),
							})
							.collect()
					}),
				},
				finish_reason: cand.finish_reason.as_deref().map(map_finish_reason),
			});
		}
		openai::ChatCompletionChunk {
			id: self.message_id.clone(),
			object: "chat.completion.chunk".to_string(),
			created: self.created,
			model: resp
				.model_version
				.clone()
				.unwrap_or_else(|| self.model.clone()),
			choices,
			usage: resp.usage_metadata.map(|u| openai::Usage {
				prompt_tokens: u.prompt_token_count,
				completion_tokens: u.candidates_token_count,
				total_tokens: u.total_token_count,
			}),
		}
	}
}

fn usage_from_metadata(u: gemini::UsageMetadata) -> TokenUsage {
	TokenUsage::new(
		u.prompt_token_count,
		u.candidates_token_count,
		u.total_token_count,
	)
}

/// Flattens candidate parts into text plus tool calls. Gemini omits call
/// ids, so synthetic ones are generated for the OpenAI shape.
fn candidate_parts(
	cand: &gemini::Candidate,
) -> (Option<String>, Option<Vec<openai::ToolCall>>) {
	let Some(content) = &cand.content else {
		return (None, None);
	};
	let mut text_parts = Vec::new();
	let mut tool_calls = Vec::new();
	for part in &content.parts {
		if let Some(t) = &part.text {
			text_parts.push(t.clone());
		}
		if let Some(fc) = &part.function_call {
			let id: u64 = rand::rng().random();
			tool_calls.push(openai::ToolCall {
				id: format!("call_{id:016x}"),
				kind: "function".to_string(),
				function: openai::FunctionCall {
					name: fc.name.clone(),
					arguments: fc.args.to_string(),
				},
			});
		}
	}
	(
		if text_parts.is_empty() {
			None
		} else {
			Some(text_parts.join(""))
		},
		if tool_calls.is_empty() {
			None
		} else {
			Some(tool_calls)
		},
	)
}

fn map_finish_reason(reason: &str) -> openai::FinishReason {
	match reason {
		"STOP" => openai::FinishReason::Stop,
		"MAX_TOKENS" => openai::FinishReason::Length,
		"SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
			openai::FinishReason::ContentFilter
		},
		_ => openai::FinishReason::Stop,
	}
}

fn chat_to_generate_content(req: &openai::ChatCompletionRequest) -> gemini::GenerateContentRequest {
	let system_text = req
		.messages
		.iter()
		.filter(|m| m.role == openai::SYSTEM_ROLE || m.role == openai::DEVELOPER_ROLE)
		.filter_map(|m| m.text())
		.collect::<Vec<_>>()
		.join("\n");
	let system_instruction = if system_text.is_empty() {
		None
	} else {
		Some(gemini::Content {
			role: None,
			parts: vec![gemini::Part {
				text: Some(system_text),
				..Default::default()
			}],
		})
	};

	let mut contents = Vec::new();
	for msg in &req.messages {
		match msg.role.as_str() {
			openai::SYSTEM_ROLE | openai::DEVELOPER_ROLE => {},
			openai::ASSISTANT_ROLE => {
				let mut parts = Vec::new();
				if let Some(text) = msg.text() {
					parts.push(gemini::Part {
						text: Some(text),
						..Default::default()
					});
				}
				for call in msg.tool_calls.iter().flatten() {
					parts.push(gemini::Part {
						function_call: Some(gemini::FunctionCall {
							name: call.function.name.clone(),
							args: serde_json::from_str(&call.function.arguments)
								.unwrap_or(serde_json::Value::Null),
						}),
						..Default::default()
					});
				}
				if parts.is_empty() {
					continue;
				}
				contents.push(gemini::Content {
					role: Some("model".to_string()),
					parts,
				});
			},
			openai::TOOL_ROLE => {
				let response = msg
					.text()
					.and_then(|t| serde_json::from_str(&t).ok())
					.unwrap_or_else(|| serde_json::json!({"result": msg.text()}));
				contents.push(gemini::Content {
					role: Some("user".to_string()),
					parts: vec![gemini::Part {
						function_response: Some(gemini::FunctionResponse {
							// Gemini matches results by function name, which the
							// OpenAI shape does not carry on the tool message.
							name: msg.tool_call_id.clone().unwrap_or_default(),
							response,
						}),
						..Default::default()
					}],
				});
			},
			_ => {
				let Some(text) = msg.text() else { continue };
				contents.push(gemini::Content {
					role: Some("user".to_string()),
					parts: vec![gemini::Part {
						text: Some(text),
						..Default::default()
					}],
				});
			},
		}
	}

	let generation_config = gemini::GenerationConfig {
		temperature: req.temperature,
		top_p: req.top_p,
		max_output_tokens: req.max_completion_tokens.or(req.max_tokens),
		stop_sequences: req.stop_sequences(),
	};
	let has_config = generation_config.temperature.is_some()
		|| generation_config.top_p.is_some()
		|| generation_config.max_output_tokens.is_some()
		|| !generation_config.stop_sequences.is_empty();

	let tools = req.tools.as_ref().map(|tools| {
		vec![gemini::ToolDeclarations {
			function_declarations: tools
				.iter()
				.map(|t| gemini::FunctionDeclaration {
					name: t.function.name.clone(),
					description: t.function.description.clone(),
					parameters: t.function.parameters.clone(),
				})
				.collect(),
		}]
	});

	gemini::GenerateContentRequest {
		contents,
		system_instruction,
		generation_config: has_config.then_some(generation_config),
		tools,
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn translator() -> GeminiTranslator {
		GeminiTranslator::new(
			GcpTarget {
				project: "my-project".to_string(),
				region: "us-central1".to_string(),
			},
			None,
		)
	}

	fn chat(raw: &str) -> ParsedRequest {
		ParsedRequest::Chat(serde_json::from_str(raw).unwrap())
	}

	#[test]
	fn request_path_and_shape() {
		let parsed = chat(
			r#"{"model":"gemini-2.0-flash","messages":[{"role":"system","content":"s"},{"role":"user","content":"q"}],"temperature":0.1}"#,
		);
		let mut t = translator();
		let out = t.request_body(&parsed).unwrap();
		assert_eq!(
			mutation::get_set_header(&out.header_mutation, ":path"),
			Some(
				b"/v1/projects/my-project/locations/us-central1/publishers/google/models/gemini-2.0-flash:generateContent".as_slice()
			)
		);
		let body: serde_json::Value = serde_json::from_slice(out.body.as_deref().unwrap()).unwrap();
		assert_eq!(body["systemInstruction"]["parts"][0]["text"], json!("s"));
		assert_eq!(body["contents"][0]["role"], json!("user"));
		assert_eq!(body["generationConfig"]["temperature"], json!(0.1));
	}

	#[test]
	fn streaming_path_uses_sse_alt() {
		let parsed = chat(r#"{"model":"g","messages":[],"stream":true}"#);
		let mut t = translator();
		let out = t.request_body(&parsed).unwrap();
		let path = mutation::get_set_header(&out.header_mutation, ":path").unwrap();
		assert!(path.ends_with(b":streamGenerateContent?alt=sse"));
	}

	#[test]
	fn buffered_response_translates() {
		let parsed = chat(r#"{"model":"g","messages":[{"role":"user","content":"q"}]}"#);
		let mut t = translator();
		t.request_body(&parsed).unwrap();
		let upstream = br#"{"candidates":[{"content":{"role":"model","parts":[{"text":"hello"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":2,"totalTokenCount":6},"modelVersion":"gemini-2.0-flash-001"}"#;
		let out = t.response_body(upstream, true).unwrap();
		assert_eq!(out.usage, Some(TokenUsage::new(4, 2, 6)));
		assert_eq!(out.response_model.as_deref(), Some("gemini-2.0-flash-001"));
		let body: serde_json::Value = serde_json::from_slice(out.body.as_deref().unwrap()).unwrap();
		assert_eq!(body["choices"][0]["message"]["content"], json!("hello"));
		assert_eq!(body["choices"][0]["finish_reason"], json!("stop"));
		assert_eq!(body["usage"]["total_tokens"], json!(6));
	}

	#[test]
	fn function_call_gets_synthetic_id() {
		let parsed = chat(r#"{"model":"g","messages":[{"role":"user","content":"q"}]}"#);
		let mut t = translator();
		t.request_body(&parsed).unwrap();
		let upstream = br#"{"candidates":[{"content":{"role":"model","parts":[{"functionCall":{"name":"f","args":{"x":1}}}]},"finishReason":"STOP"}]}"#;
		let out = t.response_body(upstream, true).unwrap();
		let body: serde_json::Value = serde_json::from_slice(out.body.as_deref().unwrap()).unwrap();
		let call = &body["choices"][0]["message"]["tool_calls"][0];
		assert!(call["id"].as_str().unwrap().starts_with("call_"));
		assert_eq!(call["function"]["name"], json!("f"));
	}

	#[test]
	fn streaming_chunks_and_done() {
		let parsed = chat(r#"{"model":"g","messages":[],"stream":true}"#);
		let mut t = translator();
		t.request_body(&parsed).unwrap();

		let first = t
			.response_body(
				b"data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"he\"}]}}]}\n\n",
				false,
			)
			.unwrap();
		let text = String::from_utf8(first.body.unwrap()).unwrap();
		assert!(text.contains("\"content\":\"he\""));
		assert!(text.contains("\"role\":\"assistant\""));

		let last = t
			.response_body(
				b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"y\"}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":1,\"candidatesTokenCount\":2,\"totalTokenCount\":3}}\n\n",
				true,
			)
			.unwrap();
		assert_eq!(last.usage, Some(TokenUsage::new(1, 2, 3)));
		let text = String::from_utf8(last.body.unwrap()).unwrap();
		assert!(text.ends_with("data: [DONE]\n\n"));
	}

	#[test]
	fn error_normalized() {
		let mut t = translator();
		let out = t
			.response_error(
				&HashMap::new(),
				br#"{"error":{"code":404,"message":"model not found","status":"NOT_FOUND"}}"#,
			)
			.unwrap();
		let body: serde_json::Value = serde_json::from_slice(out.body.as_deref().unwrap()).unwrap();
		assert_eq!(body["error"]["type"], json!("NOT_FOUND"));
		assert_eq!(body["error"]["message"], json!("model not found"));
	}
}
