use std::collections::HashMap;

use rand::Rng;

use super::{Error, ParsedRequest, RequestOutcome, ResponseOutcome, escape_path_segment};
use crate::eventstream::EventStreamDecoder;
use crate::mutation;
use crate::proto::HeaderMutation;
use crate::sse;
use crate::types::TokenUsage;
use crate::types::{bedrock, openai};

/// OpenAI chat completions against AWS Bedrock Converse. Requests are fully
/// rewritten; streaming responses arrive as the binary event stream and are
/// reframed into OpenAI chat-completion-chunk SSE lines.
pub struct BedrockTranslator {
	model_override: Option<String>,
	model: String,
	streaming: bool,
	message_id: String,
	created: i64,
	decoder: EventStreamDecoder,
	/// Tool-call argument buffers by content block index.
	tool_blocks: HashMap<i32, u32>,
	usage_reported: bool,
}

impl BedrockTranslator {
	pub fn new(model_override: Option<String>) -> Self {
		let id: u64 = rand::rng().random();
		Self {
			model_override,
			model: String::new(),
			streaming: false,
			message_id: format!("chatcmpl-{id:016x}"),
			created: chrono::Utc::now().timestamp(),
			decoder: EventStreamDecoder::new(),
			tool_blocks: HashMap::new(),
			usage_reported: false,
		}
	}

	pub fn request_body(&mut self, parsed: &ParsedRequest) -> Result<RequestOutcome, Error> {
		let ParsedRequest::Chat(req) = parsed else {
			return Err(Error::Invalid(
				"bedrock converse requires chat completion input".to_string(),
			));
		};
		self.streaming = req.is_streaming();
		self.model = self
			.model_override
			.clone()
			.unwrap_or_else(|| req.model.clone());

		let converse = chat_to_converse(req);
		let body = serde_json::to_vec(&converse).map_err(Error::RequestMarshal)?;

		let verb = if self.streaming {
			"converse-stream"
		} else {
			"converse"
		};
		let path = format!("/model/{}/{verb}", escape_path_segment(&self.model));

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
		let mut hm = HeaderMutation::default();
		if self.streaming {
			// The upstream spoke application/vnd.amazon.eventstream; what
			// leaves the gateway is SSE.
			mutation::set_header(&mut hm, "content-type", b"text/event-stream".to_vec());
			mutation::remove_header(&mut hm, "content-length");
		}
		Ok(hm)
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
		let resp: bedrock::ConverseResponse =
			serde_json::from_slice(chunk).map_err(Error::ResponseParsing)?;
		let usage = resp
			.usage
			.map(|u| TokenUsage::new(u.input_tokens, u.output_tokens, u.total_tokens));
		let openai_resp = converse_to_chat_completion(resp);
		let body = serde_json::to_vec(&openai_resp).map_err(Error::ResponseMarshal)?;
		Ok(ResponseOutcome {
			body: Some(body),
			usage,
			response_model: Some(self.model.clone()),
		})
	}

	pub fn response_error(
		&mut self,
		headers: &HashMap<String, String>,
		body: &[u8],
	) -> Result<ResponseOutcome, Error> {
		let kind = headers
			.get("x-amzn-errortype")
			.map(|t| t.split(':').next().unwrap_or(t).to_string())
			.unwrap_or_else(|| "invalid_request_error".to_string());
		let message = serde_json::from_slice::<bedrock::ConverseErrorResponse>(body)
			.map(|e| e.message)
			.unwrap_or_else(|_| String::from_utf8_lossy(body).to_string());
		let err = openai::ErrorResponse::new(kind, message);
		let body = serde_json::to_vec(&err).map_err(Error::ResponseMarshal)?;
		Ok(ResponseOutcome {
			body: Some(body),
			..Default::default()
		})
	}

	fn stream_chunk(&mut self, chunk: &[u8], end_of_stream: bool) -> Result<ResponseOutcome, Error> {
		let mut out_buf = Vec::new();
		let mut usage = None;
		for msg in self.decoder.feed(chunk)? {
			let event = match bedrock::ConverseStreamOutput::deserialize(&msg) {
				Ok(ev) => ev,
				Err(e) => {
					tracing::warn!("dropping undecodable bedrock event: {e}");
					continue;
				},
			};
			for cc in self.event_to_chunks(event, &mut usage) {
				let json = serde_json::to_vec(&cc).map_err(Error::ResponseMarshal)?;
				out_buf.extend_from_slice(&sse::data_frame(&json));
			}
		}
		if end_of_stream {
			out_buf.extend_from_slice(&sse::done_frame());
		}
		let usage = usage.filter(|_| !self.usage_reported);
		if usage.is_some() {
			self.usage_reported = true;
		}
		// Always replace the body: the raw event-stream bytes must never
		// reach the client.
		Ok(ResponseOutcome {
			body: Some(out_buf),
			usage,
			response_model: Some(self.model.clone()),
		})
	}

	fn event_to_chunks(
		&mut self,
		event: bedrock::ConverseStreamOutput,
		usage: &mut Option<TokenUsage>,
	) -> Vec<openai::ChatCompletionChunk> {
		use bedrock::ConverseStreamOutput::*;
		match event {
			MessageStart(start) => {
				let delta = openai::ChunkDelta {
					role: Some(role_name(start.role).to_string()),
					..Default::default()
				};
				vec![self.make_chunk(vec![chunk_choice(delta, None)], None)]
			},
			ContentBlockStart(start) => {
				let Some(bedrock::ContentBlockStart::ToolUse(tu)) = start.start else {
					return Vec::new();
				};
				let index = self.tool_blocks.len() as u32;
				self.tool_blocks.insert(start.content_block_index, index);
				let delta = openai::ChunkDelta {
					tool_calls: Some(vec![openai::ToolCallChunk {
						index,
						id: Some(tu.tool_use_id),
						kind: Some("function".to_string()),
						function: Some(openai::FunctionCallChunk {
							name: Some(tu.name),
							arguments: None,
						}),
					}]),
					..Default::default()
				};
				vec![self.make_chunk(vec![chunk_choice(delta, None)], None)]
			},
			ContentBlockDelta(d) => {
				let Some(delta) = d.delta else {
					return Vec::new();
				};
				let delta = match delta {
					bedrock::ContentBlockDelta::Text(t) => openai::ChunkDelta {
						content: Some(t),
						..Default::default()
					},
					bedrock::ContentBlockDelta::ToolUse(tu) => {
						let Some(&index) = self.tool_blocks.get(&d.content_block_index) else {
							return Vec::new();
						};
						openai::ChunkDelta {
							tool_calls: Some(vec![openai::ToolCallChunk {
								index,
								id: None,
								kind: None,
								function: Some(openai::FunctionCallChunk {
									name: None,
									arguments: Some(tu.input),
								}),
							}]),
							..Default::default()
						}
					},
					bedrock::ContentBlockDelta::ReasoningContent(_) => return Vec::new(),
				};
				vec![self.make_chunk(vec![chunk_choice(delta, None)], None)]
			},
			ContentBlockStop(stop) => {
				self.tool_blocks.remove(&stop.content_block_index);
				Vec::new()
			},
			MessageStop(stop) => {
				let finish = stop_reason_to_finish(stop.stop_reason);
				vec![self.make_chunk(
					vec![chunk_choice(openai::ChunkDelta::default(), Some(finish))],
					None,
				)]
			},
			Metadata(meta) => {
				let Some(u) = meta.usage else {
					return Vec::new();
				};
				*usage = Some(TokenUsage::new(u.input_tokens, u.output_tokens, u.total_tokens));
				vec![self.make_chunk(
					Vec::new(),
					Some(openai::Usage {
						prompt_tokens: u.input_tokens,
						completion_tokens: u.output_tokens,
						total_tokens: u.total_tokens,
					}),
				)]
			},
		}
	}

	fn make_chunk(
		&self,
		choices: Vec<openai::ChunkChoice>,
		usage: Option<openai::Usage>,
	) -> openai::ChatCompletionChunk {
		openai::ChatCompletionChunk {
			id: self.message_id.clone(),
			object: "chat.completion.chunk".to_string(),
			created: self.created,
			model: self.model.clone(),
			choices,
			usage,
		}
	}
}

fn chunk_choice(
	delta: openai::ChunkDelta,
	finish_reason: Option<openai::FinishReason>,
) -> openai::ChunkChoice {
	openai::ChunkChoice {
		index: 0,
		delta,
		finish_reason,
	}
}

fn role_name(role: bedrock::Role) -> &'static str {
	match role {
		bedrock::Role::Assistant => openai::ASSISTANT_ROLE,
		bedrock::Role::User => openai::USER_ROLE,
	}
}

fn chat_to_converse(req: &openai::ChatCompletionRequest) -> bedrock::ConverseRequest {
	// System and developer prompts move to the dedicated system field.
	let system_text = req
		.messages
		.iter()
		.filter(|m| is_system_role(&m.role))
		.filter_map(|m| m.text())
		.collect::<Vec<_>>()
		.join("\n");
	let system = if system_text.is_empty() {
		None
	} else {
		Some(vec![bedrock::SystemContentBlock::Text { text: system_text }])
	};

	let mut messages: Vec<bedrock::Message> = Vec::new();
	for msg in req.messages.iter().filter(|m| !is_system_role(&m.role)) {
		match msg.role.as_str() {
			openai::TOOL_ROLE => {
				let block = bedrock::ContentBlock::ToolResult(bedrock::ToolResultBlock {
					tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
					content: vec![bedrock::ToolResultContentBlock::Text(
						msg.text().unwrap_or_default(),
					)],
					status: None,
				});
				messages.push(bedrock::Message {
					role: bedrock::Role::User,
					content: vec![block],
				});
			},
			openai::ASSISTANT_ROLE => {
				let mut content = Vec::new();
				if let Some(text) = msg.text().filter(|t| !t.trim().is_empty()) {
					content.push(bedrock::ContentBlock::Text(text));
				}
				for call in msg.tool_calls.iter().flatten() {
					let input = serde_json::from_str(&call.function.arguments)
						.unwrap_or(serde_json::Value::Null);
					content.push(bedrock::ContentBlock::ToolUse(bedrock::ToolUseBlock {
						tool_use_id: call.id.clone(),
						name: call.function.name.clone(),
						input,
					}));
				}
				if content.is_empty() {
					continue;
				}
				messages.push(bedrock::Message {
					role: bedrock::Role::Assistant,
					content,
				});
			},
			_ => {
				let Some(text) = msg.text().filter(|t| !t.trim().is_empty()) else {
					continue;
				};
				messages.push(bedrock::Message {
					role: bedrock::Role::User,
					content: vec![bedrock::ContentBlock::Text(text)],
				});
			},
		}
	}

	let inference_config = bedrock::InferenceConfiguration {
		max_tokens: req.max_completion_tokens.or(req.max_tokens),
		temperature: req.temperature,
		top_p: req.top_p,
		stop_sequences: req.stop_sequences(),
	};

	let tool_choice = match req.tool_choice.as_ref() {
		Some(serde_json::Value::String(s)) => match s.as_str() {
			"auto" => Some(bedrock::ToolChoice::Auto),
			"required" => Some(bedrock::ToolChoice::Any),
			_ => None,
		},
		Some(serde_json::Value::Object(o)) => o
			.get("function")
			.and_then(|f| f.get("name"))
			.and_then(|n| n.as_str())
			.map(|name| bedrock::ToolChoice::Tool {
				name: name.to_string(),
			}),
		_ => None,
	};
	let tool_config = req.tools.as_ref().map(|tools| bedrock::ToolConfiguration {
		tools: tools
			.iter()
			.map(|t| {
				bedrock::Tool::ToolSpec(bedrock::ToolSpecification {
					name: t.function.name.clone(),
					description: t.function.description.clone(),
					input_schema: t
						.function
						.parameters
						.clone()
						.map(bedrock::ToolInputSchema::Json),
				})
			})
			.collect(),
		tool_choice,
	});

	bedrock::ConverseRequest {
		inference_config,
		messages,
		system,
		tool_config,
		additional_model_request_fields: None,
	}
}

fn converse_to_chat_completion(resp: bedrock::ConverseResponse) -> openai::ChatCompletionResponse {
	let mut message = openai::ResponseMessage {
		role: openai::ASSISTANT_ROLE.to_string(),
		..Default::default()
	};
	if let Some(bedrock::ConverseOutput::Message(m)) = resp.output {
		message.role = role_name(m.role).to_string();
		let mut text_parts = Vec::new();
		let mut tool_calls = Vec::new();
		for block in m.content {
			match block {
				bedrock::ContentBlock::Text(t) => text_parts.push(t),
				bedrock::ContentBlock::ToolUse(tu) => tool_calls.push(openai::ToolCall {
					id: tu.tool_use_id,
					kind: "function".to_string(),
					function: openai::FunctionCall {
						name: tu.name,
						arguments: tu.input.to_string(),
					},
				}),
				bedrock::ContentBlock::ToolResult(_) => {},
			}
		}
		if !text_parts.is_empty() {
			message.content = Some(text_parts.join(""));
		}
		if !tool_calls.is_empty() {
			message.tool_calls = Some(tool_calls);
		}
	}

	openai::ChatCompletionResponse {
		object: "chat.completion".to_string(),
		choices: vec![openai::ChatChoice {
			index: 0,
			message,
			finish_reason: resp.stop_reason.map(stop_reason_to_finish),
		}],
		usage: resp.usage.map(|u| openai::Usage {
			prompt_tokens: u.input_tokens,
			completion_tokens: u.output_tokens,
			total_tokens: u.total_tokens,
		}),
		..Default::default()
	}
}

fn stop_reason_to_finish(reason: bedrock::StopReason) -> openai::FinishReason {
	match reason {
		bedrock::StopReason::EndTurn | bedrock::StopReason::StopSequence => {
			openai::FinishReason::Stop
		},
		bedrock::StopReason::MaxTokens | bedrock::StopReason::ModelContextWindowExceeded => {
			openai::FinishReason::Length
		},
		bedrock::StopReason::ContentFiltered | bedrock::StopReason::GuardrailIntervened => {
			openai::FinishReason::ContentFilter
		},
		bedrock::StopReason::ToolUse => openai::FinishReason::ToolCalls,
	}
}

fn is_system_role(role: &str) -> bool {
	role == openai::SYSTEM_ROLE || role == openai::DEVELOPER_ROLE
}

#[cfg(test)]
#[path = "bedrock_tests.rs"]
mod tests;
