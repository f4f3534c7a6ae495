use std::collections::HashMap;

use rand::Rng;
use serde_json::Value;

use super::{Error, GcpTarget, ParsedRequest, RequestOutcome, ResponseOutcome, escape_path_segment};
use crate::mutation;
use crate::proto::HeaderMutation;
use crate::sse::SseParser;
use crate::types::TokenUsage;
use crate::types::{anthropic, openai};

fn vertex_anthropic_path(target: &GcpTarget, model: &str, streaming: bool) -> String {
	let verb = if streaming {
		"streamRawPredict"
	} else {
		"rawPredict"
	};
	format!(
		"/v1/projects/{}/locations/{}/publishers/anthropic/models/{}:{verb}",
		target.project,
		target.region,
		escape_path_segment(model),
	)
}

/// Serializes a messages request for Vertex: the model field moves into the
/// path and `anthropic_version` is pinned in the body.
fn vertex_anthropic_body(req: &anthropic::MessagesRequest) -> Result<Vec<u8>, Error> {
	let mut map: serde_json::Map<String, Value> = serde_json::to_value(req)
		.map_err(Error::RequestMarshal)?
		.as_object()
		.cloned()
		.ok_or_else(|| Error::Invalid("messages request is not an object".to_string()))?;
	map.remove("model");
	map.insert(
		"anthropic_version".to_string(),
		Value::String(anthropic::VERTEX_ANTHROPIC_VERSION.to_string()),
	);
	serde_json::to_vec(&map).map_err(Error::RequestMarshal)
}

/// OpenAI chat completions served by Anthropic models on Vertex.
pub struct GcpAnthropicTranslator {
	target: GcpTarget,
	model_override: Option<String>,
	model: String,
	streaming: bool,
	message_id: String,
	created: i64,
	sse: SseParser,
	state: StreamState,
	usage_reported: bool,
}

/// Streaming accumulator: Anthropic reports input tokens in message_start
/// and output tokens in message_delta.
#[derive(Default)]
struct StreamState {
	input_tokens: u64,
	response_model: Option<String>,
	tool_index: Option<u32>,
	tool_count: u32,
}

impl GcpAnthropicTranslator {
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
			state: StreamState::default(),
			usage_reported: false,
		}
	}

	pub fn request_body(&mut self, parsed: &ParsedRequest) -> Result<RequestOutcome, Error> {
		let ParsedRequest::Chat(req) = parsed else {
			return Err(Error::Invalid(
				"anthropic-on-vertex requires chat completion input".to_string(),
			));
		};
		self.streaming = req.is_streaming();
		self.model = self
			.model_override
			.clone()
			.unwrap_or_else(|| req.model.clone());

		let messages_req = chat_to_messages(req);
		let body = vertex_anthropic_body(&messages_req)?;
		let path = vertex_anthropic_path(&self.target, &self.model, self.streaming);

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
		let resp: anthropic::MessagesResponse =
			serde_json::from_slice(chunk).map_err(Error::ResponseParsing)?;
		let usage = TokenUsage::new(
			resp.usage.input_tokens,
			resp.usage.output_tokens,
			resp.usage.input_tokens + resp.usage.output_tokens,
		);
		let response_model = Some(resp.model.clone());
		let openai_resp = self.messages_to_chat_completion(resp);
		let body = serde_json::to_vec(&openai_resp).map_err(Error::ResponseMarshal)?;
		Ok(ResponseOutcome {
			body: Some(body),
			usage: Some(usage),
			response_model,
		})
	}

	pub fn response_error(
		&mut self,
		_headers: &HashMap<String, String>,
		body: &[u8],
	) -> Result<ResponseOutcome, Error> {
		let err = match serde_json::from_slice::<anthropic::ErrorResponse>(body) {
			Ok(e) => openai::ErrorResponse::new(e.error.kind, e.error.message),
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
		for ev in events {
			if ev.data.is_empty() {
				continue;
			}
			let event: anthropic::StreamEvent = match serde_json::from_str(&ev.data) {
				Ok(e) => e,
				Err(e) => {
					// Best effort on malformed or truncated upstream events.
					tracing::warn!("dropping undecodable anthropic stream event: {e}");
					continue;
				},
			};
			for cc in self.event_to_chunks(event, &mut usage) {
				let json = serde_json::to_vec(&cc).map_err(Error::ResponseMarshal)?;
				out_buf.extend_from_slice(&crate::sse::data_frame(&json));
			}
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
			response_model: self.state.response_model.clone(),
		})
	}

	fn event_to_chunks(
		&mut self,
		event: anthropic::StreamEvent,
		usage: &mut Option<TokenUsage>,
	) -> Vec<openai::ChatCompletionChunk> {
		use anthropic::StreamEvent;
		match event {
			StreamEvent::MessageStart { message } => {
				if let Some(u) = message.usage {
					self.state.input_tokens = u.input_tokens;
				}
				self.state.response_model = Some(message.model);
				let delta = openai::ChunkDelta {
					role: Some(openai::ASSISTANT_ROLE.to_string()),
					..Default::default()
				};
				vec![self.make_chunk(vec![chunk_choice(delta, None)], None)]
			},
			StreamEvent::ContentBlockStart {
				content_block: anthropic::ContentBlock::ToolUse { id, name, .. },
				..
			} => {
				let index = self.state.tool_count;
				self.state.tool_count += 1;
				self.state.tool_index = Some(index);
				let delta = openai::ChunkDelta {
					tool_calls: Some(vec![openai::ToolCallChunk {
						index,
						id: Some(id),
						kind: Some("function".to_string()),
						function: Some(openai::FunctionCallChunk {
							name: Some(name),
							arguments: None,
						}),
					}]),
					..Default::default()
				};
				vec![self.make_chunk(vec![chunk_choice(delta, None)], None)]
			},
			StreamEvent::ContentBlockStart { .. } => Vec::new(),
			StreamEvent::ContentBlockDelta { delta, .. } => {
				let delta = match delta {
					anthropic::ContentDelta::TextDelta { text } => openai::ChunkDelta {
						content: Some(text),
						..Default::default()
					},
					anthropic::ContentDelta::InputJsonDelta { partial_json } => {
						let Some(index) = self.state.tool_index else {
							return Vec::new();
						};
						openai::ChunkDelta {
							tool_calls: Some(vec![openai::ToolCallChunk {
								index,
								id: None,
								kind: None,
								function: Some(openai::FunctionCallChunk {
									name: None,
									arguments: Some(partial_json),
								}),
							}]),
							..Default::default()
						}
					},
					_ => return Vec::new(),
				};
				vec![self.make_chunk(vec![chunk_choice(delta, None)], None)]
			},
			StreamEvent::ContentBlockStop { .. } => {
				self.state.tool_index = None;
				Vec::new()
			},
			StreamEvent::MessageDelta {
				delta,
				usage: delta_usage,
			} => {
				let mut chunks = Vec::new();
				if let Some(reason) = delta.stop_reason {
					chunks.push(self.make_chunk(
						vec![chunk_choice(
							openai::ChunkDelta::default(),
							Some(stop_reason_to_finish(reason)),
						)],
						None,
					));
				}
				if let Some(u) = delta_usage {
					let input = if u.input_tokens != 0 {
						u.input_tokens
					} else {
						self.state.input_tokens
					};
					let total = input + u.output_tokens;
					*usage = Some(TokenUsage::new(input, u.output_tokens, total));
					chunks.push(self.make_chunk(
						Vec::new(),
						Some(openai::Usage {
							prompt_tokens: input,
							completion_tokens: u.output_tokens,
							total_tokens: total,
						}),
					));
				}
				chunks
			},
			StreamEvent::MessageStop | StreamEvent::Ping | StreamEvent::Unknown => Vec::new(),
			StreamEvent::Error { error } => {
				tracing::warn!(kind = %error.kind, "anthropic stream error event: {}", error.message);
				Vec::new()
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
			model: self
				.state
				.response_model
				.clone()
				.unwrap_or_else(|| self.model.clone()),
			choices,
			usage,
		}
	}

	fn messages_to_chat_completion(
		&self,
		resp: anthropic::MessagesResponse,
	) -> openai::ChatCompletionResponse {
		let mut text_parts = Vec::new();
		let mut tool_calls = Vec::new();
		for block in resp.content {
			match block {
				anthropic::ContentBlock::Text { text } => text_parts.push(text),
				anthropic::ContentBlock::ToolUse { id, name, input } => {
					tool_calls.push(openai::ToolCall {
						id,
						kind: "function".to_string(),
						function: openai::FunctionCall {
							name,
							arguments: input.to_string(),
						},
					})
				},
				_ => {},
			}
		}
		openai::ChatCompletionResponse {
			id: Some(resp.id),
			object: "chat.completion".to_string(),
			created: Some(self.created),
			model: Some(resp.model),
			choices: vec![openai::ChatChoice {
				index: 0,
				message: openai::ResponseMessage {
					role: openai::ASSISTANT_ROLE.to_string(),
					content: if text_parts.is_empty() {
						None
					} else {
						Some(text_parts.join(""))
					},
					tool_calls: if tool_calls.is_empty() {
						None
					} else {
						Some(tool_calls)
					},
				},
				finish_reason: resp.stop_reason.map(stop_reason_to_finish),
			}],
			usage: Some(openai::Usage {
				prompt_tokens: resp.usage.input_tokens,
				completion_tokens: resp.usage.output_tokens,
				total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
			}),
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

fn stop_reason_to_finish(reason: anthropic::StopReason) -> openai::FinishReason {
	match reason {
		anthropic::StopReason::EndTurn | anthropic::StopReason::StopSequence => {
			openai::FinishReason::Stop
		},
		anthropic::StopReason::MaxTokens => openai::FinishReason::Length,
		anthropic::StopReason::ToolUse => openai::FinishReason::ToolCalls,
		anthropic::StopReason::Refusal => openai::FinishReason::ContentFilter,
	}
}

fn chat_to_messages(req: &openai::ChatCompletionRequest) -> anthropic::MessagesRequest {
	let system_text = req
		.messages
		.iter()
		.filter(|m| m.role == openai::SYSTEM_ROLE || m.role == openai::DEVELOPER_ROLE)
		.filter_map(|m| m.text())
		.collect::<Vec<_>>()
		.join("\n");

	let mut messages = Vec::new();
	for msg in &req.messages {
		match msg.role.as_str() {
			openai::SYSTEM_ROLE | openai::DEVELOPER_ROLE => {},
			openai::ASSISTANT_ROLE => {
				let mut blocks = Vec::new();
				if let Some(text) = msg.text().filter(|t| !t.is_empty()) {
					blocks.push(anthropic::ContentBlock::Text { text });
				}
				for call in msg.tool_calls.iter().flatten() {
					blocks.push(anthropic::ContentBlock::ToolUse {
						id: call.id.clone(),
						name: call.function.name.clone(),
						input: serde_json::from_str(&call.function.arguments)
							.unwrap_or(Value::Null),
					});
				}
				if blocks.is_empty() {
					continue;
				}
				messages.push(anthropic::RequestMessage {
					role: anthropic::Role::Assistant,
					content: anthropic::MessageContent::Blocks(blocks),
				});
			},
			openai::TOOL_ROLE => {
				messages.push(anthropic::RequestMessage {
					role: anthropic::Role::User,
					content: anthropic::MessageContent::Blocks(vec![
						anthropic::ContentBlock::ToolResult {
							tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
							content: msg.text().map(Value::String),
							is_error: None,
						},
					]),
				});
			},
			_ => {
				let Some(text) = msg.text() else { continue };
				messages.push(anthropic::RequestMessage {
					role: anthropic::Role::User,
					content: anthropic::MessageContent::Text(text),
				});
			},
		}
	}

	anthropic::MessagesRequest {
		model: None,
		messages,
		max_tokens: req.max_output_tokens(),
		system: if system_text.is_empty() {
			None
		} else {
			Some(anthropic::SystemPrompt::Text(system_text))
		},
		stream: req.stream,
		temperature: req.temperature,
		top_p: req.top_p,
		top_k: None,
		stop_sequences: {
			let stops = req.stop_sequences();
			if stops.is_empty() { None } else { Some(stops) }
		},
		tools: req.tools.as_ref().map(|tools| {
			tools
				.iter()
				.map(|t| anthropic::ToolDef {
					name: t.function.name.clone(),
					description: t.function.description.clone(),
					input_schema: t.function.parameters.clone(),
				})
				.collect()
		}),
		tool_choice: None,
		rest: Default::default(),
	}
}

/// Native Anthropic messages clients against Anthropic-on-Vertex: the body is
/// already in the right dialect, so only the path/version envelope changes
/// and responses pass through while usage is skimmed.
pub struct MessagesPassthroughTranslator {
	target: GcpTarget,
	model_override: Option<String>,
	streaming: bool,
	sse: SseParser,
	input_tokens: u64,
	response_model: Option<String>,
	usage_reported: bool,
}

impl MessagesPassthroughTranslator {
	pub fn new(target: GcpTarget, model_override: Option<String>) -> Self {
		Self {
			target,
			model_override,
			streaming: false,
			sse: SseParser::new(),
			input_tokens: 0,
			response_model: None,
			usage_reported: false,
		}
	}

	pub fn request_body(&mut self, parsed: &ParsedRequest) -> Result<RequestOutcome, Error> {
		let ParsedRequest::Messages(req) = parsed else {
			return Err(Error::Invalid(
				"messages passthrough requires messages input".to_string(),
			));
		};
		self.streaming = req.is_streaming();
		let model = self
			.model_override
			.clone()
			.or_else(|| req.model.clone())
			.ok_or_else(|| Error::Invalid("model not specified".to_string()))?;

		let body = vertex_anthropic_body(req)?;
		let path = vertex_anthropic_path(&self.target, &model, self.streaming);

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
			let mut events = self.sse.feed(chunk);
			if end_of_stream && let Some(ev) = self.sse.finish() {
				events.push(ev);
			}
			let mut usage = None;
			for ev in events {
				let Ok(event) = serde_json::from_str::<anthropic::StreamEvent>(&ev.data) else {
					continue;
				};
				match event {
					anthropic::StreamEvent::MessageStart { message } => {
						if let Some(u) = message.usage {
							self.input_tokens = u.input_tokens;
						}
						self.response_model = Some(message.model);
					},
					anthropic::StreamEvent::MessageDelta { usage: Some(u), .. } => {
						let input = if u.input_tokens != 0 {
							u.input_tokens
						} else {
							self.input_tokens
						};
						usage = Some(TokenUsage::new(input, u.output_tokens, input + u.output_tokens));
					},
					_ => {},
				}
			}
			let usage = usage.filter(|_| !self.usage_reported);
			if usage.is_some() {
				self.usage_reported = true;
			}
			return Ok(ResponseOutcome {
				body: None,
				usage,
				response_model: self.response_model.clone(),
			});
		}
		if !end_of_stream {
			return Ok(ResponseOutcome::default());
		}
		let resp: anthropic::MessagesResponse =
			serde_json::from_slice(chunk).map_err(Error::ResponseParsing)?;
		Ok(ResponseOutcome {
			body: None,
			usage: Some(TokenUsage::new(
				resp.usage.input_tokens,
				resp.usage.output_tokens,
				resp.usage.input_tokens + resp.usage.output_tokens,
			)),
			response_model: Some(resp.model),
		})
	}

	pub fn response_error(
		&mut self,
		_headers: &HashMap<String, String>,
		_body: &[u8],
	) -> Result<ResponseOutcome, Error> {
		// Clients speak the messages dialect natively; errors pass through.
		Ok(ResponseOutcome::default())
	}
}

#[cfg(test)]
#[path = "gcp_anthropic_tests.rs"]
mod tests;
