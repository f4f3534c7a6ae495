use std::collections::HashMap;

use bytes::Bytes;
use serde::Deserialize;

use super::{Error, ParsedRequest, RequestOutcome, ResponseOutcome};
use crate::mutation;
use crate::proto::HeaderMutation;
use crate::sse::SseParser;
use crate::types::TokenUsage;
use crate::types::openai;

/// OpenAI-compatible backend: near-passthrough. The body is rewritten only
/// when the stream-options override or a model override requires it, so the
/// common path forwards the client's exact bytes.
pub struct OpenAiTranslator {
	model_override: Option<String>,
	streaming: bool,
	sse: SseParser,
	usage: UsageAccumulator,
}

impl OpenAiTranslator {
	pub fn new(model_override: Option<String>) -> Self {
		Self {
			model_override,
			streaming: false,
			sse: SseParser::new(),
			usage: UsageAccumulator::default(),
		}
	}

	pub fn request_body(
		&mut self,
		raw: &Bytes,
		parsed: &ParsedRequest,
		force_mutation: bool,
	) -> Result<RequestOutcome, Error> {
		self.streaming = parsed.is_streaming();
		let mut out = RequestOutcome::default();
		match parsed {
			ParsedRequest::Chat(req) => {
				let mut req = req.clone();
				let mut mutated = false;
				// Without usage in the terminal chunk the gateway cannot meter
				// streaming requests, so the option is always forced on.
				if req.is_streaming() && !includes_usage(&req) {
					let mut opts = req.stream_options.take().unwrap_or(openai::StreamOptions {
						include_usage: true,
						rest: Default::default(),
					});
					opts.include_usage = true;
					req.stream_options = Some(opts);
					mutated = true;
				}
				if let Some(model) = &self.model_override {
					req.model = model.clone();
					mutated = true;
				}
				if mutated || force_mutation {
					out.body = Some(serde_json::to_vec(&req).map_err(Error::RequestMarshal)?);
				}
			},
			ParsedRequest::Embeddings(req) => {
				if let Some(model) = &self.model_override {
					let mut req = req.clone();
					req.model = model.clone();
					out.body = Some(serde_json::to_vec(&req).map_err(Error::RequestMarshal)?);
				} else if force_mutation {
					out.body = Some(raw.to_vec());
				}
			},
			ParsedRequest::Messages(_) => {
				return Err(Error::Invalid(
					"messages input is not OpenAI-compatible".to_string(),
				));
			},
		}
		if out.body.is_some() {
			mutation::remove_header(&mut out.header_mutation, "content-length");
		}
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
			self.scan_stream(chunk, end_of_stream);
			return Ok(ResponseOutcome {
				body: None,
				usage: self.usage.take_if_complete(end_of_stream),
				response_model: self.usage.model.take(),
			});
		}
		// Buffered: the processor delivers the whole (decoded) body once.
		if !end_of_stream {
			return Ok(ResponseOutcome::default());
		}
		let probe: UsageProbe = serde_json::from_slice(chunk).map_err(Error::ResponseParsing)?;
		Ok(ResponseOutcome {
			body: None,
			usage: probe.usage.map(Into::into),
			response_model: probe.model,
		})
	}

	pub fn response_error(
		&mut self,
		_headers: &HashMap<String, String>,
		_body: &[u8],
	) -> Result<ResponseOutcome, Error> {
		// Backend already speaks the client's dialect.
		Ok(ResponseOutcome::default())
	}

	fn scan_stream(&mut self, chunk: &[u8], end_of_stream: bool) {
		let mut events = self.sse.feed(chunk);
		if end_of_stream && let Some(ev) = self.sse.finish() {
			events.push(ev);
		}
		for ev in events {
			if ev.is_done() {
				continue;
			}
			if let Ok(probe) = serde_json::from_str::<UsageProbe>(&ev.data) {
				if let Some(u) = probe.usage {
					self.usage.merge(u.into());
				}
				if probe.model.is_some() {
					self.usage.model = probe.model;
				}
			}
		}
	}
}

fn includes_usage(req: &openai::ChatCompletionRequest) -> bool {
	req
		.stream_options
		.as_ref()
		.is_some_and(|o| o.include_usage)
}

/// Minimal view of a response (or chunk): enough to meter tokens and learn
/// the serving model without materializing the full shape.
#[derive(Deserialize)]
struct UsageProbe {
	#[serde(default)]
	usage: Option<ProbeUsage>,
	#[serde(default)]
	model: Option<String>,
}

#[derive(Deserialize, Clone, Copy)]
struct ProbeUsage {
	#[serde(default)]
	prompt_tokens: u64,
	#[serde(default)]
	completion_tokens: u64,
	#[serde(default)]
	total_tokens: u64,
}

impl From<ProbeUsage> for TokenUsage {
	fn from(u: ProbeUsage) -> Self {
		let total = if u.total_tokens != 0 {
			u.total_tokens
		} else {
			u.prompt_tokens + u.completion_tokens
		};
		TokenUsage::new(u.prompt_tokens, u.completion_tokens, total)
	}
}

#[derive(Default)]
pub(crate) struct UsageAccumulator {
	pub usage: Option<TokenUsage>,
	pub model: Option<String>,
	reported: bool,
}

impl UsageAccumulator {
	pub fn merge(&mut self, usage: TokenUsage) {
		self.usage = Some(usage);
	}

	/// Reports usage exactly once, as soon as it is known.
	pub fn take_if_complete(&mut self, _end_of_stream: bool) -> Option<TokenUsage> {
		if self.reported {
			return None;
		}
		let u = self.usage.take()?;
		self.reported = true;
		Some(u)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn chat(raw: &str) -> (Bytes, ParsedRequest) {
		let parsed: openai::ChatCompletionRequest = serde_json::from_str(raw).unwrap();
		(Bytes::copy_from_slice(raw.as_bytes()), ParsedRequest::Chat(parsed))
	}

	#[test]
	fn non_streaming_passthrough_has_no_mutation() {
		let (raw, parsed) = chat(r#"{"model":"x","messages":[{"role":"user","content":"hi"}]}"#);
		let mut t = OpenAiTranslator::new(None);
		let out = t.request_body(&raw, &parsed, false).unwrap();
		assert!(out.body.is_none());
		assert!(out.header_mutation.remove_headers.is_empty());
	}

	#[test]
	fn streaming_forces_include_usage() {
		let (raw, parsed) = chat(r#"{"model":"x","messages":[],"stream":true}"#);
		let mut t = OpenAiTranslator::new(None);
		let out = t.request_body(&raw, &parsed, false).unwrap();
		let body: serde_json::Value = serde_json::from_slice(out.body.as_deref().unwrap()).unwrap();
		assert_eq!(body["stream_options"]["include_usage"], serde_json::json!(true));
		assert_eq!(out.header_mutation.remove_headers, vec!["content-length"]);
	}

	#[test]
	fn streaming_preserves_existing_stream_options() {
		let (raw, parsed) = chat(
			r#"{"model":"x","messages":[],"stream":true,"stream_options":{"include_usage":false,"other":1}}"#,
		);
		let mut t = OpenAiTranslator::new(None);
		let out = t.request_body(&raw, &parsed, false).unwrap();
		let body: serde_json::Value = serde_json::from_slice(out.body.as_deref().unwrap()).unwrap();
		assert_eq!(body["stream_options"]["include_usage"], serde_json::json!(true));
		assert_eq!(body["stream_options"]["other"], serde_json::json!(1));
	}

	#[test]
	fn model_override_rewrites_body() {
		let (raw, parsed) = chat(r#"{"model":"x","messages":[]}"#);
		let mut t = OpenAiTranslator::new(Some("gpt-4o-mini".to_string()));
		let out = t.request_body(&raw, &parsed, false).unwrap();
		let body: serde_json::Value = serde_json::from_slice(out.body.as_deref().unwrap()).unwrap();
		assert_eq!(body["model"], serde_json::json!("gpt-4o-mini"));
	}

	#[test]
	fn retry_forces_reemission() {
		let (raw, parsed) = chat(r#"{"model":"x","messages":[]}"#);
		let mut t = OpenAiTranslator::new(None);
		let out = t.request_body(&raw, &parsed, true).unwrap();
		assert!(out.body.is_some());
	}

	#[test]
	fn buffered_response_usage() {
		let (raw, parsed) = chat(r#"{"model":"x","messages":[]}"#);
		let mut t = OpenAiTranslator::new(None);
		t.request_body(&raw, &parsed, false).unwrap();
		let body = br#"{"choices":[{"message":{"content":"ok"}}],"model":"x-001","usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}"#;
		let out = t.response_body(body, true).unwrap();
		assert!(out.body.is_none());
		assert_eq!(out.usage, Some(TokenUsage::new(3, 2, 5)));
		assert_eq!(out.response_model.as_deref(), Some("x-001"));
	}

	#[test]
	fn streaming_response_usage_from_terminal_chunk() {
		let (raw, parsed) = chat(r#"{"model":"x","messages":[],"stream":true}"#);
		let mut t = OpenAiTranslator::new(None);
		t.request_body(&raw, &parsed, false).unwrap();

		let out = t
			.response_body(b"data: {\"choices\":[{\"delta\":{\"content\":\"h\"}}]}\n\n", false)
			.unwrap();
		assert!(out.usage.is_none());
		assert!(out.body.is_none());

		// usage split across two frames
		let out = t
			.response_body(b"data: {\"usage\":{\"prompt_tokens\":3,\"comple", false)
			.unwrap();
		assert!(out.usage.is_none());
		let out = t
			.response_body(b"tion_tokens\":2,\"total_tokens\":5}}\n\ndata: [DONE]\n\n", true)
			.unwrap();
		assert_eq!(out.usage, Some(TokenUsage::new(3, 2, 5)));
	}
}
