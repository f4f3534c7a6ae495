use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use opentelemetry::KeyValue;
use opentelemetry::global::BoxedTracer;
use opentelemetry::trace::{Span, SpanKind, Tracer};
use rand::Rng;

use crate::mutation;
use crate::proto::HeaderMutation;
use crate::types::TokenUsage;

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";

// OpenInference attribute names.
// https://github.com/Arize-ai/openinference/blob/main/spec/semantic_conventions.md
mod semconv {
	pub const SPAN_KIND: &str = "openinference.span.kind";
	pub const SPAN_KIND_LLM: &str = "LLM";
	pub const MODEL_NAME: &str = "llm.model_name";
	pub const INVOCATION_PARAMETERS: &str = "llm.invocation_parameters";
	pub const INPUT_VALUE: &str = "input.value";
	pub const INPUT_MIME_TYPE: &str = "input.mime_type";
	pub const OUTPUT_VALUE: &str = "output.value";
	pub const TOKEN_COUNT_PROMPT: &str = "llm.token_count.prompt";
	pub const TOKEN_COUNT_COMPLETION: &str = "llm.token_count.completion";
	pub const MIME_JSON: &str = "application/json";
	pub const REDACTED: &str = "__REDACTED__";
}

/// What of the request/response payloads may be recorded on spans.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceConfig {
	pub hide_inputs: bool,
	pub hide_outputs: bool,
}

/// A traceparent, per https://www.w3.org/TR/trace-context/
#[derive(Clone, Eq, PartialEq)]
pub struct TraceParent {
	pub version: u8,
	pub trace_id: u128,
	pub span_id: u64,
	pub flags: u8,
}

impl TraceParent {
	pub fn new() -> Self {
		let mut rng = rand::rng();
		Self {
			version: 0,
			trace_id: rng.random(),
			span_id: rng.random(),
			flags: 0,
		}
	}

	pub fn new_span(&self) -> Self {
		let mut cpy = self.clone();
		cpy.span_id = rand::rng().random();
		cpy
	}

	pub fn is_sampled(&self) -> bool {
		(self.flags & 0x01) == 0x01
	}
}

impl Default for TraceParent {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for TraceParent {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(
			f,
			"{:02x}-{:032x}-{:016x}-{:02x}",
			self.version, self.trace_id, self.span_id, self.flags
		)
	}
}

impl TryFrom<&str> for TraceParent {
	type Error = anyhow::Error;

	fn try_from(value: &str) -> Result<Self, Self::Error> {
		if value.len() != 55 {
			anyhow::bail!("traceparent malformed, length was {}", value.len())
		}
		let segs: Vec<&str> = value.split('-').collect();
		if segs.len() != 4 {
			anyhow::bail!("traceparent malformed, {} segments", segs.len())
		}
		Ok(Self {
			version: u8::from_str_radix(segs[0], 16)?,
			trace_id: u128::from_str_radix(segs[1], 16)?,
			span_id: u64::from_str_radix(segs[2], 16)?,
			flags: u8::from_str_radix(segs[3], 16)?,
		})
	}
}

/// Span state for one model invocation. Attributes accumulate over the
/// transaction and the span is materialized once, at stream end — a no-op
/// when the globally installed tracer provider is a no-op. Context
/// propagation headers are injected either way.
pub struct RequestSpan {
	incoming: Option<TraceParent>,
	outgoing: TraceParent,
	tracestate: Option<String>,
	start: SystemTime,
	attributes: Vec<KeyValue>,
	hide_outputs: bool,
	finished: bool,
}

impl RequestSpan {
	pub fn start(
		config: &TraceConfig,
		request_headers: &HashMap<String, String>,
		model: &str,
		invocation_parameters: Option<String>,
		raw_body: &[u8],
	) -> Self {
		let incoming = request_headers
			.get(TRACEPARENT_HEADER)
			.and_then(|v| TraceParent::try_from(v.as_str()).ok());
		let outgoing = incoming
			.as_ref()
			.map(TraceParent::new_span)
			.unwrap_or_default();

		let mut attributes = vec![
			KeyValue::new(semconv::SPAN_KIND, semconv::SPAN_KIND_LLM),
			KeyValue::new(semconv::MODEL_NAME, model.to_string()),
		];
		if config.hide_inputs {
			attributes.push(KeyValue::new(semconv::INPUT_VALUE, semconv::REDACTED));
		} else {
			attributes.push(KeyValue::new(
				semconv::INPUT_VALUE,
				String::from_utf8_lossy(raw_body).to_string(),
			));
			attributes.push(KeyValue::new(semconv::INPUT_MIME_TYPE, semconv::MIME_JSON));
		}
		if let Some(params) = invocation_parameters {
			attributes.push(KeyValue::new(semconv::INVOCATION_PARAMETERS, params));
		}

		Self {
			incoming,
			outgoing,
			tracestate: request_headers.get(TRACESTATE_HEADER).cloned(),
			start: SystemTime::now(),
			attributes,
			hide_outputs: config.hide_outputs,
			finished: false,
		}
	}

	/// Writes the W3C context into the upstream request headers.
	pub fn inject(&self, hm: &mut HeaderMutation) {
		mutation::set_header(hm, TRACEPARENT_HEADER, self.outgoing.to_string().into_bytes());
		if let Some(state) = &self.tracestate {
			mutation::set_header(hm, TRACESTATE_HEADER, state.clone().into_bytes());
		}
	}

	pub fn record_output(&mut self, body: &[u8]) {
		if self.hide_outputs {
			return;
		}
		self.attributes.push(KeyValue::new(
			semconv::OUTPUT_VALUE,
			String::from_utf8_lossy(body).to_string(),
		));
	}

	pub fn record_usage(&mut self, usage: TokenUsage) {
		self.attributes.push(KeyValue::new(
			semconv::TOKEN_COUNT_PROMPT,
			usage.input_tokens as i64,
		));
		self.attributes.push(KeyValue::new(
			semconv::TOKEN_COUNT_COMPLETION,
			usage.output_tokens as i64,
		));
	}

	/// Materializes and closes the span.
	pub fn finish(&mut self, tracer: &BoxedTracer, name: &str, success: bool) {
		if self.finished {
			return;
		}
		self.finished = true;
		let mut builder = tracer
			.span_builder(name.to_string())
			.with_kind(SpanKind::Client)
			.with_start_time(self.start)
			.with_trace_id(self.outgoing.trace_id.into())
			.with_span_id(self.outgoing.span_id.into())
			.with_attributes(std::mem::take(&mut self.attributes));
		if !success {
			builder = builder.with_status(opentelemetry::trace::Status::error("upstream failure"));
		}
		let mut span = builder.start(tracer);
		span.end();
	}

	pub fn incoming(&self) -> Option<&TraceParent> {
		self.incoming.as_ref()
	}

	pub fn outgoing(&self) -> &TraceParent {
		&self.outgoing
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn traceparent_roundtrip() {
		let tp = TraceParent::try_from("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01")
			.unwrap();
		assert_eq!(tp.version, 0);
		assert!(tp.is_sampled());
		assert_eq!(
			tp.to_string(),
			"00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"
		);
	}

	#[test]
	fn malformed_traceparent_rejected() {
		assert!(TraceParent::try_from("junk").is_err());
		assert!(
			TraceParent::try_from("00-0af7651916cd43dd8448eb211c80319cb7ad6b7169203331-01-xx")
				.is_err()
		);
	}

	#[test]
	fn child_span_keeps_trace_id() {
		let parent = TraceParent::new();
		let child = parent.new_span();
		assert_eq!(parent.trace_id, child.trace_id);
		assert_ne!(parent.span_id, child.span_id);
	}

	#[test]
	fn propagation_continues_incoming_trace() {
		let headers = HashMap::from([(
			TRACEPARENT_HEADER.to_string(),
			"00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_string(),
		)]);
		let span = RequestSpan::start(&TraceConfig::default(), &headers, "m", None, b"{}");
		assert_eq!(
			span.outgoing().trace_id,
			0x0af7651916cd43dd8448eb211c80319c_u128
		);
		assert_ne!(span.outgoing().span_id, 0xb7ad6b7169203331_u64);
		assert_eq!(span.incoming().unwrap().span_id, 0xb7ad6b7169203331_u64);

		let mut hm = HeaderMutation::default();
		span.inject(&mut hm);
		let injected = mutation::get_set_header(&hm, TRACEPARENT_HEADER).unwrap();
		let injected = std::str::from_utf8(injected).unwrap();
		assert!(injected.starts_with("00-0af7651916cd43dd8448eb211c80319c-"));
		assert!(injected.ends_with("-01"));
	}

	#[test]
	fn tracestate_passes_through() {
		let headers = HashMap::from([
			(
				TRACEPARENT_HEADER.to_string(),
				"00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_string(),
			),
			(TRACESTATE_HEADER.to_string(), "vendor=x".to_string()),
		]);
		let span = RequestSpan::start(&TraceConfig::default(), &headers, "m", None, b"{}");
		let mut hm = HeaderMutation::default();
		span.inject(&mut hm);
		assert_eq!(
			mutation::get_set_header(&hm, TRACESTATE_HEADER),
			Some(b"vendor=x".as_slice())
		);
	}

	#[test]
	fn redaction_hides_input() {
		let span = RequestSpan::start(
			&TraceConfig {
				hide_inputs: true,
				hide_outputs: true,
			},
			&HashMap::new(),
			"m",
			None,
			b"{\"secret\":true}",
		);
		let input = span
			.attributes
			.iter()
			.find(|kv| kv.key.as_str() == semconv::INPUT_VALUE)
			.unwrap();
		assert_eq!(input.value.to_string(), semconv::REDACTED);
	}

	#[test]
	fn finish_is_idempotent_with_noop_tracer() {
		let tracer = opentelemetry::global::tracer("test");
		let mut span = RequestSpan::start(&TraceConfig::default(), &HashMap::new(), "m", None, b"{}");
		span.record_usage(TokenUsage::new(1, 2, 3));
		span.finish(&tracer, "chat m", true);
		span.finish(&tracer, "chat m", false);
	}
}
