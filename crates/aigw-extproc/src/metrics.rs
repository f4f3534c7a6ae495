use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use opentelemetry::metrics::{Histogram, Meter};
use opentelemetry::KeyValue;

// GenAI semantic-convention names.
// https://opentelemetry.io/docs/specs/semconv/gen-ai/gen-ai-metrics/
const OPERATION_DURATION: &str = "gen_ai.client.operation.duration";
const TOKEN_USAGE: &str = "gen_ai.client.token.usage";
const TIME_TO_FIRST_TOKEN: &str = "gen_ai.server.time_to_first_token";
const TIME_PER_OUTPUT_TOKEN: &str = "gen_ai.server.time_per_output_token";

const ATTR_OPERATION: &str = "gen_ai.operation.name";
const ATTR_PROVIDER: &str = "gen_ai.provider.name";
const ATTR_REQUEST_MODEL: &str = "gen_ai.request.model";
const ATTR_RESPONSE_MODEL: &str = "gen_ai.response.model";
const ATTR_TOKEN_TYPE: &str = "gen_ai.token.type";
const ATTR_ERROR_TYPE: &str = "error.type";

/// No typed error taxonomy yet, so failures carry the semconv fallback.
const ERROR_TYPE_FALLBACK: &str = "_OTHER";

pub const OPERATION_CHAT: &str = "chat";
pub const OPERATION_EMBEDDING: &str = "embedding";

/// Process-wide GenAI instruments, created once per meter.
pub struct GenAiMetrics {
	request_latency: Histogram<f64>,
	token_usage: Histogram<f64>,
	first_token_latency: Histogram<f64>,
	output_token_latency: Histogram<f64>,
}

impl GenAiMetrics {
	pub fn new(meter: &Meter) -> Arc<Self> {
		Arc::new(Self {
			request_latency: meter
				.f64_histogram(OPERATION_DURATION)
				.with_unit("s")
				.with_description("Time spent processing a GenAI request")
				.build(),
			token_usage: meter
				.f64_histogram(TOKEN_USAGE)
				.with_unit("{token}")
				.with_description("Number of tokens used per request, by type")
				.build(),
			first_token_latency: meter
				.f64_histogram(TIME_TO_FIRST_TOKEN)
				.with_unit("s")
				.with_description("Time to receive the first response token")
				.build(),
			output_token_latency: meter
				.f64_histogram(TIME_PER_OUTPUT_TOKEN)
				.with_unit("s")
				.with_description("Mean inter-token latency of the response")
				.build(),
		})
	}
}

/// Per-transaction recorder. Models and backend are filled in as the request
/// progresses; unresolved values report as "unknown" per the conventions.
pub struct RequestMetrics {
	metrics: Arc<GenAiMetrics>,
	operation: &'static str,
	start: Instant,
	first_token: Option<Instant>,
	request_model: String,
	response_model: String,
	provider: String,
	extra_labels: Vec<KeyValue>,
	completed: bool,
}

impl RequestMetrics {
	pub fn new(
		metrics: Arc<GenAiMetrics>,
		operation: &'static str,
		header_labels: &[(String, String)],
		request_headers: &HashMap<String, String>,
	) -> Self {
		let extra_labels = header_labels
			.iter()
			.filter_map(|(header, label)| {
				request_headers
					.get(header)
					.map(|v| KeyValue::new(label.clone(), v.clone()))
			})
			.collect();
		Self {
			metrics,
			operation,
			start: Instant::now(),
			first_token: None,
			request_model: "unknown".to_string(),
			response_model: "unknown".to_string(),
			provider: "unknown".to_string(),
			extra_labels,
			completed: false,
		}
	}

	pub fn set_request_model(&mut self, model: &str) {
		self.request_model = model.to_string();
	}

	pub fn set_response_model(&mut self, model: &str) {
		self.response_model = model.to_string();
	}

	pub fn set_provider(&mut self, provider: &str) {
		self.provider = provider.to_string();
	}

	/// Marks the arrival of response output; the first call drives TTFT.
	pub fn on_output(&mut self) {
		if self.first_token.is_none() {
			self.first_token = Some(Instant::now());
		}
	}

	pub fn record_token_usage(&self, input_tokens: u64, output_tokens: u64) {
		let attrs = self.attributes(true);
		let mut input_attrs = attrs.clone();
		input_attrs.push(KeyValue::new(ATTR_TOKEN_TYPE, "input"));
		self
			.metrics
			.token_usage
			.record(input_tokens as f64, &input_attrs);
		let mut output_attrs = attrs;
		output_attrs.push(KeyValue::new(ATTR_TOKEN_TYPE, "output"));
		self
			.metrics
			.token_usage
			.record(output_tokens as f64, &output_attrs);
	}

	/// Terminal record: overall latency plus the streaming latencies when a
	/// first token was observed. Idempotent so error paths can call it
	/// defensively without double counting.
	pub fn record_completion(&mut self, success: bool, output_tokens: u64) {
		if self.completed {
			return;
		}
		self.completed = true;
		let attrs = self.attributes(success);
		self
			.metrics
			.request_latency
			.record(self.start.elapsed().as_secs_f64(), &attrs);
		if let Some(first) = self.first_token {
			self
				.metrics
				.first_token_latency
				.record((first - self.start).as_secs_f64(), &attrs);
			if output_tokens > 0 {
				self
					.metrics
					.output_token_latency
					.record(first.elapsed().as_secs_f64() / output_tokens as f64, &attrs);
			}
		}
	}

	fn attributes(&self, success: bool) -> Vec<KeyValue> {
		let mut attrs = vec![
			KeyValue::new(ATTR_OPERATION, self.operation),
			KeyValue::new(ATTR_PROVIDER, self.provider.clone()),
			KeyValue::new(ATTR_REQUEST_MODEL, self.request_model.clone()),
			KeyValue::new(ATTR_RESPONSE_MODEL, self.response_model.clone()),
		];
		attrs.extend(self.extra_labels.iter().cloned());
		if !success {
			attrs.push(KeyValue::new(ATTR_ERROR_TYPE, ERROR_TYPE_FALLBACK));
		}
		attrs
	}
}

/// Parses the `metricsRequestHeaderLabels` flag value
/// (`<header>:<label>[,<header>:<label>...]`).
pub fn parse_header_labels(raw: &str) -> Result<Vec<(String, String)>, String> {
	let mut out = Vec::new();
	for pair in raw.split(',').filter(|p| !p.is_empty()) {
		let Some((header, label)) = pair.split_once(':') else {
			return Err(format!("invalid header:label pair {pair:?}"));
		};
		if header.is_empty() || label.is_empty() {
			return Err(format!("invalid header:label pair {pair:?}"));
		}
		out.push((header.to_ascii_lowercase(), label.to_string()));
	}
	Ok(out)
}
