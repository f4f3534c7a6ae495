use bytes::Bytes;
use std::collections::HashMap;

use crate::config::{Backend, SchemaName};
use crate::proto::{BodyMutation, HeaderMutation};
use crate::server::RouteKind;
use crate::types::TokenUsage;
use crate::types::{anthropic, openai};

pub mod azure;
pub mod bedrock;
pub mod gcp_anthropic;
pub mod gcp_vertex;
pub mod openai_passthrough;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("unsupported schema pair: {0:?} -> {1:?}")]
	UnsupportedPair(RouteKind, SchemaName),
	#[error("request marshal: {0}")]
	RequestMarshal(serde_json::Error),
	#[error("response parse: {0}")]
	ResponseParsing(serde_json::Error),
	#[error("response marshal: {0}")]
	ResponseMarshal(serde_json::Error),
	#[error("event stream: {0}")]
	EventStream(#[from] crate::eventstream::Error),
	#[error("{0}")]
	Invalid(String),
}

/// The request body parsed in the route's declared input schema, retained by
/// the router filter for the upstream phase (and re-used verbatim on retry).
#[derive(Debug, Clone)]
pub enum ParsedRequest {
	Chat(openai::ChatCompletionRequest),
	Embeddings(openai::EmbeddingsRequest),
	Messages(anthropic::MessagesRequest),
}

impl ParsedRequest {
	pub fn model(&self) -> &str {
		match self {
			ParsedRequest::Chat(r) => &r.model,
			ParsedRequest::Embeddings(r) => &r.model,
			ParsedRequest::Messages(r) => r.model.as_deref().unwrap_or_default(),
		}
	}

	pub fn is_streaming(&self) -> bool {
		match self {
			ParsedRequest::Chat(r) => r.is_streaming(),
			ParsedRequest::Embeddings(_) => false,
			ParsedRequest::Messages(r) => r.is_streaming(),
		}
	}
}

/// Result of the request-body step: header changes plus an optional
/// replacement body. `body` stays `None` when the backend accepts the
/// original bytes unchanged.
#[derive(Debug, Default)]
pub struct RequestOutcome {
	pub header_mutation: HeaderMutation,
	pub body: Option<Vec<u8>>,
}

impl RequestOutcome {
	pub fn body_mutation(&self) -> Option<BodyMutation> {
		self
			.body
			.as_ref()
			.map(|b| crate::mutation::replace_body(b.clone()))
	}
}

/// Result of one response-body (or response-error) step.
#[derive(Debug, Default)]
pub struct ResponseOutcome {
	/// Replacement bytes for this chunk; `None` passes the original through.
	pub body: Option<Vec<u8>>,
	/// Token usage, reported once when the backend surfaces it.
	pub usage: Option<TokenUsage>,
	/// The model that actually served the response, when the backend says.
	pub response_model: Option<String>,
}

/// Per-transaction translator instance. Selection is by
/// (route schema, backend schema); each variant holds only its own
/// accumulator state and is dropped with the transaction.
pub enum Translator {
	OpenAi(openai_passthrough::OpenAiTranslator),
	Azure(azure::AzureTranslator),
	Bedrock(bedrock::BedrockTranslator),
	Gemini(gcp_vertex::GeminiTranslator),
	GcpAnthropic(gcp_anthropic::GcpAnthropicTranslator),
	MessagesPassthrough(gcp_anthropic::MessagesPassthroughTranslator),
}

impl Translator {
	/// Picks the translator for the route/backend pair, or fails the request
	/// when the pair has no translation.
	pub fn select(route: RouteKind, backend: &Backend) -> Result<Translator, Error> {
		let model_override = backend.model_name_override.clone();
		Ok(match (route, backend.schema.name) {
			(RouteKind::ChatCompletions, SchemaName::OpenAi)
			| (RouteKind::Embeddings, SchemaName::OpenAi) => {
				Translator::OpenAi(openai_passthrough::OpenAiTranslator::new(model_override))
			},
			(RouteKind::ChatCompletions, SchemaName::AzureOpenAi)
			| (RouteKind::Embeddings, SchemaName::AzureOpenAi) => Translator::Azure(
				azure::AzureTranslator::new(route, backend.schema.version.clone(), model_override),
			),
			(RouteKind::ChatCompletions, SchemaName::AwsBedrock) => {
				Translator::Bedrock(bedrock::BedrockTranslator::new(model_override))
			},
			(RouteKind::ChatCompletions, SchemaName::GcpVertexAi) => Translator::Gemini(
				gcp_vertex::GeminiTranslator::new(gcp_location(backend), model_override),
			),
			(RouteKind::ChatCompletions, SchemaName::GcpAnthropic) => Translator::GcpAnthropic(
				gcp_anthropic::GcpAnthropicTranslator::new(gcp_location(backend), model_override),
			),
			(RouteKind::Messages, SchemaName::GcpAnthropic) => {
				Translator::MessagesPassthrough(gcp_anthropic::MessagesPassthroughTranslator::new(
					gcp_location(backend),
					model_override,
				))
			},
			(route, schema) => return Err(Error::UnsupportedPair(route, schema)),
		})
	}

	pub fn request_body(
		&mut self,
		raw: &Bytes,
		parsed: &ParsedRequest,
		force_mutation: bool,
	) -> Result<RequestOutcome, Error> {
		match self {
			Translator::OpenAi(t) => t.request_body(raw, parsed, force_mutation),
			Translator::Azure(t) => t.request_body(raw, parsed, force_mutation),
			Translator::Bedrock(t) => t.request_body(parsed),
			Translator::Gemini(t) => t.request_body(parsed),
			Translator::GcpAnthropic(t) => t.request_body(parsed),
			Translator::MessagesPassthrough(t) => t.request_body(parsed),
		}
	}

	pub fn response_headers(
		&mut self,
		headers: &HashMap<String, String>,
	) -> Result<HeaderMutation, Error> {
		match self {
			Translator::OpenAi(t) => t.response_headers(headers),
			Translator::Azure(t) => t.response_headers(headers),
			Translator::Bedrock(t) => t.response_headers(headers),
			Translator::Gemini(t) => t.response_headers(headers),
			Translator::GcpAnthropic(t) => t.response_headers(headers),
			Translator::MessagesPassthrough(t) => t.response_headers(headers),
		}
	}

	pub fn response_body(
		&mut self,
		chunk: &[u8],
		end_of_stream: bool,
	) -> Result<ResponseOutcome, Error> {
		match self {
			Translator::OpenAi(t) => t.response_body(chunk, end_of_stream),
			Translator::Azure(t) => t.response_body(chunk, end_of_stream),
			Translator::Bedrock(t) => t.response_body(chunk, end_of_stream),
			Translator::Gemini(t) => t.response_body(chunk, end_of_stream),
			Translator::GcpAnthropic(t) => t.response_body(chunk, end_of_stream),
			Translator::MessagesPassthrough(t) => t.response_body(chunk, end_of_stream),
		}
	}

	/// Error hook for non-2xx upstream responses. May rewrite the body into
	/// a normalized OpenAI-shaped error.
	pub fn response_error(
		&mut self,
		headers: &HashMap<String, String>,
		body: &[u8],
	) -> Result<ResponseOutcome, Error> {
		match self {
			Translator::OpenAi(t) => t.response_error(headers, body),
			Translator::Azure(t) => t.response_error(headers, body),
			Translator::Bedrock(t) => t.response_error(headers, body),
			Translator::Gemini(t) => t.response_error(headers, body),
			Translator::GcpAnthropic(t) => t.response_error(headers, body),
			Translator::MessagesPassthrough(t) => t.response_error(headers, body),
		}
	}
}

fn gcp_location(backend: &Backend) -> GcpTarget {
	match &backend.auth {
		Some(crate::config::BackendAuthConfig::Gcp {
			region,
			project_name,
			..
		}) => GcpTarget {
			project: project_name.clone(),
			region: region.clone(),
		},
		_ => GcpTarget::default(),
	}
}

/// Vertex path coordinates, read off the backend's GCP credential entry.
#[derive(Debug, Clone, Default)]
pub struct GcpTarget {
	pub project: String,
	pub region: String,
}

/// Percent-encodes one path segment the way AWS/GCP expect model ids to be
/// escaped (unreserved characters only).
pub(crate) fn escape_path_segment(s: &str) -> String {
	const HEX: &[u8; 16] = b"0123456789ABCDEF";
	let mut out = String::with_capacity(s.len());
	for &b in s.as_bytes() {
		match b {
			b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
				out.push(b as char)
			},
			_ => {
				out.push('%');
				out.push(HEX[(b >> 4) as usize] as char);
				out.push(HEX[(b & 0x0f) as usize] as char);
			},
		}
	}
	out
}
