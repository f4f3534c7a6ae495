use std::collections::HashMap;

use bytes::Bytes;

use super::openai_passthrough::OpenAiTranslator;
use super::{Error, ParsedRequest, RequestOutcome, ResponseOutcome, escape_path_segment};
use crate::mutation;
use crate::proto::HeaderMutation;
use crate::server::RouteKind;

const DEFAULT_API_VERSION: &str = "2025-01-01-preview";

/// Azure OpenAI: the body is OpenAI-compatible, so this wraps the
/// passthrough translator and only rewrites the path to the deployment form.
pub struct AzureTranslator {
	inner: OpenAiTranslator,
	route: RouteKind,
	api_version: String,
	model_override: Option<String>,
}

impl AzureTranslator {
	pub fn new(
		route: RouteKind,
		api_version: Option<String>,
		model_override: Option<String>,
	) -> Self {
		Self {
			inner: OpenAiTranslator::new(model_override.clone()),
			route,
			api_version: api_version.unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
			model_override,
		}
	}

	pub fn request_body(
		&mut self,
		raw: &Bytes,
		parsed: &ParsedRequest,
		force_mutation: bool,
	) -> Result<RequestOutcome, Error> {
		let mut out = self.inner.request_body(raw, parsed, force_mutation)?;
		// The deployment segment routes inside Azure; the body keeps the
		// model field as-is.
		let deployment = self
			.model_override
			.clone()
			.unwrap_or_else(|| parsed.model().to_string());
		let suffix = match self.route {
			RouteKind::Embeddings => "embeddings",
			_ => "chat/completions",
		};
		let path = format!(
			"/openai/deployments/{}/{suffix}?api-version={}",
			escape_path_segment(&deployment),
			self.api_version
		);
		mutation::set_header(&mut out.header_mutation, ":path", path.into_bytes());
		Ok(out)
	}

	pub fn response_headers(
		&mut self,
		headers: &HashMap<String, String>,
	) -> Result<HeaderMutation, Error> {
		self.inner.response_headers(headers)
	}

	pub fn response_body(
		&mut self,
		chunk: &[u8],
		end_of_stream: bool,
	) -> Result<ResponseOutcome, Error> {
		self.inner.response_body(chunk, end_of_stream)
	}

	pub fn response_error(
		&mut self,
		headers: &HashMap<String, String>,
		body: &[u8],
	) -> Result<ResponseOutcome, Error> {
		self.inner.response_error(headers, body)
	}
}
