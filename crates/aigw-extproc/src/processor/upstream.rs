use std::collections::HashMap;
use std::sync::Arc;

use super::{
	Error, HeaderMutator, Observability, RouterFilter, decode_content_if_needed, is_good_status,
	remove_content_encoding_if_needed,
};
use crate::config::Config;
use crate::costs;
use crate::mutation;
use crate::proto::{CommonResponse, HttpHeaders, ProcessingResponse};
use crate::server::RouteKind;
use crate::translator::Translator;
use crate::types::TokenUsage;
use crate::backendauth;

/// Upstream-phase state. Transitions are driven by frame arrival; the proxy
/// guarantees ordering, so an out-of-order frame is a protocol violation and
/// surfaces as an internal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
	AwaitingBackend,
	Translating,
	AwaitingResponseHeaders,
	ProcessingBody,
	Complete,
}

/// The upstream-phase filter: translates the retained request body for the
/// selected backend, injects credentials, applies configured header rules,
/// then translates the response as it arrives.
pub struct UpstreamFilter {
	config: Arc<Config>,
	route: RouteKind,
	state: State,
	backend_name: String,
	model_name_override: Option<String>,
	effective_model: String,
	translator: Option<Translator>,
	auth: Option<backendauth::Handler>,
	header_mutator: Option<HeaderMutator>,
	streaming: bool,
	response_status: u16,
	response_encoding: Option<String>,
	response_headers: HashMap<String, String>,
	/// Buffered response bytes: non-streaming bodies and all error bodies
	/// accumulate here until end of stream.
	buffer: Vec<u8>,
	usage: Option<TokenUsage>,
	response_model: Option<String>,
}

impl UpstreamFilter {
	pub fn new(config: Arc<Config>, route: RouteKind) -> Self {
		Self {
			config,
			route,
			state: State::AwaitingBackend,
			backend_name: String::new(),
			model_name_override: None,
			effective_model: String::new(),
			translator: None,
			auth: None,
			header_mutator: None,
			streaming: false,
			response_status: 0,
			response_encoding: None,
			response_headers: HashMap::new(),
			buffer: Vec::new(),
			usage: None,
			response_model: None,
		}
	}

	pub fn backend_bound(&self) -> bool {
		self.state != State::AwaitingBackend
	}

	/// Binds the backend the proxy selected: translator by schema pair, auth
	/// handler from credentials, header mutator over the client's original
	/// headers.
	pub fn set_backend(
		&mut self,
		backend_name: &str,
		router: &RouterFilter,
		obs: &mut Observability,
	) -> Result<(), Error> {
		let backend = self
			.config
			.backend(backend_name)
			.ok_or_else(|| Error::UnknownBackend(backend_name.to_string()))?;

		self.backend_name = backend.name.clone();
		self.model_name_override = backend.model_name_override.clone();
		self.effective_model = backend
			.model_name_override
			.clone()
			.unwrap_or_else(|| router.model().to_string());
		self.translator = Some(Translator::select(self.route, backend)?);
		self.auth = backend
			.auth
			.as_ref()
			.map(backendauth::Handler::new)
			.transpose()?;
		self.header_mutator = Some(HeaderMutator::new(
			backend.header_mutation.as_ref(),
			router.request_headers.clone(),
		));
		self.streaming = router
			.parsed
			.as_ref()
			.map(|p| p.is_streaming())
			.unwrap_or_default();

		obs.metrics.set_provider(backend.schema.name.provider_name());
		obs.metrics.set_request_model(&self.effective_model);
		self.state = State::Translating;
		Ok(())
	}

	/// Upstream request headers: re-translate the retained body (forced on
	/// retry), sign, apply header rules, propagate trace context. The
	/// translator runs before the auth handler so SigV4 covers exactly the
	/// bytes that leave the gateway.
	pub fn on_request_headers(
		&mut self,
		headers: &HttpHeaders,
		on_retry: bool,
		router: &RouterFilter,
		obs: &mut Observability,
	) -> Result<ProcessingResponse, Error> {
		let translator = self
			.translator
			.as_mut()
			.ok_or_else(|| Error::UnknownBackend("backend not bound".to_string()))?;
		let parsed = router
			.parsed
			.as_ref()
			.ok_or_else(|| Error::BadRequest("no request body retained".to_string()))?;

		let mut request_headers = mutation::headers_to_map(headers.headers.as_ref());

		let mut outcome = translator.request_body(&router.original_body, parsed, on_retry)?;
		let body_mutation = outcome.body_mutation();

		if let Some(auth) = &self.auth {
			auth.do_auth(
				&mut request_headers,
				&mut outcome.header_mutation,
				body_mutation.as_ref(),
			)?;
		}

		if let Some(mutator) = &self.header_mutator {
			let extra = mutator.mutate(&mut request_headers, on_retry);
			outcome.header_mutation.set_headers.extend(extra.set_headers);
			outcome
				.header_mutation
				.remove_headers
				.extend(extra.remove_headers);
		}

		// Metrics and any downstream routing observe the override, not the
		// client's model name.
		if self.model_name_override.is_some() {
			mutation::set_header(
				&mut outcome.header_mutation,
				self.config.model_name_header_key.clone(),
				self.effective_model.as_bytes().to_vec(),
			);
		}

		if let Some(span) = &obs.span {
			span.inject(&mut outcome.header_mutation);
		}

		self.state = State::AwaitingResponseHeaders;
		Ok(mutation::request_headers_response(CommonResponse {
			header_mutation: Some(outcome.header_mutation),
			body_mutation,
			..Default::default()
		}))
	}

	pub fn on_response_headers(
		&mut self,
		headers: &HttpHeaders,
	) -> Result<ProcessingResponse, Error> {
		let map = mutation::headers_to_map(headers.headers.as_ref());
		self.response_status = map
			.get(":status")
			.and_then(|s| s.parse().ok())
			.unwrap_or(200);
		self.response_encoding = map.get("content-encoding").cloned();
		let content_type = map.get("content-type").cloned().unwrap_or_default();
		self.response_headers = map.clone();
		// The request declares streaming; the upstream confirms it with a
		// streaming content type. Either signal selects the streaming path.
		self.streaming = self.streaming
			|| content_type.starts_with("text/event-stream")
			|| content_type.starts_with("application/vnd.amazon.eventstream");

		let hm = if is_good_status(self.response_status) {
			self
				.translator
				.as_mut()
				.map(|t| t.response_headers(&map))
				.transpose()?
				.unwrap_or_default()
		} else {
			// The error hook rewrites the body later; headers pass through.
			Default::default()
		};

		self.state = State::ProcessingBody;
		Ok(mutation::response_headers_response(CommonResponse {
			header_mutation: Some(hm),
			..Default::default()
		}))
	}

	pub fn on_response_body(
		&mut self,
		chunk: &[u8],
		end_of_stream: bool,
		obs: &mut Observability,
	) -> Result<ProcessingResponse, Error> {
		if !is_good_status(self.response_status) {
			return self.on_error_body(chunk, end_of_stream, obs);
		}
		let (outcome, was_encoded) = if self.streaming {
			let (decoded, was_encoded) = match self.response_encoding.as_deref() {
				Some(enc) => decode_content_if_needed(chunk, Some(enc))?,
				None => (chunk.to_vec(), false),
			};
			if !decoded.is_empty() {
				obs.metrics.on_output();
			}
			let out = self
				.translator_mut()?
				.response_body(&decoded, end_of_stream)?;
			(out, was_encoded)
		} else {
			self.buffer.extend_from_slice(chunk);
			if !end_of_stream {
				return Ok(mutation::response_body_response(CommonResponse::default()));
			}
			let (decoded, was_encoded) =
				decode_content_if_needed(&self.buffer, self.response_encoding.as_deref())?;
			obs.metrics.on_output();
			let out = self.translator_mut()?.response_body(&decoded, true)?;
			if let Some(span) = &mut obs.span {
				span.record_output(out.body.as_deref().unwrap_or(&decoded));
			}
			(out, was_encoded)
		};

		let mut cr = CommonResponse::default();
		let mut hm = Default::default();
		remove_content_encoding_if_needed(&mut hm, outcome.body.is_some(), was_encoded);
		cr.header_mutation = Some(hm);
		cr.body_mutation = outcome.body.clone().map(mutation::replace_body);

		if outcome.response_model.is_some() {
			self.response_model = outcome.response_model.clone();
		}
		if let Some(model) = &self.response_model {
			obs.metrics.set_response_model(model);
		}

		let mut resp = mutation::response_body_response(cr);
		if let Some(usage) = outcome.usage {
			self.usage = Some(usage);
			obs.metrics.record_token_usage(usage.input_tokens, usage.output_tokens);
			if let Some(span) = &mut obs.span {
				span.record_usage(usage);
			}
			let metadata = costs::build_metadata(
				&self.config,
				&self.backend_name,
				self.model_name_override.as_deref(),
				&self.effective_model,
				usage,
			)?;
			resp.dynamic_metadata =
				Some(mutation::namespaced_metadata(&self.config.metadata_namespace, metadata));
		}

		if end_of_stream {
			self.state = State::Complete;
			let output_tokens = self.usage.map(|u| u.output_tokens).unwrap_or_default();
			obs.finish(true, output_tokens);
		}
		Ok(resp)
	}

	/// Non-2xx upstream response: buffer to the end, then let the
	/// translator's error hook normalize the body.
	fn on_error_body(
		&mut self,
		chunk: &[u8],
		end_of_stream: bool,
		obs: &mut Observability,
	) -> Result<ProcessingResponse, Error> {
		self.buffer.extend_from_slice(chunk);
		if !end_of_stream {
			return Ok(mutation::response_body_response(CommonResponse::default()));
		}
		let (decoded, was_encoded) =
			decode_content_if_needed(&self.buffer, self.response_encoding.as_deref())?;
		let headers = std::mem::take(&mut self.response_headers);
		let outcome = self
			.translator_mut()?
			.response_error(&headers, &decoded)?;

		let mut cr = CommonResponse::default();
		let mut hm = Default::default();
		remove_content_encoding_if_needed(&mut hm, outcome.body.is_some(), was_encoded);
		cr.header_mutation = Some(hm);
		cr.body_mutation = outcome.body.map(mutation::replace_body);

		self.state = State::Complete;
		obs.finish(false, 0);
		Ok(mutation::response_body_response(cr))
	}

	fn translator_mut(&mut self) -> Result<&mut Translator, Error> {
		self
			.translator
			.as_mut()
			.ok_or_else(|| Error::UnknownBackend("backend not bound".to_string()))
	}
}
