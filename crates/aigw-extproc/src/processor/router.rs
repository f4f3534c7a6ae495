use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use super::Error;
use crate::config::{Config, ORIGINAL_PATH_HEADER};
use crate::mutation;
use crate::proto::{CommonResponse, HeaderMutation, HttpHeaders, ProcessingResponse};
use crate::server::RouteKind;
use crate::translator::ParsedRequest;
use crate::types::openai;

/// The request-phase filter: parses the body in the route's declared schema,
/// extracts the model, and publishes it as a header for the proxy to route
/// on. Routing itself stays in the proxy.
pub struct RouterFilter {
	config: Arc<Config>,
	route: RouteKind,
	pub request_headers: HashMap<String, String>,
	pub original_body: Bytes,
	pub parsed: Option<ParsedRequest>,
}

impl RouterFilter {
	pub fn new(config: Arc<Config>, route: RouteKind) -> Self {
		Self {
			config,
			route,
			request_headers: HashMap::new(),
			original_body: Bytes::new(),
			parsed: None,
		}
	}

	/// First frame of the transaction. Headers are retained; mutations wait
	/// for the body (the proxy keeps buffering it either way). The models
	/// route has no body phase and is answered inline.
	pub fn on_request_headers(&mut self, headers: &HttpHeaders) -> ProcessingResponse {
		self.request_headers = mutation::headers_to_map(headers.headers.as_ref());
		if self.route == RouteKind::Models {
			return self.models_response();
		}
		mutation::request_headers_response(CommonResponse::default())
	}

	/// The whole buffered request body. Parses it, then answers with the
	/// model header so the proxy can select a backend.
	pub fn on_request_body(&mut self, body: &[u8]) -> Result<ProcessingResponse, Error> {
		let parsed = self.parse(body)?;
		let model = parsed.model();
		if model.is_empty() {
			return Err(Error::BadRequest("model not specified".to_string()));
		}

		let mut hm = HeaderMutation::default();
		mutation::set_header(
			&mut hm,
			self.config.model_name_header_key.clone(),
			model.as_bytes().to_vec(),
		);
		if let Some(path) = self.request_headers.get(":path") {
			mutation::set_header(&mut hm, ORIGINAL_PATH_HEADER, path.as_bytes().to_vec());
		}

		self.original_body = Bytes::copy_from_slice(body);
		self.parsed = Some(parsed);

		Ok(mutation::request_body_response(CommonResponse {
			header_mutation: Some(hm),
			clear_route_cache: true,
			..Default::default()
		}))
	}

	pub fn model(&self) -> &str {
		self.parsed.as_ref().map(ParsedRequest::model).unwrap_or("")
	}

	fn parse(&self, body: &[u8]) -> Result<ParsedRequest, Error> {
		match self.route {
			RouteKind::ChatCompletions => serde_json::from_slice(body)
				.map(ParsedRequest::Chat)
				.map_err(|e| Error::BadRequest(format!("failed to parse chat completion request: {e}"))),
			RouteKind::Embeddings => serde_json::from_slice(body)
				.map(ParsedRequest::Embeddings)
				.map_err(|e| Error::BadRequest(format!("failed to parse embeddings request: {e}"))),
			RouteKind::Messages => serde_json::from_slice(body)
				.map(ParsedRequest::Messages)
				.map_err(|e| Error::BadRequest(format!("failed to parse messages request: {e}"))),
			RouteKind::Models => Err(Error::BadRequest(
				"model listing has no request body".to_string(),
			)),
		}
	}

	fn models_response(&self) -> ProcessingResponse {
		let list = openai::ModelList {
			object: "list".to_string(),
			data: self
				.config
				.models
				.iter()
				.map(|m| openai::Model {
					id: m.name.clone(),
					object: "model".to_string(),
					created: m.created_at,
					owned_by: m.owned_by.clone(),
				})
				.collect(),
		};
		let body = serde_json::to_vec(&list).unwrap_or_default();
		mutation::immediate_response(200, "application/json", body)
	}
}
