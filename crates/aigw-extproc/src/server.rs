use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use opentelemetry::global::BoxedTracer;
use tokio::sync::mpsc::Sender;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use crate::config::{Config, ConfigStore, SELECTED_BACKEND_HEADER};
use crate::metrics::{GenAiMetrics, OPERATION_CHAT, OPERATION_EMBEDDING, RequestMetrics};
use crate::mutation;
use crate::processor::{Observability, RouterFilter, UpstreamFilter};
use crate::proto::external_processor_server::ExternalProcessor;
use crate::proto::{
	CommonResponse, ProcessingRequest, ProcessingResponse, TrailersResponse, processing_request,
	processing_response,
};
use crate::trace::{RequestSpan, TraceConfig};
use crate::translator::ParsedRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
	ChatCompletions,
	Embeddings,
	Messages,
	Models,
}

impl RouteKind {
	fn operation(&self) -> &'static str {
		match self {
			RouteKind::Embeddings => OPERATION_EMBEDDING,
			_ => OPERATION_CHAT,
		}
	}

	fn span_name(&self) -> &'static str {
		match self {
			RouteKind::ChatCompletions => "ChatCompletion",
			RouteKind::Embeddings => "Embeddings",
			RouteKind::Messages => "Messages",
			RouteKind::Models => "Models",
		}
	}
}

/// Method/path registry established at startup. A root prefix, when
/// configured, is prepended to every registered path.
#[derive(Debug)]
pub struct PathRegistry {
	routes: Vec<(&'static str, String, RouteKind)>,
}

impl PathRegistry {
	pub fn new(root_prefix: &str) -> Self {
		let prefix = root_prefix.trim_end_matches('/');
		let mk = |p: &str| format!("{prefix}{p}");
		Self {
			routes: vec![
				("POST", mk("/v1/chat/completions"), RouteKind::ChatCompletions),
				("POST", mk("/v1/embeddings"), RouteKind::Embeddings),
				("GET", mk("/v1/models"), RouteKind::Models),
				("POST", mk("/anthropic/v1/messages"), RouteKind::Messages),
			],
		}
	}

	pub fn lookup(&self, method: &str, path: &str) -> Option<RouteKind> {
		let path = path.split('?').next().unwrap_or(path);
		self
			.routes
			.iter()
			.find(|(m, p, _)| *m == method && p == path)
			.map(|(_, _, k)| *k)
	}
}

/// The ExternalProcessor service: selects a processor pair by request path
/// and drives it over the lifetime of one bidirectional stream.
pub struct ExtProcService {
	store: Arc<ConfigStore>,
	registry: Arc<PathRegistry>,
	metrics: Arc<GenAiMetrics>,
	header_labels: Arc<Vec<(String, String)>>,
	trace_config: TraceConfig,
	tracer: Arc<BoxedTracer>,
}

impl ExtProcService {
	pub fn new(
		store: Arc<ConfigStore>,
		registry: PathRegistry,
		metrics: Arc<GenAiMetrics>,
		header_labels: Vec<(String, String)>,
		trace_config: TraceConfig,
	) -> Self {
		Self {
			store,
			registry: Arc::new(registry),
			metrics,
			header_labels: Arc::new(header_labels),
			trace_config,
			tracer: Arc::new(opentelemetry::global::tracer("aigw-extproc")),
		}
	}

	/// Drives one `Process` stream over an arbitrary frame source. The tonic
	/// entry point wraps this; tests feed frames directly.
	pub async fn handle_stream<S>(
		&self,
		frames: S,
		tx: Sender<Result<ProcessingResponse, Status>>,
	) where
		S: Stream<Item = Result<ProcessingRequest, Status>> + Unpin + Send,
	{
		run_stream(self.context(), frames, tx).await
	}

	fn context(&self) -> StreamContext {
		StreamContext {
			store: self.store.clone(),
			registry: self.registry.clone(),
			metrics: self.metrics.clone(),
			header_labels: self.header_labels.clone(),
			trace_config: self.trace_config,
			tracer: self.tracer.clone(),
		}
	}
}

#[derive(Clone)]
pub struct StreamContext {
	store: Arc<ConfigStore>,
	registry: Arc<PathRegistry>,
	metrics: Arc<GenAiMetrics>,
	header_labels: Arc<Vec<(String, String)>>,
	trace_config: TraceConfig,
	tracer: Arc<BoxedTracer>,
}

#[tonic::async_trait]
impl ExternalProcessor for ExtProcService {
	type ProcessStream =
		Pin<Box<dyn Stream<Item = Result<ProcessingResponse, Status>> + Send + 'static>>;

	async fn process(
		&self,
		request: Request<tonic::Streaming<ProcessingRequest>>,
	) -> Result<Response<Self::ProcessStream>, Status> {
		let frames = request.into_inner();
		let (tx, rx) = tokio::sync::mpsc::channel(16);
		let ctx = self.context();
		tokio::spawn(async move {
			run_stream(ctx, frames, tx).await;
		});
		Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
	}
}

/// One HTTP transaction: a router filter and an upstream filter bound to the
/// same retained request state.
struct Transaction {
	route: RouteKind,
	router: RouterFilter,
	upstream: UpstreamFilter,
	obs: Observability,
	config: Arc<Config>,
	attempts: u32,
}

async fn run_stream<S>(
	ctx: StreamContext,
	mut frames: S,
	tx: Sender<Result<ProcessingResponse, Status>>,
) where
	S: Stream<Item = Result<ProcessingRequest, Status>> + Unpin + Send,
{
	let mut txn: Option<Transaction> = None;

	while let Some(frame) = frames.next().await {
		let frame = match frame {
			Ok(f) => f,
			Err(e) => {
				debug!("stream read error: {e}");
				break;
			},
		};
		let Some(req) = frame.request else { continue };

		let result = handle_frame(&ctx, &mut txn, req);
		match result {
			FrameResult::Respond(resp) => {
				let terminal = matches!(
					resp.response,
					Some(processing_response::Response::ImmediateResponse(_))
				);
				if tx.send(Ok(resp)).await.is_err() || terminal {
					break;
				}
			},
			FrameResult::Fail(status) => {
				let _ = tx.send(Err(status)).await;
				break;
			},
			FrameResult::Ignore => {},
		}
	}

	// Client disconnects and deadline hits release the transaction here; an
	// unfinished request is recorded as a failure.
	if let Some(mut t) = txn.take() {
		t.obs.finish(false, 0);
	}
}

enum FrameResult {
	Respond(ProcessingResponse),
	Fail(Status),
	Ignore,
}

fn handle_frame(
	ctx: &StreamContext,
	txn: &mut Option<Transaction>,
	req: processing_request::Request,
) -> FrameResult {
	use processing_request::Request as R;
	match req {
		R::RequestHeaders(h) => match txn {
			None => {
				let headers = mutation::headers_to_map(h.headers.as_ref());
				let method = headers.get(":method").map(String::as_str).unwrap_or("");
				let path = headers.get(":path").map(String::as_str).unwrap_or("");
				let Some(route) = ctx.registry.lookup(method, path) else {
					return FrameResult::Fail(Status::not_found(format!(
						"no route registered for {method} {path}"
					)));
				};
				let Some(config) = ctx.store.snapshot() else {
					return FrameResult::Fail(Status::unavailable("no config loaded"));
				};
				let mut t = Transaction {
					route,
					router: RouterFilter::new(config.clone(), route),
					upstream: UpstreamFilter::new(config.clone(), route),
					obs: Observability {
						metrics: RequestMetrics::new(
							ctx.metrics.clone(),
							route.operation(),
							&ctx.header_labels,
							&headers,
						),
						span: None,
						tracer: ctx.tracer.clone(),
						span_name: route.span_name(),
					},
					config,
					attempts: 0,
				};
				let resp = t.router.on_request_headers(&h);
				// Inline answers (the models route) end the transaction here;
				// retaining it would misreport the stream teardown as a failure.
				if !matches!(
					resp.response,
					Some(processing_response::Response::ImmediateResponse(_))
				) {
					*txn = Some(t);
				}
				FrameResult::Respond(resp)
			},
			Some(t) => {
				// The proxy selected a backend: this is the upstream filter's
				// request phase (repeated on retry).
				let headers = mutation::headers_to_map(h.headers.as_ref());
				t.attempts += 1;
				let on_retry = t.attempts > 1 || attempt_count(&headers) > 1;
				let backend = headers
					.get(SELECTED_BACKEND_HEADER)
					.cloned()
					.unwrap_or_default();
				if on_retry {
					// A retry re-initializes upstream state from the retained
					// body; the backend may have changed.
					t.upstream = UpstreamFilter::new(t.config.clone(), t.route);
				}
				let r = t
					.upstream
					.set_backend(&backend, &t.router, &mut t.obs)
					.and_then(|()| {
						t.upstream
							.on_request_headers(&h, on_retry, &t.router, &mut t.obs)
					});
				match r {
					Ok(resp) => FrameResult::Respond(resp),
					Err(e) => fail_transaction(t, e),
				}
			},
		},
		R::RequestBody(b) => {
			let Some(t) = txn else {
				return FrameResult::Fail(Status::invalid_argument(
					"request body before request headers",
				));
			};
			match t.router.on_request_body(&b.body) {
				Ok(resp) => {
					t.obs.metrics.set_request_model(t.router.model());
					t.obs.span = Some(RequestSpan::start(
						&ctx.trace_config,
						&t.router.request_headers,
						t.router.model(),
						invocation_parameters(t.router.parsed.as_ref()),
						&t.router.original_body,
					));
					FrameResult::Respond(resp)
				},
				Err(e) => fail_transaction(t, e),
			}
		},
		R::ResponseHeaders(h) => {
			let Some(t) = txn else {
				return FrameResult::Respond(mutation::response_headers_response(
					CommonResponse::default(),
				));
			};
			if !t.upstream.backend_bound() {
				// The transaction never reached the upstream filter (e.g. a
				// proxy-level error response): pass through.
				return FrameResult::Respond(mutation::response_headers_response(
					CommonResponse::default(),
				));
			}
			match t.upstream.on_response_headers(&h) {
				Ok(resp) => FrameResult::Respond(resp),
				Err(e) => fail_transaction(t, e),
			}
		},
		R::ResponseBody(b) => {
			let Some(t) = txn else {
				return FrameResult::Respond(mutation::response_body_response(
					CommonResponse::default(),
				));
			};
			if !t.upstream.backend_bound() {
				return FrameResult::Respond(mutation::response_body_response(
					CommonResponse::default(),
				));
			}
			match t.upstream.on_response_body(&b.body, b.end_of_stream, &mut t.obs) {
				Ok(resp) => FrameResult::Respond(resp),
				Err(e) => {
					warn!("response translation failed: {e}");
					t.obs.finish(false, 0);
					FrameResult::Fail(Status::internal(e.to_string()))
				},
			}
		},
		R::RequestTrailers(_) => FrameResult::Respond(ProcessingResponse {
			response: Some(processing_response::Response::RequestTrailers(
				TrailersResponse::default(),
			)),
			..Default::default()
		}),
		R::ResponseTrailers(_) => FrameResult::Respond(ProcessingResponse {
			response: Some(processing_response::Response::ResponseTrailers(
				TrailersResponse::default(),
			)),
			..Default::default()
		}),
	}
}

/// Request-phase failure: surface an HTTP-shaped error and record it.
fn fail_transaction(t: &mut Transaction, e: crate::processor::Error) -> FrameResult {
	warn!("request processing failed: {e}");
	t.obs.finish(false, 0);
	FrameResult::Respond(e.into_immediate_response())
}

fn attempt_count(headers: &HashMap<String, String>) -> u32 {
	headers
		.get("x-envoy-attempt-count")
		.and_then(|v| v.parse().ok())
		.unwrap_or(1)
}

/// Serialized sampling parameters for the span, excluding message content.
fn invocation_parameters(parsed: Option<&ParsedRequest>) -> Option<String> {
	let ParsedRequest::Chat(req) = parsed? else {
		return None;
	};
	let mut params = serde_json::Map::new();
	if let Some(v) = req.temperature {
		params.insert("temperature".to_string(), v.into());
	}
	if let Some(v) = req.top_p {
		params.insert("top_p".to_string(), v.into());
	}
	if let Some(v) = req.max_tokens {
		params.insert("max_tokens".to_string(), v.into());
	}
	if let Some(v) = req.max_completion_tokens {
		params.insert("max_completion_tokens".to_string(), v.into());
	}
	if let Some(v) = req.stream {
		params.insert("stream".to_string(), v.into());
	}
	if params.is_empty() {
		None
	} else {
		serde_json::to_string(&serde_json::Value::Object(params)).ok()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn registry_matches_method_and_path() {
		let r = PathRegistry::new("");
		assert_eq!(
			r.lookup("POST", "/v1/chat/completions"),
			Some(RouteKind::ChatCompletions)
		);
		assert_eq!(r.lookup("POST", "/v1/embeddings"), Some(RouteKind::Embeddings));
		assert_eq!(r.lookup("GET", "/v1/models"), Some(RouteKind::Models));
		assert_eq!(
			r.lookup("POST", "/anthropic/v1/messages"),
			Some(RouteKind::Messages)
		);
		assert_eq!(r.lookup("GET", "/v1/chat/completions"), None);
		assert_eq!(r.lookup("POST", "/v2/other"), None);
	}

	#[test]
	fn registry_applies_root_prefix() {
		let r = PathRegistry::new("/gateway");
		assert_eq!(
			r.lookup("POST", "/gateway/v1/chat/completions"),
			Some(RouteKind::ChatCompletions)
		);
		assert_eq!(r.lookup("POST", "/v1/chat/completions"), None);
	}

	#[test]
	fn registry_ignores_query() {
		let r = PathRegistry::new("");
		assert_eq!(
			r.lookup("POST", "/v1/chat/completions?debug=1"),
			Some(RouteKind::ChatCompletions)
		);
	}
}
