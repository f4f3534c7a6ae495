use std::io::Read;
use std::sync::Arc;

use opentelemetry::global::BoxedTracer;

use crate::metrics::RequestMetrics;
use crate::trace::RequestSpan;
use crate::types::openai;
use crate::{backendauth, cel, mutation, translator};

pub mod headermutator;
pub mod router;
pub mod upstream;

pub use headermutator::HeaderMutator;
pub use router::RouterFilter;
pub use upstream::UpstreamFilter;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("bad request: {0}")]
	BadRequest(String),
	#[error("unknown backend {0:?}")]
	UnknownBackend(String),
	#[error(transparent)]
	Translation(#[from] translator::Error),
	#[error(transparent)]
	Auth(#[from] backendauth::Error),
	#[error(transparent)]
	Cel(#[from] cel::Error),
	#[error("failed to decode response body: {0}")]
	ContentDecoding(std::io::Error),
}

impl Error {
	pub fn status(&self) -> u16 {
		match self {
			Error::BadRequest(_) => 400,
			_ => 500,
		}
	}

	/// HTTP-shaped terminal error: the proxy forwards this body verbatim, so
	/// clients see the same error dialect regardless of the backend.
	pub fn into_immediate_response(self) -> crate::proto::ProcessingResponse {
		let kind = match self.status() {
			400 => "invalid_request_error",
			_ => "internal_error",
		};
		let body = openai::ErrorResponse::new(kind, self.to_string());
		let body = serde_json::to_vec(&body).unwrap_or_default();
		mutation::immediate_response(self.status(), "application/json", body)
	}
}

/// Observability state for one transaction, shared by both filters.
pub struct Observability {
	pub metrics: RequestMetrics,
	pub span: Option<RequestSpan>,
	pub tracer: Arc<BoxedTracer>,
	pub span_name: &'static str,
}

impl Observability {
	pub fn finish(&mut self, success: bool, output_tokens: u64) {
		self.metrics.record_completion(success, output_tokens);
		if let Some(span) = &mut self.span {
			span.finish(&self.tracer, self.span_name, success);
		}
	}
}

/// 2xx check, per the upstream response contract.
pub fn is_good_status(code: u16) -> bool {
	(200..300).contains(&code)
}

/// Decompresses a response body according to its content-encoding. Gzip is
/// supported; unknown encodings pass through untouched. A body that claims
/// gzip but does not decode fails the response rather than letting garbled
/// bytes through as plaintext.
pub fn decode_content_if_needed(
	body: &[u8],
	content_encoding: Option<&str>,
) -> Result<(Vec<u8>, bool), Error> {
	match content_encoding {
		Some(enc) if enc.eq_ignore_ascii_case("gzip") => {
			let mut decoder = flate2::read::MultiGzDecoder::new(body);
			let mut out = Vec::new();
			decoder
				.read_to_end(&mut out)
				.map_err(Error::ContentDecoding)?;
			Ok((out, true))
		},
		_ => Ok((body.to_vec(), false)),
	}
}

/// When a decoded body gets mutated the stored encoding no longer matches;
/// drop the header rather than recompress.
pub fn remove_content_encoding_if_needed(
	header_mutation: &mut crate::proto::HeaderMutation,
	body_mutated: bool,
	was_encoded: bool,
) {
	if body_mutated && was_encoded {
		mutation::remove_header(header_mutation, "content-encoding");
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	fn gzip(data: &[u8]) -> Vec<u8> {
		let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
		enc.write_all(data).unwrap();
		enc.finish().unwrap()
	}

	#[test]
	fn status_classes() {
		assert!(is_good_status(200));
		assert!(is_good_status(299));
		assert!(!is_good_status(199));
		assert!(!is_good_status(404));
		assert!(!is_good_status(500));
	}

	#[test]
	fn gzip_bodies_are_decoded() {
		let compressed = gzip(b"hello world");
		let (out, encoded) = decode_content_if_needed(&compressed, Some("gzip")).unwrap();
		assert!(encoded);
		assert_eq!(out, b"hello world");
	}

	#[test]
	fn unknown_encoding_passes_through() {
		let (out, encoded) = decode_content_if_needed(b"zstd-stuff", Some("zstd")).unwrap();
		assert!(!encoded);
		assert_eq!(out, b"zstd-stuff");
	}

	#[test]
	fn invalid_gzip_fails_the_response() {
		let err = decode_content_if_needed(b"not gzip", Some("gzip")).unwrap_err();
		assert!(matches!(err, Error::ContentDecoding(_)));
		assert_eq!(err.status(), 500);
	}

	#[test]
	fn truncated_gzip_fails_the_response() {
		let mut compressed = gzip(b"hello world, this will be cut short");
		compressed.truncate(compressed.len() / 2);
		assert!(decode_content_if_needed(&compressed, Some("gzip")).is_err());
	}

	#[test]
	fn content_encoding_removed_only_when_mutating_decoded_body() {
		let mut hm = crate::proto::HeaderMutation::default();
		remove_content_encoding_if_needed(&mut hm, true, true);
		assert_eq!(hm.remove_headers, vec!["content-encoding"]);

		let mut hm = crate::proto::HeaderMutation::default();
		remove_content_encoding_if_needed(&mut hm, false, true);
		assert!(hm.remove_headers.is_empty());
		remove_content_encoding_if_needed(&mut hm, true, false);
		assert!(hm.remove_headers.is_empty());
	}

	#[test]
	fn errors_map_to_http_statuses() {
		assert_eq!(Error::BadRequest("x".into()).status(), 400);
		assert_eq!(Error::UnknownBackend("b".into()).status(), 500);
	}
}
