use std::collections::HashMap;

use crate::proto::{
	BodyMutation, CommonResponse, HeaderMutation, HeaderValue, HeaderValueOption, HttpStatus,
	ImmediateResponse, ProcessingResponse, Struct, Value, body_mutation, processing_response,
	value::Kind,
};

/// Appends a set-header entry. Values go through `raw_value`; Envoy accepts
/// either but only `raw_value` is byte-exact.
pub fn set_header(hm: &mut HeaderMutation, key: impl Into<String>, value: impl Into<Vec<u8>>) {
	hm.set_headers.push(HeaderValueOption {
		header: Some(HeaderValue {
			key: key.into(),
			raw_value: value.into(),
			..Default::default()
		}),
		..Default::default()
	});
}

pub fn remove_header(hm: &mut HeaderMutation, key: impl Into<String>) {
	hm.remove_headers.push(key.into());
}

/// Looks up a header set earlier in this mutation, e.g. the `:path` the
/// translator just wrote and the signer must cover.
pub fn get_set_header<'a>(hm: &'a HeaderMutation, key: &str) -> Option<&'a [u8]> {
	hm.set_headers.iter().find_map(|o| {
		let h = o.header.as_ref()?;
		if h.key != key {
			return None;
		}
		if !h.value.is_empty() {
			Some(h.value.as_bytes())
		} else {
			Some(h.raw_value.as_slice())
		}
	})
}

pub fn replace_body(body: impl Into<Vec<u8>>) -> BodyMutation {
	BodyMutation {
		mutation: Some(body_mutation::Mutation::Body(body.into())),
	}
}

pub fn body_bytes(bm: &BodyMutation) -> &[u8] {
	match &bm.mutation {
		Some(body_mutation::Mutation::Body(b)) => b.as_slice(),
		_ => &[],
	}
}

/// Converts an ext_proc header list into the lower-cased map the processors
/// work with. Pseudo-headers (`:path`, `:method`) keep their names.
pub fn headers_to_map(hm: Option<&crate::proto::HeaderMap>) -> HashMap<String, String> {
	let Some(hm) = hm else {
		return HashMap::new();
	};
	hm.headers
		.iter()
		.map(|h| {
			let value = if !h.value.is_empty() {
				h.value.clone()
			} else {
				String::from_utf8_lossy(&h.raw_value).to_string()
			};
			(h.key.to_ascii_lowercase(), value)
		})
		.collect()
}

pub fn request_headers_response(cr: CommonResponse) -> ProcessingResponse {
	ProcessingResponse {
		response: Some(processing_response::Response::RequestHeaders(
			crate::proto::HeadersResponse { response: Some(cr) },
		)),
		..Default::default()
	}
}

pub fn request_body_response(cr: CommonResponse) -> ProcessingResponse {
	ProcessingResponse {
		response: Some(processing_response::Response::RequestBody(
			crate::proto::BodyResponse { response: Some(cr) },
		)),
		..Default::default()
	}
}

pub fn response_headers_response(cr: CommonResponse) -> ProcessingResponse {
	ProcessingResponse {
		response: Some(processing_response::Response::ResponseHeaders(
			crate::proto::HeadersResponse { response: Some(cr) },
		)),
		..Default::default()
	}
}

pub fn response_body_response(cr: CommonResponse) -> ProcessingResponse {
	ProcessingResponse {
		response: Some(processing_response::Response::ResponseBody(
			crate::proto::BodyResponse { response: Some(cr) },
		)),
		..Default::default()
	}
}

/// Builds an immediate (locally generated) HTTP response, used where the
/// stream must terminate with an HTTP-shaped error rather than a gRPC one.
pub fn immediate_response(status: u16, content_type: &str, body: Vec<u8>) -> ProcessingResponse {
	let mut headers = HeaderMutation::default();
	set_header(&mut headers, "content-type", content_type.as_bytes());
	ProcessingResponse {
		response: Some(processing_response::Response::ImmediateResponse(
			ImmediateResponse {
				status: Some(HttpStatus { code: status as i32 }),
				headers: Some(headers),
				body,
				..Default::default()
			},
		)),
		..Default::default()
	}
}

pub fn number_value(n: f64) -> Value {
	Value {
		kind: Some(Kind::NumberValue(n)),
	}
}

pub fn string_value(s: impl Into<String>) -> Value {
	Value {
		kind: Some(Kind::StringValue(s.into())),
	}
}

pub fn struct_of(fields: impl IntoIterator<Item = (String, Value)>) -> Struct {
	Struct {
		fields: fields.into_iter().collect(),
	}
}

/// Namespaced dynamic metadata: the per-request values live in one struct
/// keyed by the configured namespace.
pub fn namespaced_metadata(namespace: &str, fields: Struct) -> Struct {
	struct_of([(
		namespace.to_string(),
		Value {
			kind: Some(Kind::StructValue(fields)),
		},
	)])
}
