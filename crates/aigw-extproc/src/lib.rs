//! External processor for the AI gateway data plane.
//!
//! The proxy delegates every HTTP transaction to this process over the
//! `envoy.service.ext_proc.v3.ExternalProcessor` bidirectional stream. Per
//! transaction the processor recognizes the client's AI protocol, translates
//! bodies between backend dialects, injects backend credentials (including a
//! live SigV4 signature over the translated body), meters token usage into
//! dynamic metadata, and emits GenAI metrics and traces.

pub mod backendauth;
pub mod cel;
pub mod config;
pub mod costs;
pub mod eventstream;
pub mod metrics;
pub mod mutation;
pub mod processor;
pub mod server;
pub mod sse;
pub mod trace;
pub mod translator;
pub mod types;

/// Generated Envoy protobuf surface used by the processor.
pub mod proto {
	pub use envoy_types::pb::envoy::config::core::v3::{HeaderMap, HeaderValue, HeaderValueOption};
	pub use envoy_types::pb::envoy::r#type::v3::HttpStatus;
	pub use envoy_types::pb::envoy::service::ext_proc::v3::*;
	pub use envoy_types::pb::google::protobuf::{ListValue, Struct, Value, value};
}
