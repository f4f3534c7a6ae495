use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};

use crate::cel::Expression;

pub mod watcher;

pub const DEFAULT_METADATA_NAMESPACE: &str = "io.envoy.ai_gateway";
pub const DEFAULT_MODEL_NAME_HEADER: &str = "x-ai-eg-model";

/// Header the router filter fills with the incoming `:path` so retries and
/// diagnostics can recover the route after the path is rewritten.
pub const ORIGINAL_PATH_HEADER: &str = "x-ai-eg-original-path";
/// Header the data plane fills with the selected backend name on the
/// upstream filter chain (from cluster metadata).
pub const SELECTED_BACKEND_HEADER: &str = "x-ai-eg-selected-backend";

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("read {0}: {1}")]
	Read(String, std::io::Error),
	#[error("parse: {0}")]
	Parse(#[from] serde_yaml::Error),
	#[error("invalid config: {0}")]
	Invalid(String),
}

/// The filter configuration, parsed from the watched YAML file. One immutable
/// snapshot is built per load; CEL programs compile here, never per request.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
	/// Opaque generation id; a new value retriggers one-shot retry state.
	#[serde(default)]
	pub uuid: String,
	#[serde(default = "default_metadata_namespace")]
	pub metadata_namespace: String,
	#[serde(default = "default_model_name_header_key")]
	pub model_name_header_key: String,
	#[serde(default)]
	pub backends: Vec<Backend>,
	#[serde(default)]
	pub models: Vec<DeclaredModel>,
	#[serde(default)]
	pub llm_request_costs: Vec<LlmRequestCost>,
}

fn default_metadata_namespace() -> String {
	DEFAULT_METADATA_NAMESPACE.to_string()
}

fn default_model_name_header_key() -> String {
	DEFAULT_MODEL_NAME_HEADER.to_string()
}

impl Config {
	pub fn from_yaml(raw: &[u8]) -> Result<Self, Error> {
		let cfg: Config = serde_yaml::from_slice(raw)?;
		cfg.validate()?;
		Ok(cfg)
	}

	pub fn load_file(path: &Path) -> Result<Self, Error> {
		let raw = std::fs::read(path).map_err(|e| Error::Read(path.display().to_string(), e))?;
		Self::from_yaml(&raw)
	}

	fn validate(&self) -> Result<(), Error> {
		let mut seen = HashMap::new();
		for b in &self.backends {
			if seen.insert(b.name.as_str(), ()).is_some() {
				return Err(Error::Invalid(format!("duplicate backend {:?}", b.name)));
			}
		}
		for c in &self.llm_request_costs {
			match c.kind {
				CostKind::Cel if c.cel_expression.is_none() => {
					return Err(Error::Invalid(format!(
						"cost {:?} is CEL but has no celExpression",
						c.metadata_key
					)));
				},
				_ => {},
			}
		}
		Ok(())
	}

	pub fn backend(&self, name: &str) -> Option<&Backend> {
		self.backends.iter().find(|b| b.name == name)
	}
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Backend {
	pub name: String,
	pub schema: ApiSchema,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub model_name_override: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub header_mutation: Option<HeaderMutationRule>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub auth: Option<BackendAuthConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ApiSchema {
	pub name: SchemaName,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum SchemaName {
	#[serde(rename = "OpenAI")]
	OpenAi,
	#[serde(rename = "AWSBedrock")]
	AwsBedrock,
	#[serde(rename = "GCPVertexAI")]
	GcpVertexAi,
	#[serde(rename = "GCPAnthropic")]
	GcpAnthropic,
	#[serde(rename = "AzureOpenAI")]
	AzureOpenAi,
	#[serde(rename = "Anthropic")]
	Anthropic,
}

/// GenAI provider name reported on metrics, following
/// https://opentelemetry.io/docs/specs/semconv/gen-ai/
impl SchemaName {
	pub fn provider_name(&self) -> &'static str {
		match self {
			SchemaName::OpenAi => "openai",
			SchemaName::AwsBedrock => "aws.bedrock",
			SchemaName::GcpVertexAi => "gcp.vertex_ai",
			SchemaName::GcpAnthropic => "gcp.vertex_ai",
			SchemaName::AzureOpenAi => "azure.ai.openai",
			SchemaName::Anthropic => "anthropic",
		}
	}
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HeaderMutationRule {
	#[serde(default)]
	pub set: Vec<HeaderPair>,
	#[serde(default)]
	pub remove: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HeaderPair {
	pub name: String,
	pub value: String,
}

/// Credential material for one backend. The rotators resolve cloud identity
/// out-of-band and write the result here; the processor only reads it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BackendAuthConfig {
	ApiKey {
		key: String,
	},
	Aws {
		region: String,
		/// Shared-credentials file content (ini format), as produced by the
		/// STS rotator.
		credential_literal: String,
	},
	Azure {
		access_token: String,
	},
	Gcp {
		access_token: String,
		region: String,
		project_name: String,
	},
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeclaredModel {
	pub name: String,
	#[serde(default)]
	pub owned_by: String,
	#[serde(default)]
	pub created_at: i64,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LlmRequestCost {
	pub metadata_key: String,
	#[serde(rename = "type")]
	pub kind: CostKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cel_expression: Option<Expression>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum CostKind {
	InputToken,
	OutputToken,
	TotalToken,
	#[serde(rename = "CEL")]
	Cel,
}

/// Shared holder of the current snapshot. Transactions clone the inner `Arc`
/// once at stream start and never re-read mid-flight.
#[derive(Default)]
pub struct ConfigStore {
	current: ArcSwapOption<Config>,
}

impl ConfigStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn snapshot(&self) -> Option<Arc<Config>> {
		self.current.load_full()
	}

	pub fn swap(&self, cfg: Arc<Config>) {
		self.current.store(Some(cfg));
	}

	pub fn loaded(&self) -> bool {
		self.current.load().is_some()
	}
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
