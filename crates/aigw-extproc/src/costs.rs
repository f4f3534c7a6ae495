use crate::cel;
use crate::config::{Config, CostKind};
use crate::proto::Struct;
use crate::mutation;
use crate::types::TokenUsage;

/// Evaluates every configured request cost against the final usage and lays
/// the results out as the dynamic-metadata struct for the configured
/// namespace. The `backend_name` and `model_name_override` identifiers ride
/// along for downstream rate-limit keys.
pub fn build_metadata(
	config: &Config,
	backend_name: &str,
	model_name_override: Option<&str>,
	model: &str,
	usage: TokenUsage,
) -> Result<Struct, cel::Error> {
	let mut fields = Vec::new();
	for cost in &config.llm_request_costs {
		let value = match cost.kind {
			CostKind::InputToken => usage.input_tokens,
			CostKind::OutputToken => usage.output_tokens,
			CostKind::TotalToken => usage.total_tokens,
			CostKind::Cel => {
				let expr = cost
					.cel_expression
					.as_ref()
					.expect("validated at config load");
				expr.eval_cost(model, backend_name, usage)?
			},
		};
		fields.push((cost.metadata_key.clone(), mutation::number_value(value as f64)));
	}
	fields.push((
		"backend_name".to_string(),
		mutation::string_value(backend_name),
	));
	// Always present so rate-limit descriptors can key off a fixed path;
	// empty when the backend has no override.
	fields.push((
		"model_name_override".to_string(),
		mutation::string_value(model_name_override.unwrap_or_default()),
	));
	Ok(mutation::struct_of(fields))
}
