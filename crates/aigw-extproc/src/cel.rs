use std::fmt::{Debug, Formatter};

use cel::{Context, Program, Value};
use serde::{Deserialize, Serialize, Serializer};

use crate::types::TokenUsage;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("compile: {0}")]
	Compile(String),
	#[error("execution: {0}")]
	Eval(String),
	#[error("expression produced a non-numeric result")]
	NonNumeric,
	#[error("expression produced a negative result")]
	Negative,
}

/// A CEL cost program, compiled once when the config snapshot is built and
/// evaluated per terminal response. Never compiled on the request path.
pub struct Expression {
	program: Program,
	source: String,
}

impl Expression {
	pub fn new(source: impl Into<String>) -> Result<Self, Error> {
		let source = source.into();
		let program = Program::compile(&source).map_err(|e| Error::Compile(e.to_string()))?;
		Ok(Self { program, source })
	}

	pub fn source(&self) -> &str {
		&self.source
	}

	/// Evaluates the program over the request identity and final usage.
	/// The result must be numeric and non-negative.
	pub fn eval_cost(
		&self,
		model: &str,
		backend: &str,
		usage: TokenUsage,
	) -> Result<u64, Error> {
		let mut ctx = Context::default();
		ctx.add_variable_from_value("model", Value::String(std::sync::Arc::new(model.to_string())));
		ctx.add_variable_from_value(
			"backend",
			Value::String(std::sync::Arc::new(backend.to_string())),
		);
		ctx.add_variable_from_value("input_tokens", Value::Int(usage.input_tokens as i64));
		ctx.add_variable_from_value("output_tokens", Value::Int(usage.output_tokens as i64));
		ctx.add_variable_from_value("total_tokens", Value::Int(usage.total_tokens as i64));
		let out = self
			.program
			.execute(&ctx)
			.map_err(|e| Error::Eval(e.to_string()))?;
		match out {
			Value::Int(i) if i >= 0 => Ok(i as u64),
			Value::Int(_) => Err(Error::Negative),
			Value::UInt(u) => Ok(u),
			Value::Float(f) if f >= 0.0 => Ok(f as u64),
			Value::Float(_) => Err(Error::Negative),
			_ => Err(Error::NonNumeric),
		}
	}
}

impl Debug for Expression {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Expression")
			.field("expression", &self.source)
			.finish()
	}
}

impl Serialize for Expression {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.source)
	}
}

impl<'de> Deserialize<'de> for Expression {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let e = String::deserialize(deserializer)?;
		// Config CEL is strict: a bad program fails the whole snapshot load.
		Expression::new(e).map_err(|e| serde::de::Error::custom(e.to_string()))
	}
}
