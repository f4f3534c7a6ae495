use std::collections::HashMap;

use crate::config::BackendAuthConfig;
use crate::mutation;
use crate::proto::{BodyMutation, HeaderMutation};

pub mod aws;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("credential material missing: {0}")]
	MissingCredential(String),
	#[error("signing failed: {0}")]
	Signing(String),
}

/// Injects backend credentials into the outgoing mutation. Runs after the
/// translator so the AWS variant signs exactly the bytes that leave the
/// gateway.
#[derive(Debug)]
pub enum Handler {
	ApiKey { key: String },
	Aws(aws::AwsHandler),
	Azure { access_token: String },
	Gcp { access_token: String },
}

impl Handler {
	pub fn new(cfg: &BackendAuthConfig) -> Result<Self, Error> {
		Ok(match cfg {
			BackendAuthConfig::ApiKey { key } => Handler::ApiKey {
				key: key.trim().to_string(),
			},
			BackendAuthConfig::Aws {
				region,
				credential_literal,
			} => Handler::Aws(aws::AwsHandler::new(region.clone(), credential_literal)?),
			BackendAuthConfig::Azure { access_token } => Handler::Azure {
				access_token: access_token.trim().to_string(),
			},
			BackendAuthConfig::Gcp { access_token, .. } => Handler::Gcp {
				access_token: access_token.trim().to_string(),
			},
		})
	}

	pub fn do_auth(
		&self,
		request_headers: &mut HashMap<String, String>,
		header_mut: &mut HeaderMutation,
		body_mut: Option<&BodyMutation>,
	) -> Result<(), Error> {
		match self {
			Handler::ApiKey { key } => {
				set_bearer(request_headers, header_mut, key);
				Ok(())
			},
			Handler::Azure { access_token } | Handler::Gcp { access_token } => {
				set_bearer(request_headers, header_mut, access_token);
				Ok(())
			},
			Handler::Aws(h) => h.do_auth(request_headers, header_mut, body_mut),
		}
	}
}

fn set_bearer(
	request_headers: &mut HashMap<String, String>,
	header_mut: &mut HeaderMutation,
	token: &str,
) {
	let value = format!("Bearer {token}");
	request_headers.insert("authorization".to_string(), value.clone());
	mutation::set_header(header_mut, "authorization", value.into_bytes());
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn api_key_sets_bearer() {
		let h = Handler::new(&BackendAuthConfig::ApiKey {
			key: " sk-test \n".to_string(),
		})
		.unwrap();
		let mut headers = HashMap::new();
		let mut hm = HeaderMutation::default();
		h.do_auth(&mut headers, &mut hm, None).unwrap();
		assert_eq!(headers.get("authorization").unwrap(), "Bearer sk-test");
		assert_eq!(
			mutation::get_set_header(&hm, "authorization"),
			Some(b"Bearer sk-test".as_slice())
		);
	}

	#[test]
	fn gcp_bearer_from_rotated_token() {
		let h = Handler::new(&BackendAuthConfig::Gcp {
			access_token: "ya29.tok".to_string(),
			region: "us-central1".to_string(),
			project_name: "p".to_string(),
		})
		.unwrap();
		let mut headers = HashMap::new();
		let mut hm = HeaderMutation::default();
		h.do_auth(&mut headers, &mut hm, None).unwrap();
		assert_eq!(
			mutation::get_set_header(&hm, "authorization"),
			Some(b"Bearer ya29.tok".as_slice())
		);
	}
}
