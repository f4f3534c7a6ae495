use std::collections::{BTreeMap, HashMap};

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;

use super::Error;
use crate::mutation;
use crate::proto::{BodyMutation, HeaderMutation};

type HmacSha256 = Hmac<Sha256>;

const SERVICE: &str = "bedrock";

/// SigV4 signer for AWS Bedrock. Signs the mutated `:path` and the mutated
/// body, i.e. what the translator just produced, against
/// `bedrock-runtime.<region>.amazonaws.com`.
///
/// `Content-Length` is never part of the signed header set: the filter strips
/// it so the proxy sends the rewritten body with chunked transfer encoding,
/// and a signed length would no longer match.
#[derive(Debug, Clone)]
pub struct AwsHandler {
	credentials: Credentials,
	region: String,
}

#[derive(Debug, Clone)]
struct Credentials {
	access_key_id: String,
	secret_access_key: String,
	session_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SigV4Timestamp {
	pub amz_date: String,
	pub date: String,
}

impl SigV4Timestamp {
	pub fn now() -> Result<Self, Error> {
		Self::from_datetime(OffsetDateTime::now_utc())
	}

	pub fn from_datetime(datetime: OffsetDateTime) -> Result<Self, Error> {
		const AMZ_FORMAT: &[FormatItem<'_>] =
			format_description!("[year][month][day]T[hour][minute][second]Z");
		const DATE_FORMAT: &[FormatItem<'_>] = format_description!("[year][month][day]");
		let amz_date = datetime
			.format(AMZ_FORMAT)
			.map_err(|e| Error::Signing(format!("format amz date: {e}")))?;
		let date = datetime
			.format(DATE_FORMAT)
			.map_err(|e| Error::Signing(format!("format date: {e}")))?;
		Ok(Self { amz_date, date })
	}

	#[cfg(test)]
	pub fn from_amz_date(amz_date: &str) -> Self {
		Self {
			amz_date: amz_date.to_string(),
			date: amz_date[..8].to_string(),
		}
	}
}

impl AwsHandler {
	pub fn new(region: String, credential_literal: &str) -> Result<Self, Error> {
		if region.trim().is_empty() {
			return Err(Error::MissingCredential("aws region".to_string()));
		}
		let credentials = parse_credential_file(credential_literal)?;
		Ok(Self {
			credentials,
			region,
		})
	}

	pub fn do_auth(
		&self,
		request_headers: &mut HashMap<String, String>,
		header_mut: &mut HeaderMutation,
		body_mut: Option<&BodyMutation>,
	) -> Result<(), Error> {
		let method = request_headers
			.get(":method")
			.cloned()
			.unwrap_or_else(|| "POST".to_string());
		// The translator sets :path in the header mutation; fall back to the
		// original path for passthrough bodies.
		let path = mutation::get_set_header(header_mut, ":path")
			.map(|p| String::from_utf8_lossy(p).to_string())
			.or_else(|| request_headers.get(":path").cloned())
			.ok_or_else(|| Error::Signing("no :path to sign".to_string()))?;
		let body = body_mut.map(mutation::body_bytes).unwrap_or_default();

		let signed = self.sign(&method, &path, body, SigV4Timestamp::now()?)?;
		for (key, value) in signed {
			request_headers.insert(key.to_ascii_lowercase(), value.clone());
			mutation::set_header(header_mut, key, value.into_bytes());
		}
		Ok(())
	}

	/// Computes the signature headers for one request. The path must already
	/// be URI-encoded (it is signed byte for byte, exactly as sent).
	pub fn sign(
		&self,
		method: &str,
		path: &str,
		body: &[u8],
		timestamp: SigV4Timestamp,
	) -> Result<Vec<(String, String)>, Error> {
		let host = format!("bedrock-runtime.{}.amazonaws.com", self.region);
		let (canonical_uri, canonical_query) = split_path(path);

		let payload_hash = hex::encode(Sha256::digest(body));
		let mut headers = BTreeMap::new();
		headers.insert("host".to_string(), host.clone());
		headers.insert("x-amz-content-sha256".to_string(), payload_hash.clone());
		headers.insert("x-amz-date".to_string(), timestamp.amz_date.clone());
		if let Some(token) = &self.credentials.session_token {
			headers.insert("x-amz-security-token".to_string(), token.clone());
		}

		let mut canonical_headers = String::new();
		let mut signed_headers = Vec::new();
		for (name, value) in &headers {
			canonical_headers.push_str(name);
			canonical_headers.push(':');
			canonical_headers.push_str(value);
			canonical_headers.push('\n');
			signed_headers.push(name.as_str());
		}
		let signed_headers = signed_headers.join(";");

		let canonical_request = format!(
			"{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
		);
		let scope = format!("{}/{}/{SERVICE}/aws4_request", timestamp.date, self.region);
		let string_to_sign = format!(
			"AWS4-HMAC-SHA256\n{}\n{scope}\n{}",
			timestamp.amz_date,
			hex::encode(Sha256::digest(canonical_request.as_bytes()))
		);

		let k_date = hmac_sha256(
			format!("AWS4{}", self.credentials.secret_access_key).as_bytes(),
			timestamp.date.as_bytes(),
		)?;
		let k_region = hmac_sha256(&k_date, self.region.as_bytes())?;
		let k_service = hmac_sha256(&k_region, SERVICE.as_bytes())?;
		let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
		let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?);

		let authorization = format!(
			"AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
			self.credentials.access_key_id
		);

		let mut out = vec![
			("Authorization".to_string(), authorization),
			("X-Amz-Date".to_string(), timestamp.amz_date),
			("X-Amz-Content-Sha256".to_string(), payload_hash),
		];
		if let Some(token) = &self.credentials.session_token {
			out.push(("X-Amz-Security-Token".to_string(), token.clone()));
		}
		Ok(out)
	}
}

fn split_path(path: &str) -> (&str, String) {
	match path.split_once('?') {
		Some((uri, query)) => {
			let mut pairs: Vec<&str> = query.split('&').collect();
			pairs.sort_unstable();
			(uri, pairs.join("&"))
		},
		None => (path, String::new()),
	}
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, Error> {
	let mut mac = HmacSha256::new_from_slice(key)
		.map_err(|e| Error::Signing(format!("invalid hmac key: {e}")))?;
	mac.update(data);
	Ok(mac.finalize().into_bytes().to_vec())
}

/// Parses the shared-credentials file literal written by the STS rotator.
fn parse_credential_file(literal: &str) -> Result<Credentials, Error> {
	let mut access_key_id = None;
	let mut secret_access_key = None;
	let mut session_token = None;
	for line in literal.lines() {
		let line = line.trim();
		if line.is_empty() || line.starts_with('[') || line.starts_with('#') {
			continue;
		}
		let Some((key, value)) = line.split_once('=') else {
			continue;
		};
		let value = value.trim().to_string();
		match key.trim() {
			"aws_access_key_id" => access_key_id = Some(value),
			"aws_secret_access_key" => secret_access_key = Some(value),
			"aws_session_token" => session_token = Some(value),
			_ => {},
		}
	}
	Ok(Credentials {
		access_key_id: access_key_id
			.ok_or_else(|| Error::MissingCredential("aws_access_key_id".to_string()))?,
		secret_access_key: secret_access_key
			.ok_or_else(|| Error::MissingCredential("aws_secret_access_key".to_string()))?,
		session_token,
	})
}

#[cfg(test)]
#[path = "aws_tests.rs"]
mod tests;
