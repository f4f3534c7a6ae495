use std::collections::HashMap;

use crate::config::HeaderMutationRule;
use crate::mutation;
use crate::proto::HeaderMutation;

/// Applies the backend's configured header rules and, on retry, restores
/// client headers that a previous attempt removed.
///
/// The original-header snapshot is taken by the router filter before any
/// mutation ran, so restoration sees what the client actually sent.
#[derive(Debug, Default)]
pub struct HeaderMutator {
	remove: Vec<String>,
	set: Vec<(String, String)>,
	original_headers: HashMap<String, String>,
}

impl HeaderMutator {
	pub fn new(rule: Option<&HeaderMutationRule>, original_headers: HashMap<String, String>) -> Self {
		let (remove, set) = match rule {
			Some(rule) => (
				rule.remove.iter().map(|r| r.to_ascii_lowercase()).collect(),
				rule
					.set
					.iter()
					.map(|p| (p.name.to_ascii_lowercase(), p.value.clone()))
					.collect(),
			),
			None => (Vec::new(), Vec::new()),
		};
		Self {
			remove,
			set,
			original_headers,
		}
	}

	/// Mutates the live header map and returns the equivalent wire mutation.
	pub fn mutate(
		&self,
		headers: &mut HashMap<String, String>,
		on_retry: bool,
	) -> HeaderMutation {
		let mut hm = HeaderMutation::default();
		for name in &self.remove {
			if headers.remove(name).is_some() {
				mutation::remove_header(&mut hm, name.clone());
			}
		}
		for (name, value) in &self.set {
			headers.insert(name.clone(), value.clone());
			mutation::set_header(&mut hm, name.clone(), value.clone().into_bytes());
		}
		if on_retry {
			for (name, value) in &self.original_headers {
				if self.remove.contains(name) {
					continue;
				}
				if self.set.iter().any(|(n, _)| n == name) {
					continue;
				}
				if headers.contains_key(name) {
					continue;
				}
				headers.insert(name.clone(), value.clone());
				mutation::set_header(&mut hm, name.clone(), value.clone().into_bytes());
			}
		}
		hm
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::HeaderPair;

	fn rule(set: &[(&str, &str)], remove: &[&str]) -> HeaderMutationRule {
		HeaderMutationRule {
			set: set
				.iter()
				.map(|(n, v)| HeaderPair {
					name: n.to_string(),
					value: v.to_string(),
				})
				.collect(),
			remove: remove.iter().map(|r| r.to_string()).collect(),
		}
	}

	fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
		pairs
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect()
	}

	#[test]
	fn removes_and_sets() {
		let original = headers(&[("authorization", "secret"), ("x-keep", "1")]);
		let m = HeaderMutator::new(
			Some(&rule(&[("x-new", "v")], &["authorization"])),
			original.clone(),
		);
		let mut live = original;
		let hm = m.mutate(&mut live, false);
		assert!(!live.contains_key("authorization"));
		assert_eq!(live.get("x-new").map(String::as_str), Some("v"));
		assert_eq!(hm.remove_headers, vec!["authorization"]);
		assert_eq!(
			mutation::get_set_header(&hm, "x-new"),
			Some(b"v".as_slice())
		);
	}

	#[test]
	fn remove_of_absent_header_emits_nothing() {
		let m = HeaderMutator::new(Some(&rule(&[], &["x-missing"])), HashMap::new());
		let mut live = headers(&[("x-keep", "1")]);
		let hm = m.mutate(&mut live, false);
		assert!(hm.remove_headers.is_empty());
	}

	#[test]
	fn idempotent_over_same_start() {
		let original = headers(&[("a", "1"), ("b", "2")]);
		let m = HeaderMutator::new(Some(&rule(&[("c", "3")], &["a"])), original.clone());

		let mut first = original.clone();
		m.mutate(&mut first, false);
		let mut second = original.clone();
		m.mutate(&mut second, false);
		m.mutate(&mut second, false);
		assert_eq!(first, second);
	}

	#[test]
	fn retry_restores_only_missing_unmanaged_headers() {
		let original = headers(&[
			("authorization", "secret"),
			("x-user", "u1"),
			("x-present", "p"),
		]);
		let m = HeaderMutator::new(
			Some(&rule(&[("x-new", "v")], &["authorization"])),
			original.clone(),
		);

		// First attempt consumed the headers; the retry arrives with x-user
		// dropped by the previous mutation round-trip.
		let mut live = headers(&[("x-present", "p")]);
		let hm = m.mutate(&mut live, true);

		// authorization is in the remove set: never restored.
		assert!(!live.contains_key("authorization"));
		// x-new is managed by set: present from the rule, not restoration.
		assert_eq!(live.get("x-new").map(String::as_str), Some("v"));
		// x-user was lost and unmanaged: restored from the snapshot.
		assert_eq!(live.get("x-user").map(String::as_str), Some("u1"));
		assert_eq!(
			mutation::get_set_header(&hm, "x-user"),
			Some(b"u1".as_slice())
		);
		// x-present survived: not duplicated in the mutation.
		let set_count = hm
			.set_headers
			.iter()
			.filter(|o| o.header.as_ref().is_some_and(|h| h.key == "x-present"))
			.count();
		assert_eq!(set_count, 0);
	}

	#[test]
	fn no_rule_is_a_noop_until_retry() {
		let original = headers(&[("x-a", "1")]);
		let m = HeaderMutator::new(None, original);
		let mut live = HashMap::new();
		let hm = m.mutate(&mut live, false);
		assert!(hm.set_headers.is_empty() && hm.remove_headers.is_empty());

		let hm = m.mutate(&mut live, true);
		assert_eq!(mutation::get_set_header(&hm, "x-a"), Some(b"1".as_slice()));
	}
}
