//! Token scope and environment matching.
//!
//! Scopes are stored as a CSV. An entry matches when it is `*`, equals the
//! requested name case-insensitively, or ends in `*` and the prefix matches
//! case-insensitively. Composite endpoints are addressed as
//! `composite/<name>`, webhooks as `webhook/<name>`.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeSet {
	entries: Vec<String>,
}

impl ScopeSet {
	pub fn parse(csv: &str) -> Self {
		Self {
			entries: csv
				.split(',')
				.map(|s| s.trim())
				.filter(|s| !s.is_empty())
				.map(|s| s.to_string())
				.collect(),
		}
	}

	pub fn allows(&self, name: &str) -> bool {
		self.entries.iter().any(|entry| entry_matches(entry, name))
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// The stored form, for 403 bodies.
	pub fn as_csv(&self) -> String {
		self.entries.join(",")
	}
}

fn entry_matches(entry: &str, name: &str) -> bool {
	if entry == "*" {
		return true;
	}
	if let Some(prefix) = entry.strip_suffix('*') {
		// `get` instead of slicing: the boundary may fall inside a multi-byte
		// character of the requested name.
		return name
			.get(..prefix.len())
			.is_some_and(|head| head.eq_ignore_ascii_case(prefix));
	}
	entry.eq_ignore_ascii_case(name)
}
