//! Directory-backed endpoint catalogue.
//!
//! Each load walks `endpoints/<Kind>/<Name>/entity.json` and produces a full
//! `EndpointSet`; the set is published through an atomic pointer swap so a
//! request either sees the complete old catalogue or the complete new one.
//! The loader never performs I/O between building the set and swapping it.

pub mod watcher;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use gate_core::arc::Atomic;

use crate::types::endpoint::{
	CompositeEndpoint, EndpointKind, ProxyEndpoint, RawProxyEntity, RawSqlEntity,
	RawWebhookEntity, SqlEndpoint, WebhookEndpoint,
};
use crate::*;

const ENTITY_FILE: &str = "entity.json";

/// Immutable snapshot of every known endpoint, keyed by lowercased name.
#[derive(Debug, Default)]
pub struct EndpointSet {
	pub sql: HashMap<String, Arc<SqlEndpoint>>,
	pub proxy: HashMap<String, Arc<ProxyEndpoint>>,
	pub composite: HashMap<String, Arc<CompositeEndpoint>>,
	pub webhook: HashMap<String, Arc<WebhookEndpoint>>,
	/// Endpoints whose files exist but did not validate this load.
	pub load_errors: Vec<LoadFailure>,
}

#[apply(schema!)]
pub struct LoadFailure {
	pub kind: String,
	pub name: String,
	pub error: String,
}

impl EndpointSet {
	pub fn lookup_sql(&self, name: &str) -> Option<Arc<SqlEndpoint>> {
		self.sql.get(&name.to_ascii_lowercase()).cloned()
	}

	pub fn lookup_proxy(&self, name: &str) -> Option<Arc<ProxyEndpoint>> {
		self.proxy.get(&name.to_ascii_lowercase()).cloned()
	}

	pub fn lookup_composite(&self, name: &str) -> Option<Arc<CompositeEndpoint>> {
		self.composite.get(&name.to_ascii_lowercase()).cloned()
	}

	pub fn lookup_webhook(&self, name: &str) -> Option<Arc<WebhookEndpoint>> {
		self.webhook.get(&name.to_ascii_lowercase()).cloned()
	}

	pub fn list(&self, kind: EndpointKind) -> Vec<Strng> {
		let mut names: Vec<Strng> = match kind {
			EndpointKind::Sql => self.sql.values().map(|e| e.name.clone()).collect(),
			EndpointKind::Proxy => self.proxy.values().map(|e| e.name.clone()).collect(),
			EndpointKind::Composite => self.composite.values().map(|e| e.name.clone()).collect(),
			EndpointKind::Webhook => self.webhook.values().map(|e| e.name.clone()).collect(),
		};
		names.sort();
		names
	}

	pub fn total(&self) -> usize {
		self.sql.len() + self.proxy.len() + self.composite.len() + self.webhook.len()
	}
}

pub struct EndpointRegistry {
	root: PathBuf,
	current: Atomic<EndpointSet>,
}

impl EndpointRegistry {
	/// Initial load. Parse failures are per-endpoint and non-fatal; a missing
	/// root yields an empty catalogue (the watcher picks it up later).
	pub fn load(root: impl Into<PathBuf>) -> Self {
		let root = root.into();
		let set = load_set(&root, None);
		info!(
			root = %root.display(),
			endpoints = set.total(),
			errors = set.load_errors.len(),
			"endpoint registry loaded"
		);
		Self {
			current: gate_core::arc::new(set),
			root,
		}
	}

	pub fn snapshot(&self) -> Arc<EndpointSet> {
		self.current.load_full()
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	/// Rebuild from disk and swap. Endpoints that fail to reparse keep their
	/// previous definition.
	pub fn reload(&self) {
		let previous = self.snapshot();
		let next = load_set(&self.root, Some(&previous));
		debug!(
			endpoints = next.total(),
			errors = next.load_errors.len(),
			"endpoint registry reloaded"
		);
		self.current.store(Arc::new(next));
	}
}

fn load_set(root: &Path, previous: Option<&EndpointSet>) -> EndpointSet {
	let mut set = EndpointSet::default();
	load_kind(root, "SQL", &mut set, previous);
	load_kind(root, "Proxy", &mut set, previous);
	load_kind(root, "Webhooks", &mut set, previous);
	if root.join("Files").is_dir() {
		// File/binary storage endpoints are served by a collaborator.
		debug!("skipping endpoints/Files");
	}
	set
}

fn load_kind(root: &Path, kind: &str, set: &mut EndpointSet, previous: Option<&EndpointSet>) {
	let dir = root.join(kind);
	let entries = match std::fs::read_dir(&dir) {
		Ok(entries) => entries,
		Err(_) => return,
	};
	for entry in entries.flatten() {
		let path = entry.path();
		if !path.is_dir() {
			continue;
		}
		let Some(name) = path.file_name().and_then(|n| n.to_str()).map(strng::new) else {
			continue;
		};
		let file = path.join(ENTITY_FILE);
		if !file.is_file() {
			continue;
		}
		match load_entity(kind, &file, name.clone()) {
			Ok(loaded) => loaded.insert_into(set),
			Err(e) => {
				warn!(kind, endpoint = %name, error = %e, "failed to load endpoint definition");
				set.load_errors.push(LoadFailure {
					kind: kind.to_string(),
					name: name.to_string(),
					error: e.to_string(),
				});
				// Keep serving the last good definition, if any.
				if let Some(prev) = previous {
					Loaded::carry_over(prev, kind, &name, set);
				}
			},
		}
	}
}

enum Loaded {
	Sql(SqlEndpoint),
	Proxy(ProxyEndpoint),
	Composite(CompositeEndpoint),
	Webhook(WebhookEndpoint),
}

impl Loaded {
	fn insert_into(self, set: &mut EndpointSet) {
		match self {
			Loaded::Sql(e) => {
				set.sql.insert(e.name.to_ascii_lowercase(), Arc::new(e));
			},
			Loaded::Proxy(e) => {
				set.proxy.insert(e.name.to_ascii_lowercase(), Arc::new(e));
			},
			Loaded::Composite(e) => {
				set
					.composite
					.insert(e.name.to_ascii_lowercase(), Arc::new(e));
			},
			Loaded::Webhook(e) => {
				set.webhook.insert(e.name.to_ascii_lowercase(), Arc::new(e));
			},
		}
	}

	fn carry_over(prev: &EndpointSet, kind: &str, name: &Strng, set: &mut EndpointSet) {
		let key = name.to_ascii_lowercase();
		match kind {
			"SQL" => {
				if let Some(e) = prev.sql.get(&key) {
					set.sql.insert(key, e.clone());
				}
			},
			"Proxy" => {
				if let Some(e) = prev.proxy.get(&key) {
					set.proxy.insert(key.clone(), e.clone());
				}
				if let Some(e) = prev.composite.get(&key) {
					set.composite.insert(key, e.clone());
				}
			},
			"Webhooks" => {
				if let Some(e) = prev.webhook.get(&key) {
					set.webhook.insert(key, e.clone());
				}
			},
			_ => {},
		}
	}
}

fn load_entity(
	kind: &str,
	file: &Path,
	name: Strng,
) -> Result<Loaded, crate::types::endpoint::EndpointLoadError> {
	let raw = std::fs::read_to_string(file)?;
	match kind {
		"SQL" => {
			let entity: RawSqlEntity = serde_json::from_str(&raw)?;
			Ok(Loaded::Sql(entity.validate(name)?))
		},
		"Proxy" => {
			let entity: RawProxyEntity = serde_json::from_str(&raw)?;
			if entity.is_composite() {
				Ok(Loaded::Composite(entity.validate_composite(name)?))
			} else {
				Ok(Loaded::Proxy(entity.validate_proxy(name)?))
			}
		},
		"Webhooks" => {
			let entity: RawWebhookEntity = serde_json::from_str(&raw)?;
			Ok(Loaded::Webhook(entity.validate(name)?))
		},
		other => unreachable!("unknown endpoint kind directory {other}"),
	}
}
