//! Environment resolution: `env` path segment to connection string and
//! server name.
//!
//! Secrets are tried first when a remote store is configured; the local
//! `environments/<env>/settings.json` is the fallback and the common case in
//! development. Resolved entries are cached for the process lifetime —
//! rolling credentials means restarting the gateway.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::{Mutex, OnceCell};

use crate::secrets::SecretStore;
use crate::*;

#[cfg(test)]
#[path = "environment_tests.rs"]
mod tests;

#[derive(thiserror::Error, Debug)]
pub enum EnvironmentError {
	#[error("unknown environment `{0}`")]
	Unknown(String),

	#[error("environment `{0}` has no connection string")]
	MissingConnectionString(String),

	#[error("failed to read environment settings: {0}")]
	Io(#[from] std::io::Error),

	#[error("invalid environment settings: {0}")]
	Parse(#[from] serde_json::Error),
}

/// `environments/<env>/settings.json`.
#[apply(settings!)]
pub struct EnvironmentSettings {
	#[serde(default)]
	pub server_name: Option<String>,
	#[serde(default)]
	pub connection_string: Option<String>,
}

/// `environments/settings.json`.
#[apply(settings!)]
#[derive(Default)]
pub struct EnvironmentsFile {
	#[serde(default)]
	pub environment: EnvironmentsSection,
}

#[apply(settings!)]
#[derive(Default)]
pub struct EnvironmentsSection {
	#[serde(default)]
	pub server_name: Option<String>,
	#[serde(default)]
	pub allowed_environments: Vec<String>,
}

#[derive(Clone)]
pub struct ResolvedEnvironment {
	pub name: Strng,
	pub server_name: String,
	pub connection_string: String,
}

impl std::fmt::Debug for ResolvedEnvironment {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ResolvedEnvironment")
			.field("name", &self.name)
			.field("server_name", &self.server_name)
			.field(
				"connection_string",
				&sanitize_connection_string(&self.connection_string),
			)
			.finish()
	}
}

type CacheCell = Arc<OnceCell<Arc<ResolvedEnvironment>>>;

pub struct EnvironmentResolver {
	root: PathBuf,
	secrets: Option<Arc<dyn SecretStore>>,
	/// Envs that may ever be resolved; empty means unrestricted.
	allowed: Vec<String>,
	cache: Mutex<HashMap<Strng, CacheCell>>,
}

impl EnvironmentResolver {
	pub fn new(root: impl Into<PathBuf>, secrets: Option<Arc<dyn SecretStore>>) -> Self {
		let root = root.into();
		let allowed = read_allowed(&root);
		if !allowed.is_empty() {
			info!(environments = ?allowed, "environment allow-list active");
		}
		Self {
			root,
			secrets,
			allowed,
			cache: Mutex::new(HashMap::new()),
		}
	}

	pub async fn resolve(
		&self,
		env: &str,
	) -> Result<Arc<ResolvedEnvironment>, EnvironmentError> {
		let key = strng::new(env);
		let cell = {
			let mut cache = self.cache.lock().await;
			cache.entry(key.clone()).or_default().clone()
		};
		// Per-key single flight: concurrent first lookups of the same env run
		// the resolution once; failures leave the cell empty for a retry.
		cell
			.get_or_try_init(|| self.resolve_uncached(env))
			.await
			.map(|resolved| resolved.clone())
	}

	/// Environments that have been resolved so far (for health reporting).
	pub async fn cached(&self) -> Vec<Arc<ResolvedEnvironment>> {
		let cache = self.cache.lock().await;
		cache.values().filter_map(|c| c.get().cloned()).collect()
	}

	async fn resolve_uncached(
		&self,
		env: &str,
	) -> Result<Arc<ResolvedEnvironment>, EnvironmentError> {
		if !self.allowed.is_empty()
			&& !self.allowed.iter().any(|a| a.eq_ignore_ascii_case(env))
		{
			return Err(EnvironmentError::Unknown(env.to_string()));
		}
		if let Some(secrets) = &self.secrets {
			match self.resolve_remote(secrets.as_ref(), env).await {
				Ok(Some(resolved)) => return Ok(Arc::new(resolved)),
				Ok(None) => {
					debug!(env, "secrets missing for environment, using local settings");
				},
				Err(e) => {
					warn!(env, error = %e, "secret store lookup failed, using local settings");
				},
			}
		}
		self.resolve_local(env).map(Arc::new)
	}

	async fn resolve_remote(
		&self,
		secrets: &dyn SecretStore,
		env: &str,
	) -> Result<Option<ResolvedEnvironment>, crate::secrets::SecretError> {
		let Some(connection_string) = secrets.get(&format!("{env}-ConnectionString")).await?
		else {
			return Ok(None);
		};
		let server_name = secrets
			.get(&format!("{env}-ServerName"))
			.await?
			.unwrap_or_else(|| env.to_string());
		info!(env, "environment resolved from secret store");
		Ok(Some(ResolvedEnvironment {
			name: strng::new(env),
			server_name,
			connection_string,
		}))
	}

	fn resolve_local(&self, env: &str) -> Result<ResolvedEnvironment, EnvironmentError> {
		let path = self.root.join(env).join("settings.json");
		let raw = std::fs::read_to_string(&path)
			.map_err(|_| EnvironmentError::Unknown(env.to_string()))?;
		let settings: EnvironmentSettings = serde_json::from_str(&raw)?;
		let connection_string = settings
			.connection_string
			.filter(|c| !c.trim().is_empty())
			.ok_or_else(|| EnvironmentError::MissingConnectionString(env.to_string()))?;
		info!(env, path = %path.display(), "environment resolved from local settings");
		Ok(ResolvedEnvironment {
			name: strng::new(env),
			server_name: settings.server_name.unwrap_or_else(|| env.to_string()),
			connection_string,
		})
	}
}

fn read_allowed(root: &Path) -> Vec<String> {
	let path = root.join("settings.json");
	let Ok(raw) = std::fs::read_to_string(&path) else {
		return Vec::new();
	};
	match serde_json::from_str::<EnvironmentsFile>(&raw) {
		Ok(file) => file.environment.allowed_environments,
		Err(e) => {
			warn!(path = %path.display(), error = %e, "invalid environments/settings.json, ignoring");
			Vec::new()
		},
	}
}

/// Masks credentials for logging. `server`/`database` style keys keep their
/// values so operators can still tell which upstream a log line refers to.
pub fn sanitize_connection_string(conn: &str) -> String {
	conn
		.split(';')
		.filter(|part| !part.trim().is_empty())
		.map(|part| match part.split_once('=') {
			Some((key, value)) => {
				let k = key.trim().to_ascii_lowercase();
				match k.as_str() {
					"password" | "pwd" => format!("{}=***", key.trim()),
					"server" | "data source" | "database" | "initial catalog" => {
						format!("{}={}", key.trim(), value.trim())
					},
					_ => format!("{}=***", key.trim()),
				}
			},
			None => part.trim().to_string(),
		})
		.collect::<Vec<_>>()
		.join(";")
}
