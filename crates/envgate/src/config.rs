use std::path::{Path, PathBuf};

use crate::*;

/// Gateway configuration, read from `appsettings.json`.
///
/// Sections not listed here (`Swagger`, editor metadata, ...) belong to
/// collaborators and are ignored rather than rejected.
#[apply(settings!)]
pub struct Config {
	#[serde(default)]
	pub rate_limiting: RateLimiting,
	#[serde(default)]
	pub request_traffic_logging: RequestTrafficLogging,
	#[serde(default)]
	pub logging: Logging,
	#[serde(default)]
	pub request: RequestLimits,
	#[serde(default)]
	pub proxy: ProxyLimits,
	#[serde(default)]
	pub sql: SqlSettings,
	#[serde(default)]
	pub auth: AuthSettings,
	#[serde(default = "defaults::endpoints_dir")]
	pub endpoints_directory: PathBuf,
	#[serde(default = "defaults::environments_dir")]
	pub environments_directory: PathBuf,
	#[serde(default = "defaults::listen")]
	pub listen: String,
	#[serde(default = "defaults::allowed_hosts")]
	pub allowed_hosts: String,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			rate_limiting: RateLimiting::default(),
			request_traffic_logging: RequestTrafficLogging::default(),
			logging: Logging::default(),
			request: RequestLimits::default(),
			proxy: ProxyLimits::default(),
			sql: SqlSettings::default(),
			auth: AuthSettings::default(),
			endpoints_directory: defaults::endpoints_dir(),
			environments_directory: defaults::environments_dir(),
			listen: defaults::listen(),
			allowed_hosts: defaults::allowed_hosts(),
		}
	}
}

#[apply(settings!)]
pub struct RateLimiting {
	#[serde(default = "defaults::enabled")]
	pub enabled: bool,
	#[serde(default = "defaults::ip_limit")]
	pub ip_limit: u32,
	#[serde(default = "defaults::window_seconds")]
	pub ip_window_seconds: u64,
	#[serde(default = "defaults::token_limit")]
	pub token_limit: u32,
	#[serde(default = "defaults::window_seconds")]
	pub token_window_seconds: u64,
}

impl Default for RateLimiting {
	fn default() -> Self {
		Self {
			enabled: true,
			ip_limit: defaults::ip_limit(),
			ip_window_seconds: defaults::window_seconds(),
			token_limit: defaults::token_limit(),
			token_window_seconds: defaults::window_seconds(),
		}
	}
}

#[apply(settings!)]
pub struct RequestTrafficLogging {
	#[serde(default = "defaults::enabled")]
	pub enabled: bool,
}

impl Default for RequestTrafficLogging {
	fn default() -> Self {
		Self { enabled: true }
	}
}

#[apply(settings!)]
pub struct Logging {
	/// When unset, file logging is disabled and only stderr is used.
	#[serde(default)]
	pub directory: Option<PathBuf>,
	#[serde(default = "defaults::max_retained_files")]
	pub max_retained_files: usize,
}

impl Default for Logging {
	fn default() -> Self {
		Self {
			directory: None,
			max_retained_files: defaults::max_retained_files(),
		}
	}
}

#[apply(settings!)]
pub struct RequestLimits {
	/// Per-request deadline shared by SQL, proxy, and composite work.
	#[serde(default = "defaults::timeout_seconds")]
	pub timeout_seconds: u64,
	/// Largest request/response body the gateway will buffer for inspection
	/// (proxy URL rewriting, composite payloads).
	#[serde(default = "defaults::max_buffered_body")]
	pub max_buffered_body: usize,
}

impl Default for RequestLimits {
	fn default() -> Self {
		Self {
			timeout_seconds: defaults::timeout_seconds(),
			max_buffered_body: defaults::max_buffered_body(),
		}
	}
}

impl RequestLimits {
	pub fn timeout(&self) -> Duration {
		Duration::from_secs(self.timeout_seconds)
	}
}

#[apply(settings!)]
pub struct ProxyLimits {
	/// Upper bound on concurrent upstream calls per proxy endpoint.
	#[serde(default = "defaults::max_inflight")]
	pub max_inflight_per_endpoint: usize,
	/// Append the client address to `X-Forwarded-For`.
	#[serde(default = "defaults::enabled")]
	pub forwarded_headers: bool,
}

impl Default for ProxyLimits {
	fn default() -> Self {
		Self {
			max_inflight_per_endpoint: defaults::max_inflight(),
			forwarded_headers: true,
		}
	}
}

#[apply(settings!)]
pub struct SqlSettings {
	#[serde(default = "defaults::pool_size")]
	pub pool_size: usize,
	/// Connections opened eagerly when a pool is created.
	#[serde(default = "defaults::warm_connections")]
	pub warm_connections: usize,
	#[serde(default = "defaults::status_log_interval_seconds")]
	pub status_log_interval_seconds: u64,
	#[serde(default = "defaults::default_top")]
	pub default_top: usize,
}

impl Default for SqlSettings {
	fn default() -> Self {
		Self {
			pool_size: defaults::pool_size(),
			warm_connections: defaults::warm_connections(),
			status_log_interval_seconds: defaults::status_log_interval_seconds(),
			default_top: defaults::default_top(),
		}
	}
}

#[apply(settings!)]
pub struct AuthSettings {
	#[serde(default = "defaults::token_store_path")]
	pub token_store_path: PathBuf,
}

impl Default for AuthSettings {
	fn default() -> Self {
		Self {
			token_store_path: defaults::token_store_path(),
		}
	}
}

impl Config {
	pub fn load(path: &Path) -> anyhow::Result<Self> {
		let raw = fs_err::read_to_string(path)?;
		let cfg: Config = serde_json::from_str(&raw)?;
		Ok(cfg)
	}

	/// Remote secret store location; unset disables remote resolution.
	pub fn secret_store_uri() -> Option<String> {
		std::env::var("SECRET_STORE_URI")
			.ok()
			.filter(|v| !v.trim().is_empty())
	}
}

pub mod defaults {
	use std::path::PathBuf;

	pub fn enabled() -> bool {
		true
	}
	pub fn ip_limit() -> u32 {
		100
	}
	pub fn token_limit() -> u32 {
		1000
	}
	pub fn window_seconds() -> u64 {
		60
	}
	pub fn max_retained_files() -> usize {
		10
	}
	pub fn timeout_seconds() -> u64 {
		30
	}
	pub fn max_buffered_body() -> usize {
		2_097_152
	}
	pub fn max_inflight() -> usize {
		64
	}
	pub fn pool_size() -> usize {
		8
	}
	pub fn warm_connections() -> usize {
		2
	}
	pub fn status_log_interval_seconds() -> u64 {
		60
	}
	pub fn default_top() -> usize {
		10
	}
	pub fn token_store_path() -> PathBuf {
		PathBuf::from("auth.db")
	}
	pub fn endpoints_dir() -> PathBuf {
		PathBuf::from("endpoints")
	}
	pub fn environments_dir() -> PathBuf {
		PathBuf::from("environments")
	}
	pub fn listen() -> String {
		"0.0.0.0:8080".to_string()
	}
	pub fn allowed_hosts() -> String {
		"*".to_string()
	}
}
