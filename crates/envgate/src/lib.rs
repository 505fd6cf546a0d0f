pub mod auth;
pub mod client;
pub mod composite;
pub mod config;
pub mod environment;
pub mod gateway;
pub mod health;
pub mod http;
pub mod odata;
pub mod proxy;
pub mod ratelimit;
pub mod registry;
pub mod secrets;
pub mod sql;
pub mod types;
pub mod webhook;

pub use std::sync::Arc;
pub use std::time::Duration;

pub use gate_core::strng;
pub use gate_core::strng::Strng;
pub use macro_rules_attribute::apply;
pub use serde::{Deserialize, Deserializer, Serialize, Serializer};
pub use tracing::{debug, error, info, trace, warn};

/// Wire-facing types: camelCase on the wire, strict about unknown fields.
#[macro_export]
macro_rules! schema {
	($item:item) => {
		#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
		#[serde(rename_all = "camelCase", deny_unknown_fields)]
		$item
	};
}

/// On-disk settings files (`appsettings.json`, `entity.json`,
/// `environments/*/settings.json`): PascalCase keys, tolerant of extras so a
/// newer config file does not brick an older gateway.
#[macro_export]
macro_rules! settings {
	($item:item) => {
		#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
		#[serde(rename_all = "PascalCase")]
		$item
	};
}
