//! Endpoint definitions, parsed from `endpoints/<Kind>/<Name>/entity.json`.
//!
//! The on-disk shape is the `Raw*` structs; validation turns them into the
//! checked forms the executors run against. The endpoint name is never part
//! of the file — it is the directory name.

use std::collections::BTreeMap;

use ::http::Method;
use url::Url;

use crate::*;

#[cfg(test)]
#[path = "endpoint_tests.rs"]
mod tests;

#[derive(thiserror::Error, Debug)]
pub enum EndpointLoadError {
	#[error("invalid endpoint file: {0}")]
	Parse(#[from] serde_json::Error),

	#[error("failed to read endpoint file: {0}")]
	Io(#[from] std::io::Error),

	#[error("missing required field `{0}`")]
	MissingField(&'static str),

	#[error("invalid target url `{url}`: {reason}")]
	InvalidUrl { url: String, reason: String },

	#[error("unknown HTTP method `{0}`")]
	UnknownMethod(String),

	#[error("composite step `{step}`: {reason}")]
	InvalidStep { step: String, reason: String },

	#[error("composite has no steps")]
	EmptyComposite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
	Sql,
	Proxy,
	Composite,
	Webhook,
}

impl std::fmt::Display for EndpointKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			EndpointKind::Sql => write!(f, "SQL"),
			EndpointKind::Proxy => write!(f, "Proxy"),
			EndpointKind::Composite => write!(f, "Composite"),
			EndpointKind::Webhook => write!(f, "Webhooks"),
		}
	}
}

/// Set of allowed HTTP methods, `["GET","POST"]` on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSet(Vec<Method>);

impl MethodSet {
	pub fn new(methods: Vec<Method>) -> Self {
		Self(methods)
	}

	pub fn get_only() -> Self {
		Self(vec![Method::GET])
	}

	pub fn all_crud() -> Self {
		Self(vec![Method::GET, Method::POST, Method::PUT, Method::DELETE])
	}

	pub fn allows(&self, method: &Method) -> bool {
		self.0.iter().any(|m| m == method)
	}

	pub fn iter(&self) -> impl Iterator<Item = &Method> {
		self.0.iter()
	}

	fn parse(raw: Vec<String>) -> Result<Self, EndpointLoadError> {
		let mut out = Vec::with_capacity(raw.len());
		for m in raw {
			let upper = m.to_ascii_uppercase();
			match upper.as_str() {
				"GET" | "POST" | "PUT" | "DELETE" | "PATCH" | "HEAD" | "OPTIONS" => {
					out.push(Method::from_bytes(upper.as_bytes()).map_err(|_| {
						EndpointLoadError::UnknownMethod(m.clone())
					})?);
				},
				_ => return Err(EndpointLoadError::UnknownMethod(m)),
			}
		}
		Ok(Self(out))
	}
}

impl Serialize for MethodSet {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_seq(self.0.iter().map(|m| m.as_str()))
	}
}

#[derive(Debug, Clone)]
pub struct SqlEndpoint {
	pub name: Strng,
	pub schema: String,
	pub object_name: String,
	pub primary_key: Option<String>,
	/// Closed projection set when non-empty; matching is case-insensitive.
	pub allowed_columns: Vec<String>,
	pub allowed_methods: MethodSet,
	/// Qualified stored procedure handling POST/PUT/DELETE.
	pub procedure: Option<String>,
	pub allowed_environments: Vec<String>,
}

impl SqlEndpoint {
	pub fn qualified_object(&self) -> String {
		format!("[{}].[{}]", self.schema, self.object_name)
	}

	pub fn column_allowed(&self, column: &str) -> bool {
		self.allowed_columns.is_empty()
			|| self
				.allowed_columns
				.iter()
				.any(|c| c.eq_ignore_ascii_case(column))
	}
}

#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
	pub name: Strng,
	pub target_url: Url,
	pub allowed_methods: MethodSet,
	/// Hidden from documentation surfaces; still routable.
	pub is_private: bool,
	pub allowed_environments: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CompositeEndpoint {
	pub name: Strng,
	pub base_url: Option<Url>,
	pub allowed_methods: MethodSet,
	pub allowed_environments: Vec<String>,
	pub config: CompositeConfig,
}

#[derive(Debug, Clone)]
pub struct CompositeConfig {
	pub name: String,
	pub description: String,
	pub steps: Vec<CompositeStep>,
}

#[derive(Debug, Clone)]
pub struct CompositeStep {
	pub name: String,
	/// Name of a Proxy endpoint in the same registry.
	pub endpoint: String,
	pub method: Method,
	pub depends_on: Option<String>,
	pub source_property: Option<String>,
	pub is_array: bool,
	pub array_property: Option<String>,
	/// field -> expression (`literal`, `$guid`, `$prev.<step>.<path>`).
	pub template_transformations: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct WebhookEndpoint {
	pub name: Strng,
	pub schema: String,
	pub table: String,
	pub allowed_webhook_ids: Vec<String>,
}

impl WebhookEndpoint {
	pub fn webhook_id_allowed(&self, id: &str) -> bool {
		self
			.allowed_webhook_ids
			.iter()
			.any(|w| w.eq_ignore_ascii_case(id))
	}
}

/// Environment visibility shared by all kinds: an empty list means any.
pub fn environment_allowed(allowed: &[String], env: &str) -> bool {
	allowed.is_empty() || allowed.iter().any(|e| e.eq_ignore_ascii_case(env))
}

// ---------------------------------------------------------------------------
// On-disk shapes

#[apply(settings!)]
#[derive(Default)]
pub struct RawSqlEntity {
	#[serde(default, alias = "DatabaseSchema")]
	pub schema: Option<String>,
	#[serde(default, alias = "DatabaseObjectName")]
	pub object_name: Option<String>,
	#[serde(default)]
	pub primary_key: Option<String>,
	#[serde(default)]
	pub allowed_columns: Vec<String>,
	#[serde(default)]
	pub allowed_methods: Option<Vec<String>>,
	#[serde(default)]
	pub procedure: Option<String>,
	#[serde(default)]
	pub allowed_environments: Vec<String>,
}

impl RawSqlEntity {
	pub fn validate(self, name: Strng) -> Result<SqlEndpoint, EndpointLoadError> {
		let object_name = self
			.object_name
			.filter(|o| !o.trim().is_empty())
			.ok_or(EndpointLoadError::MissingField("ObjectName"))?;
		let allowed_methods = match self.allowed_methods {
			Some(raw) => MethodSet::parse(raw)?,
			None => MethodSet::get_only(),
		};
		Ok(SqlEndpoint {
			name,
			schema: self.schema.unwrap_or_else(|| "dbo".to_string()),
			object_name,
			primary_key: self.primary_key,
			allowed_columns: self.allowed_columns,
			allowed_methods,
			procedure: self.procedure.filter(|p| !p.trim().is_empty()),
			allowed_environments: self.allowed_environments,
		})
	}
}

#[apply(settings!)]
#[derive(Default)]
pub struct RawProxyEntity {
	/// `"Composite"` promotes the definition; anything else is a plain proxy.
	#[serde(default)]
	pub r#type: Option<String>,
	#[serde(default, alias = "TargetUrl")]
	pub url: Option<String>,
	#[serde(default)]
	pub allowed_methods: Option<Vec<String>>,
	#[serde(default)]
	pub is_private: bool,
	#[serde(default)]
	pub allowed_environments: Vec<String>,
	#[serde(default)]
	pub composite_config: Option<RawCompositeConfig>,
}

#[apply(settings!)]
pub struct RawCompositeConfig {
	#[serde(default)]
	pub name: Option<String>,
	#[serde(default)]
	pub description: Option<String>,
	#[serde(default)]
	pub steps: Vec<RawCompositeStep>,
}

#[apply(settings!)]
pub struct RawCompositeStep {
	pub name: String,
	pub endpoint: String,
	#[serde(default)]
	pub method: Option<String>,
	#[serde(default)]
	pub depends_on: Option<String>,
	#[serde(default)]
	pub source_property: Option<String>,
	#[serde(default)]
	pub is_array: bool,
	#[serde(default)]
	pub array_property: Option<String>,
	#[serde(default)]
	pub template_transformations: BTreeMap<String, String>,
}

impl RawProxyEntity {
	pub fn is_composite(&self) -> bool {
		self
			.r#type
			.as_deref()
			.is_some_and(|t| t.eq_ignore_ascii_case("composite"))
	}

	pub fn validate_proxy(self, name: Strng) -> Result<ProxyEndpoint, EndpointLoadError> {
		let url = self
			.url
			.filter(|u| !u.trim().is_empty())
			.ok_or(EndpointLoadError::MissingField("Url"))?;
		let target_url = Url::parse(&url).map_err(|e| EndpointLoadError::InvalidUrl {
			url,
			reason: e.to_string(),
		})?;
		let allowed_methods = match self.allowed_methods {
			Some(raw) => MethodSet::parse(raw)?,
			None => MethodSet::all_crud(),
		};
		Ok(ProxyEndpoint {
			name,
			target_url,
			allowed_methods,
			is_private: self.is_private,
			allowed_environments: self.allowed_environments,
		})
	}

	pub fn validate_composite(
		self,
		name: Strng,
	) -> Result<CompositeEndpoint, EndpointLoadError> {
		let base_url = match &self.url {
			Some(u) if !u.trim().is_empty() => {
				Some(Url::parse(u).map_err(|e| EndpointLoadError::InvalidUrl {
					url: u.clone(),
					reason: e.to_string(),
				})?)
			},
			_ => None,
		};
		let allowed_methods = match self.allowed_methods {
			Some(raw) => MethodSet::parse(raw)?,
			None => MethodSet::new(vec![Method::POST]),
		};
		let raw = self
			.composite_config
			.ok_or(EndpointLoadError::MissingField("CompositeConfig"))?;
		if raw.steps.is_empty() {
			return Err(EndpointLoadError::EmptyComposite);
		}

		let mut steps = Vec::with_capacity(raw.steps.len());
		for raw_step in raw.steps {
			let method = match raw_step.method {
				Some(m) => {
					let upper = m.to_ascii_uppercase();
					Method::from_bytes(upper.as_bytes())
						.map_err(|_| EndpointLoadError::UnknownMethod(m))?
				},
				None => Method::POST,
			};
			steps.push(CompositeStep {
				name: raw_step.name,
				endpoint: raw_step.endpoint,
				method,
				depends_on: raw_step.depends_on,
				source_property: raw_step.source_property,
				is_array: raw_step.is_array,
				array_property: raw_step.array_property,
				template_transformations: raw_step.template_transformations,
			});
		}
		validate_step_ordering(&steps)?;

		Ok(CompositeEndpoint {
			name: name.clone(),
			base_url,
			allowed_methods,
			allowed_environments: self.allowed_environments,
			config: CompositeConfig {
				name: raw.name.unwrap_or_else(|| name.to_string()),
				description: raw.description.unwrap_or_default(),
				steps,
			},
		})
	}
}

/// Step names must be unique, and both `dependsOn` and `$prev` references may
/// only point at steps declared earlier; cycles are impossible once forward
/// references are rejected.
fn validate_step_ordering(steps: &[CompositeStep]) -> Result<(), EndpointLoadError> {
	let mut seen: Vec<&str> = Vec::with_capacity(steps.len());
	for step in steps {
		if seen.iter().any(|s| *s == step.name) {
			return Err(EndpointLoadError::InvalidStep {
				step: step.name.clone(),
				reason: "duplicate step name".to_string(),
			});
		}
		if step.is_array && step.array_property.is_none() {
			return Err(EndpointLoadError::InvalidStep {
				step: step.name.clone(),
				reason: "IsArray requires ArrayProperty".to_string(),
			});
		}
		if let Some(dep) = &step.depends_on
			&& !seen.iter().any(|s| *s == dep.as_str())
		{
			return Err(EndpointLoadError::InvalidStep {
				step: step.name.clone(),
				reason: format!("DependsOn `{dep}` does not name an earlier step"),
			});
		}
		for expr in step.template_transformations.values() {
			if let Some(referenced) = prev_step_reference(expr)
				&& !seen.iter().any(|s| *s == referenced)
			{
				return Err(EndpointLoadError::InvalidStep {
					step: step.name.clone(),
					reason: format!("`{expr}` references step `{referenced}` which is not declared earlier"),
				});
			}
		}
		seen.push(&step.name);
	}
	Ok(())
}

/// Extracts `<step>` from a `$prev.<step>.<path>` expression.
pub fn prev_step_reference(expr: &str) -> Option<&str> {
	let rest = expr.strip_prefix("$prev.")?;
	match rest.split_once('.') {
		Some((step, _)) => Some(step),
		None => Some(rest),
	}
}

#[apply(settings!)]
#[derive(Default)]
pub struct RawWebhookEntity {
	#[serde(default)]
	pub schema: Option<String>,
	#[serde(default)]
	pub table: Option<String>,
	#[serde(default, alias = "AllowedWebhookIds")]
	pub allowed_columns: Vec<String>,
}

impl RawWebhookEntity {
	pub fn validate(self, name: Strng) -> Result<WebhookEndpoint, EndpointLoadError> {
		Ok(WebhookEndpoint {
			name,
			schema: self.schema.unwrap_or_else(|| "dbo".to_string()),
			table: self.table.unwrap_or_else(|| "WebhookData".to_string()),
			allowed_webhook_ids: self.allowed_columns,
		})
	}
}
