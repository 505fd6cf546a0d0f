//! SQL endpoint execution: OData reads and stored-procedure writes.

pub mod client;
pub mod mssql;
pub mod pool;

use std::collections::HashMap;

use ::http::Method;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};

use crate::environment::ResolvedEnvironment;
use crate::odata::{self, ODataError, TranslateRequest};
use crate::sql::client::{DbConnector, DbError, JsonRow, ProcParam};
use crate::types::endpoint::SqlEndpoint;
use crate::*;

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;

#[derive(thiserror::Error, Debug)]
pub enum SqlError {
	#[error("Method not allowed")]
	MethodNotAllowed,

	#[error("Column(s) not allowed: {}", .0.join(", "))]
	DisallowedColumns(Vec<String>),

	#[error(transparent)]
	OData(#[from] ODataError),

	#[error("Invalid ${name} value `{value}`")]
	InvalidPaging { name: &'static str, value: String },

	#[error("Endpoint does not support writes")]
	MissingProcedure,

	#[error("Request body must contain an `id` property")]
	MissingId,

	#[error("Request body must be a JSON object")]
	BodyNotObject,

	#[error("Invalid property name `{0}`")]
	InvalidParameterName(String),

	#[error("Invalid procedure name `{0}`")]
	InvalidProcedure(String),

	#[error("Endpoint has no primary key; id path segments are not supported")]
	NoPrimaryKey,

	#[error(transparent)]
	Db(#[from] DbError),
}

impl SqlError {
	/// True for caller mistakes (400); false for backend failures (500).
	pub fn is_validation(&self) -> bool {
		!matches!(self, SqlError::Db(_))
	}
}

/// `{ Count, Value, NextLink }` — the paged read envelope.
#[derive(Debug, Serialize)]
pub struct GetResponse {
	#[serde(rename = "Count")]
	pub count: usize,
	#[serde(rename = "Value")]
	pub value: Vec<JsonRow>,
	#[serde(rename = "NextLink")]
	pub next_link: Option<String>,
}

#[apply(schema!)]
pub struct MutationResponse {
	pub success: bool,
	pub message: String,
	pub result: Option<JsonRow>,
}

pub struct SqlExecutor {
	connector: Arc<dyn DbConnector>,
	default_top: usize,
}

impl SqlExecutor {
	pub fn new(connector: Arc<dyn DbConnector>, default_top: usize) -> Self {
		Self {
			connector,
			default_top,
		}
	}

	/// One page of rows. `path` is the request path used to build `NextLink`;
	/// `path_id` is a trailing primary-key segment.
	pub async fn handle_get(
		&self,
		endpoint: &SqlEndpoint,
		env: &ResolvedEnvironment,
		path: &str,
		raw_query: &HashMap<String, String>,
		path_id: Option<&str>,
		deadline: Duration,
	) -> Result<GetResponse, SqlError> {
		if !endpoint.allowed_methods.allows(&Method::GET) {
			return Err(SqlError::MethodNotAllowed);
		}

		// Column gate runs before translation: a disallowed column must never
		// reach the database.
		let select = match raw_query.get("$select") {
			Some(raw) => {
				let columns = odata::parse_select(raw)?;
				if !endpoint.allowed_columns.is_empty() {
					let rejected: Vec<String> = columns
						.iter()
						.filter(|c| !endpoint.column_allowed(c))
						.cloned()
						.collect();
					if !rejected.is_empty() {
						return Err(SqlError::DisallowedColumns(rejected));
					}
				}
				columns
			},
			None => endpoint.allowed_columns.clone(),
		};

		let top = parse_paging(raw_query, "$top", self.default_top)?;
		let skip = parse_paging(raw_query, "$skip", 0)?;

		let filter = build_filter(
			raw_query.get("$filter").map(|s| s.as_str()),
			endpoint,
			path_id,
		)?;

		let query = odata::translate(&TranslateRequest {
			table: &endpoint.qualified_object(),
			select: &select,
			filter: filter.as_deref(),
			orderby: raw_query.get("$orderby").map(|s| s.as_str()),
			// One extra row detects whether another page exists.
			top: top + 1,
			skip,
		})?;

		let db = self.connector.connect(env)?;
		let mut rows = db.query(&query.sql, &query.bindings, deadline).await?;

		let next_link = if rows.len() > top {
			rows.truncate(top);
			Some(next_link(path, raw_query, top, skip + top))
		} else {
			None
		};

		Ok(GetResponse {
			count: rows.len(),
			value: rows,
			next_link,
		})
	}

	/// POST/PUT/DELETE via the endpoint's stored procedure.
	pub async fn handle_mutation(
		&self,
		method: &Method,
		endpoint: &SqlEndpoint,
		env: &ResolvedEnvironment,
		username: &str,
		path_id: Option<&str>,
		body: serde_json::Value,
		deadline: Duration,
	) -> Result<MutationResponse, SqlError> {
		if !endpoint.allowed_methods.allows(method) {
			return Err(SqlError::MethodNotAllowed);
		}
		let procedure = endpoint
			.procedure
			.as_deref()
			.ok_or(SqlError::MissingProcedure)?;
		let procedure = qualify_procedure(procedure)?;

		let sql_method = if *method == Method::POST {
			"INSERT"
		} else if *method == Method::PUT {
			"UPDATE"
		} else if *method == Method::DELETE {
			"DELETE"
		} else {
			return Err(SqlError::MethodNotAllowed);
		};

		let mut params = vec![
			ProcParam {
				name: "Method".to_string(),
				value: serde_json::Value::String(sql_method.to_string()),
			},
			ProcParam {
				name: "UserName".to_string(),
				value: serde_json::Value::String(username.to_string()),
			},
		];

		if *method == Method::DELETE {
			let id = path_id
				.map(|id| serde_json::Value::String(id.to_string()))
				.or_else(|| body_id(&body).cloned())
				.ok_or(SqlError::MissingId)?;
			params.push(ProcParam {
				name: "id".to_string(),
				value: id,
			});
		} else {
			let object = body.as_object().ok_or(SqlError::BodyNotObject)?;
			if *method == Method::PUT && body_id(&body).is_none() {
				return Err(SqlError::MissingId);
			}
			for (key, value) in object {
				if !odata::is_identifier(key) {
					return Err(SqlError::InvalidParameterName(key.clone()));
				}
				params.push(ProcParam {
					name: key.clone(),
					value: value.clone(),
				});
			}
		}

		let db = self.connector.connect(env)?;
		let rows = db.execute_procedure(&procedure, &params, deadline).await?;

		Ok(MutationResponse {
			success: true,
			message: format!("{sql_method} completed"),
			result: rows.into_iter().next(),
		})
	}
}

fn parse_paging(
	raw_query: &HashMap<String, String>,
	name: &'static str,
	default: usize,
) -> Result<usize, SqlError> {
	match raw_query.get(name) {
		Some(raw) => raw.trim().parse().map_err(|_| SqlError::InvalidPaging {
			name,
			value: raw.clone(),
		}),
		None => Ok(default),
	}
}

/// Combines `$filter` with a trailing primary-key path segment.
fn build_filter(
	filter: Option<&str>,
	endpoint: &SqlEndpoint,
	path_id: Option<&str>,
) -> Result<Option<String>, SqlError> {
	let Some(id) = path_id else {
		return Ok(filter.map(|f| f.to_string()));
	};
	let pk = endpoint.primary_key.as_deref().ok_or(SqlError::NoPrimaryKey)?;
	// Re-quote the id as an OData literal; the translator turns it into a
	// binding like any other value.
	let id_predicate = format!("{pk} eq '{}'", id.replace('\'', "''"));
	Ok(Some(match filter {
		Some(f) if !f.trim().is_empty() => format!("{id_predicate} and {f}"),
		_ => id_predicate,
	}))
}

// Characters that must not appear raw in a query-string value.
const QUERY_VALUE: &AsciiSet = &CONTROLS
	.add(b' ')
	.add(b'"')
	.add(b'#')
	.add(b'%')
	.add(b'&')
	.add(b'+')
	.add(b'<')
	.add(b'>')
	.add(b'?');

fn next_link(
	path: &str,
	raw_query: &HashMap<String, String>,
	top: usize,
	new_skip: usize,
) -> String {
	let mut parts = vec![format!("$top={top}"), format!("$skip={new_skip}")];
	for key in ["$select", "$filter", "$orderby"] {
		if let Some(value) = raw_query.get(key) {
			parts.push(format!(
				"{key}={}",
				utf8_percent_encode(value, QUERY_VALUE)
			));
		}
	}
	format!("{path}?{}", parts.join("&"))
}

fn body_id(body: &serde_json::Value) -> Option<&serde_json::Value> {
	["id", "Id", "ID"]
		.iter()
		.find_map(|key| body.get(*key))
}

/// `dbo.Proc`, `[dbo].[Proc]`, or bare `Proc` — normalised to bracketed form.
fn qualify_procedure(raw: &str) -> Result<String, SqlError> {
	let parts: Vec<String> = raw
		.split('.')
		.map(|p| {
			p.trim()
				.trim_start_matches('[')
				.trim_end_matches(']')
				.to_string()
		})
		.collect();
	let (schema, name) = match parts.as_slice() {
		[name] => ("dbo".to_string(), name.clone()),
		[schema, name] => (schema.clone(), name.clone()),
		_ => return Err(SqlError::InvalidProcedure(raw.to_string())),
	};
	if !odata::is_identifier(&schema) || !odata::is_identifier(&name) {
		return Err(SqlError::InvalidProcedure(raw.to_string()));
	}
	Ok(format!("[{schema}].[{name}]"))
}
