//! Composite flows: a declared sequence of upstream calls with value
//! propagation between steps.
//!
//! Steps run strictly in declaration order; an array step fans out
//! sequentially over its elements and captures results in input order. Any
//! step failure aborts the flow — there is no compensation, idempotency is
//! the caller's concern.

use std::time::Instant;

use serde_json::{Map, Value};

use crate::registry::EndpointSet;
use crate::types::endpoint::{CompositeEndpoint, CompositeStep};
use crate::*;

#[cfg(test)]
#[path = "composite_tests.rs"]
mod tests;

#[derive(thiserror::Error, Debug)]
pub enum CompositeError {
	#[error("step `{step}` references unknown endpoint `{endpoint}`")]
	UnknownStepEndpoint { step: String, endpoint: String },

	#[error("step `{step}`: request body has no `{property}` property")]
	PayloadMissing { step: String, property: String },

	#[error("step `{step}`: `{property}` is not an array")]
	NotAnArray { step: String, property: String },

	#[error("step `{step}`: cannot resolve `{expression}`")]
	UnresolvedReference { step: String, expression: String },

	#[error("step `{step}`: transformations require an object payload")]
	PayloadNotObject { step: String },

	#[error("step {index} (`{name}`) failed")]
	StepFailed {
		index: usize,
		name: String,
		status: Option<u16>,
		body: String,
	},
}

impl CompositeError {
	/// Upstream failures surface as 502; everything else is caller error.
	pub fn is_upstream(&self) -> bool {
		matches!(self, CompositeError::StepFailed { .. })
	}
}

pub struct CompositeExecutor {
	client: reqwest::Client,
}

impl CompositeExecutor {
	pub fn new(client: reqwest::Client) -> Self {
		Self { client }
	}

	/// Runs every step and returns `{ success, results }` with one captured
	/// result (or ordered list, for array steps) per step name.
	pub async fn execute(
		&self,
		endpoint: &CompositeEndpoint,
		endpoints: &EndpointSet,
		body: Value,
		deadline: Duration,
	) -> Result<Value, CompositeError> {
		let started = Instant::now();
		let mut results: Map<String, Value> = Map::new();

		for (index, step) in endpoint.config.steps.iter().enumerate() {
			let target = endpoints.lookup_proxy(&step.endpoint).ok_or_else(|| {
				CompositeError::UnknownStepEndpoint {
					step: step.name.clone(),
					endpoint: step.endpoint.clone(),
				}
			})?;

			let payloads = resolve_payloads(step, &body)?;
			let mut captured = Vec::with_capacity(payloads.len());
			for mut payload in payloads {
				apply_transformations(step, &mut payload, &results)?;

				let remaining = deadline
					.checked_sub(started.elapsed())
					.filter(|d| !d.is_zero())
					.ok_or_else(|| CompositeError::StepFailed {
						index,
						name: step.name.clone(),
						status: None,
						body: "composite deadline exceeded".to_string(),
					})?;

				debug!(
					composite = %endpoint.name,
					step = %step.name,
					endpoint = %target.name,
					"executing composite step"
				);
				let response = self
					.client
					.request(step.method.clone(), target.target_url.clone())
					.json(&payload)
					.timeout(remaining)
					.send()
					.await
					.map_err(|e| CompositeError::StepFailed {
						index,
						name: step.name.clone(),
						status: None,
						body: e.to_string(),
					})?;

				let status = response.status();
				let raw = response.text().await.unwrap_or_default();
				if !status.is_success() {
					return Err(CompositeError::StepFailed {
						index,
						name: step.name.clone(),
						status: Some(status.as_u16()),
						body: excerpt(&raw),
					});
				}
				captured.push(
					serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
				);
			}

			let result = if step.is_array {
				Value::Array(captured)
			} else {
				captured.into_iter().next().unwrap_or(Value::Null)
			};
			results.insert(step.name.clone(), result);
		}

		Ok(serde_json::json!({
			"success": true,
			"results": Value::Object(results),
		}))
	}
}

/// Source payloads for one step: a single value, or one per array element.
fn resolve_payloads(step: &CompositeStep, body: &Value) -> Result<Vec<Value>, CompositeError> {
	if let Some(property) = &step.source_property {
		let payload = body
			.get(property)
			.cloned()
			.ok_or_else(|| CompositeError::PayloadMissing {
				step: step.name.clone(),
				property: property.clone(),
			})?;
		return Ok(vec![payload]);
	}
	if step.is_array {
		let property = step
			.array_property
			.as_deref()
			.unwrap_or_default();
		let value = body
			.get(property)
			.ok_or_else(|| CompositeError::PayloadMissing {
				step: step.name.clone(),
				property: property.to_string(),
			})?;
		let items = value.as_array().ok_or_else(|| CompositeError::NotAnArray {
			step: step.name.clone(),
			property: property.to_string(),
		})?;
		return Ok(items.to_vec());
	}
	Ok(vec![body.clone()])
}

fn apply_transformations(
	step: &CompositeStep,
	payload: &mut Value,
	results: &Map<String, Value>,
) -> Result<(), CompositeError> {
	if step.template_transformations.is_empty() {
		return Ok(());
	}
	let object = payload
		.as_object_mut()
		.ok_or_else(|| CompositeError::PayloadNotObject {
			step: step.name.clone(),
		})?;
	for (field, expression) in &step.template_transformations {
		let value = evaluate(expression, results).ok_or_else(|| {
			CompositeError::UnresolvedReference {
				step: step.name.clone(),
				expression: expression.clone(),
			}
		})?;
		object.insert(field.clone(), value);
	}
	Ok(())
}

/// `$guid`, `$prev.<step>.<path>`, or a literal string.
fn evaluate(expression: &str, results: &Map<String, Value>) -> Option<Value> {
	if expression == "$guid" {
		return Some(Value::String(uuid::Uuid::new_v4().to_string()));
	}
	if let Some(path) = expression.strip_prefix("$prev.") {
		return resolve_path(results, path);
	}
	Some(Value::String(expression.to_string()))
}

/// Dot path over captured results; numeric segments index into arrays
/// (`CreateLines.0.d.TransactionKey`).
fn resolve_path(results: &Map<String, Value>, path: &str) -> Option<Value> {
	let mut segments = path.split('.');
	let step = segments.next()?;
	let mut current = results.get(step)?;
	for segment in segments {
		current = match current {
			Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
			Value::Object(map) => map.get(segment)?,
			_ => return None,
		};
	}
	Some(current.clone())
}

fn excerpt(body: &str) -> String {
	const MAX: usize = 512;
	if body.len() <= MAX {
		body.to_string()
	} else {
		let mut end = MAX;
		while !body.is_char_boundary(end) {
			end -= 1;
		}
		format!("{}…", &body[..end])
	}
}
