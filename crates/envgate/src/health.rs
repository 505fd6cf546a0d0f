//! Health surface: liveness, aggregate readiness, and per-dependency
//! detail.

use axum::extract::State;
use axum::response::IntoResponse;
use serde_json::json;

use crate::gateway::Gateway;
use crate::http::StatusCode;
use crate::*;

/// No auth, no dependencies — answers as long as the process serves.
pub async fn live() -> impl IntoResponse {
	axum::Json(json!({ "status": "Alive" }))
}

pub async fn aggregate(State(gw): State<Arc<Gateway>>) -> impl IntoResponse {
	let endpoints = gw.registry.snapshot();
	let store_ok = gw.auth.store().ping().await.is_ok();
	let healthy = store_ok && endpoints.load_errors.is_empty();

	let status = if healthy {
		StatusCode::OK
	} else {
		StatusCode::SERVICE_UNAVAILABLE
	};
	(
		status,
		axum::Json(json!({
			"status": if healthy { "Healthy" } else { "Degraded" },
			"endpoints": endpoints.total(),
			"tokenStore": store_ok,
		})),
	)
}

pub async fn details(State(gw): State<Arc<Gateway>>) -> impl IntoResponse {
	let endpoints = gw.registry.snapshot();
	let store_ok = gw.auth.store().ping().await.is_ok();

	let environments: Vec<serde_json::Value> = gw
		.resolver
		.cached()
		.await
		.iter()
		.map(|env| {
			json!({
				"name": env.name.as_str(),
				"serverName": env.server_name,
			})
		})
		.collect();

	let pools: Vec<serde_json::Value> = gw
		.pools
		.as_ref()
		.map(|manager| {
			manager
				.statuses()
				.into_iter()
				.map(|(label, status)| {
					json!({
						"pool": label,
						"active": status.active,
						"idle": status.idle,
					})
				})
				.collect()
		})
		.unwrap_or_default();

	axum::Json(json!({
		"status": if store_ok && endpoints.load_errors.is_empty() { "Healthy" } else { "Degraded" },
		"registry": {
			"sql": endpoints.list(crate::types::endpoint::EndpointKind::Sql).len(),
			"proxy": endpoints.list(crate::types::endpoint::EndpointKind::Proxy).len(),
			"composite": endpoints.list(crate::types::endpoint::EndpointKind::Composite).len(),
			"webhooks": endpoints.list(crate::types::endpoint::EndpointKind::Webhook).len(),
			"loadErrors": endpoints.load_errors.clone(),
		},
		"tokenStore": store_ok,
		"environments": environments,
		"pools": pools,
		"rateLimiter": gw.limiter.stats(),
	}))
}
