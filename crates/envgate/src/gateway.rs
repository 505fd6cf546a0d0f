//! Request dispatch: routing, the auth/rate-limit middleware, and the
//! JSON error surface.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use axum::Router;
use axum::extract::{ConnectInfo, Path, State};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum_core::RequestExt;
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;
use serde_json::json;

use crate::auth::store::{SqliteTokenStore, TokenStore};
use crate::auth::{AuthError, AuthGate, Principal, bypasses_auth};
use crate::composite::{CompositeError, CompositeExecutor};
use crate::config::Config;
use crate::environment::{EnvironmentError, EnvironmentResolver, ResolvedEnvironment};
use crate::http::{Body, Method, Request, Response, StatusCode, header};
use crate::proxy::{ProxyContext, ProxyError, ProxyExecutor};
use crate::ratelimit::{RateDecision, RateLimiter};
use crate::registry::EndpointRegistry;
use crate::registry::watcher::{self, RegistryWatcher};
use crate::secrets::HttpSecretStore;
use crate::sql::client::DbConnector;
use crate::sql::pool::PoolManager;
use crate::sql::{SqlError, SqlExecutor};
use crate::types::endpoint::environment_allowed;
use crate::webhook::{WebhookError, WebhookExecutor};
use crate::*;

#[cfg(test)]
#[path = "gateway_tests.rs"]
mod tests;

pub struct Gateway {
	pub config: Config,
	pub registry: Arc<EndpointRegistry>,
	pub resolver: Arc<EnvironmentResolver>,
	pub auth: AuthGate,
	pub limiter: Arc<RateLimiter>,
	pub sql: SqlExecutor,
	pub proxy: ProxyExecutor,
	pub composite: CompositeExecutor,
	pub webhook: WebhookExecutor,
	/// Present when the production pool manager is in use; health details
	/// report per-pool status through it.
	pub pools: Option<Arc<PoolManager>>,
	_watcher: Option<RegistryWatcher>,
}

impl Gateway {
	/// Production wiring: SQLite token store, MSSQL pools, optional remote
	/// secret store, hot-reloading registry.
	pub async fn bootstrap(config: Config) -> anyhow::Result<Arc<Self>> {
		let client = crate::client::upstream_client()?;
		let secrets = HttpSecretStore::from_env(client.clone())
			.map(|s| Arc::new(s) as Arc<dyn crate::secrets::SecretStore>);
		let store: Arc<dyn TokenStore> =
			Arc::new(SqliteTokenStore::new(&config.auth.token_store_path));
		let pools = PoolManager::new(config.sql.clone());
		pools.spawn_status_logger();

		let registry = Arc::new(EndpointRegistry::load(&config.endpoints_directory));
		let watcher = match watcher::watch(registry.clone()) {
			Ok(w) => Some(w),
			Err(e) => {
				warn!(error = %e, "endpoint watcher unavailable; definitions load once at startup");
				None
			},
		};

		let connector: Arc<dyn DbConnector> = pools.clone();
		let gateway = Self::assemble(
			config,
			registry,
			secrets,
			store,
			connector,
			client,
			watcher,
			Some(pools),
		);
		gateway.limiter.spawn_sweeper();
		Ok(gateway)
	}

	/// Dependency-injected construction for tests: any token store, any
	/// database connector, no watcher.
	pub fn with_dependencies(
		config: Config,
		registry: Arc<EndpointRegistry>,
		store: Arc<dyn TokenStore>,
		connector: Arc<dyn DbConnector>,
		client: reqwest::Client,
	) -> Arc<Self> {
		Self::assemble(config, registry, None, store, connector, client, None, None)
	}

	#[allow(clippy::too_many_arguments)]
	fn assemble(
		config: Config,
		registry: Arc<EndpointRegistry>,
		secrets: Option<Arc<dyn crate::secrets::SecretStore>>,
		store: Arc<dyn TokenStore>,
		connector: Arc<dyn DbConnector>,
		client: reqwest::Client,
		watcher: Option<RegistryWatcher>,
		pools: Option<Arc<PoolManager>>,
	) -> Arc<Self> {
		let resolver = Arc::new(EnvironmentResolver::new(
			&config.environments_directory,
			secrets,
		));
		let limiter = RateLimiter::new(&config.rate_limiting);
		let sql = SqlExecutor::new(connector.clone(), config.sql.default_top);
		let proxy = ProxyExecutor::new(
			client.clone(),
			config.proxy.forwarded_headers,
			config.request.max_buffered_body,
			config.proxy.max_inflight_per_endpoint,
		);
		let composite = CompositeExecutor::new(client.clone());
		let webhook = WebhookExecutor::new(connector);

		Arc::new(Self {
			config,
			registry,
			resolver,
			auth: AuthGate::new(store),
			limiter,
			sql,
			proxy,
			composite,
			webhook,
			pools,
			_watcher: watcher,
		})
	}

	/// Binds the router to an accepted listener and serves until `shutdown`
	/// resolves.
	pub async fn serve(
		self: Arc<Self>,
		listener: tokio::net::TcpListener,
		shutdown: impl Future<Output = ()> + Send + 'static,
	) -> anyhow::Result<()> {
		let app = self.router();
		axum::serve(
			listener,
			app.into_make_service_with_connect_info::<SocketAddr>(),
		)
		.with_graceful_shutdown(shutdown)
		.await?;
		Ok(())
	}

	pub fn router(self: &Arc<Self>) -> Router {
		Router::new()
			.route("/", get(landing))
			.route("/favicon.ico", get(favicon))
			.route("/health/live", get(crate::health::live))
			.route("/health", get(crate::health::aggregate))
			.route("/health/details", get(crate::health::details))
			.route("/api/{env}/composite/{name}", post(composite_handler))
			.route("/api/{env}/{name}", any(api_handler))
			.route("/api/{env}/{name}/{*tail}", any(api_tail_handler))
			.route("/webhook/{env}/{id}", post(webhook_handler))
			.fallback(not_found)
			.layer(middleware::from_fn_with_state(self.clone(), gate_middleware))
			.with_state(self.clone())
	}
}

// ---------------------------------------------------------------------------
// Request-scoped context

/// Set by the middleware, read by handlers.
#[derive(Clone)]
pub struct RequestContext {
	pub correlation_id: Strng,
	pub started: Instant,
	pub deadline: Duration,
	pub client_addr: Option<IpAddr>,
}

impl RequestContext {
	pub fn remaining(&self) -> Duration {
		self.deadline.saturating_sub(self.started.elapsed())
	}
}

/// Path classification for scope checks; mirrors the route table.
fn parse_scope_target(path: &str) -> (Option<&str>, Option<String>) {
	let mut segments = path.trim_start_matches('/').splitn(4, '/');
	match (
		segments.next(),
		segments.next(),
		segments.next(),
		segments.next(),
	) {
		(Some("api"), Some(env), Some("composite"), Some(name)) => {
			(Some(env), Some(format!("composite/{name}")))
		},
		(Some("api"), Some(env), Some(name), _) => {
			(Some(env), Some(name.to_string()))
		},
		(Some("api"), Some(env), None, _) => (Some(env), None),
		(Some("webhook"), Some(env), Some(id), _) => {
			(Some(env), Some(format!("webhook/{id}")))
		},
		_ => (None, None),
	}
}

/// Rate limiting, authentication, authorization, correlation, and traffic
/// logging — one pass per request.
async fn gate_middleware(
	State(gw): State<Arc<Gateway>>,
	mut req: Request,
	next: Next,
) -> Response {
	let started = Instant::now();
	let correlation_id = strng::display(uuid::Uuid::new_v4());
	let method = req.method().clone();
	let path = req.uri().path().to_string();

	let client_addr = req
		.extensions()
		.get::<ConnectInfo<SocketAddr>>()
		.map(|ci| ci.0.ip());
	let bearer = match req
		.extract_parts::<TypedHeader<Authorization<Bearer>>>()
		.await
	{
		Ok(TypedHeader(Authorization(bearer))) => Some(bearer.token().to_string()),
		Err(_) => None,
	};

	let ctx = RequestContext {
		correlation_id: correlation_id.clone(),
		started,
		deadline: gw.config.request.timeout(),
		client_addr,
	};
	req.extensions_mut().insert(ctx);

	let outcome = gate_request(&gw, &mut req, &path, client_addr, bearer.as_deref()).await;
	let mut response = match outcome {
		Ok(()) => next.run(req).await,
		Err(e) => e.into_response(),
	};

	if let Ok(value) = http::HeaderValue::from_str(&correlation_id) {
		response
			.headers_mut()
			.insert(http::HeaderName::from_static("x-correlation-id"), value);
	}

	if gw.config.request_traffic_logging.enabled {
		info!(
			correlation_id = %correlation_id,
			method = %method,
			path = %path,
			status = response.status().as_u16(),
			duration_ms = started.elapsed().as_millis() as u64,
			"request"
		);
	}
	response
}

async fn gate_request(
	gw: &Gateway,
	req: &mut Request,
	path: &str,
	client_addr: Option<IpAddr>,
	bearer: Option<&str>,
) -> Result<(), GatewayError> {
	if let RateDecision::Limited { retry_after_secs } = gw.limiter.check(client_addr, bearer) {
		return Err(GatewayError::RateLimited { retry_after_secs });
	}
	if bypasses_auth(path) {
		return Ok(());
	}

	let principal = gw.auth.authenticate(bearer).await?;
	let (env, scope_name) = parse_scope_target(path);
	AuthGate::authorize(&principal, env, scope_name.as_deref())?;
	debug!(username = %principal.username, path, "request authorized");
	req.extensions_mut().insert(principal);
	Ok(())
}

// ---------------------------------------------------------------------------
// Handlers

async fn landing() -> impl IntoResponse {
	"envgate"
}

async fn favicon() -> StatusCode {
	StatusCode::NO_CONTENT
}

async fn not_found(req: Request) -> GatewayError {
	GatewayError::NotFound(format!("No route for {}", req.uri().path()))
}

async fn api_handler(
	State(gw): State<Arc<Gateway>>,
	Path((env, name)): Path<(String, String)>,
	req: Request,
) -> Result<Response, GatewayError> {
	dispatch_api(gw, env, name, None, req).await
}

async fn api_tail_handler(
	State(gw): State<Arc<Gateway>>,
	Path((env, name, tail)): Path<(String, String, String)>,
	req: Request,
) -> Result<Response, GatewayError> {
	dispatch_api(gw, env, name, Some(tail), req).await
}

async fn dispatch_api(
	gw: Arc<Gateway>,
	env: String,
	name: String,
	tail: Option<String>,
	req: Request,
) -> Result<Response, GatewayError> {
	let endpoints = gw.registry.snapshot();

	if let Some(endpoint) = endpoints.lookup_sql(&name) {
		if !environment_allowed(&endpoint.allowed_environments, &env) {
			return Err(GatewayError::NotFound(format!("Unknown endpoint `{name}`")));
		}
		return handle_sql(&gw, &endpoint, &env, tail, req).await;
	}
	if let Some(endpoint) = endpoints.lookup_proxy(&name) {
		if !environment_allowed(&endpoint.allowed_environments, &env) {
			return Err(GatewayError::NotFound(format!("Unknown endpoint `{name}`")));
		}
		return handle_proxy(&gw, &endpoint, &env, tail, req).await;
	}
	Err(GatewayError::NotFound(format!("Unknown endpoint `{name}`")))
}

async fn handle_sql(
	gw: &Gateway,
	endpoint: &crate::types::endpoint::SqlEndpoint,
	env: &str,
	tail: Option<String>,
	req: Request,
) -> Result<Response, GatewayError> {
	let ctx = request_context(&req)?;
	let resolved = resolve_environment(gw, env, true).await?;
	let path = req.uri().path().to_string();
	let raw_query = query_map(&req);
	let principal = principal(&req)?;

	// Multi-segment tails only make sense for proxies.
	let path_id = tail.as_deref().filter(|t| !t.is_empty());

	let method = req.method().clone();
	if method == Method::GET {
		let page = gw
			.sql
			.handle_get(
				endpoint,
				&resolved,
				// NextLink points at the collection, not the id path.
				path.strip_suffix(&format!("/{}", path_id.unwrap_or_default()))
					.unwrap_or(&path),
				&raw_query,
				path_id,
				ctx.remaining(),
			)
			.await?;
		Ok(json_response(StatusCode::OK, &page))
	} else if method == Method::POST || method == Method::PUT || method == Method::DELETE {
		let username = principal.username.to_string();
		let body = read_json_body(req, gw.config.request.max_buffered_body).await?;
		let result = gw
			.sql
			.handle_mutation(
				&method,
				endpoint,
				&resolved,
				&username,
				path_id,
				body,
				ctx.remaining(),
			)
			.await?;
		Ok(json_response(StatusCode::OK, &result))
	} else {
		Err(GatewayError::MethodNotAllowed)
	}
}

async fn handle_proxy(
	gw: &Gateway,
	endpoint: &crate::types::endpoint::ProxyEndpoint,
	env: &str,
	tail: Option<String>,
	req: Request,
) -> Result<Response, GatewayError> {
	let ctx = request_context(&req)?;
	// The environment still has to exist, even though proxies do not use its
	// connection string.
	resolve_environment(gw, env, true).await?;

	let proxy_ctx = ProxyContext {
		env: strng::new(env),
		gateway_origin: request_origin(&req),
		tail,
		client_addr: ctx.client_addr,
		deadline: ctx.remaining(),
	};
	let response = gw.proxy.execute(endpoint, &proxy_ctx, req).await?;
	Ok(response)
}

async fn composite_handler(
	State(gw): State<Arc<Gateway>>,
	Path((env, name)): Path<(String, String)>,
	req: Request,
) -> Result<Response, GatewayError> {
	let ctx = request_context(&req)?;
	let endpoints = gw.registry.snapshot();
	let Some(endpoint) = endpoints.lookup_composite(&name) else {
		return Err(GatewayError::NotFound(format!(
			"Unknown composite endpoint `{name}`"
		)));
	};
	if !environment_allowed(&endpoint.allowed_environments, &env) {
		return Err(GatewayError::NotFound(format!(
			"Unknown composite endpoint `{name}`"
		)));
	}
	if !endpoint.allowed_methods.allows(req.method()) {
		return Err(GatewayError::MethodNotAllowed);
	}
	resolve_environment(&gw, &env, true).await?;

	let body = read_json_body(req, gw.config.request.max_buffered_body).await?;
	let outcome = gw
		.composite
		.execute(&endpoint, &endpoints, body, ctx.remaining())
		.await?;
	Ok(json_response(StatusCode::OK, &outcome))
}

async fn webhook_handler(
	State(gw): State<Arc<Gateway>>,
	Path((env, id)): Path<(String, String)>,
	req: Request,
) -> Result<Response, GatewayError> {
	let ctx = request_context(&req)?;
	let endpoints = gw.registry.snapshot();
	// One webhook sink definition covers all ids it allows; find the first
	// definition that admits this id.
	let endpoint = endpoints
		.webhook
		.values()
		.find(|w| w.webhook_id_allowed(&id))
		.cloned()
		.ok_or_else(|| GatewayError::Webhook(WebhookError::UnknownWebhookId(id.clone())))?;

	let resolved = resolve_environment(&gw, &env, true).await?;
	let body = read_json_body(req, gw.config.request.max_buffered_body).await?;
	let outcome = gw
		.webhook
		.handle(&endpoint, &resolved, &id, body, ctx.remaining())
		.await?;
	Ok(json_response(StatusCode::OK, &outcome))
}

// ---------------------------------------------------------------------------
// Helpers

fn request_context(req: &Request) -> Result<RequestContext, GatewayError> {
	req
		.extensions()
		.get::<RequestContext>()
		.cloned()
		.ok_or_else(|| GatewayError::Internal("request context missing".to_string()))
}

fn principal(req: &Request) -> Result<Principal, GatewayError> {
	req
		.extensions()
		.get::<Principal>()
		.cloned()
		.ok_or(GatewayError::Auth(AuthError::Missing))
}

async fn resolve_environment(
	gw: &Gateway,
	env: &str,
	known_endpoint: bool,
) -> Result<Arc<ResolvedEnvironment>, GatewayError> {
	gw.resolver.resolve(env).await.map_err(|e| match e {
		EnvironmentError::Unknown(_) | EnvironmentError::MissingConnectionString(_) => {
			GatewayError::EnvironmentUnknown {
				env: env.to_string(),
				known_endpoint,
			}
		},
		other => GatewayError::Internal(other.to_string()),
	})
}

fn query_map(req: &Request) -> HashMap<String, String> {
	req
		.uri()
		.query()
		.map(|q| {
			url::form_urlencoded::parse(q.as_bytes())
				.map(|(k, v)| (k.into_owned(), v.into_owned()))
				.collect()
		})
		.unwrap_or_default()
}

/// `{scheme}://{host}` as the client addressed us, for URL rewriting.
fn request_origin(req: &Request) -> String {
	let scheme = req
		.headers()
		.get("x-forwarded-proto")
		.and_then(|v| v.to_str().ok())
		.unwrap_or("http");
	let host = req
		.headers()
		.get(header::HOST)
		.and_then(|v| v.to_str().ok())
		.or_else(|| req.uri().host())
		.unwrap_or("localhost");
	format!("{scheme}://{host}")
}

async fn read_json_body(
	req: Request,
	limit: usize,
) -> Result<serde_json::Value, GatewayError> {
	let bytes = crate::http::read_body_with_limit(req.into_body(), limit)
		.await
		.map_err(|e| GatewayError::Validation(format!("failed to read request body: {e}")))?;
	if bytes.is_empty() {
		return Ok(serde_json::Value::Null);
	}
	serde_json::from_slice(&bytes)
		.map_err(|e| GatewayError::Validation(format!("invalid JSON body: {e}")))
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response {
	let body = serde_json::to_vec(value).unwrap_or_default();
	let mut response = Response::new(Body::from(body));
	*response.status_mut() = status;
	response.headers_mut().insert(
		header::CONTENT_TYPE,
		http::HeaderValue::from_static("application/json"),
	);
	response
}

// ---------------------------------------------------------------------------
// Error surface

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
	#[error(transparent)]
	Auth(#[from] AuthError),

	#[error("Rate limit exceeded")]
	RateLimited { retry_after_secs: u64 },

	#[error("{0}")]
	NotFound(String),

	#[error("Method not allowed")]
	MethodNotAllowed,

	#[error("{0}")]
	Validation(String),

	#[error("Unknown environment `{env}`")]
	EnvironmentUnknown { env: String, known_endpoint: bool },

	#[error(transparent)]
	Sql(#[from] SqlError),

	#[error(transparent)]
	Proxy(#[from] ProxyError),

	#[error(transparent)]
	Composite(#[from] CompositeError),

	#[error(transparent)]
	Webhook(#[from] WebhookError),

	#[error("Internal server error")]
	Internal(String),
}

impl IntoResponse for GatewayError {
	fn into_response(self) -> axum::response::Response {
		let (status, mut body, retry_after) = self.parts();
		if let Some(object) = body.as_object_mut() {
			object.insert("success".to_string(), json!(false));
		}
		let mut response = json_response(status, &body);
		if let Some(secs) = retry_after {
			if let Ok(value) = http::HeaderValue::from_str(&secs.to_string()) {
				response.headers_mut().insert(header::RETRY_AFTER, value);
			}
		}
		response
	}
}

impl GatewayError {
	fn parts(&self) -> (StatusCode, serde_json::Value, Option<u64>) {
		match self {
			GatewayError::Auth(e) => auth_parts(e),
			GatewayError::RateLimited { retry_after_secs } => (
				StatusCode::TOO_MANY_REQUESTS,
				json!({ "error": "Rate limit exceeded" }),
				Some(*retry_after_secs),
			),
			GatewayError::NotFound(message) => {
				(StatusCode::NOT_FOUND, json!({ "error": message }), None)
			},
			GatewayError::MethodNotAllowed => (
				StatusCode::METHOD_NOT_ALLOWED,
				json!({ "error": "Method not allowed" }),
				None,
			),
			GatewayError::Validation(message) => {
				(StatusCode::BAD_REQUEST, json!({ "error": message }), None)
			},
			GatewayError::EnvironmentUnknown {
				env,
				known_endpoint,
			} => {
				// A bad env segment on a real endpoint is the caller's input
				// error; with no endpoint in sight it is just an unknown route.
				let status = if *known_endpoint {
					StatusCode::BAD_REQUEST
				} else {
					StatusCode::NOT_FOUND
				};
				(
					status,
					json!({ "error": format!("Unknown environment `{env}`") }),
					None,
				)
			},
			GatewayError::Sql(e) => sql_parts(e),
			GatewayError::Proxy(e) => proxy_parts(e),
			GatewayError::Composite(e) => composite_parts(e),
			GatewayError::Webhook(e) => webhook_parts(e),
			GatewayError::Internal(detail) => {
				error!(detail = %detail, "internal error");
				(
					StatusCode::INTERNAL_SERVER_ERROR,
					json!({ "error": "Internal server error" }),
					None,
				)
			},
		}
	}
}

fn auth_parts(e: &AuthError) -> (StatusCode, serde_json::Value, Option<u64>) {
	match e {
		AuthError::Missing => (
			StatusCode::UNAUTHORIZED,
			json!({ "error": "Authentication required" }),
			None,
		),
		AuthError::Invalid => (
			StatusCode::UNAUTHORIZED,
			json!({ "error": "Invalid or expired token" }),
			None,
		),
		AuthError::EnvironmentDenied { env, available } => (
			StatusCode::FORBIDDEN,
			json!({
				"error": format!("Access to environment `{env}` denied"),
				"requestedEnvironment": env,
				"availableEnvironments": available,
			}),
			None,
		),
		AuthError::ScopeDenied {
			endpoint,
			available,
		} => (
			StatusCode::FORBIDDEN,
			json!({
				"error": format!("Access to endpoint `{endpoint}` denied"),
				"requestedEndpoint": endpoint,
				"availableScopes": available,
			}),
			None,
		),
		AuthError::Store(e) => {
			error!(error = %e, "token store failure");
			(
				StatusCode::INTERNAL_SERVER_ERROR,
				json!({ "error": "Internal server error" }),
				None,
			)
		},
	}
}

fn sql_parts(e: &SqlError) -> (StatusCode, serde_json::Value, Option<u64>) {
	match e {
		SqlError::MethodNotAllowed => (
			StatusCode::METHOD_NOT_ALLOWED,
			json!({ "error": "Method not allowed" }),
			None,
		),
		SqlError::Db(db) => {
			error!(error = %db, "database call failed");
			(
				StatusCode::INTERNAL_SERVER_ERROR,
				json!({ "error": "Internal server error" }),
				None,
			)
		},
		validation => (
			StatusCode::BAD_REQUEST,
			json!({ "error": validation.to_string() }),
			None,
		),
	}
}

fn proxy_parts(e: &ProxyError) -> (StatusCode, serde_json::Value, Option<u64>) {
	match e {
		ProxyError::MethodNotAllowed => (
			StatusCode::METHOD_NOT_ALLOWED,
			json!({ "error": "Method not allowed" }),
			None,
		),
		other => {
			warn!(error = %other, "proxy upstream failure");
			(
				StatusCode::BAD_GATEWAY,
				json!({ "error": format!("Upstream call failed: {other}") }),
				None,
			)
		},
	}
}

fn composite_parts(e: &CompositeError) -> (StatusCode, serde_json::Value, Option<u64>) {
	match e {
		CompositeError::StepFailed {
			index,
			name,
			status,
			body,
		} => (
			StatusCode::BAD_GATEWAY,
			json!({
				"error": format!("Composite step `{name}` failed"),
				"step": index,
				"stepName": name,
				"upstreamStatus": status,
				"upstreamBody": body,
			}),
			None,
		),
		validation => (
			StatusCode::BAD_REQUEST,
			json!({ "error": validation.to_string() }),
			None,
		),
	}
}

fn webhook_parts(e: &WebhookError) -> (StatusCode, serde_json::Value, Option<u64>) {
	match e {
		WebhookError::UnknownWebhookId(id) => (
			StatusCode::BAD_REQUEST,
			json!({ "error": format!("Unknown webhook id `{id}`") }),
			None,
		),
		other => {
			error!(error = %other, "webhook persistence failure");
			(
				StatusCode::INTERNAL_SERVER_ERROR,
				json!({ "error": "Failed to persist webhook payload" }),
				None,
			)
		},
	}
}
