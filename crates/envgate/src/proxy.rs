//! Reverse-proxy execution: forward the request to the endpoint's target,
//! stream bodies, and rewrite upstream URLs in textual responses so clients
//! only ever see gateway addresses.

use std::collections::HashMap;
use std::net::IpAddr;

use regex::Regex;
use url::Url;

use crate::http::{self as gw_http, Body, HeaderMap, Request, Response};
use crate::types::endpoint::ProxyEndpoint;
use crate::*;

#[cfg(test)]
#[path = "proxy_tests.rs"]
mod tests;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("Method not allowed")]
	MethodNotAllowed,

	#[error("invalid upstream url: {0}")]
	InvalidTarget(String),

	#[error("upstream call failed: {0}")]
	Upstream(String),

	#[error("upstream response could not be read: {0}")]
	UpstreamBody(String),
}

/// Request-scoped inputs the executor cannot derive from the request itself.
#[derive(Debug, Clone)]
pub struct ProxyContext {
	pub env: Strng,
	/// `{scheme}://{host}` of this gateway as the client addressed it.
	pub gateway_origin: String,
	/// Trailing path segments after the endpoint name.
	pub tail: Option<String>,
	pub client_addr: Option<IpAddr>,
	pub deadline: Duration,
}

pub struct ProxyExecutor {
	client: reqwest::Client,
	forwarded_headers: bool,
	max_buffered_body: usize,
	max_inflight: usize,
	inflight: parking_lot::Mutex<HashMap<Strng, Arc<tokio::sync::Semaphore>>>,
}

impl ProxyExecutor {
	pub fn new(
		client: reqwest::Client,
		forwarded_headers: bool,
		max_buffered_body: usize,
		max_inflight: usize,
	) -> Self {
		Self {
			client,
			forwarded_headers,
			max_buffered_body,
			max_inflight,
			inflight: parking_lot::Mutex::new(HashMap::new()),
		}
	}

	fn endpoint_semaphore(&self, name: &Strng) -> Arc<tokio::sync::Semaphore> {
		let mut inflight = self.inflight.lock();
		inflight
			.entry(name.clone())
			.or_insert_with(|| Arc::new(tokio::sync::Semaphore::new(self.max_inflight)))
			.clone()
	}

	pub async fn execute(
		&self,
		endpoint: &ProxyEndpoint,
		ctx: &ProxyContext,
		req: Request,
	) -> Result<Response, ProxyError> {
		if !endpoint.allowed_methods.allows(req.method()) {
			return Err(ProxyError::MethodNotAllowed);
		}

		let semaphore = self.endpoint_semaphore(&endpoint.name);
		let _permit = semaphore
			.acquire_owned()
			.await
			.map_err(|_| ProxyError::Upstream("endpoint closed".to_string()))?;

		let url = join_target(&endpoint.target_url, ctx.tail.as_deref(), req.uri().query())?;
		let method = req.method().clone();
		let headers = upstream_headers(req.headers(), ctx.client_addr, self.forwarded_headers);

		debug!(endpoint = %endpoint.name, %url, method = %method, "proxying request");

		let upstream = self
			.client
			.request(method, url)
			.headers(headers)
			.body(reqwest::Body::wrap_stream(
				req.into_body().into_data_stream(),
			))
			.timeout(ctx.deadline)
			.send()
			.await
			.map_err(|e| ProxyError::Upstream(e.to_string()))?;

		let status = upstream.status();
		let mut headers = HeaderMap::new();
		for (name, value) in upstream.headers() {
			if gw_http::is_hop_by_hop(name) {
				continue;
			}
			headers.insert(name.clone(), value.clone());
		}

		let gateway_base = format!(
			"{}/api/{}/{}",
			ctx.gateway_origin.trim_end_matches('/'),
			ctx.env,
			endpoint.name
		);

		let body = if gw_http::is_rewritable_content_type(&headers) {
			let raw = upstream
				.bytes()
				.await
				.map_err(|e| ProxyError::UpstreamBody(e.to_string()))?;
			if raw.len() > self.max_buffered_body {
				// Too large to inspect; relay untouched.
				Body::from(raw)
			} else {
				match std::str::from_utf8(&raw) {
					Ok(text) => {
						let rewritten =
							rewrite_urls(text, &endpoint.target_url, &gateway_base);
						// The length may have changed.
						headers.remove(gw_http::header::CONTENT_LENGTH);
						Body::from(rewritten)
					},
					Err(_) => Body::from(raw),
				}
			}
		} else {
			Body::from_stream(upstream.bytes_stream())
		};

		let mut response = Response::new(body);
		*response.status_mut() = status;
		*response.headers_mut() = headers;
		Ok(response)
	}
}

/// `target_url` + trailing path segments + original query string.
pub fn join_target(
	target: &Url,
	tail: Option<&str>,
	query: Option<&str>,
) -> Result<Url, ProxyError> {
	let mut url = target.clone();
	if let Some(tail) = tail.filter(|t| !t.is_empty()) {
		{
			let mut segments = url
				.path_segments_mut()
				.map_err(|_| ProxyError::InvalidTarget("target cannot be a base".to_string()))?;
			segments.pop_if_empty();
			for segment in tail.split('/').filter(|s| !s.is_empty()) {
				segments.push(segment);
			}
		}
	}
	url.set_query(query);
	Ok(url)
}

/// Client headers minus hop-by-hop, `Host`, and `Authorization` (the gateway
/// has already authenticated the caller; upstream credentials are the
/// endpoint's own business).
pub fn upstream_headers(
	original: &HeaderMap,
	client_addr: Option<IpAddr>,
	forwarded: bool,
) -> HeaderMap {
	let mut headers = HeaderMap::new();
	for (name, value) in original {
		if gw_http::is_hop_by_hop(name) {
			continue;
		}
		match name.as_str() {
			"authorization" | "host" | "content-length" => continue,
			_ => {},
		}
		headers.append(name.clone(), value.clone());
	}
	if forwarded && let Some(addr) = client_addr {
		let chain = match original
			.get("x-forwarded-for")
			.and_then(|v| v.to_str().ok())
		{
			Some(existing) => format!("{existing}, {addr}"),
			None => addr.to_string(),
		};
		if let Ok(value) = gw_http::HeaderValue::from_str(&chain) {
			headers.insert(
				gw_http::HeaderName::from_static("x-forwarded-for"),
				value,
			);
		}
	}
	headers
}

/// Replaces upstream addresses with the gateway-facing endpoint URL.
///
/// Three anchored patterns, most specific first: the full target URL
/// (sub-paths keep their tail), the upstream origin, and the quoted bare
/// host. Unparseable targets pass through with a warning at the call site.
pub fn rewrite_urls(body: &str, target: &Url, gateway_base: &str) -> String {
	let Some(host) = target.host_str() else {
		warn!("proxy target has no host; skipping URL rewrite");
		return body.to_string();
	};

	let target_str = target.as_str().trim_end_matches('/');
	let mut out = body.replace(target_str, gateway_base);

	let origin = match target.port() {
		Some(port) => format!("{}://{}:{}", target.scheme(), host, port),
		None => format!("{}://{}", target.scheme(), host),
	};
	out = out.replace(&origin, gateway_base);

	// `"internal:8020"` / `"internal"` style references.
	let quoted_host = match target.port() {
		Some(port) => format!("{host}:{port}"),
		None => host.to_string(),
	};
	let pattern = format!("\"{}\"", regex::escape(&quoted_host));
	match Regex::new(&pattern) {
		Ok(re) => re
			.replace_all(&out, format!("\"{gateway_base}\"").as_str())
			.into_owned(),
		Err(e) => {
			warn!(error = %e, "failed to build host rewrite pattern");
			out
		},
	}
}
