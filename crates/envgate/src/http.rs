//! Shared HTTP plumbing for the executors.

pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use bytes::Bytes;

pub type Body = axum::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

/// Hop-by-hop headers are a property of one connection and must not be
/// relayed (RFC 9110 §7.6.1).
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
	matches!(
		name.as_str(),
		"connection"
			| "keep-alive"
			| "proxy-authenticate"
			| "proxy-authorization"
			| "proxy-connection"
			| "te"
			| "trailer"
			| "transfer-encoding"
			| "upgrade"
	)
}

pub async fn read_body_with_limit(body: Body, limit: usize) -> Result<Bytes, axum_core::Error> {
	axum::body::to_bytes(body, limit).await
}

/// `text/*` or anything JSON-ish is eligible for URL rewriting.
pub fn is_rewritable_content_type(headers: &HeaderMap) -> bool {
	let Some(content_type) = headers
		.get(header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
	else {
		return false;
	};
	let essence = content_type
		.split(';')
		.next()
		.unwrap_or_default()
		.trim()
		.to_ascii_lowercase();
	essence == "application/json"
		|| essence.ends_with("+json")
		|| essence.starts_with("text/")
}
