//! Upstream HTTP client shared by the proxy, composite, and secret-store
//! paths.

use crate::*;

/// Per-request deadlines are applied at the call sites; the builder only
/// fixes connection-level behavior.
pub fn upstream_client() -> anyhow::Result<reqwest::Client> {
	let client = reqwest::Client::builder()
		.redirect(reqwest::redirect::Policy::none())
		.connect_timeout(Duration::from_secs(10))
		.build()?;
	Ok(client)
}
