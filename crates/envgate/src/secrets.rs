//! Remote secret store client.
//!
//! The store is addressed by `SECRET_STORE_URI` and holds
//! `{env}-ConnectionString` / `{env}-ServerName` entries. Any failure here is
//! survivable: the environment resolver falls back to the local settings
//! file.

use async_trait::async_trait;
use url::Url;

use crate::*;

#[derive(thiserror::Error, Debug)]
pub enum SecretError {
	#[error("secret store denied access: {0}")]
	Denied(http::StatusCode),

	#[error("secret store request failed: {0}")]
	Transport(String),

	#[error("secret store returned an unreadable payload: {0}")]
	Payload(String),
}

#[async_trait]
pub trait SecretStore: Send + Sync {
	/// `Ok(None)` means the secret does not exist; `Err` covers auth and
	/// transport failures. Both cause local fallback.
	async fn get(&self, name: &str) -> Result<Option<String>, SecretError>;
}

pub struct HttpSecretStore {
	base: Url,
	token: Option<String>,
	client: reqwest::Client,
}

impl HttpSecretStore {
	pub fn new(base: Url, client: reqwest::Client) -> Self {
		let token = std::env::var("SECRET_STORE_TOKEN")
			.ok()
			.filter(|t| !t.trim().is_empty());
		Self {
			base,
			token,
			client,
		}
	}

	pub fn from_env(client: reqwest::Client) -> Option<Self> {
		let uri = crate::config::Config::secret_store_uri()?;
		match Url::parse(&uri) {
			Ok(base) => Some(Self::new(base, client)),
			Err(e) => {
				warn!(uri, error = %e, "SECRET_STORE_URI is not a valid URL; remote secrets disabled");
				None
			},
		}
	}

	fn secret_url(&self, name: &str) -> Result<Url, SecretError> {
		self
			.base
			.join(&format!("secrets/{name}"))
			.map_err(|e| SecretError::Payload(e.to_string()))
	}
}

#[derive(Deserialize)]
struct SecretBody {
	value: String,
}

#[async_trait]
impl SecretStore for HttpSecretStore {
	async fn get(&self, name: &str) -> Result<Option<String>, SecretError> {
		let url = self.secret_url(name)?;
		let mut req = self.client.get(url);
		if let Some(token) = &self.token {
			req = req.bearer_auth(token);
		}
		let resp = req
			.send()
			.await
			.map_err(|e| SecretError::Transport(e.to_string()))?;
		match resp.status() {
			http::StatusCode::NOT_FOUND => Ok(None),
			s if s == http::StatusCode::UNAUTHORIZED || s == http::StatusCode::FORBIDDEN => {
				Err(SecretError::Denied(s))
			},
			s if s.is_success() => {
				let body: SecretBody = resp
					.json()
					.await
					.map_err(|e| SecretError::Payload(e.to_string()))?;
				Ok(Some(body.value))
			},
			s => Err(SecretError::Transport(format!("unexpected status {s}"))),
		}
	}
}
