//! Bearer-token authentication and endpoint/environment authorization.

pub mod scope;
pub mod store;
pub mod token;

use chrono::Utc;

use crate::auth::scope::ScopeSet;
use crate::auth::store::{TokenStore, TokenStoreError};
use crate::auth::token::{TokenRecord, lookup_prefix};
use crate::*;

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
	#[error("Authentication required")]
	Missing,

	#[error("Invalid or expired token")]
	Invalid,

	#[error("Access to environment `{env}` denied")]
	EnvironmentDenied { env: String, available: String },

	#[error("Access to endpoint `{endpoint}` denied")]
	ScopeDenied {
		endpoint: String,
		available: String,
	},

	// Fail closed: a broken token store must not admit anyone.
	#[error("token store failure")]
	Store(#[from] TokenStoreError),
}

/// The authenticated caller attached to every request.
#[derive(Debug, Clone)]
pub struct Principal {
	pub token_id: i64,
	pub username: Strng,
	pub scopes: ScopeSet,
	pub environments: ScopeSet,
}

impl Principal {
	pub fn from_record(record: &TokenRecord) -> Self {
		Self {
			token_id: record.id,
			username: strng::new(&record.username),
			scopes: ScopeSet::parse(&record.allowed_scopes),
			environments: ScopeSet::parse(&record.allowed_environments),
		}
	}
}

/// Paths served without authentication.
pub fn bypasses_auth(path: &str) -> bool {
	path == "/"
		|| path == "/index.html"
		|| path == "/favicon.ico"
		|| path.starts_with("/swagger")
		|| path.starts_with("/health/live")
}

pub struct AuthGate {
	store: Arc<dyn TokenStore>,
}

impl AuthGate {
	pub fn new(store: Arc<dyn TokenStore>) -> Self {
		Self { store }
	}

	pub fn store(&self) -> &Arc<dyn TokenStore> {
		&self.store
	}

	/// Resolves a bearer plaintext to a principal.
	///
	/// With a prefix key in the store this inspects only the records whose
	/// stored prefix matches (plus legacy rows without one); otherwise every
	/// active token is a candidate. Verification per candidate is constant
	/// time either way.
	pub async fn authenticate(&self, bearer: Option<&str>) -> Result<Principal, AuthError> {
		let plaintext = bearer.ok_or(AuthError::Missing)?;
		if plaintext.is_empty() {
			return Err(AuthError::Missing);
		}

		let candidates = match self.store.prefix_key().await? {
			Some(key) => {
				let prefix = lookup_prefix(&key, plaintext);
				self.store.candidates_by_prefix(&prefix).await?
			},
			None => self.store.all_tokens().await?,
		};

		let now = Utc::now();
		let mut matched: Option<&TokenRecord> = None;
		for record in &candidates {
			if !record.is_active(now) {
				continue;
			}
			// No short-circuit on match: every candidate is verified so the
			// work done does not reveal which record matched.
			if record.verify(plaintext) && matched.is_none() {
				matched = Some(record);
			}
		}

		match matched {
			Some(record) => {
				debug!(token_id = record.id, username = %record.username, "token verified");
				Ok(Principal::from_record(record))
			},
			None => Err(AuthError::Invalid),
		}
	}

	/// Environment and endpoint-scope checks for an already-authenticated
	/// principal. `scope_name` is the namespaced endpoint name
	/// (`Products`, `composite/SalesOrder`, `webhook/orders`).
	pub fn authorize(
		principal: &Principal,
		env: Option<&str>,
		scope_name: Option<&str>,
	) -> Result<(), AuthError> {
		if let Some(env) = env
			&& !env.is_empty()
			&& !principal.environments.allows(env)
		{
			return Err(AuthError::EnvironmentDenied {
				env: env.to_string(),
				available: principal.environments.as_csv(),
			});
		}
		if let Some(name) = scope_name
			&& !name.is_empty()
			&& !principal.scopes.allows(name)
		{
			return Err(AuthError::ScopeDenied {
				endpoint: name.to_string(),
				available: principal.scopes.as_csv(),
			});
		}
		Ok(())
	}
}
