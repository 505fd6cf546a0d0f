//! SQLite-backed token store.
//!
//! The store file is owned by the out-of-band admin tool; the gateway only
//! ever reads it. Queries are read-through (no caching) so revocations take
//! effect on the next request. rusqlite is synchronous, so every query runs
//! on the blocking pool with a short-lived read-only connection.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, Row};

use crate::auth::token::TokenRecord;
use crate::*;

#[derive(thiserror::Error, Debug)]
pub enum TokenStoreError {
	#[error("token store unavailable: {0}")]
	Unavailable(String),

	#[error("token store query failed: {0}")]
	Query(#[from] rusqlite::Error),

	#[error("token store contains an invalid record: {0}")]
	Corrupt(String),
}

#[async_trait]
pub trait TokenStore: Send + Sync {
	/// Records whose stored prefix matches, plus legacy records without one.
	async fn candidates_by_prefix(
		&self,
		prefix: &str,
	) -> Result<Vec<TokenRecord>, TokenStoreError>;

	/// Full scan, used only when the store carries no prefix key.
	async fn all_tokens(&self) -> Result<Vec<TokenRecord>, TokenStoreError>;

	/// Server key for computing lookup prefixes; `None` on legacy stores.
	async fn prefix_key(&self) -> Result<Option<Vec<u8>>, TokenStoreError>;

	async fn ping(&self) -> Result<(), TokenStoreError>;
}

pub struct SqliteTokenStore {
	path: PathBuf,
}

const TOKEN_COLUMNS: &str = "id, username, token_hash, token_salt, iterations, token_prefix, \
	created_at, expires_at, revoked_at, allowed_scopes, allowed_environments, description";

impl SqliteTokenStore {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	fn open_read_only(path: &Path) -> Result<Connection, TokenStoreError> {
		Connection::open_with_flags(
			path,
			OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
		)
		.map_err(|e| TokenStoreError::Unavailable(e.to_string()))
	}

	async fn run<T, F>(&self, f: F) -> Result<T, TokenStoreError>
	where
		T: Send + 'static,
		F: FnOnce(Connection) -> Result<T, TokenStoreError> + Send + 'static,
	{
		let path = self.path.clone();
		tokio::task::spawn_blocking(move || {
			let conn = Self::open_read_only(&path)?;
			f(conn)
		})
		.await
		.map_err(|e| TokenStoreError::Unavailable(e.to_string()))?
	}
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
	async fn candidates_by_prefix(
		&self,
		prefix: &str,
	) -> Result<Vec<TokenRecord>, TokenStoreError> {
		let prefix = prefix.to_string();
		self
			.run(move |conn| {
				let sql = format!(
					"SELECT {TOKEN_COLUMNS} FROM tokens WHERE token_prefix = ?1 OR token_prefix IS NULL"
				);
				let mut stmt = conn.prepare(&sql)?;
				let rows = stmt.query_map([&prefix], record_from_row)?;
				collect_records(rows)
			})
			.await
	}

	async fn all_tokens(&self) -> Result<Vec<TokenRecord>, TokenStoreError> {
		self
			.run(|conn| {
				let sql = format!("SELECT {TOKEN_COLUMNS} FROM tokens");
				let mut stmt = conn.prepare(&sql)?;
				let rows = stmt.query_map([], record_from_row)?;
				collect_records(rows)
			})
			.await
	}

	async fn prefix_key(&self) -> Result<Option<Vec<u8>>, TokenStoreError> {
		self
			.run(|conn| {
				let value: Option<String> = match conn.query_row(
					"SELECT value FROM meta WHERE key = 'prefix_key'",
					[],
					|row| row.get(0),
				) {
					Ok(v) => Some(v),
					Err(rusqlite::Error::QueryReturnedNoRows) => None,
					// Legacy store without a meta table.
					Err(rusqlite::Error::SqliteFailure(_, _)) => None,
					Err(e) => return Err(e.into()),
				};
				match value {
					Some(hex_key) => {
						let key = hex::decode(hex_key.trim())
							.map_err(|e| TokenStoreError::Corrupt(e.to_string()))?;
						Ok(Some(key))
					},
					None => Ok(None),
				}
			})
			.await
	}

	async fn ping(&self) -> Result<(), TokenStoreError> {
		self
			.run(|conn| {
				conn.query_row("SELECT COUNT(*) FROM tokens", [], |row| {
					row.get::<_, i64>(0)
				})?;
				Ok(())
			})
			.await
	}
}

fn collect_records<'a>(
	rows: impl Iterator<Item = rusqlite::Result<TokenRecord>> + 'a,
) -> Result<Vec<TokenRecord>, TokenStoreError> {
	let mut out = Vec::new();
	for row in rows {
		out.push(row?);
	}
	Ok(out)
}

fn record_from_row(row: &Row) -> rusqlite::Result<TokenRecord> {
	Ok(TokenRecord {
		id: row.get(0)?,
		username: row.get(1)?,
		token_hash: row.get(2)?,
		token_salt: row.get(3)?,
		iterations: row.get::<_, Option<u32>>(4)?.unwrap_or(0),
		token_prefix: row.get(5)?,
		created_at: parse_timestamp(row, 6)?.unwrap_or_else(Utc::now),
		expires_at: parse_timestamp(row, 7)?,
		revoked_at: parse_timestamp(row, 8)?,
		allowed_scopes: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
		allowed_environments: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
		description: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
	})
}

fn parse_timestamp(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
	let raw: Option<String> = row.get(idx)?;
	match raw {
		Some(s) if !s.trim().is_empty() => DateTime::parse_from_rfc3339(s.trim())
			.map(|dt| Some(dt.with_timezone(&Utc)))
			.map_err(|e| {
				rusqlite::Error::FromSqlConversionFailure(
					idx,
					rusqlite::types::Type::Text,
					Box::new(e),
				)
			}),
		_ => Ok(None),
	}
}

/// The store layout, shared with the admin tool. The gateway never writes
/// token rows in production; this exists so tests (and the admin tool) agree
/// on one schema.
pub mod seed {
	use super::*;
	use crate::auth::token::{self, MIN_ITERATIONS};

	pub struct TokenSpec<'a> {
		pub username: &'a str,
		pub allowed_scopes: &'a str,
		pub allowed_environments: &'a str,
		pub expires_at: Option<DateTime<Utc>>,
	}

	pub fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
		conn.execute_batch(
			"CREATE TABLE IF NOT EXISTS tokens (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				username TEXT NOT NULL,
				token_hash BLOB NOT NULL,
				token_salt BLOB NOT NULL,
				iterations INTEGER NOT NULL,
				token_prefix TEXT,
				created_at TEXT NOT NULL,
				expires_at TEXT,
				revoked_at TEXT,
				allowed_scopes TEXT NOT NULL DEFAULT '*',
				allowed_environments TEXT NOT NULL DEFAULT '*',
				description TEXT NOT NULL DEFAULT ''
			);
			CREATE INDEX IF NOT EXISTS tokens_prefix_idx ON tokens(token_prefix);
			CREATE TABLE IF NOT EXISTS meta (
				key TEXT PRIMARY KEY,
				value TEXT NOT NULL
			);",
		)
	}

	fn ensure_prefix_key(conn: &Connection) -> rusqlite::Result<Vec<u8>> {
		let existing: Option<String> = conn
			.query_row(
				"SELECT value FROM meta WHERE key = 'prefix_key'",
				[],
				|row| row.get(0),
			)
			.map(Some)
			.or_else(|e| match e {
				rusqlite::Error::QueryReturnedNoRows => Ok(None),
				other => Err(other),
			})?;
		if let Some(hex_key) = existing
			&& let Ok(key) = hex::decode(hex_key.trim())
		{
			return Ok(key);
		}
		let key = uuid::Uuid::new_v4().into_bytes().to_vec();
		conn.execute(
			"INSERT OR REPLACE INTO meta (key, value) VALUES ('prefix_key', ?1)",
			[hex::encode(&key)],
		)?;
		Ok(key)
	}

	/// Issues a token the way the admin tool does and returns the plaintext —
	/// the only moment it ever exists outside the caller's hands.
	pub fn issue_token(path: &Path, spec: TokenSpec) -> anyhow::Result<String> {
		let conn = Connection::open(path)?;
		create_schema(&conn)?;
		let server_key = ensure_prefix_key(&conn)?;

		let plaintext = format!(
			"{}{}",
			uuid::Uuid::new_v4().simple(),
			uuid::Uuid::new_v4().simple()
		);
		let salt = uuid::Uuid::new_v4().into_bytes().to_vec();
		let hash = token::derive_hash(&plaintext, &salt, MIN_ITERATIONS);
		let prefix = token::lookup_prefix(&server_key, &plaintext);

		conn.execute(
			"INSERT INTO tokens (username, token_hash, token_salt, iterations, token_prefix, \
				created_at, expires_at, allowed_scopes, allowed_environments, description) \
				VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, '')",
			rusqlite::params![
				spec.username,
				hash.as_slice(),
				salt,
				MIN_ITERATIONS,
				prefix,
				Utc::now().to_rfc3339(),
				spec.expires_at.map(|t| t.to_rfc3339()),
				spec.allowed_scopes,
				spec.allowed_environments,
			],
		)?;
		Ok(plaintext)
	}

	/// Marks every token for `username` revoked, for tests.
	pub fn revoke_user(path: &Path, username: &str) -> anyhow::Result<()> {
		let conn = Connection::open(path)?;
		conn.execute(
			"UPDATE tokens SET revoked_at = ?1 WHERE username = ?2",
			rusqlite::params![Utc::now().to_rfc3339(), username],
		)?;
		Ok(())
	}
}
