//! Database access seam.
//!
//! Executors speak to a `DbClient`; production wires in the MSSQL pool from
//! [`crate::sql::mssql`], tests wire in an in-memory fake. A `DbConnector`
//! turns a resolved environment into a client and is where per-connection-
//! string pooling lives.

use async_trait::async_trait;

use crate::environment::ResolvedEnvironment;
use crate::odata::SqlValue;
use crate::*;

pub type JsonRow = serde_json::Map<String, serde_json::Value>;

#[derive(thiserror::Error, Debug)]
pub enum DbError {
	#[error("database connection failed: {0}")]
	Connect(String),

	#[error("database query failed: {0}")]
	Query(String),

	#[error("database call timed out")]
	Timeout,

	#[error("invalid connection string: {0}")]
	Config(String),
}

/// One named stored-procedure argument (`@Method`, `@UserName`, `@ItemCode`...).
#[derive(Debug, Clone)]
pub struct ProcParam {
	pub name: String,
	pub value: serde_json::Value,
}

#[apply(schema!)]
#[derive(Default)]
pub struct PoolStatus {
	pub active: usize,
	pub idle: usize,
}

#[async_trait]
pub trait DbClient: Send + Sync {
	/// Runs a translated query. `bindings[n]` corresponds to the `@pn`
	/// placeholder in `sql`.
	async fn query(
		&self,
		sql: &str,
		bindings: &[SqlValue],
		deadline: Duration,
	) -> Result<Vec<JsonRow>, DbError>;

	/// Executes a stored procedure with named arguments, returning any result
	/// rows.
	async fn execute_procedure(
		&self,
		procedure: &str,
		params: &[ProcParam],
		deadline: Duration,
	) -> Result<Vec<JsonRow>, DbError>;

	async fn ping(&self) -> Result<(), DbError>;

	fn status(&self) -> PoolStatus;
}

pub trait DbConnector: Send + Sync {
	/// Client for one environment. Implementations cache internally so
	/// repeated calls with the same connection string share a pool.
	fn connect(&self, env: &ResolvedEnvironment) -> Result<Arc<dyn DbClient>, DbError>;
}
