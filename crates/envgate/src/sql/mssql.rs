//! MSSQL `DbClient` over tiberius.
//!
//! One pool per connection string. Connections are plain TCP + TDS; a
//! semaphore bounds the total, an idle stack provides reuse, and a small
//! number of connections is opened eagerly so the first request does not pay
//! the full handshake. A connection that errors or times out is dropped
//! rather than returned — after a cancelled query the stream state is
//! unknowable.

use std::borrow::Cow;

use async_trait::async_trait;
use tiberius::{ColumnData, FromSql, ToSql};
use tokio::net::TcpStream;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::config::SqlSettings;
use crate::environment::sanitize_connection_string;
use crate::odata::SqlValue;
use crate::sql::client::{DbClient, DbError, JsonRow, PoolStatus, ProcParam};
use crate::*;

type Connection = tiberius::Client<Compat<TcpStream>>;

pub struct MssqlPool {
	config: tiberius::Config,
	/// Sanitized, for logs only.
	label: String,
	pool_size: usize,
	idle: parking_lot::Mutex<Vec<Connection>>,
	permits: Arc<Semaphore>,
}

impl MssqlPool {
	pub fn new(connection_string: &str, settings: &SqlSettings) -> Result<Arc<Self>, DbError> {
		let config = tiberius::Config::from_ado_string(connection_string)
			.map_err(|e| DbError::Config(e.to_string()))?;
		let pool = Arc::new(Self {
			config,
			label: sanitize_connection_string(connection_string),
			pool_size: settings.pool_size,
			idle: parking_lot::Mutex::new(Vec::new()),
			permits: Arc::new(Semaphore::new(settings.pool_size)),
		});
		pool.clone().warm(settings.warm_connections);
		Ok(pool)
	}

	/// Opens `count` connections in the background and parks them idle.
	fn warm(self: Arc<Self>, count: usize) {
		for _ in 0..count {
			let pool = self.clone();
			tokio::spawn(async move {
				match pool.open().await {
					Ok(conn) => pool.idle.lock().push(conn),
					Err(e) => warn!(pool = %pool.label, error = %e, "pool warm-up connection failed"),
				}
			});
		}
	}

	async fn open(&self) -> Result<Connection, DbError> {
		let addr = self.config.get_addr();
		let tcp = TcpStream::connect(addr)
			.await
			.map_err(|e| DbError::Connect(e.to_string()))?;
		tcp
			.set_nodelay(true)
			.map_err(|e| DbError::Connect(e.to_string()))?;
		tiberius::Client::connect(self.config.clone(), tcp.compat_write())
			.await
			.map_err(|e| DbError::Connect(e.to_string()))
	}

	async fn acquire(&self) -> Result<(Connection, tokio::sync::OwnedSemaphorePermit), DbError> {
		let permit = self
			.permits
			.clone()
			.acquire_owned()
			.await
			.map_err(|_| DbError::Connect("pool closed".to_string()))?;
		let existing = self.idle.lock().pop();
		let conn = match existing {
			Some(conn) => conn,
			None => self.open().await?,
		};
		Ok((conn, permit))
	}

	fn release(&self, conn: Connection) {
		self.idle.lock().push(conn);
	}

	async fn run<T, F, Fut>(&self, deadline: Duration, op: F) -> Result<T, DbError>
	where
		F: FnOnce(Connection) -> Fut,
		Fut: Future<Output = (Connection, Result<T, DbError>)>,
	{
		let (conn, _permit) = self.acquire().await?;
		match tokio::time::timeout(deadline, op(conn)).await {
			Ok((conn, Ok(out))) => {
				self.release(conn);
				Ok(out)
			},
			// On failure or timeout the connection is dropped, not reused:
			// the stream may hold unread result state.
			Ok((_conn, Err(e))) => Err(e),
			Err(_) => Err(DbError::Timeout),
		}
	}
}

#[async_trait]
impl DbClient for MssqlPool {
	async fn query(
		&self,
		sql: &str,
		bindings: &[SqlValue],
		deadline: Duration,
	) -> Result<Vec<JsonRow>, DbError> {
		let sql = to_native_placeholders(sql, bindings.len());
		let bound: Vec<BoundValue> = bindings.iter().map(BoundValue::from_sql_value).collect();
		self
			.run(deadline, |mut conn| async move {
				let params: Vec<&dyn ToSql> = bound.iter().map(|b| b as &dyn ToSql).collect();
				let result = match conn.query(sql.as_str(), &params).await {
					Ok(stream) => match stream.into_first_result().await {
						Ok(rows) => Ok(rows.into_iter().map(row_to_json).collect()),
						Err(e) => Err(DbError::Query(e.to_string())),
					},
					Err(e) => Err(DbError::Query(e.to_string())),
				};
				(conn, result)
			})
			.await
	}

	async fn execute_procedure(
		&self,
		procedure: &str,
		params: &[ProcParam],
		deadline: Duration,
	) -> Result<Vec<JsonRow>, DbError> {
		// EXEC [dbo].[Proc] @Name = @P1, ... — procedure and argument names
		// were validated upstream, values ride as parameters.
		let assignments = params
			.iter()
			.enumerate()
			.map(|(i, p)| format!("@{} = @P{}", p.name, i + 1))
			.collect::<Vec<_>>()
			.join(", ");
		let sql = if assignments.is_empty() {
			format!("EXEC {procedure}")
		} else {
			format!("EXEC {procedure} {assignments}")
		};
		let bound: Vec<BoundValue> = params
			.iter()
			.map(|p| BoundValue::from_json(&p.value))
			.collect();
		self
			.run(deadline, |mut conn| async move {
				let args: Vec<&dyn ToSql> = bound.iter().map(|b| b as &dyn ToSql).collect();
				let result = match conn.query(sql.as_str(), &args).await {
					Ok(stream) => match stream.into_first_result().await {
						Ok(rows) => Ok(rows.into_iter().map(row_to_json).collect()),
						Err(e) => Err(DbError::Query(e.to_string())),
					},
					Err(e) => Err(DbError::Query(e.to_string())),
				};
				(conn, result)
			})
			.await
	}

	async fn ping(&self) -> Result<(), DbError> {
		self
			.run(Duration::from_secs(5), |mut conn| async move {
				let result = match conn.simple_query("SELECT 1").await {
					Ok(stream) => stream
						.into_first_result()
						.await
						.map(|_| ())
						.map_err(|e| DbError::Query(e.to_string())),
					Err(e) => Err(DbError::Query(e.to_string())),
				};
				(conn, result)
			})
			.await
	}

	fn status(&self) -> PoolStatus {
		// Outstanding permits = requests currently holding a connection.
		// Derived rather than counted so a cancelled request cannot skew it.
		PoolStatus {
			active: self.pool_size - self.permits.available_permits(),
			idle: self.idle.lock().len(),
		}
	}
}

impl MssqlPool {
	pub fn label(&self) -> &str {
		&self.label
	}

	/// True when a request could acquire a connection without waiting.
	pub fn has_capacity(&self) -> bool {
		match self.permits.clone().try_acquire_owned() {
			Ok(_permit) => true,
			Err(TryAcquireError::NoPermits) => false,
			Err(TryAcquireError::Closed) => false,
		}
	}
}

/// The translator emits zero-based `@p0` placeholders; TDS wants one-based
/// `@P1`. Rewritten from the highest index down so `@p1` never clobbers
/// `@p10`.
fn to_native_placeholders(sql: &str, count: usize) -> String {
	let mut out = sql.to_string();
	for i in (0..count).rev() {
		out = out.replace(&format!("@p{i}"), &format!("@P{}", i + 1));
	}
	out
}

/// Owned parameter that can outlive the borrow handed to tiberius.
enum BoundValue {
	Str(String),
	Int(i64),
	Float(f64),
	Bool(bool),
	Null,
}

impl BoundValue {
	fn from_sql_value(v: &SqlValue) -> Self {
		match v {
			SqlValue::Str(s) => BoundValue::Str(s.clone()),
			SqlValue::Int(i) => BoundValue::Int(*i),
		}
	}

	/// JSON scalars map directly; arrays and objects are passed through as
	/// their JSON text for the procedure to interpret.
	fn from_json(v: &serde_json::Value) -> Self {
		match v {
			serde_json::Value::Null => BoundValue::Null,
			serde_json::Value::Bool(b) => BoundValue::Bool(*b),
			serde_json::Value::Number(n) => {
				if let Some(i) = n.as_i64() {
					BoundValue::Int(i)
				} else {
					BoundValue::Float(n.as_f64().unwrap_or(0.0))
				}
			},
			serde_json::Value::String(s) => BoundValue::Str(s.clone()),
			other => BoundValue::Str(other.to_string()),
		}
	}
}

impl ToSql for BoundValue {
	fn to_sql(&self) -> ColumnData<'_> {
		match self {
			BoundValue::Str(s) => ColumnData::String(Some(Cow::from(s.as_str()))),
			BoundValue::Int(i) => ColumnData::I64(Some(*i)),
			BoundValue::Float(f) => ColumnData::F64(Some(*f)),
			BoundValue::Bool(b) => ColumnData::Bit(Some(*b)),
			BoundValue::Null => ColumnData::String(None),
		}
	}
}

fn row_to_json(row: tiberius::Row) -> JsonRow {
	let names: Vec<String> = row
		.columns()
		.iter()
		.map(|c| c.name().to_string())
		.collect();
	let mut out = JsonRow::new();
	for (name, data) in names.into_iter().zip(row.into_iter()) {
		out.insert(name, column_to_json(data));
	}
	out
}

fn column_to_json(data: ColumnData<'static>) -> serde_json::Value {
	use serde_json::Value;
	match &data {
		ColumnData::U8(v) => v.map(|x| Value::from(x as i64)).unwrap_or(Value::Null),
		ColumnData::I16(v) => v.map(|x| Value::from(x as i64)).unwrap_or(Value::Null),
		ColumnData::I32(v) => v.map(|x| Value::from(x as i64)).unwrap_or(Value::Null),
		ColumnData::I64(v) => v.map(Value::from).unwrap_or(Value::Null),
		ColumnData::F32(v) => v
			.and_then(|x| serde_json::Number::from_f64(x as f64))
			.map(Value::Number)
			.unwrap_or(Value::Null),
		ColumnData::F64(v) => v
			.and_then(serde_json::Number::from_f64)
			.map(Value::Number)
			.unwrap_or(Value::Null),
		ColumnData::Bit(v) => v.map(Value::from).unwrap_or(Value::Null),
		ColumnData::String(v) => v
			.as_ref()
			.map(|s| Value::from(s.as_ref()))
			.unwrap_or(Value::Null),
		ColumnData::Guid(v) => v
			.map(|g| Value::from(g.to_string()))
			.unwrap_or(Value::Null),
		ColumnData::Numeric(v) => v
			.and_then(|n| serde_json::Number::from_f64(f64::from(n)))
			.map(Value::Number)
			.unwrap_or(Value::Null),
		ColumnData::Binary(v) => v
			.as_ref()
			.map(|b| Value::from(hex::encode(b.as_ref())))
			.unwrap_or(Value::Null),
		ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
			chrono::NaiveDateTime::from_sql(&data)
				.ok()
				.flatten()
				.map(|dt| Value::from(dt.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()))
				.unwrap_or(Value::Null)
		},
		ColumnData::Date(_) => chrono::NaiveDate::from_sql(&data)
			.ok()
			.flatten()
			.map(|d| Value::from(d.format("%Y-%m-%d").to_string()))
			.unwrap_or(Value::Null),
		ColumnData::Time(_) => chrono::NaiveTime::from_sql(&data)
			.ok()
			.flatten()
			.map(|t| Value::from(t.format("%H:%M:%S%.3f").to_string()))
			.unwrap_or(Value::Null),
		ColumnData::DateTimeOffset(_) => chrono::DateTime::<chrono::Utc>::from_sql(&data)
			.ok()
			.flatten()
			.map(|dt| Value::from(dt.to_rfc3339()))
			.unwrap_or(Value::Null),
		ColumnData::Xml(v) => v
			.as_ref()
			.map(|x| Value::from(x.as_ref().to_string()))
			.unwrap_or(Value::Null),
	}
}
