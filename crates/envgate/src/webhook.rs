//! Webhook ingest: persist an inbound JSON payload as one row.

use chrono::Utc;

use crate::environment::ResolvedEnvironment;
use crate::odata::{self, SqlValue};
use crate::sql::client::{DbConnector, DbError};
use crate::types::endpoint::WebhookEndpoint;
use crate::*;

#[derive(thiserror::Error, Debug)]
pub enum WebhookError {
	#[error("Unknown webhook id `{0}`")]
	UnknownWebhookId(String),

	#[error("invalid webhook table configuration: {0}")]
	BadTable(#[from] odata::ODataError),

	#[error("failed to persist webhook payload")]
	Persistence(#[from] DbError),
}

pub struct WebhookExecutor {
	connector: Arc<dyn DbConnector>,
}

impl WebhookExecutor {
	pub fn new(connector: Arc<dyn DbConnector>) -> Self {
		Self { connector }
	}

	pub async fn handle(
		&self,
		endpoint: &WebhookEndpoint,
		env: &ResolvedEnvironment,
		webhook_id: &str,
		payload: serde_json::Value,
		deadline: Duration,
	) -> Result<serde_json::Value, WebhookError> {
		if !endpoint.webhook_id_allowed(webhook_id) {
			return Err(WebhookError::UnknownWebhookId(webhook_id.to_string()));
		}

		let table = format!(
			"{}.{}",
			odata::bracket(&endpoint.schema)?,
			odata::bracket(&endpoint.table)?
		);
		let sql = format!(
			"INSERT INTO {table} (WebhookId, Payload, Environment, ReceivedAt) \
			VALUES (@p0, @p1, @p2, @p3)"
		);
		let bindings = vec![
			SqlValue::Str(webhook_id.to_string()),
			SqlValue::Str(payload.to_string()),
			SqlValue::Str(env.name.to_string()),
			SqlValue::Str(Utc::now().to_rfc3339()),
		];

		let db = self.connector.connect(env)?;
		db.query(&sql, &bindings, deadline).await?;
		info!(webhook = %endpoint.name, id = webhook_id, env = %env.name, "webhook payload persisted");

		Ok(serde_json::json!({ "success": true }))
	}
}

#[cfg(test)]
mod tests {
	use async_trait::async_trait;

	use super::*;
	use crate::sql::client::{DbClient, JsonRow, PoolStatus, ProcParam};

	#[derive(Default)]
	struct RecordingDb {
		queries: parking_lot::Mutex<Vec<(String, Vec<SqlValue>)>>,
		fail: bool,
	}

	#[async_trait]
	impl DbClient for RecordingDb {
		async fn query(
			&self,
			sql: &str,
			bindings: &[SqlValue],
			_deadline: Duration,
		) -> Result<Vec<JsonRow>, DbError> {
			if self.fail {
				return Err(DbError::Query("insert failed".to_string()));
			}
			self
				.queries
				.lock()
				.push((sql.to_string(), bindings.to_vec()));
			Ok(vec![])
		}

		async fn execute_procedure(
			&self,
			_procedure: &str,
			_params: &[ProcParam],
			_deadline: Duration,
		) -> Result<Vec<JsonRow>, DbError> {
			unreachable!("webhooks never call procedures")
		}

		async fn ping(&self) -> Result<(), DbError> {
			Ok(())
		}

		fn status(&self) -> PoolStatus {
			PoolStatus::default()
		}
	}

	struct Conn(Arc<RecordingDb>);

	impl DbConnector for Conn {
		fn connect(
			&self,
			_env: &ResolvedEnvironment,
		) -> Result<Arc<dyn DbClient>, DbError> {
			Ok(self.0.clone())
		}
	}

	fn endpoint() -> WebhookEndpoint {
		WebhookEndpoint {
			name: gate_core::strng::new("Inbound"),
			schema: "dbo".to_string(),
			table: "WebhookData".to_string(),
			allowed_webhook_ids: vec!["orders".to_string()],
		}
	}

	fn env() -> ResolvedEnvironment {
		ResolvedEnvironment {
			name: gate_core::strng::new("prod"),
			server_name: "SQL01".to_string(),
			connection_string: "Server=sql01;Database=erp;".to_string(),
		}
	}

	#[tokio::test]
	async fn persists_allowed_webhook() {
		let db = Arc::new(RecordingDb::default());
		let exec = WebhookExecutor::new(Arc::new(Conn(db.clone())));
		let out = exec
			.handle(
				&endpoint(),
				&env(),
				"orders",
				serde_json::json!({ "order": 1 }),
				Duration::from_secs(10),
			)
			.await
			.unwrap();
		assert_eq!(out, serde_json::json!({ "success": true }));

		let (sql, bindings) = db.queries.lock()[0].clone();
		assert!(sql.starts_with("INSERT INTO [dbo].[WebhookData]"));
		assert_eq!(bindings[0], SqlValue::Str("orders".to_string()));
		assert_eq!(bindings[1], SqlValue::Str(r#"{"order":1}"#.to_string()));
		assert_eq!(bindings[2], SqlValue::Str("prod".to_string()));
	}

	#[tokio::test]
	async fn unknown_id_is_rejected_without_db_call() {
		let db = Arc::new(RecordingDb::default());
		let exec = WebhookExecutor::new(Arc::new(Conn(db.clone())));
		let err = exec
			.handle(
				&endpoint(),
				&env(),
				"payments",
				serde_json::json!({}),
				Duration::from_secs(10),
			)
			.await
			.unwrap_err();
		assert!(matches!(err, WebhookError::UnknownWebhookId(_)));
		assert!(db.queries.lock().is_empty());
	}

	#[tokio::test]
	async fn persistence_failure_maps_to_500_class_error() {
		let db = Arc::new(RecordingDb {
			fail: true,
			..Default::default()
		});
		let exec = WebhookExecutor::new(Arc::new(Conn(db)));
		let err = exec
			.handle(
				&endpoint(),
				&env(),
				"orders",
				serde_json::json!({}),
				Duration::from_secs(10),
			)
			.await
			.unwrap_err();
		assert!(matches!(err, WebhookError::Persistence(_)));
	}
}
