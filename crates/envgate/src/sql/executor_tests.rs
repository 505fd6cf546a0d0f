use async_trait::async_trait;

use super::client::{DbClient, PoolStatus};
use super::*;
use crate::odata::SqlValue;
use crate::types::endpoint::{MethodSet, SqlEndpoint};

#[derive(Default)]
struct FakeDb {
	rows: parking_lot::Mutex<Vec<JsonRow>>,
	queries: parking_lot::Mutex<Vec<(String, Vec<SqlValue>)>>,
	procs: parking_lot::Mutex<Vec<(String, Vec<ProcParam>)>>,
}

impl FakeDb {
	fn with_rows(rows: Vec<JsonRow>) -> Arc<Self> {
		let db = Self::default();
		*db.rows.lock() = rows;
		Arc::new(db)
	}

	fn query_count(&self) -> usize {
		self.queries.lock().len()
	}
}

fn row(pairs: &[(&str, serde_json::Value)]) -> JsonRow {
	pairs
		.iter()
		.map(|(k, v)| (k.to_string(), v.clone()))
		.collect()
}

#[async_trait]
impl DbClient for FakeDb {
	async fn query(
		&self,
		sql: &str,
		bindings: &[SqlValue],
		_deadline: Duration,
	) -> Result<Vec<JsonRow>, DbError> {
		self
			.queries
			.lock()
			.push((sql.to_string(), bindings.to_vec()));
		Ok(self.rows.lock().clone())
	}

	async fn execute_procedure(
		&self,
		procedure: &str,
		params: &[ProcParam],
		_deadline: Duration,
	) -> Result<Vec<JsonRow>, DbError> {
		self
			.procs
			.lock()
			.push((procedure.to_string(), params.to_vec()));
		Ok(self.rows.lock().clone())
	}

	async fn ping(&self) -> Result<(), DbError> {
		Ok(())
	}

	fn status(&self) -> PoolStatus {
		PoolStatus::default()
	}
}

struct FakeConnector(Arc<FakeDb>);

impl DbConnector for FakeConnector {
	fn connect(
		&self,
		_env: &ResolvedEnvironment,
	) -> Result<Arc<dyn DbClient>, DbError> {
		Ok(self.0.clone())
	}
}

fn executor(db: Arc<FakeDb>) -> SqlExecutor {
	SqlExecutor::new(Arc::new(FakeConnector(db)), 10)
}

fn endpoint() -> SqlEndpoint {
	SqlEndpoint {
		name: gate_core::strng::new("Products"),
		schema: "dbo".to_string(),
		object_name: "Items".to_string(),
		primary_key: Some("ItemCode".to_string()),
		allowed_columns: vec!["ItemCode".to_string(), "Description".to_string()],
		allowed_methods: MethodSet::all_crud(),
		procedure: Some("dbo.PersistItem".to_string()),
		allowed_environments: vec![],
	}
}

fn env() -> ResolvedEnvironment {
	ResolvedEnvironment {
		name: gate_core::strng::new("prod"),
		server_name: "SQL01".to_string(),
		connection_string: "Server=sql01;Database=erp;".to_string(),
	}
}

fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
	pairs
		.iter()
		.map(|(k, v)| (k.to_string(), v.to_string()))
		.collect()
}

const DEADLINE: Duration = Duration::from_secs(30);

#[tokio::test]
async fn disallowed_select_never_reaches_the_database() {
	let db = FakeDb::with_rows(vec![]);
	let exec = executor(db.clone());
	let err = exec
		.handle_get(
			&endpoint(),
			&env(),
			"/api/prod/Products",
			&query(&[("$select", "ItemCode,Price")]),
			None,
			DEADLINE,
		)
		.await
		.unwrap_err();
	match err {
		SqlError::DisallowedColumns(cols) => assert_eq!(cols, vec!["Price".to_string()]),
		other => panic!("unexpected {other:?}"),
	}
	assert_eq!(db.query_count(), 0);
}

#[tokio::test]
async fn implicit_projection_uses_allowed_columns() {
	let db = FakeDb::with_rows(vec![]);
	let exec = executor(db.clone());
	exec
		.handle_get(
			&endpoint(),
			&env(),
			"/api/prod/Products",
			&query(&[]),
			None,
			DEADLINE,
		)
		.await
		.unwrap();
	let (sql, _) = db.queries.lock()[0].clone();
	assert!(sql.starts_with("SELECT [ItemCode], [Description] FROM [dbo].[Items]"));
}

#[tokio::test]
async fn requests_top_plus_one_and_emits_next_link() {
	// Three rows back for $top=2 means another page exists.
	let db = FakeDb::with_rows(vec![
		row(&[("ItemCode", serde_json::json!("A"))]),
		row(&[("ItemCode", serde_json::json!("B"))]),
		row(&[("ItemCode", serde_json::json!("C"))]),
	]);
	let exec = executor(db.clone());
	let resp = exec
		.handle_get(
			&endpoint(),
			&env(),
			"/api/prod/Products",
			&query(&[("$top", "2"), ("$select", "ItemCode")]),
			None,
			DEADLINE,
		)
		.await
		.unwrap();

	assert_eq!(resp.count, 2);
	assert_eq!(resp.value.len(), 2);
	assert_eq!(
		resp.next_link.as_deref(),
		Some("/api/prod/Products?$top=2&$skip=2&$select=ItemCode")
	);

	// The translated query asked for top+1.
	let (_, bindings) = db.queries.lock()[0].clone();
	assert!(bindings.contains(&SqlValue::Int(3)));
}

#[tokio::test]
async fn short_page_has_no_next_link() {
	let db = FakeDb::with_rows(vec![row(&[("ItemCode", serde_json::json!("A"))])]);
	let exec = executor(db);
	let resp = exec
		.handle_get(
			&endpoint(),
			&env(),
			"/api/prod/Products",
			&query(&[("$top", "2")]),
			None,
			DEADLINE,
		)
		.await
		.unwrap();
	assert_eq!(resp.count, 1);
	assert!(resp.next_link.is_none());
}

#[tokio::test]
async fn path_id_becomes_primary_key_filter() {
	let db = FakeDb::with_rows(vec![]);
	let exec = executor(db.clone());
	exec
		.handle_get(
			&endpoint(),
			&env(),
			"/api/prod/Products/AB-12",
			&query(&[]),
			Some("AB-12"),
			DEADLINE,
		)
		.await
		.unwrap();
	let (sql, bindings) = db.queries.lock()[0].clone();
	assert!(sql.contains("[ItemCode] = @p0"));
	assert_eq!(bindings[0], SqlValue::Str("AB-12".to_string()));
}

#[tokio::test]
async fn invalid_top_is_rejected_before_translation() {
	let db = FakeDb::with_rows(vec![]);
	let exec = executor(db.clone());
	let err = exec
		.handle_get(
			&endpoint(),
			&env(),
			"/api/prod/Products",
			&query(&[("$top", "-3")]),
			None,
			DEADLINE,
		)
		.await
		.unwrap_err();
	assert!(matches!(err, SqlError::InvalidPaging { name: "$top", .. }));
	assert!(err.is_validation());
	assert_eq!(db.query_count(), 0);
}

#[tokio::test]
async fn get_method_gate() {
	let mut ep = endpoint();
	ep.allowed_methods = MethodSet::new(vec![Method::POST]);
	let exec = executor(FakeDb::with_rows(vec![]));
	let err = exec
		.handle_get(&ep, &env(), "/api/prod/Products", &query(&[]), None, DEADLINE)
		.await
		.unwrap_err();
	assert!(matches!(err, SqlError::MethodNotAllowed));
}

#[tokio::test]
async fn post_builds_procedure_call() {
	let db = FakeDb::with_rows(vec![row(&[("Result", serde_json::json!("ok"))])]);
	let exec = executor(db.clone());
	let resp = exec
		.handle_mutation(
			&Method::POST,
			&endpoint(),
			&env(),
			"svc-integration",
			None,
			serde_json::json!({ "ItemCode": "A1", "Stock": 5 }),
			DEADLINE,
		)
		.await
		.unwrap();

	assert!(resp.success);
	assert_eq!(resp.message, "INSERT completed");
	assert!(resp.result.is_some());

	let (procedure, params) = db.procs.lock()[0].clone();
	assert_eq!(procedure, "[dbo].[PersistItem]");
	assert_eq!(params[0].name, "Method");
	assert_eq!(params[0].value, serde_json::json!("INSERT"));
	assert_eq!(params[1].name, "UserName");
	assert_eq!(params[1].value, serde_json::json!("svc-integration"));
	assert!(params.iter().any(|p| p.name == "ItemCode"));
	assert!(params.iter().any(|p| p.name == "Stock"));
}

#[tokio::test]
async fn put_requires_an_id_property() {
	let exec = executor(FakeDb::with_rows(vec![]));
	let err = exec
		.handle_mutation(
			&Method::PUT,
			&endpoint(),
			&env(),
			"svc",
			None,
			serde_json::json!({ "ItemCode": "A1" }),
			DEADLINE,
		)
		.await
		.unwrap_err();
	assert!(matches!(err, SqlError::MissingId));

	// Any casing of the id property is accepted.
	let exec = executor(FakeDb::with_rows(vec![]));
	exec
		.handle_mutation(
			&Method::PUT,
			&endpoint(),
			&env(),
			"svc",
			None,
			serde_json::json!({ "ID": 7, "ItemCode": "A1" }),
			DEADLINE,
		)
		.await
		.unwrap();
}

#[tokio::test]
async fn delete_takes_id_from_path() {
	let db = FakeDb::with_rows(vec![]);
	let exec = executor(db.clone());
	exec
		.handle_mutation(
			&Method::DELETE,
			&endpoint(),
			&env(),
			"svc",
			Some("42"),
			serde_json::Value::Null,
			DEADLINE,
		)
		.await
		.unwrap();
	let (_, params) = db.procs.lock()[0].clone();
	assert_eq!(params[2].name, "id");
	assert_eq!(params[2].value, serde_json::json!("42"));
}

#[tokio::test]
async fn mutation_without_procedure_is_rejected() {
	let mut ep = endpoint();
	ep.procedure = None;
	let exec = executor(FakeDb::with_rows(vec![]));
	let err = exec
		.handle_mutation(
			&Method::POST,
			&ep,
			&env(),
			"svc",
			None,
			serde_json::json!({}),
			DEADLINE,
		)
		.await
		.unwrap_err();
	assert!(matches!(err, SqlError::MissingProcedure));
}

#[tokio::test]
async fn hostile_property_names_are_rejected() {
	let exec = executor(FakeDb::with_rows(vec![]));
	let err = exec
		.handle_mutation(
			&Method::POST,
			&endpoint(),
			&env(),
			"svc",
			None,
			serde_json::json!({ "a = 1; DROP TABLE x; --": "boom" }),
			DEADLINE,
		)
		.await
		.unwrap_err();
	assert!(matches!(err, SqlError::InvalidParameterName(_)));
}

#[test]
fn procedure_qualification() {
	assert_eq!(qualify_procedure("PersistItem").unwrap(), "[dbo].[PersistItem]");
	assert_eq!(
		qualify_procedure("sales.PersistItem").unwrap(),
		"[sales].[PersistItem]"
	);
	assert_eq!(
		qualify_procedure("[dbo].[PersistItem]").unwrap(),
		"[dbo].[PersistItem]"
	);
	assert!(qualify_procedure("dbo.Persist Item").is_err());
	assert!(qualify_procedure("a.b.c").is_err());
}
