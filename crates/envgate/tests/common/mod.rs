//! Shared fixtures: an on-disk gateway layout (endpoints, environments,
//! token store) and a scripted database fake.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use envgate::auth::store::SqliteTokenStore;
use envgate::auth::store::seed::{TokenSpec, issue_token};
use envgate::config::Config;
use envgate::environment::ResolvedEnvironment;
use envgate::gateway::Gateway;
use envgate::odata::SqlValue;
use envgate::registry::EndpointRegistry;
use envgate::sql::client::{DbClient, DbConnector, DbError, JsonRow, PoolStatus, ProcParam};

#[derive(Default)]
pub struct ScriptedDb {
	pub rows: parking_lot::Mutex<Vec<JsonRow>>,
	pub queries: parking_lot::Mutex<Vec<(String, Vec<SqlValue>)>>,
	pub procs: parking_lot::Mutex<Vec<(String, Vec<ProcParam>)>>,
}

impl ScriptedDb {
	pub fn set_rows(&self, rows: Vec<serde_json::Value>) {
		*self.rows.lock() = rows
			.into_iter()
			.map(|v| v.as_object().cloned().unwrap_or_default())
			.collect();
	}

	pub fn query_count(&self) -> usize {
		self.queries.lock().len()
	}
}

#[async_trait]
impl DbClient for ScriptedDb {
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

pub struct ScriptedConnector(pub Arc<ScriptedDb>);

impl DbConnector for ScriptedConnector {
	fn connect(&self, _env: &ResolvedEnvironment) -> Result<Arc<dyn DbClient>, DbError> {
		Ok(self.0.clone())
	}
}

pub struct TestGateway {
	pub base: String,
	pub db: Arc<ScriptedDb>,
	pub token: String,
	_tmp: tempfile::TempDir,
}

pub struct TestOptions {
	pub config: Config,
	pub scopes: String,
	pub environments: String,
	/// `(name, entity.json)` pairs per kind directory.
	pub sql_endpoints: Vec<(String, String)>,
	pub proxy_endpoints: Vec<(String, String)>,
	pub webhook_endpoints: Vec<(String, String)>,
}

impl Default for TestOptions {
	fn default() -> Self {
		Self {
			config: Config::default(),
			scopes: "*".to_string(),
			environments: "*".to_string(),
			sql_endpoints: vec![],
			proxy_endpoints: vec![],
			webhook_endpoints: vec![],
		}
	}
}

fn write_entity(root: &Path, kind: &str, name: &str, body: &str) {
	let dir = root.join("endpoints").join(kind).join(name);
	std::fs::create_dir_all(&dir).unwrap();
	std::fs::write(dir.join("entity.json"), body).unwrap();
}

pub async fn start(options: TestOptions) -> TestGateway {
	let tmp = tempfile::tempdir().unwrap();
	let root = tmp.path();

	for (name, body) in &options.sql_endpoints {
		write_entity(root, "SQL", name, body);
	}
	for (name, body) in &options.proxy_endpoints {
		write_entity(root, "Proxy", name, body);
	}
	for (name, body) in &options.webhook_endpoints {
		write_entity(root, "Webhooks", name, body);
	}

	let env_dir = root.join("environments").join("prod");
	std::fs::create_dir_all(&env_dir).unwrap();
	std::fs::write(
		env_dir.join("settings.json"),
		r#"{ "ServerName": "SQLTEST", "ConnectionString": "Server=test;Database=erp;" }"#,
	)
	.unwrap();

	let token_path = root.join("auth.db");
	let token = issue_token(
		&token_path,
		TokenSpec {
			username: "svc-test",
			allowed_scopes: &options.scopes,
			allowed_environments: &options.environments,
			expires_at: None,
		},
	)
	.unwrap();

	let mut config = options.config;
	config.endpoints_directory = root.join("endpoints");
	config.environments_directory = root.join("environments");
	config.auth.token_store_path = token_path.clone();

	let db = Arc::new(ScriptedDb::default());
	let registry = Arc::new(EndpointRegistry::load(&config.endpoints_directory));
	let gateway = Gateway::with_dependencies(
		config,
		registry,
		Arc::new(SqliteTokenStore::new(token_path)),
		Arc::new(ScriptedConnector(db.clone())),
		reqwest::Client::new(),
	);

	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let app = gateway.router();
	tokio::spawn(async move {
		axum::serve(
			listener,
			app.into_make_service_with_connect_info::<SocketAddr>(),
		)
		.await
		.unwrap();
	});

	TestGateway {
		base: format!("http://{addr}"),
		db,
		token,
		_tmp: tmp,
	}
}

impl TestGateway {
	pub fn url(&self, path: &str) -> String {
		format!("{}{path}", self.base)
	}

	pub fn get(&self, path: &str) -> reqwest::RequestBuilder {
		reqwest::Client::new()
			.get(self.url(path))
			.bearer_auth(&self.token)
	}

	pub fn post(&self, path: &str) -> reqwest::RequestBuilder {
		reqwest::Client::new()
			.post(self.url(path))
			.bearer_auth(&self.token)
	}
}
