//! Pool manager: one MSSQL pool per connection string, created on first use
//! and kept for the process lifetime.

use std::collections::HashMap;

use crate::config::SqlSettings;
use crate::environment::ResolvedEnvironment;
use crate::sql::client::{DbClient, DbConnector, DbError, PoolStatus};
use crate::sql::mssql::MssqlPool;
use crate::*;

pub struct PoolManager {
	settings: SqlSettings,
	pools: parking_lot::Mutex<HashMap<String, Arc<MssqlPool>>>,
}

impl PoolManager {
	pub fn new(settings: SqlSettings) -> Arc<Self> {
		Arc::new(Self {
			settings,
			pools: parking_lot::Mutex::new(HashMap::new()),
		})
	}

	/// Periodic `active/idle` visibility for each pool.
	pub fn spawn_status_logger(self: &Arc<Self>) {
		let manager = self.clone();
		let interval = Duration::from_secs(self.settings.status_log_interval_seconds.max(1));
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				ticker.tick().await;
				for (label, status) in manager.statuses() {
					info!(
						pool = %label,
						active = status.active,
						idle = status.idle,
						"connection pool status"
					);
				}
			}
		});
	}

	pub fn statuses(&self) -> Vec<(String, PoolStatus)> {
		let pools = self.pools.lock();
		pools
			.values()
			.map(|p| (p.label().to_string(), p.status()))
			.collect()
	}
}

impl DbConnector for PoolManager {
	fn connect(&self, env: &ResolvedEnvironment) -> Result<Arc<dyn DbClient>, DbError> {
		let mut pools = self.pools.lock();
		if let Some(pool) = pools.get(env.connection_string.as_str()) {
			return Ok(pool.clone());
		}
		let pool = MssqlPool::new(&env.connection_string, &self.settings)?;
		info!(env = %env.name, pool = %pool.label(), "created connection pool");
		pools.insert(env.connection_string.clone(), pool.clone());
		Ok(pool)
	}
}
