//! Hot reload of endpoint definitions.
//!
//! Editors tend to emit a burst of create/modify/rename events per save; the
//! debouncer coalesces them so each storm triggers one rescan.

use notify::RecursiveMode;
use notify_debouncer_full::{DebounceEventResult, new_debouncer};

use crate::registry::EndpointRegistry;
use crate::*;

const DEBOUNCE: Duration = Duration::from_millis(250);

/// Keeps the underlying watcher alive; dropping stops it.
pub struct RegistryWatcher {
	_debouncer: notify_debouncer_full::Debouncer<
		notify::RecommendedWatcher,
		notify_debouncer_full::RecommendedCache,
	>,
}

pub fn watch(registry: Arc<EndpointRegistry>) -> anyhow::Result<RegistryWatcher> {
	let root = registry.root().to_path_buf();
	let handler_registry = registry.clone();
	let mut debouncer = new_debouncer(DEBOUNCE, None, move |result: DebounceEventResult| {
		match result {
			Ok(events) => {
				if events.is_empty() {
					return;
				}
				trace!(events = events.len(), "endpoint directory changed");
				handler_registry.reload();
			},
			Err(errors) => {
				for e in errors {
					warn!(error = %e, "endpoint watcher error");
				}
			},
		}
	})?;
	debouncer.watch(&root, RecursiveMode::Recursive)?;
	info!(root = %root.display(), "watching endpoint definitions");
	Ok(RegistryWatcher {
		_debouncer: debouncer,
	})
}
