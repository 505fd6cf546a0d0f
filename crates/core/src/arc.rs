//! Shared atomic-swap handles for published snapshots.

use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};

pub type Atomic<T> = Arc<ArcSwap<T>>;
pub type AtomicOption<T> = Arc<ArcSwapOption<T>>;

pub fn new<T>(initial: T) -> Atomic<T> {
	Arc::new(ArcSwap::from_pointee(initial))
}
