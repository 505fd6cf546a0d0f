//! Tracing subscriber bootstrap.
//!
//! One compact layer on stderr, filtered by `RUST_LOG` (default `info`), and
//! an optional rolling file layer. File logs rotate daily and old files are
//! pruned past a retention count, so a long-lived gateway cannot fill a disk
//! with request traffic.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, Clone)]
pub struct FileLogging {
	pub directory: PathBuf,
	pub filename_prefix: String,
	pub max_retained_files: usize,
}

impl Default for FileLogging {
	fn default() -> Self {
		Self {
			directory: PathBuf::from("log"),
			filename_prefix: "envgate".to_string(),
			max_retained_files: 10,
		}
	}
}

/// Keeps the non-blocking file writer alive; dropping it flushes and stops
/// the background writer thread.
pub struct TelemetryGuard {
	_file: Option<WorkerGuard>,
}

pub fn setup(file: Option<FileLogging>) -> anyhow::Result<TelemetryGuard> {
	let filter =
		|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

	let stderr_layer = tracing_subscriber::fmt::layer()
		.with_writer(std::io::stderr)
		.compact()
		.with_filter(filter());

	let (file_layer, guard) = match file {
		Some(cfg) => {
			let appender = rolling::RollingFileAppender::builder()
				.rotation(rolling::Rotation::DAILY)
				.filename_prefix(&cfg.filename_prefix)
				.filename_suffix("log")
				.max_log_files(cfg.max_retained_files)
				.build(&cfg.directory)?;
			let (writer, guard) = tracing_appender::non_blocking(appender);
			let layer = tracing_subscriber::fmt::layer()
				.with_writer(writer)
				.with_ansi(false)
				.with_filter(filter());
			(Some(layer), Some(guard))
		},
		None => (None, None),
	};

	tracing_subscriber::registry()
		.with(stderr_layer)
		.with(file_layer)
		.try_init()?;

	Ok(TelemetryGuard { _file: guard })
}

/// Test-friendly variant: install a plain stderr subscriber if none is set.
pub fn setup_for_tests() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
		)
		.with_test_writer()
		.try_init();
}
