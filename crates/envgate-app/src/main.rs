use std::path::PathBuf;

use clap::Parser;
use envgate::config::Config;
use envgate::gateway::Gateway;
use tracing::info;

#[derive(Parser)]
#[command(name = "envgate", about = "Environment-scoped API gateway")]
struct Args {
	/// Path to appsettings.json
	#[arg(long, default_value = "appsettings.json")]
	config: PathBuf,

	/// Override the listen address from the config file
	#[arg(long)]
	listen: Option<String>,
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let mut config = if args.config.exists() {
		Config::load(&args.config)?
	} else {
		Config::default()
	};
	if let Some(listen) = args.listen {
		config.listen = listen;
	}

	let file_logging = config.logging.directory.as_ref().map(|dir| {
		gate_core::telemetry::FileLogging {
			directory: dir.clone(),
			filename_prefix: "envgate".to_string(),
			max_retained_files: config.logging.max_retained_files,
		}
	});
	let _guard = gate_core::telemetry::setup(file_logging)?;

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(run(config))
}

async fn run(config: Config) -> anyhow::Result<()> {
	let listen = config.listen.clone();
	let gateway = Gateway::bootstrap(config).await?;
	let listener = tokio::net::TcpListener::bind(&listen).await?;
	info!(addr = %listener.local_addr()?, "gateway listening");
	gateway.serve(listener, shutdown_signal()).await
}

async fn shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
	info!("shutdown requested");
}
