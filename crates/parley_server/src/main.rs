#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use parley_server::config::{default_config_path, load_config_from_path};
use parley_server::server::health::{HealthState, spawn_health_server};
use parley_server::server::room::RoomConfig;
use parley_server::server::session::SessionSettings;
use parley_server::server::tls::build_tls_acceptor;
use parley_server::server::{ChatServer, ServerContext};
use parley_store::{SqlStore, Store};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_server [--listen host:port] [--config path]\n\
\n\
Options:\n\
\t--listen  Listen address override (default: from config, 127.0.0.1:18330)\n\
\t--config  Config file path (default: ~/.parley/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

struct CliArgs {
	listen: Option<String>,
	config: Option<PathBuf>,
}

fn parse_args() -> CliArgs {
	let mut args = CliArgs {
		listen: None,
		config: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--listen" | "--bind" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--listen must be non-empty (expected host:port)");
					usage_and_exit();
				}
				args.listen = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_rustls_crypto_provider() {
	let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_server=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();
	let config_path = match args.config {
		Some(path) => path,
		None => default_config_path()?,
	};
	let cfg = load_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let store: Arc<dyn Store> = Arc::new(
		SqlStore::connect(&cfg.persistence.database_url)
			.await
			.context("connect store")?,
	);

	let settings = SessionSettings {
		keepalive_interval: Duration::from_secs(cfg.server.keepalive_secs),
		..SessionSettings::default()
	};
	let room_cfg = RoomConfig {
		subscriber_queue_capacity: cfg.server.subscriber_queue_capacity,
		..RoomConfig::default()
	};
	let ctx = ServerContext::new(store, settings, room_cfg);

	let hydrated = ctx.rooms.hydrate().await.context("hydrate persisted rooms")?;
	info!(rooms = hydrated, "hydrated persisted rooms");

	let health_state = HealthState::new(Arc::clone(&ctx.registry), Arc::clone(&ctx.rooms));
	if let Some(bind) = cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let tls = build_tls_acceptor(&cfg.server)?;

	let listen: SocketAddr = args
		.listen
		.unwrap_or_else(|| cfg.server.listen_addr.clone())
		.parse()
		.context("parse listen address (expected host:port)")?;

	let server = ChatServer::bind(listen, ctx, tls.clone()).await?;
	health_state.mark_ready();
	info!(addr = %server.local_addr()?, tls = tls.is_some(), "listening for connections");

	server.run().await
}
