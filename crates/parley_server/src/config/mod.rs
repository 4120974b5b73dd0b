#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Load the server config from TOML and `PARLEY_*` env overrides. A
/// missing file yields the defaults.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg);
	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Listen address (`host:port`).
	pub listen_addr: String,

	/// Keepalive ping interval in seconds.
	pub keepalive_secs: u64,

	/// Per-subscriber room sink capacity.
	pub subscriber_queue_capacity: usize,

	/// PEM-encoded certificate path for inbound TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for inbound TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Refuse to accept plaintext connections.
	pub tls_only: bool,

	/// Optional metrics exporter bind address (`host:port`).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (`host:port`).
	pub health_bind: Option<String>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			listen_addr: "127.0.0.1:18330".to_string(),
			keepalive_secs: 15,
			subscriber_queue_capacity: 32,
			tls_cert_path: None,
			tls_key_path: None,
			tls_only: false,
			metrics_bind: None,
			health_bind: None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	/// Database URL (`sqlite:` or `postgres:`); the database name is a URL
	/// component.
	pub database_url: String,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			database_url: "sqlite:parley.db?mode=rwc".to_string(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	listen_addr: Option<String>,
	keepalive_secs: Option<u64>,
	subscriber_queue_capacity: Option<usize>,
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	tls_only: Option<bool>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();
		let server = ServerSettings {
			listen_addr: file
				.server
				.listen_addr
				.filter(|s| !s.trim().is_empty())
				.unwrap_or(defaults.listen_addr),
			keepalive_secs: file.server.keepalive_secs.filter(|v| *v > 0).unwrap_or(defaults.keepalive_secs),
			subscriber_queue_capacity: file
				.server
				.subscriber_queue_capacity
				.filter(|v| *v > 0)
				.unwrap_or(defaults.subscriber_queue_capacity),
			tls_cert_path: file.server.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
			tls_key_path: file.server.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
			tls_only: file.server.tls_only.unwrap_or(false),
			metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
			health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
		};

		let persistence = PersistenceSettings {
			database_url: file
				.persistence
				.database_url
				.filter(|s| !s.trim().is_empty())
				.unwrap_or_else(|| PersistenceSettings::default().database_url),
		};

		Self { server, persistence }
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("PARLEY_LISTEN_ADDR") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.listen_addr = v;
			info!("server config: listen_addr overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_KEEPALIVE_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.server.keepalive_secs = secs;
		info!(secs, "server config: keepalive_secs overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_SUBSCRIBER_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.server.subscriber_queue_capacity = capacity;
		info!(capacity, "server config: subscriber_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_TLS_CERT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_cert_path = Some(PathBuf::from(v));
			info!("server config: tls_cert_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_TLS_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_key_path = Some(PathBuf::from(v));
			info!("server config: tls_key_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_TLS_ONLY")
		&& let Some(tls_only) = parse_env_bool(&v)
	{
		cfg.server.tls_only = tls_only;
		info!(tls_only, "server config: tls_only overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = v;
			info!("persistence: database_url overridden by env");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_apply_for_missing_file() {
		let cfg = ServerConfig::from_file(FileConfig::default());
		assert_eq!(cfg.server.listen_addr, "127.0.0.1:18330");
		assert_eq!(cfg.server.keepalive_secs, 15);
		assert_eq!(cfg.server.subscriber_queue_capacity, 32);
		assert!(!cfg.server.tls_only);
		assert!(cfg.persistence.database_url.starts_with("sqlite:"));
	}

	#[test]
	fn toml_values_override_defaults() {
		let file: FileConfig = toml::from_str(
			r#"
			[server]
			listen_addr = "0.0.0.0:9000"
			keepalive_secs = 5
			tls_only = true
			health_bind = "127.0.0.1:9001"

			[persistence]
			database_url = "postgres://parley@localhost/parley"
			"#,
		)
		.expect("parse");

		let cfg = ServerConfig::from_file(file);
		assert_eq!(cfg.server.listen_addr, "0.0.0.0:9000");
		assert_eq!(cfg.server.keepalive_secs, 5);
		assert!(cfg.server.tls_only);
		assert_eq!(cfg.server.health_bind.as_deref(), Some("127.0.0.1:9001"));
		assert!(cfg.persistence.database_url.starts_with("postgres:"));
	}

	#[test]
	fn zero_keepalive_falls_back_to_default() {
		let file: FileConfig = toml::from_str("[server]\nkeepalive_secs = 0\n").expect("parse");
		let cfg = ServerConfig::from_file(file);
		assert_eq!(cfg.server.keepalive_secs, 15);
	}
}
