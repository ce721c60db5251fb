#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use courier_domain::SecretString;
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.courier/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".courier").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub coordination: CoordinationSettings,
	pub directory: DirectorySettings,
	pub log: LogSettings,
	pub storage: StorageSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Listener bind address for the WebSocket/HTTP surface.
	pub bind_host: String,
	pub bind_port: u16,
	/// Host other instances use to reach this one; published to the
	/// directory, so it must be routable inside the cluster.
	pub advertise_host: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// HMAC secret for stateless access tokens.
	pub auth_hmac_secret: Option<SecretString>,
	/// Directory-entry refresh interval.
	pub heartbeat: Duration,
	/// How many recent messages a join replays.
	pub history_limit: u32,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind_host: "0.0.0.0".to_string(),
			bind_port: 8080,
			advertise_host: None,
			metrics_bind: None,
			auth_hmac_secret: None,
			heartbeat: Duration::from_secs(30),
			history_limit: 50,
		}
	}
}

#[derive(Debug, Clone)]
pub struct CoordinationSettings {
	/// Comma-separated coordination hosts.
	pub hosts: String,
	/// Service root under which this fleet registers.
	pub service: String,
	pub session_timeout: Duration,
}

impl Default for CoordinationSettings {
	fn default() -> Self {
		Self {
			hosts: "localhost:2181".to_string(),
			service: "chat-service".to_string(),
			session_timeout: Duration::from_secs(15),
		}
	}
}

#[derive(Debug, Clone)]
pub struct DirectorySettings {
	pub url: String,
}

impl Default for DirectorySettings {
	fn default() -> Self {
		Self {
			url: "redis://127.0.0.1:6379".to_string(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct LogSettings {
	pub brokers: String,
	pub topic: String,
}

impl Default for LogSettings {
	fn default() -> Self {
		Self {
			brokers: "localhost:9092".to_string(),
			topic: "chat-messages".to_string(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
	/// Database URL (sqlite: or postgres:); in-memory store when unset.
	pub database_url: Option<String>,
	pub connect_attempts: u32,
	pub connect_retry: Duration,
}

impl Default for StorageSettings {
	fn default() -> Self {
		Self {
			database_url: None,
			connect_attempts: 10,
			connect_retry: Duration::from_secs(5),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	coordination: FileCoordinationSettings,

	#[serde(default)]
	directory: FileDirectorySettings,

	#[serde(default)]
	log: FileLogSettings,

	#[serde(default)]
	storage: FileStorageSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind_host: Option<String>,
	bind_port: Option<u16>,
	advertise_host: Option<String>,
	metrics_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	heartbeat_secs: Option<u64>,
	history_limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileCoordinationSettings {
	hosts: Option<String>,
	service: Option<String>,
	session_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDirectorySettings {
	url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLogSettings {
	brokers: Option<String>,
	topic: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileStorageSettings {
	database_url: Option<String>,
	connect_attempts: Option<u32>,
	connect_retry_secs: Option<u64>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();
		let server = ServerSettings {
			bind_host: file.server.bind_host.filter(|s| !s.trim().is_empty()).unwrap_or(defaults.bind_host),
			bind_port: file.server.bind_port.unwrap_or(defaults.bind_port),
			advertise_host: file.server.advertise_host.filter(|s| !s.trim().is_empty()),
			metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
			auth_hmac_secret: file
				.server
				.auth_hmac_secret
				.filter(|s| !s.trim().is_empty())
				.map(SecretString::new),
			heartbeat: file.server.heartbeat_secs.filter(|v| *v > 0).map(Duration::from_secs).unwrap_or(defaults.heartbeat),
			history_limit: file.server.history_limit.filter(|v| *v > 0).unwrap_or(defaults.history_limit),
		};

		let coord_defaults = CoordinationSettings::default();
		let coordination = CoordinationSettings {
			hosts: file.coordination.hosts.filter(|s| !s.trim().is_empty()).unwrap_or(coord_defaults.hosts),
			service: file
				.coordination
				.service
				.filter(|s| !s.trim().is_empty())
				.unwrap_or(coord_defaults.service),
			session_timeout: file
				.coordination
				.session_timeout_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(coord_defaults.session_timeout),
		};

		let directory = DirectorySettings {
			url: file.directory.url.filter(|s| !s.trim().is_empty()).unwrap_or(DirectorySettings::default().url),
		};

		let log_defaults = LogSettings::default();
		let log = LogSettings {
			brokers: file.log.brokers.filter(|s| !s.trim().is_empty()).unwrap_or(log_defaults.brokers),
			topic: file.log.topic.filter(|s| !s.trim().is_empty()).unwrap_or(log_defaults.topic),
		};

		let storage_defaults = StorageSettings::default();
		let storage = StorageSettings {
			database_url: file.storage.database_url.filter(|s| !s.trim().is_empty()),
			connect_attempts: file
				.storage
				.connect_attempts
				.filter(|v| *v > 0)
				.unwrap_or(storage_defaults.connect_attempts),
			connect_retry: file
				.storage
				.connect_retry_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(storage_defaults.connect_retry),
		};

		Self {
			server,
			coordination,
			directory,
			log,
			storage,
		}
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
	if let Ok(v) = std::env::var("COURIER_BIND_HOST") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.bind_host = v;
			info!("server config: bind_host overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_BIND_PORT")
		&& let Ok(port) = v.trim().parse::<u16>()
	{
		cfg.server.bind_port = port;
		info!(port, "server config: bind_port overridden by env");
	}

	if let Ok(v) = std::env::var("COURIER_ADVERTISE_HOST") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.advertise_host = Some(v);
			info!("server config: advertise_host overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.auth_hmac_secret = Some(SecretString::new(v));
			info!("server auth: auth_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_HEARTBEAT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.server.heartbeat = Duration::from_secs(secs);
		info!(secs, "server config: heartbeat overridden by env");
	}

	if let Ok(v) = std::env::var("COURIER_HISTORY_LIMIT")
		&& let Ok(limit) = v.trim().parse::<u32>()
		&& limit > 0
	{
		cfg.server.history_limit = limit;
		info!(limit, "server config: history_limit overridden by env");
	}

	if let Ok(v) = std::env::var("COURIER_COORDINATION_HOSTS") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.coordination.hosts = v;
			info!("coordination config: hosts overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_COORDINATION_SERVICE") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.coordination.service = v;
			info!("coordination config: service overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_COORDINATION_SESSION_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.coordination.session_timeout = Duration::from_secs(secs);
		info!(secs, "coordination config: session_timeout overridden by env");
	}

	if let Ok(v) = std::env::var("COURIER_DIRECTORY_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.directory.url = v;
			info!("directory config: url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_LOG_BROKERS") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.log.brokers = v;
			info!("log config: brokers overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_LOG_TOPIC") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.log.topic = v;
			info!("log config: topic overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.storage.database_url = Some(v);
			info!("storage config: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_STORAGE_CONNECT_ATTEMPTS")
		&& let Ok(attempts) = v.trim().parse::<u32>()
		&& attempts > 0
	{
		cfg.storage.connect_attempts = attempts;
		info!(attempts, "storage config: connect_attempts overridden by env");
	}

	if let Ok(v) = std::env::var("COURIER_STORAGE_CONNECT_RETRY_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.storage.connect_retry = Duration::from_secs(secs);
		info!(secs, "storage config: connect_retry overridden by env");
	}
}
