#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.courier/dispatcher.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".courier").join("dispatcher.toml"))
}

pub fn load_config_from_path(path: &Path) -> anyhow::Result<DispatcherConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = DispatcherConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Dispatcher config (v1).
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
	/// Outbound-log brokers and topic to consume.
	pub brokers: String,
	pub topic: String,
	pub group: String,
	/// Max records pulled per delivery round.
	pub batch_size: usize,
	/// Per-record poll patience before a partial batch ships.
	pub poll_wait: Duration,
	/// Shared connection directory.
	pub directory_url: String,
	/// Coordination service for liveness registration.
	pub coordination_hosts: String,
	pub coordination_service: String,
	/// Per-push HTTP timeout.
	pub push_timeout: Duration,
	/// Health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

impl Default for DispatcherConfig {
	fn default() -> Self {
		Self {
			brokers: "localhost:9092".to_string(),
			topic: "chat-messages".to_string(),
			group: "message-dispatcher-group".to_string(),
			batch_size: 100,
			poll_wait: Duration::from_secs(1),
			directory_url: "redis://127.0.0.1:6379".to_string(),
			coordination_hosts: "localhost:2181".to_string(),
			coordination_service: "message-dispatcher".to_string(),
			push_timeout: Duration::from_secs(5),
			health_bind: None,
			metrics_bind: None,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	brokers: Option<String>,
	topic: Option<String>,
	group: Option<String>,
	batch_size: Option<usize>,
	poll_wait_ms: Option<u64>,
	directory_url: Option<String>,
	coordination_hosts: Option<String>,
	coordination_service: Option<String>,
	push_timeout_secs: Option<u64>,
	health_bind: Option<String>,
	metrics_bind: Option<String>,
}

impl DispatcherConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = Self::default();
		Self {
			brokers: file.brokers.filter(|s| !s.trim().is_empty()).unwrap_or(defaults.brokers),
			topic: file.topic.filter(|s| !s.trim().is_empty()).unwrap_or(defaults.topic),
			group: file.group.filter(|s| !s.trim().is_empty()).unwrap_or(defaults.group),
			batch_size: file.batch_size.filter(|v| *v > 0).unwrap_or(defaults.batch_size),
			poll_wait: file.poll_wait_ms.filter(|v| *v > 0).map(Duration::from_millis).unwrap_or(defaults.poll_wait),
			directory_url: file
				.directory_url
				.filter(|s| !s.trim().is_empty())
				.unwrap_or(defaults.directory_url),
			coordination_hosts: file
				.coordination_hosts
				.filter(|s| !s.trim().is_empty())
				.unwrap_or(defaults.coordination_hosts),
			coordination_service: file
				.coordination_service
				.filter(|s| !s.trim().is_empty())
				.unwrap_or(defaults.coordination_service),
			push_timeout: file
				.push_timeout_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(defaults.push_timeout),
			health_bind: file.health_bind.filter(|s| !s.trim().is_empty()),
			metrics_bind: file.metrics_bind.filter(|s| !s.trim().is_empty()),
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

fn apply_env_overrides(cfg: &mut DispatcherConfig) {
	if let Ok(v) = std::env::var("COURIER_DISPATCHER_BROKERS") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.brokers = v;
			info!("dispatcher config: brokers overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_DISPATCHER_TOPIC") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.topic = v;
			info!("dispatcher config: topic overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_DISPATCHER_GROUP") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.group = v;
			info!("dispatcher config: group overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_DISPATCHER_BATCH_SIZE")
		&& let Ok(size) = v.trim().parse::<usize>()
		&& size > 0
	{
		cfg.batch_size = size;
		info!(size, "dispatcher config: batch_size overridden by env");
	}

	if let Ok(v) = std::env::var("COURIER_DISPATCHER_POLL_WAIT_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
		&& ms > 0
	{
		cfg.poll_wait = Duration::from_millis(ms);
		info!(ms, "dispatcher config: poll_wait overridden by env");
	}

	if let Ok(v) = std::env::var("COURIER_DISPATCHER_DIRECTORY_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.directory_url = v;
			info!("dispatcher config: directory_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_DISPATCHER_COORDINATION_HOSTS") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.coordination_hosts = v;
			info!("dispatcher config: coordination_hosts overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_DISPATCHER_COORDINATION_SERVICE") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.coordination_service = v;
			info!("dispatcher config: coordination_service overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_DISPATCHER_PUSH_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.push_timeout = Duration::from_secs(secs);
		info!(secs, "dispatcher config: push_timeout overridden by env");
	}

	if let Ok(v) = std::env::var("COURIER_DISPATCHER_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.health_bind = Some(v);
			info!("dispatcher config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("COURIER_DISPATCHER_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.metrics_bind = Some(v);
			info!("dispatcher config: metrics_bind overridden by env");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_file_yields_defaults() {
		let cfg = load_config_from_path(Path::new("/nonexistent/courier/dispatcher.toml")).unwrap();
		assert_eq!(cfg.group, "message-dispatcher-group");
		assert_eq!(cfg.topic, "chat-messages");
		assert_eq!(cfg.batch_size, 100);
	}

	#[test]
	fn file_values_override_defaults() {
		let file: FileConfig = toml::from_str("topic = \"chat-staging\"\nbatch_size = 25\npoll_wait_ms = 250\n").unwrap();
		let cfg = DispatcherConfig::from_file(file);
		assert_eq!(cfg.topic, "chat-staging");
		assert_eq!(cfg.batch_size, 25);
		assert_eq!(cfg.poll_wait, Duration::from_millis(250));
		assert_eq!(cfg.brokers, "localhost:9092");
	}
}
