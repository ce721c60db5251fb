#![forbid(unsafe_code)]

//! Coordination-service client: instance identity claiming and liveness
//! registration over a ZooKeeper-style hierarchy.
//!
//! The session walks `Disconnected -> Connecting -> EnsuringPaths ->
//! ClaimingId -> Registering -> Active`. Registrations are ephemeral, so
//! they vanish with the session; session loss is treated as fatal and the
//! process is expected to exit rather than self-heal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow, bail};
use courier_domain::{InstanceId, unix_ms_now};
use tokio::sync::mpsc;
use tracing::{info, warn};
use zookeeper::{Acl, CreateMode, WatchedEvent, Watcher, ZkError, ZooKeeper};

/// Coordination connection settings.
#[derive(Debug, Clone)]
pub struct CoordinationConfig {
	/// Comma-separated `host:port` list of coordination servers.
	pub hosts: String,
	/// Well-known service root, e.g. `chat-service`.
	pub service: String,
	pub session_timeout: Duration,
}

impl CoordinationConfig {
	pub fn new(hosts: impl Into<String>, service: impl Into<String>) -> Self {
		Self {
			hosts: hosts.into(),
			service: service.into(),
			session_timeout: Duration::from_secs(15),
		}
	}
}

/// Session-level events surfaced to the owning process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Connected,
	Disconnected,
	Expired,
}

struct SessionWatcher {
	tx: mpsc::UnboundedSender<SessionState>,
}

impl Watcher for SessionWatcher {
	fn handle(&self, event: WatchedEvent) {
		use zookeeper::KeeperState;

		let state = match event.keeper_state {
			KeeperState::SyncConnected => SessionState::Connected,
			KeeperState::Disconnected => SessionState::Disconnected,
			KeeperState::Expired => SessionState::Expired,
			other => {
				warn!(state = ?other, "coordination session event");
				return;
			}
		};
		let _ = self.tx.send(state);
	}
}

/// Handle to an established coordination session.
///
/// All operations delegate to the blocking client on the blocking pool;
/// the handle itself is cheap to clone.
#[derive(Clone)]
pub struct Coordinator {
	zk: Arc<ZooKeeper>,
	cfg: CoordinationConfig,
}

impl Coordinator {
	/// Connect to the coordination service. The returned receiver yields
	/// session-state transitions; callers should treat `Expired` as fatal.
	pub async fn connect(cfg: CoordinationConfig) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<SessionState>)> {
		info!(hosts = %cfg.hosts, service = %cfg.service, "connecting to coordination service");

		let (tx, rx) = mpsc::unbounded_channel();
		let hosts = cfg.hosts.clone();
		let timeout = cfg.session_timeout;
		let zk = tokio::task::spawn_blocking(move || ZooKeeper::connect(&hosts, timeout, SessionWatcher { tx }))
			.await
			.context("join coordination connect task")?
			.map_err(|e| anyhow!("coordination connect failed: {e:?}"))?;

		Ok((
			Self {
				zk: Arc::new(zk),
				cfg,
			},
			rx,
		))
	}

	fn base_path(&self) -> String {
		format!("/{}", self.cfg.service)
	}

	fn ids_path(&self) -> String {
		format!("/{}/server-ids", self.cfg.service)
	}

	/// Create a node, treating `NodeExists` as a non-error.
	///
	/// Returns the actual path on creation, `None` when the node already
	/// existed. Every other error propagates: a mis-registered instance
	/// must not silently serve traffic.
	async fn create_node(&self, path: String, data: Vec<u8>, mode: CreateMode) -> anyhow::Result<Option<String>> {
		let zk = Arc::clone(&self.zk);
		let result =
			tokio::task::spawn_blocking(move || zk.create(&path, data, Acl::open_unsafe().clone(), mode))
				.await
				.context("join coordination create task")?;

		match result {
			Ok(actual) => Ok(Some(actual)),
			Err(ZkError::NodeExists) => Ok(None),
			Err(e) => Err(anyhow!("coordination create failed: {e:?}")),
		}
	}

	/// Idempotently create the well-known persistent parent nodes.
	pub async fn ensure_paths(&self) -> anyhow::Result<()> {
		self.create_node(self.base_path(), Vec::new(), CreateMode::Persistent).await?;
		self.create_node(self.ids_path(), Vec::new(), CreateMode::Persistent).await?;
		Ok(())
	}

	/// Claim an instance id from the fixed `[0, 1023]` pool.
	///
	/// Each slot is an ephemeral child of `/<service>/server-ids`; the first
	/// create that does not collide wins, and the claim is released with the
	/// session. Unlike a modulo-reduced sequential counter, a slot can never
	/// alias another live holder.
	pub async fn claim_instance_id(&self) -> anyhow::Result<InstanceId> {
		for slot in 0..=InstanceId::MAX {
			let path = format!("{}/{}", self.ids_path(), slot);
			if let Some(actual) = self.create_node(path, Vec::new(), CreateMode::Ephemeral).await? {
				info!(slot, path = %actual, "claimed instance id");
				return Ok(InstanceId::new(slot)?);
			}
		}
		bail!("instance id pool exhausted (all {} slots claimed)", InstanceId::MAX as u32 + 1)
	}

	/// Publish this instance's reachability under `/<service>/<instance>`.
	pub async fn register_instance(&self, instance: InstanceId, host: &str, port: u16) -> anyhow::Result<()> {
		let path = format!("{}/{}", self.base_path(), instance);
		let data = registration_payload(&instance.to_string(), host, port);

		match self.create_node(path.clone(), data, CreateMode::Ephemeral).await? {
			Some(_) => {
				info!(%instance, host, port, "registered instance");
				Ok(())
			}
			// A live ephemeral node under our freshly claimed id means a
			// conflicting registration; fail fast.
			None => bail!("instance {instance} is already registered at {path}"),
		}
	}

	/// Register under a globally unique ephemeral-sequential identity.
	///
	/// Used by roles that need liveness registration but no bounded
	/// id-generator slot (the dispatcher). The returned path is the
	/// registration identity.
	pub async fn register_sequential(&self, host: &str, port: u16) -> anyhow::Result<String> {
		let path = format!("{}/reg-", self.ids_path());
		let data = registration_payload("", host, port);

		let actual = self
			.create_node(path, data, CreateMode::EphemeralSequential)
			.await?
			.ok_or_else(|| anyhow!("sequential registration unexpectedly collided"))?;
		info!(path = %actual, "registered sequential identity");
		Ok(actual)
	}

	/// Close the session, releasing all ephemeral nodes.
	pub async fn close(&self) {
		let zk = Arc::clone(&self.zk);
		let result = tokio::task::spawn_blocking(move || zk.close()).await;
		if let Ok(Err(e)) = result {
			warn!(error = ?e, "coordination close failed");
		}
	}
}

fn registration_payload(id: &str, host: &str, port: u16) -> Vec<u8> {
	serde_json::json!({
		"id": id,
		"host": host,
		"port": port,
		"timestamp": unix_ms_now(),
	})
	.to_string()
	.into_bytes()
}
