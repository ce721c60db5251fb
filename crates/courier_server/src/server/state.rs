#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use courier_cluster::directory::Directory;
use courier_domain::{InstanceId, SecretString};
use tokio::sync::watch;

use super::channels::ChannelService;
use super::health::HealthState;
use super::session::SessionRegistry;

/// Shared state behind every HTTP/WebSocket handler.
pub struct AppState {
	pub channels: ChannelService,
	pub sessions: SessionRegistry,
	pub directory: Arc<dyn Directory>,
	pub auth_secret: SecretString,
	pub instance: InstanceId,
	/// Host and port other instances use to push to this one.
	pub advertise_host: String,
	pub advertise_port: u16,
	pub heartbeat: Duration,
	pub health: HealthState,
	pub shutdown: watch::Receiver<bool>,
}
