#![forbid(unsafe_code)]

mod config;
mod dispatch;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use courier_cluster::directory::RedisDirectory;
use courier_cluster::discovery::{CoordinationConfig, Coordinator, SessionState};
use courier_cluster::log::KafkaLogConsumer;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::dispatch::{HttpPushClient, dispatch_batch};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: courier-dispatcher [--config path]\n\
\n\
Options:\n\
\t--config  Config file path (default: ~/.courier/dispatcher.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,courier_dispatcher=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
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

async fn healthz() -> &'static str {
	"ok"
}

async fn readyz(State(ready): State<Arc<AtomicBool>>) -> Response {
	if ready.load(Ordering::Relaxed) {
		(StatusCode::OK, "ready").into_response()
	} else {
		(StatusCode::SERVICE_UNAVAILABLE, "not-ready").into_response()
	}
}

/// Split a `host:port` bind address into the host and port published with
/// the liveness registration. No bind address means nothing reachable to
/// publish.
fn registration_endpoint(bind: Option<&str>) -> (String, u16) {
	match bind.and_then(|b| b.rsplit_once(':')) {
		Some((host, port)) => match port.parse::<u16>() {
			Ok(port) => (host.to_string(), port),
			Err(_) => (String::new(), 0),
		},
		None => (String::new(), 0),
	}
}

fn spawn_health_server(bind: String, ready: Arc<AtomicBool>) {
	tokio::spawn(async move {
		let app = axum::Router::new()
			.route("/healthz", get(healthz))
			.route("/readyz", get(readyz))
			.with_state(ready);
		match tokio::net::TcpListener::bind(&bind).await {
			Ok(listener) => {
				info!(%bind, "health server listening");
				if let Err(e) = axum::serve(listener, app).await {
					warn!(error = %e, "health server stopped");
				}
			}
			Err(e) => warn!(%bind, error = %e, "health server bind failed"),
		}
	});
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded dispatcher config (toml + env overrides)");

	init_metrics(cfg.metrics_bind.as_deref());

	let ready = Arc::new(AtomicBool::new(false));
	if let Some(bind) = cfg.health_bind.clone() {
		spawn_health_server(bind, Arc::clone(&ready));
	}

	// Liveness registration only: the dispatcher holds no instance-id slot,
	// it just needs a unique ephemeral identity operators can see.
	let coordination_cfg = CoordinationConfig::new(cfg.coordination_hosts.clone(), cfg.coordination_service.clone());
	let (coordinator, mut session_events) = Coordinator::connect(coordination_cfg).await?;
	coordinator.ensure_paths().await?;
	let (reg_host, reg_port) = registration_endpoint(cfg.health_bind.as_deref());
	let identity = coordinator.register_sequential(&reg_host, reg_port).await?;
	info!(%identity, "dispatcher registered");

	let directory = RedisDirectory::connect(&cfg.directory_url).await?;
	let consumer = KafkaLogConsumer::connect(&cfg.brokers, &cfg.group, &cfg.topic)?;
	let push = HttpPushClient::new(cfg.push_timeout)?;

	let (fatal_tx, mut fatal_rx) = tokio::sync::mpsc::channel::<()>(1);
	tokio::spawn(async move {
		while let Some(event) = session_events.recv().await {
			match event {
				SessionState::Connected => info!("coordination session established"),
				SessionState::Disconnected => warn!("coordination session disconnected"),
				SessionState::Expired => {
					error!("coordination session expired");
					let _ = fatal_tx.send(()).await;
				}
			}
		}
	});

	ready.store(true, Ordering::Relaxed);
	info!(group = %cfg.group, topic = %cfg.topic, "dispatcher consuming");

	let mut fatal = false;
	loop {
		tokio::select! {
			_ = tokio::signal::ctrl_c() => {
				info!("shutdown signal received");
				break;
			}
			_ = fatal_rx.recv() => {
				fatal = true;
				break;
			}
			batch = consumer.next_batch(cfg.batch_size, cfg.poll_wait) => {
				let payloads = match batch {
					Ok(payloads) => payloads,
					Err(e) => {
						warn!(error = %e, "consume failed; backing off");
						tokio::time::sleep(Duration::from_secs(1)).await;
						continue;
					}
				};
				if payloads.is_empty() {
					continue;
				}

				let stats = dispatch_batch(&payloads, &directory, &push).await;
				info!(
					delivered = stats.delivered,
					misses = stats.misses,
					failures = stats.failures,
					malformed = stats.malformed,
					"batch dispatched"
				);

				// Commit only now: a crash mid-batch replays it instead of
				// losing it.
				if let Err(e) = consumer.commit() {
					warn!(error = %e, "offset commit failed");
				}
			}
		}
	}

	ready.store(false, Ordering::Relaxed);
	coordinator.close().await;

	if fatal {
		return Err(anyhow!("coordination session expired; exiting for a clean restart"));
	}
	info!("shutdown complete");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::registration_endpoint;

	#[test]
	fn registration_endpoint_splits_host_and_port() {
		assert_eq!(registration_endpoint(Some("10.0.0.5:9100")), ("10.0.0.5".to_string(), 9100));
		assert_eq!(registration_endpoint(Some("0.0.0.0:8081")), ("0.0.0.0".to_string(), 8081));
	}

	#[test]
	fn registration_endpoint_tolerates_missing_or_bad_binds() {
		assert_eq!(registration_endpoint(None), (String::new(), 0));
		assert_eq!(registration_endpoint(Some("no-port")), (String::new(), 0));
		assert_eq!(registration_endpoint(Some("host:notaport")), (String::new(), 0));
	}
}
