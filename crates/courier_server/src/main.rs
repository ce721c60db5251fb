#![forbid(unsafe_code)]

mod config;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use courier_cluster::directory::{Directory, MemoryDirectory, RedisDirectory};
use courier_cluster::discovery::{CoordinationConfig, Coordinator, SessionState};
use courier_cluster::log::{KafkaLogProducer, LogProducer};
use courier_domain::snowflake::IdGenerator;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::channels::ChannelService;
use crate::server::connection::router;
use crate::server::health::HealthState;
use crate::server::session::SessionRegistry;
use crate::server::state::AppState;
use crate::server::store::{MemoryStore, SqlStore, Store};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: courier-server [--config path]\n\
\n\
Options:\n\
\t--config  Config file path (default: ~/.courier/config.toml)\n\
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
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,courier_server=debug".to_string());

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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let Some(auth_secret) = cfg.server.auth_hmac_secret.clone() else {
		return Err(anyhow!("no auth_hmac_secret configured; refusing to serve unauthenticated"));
	};

	let health = HealthState::new();

	// Storage first: every other dependency is useless without it.
	let store: Arc<dyn Store> = match cfg.storage.database_url.as_deref() {
		Some(url) => Arc::new(SqlStore::connect_with_retry(url, &cfg.storage).await?),
		None => {
			warn!("no database_url configured; using in-memory store (single-node only)");
			Arc::new(MemoryStore::new())
		}
	};

	// Coordination next: the claimed instance id seeds the id generator,
	// so nothing that mints message ids may start before this.
	let mut coordination_cfg = CoordinationConfig::new(cfg.coordination.hosts.clone(), cfg.coordination.service.clone());
	coordination_cfg.session_timeout = cfg.coordination.session_timeout;
	let (coordinator, mut session_events) = Coordinator::connect(coordination_cfg).await?;
	coordinator.ensure_paths().await?;
	let instance = coordinator.claim_instance_id().await?;

	let advertise_host = match cfg.server.advertise_host.clone() {
		Some(host) => host,
		None => {
			warn!(bind = %cfg.server.bind_host, "no advertise_host configured; falling back to bind_host");
			cfg.server.bind_host.clone()
		}
	};
	coordinator.register_instance(instance, &advertise_host, cfg.server.bind_port).await?;

	let directory: Arc<dyn Directory> = if cfg.directory.url == "memory:" {
		warn!("using in-memory directory (single-node only)");
		Arc::new(MemoryDirectory::new())
	} else {
		Arc::new(RedisDirectory::connect(&cfg.directory.url).await?)
	};

	let producer = Arc::new(KafkaLogProducer::connect(&cfg.log.brokers, cfg.log.topic.clone())?);
	let log: Arc<dyn LogProducer> = producer.clone();

	let ids = Arc::new(IdGenerator::new(instance));
	let channels = ChannelService::new(store, log, Arc::clone(&directory), ids, cfg.server.history_limit);

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let state = Arc::new(AppState {
		channels,
		sessions: SessionRegistry::new(),
		directory: Arc::clone(&directory),
		auth_secret,
		instance,
		advertise_host,
		advertise_port: cfg.server.bind_port,
		heartbeat: cfg.server.heartbeat,
		health: health.clone(),
		shutdown: shutdown_rx.clone(),
	});

	let bind = format!("{}:{}", cfg.server.bind_host, cfg.server.bind_port);
	let listener = tokio::net::TcpListener::bind(&bind)
		.await
		.with_context(|| format!("bind {bind}"))?;
	info!(%bind, %instance, "listening");

	let app = router(Arc::clone(&state));
	let mut serve_shutdown = shutdown_rx.clone();
	let server_task = tokio::spawn(async move {
		axum::serve(listener, app)
			.with_graceful_shutdown(async move {
				let _ = serve_shutdown.changed().await;
			})
			.await
	});

	health.mark_ready();

	// Session expiry means our ephemeral registrations (instance id
	// included) are gone; continuing could mint colliding message ids.
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

	let fatal = tokio::select! {
		_ = tokio::signal::ctrl_c() => {
			info!("shutdown signal received");
			false
		}
		_ = fatal_rx.recv() => true,
	};

	health.mark_not_ready();
	let _ = shutdown_tx.send(true);

	// Connections have seen the shutdown flag and are sending close 1012;
	// clear whatever presence they leave behind, then drain the log.
	for user in state.sessions.connected_users() {
		if let Err(e) = directory.remove(&user, instance).await {
			warn!(user = %user, error = %e, "presence cleanup failed during shutdown");
		}
	}
	if let Err(e) = producer.flush().await {
		warn!(error = %e, "log flush failed during shutdown");
	}
	coordinator.close().await;

	match server_task.await {
		Ok(result) => result.context("http server")?,
		Err(e) => warn!(error = %e, "server task join failed"),
	}

	if fatal {
		return Err(anyhow!("coordination session expired; exiting for a clean restart"));
	}
	info!("shutdown complete");
	Ok(())
}
