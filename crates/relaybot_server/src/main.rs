#![forbid(unsafe_code)]

mod config;
mod server;

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use relaybot_domain::Platform;
use relaybot_platform::SecretString;
use relaybot_platform::token::{HttpTokenService, TokenResolver};
use relaybot_store::{BotRepository, MemoryRepository, PgRepository};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::commands::CommandEngine;
use crate::server::credits::CreditsNotifier;
use crate::server::dedup::DedupSet;
use crate::server::events::EventPipeline;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::lifecycle::StreamDurationTracker;
use crate::server::lock::ChannelLocks;
use crate::server::outbox::{OutboxConfig, OutboxDispatcher, OutboxMode, SendGuards};
use crate::server::rate_limit::{SendRateLimiter, WindowConfig};
use crate::server::rewards::RewardsGate;
use crate::server::runner::{RunnerDeps, RunnerLauncher};
use crate::server::state::ChannelStateStore;
use crate::server::sync::{Synchronizer, spawn_sync_scheduler};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: relaybot_server [--config path]\n\
\n\
Options:\n\
\t--config  Config file path (default: ~/.relaybot/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path: Option<PathBuf> = None;

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
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,relaybot_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("relaybot_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
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

async fn wait_for_shutdown_signal() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};

		let mut term = match signal(SignalKind::terminate()) {
			Ok(term) => term,
			Err(e) => {
				warn!(error = %e, "failed to install SIGTERM handler; waiting on ctrl-c only");
				let _ = tokio::signal::ctrl_c().await;
				return;
			}
		};

		tokio::select! {
			_ = tokio::signal::ctrl_c() => {}
			_ = term.recv() => {}
		}
	}

	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let repo: Arc<dyn BotRepository> = if cfg.store.memory_mode {
		warn!("memory mode enabled; running without a database");
		Arc::new(MemoryRepository::new())
	} else {
		let Some(database_url) = cfg.store.database_url.as_deref() else {
			// The one genuinely fatal misconfiguration.
			return Err(anyhow::anyhow!(
				"no database_url configured (set RELAYBOT_DATABASE_URL or enable memory_mode)"
			));
		};
		Arc::new(PgRepository::connect(database_url).await?)
	};

	let internal_auth = match cfg.backend.internal_auth.clone() {
		Some(auth) => auth,
		None => {
			warn!("no internal auth token configured; backend calls will be rejected upstream");
			SecretString::new("")
		}
	};

	let token_service = Arc::new(HttpTokenService::new(&cfg.backend.base_url, internal_auth.clone())?);
	let mut resolver = TokenResolver::new(token_service);
	if let Some(token) = cfg.bots.default_access_token.clone() {
		resolver = resolver.with_static_default(token);
	}
	if let Some(login) = cfg.bots.default_login.clone() {
		resolver = resolver.with_default_bot_login(login);
	}
	let resolver = Arc::new(resolver);

	let store = Arc::new(ChannelStateStore::new());
	let guards = Arc::new(SendGuards::new(
		SendRateLimiter::new(
			WindowConfig {
				max: cfg.limits.global_max,
				window: cfg.limits.global_window,
			},
			WindowConfig {
				max: cfg.limits.channel_max,
				window: cfg.limits.channel_window,
			},
		),
		DedupSet::new(cfg.limits.dedup_window),
		ChannelLocks::new(cfg.limits.lock_ttl),
	));

	let lifecycle = Arc::new(StreamDurationTracker::new());
	let credits = if cfg.backend.internal_auth.is_some() {
		Some(Arc::new(CreditsNotifier::new(&cfg.backend.base_url, internal_auth)?))
	} else {
		None
	};

	let (stop_tx, stop_rx) = watch::channel(false);
	let (events_tx, events_rx) = mpsc::channel(4096);

	let mut ws_url_overrides: HashMap<Platform, String> = HashMap::new();
	for (name, url) in &cfg.platform_ws_urls {
		match Platform::from_str(name) {
			Ok(platform) => {
				ws_url_overrides.insert(platform, url.clone());
			}
			Err(e) => warn!(platform = %name, error = %e, "ignoring ws url override for unknown platform"),
		}
	}

	let deps = Arc::new(RunnerDeps {
		store: Arc::clone(&store),
		resolver: Arc::clone(&resolver),
		events_tx,
		ws_url_overrides,
		connector: None,
		backoff_base: cfg.sessions.reconnect_min_delay,
		backoff_max: cfg.sessions.reconnect_max_delay,
		send_queue_capacity: cfg.sessions.send_queue_capacity,
	});
	let launcher = Arc::new(RunnerLauncher::new(Arc::clone(&deps)));

	let pipeline = Arc::new(EventPipeline::new(
		Arc::clone(&repo),
		CommandEngine::new(Arc::clone(&repo), Arc::clone(&store), cfg.sessions.command_cache_ttl),
		Arc::clone(&lifecycle),
		credits,
		RewardsGate::new(cfg.rewards_ack_template.clone()),
	));
	let pipeline_task = pipeline.spawn(events_rx, stop_rx.clone());

	let mut tasks = Vec::new();
	for platform in Platform::ALL {
		let sync = Arc::new(Synchronizer::new(
			Arc::clone(&repo),
			Arc::clone(&store),
			launcher.clone(),
			platform,
		));
		tasks.push(spawn_sync_scheduler(
			sync,
			cfg.sync_interval_for(platform),
			stop_rx.clone(),
		));
	}

	let outbox_cfg = OutboxConfig {
		mode: if cfg.outbox.queue_mode {
			OutboxMode::QueueWorkers
		} else {
			OutboxMode::Polling
		},
		poll_interval: cfg.outbox.poll_interval,
		batch_size: cfg.outbox.batch_size,
		concurrency: cfg.outbox.concurrency,
		max_attempts: cfg.outbox.max_attempts,
		idle_delay: cfg.outbox.poll_interval,
		lock_retry_delay: cfg.limits.lock_retry_delay,
	};
	let dispatcher = Arc::new(OutboxDispatcher::new(
		Arc::clone(&repo),
		Arc::clone(&store),
		guards,
		outbox_cfg,
	));
	tasks.extend(dispatcher.spawn(stop_rx.clone()));

	health_state.mark_ready();
	info!(
		platforms = Platform::ALL.len(),
		outbox_queue_mode = cfg.outbox.queue_mode,
		"relaybot runtime started"
	);

	wait_for_shutdown_signal().await;
	info!("shutdown signal received; draining");

	health_state.mark_draining();
	let _ = stop_tx.send(true);
	info!(sessions = store.len().await, "disconnecting channel sessions");
	store.disconnect_all().await;

	let drain_deadline = Duration::from_secs(10);
	for task in tasks {
		if tokio::time::timeout(drain_deadline, task).await.is_err() {
			warn!("task did not drain before deadline");
		}
	}
	if tokio::time::timeout(drain_deadline, pipeline_task).await.is_err() {
		warn!("event pipeline did not drain before deadline");
	}

	info!("relaybot runtime stopped");
	Ok(())
}
