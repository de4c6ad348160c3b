#![forbid(unsafe_code)]

//! Per-channel connection runner: resolve token, run the socket, back off
//! and retry. Each session owns its own backoff state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relaybot_domain::{ChannelId, ChannelSlug, Platform};
use relaybot_platform::backoff::ReconnectBackoff;
use relaybot_platform::dialects::Dialect;
use relaybot_platform::socket::{ChannelSocket, SocketIo, WsConnector};
use relaybot_platform::token::TokenResolver;
use relaybot_platform::{CloseReason, SessionEvent, connection_wiring};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::server::state::{ChannelStateStore, RunnerControl, SessionSnapshot};
use crate::server::sync::SessionLauncher;

/// Inbound event tagged with the channel it came from.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
	pub channel_id: ChannelId,
	pub platform: Platform,
	pub slug: ChannelSlug,
	pub event: SessionEvent,
}

/// Shared dependencies for all channel runners.
pub struct RunnerDeps {
	pub store: Arc<ChannelStateStore>,
	pub resolver: Arc<TokenResolver>,
	pub events_tx: mpsc::Sender<ChannelEvent>,

	/// Per-platform websocket endpoint overrides from configuration.
	pub ws_url_overrides: HashMap<Platform, String>,

	/// Test hook; `None` uses the real connector.
	pub connector: Option<WsConnector>,

	pub backoff_base: Duration,
	pub backoff_max: Duration,
	pub send_queue_capacity: usize,
}

/// Spawn the supervisor task for one channel.
pub fn spawn_channel_runner(channel_id: ChannelId, deps: Arc<RunnerDeps>) -> RunnerControl {
	let (stop_tx, stop_rx) = watch::channel(false);
	let task = tokio::spawn(run_channel(channel_id, deps, stop_rx));
	RunnerControl::new(stop_tx, task)
}

fn socket_for(snapshot: &SessionSnapshot, deps: &RunnerDeps) -> ChannelSocket {
	let mut dialect = Dialect::for_platform(snapshot.platform);
	if let Some(url) = deps.ws_url_overrides.get(&snapshot.platform) {
		dialect = dialect.with_ws_url(url.clone());
	}

	let socket = ChannelSocket::new(dialect, snapshot.platform_channel_id.clone());
	match &deps.connector {
		Some(connector) => socket.with_connector(connector.clone()),
		None => socket,
	}
}

async fn run_channel(channel_id: ChannelId, deps: Arc<RunnerDeps>, mut stop_rx: watch::Receiver<bool>) {
	let mut backoff = ReconnectBackoff::new(deps.backoff_base, deps.backoff_max);

	loop {
		if *stop_rx.borrow() {
			break;
		}

		// The synchronizer may have removed the session or changed its
		// identity since the last attempt; always work from a fresh snapshot.
		let Some(snapshot) = deps.store.snapshot(channel_id).await else {
			debug!(channel = %channel_id, "session gone; runner exiting");
			break;
		};

		let token = match deps.resolver.resolve(snapshot.bot_override.as_ref()).await {
			Ok(token) => token,
			Err(e) => {
				warn!(channel = %channel_id, error = %e, "token resolution failed");
				if !sleep_or_stop(backoff.next_delay(), &mut stop_rx).await {
					break;
				}
				continue;
			}
		};

		let socket = socket_for(&snapshot, &deps);
		let (handle, mut send_rx, connected_tx) = connection_wiring(deps.send_queue_capacity);
		deps.store.set_handle(channel_id, handle).await;

		// Tag the session's events with channel identity for the pipeline.
		let (session_tx, mut session_rx) = mpsc::channel::<SessionEvent>(64);
		let forwarder = tokio::spawn({
			let events_tx = deps.events_tx.clone();
			let platform = snapshot.platform;
			let slug = snapshot.slug.clone();
			async move {
				while let Some(event) = session_rx.recv().await {
					let tagged = ChannelEvent {
						channel_id,
						platform,
						slug: slug.clone(),
						event,
					};
					if events_tx.send(tagged).await.is_err() {
						break;
					}
				}
			}
		});

		let report = {
			let mut io = SocketIo {
				events_tx: &session_tx,
				send_rx: &mut send_rx,
				connected_tx: &connected_tx,
				stop_rx: &mut stop_rx,
			};
			socket.run(&token, &mut io).await
		};

		deps.store.clear_handle(channel_id).await;
		drop(session_tx);
		let _ = forwarder.await;

		if report.reached_ready {
			backoff.reset();
		}

		match report.reason {
			CloseReason::Shutdown => break,
			CloseReason::AuthRejected => {
				info!(channel = %channel_id, "auth rejected; attempting one token refresh before reconnect");
				// Refresh failure still leaves the reconnect scheduled.
				let _ = deps.resolver.handle_auth_error(snapshot.bot_override.as_ref()).await;
			}
			CloseReason::Transport | CloseReason::Remote => {}
		}

		let delay = backoff.next_delay();
		debug!(channel = %channel_id, reason = %report.reason, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
		if !sleep_or_stop(delay, &mut stop_rx).await {
			break;
		}
	}

	deps.store.clear_handle(channel_id).await;
}

/// Sleep for `delay`, returning `false` if the stop flag flipped first.
async fn sleep_or_stop(delay: Duration, stop_rx: &mut watch::Receiver<bool>) -> bool {
	tokio::select! {
		_ = tokio::time::sleep(delay) => true,
		changed = stop_rx.changed() => !(changed.is_err() || *stop_rx.borrow()),
	}
}

/// Production launcher: spawns runners and records them in the store.
pub struct RunnerLauncher {
	deps: Arc<RunnerDeps>,
}

impl RunnerLauncher {
	pub fn new(deps: Arc<RunnerDeps>) -> Self {
		Self { deps }
	}
}

#[async_trait]
impl SessionLauncher for RunnerLauncher {
	async fn launch(&self, channel_id: ChannelId) {
		if self.deps.store.has_live_runner(channel_id).await {
			return;
		}
		let control = spawn_channel_runner(channel_id, Arc::clone(&self.deps));
		self.deps.store.set_runner(channel_id, control).await;
	}
}
