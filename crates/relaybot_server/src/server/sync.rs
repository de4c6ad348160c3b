#![forbid(unsafe_code)]

//! Subscription synchronizer: reconciles the channel state store against the
//! data store's enabled subscriptions and bot overrides.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use relaybot_domain::{BotAccountId, ChannelId, Platform};
use relaybot_store::BotRepository;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::server::state::{ChannelSession, ChannelStateStore, IdentityUpdate};

/// Spawns/refreshes the connection runner for one session.
///
/// Connects are fire-and-forget relative to `sync()`: the launcher only
/// spawns a task, it never blocks on a slow connect.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
	async fn launch(&self, channel_id: ChannelId);
}

/// Periodic reconciler for one platform.
pub struct Synchronizer {
	repo: Arc<dyn BotRepository>,
	store: Arc<ChannelStateStore>,
	launcher: Arc<dyn SessionLauncher>,
	platform: Platform,
	in_flight: AtomicBool,
}

/// Releases the single-flight flag on every exit path.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::Release);
	}
}

impl Synchronizer {
	pub fn new(
		repo: Arc<dyn BotRepository>,
		store: Arc<ChannelStateStore>,
		launcher: Arc<dyn SessionLauncher>,
		platform: Platform,
	) -> Self {
		Self {
			repo,
			store,
			launcher,
			platform,
			in_flight: AtomicBool::new(false),
		}
	}

	/// One reconciliation pass. Idempotent; overlapping invocations are
	/// collapsed by the single-flight flag.
	pub async fn sync(&self) {
		if self
			.in_flight
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			debug!(platform = %self.platform, "sync already in flight; skipping");
			return;
		}
		let _guard = FlightGuard(&self.in_flight);

		metrics::counter!("relaybot_sync_runs_total").increment(1);

		let subs = match self.repo.list_enabled_subscriptions(self.platform).await {
			Ok(subs) => subs,
			Err(e) => {
				// Retried on the next scheduled tick.
				warn!(platform = %self.platform, error = %e, "sync failed to list subscriptions");
				metrics::counter!("relaybot_sync_errors_total").increment(1);
				return;
			}
		};

		let channel_ids: Vec<ChannelId> = subs.iter().map(|s| s.channel_id).collect();

		// Override lookup failures must not fail the whole sync.
		let overrides: HashMap<ChannelId, BotAccountId> = match self.repo.list_bot_overrides(&channel_ids).await {
			Ok(rows) => rows.into_iter().map(|o| (o.channel_id, o.bot_account_id)).collect(),
			Err(e) => {
				warn!(platform = %self.platform, error = %e, "bot override lookup failed; assuming no overrides");
				HashMap::new()
			}
		};

		let removed = self.store.retain_channels(self.platform, &channel_ids).await;
		if !removed.is_empty() {
			info!(platform = %self.platform, count = removed.len(), "removed unsubscribed channel sessions");
			metrics::counter!("relaybot_sync_sessions_removed_total").increment(removed.len() as u64);
		}

		for sub in &subs {
			let bot_override = overrides.get(&sub.channel_id).cloned();

			match self.store.update_identity(sub, bot_override.clone()).await {
				Some(IdentityUpdate::Unchanged) => {}
				Some(IdentityUpdate::Updated) => {
					debug!(channel = %sub.channel_id, "session identity updated");
				}
				Some(IdentityUpdate::PlatformChannelChanged) => {
					info!(
						channel = %sub.channel_id,
						platform_channel = %sub.platform_channel_id,
						"platform channel id changed; forced disconnect"
					);
					metrics::counter!("relaybot_sync_forced_disconnects_total").increment(1);
				}
				None => {
					debug!(channel = %sub.channel_id, slug = %sub.slug, "creating channel session");
					self.store
						.insert(ChannelSession::from_subscription(sub, bot_override))
						.await;
					metrics::counter!("relaybot_sync_sessions_created_total").increment(1);
				}
			}
		}

		// (Re)connect every session lacking a live connection.
		for sub in &subs {
			let has_runner = self.store.has_live_runner(sub.channel_id).await;
			if !has_runner {
				self.launcher.launch(sub.channel_id).await;
			}
		}
	}
}

/// Run `sync()` on a fixed interval until the stop flag flips.
pub fn spawn_sync_scheduler(
	sync: Arc<Synchronizer>,
	interval: Duration,
	mut stop_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				_ = ticker.tick() => {
					if *stop_rx.borrow() {
						break;
					}
					sync.sync().await;
				}
				changed = stop_rx.changed() => {
					if changed.is_err() || *stop_rx.borrow() {
						break;
					}
				}
			}
		}
	})
}
