#![forbid(unsafe_code)]

//! Channel state store: the single owned map from channel id to live
//! per-channel session state.
//!
//! Mutation discipline: the subscription synchronizer owns structural
//! changes (insert/remove/identity updates); each channel's own runner owns
//! the connectivity fields. No other component writes here.

use std::collections::HashMap;
use std::time::SystemTime;

use relaybot_domain::{BotAccountId, ChannelId, ChannelSlug, Platform, PlatformChannelId, UserId};
use relaybot_platform::ConnectionHandle;
use relaybot_store::{ChatCommand, Subscription};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Control over one channel's runner task.
#[derive(Debug)]
pub struct RunnerControl {
	stop_tx: watch::Sender<bool>,
	task: Option<JoinHandle<()>>,
}

impl RunnerControl {
	pub fn new(stop_tx: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
		Self {
			stop_tx,
			task: Some(task),
		}
	}

	/// Test constructor: a runner that only observes its stop flag.
	#[cfg(test)]
	pub fn detached(stop_tx: watch::Sender<bool>) -> Self {
		Self { stop_tx, task: None }
	}

	/// Request the runner to stop; fire-and-forget.
	pub fn request_stop(&self) {
		let _ = self.stop_tx.send(true);
	}

	/// Whether the runner task is still running.
	pub fn is_alive(&self) -> bool {
		match &self.task {
			Some(task) => !task.is_finished(),
			None => !*self.stop_tx.borrow(),
		}
	}
}

/// Live state for one subscribed channel.
#[derive(Debug)]
pub struct ChannelSession {
	pub channel_id: ChannelId,
	pub user_id: UserId,
	pub platform: Platform,
	pub platform_channel_id: PlatformChannelId,
	pub slug: ChannelSlug,

	/// Resolved override bot; `None` means the shared default bot.
	pub bot_override: Option<BotAccountId>,

	pub handle: Option<ConnectionHandle>,
	pub last_connect: Option<SystemTime>,
	pub runner: Option<RunnerControl>,

	pub commands: Vec<ChatCommand>,
	pub commands_ts: Option<Instant>,
}

impl ChannelSession {
	pub fn from_subscription(sub: &Subscription, bot_override: Option<BotAccountId>) -> Self {
		Self {
			channel_id: sub.channel_id,
			user_id: sub.user_id,
			platform: sub.platform,
			platform_channel_id: sub.platform_channel_id.clone(),
			slug: sub.slug.clone(),
			bot_override,
			handle: None,
			last_connect: None,
			runner: None,
			commands: Vec::new(),
			commands_ts: None,
		}
	}

	/// Request disconnect and drop the connection handle.
	///
	/// The runner observes the stop flag and winds the socket down; the old
	/// handle must not be used for sends once the identity changed.
	pub fn request_disconnect(&mut self) {
		if let Some(runner) = &self.runner {
			runner.request_stop();
		}
		self.handle = None;
	}
}

/// Identity snapshot handed to runners; avoids holding the store lock while
/// connecting.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
	pub platform: Platform,
	pub platform_channel_id: PlatformChannelId,
	pub slug: ChannelSlug,
	pub bot_override: Option<BotAccountId>,
}

/// Result of an in-place identity update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityUpdate {
	Unchanged,
	Updated,
	/// The platform channel id changed; the old connection is invalid.
	PlatformChannelChanged,
}

/// Owned, injectable map from channel id to session state.
#[derive(Debug, Default)]
pub struct ChannelStateStore {
	sessions: RwLock<HashMap<ChannelId, ChannelSession>>,
}

impl ChannelStateStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn len(&self) -> usize {
		self.sessions.read().await.len()
	}

	pub async fn snapshot(&self, id: ChannelId) -> Option<SessionSnapshot> {
		self.sessions.read().await.get(&id).map(|s| SessionSnapshot {
			platform: s.platform,
			platform_channel_id: s.platform_channel_id.clone(),
			slug: s.slug.clone(),
			bot_override: s.bot_override.clone(),
		})
	}

	pub async fn handle_for(&self, id: ChannelId) -> Option<ConnectionHandle> {
		self.sessions.read().await.get(&id).and_then(|s| s.handle.clone())
	}

	pub async fn has_live_runner(&self, id: ChannelId) -> bool {
		self.sessions
			.read()
			.await
			.get(&id)
			.and_then(|s| s.runner.as_ref())
			.is_some_and(|r| r.is_alive())
	}

	// --- synchronizer-owned structural mutation ---

	pub async fn insert(&self, session: ChannelSession) {
		let mut sessions = self.sessions.write().await;
		sessions.insert(session.channel_id, session);
	}

	/// Disconnect and remove every session of `platform` absent from `keep`.
	/// Returns the removed channel ids.
	pub async fn retain_channels(&self, platform: Platform, keep: &[ChannelId]) -> Vec<ChannelId> {
		let mut sessions = self.sessions.write().await;
		let stale: Vec<ChannelId> = sessions
			.values()
			.filter(|s| s.platform == platform && !keep.contains(&s.channel_id))
			.map(|s| s.channel_id)
			.collect();

		for id in &stale {
			if let Some(mut session) = sessions.remove(id) {
				debug!(channel = %id, "removing unsubscribed channel session");
				session.request_disconnect();
			}
		}

		stale
	}

	/// Update mutable identity fields in place.
	pub async fn update_identity(
		&self,
		sub: &Subscription,
		bot_override: Option<BotAccountId>,
	) -> Option<IdentityUpdate> {
		let mut sessions = self.sessions.write().await;
		let session = sessions.get_mut(&sub.channel_id)?;

		let platform_channel_changed = session.platform_channel_id != sub.platform_channel_id;
		let changed = platform_channel_changed
			|| session.slug != sub.slug
			|| session.user_id != sub.user_id
			|| session.bot_override != bot_override;

		session.user_id = sub.user_id;
		session.slug = sub.slug.clone();
		session.platform_channel_id = sub.platform_channel_id.clone();
		session.bot_override = bot_override;

		if platform_channel_changed {
			// The open connection points at the old platform channel.
			session.request_disconnect();
			Some(IdentityUpdate::PlatformChannelChanged)
		} else if changed {
			Some(IdentityUpdate::Updated)
		} else {
			Some(IdentityUpdate::Unchanged)
		}
	}

	pub async fn set_runner(&self, id: ChannelId, runner: RunnerControl) {
		let mut sessions = self.sessions.write().await;
		if let Some(session) = sessions.get_mut(&id) {
			if let Some(old) = session.runner.take() {
				old.request_stop();
			}
			session.runner = Some(runner);
		}
	}

	/// Stop every runner; used once at shutdown.
	pub async fn disconnect_all(&self) {
		let mut sessions = self.sessions.write().await;
		for session in sessions.values_mut() {
			session.request_disconnect();
		}
	}

	// --- runner-owned connectivity mutation ---

	pub async fn set_handle(&self, id: ChannelId, handle: ConnectionHandle) {
		let mut sessions = self.sessions.write().await;
		if let Some(session) = sessions.get_mut(&id) {
			session.handle = Some(handle);
			session.last_connect = Some(SystemTime::now());
		}
	}

	pub async fn clear_handle(&self, id: ChannelId) {
		let mut sessions = self.sessions.write().await;
		if let Some(session) = sessions.get_mut(&id) {
			session.handle = None;
			if let Some(since) = session.last_connect
				&& let Ok(uptime) = since.elapsed()
			{
				debug!(channel = %id, uptime_secs = uptime.as_secs(), "connection handle cleared");
			}
		}
	}

	// --- command cache ---

	/// Cached commands if refreshed within `ttl`.
	pub async fn commands_if_fresh(&self, id: ChannelId, ttl: std::time::Duration) -> Option<Vec<ChatCommand>> {
		let sessions = self.sessions.read().await;
		let session = sessions.get(&id)?;
		let ts = session.commands_ts?;
		if ts.elapsed() < ttl {
			Some(session.commands.clone())
		} else {
			None
		}
	}

	pub async fn set_commands(&self, id: ChannelId, commands: Vec<ChatCommand>) {
		let mut sessions = self.sessions.write().await;
		if let Some(session) = sessions.get_mut(&id) {
			session.commands = commands;
			session.commands_ts = Some(Instant::now());
		}
	}
}
