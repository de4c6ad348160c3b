#![forbid(unsafe_code)]

//! Data-store repository consumed by the bot runtime.
//!
//! The relational schema (subscriptions, bot overrides, commands, outbox)
//! belongs to the main product; this crate only reads and writes it through
//! the [`BotRepository`] interface.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relaybot_domain::{BotAccountId, ChannelId, ChannelSlug, Platform, PlatformChannelId, UserId};
use thiserror::Error;

pub use memory::MemoryRepository;
pub use postgres::PgRepository;

/// Repository errors.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("corrupt row: {0}")]
	CorruptRow(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One enabled channel subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
	pub channel_id: ChannelId,
	pub user_id: UserId,
	pub platform: Platform,
	pub platform_channel_id: PlatformChannelId,
	pub slug: ChannelSlug,
}

/// Per-channel alternate bot identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotOverride {
	pub channel_id: ChannelId,
	pub bot_account_id: BotAccountId,
}

/// One configured chat command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatCommand {
	pub channel_id: ChannelId,
	pub trigger: String,
	pub response: String,
	pub only_when_live: bool,
	/// Logins allowed to trigger the command; empty means everyone.
	pub allowed_users: Vec<String>,
}

/// Outbox delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
	Pending,
	Sent,
	Failed,
}

impl OutboxStatus {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Pending => "pending",
			Self::Sent => "sent",
			Self::Failed => "failed",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"pending" => Some(Self::Pending),
			"sent" => Some(Self::Sent),
			"failed" => Some(Self::Failed),
			_ => None,
		}
	}
}

/// One durable outbound chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
	pub id: i64,
	pub channel_id: ChannelId,
	pub target_login: String,
	pub text: String,
	pub created_at: DateTime<Utc>,
	pub status: OutboxStatus,
	pub attempts: i32,
}

/// Outbox insert payload.
#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
	pub channel_id: ChannelId,
	pub target_login: String,
	pub text: String,
}

/// Read/write interface over the product's relational store.
#[async_trait]
pub trait BotRepository: Send + Sync {
	/// Enabled subscriptions for one platform, honoring the per-channel
	/// integration gate when that table exists.
	async fn list_enabled_subscriptions(&self, platform: Platform) -> StoreResult<Vec<Subscription>>;

	/// Bot-override mappings for the given channels.
	async fn list_bot_overrides(&self, channel_ids: &[ChannelId]) -> StoreResult<Vec<BotOverride>>;

	/// Configured chat commands for the given channels.
	async fn list_commands(&self, channel_ids: &[ChannelId]) -> StoreResult<Vec<ChatCommand>>;

	/// Insert a pending outbox message; returns its id.
	async fn enqueue_outbox(&self, message: NewOutboxMessage) -> StoreResult<i64>;

	/// Claim up to `limit` pending messages, oldest first.
	///
	/// Claiming does not change status; a deferred message simply stays
	/// pending for a later pass.
	async fn claim_outbox_batch(&self, limit: i64) -> StoreResult<Vec<OutboxMessage>>;

	/// Claim a single pending message (queue-worker mode).
	async fn claim_outbox_one(&self) -> StoreResult<Option<OutboxMessage>> {
		Ok(self.claim_outbox_batch(1).await?.into_iter().next())
	}

	/// Mark a message delivered; it is never resent by the normal path.
	async fn mark_outbox_sent(&self, id: i64) -> StoreResult<()>;

	/// Record a failed attempt; returns the new attempt count.
	async fn record_outbox_failure(&self, id: i64) -> StoreResult<i32>;

	/// Mark a message permanently failed.
	async fn mark_outbox_failed(&self, id: i64) -> StoreResult<()>;
}
