#![forbid(unsafe_code)]

//! In-memory repository used by tests and database-less demo runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use relaybot_domain::{ChannelId, Platform};

use crate::{
	BotOverride, BotRepository, ChatCommand, NewOutboxMessage, OutboxMessage, OutboxStatus, StoreResult, Subscription,
};

#[derive(Debug, Default)]
struct Inner {
	subscriptions: Vec<Subscription>,
	overrides: Vec<BotOverride>,
	commands: Vec<ChatCommand>,
	outbox: Vec<OutboxMessage>,
	next_outbox_id: i64,
	/// When set, override lookups fail (sync must tolerate this).
	fail_overrides: bool,
}

/// Mutex-backed repository with the same contract as the Postgres one.
#[derive(Debug, Default)]
pub struct MemoryRepository {
	inner: Mutex<Inner>,
}

impl MemoryRepository {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set_subscriptions(&self, subscriptions: Vec<Subscription>) {
		self.inner.lock().expect("memory repo lock").subscriptions = subscriptions;
	}

	pub fn set_overrides(&self, overrides: Vec<BotOverride>) {
		self.inner.lock().expect("memory repo lock").overrides = overrides;
	}

	pub fn set_commands(&self, commands: Vec<ChatCommand>) {
		self.inner.lock().expect("memory repo lock").commands = commands;
	}

	pub fn set_fail_overrides(&self, fail: bool) {
		self.inner.lock().expect("memory repo lock").fail_overrides = fail;
	}

	/// Snapshot of every outbox row, for assertions.
	pub fn outbox_snapshot(&self) -> Vec<OutboxMessage> {
		self.inner.lock().expect("memory repo lock").outbox.clone()
	}

	pub fn outbox_with_status(&self, status: OutboxStatus) -> Vec<OutboxMessage> {
		self.inner
			.lock()
			.expect("memory repo lock")
			.outbox
			.iter()
			.filter(|m| m.status == status)
			.cloned()
			.collect()
	}
}

#[async_trait]
impl BotRepository for MemoryRepository {
	async fn list_enabled_subscriptions(&self, platform: Platform) -> StoreResult<Vec<Subscription>> {
		let inner = self.inner.lock().expect("memory repo lock");
		Ok(inner
			.subscriptions
			.iter()
			.filter(|s| s.platform == platform)
			.cloned()
			.collect())
	}

	async fn list_bot_overrides(&self, channel_ids: &[ChannelId]) -> StoreResult<Vec<BotOverride>> {
		let inner = self.inner.lock().expect("memory repo lock");
		if inner.fail_overrides {
			return Err(crate::StoreError::CorruptRow("override lookup unavailable".to_string()));
		}
		Ok(inner
			.overrides
			.iter()
			.filter(|o| channel_ids.contains(&o.channel_id))
			.cloned()
			.collect())
	}

	async fn list_commands(&self, channel_ids: &[ChannelId]) -> StoreResult<Vec<ChatCommand>> {
		let inner = self.inner.lock().expect("memory repo lock");
		Ok(inner
			.commands
			.iter()
			.filter(|c| channel_ids.contains(&c.channel_id))
			.cloned()
			.collect())
	}

	async fn enqueue_outbox(&self, message: NewOutboxMessage) -> StoreResult<i64> {
		let mut inner = self.inner.lock().expect("memory repo lock");
		inner.next_outbox_id += 1;
		let id = inner.next_outbox_id;
		inner.outbox.push(OutboxMessage {
			id,
			channel_id: message.channel_id,
			target_login: message.target_login,
			text: message.text,
			created_at: Utc::now(),
			status: OutboxStatus::Pending,
			attempts: 0,
		});
		Ok(id)
	}

	async fn claim_outbox_batch(&self, limit: i64) -> StoreResult<Vec<OutboxMessage>> {
		let inner = self.inner.lock().expect("memory repo lock");
		let mut pending: Vec<OutboxMessage> = inner
			.outbox
			.iter()
			.filter(|m| m.status == OutboxStatus::Pending)
			.cloned()
			.collect();
		pending.sort_by_key(|m| (m.created_at, m.id));
		pending.truncate(limit.max(0) as usize);
		Ok(pending)
	}

	async fn mark_outbox_sent(&self, id: i64) -> StoreResult<()> {
		let mut inner = self.inner.lock().expect("memory repo lock");
		if let Some(msg) = inner.outbox.iter_mut().find(|m| m.id == id) {
			msg.status = OutboxStatus::Sent;
		}
		Ok(())
	}

	async fn record_outbox_failure(&self, id: i64) -> StoreResult<i32> {
		let mut inner = self.inner.lock().expect("memory repo lock");
		match inner.outbox.iter_mut().find(|m| m.id == id) {
			Some(msg) => {
				msg.attempts += 1;
				Ok(msg.attempts)
			}
			None => Ok(0),
		}
	}

	async fn mark_outbox_failed(&self, id: i64) -> StoreResult<()> {
		let mut inner = self.inner.lock().expect("memory repo lock");
		if let Some(msg) = inner.outbox.iter_mut().find(|m| m.id == id) {
			msg.status = OutboxStatus::Failed;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use relaybot_domain::{ChannelSlug, PlatformChannelId, UserId};

	use super::*;

	fn subscription(channel: i64, platform: Platform) -> Subscription {
		Subscription {
			channel_id: ChannelId(channel),
			user_id: UserId(channel * 10),
			platform,
			platform_channel_id: PlatformChannelId::new(format!("p{channel}")).unwrap(),
			slug: ChannelSlug::new(format!("s{channel}")).unwrap(),
		}
	}

	#[tokio::test]
	async fn filters_subscriptions_by_platform() {
		let repo = MemoryRepository::new();
		repo.set_subscriptions(vec![
			subscription(1, Platform::Trovo),
			subscription(2, Platform::Twitch),
		]);

		let trovo = repo.list_enabled_subscriptions(Platform::Trovo).await.unwrap();
		assert_eq!(trovo.len(), 1);
		assert_eq!(trovo[0].channel_id, ChannelId(1));
	}

	#[tokio::test]
	async fn outbox_lifecycle() {
		let repo = MemoryRepository::new();
		let id = repo
			.enqueue_outbox(NewOutboxMessage {
				channel_id: ChannelId(1),
				target_login: "s1".to_string(),
				text: "hello".to_string(),
			})
			.await
			.unwrap();

		let claimed = repo.claim_outbox_batch(10).await.unwrap();
		assert_eq!(claimed.len(), 1);
		assert_eq!(claimed[0].id, id);

		assert_eq!(repo.record_outbox_failure(id).await.unwrap(), 1);
		repo.mark_outbox_sent(id).await.unwrap();
		assert!(repo.claim_outbox_batch(10).await.unwrap().is_empty());
		assert_eq!(repo.outbox_with_status(OutboxStatus::Sent).len(), 1);
	}

	#[tokio::test]
	async fn claim_one_is_oldest_first() {
		let repo = MemoryRepository::new();
		for text in ["a", "b"] {
			repo.enqueue_outbox(NewOutboxMessage {
				channel_id: ChannelId(1),
				target_login: "s1".to_string(),
				text: text.to_string(),
			})
			.await
			.unwrap();
		}

		let one = repo.claim_outbox_one().await.unwrap().unwrap();
		assert_eq!(one.text, "a");
	}
}
