#![forbid(unsafe_code)]

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relaybot_domain::{BotAccountId, ChannelId, ChannelSlug, Platform, PlatformChannelId, UserId};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::debug;

use crate::{
	BotOverride, BotRepository, ChatCommand, NewOutboxMessage, OutboxMessage, OutboxStatus, StoreError, StoreResult,
	Subscription,
};

/// Postgres code for `undefined_table`.
const UNDEFINED_TABLE: &str = "42P01";

/// Postgres-backed repository over the product schema.
#[derive(Debug, Clone)]
pub struct PgRepository {
	pool: PgPool,
}

impl PgRepository {
	pub async fn connect(database_url: &str) -> StoreResult<Self> {
		let pool = PgPoolOptions::new().max_connections(8).connect(database_url).await?;
		Ok(Self { pool })
	}

	pub fn from_pool(pool: PgPool) -> Self {
		Self { pool }
	}

	fn is_undefined_table(err: &sqlx::Error) -> bool {
		match err {
			sqlx::Error::Database(db) => db.code().as_deref() == Some(UNDEFINED_TABLE),
			_ => false,
		}
	}

	fn subscription_from_row(row: &PgRow) -> StoreResult<Subscription> {
		let platform_raw: String = row.try_get("platform")?;
		let platform = Platform::from_str(&platform_raw)
			.map_err(|e| StoreError::CorruptRow(format!("subscription platform: {e}")))?;

		let platform_channel_id: String = row.try_get("platform_channel_id")?;
		let slug: String = row.try_get("slug")?;

		Ok(Subscription {
			channel_id: ChannelId(row.try_get("channel_id")?),
			user_id: UserId(row.try_get("user_id")?),
			platform,
			platform_channel_id: PlatformChannelId::new(platform_channel_id)
				.map_err(|e| StoreError::CorruptRow(format!("subscription platform_channel_id: {e}")))?,
			slug: ChannelSlug::new(slug).map_err(|e| StoreError::CorruptRow(format!("subscription slug: {e}")))?,
		})
	}

	fn outbox_from_row(row: &PgRow) -> StoreResult<OutboxMessage> {
		let status_raw: String = row.try_get("status")?;
		let status = OutboxStatus::parse(&status_raw)
			.ok_or_else(|| StoreError::CorruptRow(format!("outbox status: {status_raw}")))?;
		let created_at: DateTime<Utc> = row.try_get("created_at")?;

		Ok(OutboxMessage {
			id: row.try_get("id")?,
			channel_id: ChannelId(row.try_get("channel_id")?),
			target_login: row.try_get("target_login")?,
			text: row.try_get("message")?,
			created_at,
			status,
			attempts: row.try_get("attempts")?,
		})
	}
}

#[async_trait]
impl BotRepository for PgRepository {
	async fn list_enabled_subscriptions(&self, platform: Platform) -> StoreResult<Vec<Subscription>> {
		let gated = sqlx::query(
			r#"
			SELECT s.channel_id, s.user_id, s.platform, s.platform_channel_id, s.slug
			FROM subscriptions s
			LEFT JOIN integration_settings g ON g.channel_id = s.channel_id
			WHERE s.enabled = TRUE
			  AND s.platform = $1
			  AND COALESCE(g.bot_enabled, TRUE)
			ORDER BY s.channel_id
			"#,
		)
		.bind(platform.as_str())
		.fetch_all(&self.pool)
		.await;

		let rows = match gated {
			Ok(rows) => rows,
			// Schema not migrated yet: treat as "no gating" rather than failing.
			Err(e) if Self::is_undefined_table(&e) => {
				debug!(platform = %platform, "integration gate table missing; listing subscriptions ungated");
				sqlx::query(
					r#"
					SELECT s.channel_id, s.user_id, s.platform, s.platform_channel_id, s.slug
					FROM subscriptions s
					WHERE s.enabled = TRUE AND s.platform = $1
					ORDER BY s.channel_id
					"#,
				)
				.bind(platform.as_str())
				.fetch_all(&self.pool)
				.await?
			}
			Err(e) => return Err(e.into()),
		};

		rows.iter().map(Self::subscription_from_row).collect()
	}

	async fn list_bot_overrides(&self, channel_ids: &[ChannelId]) -> StoreResult<Vec<BotOverride>> {
		if channel_ids.is_empty() {
			return Ok(Vec::new());
		}
		let ids: Vec<i64> = channel_ids.iter().map(|c| c.as_i64()).collect();

		let rows = sqlx::query(
			r#"
			SELECT channel_id, bot_account_id
			FROM bot_overrides
			WHERE channel_id = ANY($1)
			"#,
		)
		.bind(&ids)
		.fetch_all(&self.pool)
		.await?;

		rows.iter()
			.map(|row| {
				let account: String = row.try_get("bot_account_id")?;
				Ok(BotOverride {
					channel_id: ChannelId(row.try_get("channel_id")?),
					bot_account_id: BotAccountId::new(account)
						.map_err(|e| StoreError::CorruptRow(format!("bot override account: {e}")))?,
				})
			})
			.collect()
	}

	async fn list_commands(&self, channel_ids: &[ChannelId]) -> StoreResult<Vec<ChatCommand>> {
		if channel_ids.is_empty() {
			return Ok(Vec::new());
		}
		let ids: Vec<i64> = channel_ids.iter().map(|c| c.as_i64()).collect();

		let rows = sqlx::query(
			r#"
			SELECT channel_id, command, response, only_when_live, allowed_users
			FROM chat_commands
			WHERE channel_id = ANY($1)
			ORDER BY channel_id, trigger
			"#,
		)
		.bind(&ids)
		.fetch_all(&self.pool)
		.await?;

		rows.iter()
			.map(|row| {
				let allowed_users: Option<Vec<String>> = row.try_get("allowed_users")?;
				Ok(ChatCommand {
					channel_id: ChannelId(row.try_get("channel_id")?),
					trigger: row.try_get("command")?,
					response: row.try_get("response")?,
					only_when_live: row.try_get("only_when_live")?,
					allowed_users: allowed_users.unwrap_or_default(),
				})
			})
			.collect()
	}

	async fn enqueue_outbox(&self, message: NewOutboxMessage) -> StoreResult<i64> {
		let row = sqlx::query(
			r#"
			INSERT INTO outbox_messages (channel_id, target_login, message, status, attempts, created_at)
			VALUES ($1, $2, $3, 'pending', 0, NOW())
			RETURNING id
			"#,
		)
		.bind(message.channel_id.as_i64())
		.bind(&message.target_login)
		.bind(&message.text)
		.fetch_one(&self.pool)
		.await?;

		Ok(row.try_get("id")?)
	}

	async fn claim_outbox_batch(&self, limit: i64) -> StoreResult<Vec<OutboxMessage>> {
		let rows = sqlx::query(
			r#"
			SELECT id, channel_id, target_login, message, created_at, status, attempts
			FROM outbox_messages
			WHERE status = 'pending'
			ORDER BY created_at
			LIMIT $1
			"#,
		)
		.bind(limit)
		.fetch_all(&self.pool)
		.await?;

		rows.iter().map(Self::outbox_from_row).collect()
	}

	async fn mark_outbox_sent(&self, id: i64) -> StoreResult<()> {
		sqlx::query("UPDATE outbox_messages SET status = 'sent', sent_at = NOW() WHERE id = $1")
			.bind(id)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	async fn record_outbox_failure(&self, id: i64) -> StoreResult<i32> {
		let row = sqlx::query("UPDATE outbox_messages SET attempts = attempts + 1 WHERE id = $1 RETURNING attempts")
			.bind(id)
			.fetch_one(&self.pool)
			.await?;
		Ok(row.try_get("attempts")?)
	}

	async fn mark_outbox_failed(&self, id: i64) -> StoreResult<()> {
		sqlx::query("UPDATE outbox_messages SET status = 'failed' WHERE id = $1")
			.bind(id)
			.execute(&self.pool)
			.await?;
		Ok(())
	}
}
