#![forbid(unsafe_code)]

//! Fire-and-forget credits notification for active chatters.
//!
//! Best-effort by design: failures are logged and counted, never retried,
//! and never part of the message-delivery success path.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use relaybot_platform::SecretString;
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatterPayload<'a> {
	channel_slug: &'a str,
	user_id: &'a str,
	display_name: &'a str,
}

pub struct CreditsNotifier {
	endpoint: String,
	internal_auth: SecretString,
	client: reqwest::Client,
}

impl CreditsNotifier {
	pub fn new(base_url: &str, internal_auth: SecretString) -> anyhow::Result<Self> {
		let client = reqwest::Client::builder()
			.user_agent("relaybot/0.x (credits)")
			.timeout(Duration::from_secs(3))
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			endpoint: format!("{}/internal/credits/chatter", base_url.trim_end_matches('/')),
			internal_auth,
			client,
		})
	}

	/// Notify the credits ledger about one chatter; spawned, never awaited by
	/// the caller's delivery path.
	pub fn notify_chatter(self: &Arc<Self>, channel_slug: String, user_id: String, display_name: String) {
		let notifier = Arc::clone(self);
		tokio::spawn(async move {
			let payload = ChatterPayload {
				channel_slug: &channel_slug,
				user_id: &user_id,
				display_name: &display_name,
			};

			let result = notifier
				.client
				.post(&notifier.endpoint)
				.header("X-Internal-Auth", notifier.internal_auth.expose())
				.json(&payload)
				.send()
				.await;

			match result {
				Ok(resp) if resp.status().is_success() => {
					debug!(channel = %channel_slug, user = %user_id, "credits chatter notified");
					metrics::counter!("relaybot_credits_notify_total").increment(1);
				}
				Ok(resp) => {
					warn!(channel = %channel_slug, status = %resp.status(), "credits callback rejected");
					metrics::counter!("relaybot_credits_notify_errors_total").increment(1);
				}
				Err(e) => {
					warn!(channel = %channel_slug, error = %e, "credits callback failed");
					metrics::counter!("relaybot_credits_notify_errors_total").increment(1);
				}
			}
		});
	}
}
