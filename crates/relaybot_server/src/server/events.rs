#![forbid(unsafe_code)]

//! Inbound event pipeline: lifecycle signals feed the stream tracker, reward
//! redemptions skip command matching, chat lines feed credits and commands.

use std::sync::Arc;

use relaybot_store::{BotRepository, NewOutboxMessage};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::server::commands::CommandEngine;
use crate::server::credits::CreditsNotifier;
use crate::server::lifecycle::StreamDurationTracker;
use crate::server::rewards::RewardsGate;
use crate::server::runner::ChannelEvent;

pub struct EventPipeline {
	repo: Arc<dyn BotRepository>,
	commands: CommandEngine,
	lifecycle: Arc<StreamDurationTracker>,
	credits: Option<Arc<CreditsNotifier>>,
	rewards: RewardsGate,
}

impl EventPipeline {
	pub fn new(
		repo: Arc<dyn BotRepository>,
		commands: CommandEngine,
		lifecycle: Arc<StreamDurationTracker>,
		credits: Option<Arc<CreditsNotifier>>,
		rewards: RewardsGate,
	) -> Self {
		Self {
			repo,
			commands,
			lifecycle,
			credits,
			rewards,
		}
	}

	pub async fn handle(&self, event: ChannelEvent) {
		use relaybot_platform::SessionEvent;

		match event.event {
			SessionEvent::Lifecycle(signal) => {
				self.lifecycle.record(event.channel_id, signal);
			}

			SessionEvent::Reward(reward) => {
				metrics::counter!("relaybot_rewards_total", "platform" => event.platform.as_str()).increment(1);
				// Rewards are not conversational; no command matching.
				if let Some(ack) = self.rewards.acknowledgement(&reward) {
					self.enqueue(event.channel_id, event.slug.as_str(), ack).await;
				}
			}

			SessionEvent::Chat(chat) => {
				metrics::counter!("relaybot_chat_events_total", "platform" => event.platform.as_str()).increment(1);

				if let Some(credits) = &self.credits {
					credits.notify_chatter(
						event.slug.as_str().to_string(),
						chat.user_id.clone(),
						chat.display_name.clone(),
					);
				}

				let live = self.lifecycle.is_live(event.channel_id);
				if let Some(response) = self.commands.match_command(event.channel_id, &chat, live).await {
					debug!(channel = %event.channel_id, login = %chat.login, "command matched");
					metrics::counter!("relaybot_commands_matched_total").increment(1);
					self.enqueue(event.channel_id, event.slug.as_str(), response).await;
				}
			}
		}
	}

	async fn enqueue(&self, channel_id: relaybot_domain::ChannelId, slug: &str, text: String) {
		let message = NewOutboxMessage {
			channel_id,
			target_login: slug.to_string(),
			text,
		};
		if let Err(e) = self.repo.enqueue_outbox(message).await {
			warn!(channel = %channel_id, error = %e, "failed to enqueue outbox message");
		}
	}

	/// Consume tagged session events until the stream or the stop flag ends.
	pub fn spawn(
		self: Arc<Self>,
		mut events_rx: mpsc::Receiver<ChannelEvent>,
		mut stop_rx: watch::Receiver<bool>,
	) -> JoinHandle<()> {
		tokio::spawn(async move {
			loop {
				tokio::select! {
					event = events_rx.recv() => {
						let Some(event) = event else {
							break;
						};
						self.handle(event).await;
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
}
