#![forbid(unsafe_code)]

//! Chat command matching against the per-session command cache.

use std::sync::Arc;
use std::time::Duration;

use relaybot_domain::ChannelId;
use relaybot_platform::ChatEvent;
use relaybot_store::{BotRepository, ChatCommand};
use tracing::{debug, warn};

use crate::server::state::ChannelStateStore;

/// Matches inbound chat lines against configured commands, refreshing the
/// session's command cache when it goes stale.
pub struct CommandEngine {
	repo: Arc<dyn BotRepository>,
	store: Arc<ChannelStateStore>,
	cache_ttl: Duration,
}

impl CommandEngine {
	pub fn new(repo: Arc<dyn BotRepository>, store: Arc<ChannelStateStore>, cache_ttl: Duration) -> Self {
		Self {
			repo,
			store,
			cache_ttl,
		}
	}

	async fn commands_for(&self, channel: ChannelId) -> Vec<ChatCommand> {
		if let Some(cached) = self.store.commands_if_fresh(channel, self.cache_ttl).await {
			return cached;
		}

		match self.repo.list_commands(&[channel]).await {
			Ok(commands) => {
				self.store.set_commands(channel, commands.clone()).await;
				commands
			}
			Err(e) => {
				// A stale cache beats no commands at all.
				warn!(channel = %channel, error = %e, "command refresh failed; keeping cached commands");
				self.store
					.commands_if_fresh(channel, Duration::MAX)
					.await
					.unwrap_or_default()
			}
		}
	}

	/// Find the command response for one chat line, if any.
	///
	/// `live` gates commands flagged `only_when_live`.
	pub async fn match_command(&self, channel: ChannelId, chat: &ChatEvent, live: bool) -> Option<String> {
		let Some(trigger_token) = first_token(&chat.text) else {
			return None;
		};

		let commands = self.commands_for(channel).await;
		for command in &commands {
			if !trigger_matches(&command.trigger, trigger_token) {
				continue;
			}
			if command.only_when_live && !live {
				debug!(channel = %channel, trigger = %command.trigger, "command gated: stream not live");
				continue;
			}
			if !sender_allowed(command, chat) {
				debug!(channel = %channel, trigger = %command.trigger, login = %chat.login, "command gated: sender not allowed");
				continue;
			}
			return Some(command.response.clone());
		}

		None
	}
}

fn first_token(text: &str) -> Option<&str> {
	text.split_whitespace().next()
}

/// Trigger comparison: case-insensitive, tolerant of a leading `!` on either
/// side.
fn trigger_matches(trigger: &str, token: &str) -> bool {
	let trigger = trigger.trim().trim_start_matches('!');
	let token = token.trim_start_matches('!');
	!trigger.is_empty() && trigger.eq_ignore_ascii_case(token)
}

fn sender_allowed(command: &ChatCommand, chat: &ChatEvent) -> bool {
	if command.allowed_users.is_empty() {
		return true;
	}
	command
		.allowed_users
		.iter()
		.any(|allowed| allowed.eq_ignore_ascii_case(&chat.login) || allowed == &chat.user_id)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn command(trigger: &str) -> ChatCommand {
		ChatCommand {
			channel_id: ChannelId(1),
			trigger: trigger.to_string(),
			response: format!("response for {trigger}"),
			only_when_live: false,
			allowed_users: Vec::new(),
		}
	}

	fn chat(text: &str) -> ChatEvent {
		ChatEvent {
			user_id: "u1".to_string(),
			login: "bob".to_string(),
			display_name: "Bob".to_string(),
			text: text.to_string(),
		}
	}

	#[test]
	fn trigger_matching_rules() {
		assert!(trigger_matches("!hello", "!hello"));
		assert!(trigger_matches("hello", "!hello"));
		assert!(trigger_matches("!hello", "hello"));
		assert!(trigger_matches("Hello", "!HELLO"));
		assert!(!trigger_matches("!hello", "!helloo"));
		assert!(!trigger_matches("", "anything"));
		assert!(!trigger_matches("!", "!"));
	}

	#[test]
	fn allowed_users_filtering() {
		let mut cmd = command("!mod");
		assert!(sender_allowed(&cmd, &chat("!mod")));

		cmd.allowed_users = vec!["alice".to_string()];
		assert!(!sender_allowed(&cmd, &chat("!mod")));

		cmd.allowed_users = vec!["BOB".to_string()];
		assert!(sender_allowed(&cmd, &chat("!mod")));

		// Matching by user id is also accepted.
		cmd.allowed_users = vec!["u1".to_string()];
		assert!(sender_allowed(&cmd, &chat("!mod")));
	}

	#[tokio::test]
	async fn matches_and_gates_by_live_state() {
		let repo = Arc::new(relaybot_store::MemoryRepository::new());
		let store = Arc::new(ChannelStateStore::new());

		let mut live_only = command("!uptime");
		live_only.only_when_live = true;
		repo.set_commands(vec![command("!hello"), live_only]);

		let engine = CommandEngine::new(repo, store, Duration::from_secs(60));

		let hello = engine.match_command(ChannelId(1), &chat("!hello world"), false).await;
		assert_eq!(hello.as_deref(), Some("response for !hello"));

		let gated = engine.match_command(ChannelId(1), &chat("!uptime"), false).await;
		assert!(gated.is_none());

		let open = engine.match_command(ChannelId(1), &chat("!uptime"), true).await;
		assert_eq!(open.as_deref(), Some("response for !uptime"));

		let none = engine.match_command(ChannelId(1), &chat("plain message"), true).await;
		assert!(none.is_none());
	}
}
