#![forbid(unsafe_code)]

use std::time::Duration;

use relaybot_domain::Platform;

use super::Dialect;
use crate::wire;

/// Twitch chat gateway.
///
/// The bot token spans channels, so the channel is joined explicitly after
/// AUTH succeeds.
pub(super) fn dialect() -> Dialect {
	Dialect {
		platform: Platform::Twitch,
		ws_url: "wss://chat-gw.twitch.tv/ws".to_string(),
		join_after_auth: true,
		auth_includes_channel: false,
		channel_in_query: false,
		default_keepalive: Duration::from_secs(60),
		lifecycle_event_type: wire::CHAT_TYPE_LIFECYCLE,
		reward_event_types: &[wire::CHAT_TYPE_SPELL],
	}
}
