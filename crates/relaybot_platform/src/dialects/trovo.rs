#![forbid(unsafe_code)]

use std::time::Duration;

use relaybot_domain::Platform;

use super::Dialect;
use crate::wire;

/// Trovo chat socket.
///
/// Tokens are channel-scoped, so AUTH carries only the token and no JOIN is
/// needed. The server advertises the next keepalive interval in PONG `gap`.
pub(super) fn dialect() -> Dialect {
	Dialect {
		platform: Platform::Trovo,
		ws_url: "wss://open-chat.trovo.live/chat".to_string(),
		join_after_auth: false,
		auth_includes_channel: false,
		channel_in_query: false,
		default_keepalive: Duration::from_secs(30),
		lifecycle_event_type: wire::CHAT_TYPE_LIFECYCLE,
		reward_event_types: &[wire::CHAT_TYPE_SPELL, wire::CHAT_TYPE_GIFT_SUB],
	}
}
