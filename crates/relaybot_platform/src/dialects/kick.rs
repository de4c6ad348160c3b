#![forbid(unsafe_code)]

use std::time::Duration;

use relaybot_domain::Platform;

use super::Dialect;
use crate::wire;

/// Kick chatroom socket.
///
/// The chatroom id rides in the endpoint query and a JOIN frame follows AUTH.
pub(super) fn dialect() -> Dialect {
	Dialect {
		platform: Platform::Kick,
		ws_url: "wss://ws-us2.chat.kick.com/connect".to_string(),
		join_after_auth: true,
		auth_includes_channel: false,
		channel_in_query: true,
		default_keepalive: Duration::from_secs(25),
		lifecycle_event_type: wire::CHAT_TYPE_LIFECYCLE,
		reward_event_types: &[wire::CHAT_TYPE_GIFT_SUB],
	}
}
