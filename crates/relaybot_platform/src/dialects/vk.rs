#![forbid(unsafe_code)]

use std::time::Duration;

use relaybot_domain::Platform;

use super::Dialect;
use crate::wire;

/// VK Video live chat socket.
pub(super) fn dialect() -> Dialect {
	Dialect {
		platform: Platform::VkVideo,
		ws_url: "wss://live.vkvideo.ru/chat/ws".to_string(),
		join_after_auth: false,
		auth_includes_channel: true,
		channel_in_query: false,
		default_keepalive: Duration::from_secs(30),
		lifecycle_event_type: wire::CHAT_TYPE_LIFECYCLE,
		reward_event_types: &[wire::CHAT_TYPE_SPELL, wire::CHAT_TYPE_GIFT_SUB],
	}
}
