#![forbid(unsafe_code)]

use std::time::Duration;

use relaybot_domain::Platform;

use super::Dialect;
use crate::wire;

/// YouTube live chat bridge.
///
/// The bridge resolves the active live chat from the channel id carried in
/// the AUTH frame; keepalive runs slow because the bridge batches upstream
/// polling.
pub(super) fn dialect() -> Dialect {
	Dialect {
		platform: Platform::YouTube,
		ws_url: "wss://livechat-relay.googleapis.com/v1/ws".to_string(),
		join_after_auth: false,
		auth_includes_channel: true,
		channel_in_query: false,
		default_keepalive: Duration::from_secs(90),
		lifecycle_event_type: wire::CHAT_TYPE_LIFECYCLE,
		reward_event_types: &[wire::CHAT_TYPE_GIFT_SUB],
	}
}
