#![forbid(unsafe_code)]

//! Per-platform wire dialects.
//!
//! All platforms share the session machine and the frame vocabulary in
//! [`crate::wire`]; a dialect only decides where to connect, how the channel
//! is named during the handshake and which reserved chat-item types carry
//! lifecycle/reward events.

mod kick;
mod trovo;
mod twitch;
mod vk;
mod youtube;

use std::time::Duration;

use anyhow::Context;
use relaybot_domain::{Platform, PlatformChannelId};
use url::Url;

use crate::wire;

/// Wire dialect for one platform.
#[derive(Debug, Clone)]
pub struct Dialect {
	pub platform: Platform,
	pub ws_url: String,

	/// Whether a JOIN frame must follow a successful AUTH.
	pub join_after_auth: bool,

	/// Whether AUTH carries the platform channel id (tokens not channel-scoped).
	pub auth_includes_channel: bool,

	/// Whether the channel id rides in the endpoint query string.
	pub channel_in_query: bool,

	pub default_keepalive: Duration,

	pub lifecycle_event_type: u32,
	pub reward_event_types: &'static [u32],
}

impl Dialect {
	/// Dialect for `platform` with its default endpoint.
	pub fn for_platform(platform: Platform) -> Self {
		match platform {
			Platform::Twitch => twitch::dialect(),
			Platform::YouTube => youtube::dialect(),
			Platform::Trovo => trovo::dialect(),
			Platform::Kick => kick::dialect(),
			Platform::VkVideo => vk::dialect(),
		}
	}

	/// Override the websocket endpoint (config/test hook).
	pub fn with_ws_url(mut self, ws_url: impl Into<String>) -> Self {
		self.ws_url = ws_url.into();
		self
	}

	/// Connection endpoint for one channel.
	pub fn endpoint(&self, channel: &PlatformChannelId) -> anyhow::Result<Url> {
		let mut url = Url::parse(&self.ws_url).with_context(|| format!("parse {} ws url", self.platform))?;
		if self.channel_in_query {
			url.query_pairs_mut().append_pair("channel_id", channel.as_str());
		}
		Ok(url)
	}

	pub fn auth_frame(&self, nonce: &str, token: &str, channel: &PlatformChannelId) -> String {
		let channel = self.auth_includes_channel.then_some(channel.as_str());
		wire::encode_auth(nonce, token, channel)
	}

	pub fn join_frame(&self, channel: &PlatformChannelId) -> Option<String> {
		self.join_after_auth.then(|| wire::encode_join(channel.as_str()))
	}

	pub fn chat_frame(&self, channel: &PlatformChannelId, text: &str) -> String {
		wire::encode_chat_send(channel.as_str(), text)
	}

	pub fn is_lifecycle(&self, kind: u32) -> bool {
		kind == self.lifecycle_event_type
	}

	pub fn is_reward(&self, kind: u32) -> bool {
		self.reward_event_types.contains(&kind)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn every_platform_has_a_dialect() {
		for platform in Platform::ALL {
			let d = Dialect::for_platform(platform);
			assert_eq!(d.platform, platform);
			assert!(d.ws_url.starts_with("wss://"), "{platform} ws url: {}", d.ws_url);
			assert!(d.default_keepalive >= Duration::from_secs(wire::MIN_KEEPALIVE_SECS));
		}
	}

	#[test]
	fn channel_in_query_lands_in_endpoint() {
		let channel = PlatformChannelId::new("chan-7").unwrap();

		let kick = Dialect::for_platform(Platform::Kick);
		assert!(kick.channel_in_query);
		let url = kick.endpoint(&channel).unwrap();
		assert!(url.query().unwrap_or_default().contains("channel_id=chan-7"));

		let trovo = Dialect::for_platform(Platform::Trovo);
		assert!(!trovo.channel_in_query);
		assert!(trovo.endpoint(&channel).unwrap().query().is_none());
	}

	#[test]
	fn join_frame_only_for_join_dialects() {
		let channel = PlatformChannelId::new("c1").unwrap();
		assert!(Dialect::for_platform(Platform::Twitch).join_frame(&channel).is_some());
		assert!(Dialect::for_platform(Platform::Trovo).join_frame(&channel).is_none());
	}
}
