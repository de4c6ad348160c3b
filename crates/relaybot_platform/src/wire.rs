#![forbid(unsafe_code)]

//! JSON frame vocabulary shared by the platform chat sockets.
//!
//! Every platform speaks frames of the shape `{"type": "...", "nonce": ...,
//! "data": {...}}`; the dialect modules only vary endpoints, auth payload
//! extras and the reserved chat-item type values.

use anyhow::Context;
use serde::{Deserialize, Deserializer};
use serde_json::json;

use crate::LifecycleSignal;

/// Reserved chat-item type: ordinary conversational message.
pub const CHAT_TYPE_MESSAGE: u32 = 0;

/// Reserved chat-item type: stream lifecycle event (content holds free text).
pub const CHAT_TYPE_LIFECYCLE: u32 = 5012;

/// Reserved chat-item type: spell / channel-points style redemption.
pub const CHAT_TYPE_SPELL: u32 = 5005;

/// Reserved chat-item type: gifted subscription.
pub const CHAT_TYPE_GIFT_SUB: u32 = 5007;

/// Floor for server-advertised keepalive interval hints.
pub const MIN_KEEPALIVE_SECS: u64 = 5;

#[derive(Debug, Deserialize)]
struct RawFrame {
	#[serde(rename = "type")]
	kind: String,

	#[serde(default)]
	nonce: Option<String>,

	#[serde(default)]
	error: Option<String>,

	#[serde(default)]
	data: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseData {
	#[serde(default)]
	ok: Option<bool>,

	#[serde(default)]
	error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PongData {
	/// Next keepalive interval hint, seconds.
	#[serde(default)]
	gap: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatData {
	#[serde(default)]
	chats: Vec<ChatItem>,
}

/// One inbound chat item.
///
/// `uid` arrives as a number on some platforms and a string on others.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatItem {
	#[serde(rename = "type", default)]
	pub kind: u32,

	#[serde(default)]
	pub content: String,

	#[serde(default, deserialize_with = "string_or_number")]
	pub uid: String,

	#[serde(default)]
	pub user_name: String,

	#[serde(default)]
	pub nick_name: String,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
	D: Deserializer<'de>,
{
	#[derive(Deserialize)]
	#[serde(untagged)]
	enum StringOrNumber {
		S(String),
		N(serde_json::Number),
	}

	Ok(match StringOrNumber::deserialize(deserializer)? {
		StringOrNumber::S(s) => s,
		StringOrNumber::N(n) => n.to_string(),
	})
}

/// Decoded inbound frame.
#[derive(Debug, Clone)]
pub enum Frame {
	Response {
		nonce: Option<String>,
		ok: bool,
		error: Option<String>,
	},
	Ping,
	Pong {
		gap_seconds: Option<u64>,
	},
	Chat {
		chats: Vec<ChatItem>,
	},
	/// Frame types this runtime does not consume.
	Other(String),
}

/// Decode one inbound text frame.
pub fn decode(raw: &str) -> anyhow::Result<Frame> {
	let frame: RawFrame = serde_json::from_str(raw).context("parse frame json")?;

	match frame.kind.as_str() {
		"RESPONSE" => {
			let data: ResponseData = match frame.data {
				Some(v) => serde_json::from_value(v).context("parse RESPONSE data")?,
				None => ResponseData::default(),
			};
			let error = frame.error.or(data.error);
			let ok = data.ok.unwrap_or(error.is_none()) && error.is_none();
			Ok(Frame::Response {
				nonce: frame.nonce,
				ok,
				error,
			})
		}
		"PING" => Ok(Frame::Ping),
		"PONG" => {
			let data: PongData = match frame.data {
				Some(v) => serde_json::from_value(v).context("parse PONG data")?,
				None => PongData::default(),
			};
			Ok(Frame::Pong { gap_seconds: data.gap })
		}
		"CHAT" => {
			let data: ChatData = match frame.data {
				Some(v) => serde_json::from_value(v).context("parse CHAT data")?,
				None => ChatData::default(),
			};
			Ok(Frame::Chat { chats: data.chats })
		}
		other => Ok(Frame::Other(other.to_string())),
	}
}

/// Encode the AUTH handshake frame.
///
/// `channel` is included for dialects whose tokens are not channel-scoped.
pub fn encode_auth(nonce: &str, token: &str, channel: Option<&str>) -> String {
	let data = match channel {
		Some(channel) => json!({ "token": token, "channel_id": channel }),
		None => json!({ "token": token }),
	};
	json!({ "type": "AUTH", "nonce": nonce, "data": data }).to_string()
}

/// Encode a keepalive probe.
pub fn encode_ping(nonce: &str) -> String {
	json!({ "type": "PING", "nonce": nonce }).to_string()
}

/// Encode the reply to an unsolicited server PING.
pub fn encode_pong() -> String {
	json!({ "type": "PONG" }).to_string()
}

/// Encode a post-auth channel JOIN.
pub fn encode_join(channel: &str) -> String {
	json!({ "type": "JOIN", "data": { "channel_id": channel } }).to_string()
}

/// Encode one outbound chat line.
pub fn encode_chat_send(channel: &str, text: &str) -> String {
	json!({ "type": "CHAT", "data": { "channel_id": channel, "content": text } }).to_string()
}

/// Classify a lifecycle chat item's free text as online/offline.
///
/// Keyword substring matching, deliberately kept as loose as the upstream
/// platforms' wording requires.
pub fn classify_lifecycle(content: &str) -> Option<LifecycleSignal> {
	let content = content.to_ascii_lowercase();

	const OFFLINE_KEYWORDS: [&str; 3] = ["offline", "stop", "end"];
	const ONLINE_KEYWORDS: [&str; 3] = ["online", "start", "live"];

	if OFFLINE_KEYWORDS.iter().any(|k| content.contains(k)) {
		return Some(LifecycleSignal::Offline);
	}
	if ONLINE_KEYWORDS.iter().any(|k| content.contains(k)) {
		return Some(LifecycleSignal::Online);
	}
	None
}
