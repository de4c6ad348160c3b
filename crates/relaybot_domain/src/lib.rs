#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported streaming platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
	Twitch,
	YouTube,
	Trovo,
	Kick,
	VkVideo,
}

impl Platform {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Platform::Twitch => "twitch",
			Platform::YouTube => "youtube",
			Platform::Trovo => "trovo",
			Platform::Kick => "kick",
			Platform::VkVideo => "vk_video",
		}
	}

	/// All platforms, in a stable order.
	pub const ALL: [Platform; 5] = [
		Platform::Twitch,
		Platform::YouTube,
		Platform::Trovo,
		Platform::Kick,
		Platform::VkVideo,
	];
}

impl fmt::Display for Platform {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown platform: {0}")]
	UnknownPlatform(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

impl FromStr for Platform {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"twitch" => Ok(Platform::Twitch),
			"youtube" | "you_tube" | "yt" => Ok(Platform::YouTube),
			"trovo" => Ok(Platform::Trovo),
			"kick" => Ok(Platform::Kick),
			"vk_video" | "vkvideo" | "vk" => Ok(Platform::VkVideo),
			other => Err(ParseIdError::UnknownPlatform(other.to_string())),
		}
	}
}

/// Internal channel identifier (data-store primary key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub i64);

impl ChannelId {
	pub fn as_i64(self) -> i64 {
		self.0
	}
}

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Owning user identifier (data-store primary key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Platform-native channel identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformChannelId(String);

impl PlatformChannelId {
	/// Create a non-empty `PlatformChannelId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for PlatformChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for PlatformChannelId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		PlatformChannelId::new(s.to_string())
	}
}

/// Public channel slug (login/handle shown in URLs).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelSlug(String);

impl ChannelSlug {
	/// Create a non-empty `ChannelSlug`.
	pub fn new(slug: impl Into<String>) -> Result<Self, ParseIdError> {
		let slug = slug.into();
		if slug.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(slug))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ChannelSlug {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelSlug {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelSlug::new(s.to_string())
	}
}

/// External bot account identifier (the OAuth account the bot speaks as).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BotAccountId(String);

impl BotAccountId {
	/// Create a non-empty `BotAccountId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for BotAccountId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Unique channel key: `(platform, platform_channel_id)`.
///
/// Two subscriptions never share a key; a session's key changing forces a
/// disconnect because the old connection now points at the wrong channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
	pub platform: Platform,
	pub platform_channel_id: PlatformChannelId,
}

impl ChannelKey {
	pub fn new(platform: Platform, platform_channel_id: PlatformChannelId) -> Self {
		Self {
			platform,
			platform_channel_id,
		}
	}

	/// Parse a `platform:channel_id` string.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let (platform_s, id_s) = s
			.split_once(':')
			.ok_or_else(|| ParseIdError::InvalidFormat("expected platform:channel_id".into()))?;

		let platform = Platform::from_str(platform_s)?;
		let platform_channel_id = PlatformChannelId::new(id_s.to_string())?;
		Ok(Self::new(platform, platform_channel_id))
	}
}

impl fmt::Display for ChannelKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.platform, self.platform_channel_id)
	}
}

impl FromStr for ChannelKey {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelKey::parse(s)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn platform_parse_and_display() {
		assert_eq!("twitch".parse::<Platform>().unwrap(), Platform::Twitch);
		assert_eq!("YT".parse::<Platform>().unwrap(), Platform::YouTube);
		assert_eq!("vk".parse::<Platform>().unwrap(), Platform::VkVideo);
		assert_eq!(Platform::Trovo.to_string(), "trovo");
		assert_eq!(Platform::VkVideo.to_string(), "vk_video");
	}

	#[test]
	fn channel_key_parse_roundtrip() {
		let key = ChannelKey::parse("trovo:109483021").unwrap();
		assert_eq!(key.platform, Platform::Trovo);
		assert_eq!(key.platform_channel_id.as_str(), "109483021");
		assert_eq!(key.to_string(), "trovo:109483021");
	}

	#[test]
	fn rejects_empty_ids() {
		assert!(PlatformChannelId::new("").is_err());
		assert!(ChannelSlug::new("   ").is_err());
		assert!(BotAccountId::new("").is_err());
		assert!("".parse::<ChannelKey>().is_err());
		assert!("twitch:".parse::<ChannelKey>().is_err());
	}

	#[test]
	fn unknown_platform_is_an_error() {
		assert!(matches!(
			"mixer".parse::<Platform>(),
			Err(ParseIdError::UnknownPlatform(_))
		));
	}
}
