#![forbid(unsafe_code)]

//! Time-windowed duplicate suppression for outbound sends.

use std::collections::HashMap;
use std::time::Duration;

use relaybot_domain::ChannelId;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// Prune the seen-set when it grows past this many keys.
const PRUNE_THRESHOLD: usize = 8192;

/// Dedup key over channel plus normalized message text.
pub fn dedup_key(channel: ChannelId, text: &str) -> String {
	let normalized = text.trim().to_lowercase();
	let mut hasher = Sha256::new();
	hasher.update(channel.as_i64().to_be_bytes());
	hasher.update(b"\n");
	hasher.update(normalized.as_bytes());
	let digest = hasher.finalize();
	let mut out = String::with_capacity(digest.len() * 2);
	for byte in digest {
		out.push_str(&format!("{byte:02x}"));
	}
	out
}

/// Seen-set of recently sent (channel, text) keys.
///
/// Recording happens only after a real platform send; a deferred message must
/// not poison its own retry.
#[derive(Debug)]
pub struct DedupSet {
	window: Duration,
	seen: HashMap<String, Instant>,
}

impl DedupSet {
	pub fn new(window: Duration) -> Self {
		Self {
			window,
			seen: HashMap::new(),
		}
	}

	fn enabled(&self) -> bool {
		!self.window.is_zero()
	}

	/// Whether `key` was sent within the dedup window.
	pub fn is_duplicate(&mut self, key: &str) -> bool {
		if !self.enabled() {
			return false;
		}
		let now = Instant::now();
		match self.seen.get(key) {
			Some(at) if now.duration_since(*at) < self.window => true,
			Some(_) => {
				self.seen.remove(key);
				false
			}
			None => false,
		}
	}

	/// Record a completed send.
	pub fn record(&mut self, key: String) {
		if !self.enabled() {
			return;
		}
		let now = Instant::now();
		if self.seen.len() >= PRUNE_THRESHOLD {
			let window = self.window;
			self.seen.retain(|_, at| now.duration_since(*at) < window);
		}
		self.seen.insert(key, now);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn key_normalizes_text_and_scopes_by_channel() {
		let a = dedup_key(ChannelId(1), "Hello World");
		let b = dedup_key(ChannelId(1), "  hello world \n");
		let c = dedup_key(ChannelId(2), "Hello World");
		assert_eq!(a, b);
		assert_ne!(a, c);
	}

	#[tokio::test(start_paused = true)]
	async fn duplicate_within_window_is_detected() {
		let mut set = DedupSet::new(Duration::from_secs(30));
		let key = dedup_key(ChannelId(1), "!hello");

		assert!(!set.is_duplicate(&key));
		set.record(key.clone());
		assert!(set.is_duplicate(&key));

		tokio::time::advance(Duration::from_secs(31)).await;
		assert!(!set.is_duplicate(&key));
	}

	#[tokio::test(start_paused = true)]
	async fn zero_window_disables_dedup() {
		let mut set = DedupSet::new(Duration::from_secs(0));
		let key = dedup_key(ChannelId(1), "!hello");
		set.record(key.clone());
		assert!(!set.is_duplicate(&key));
	}
}
