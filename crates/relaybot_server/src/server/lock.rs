#![forbid(unsafe_code)]

//! TTL-bounded per-channel send locks.
//!
//! Exactly one in-flight send per channel; a holder that never releases
//! (crash, stuck task) loses the lock once the TTL passes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use relaybot_domain::ChannelId;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Holder {
	acquired_at: Instant,
}

/// Process-wide channel lock table, safe under concurrent outbox workers.
#[derive(Debug)]
pub struct ChannelLocks {
	ttl: Duration,
	held: Mutex<HashMap<ChannelId, Holder>>,
}

impl ChannelLocks {
	pub fn new(ttl: Duration) -> Self {
		Self {
			ttl,
			held: Mutex::new(HashMap::new()),
		}
	}

	/// Try to acquire the lock for `channel`.
	///
	/// An expired holder is reclaimed. Returns `None` when the lock is held;
	/// callers defer the message rather than blocking.
	pub fn try_acquire(&self, channel: ChannelId) -> Option<ChannelLockGuard<'_>> {
		let now = Instant::now();
		let mut held = self.held.lock().expect("channel lock table poisoned");

		if let Some(holder) = held.get(&channel)
			&& now.duration_since(holder.acquired_at) < self.ttl
		{
			return None;
		}

		held.insert(channel, Holder { acquired_at: now });
		Some(ChannelLockGuard {
			locks: self,
			channel,
			acquired_at: now,
		})
	}
}

/// RAII guard; the lock is released unconditionally on drop.
#[derive(Debug)]
pub struct ChannelLockGuard<'a> {
	locks: &'a ChannelLocks,
	channel: ChannelId,
	acquired_at: Instant,
}

impl Drop for ChannelLockGuard<'_> {
	fn drop(&mut self) {
		let mut held = self.locks.held.lock().expect("channel lock table poisoned");
		// Only release our own acquisition; an expired-and-stolen lock now
		// belongs to the stealer.
		if let Some(holder) = held.get(&self.channel)
			&& holder.acquired_at == self.acquired_at
		{
			held.remove(&self.channel);
		}
	}
}
