#![forbid(unsafe_code)]

//! Stream-duration tracking fed by lifecycle signals.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use relaybot_domain::ChannelId;
use relaybot_platform::LifecycleSignal;
use tokio::time::Instant;
use tracing::info;

#[derive(Debug, Default)]
struct Inner {
	live_since: HashMap<ChannelId, Instant>,
	last_duration: HashMap<ChannelId, Duration>,
}

/// Records online/offline transitions and exposes per-channel live state.
#[derive(Debug, Default)]
pub struct StreamDurationTracker {
	inner: Mutex<Inner>,
}

impl StreamDurationTracker {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn record(&self, channel: ChannelId, signal: LifecycleSignal) {
		let mut inner = self.inner.lock().expect("stream tracker poisoned");
		match signal {
			LifecycleSignal::Online => {
				// Repeated online signals keep the original start time.
				if !inner.live_since.contains_key(&channel) {
					inner.live_since.insert(channel, Instant::now());
					info!(channel = %channel, "stream online");
					metrics::gauge!("relaybot_live_channels").increment(1.0);
				}
			}
			LifecycleSignal::Offline => {
				if let Some(started) = inner.live_since.remove(&channel) {
					let duration = started.elapsed();
					info!(channel = %channel, duration_secs = duration.as_secs(), "stream offline");
					inner.last_duration.insert(channel, duration);
					metrics::gauge!("relaybot_live_channels").decrement(1.0);
				}
			}
		}
	}

	pub fn is_live(&self, channel: ChannelId) -> bool {
		self.inner
			.lock()
			.expect("stream tracker poisoned")
			.live_since
			.contains_key(&channel)
	}

	/// Duration of the last completed stream, if one finished.
	#[allow(dead_code)]
	pub fn last_duration(&self, channel: ChannelId) -> Option<Duration> {
		self.inner
			.lock()
			.expect("stream tracker poisoned")
			.last_duration
			.get(&channel)
			.copied()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn tracks_live_state_and_duration() {
		let tracker = StreamDurationTracker::new();
		let c1 = ChannelId(1);

		assert!(!tracker.is_live(c1));

		tracker.record(c1, LifecycleSignal::Online);
		assert!(tracker.is_live(c1));

		tokio::time::advance(Duration::from_secs(90)).await;
		tracker.record(c1, LifecycleSignal::Offline);

		assert!(!tracker.is_live(c1));
		assert_eq!(tracker.last_duration(c1), Some(Duration::from_secs(90)));
	}

	#[tokio::test(start_paused = true)]
	async fn repeated_online_keeps_original_start() {
		let tracker = StreamDurationTracker::new();
		let c1 = ChannelId(1);

		tracker.record(c1, LifecycleSignal::Online);
		tokio::time::advance(Duration::from_secs(60)).await;
		tracker.record(c1, LifecycleSignal::Online);
		tokio::time::advance(Duration::from_secs(30)).await;
		tracker.record(c1, LifecycleSignal::Offline);

		assert_eq!(tracker.last_duration(c1), Some(Duration::from_secs(90)));
	}

	#[test]
	fn offline_without_online_is_ignored() {
		let tracker = StreamDurationTracker::new();
		tracker.record(ChannelId(1), LifecycleSignal::Offline);
		assert!(tracker.last_duration(ChannelId(1)).is_none());
	}
}
