#![forbid(unsafe_code)]

//! Sliding-window send rate limiting, global and per channel.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use relaybot_domain::ChannelId;
use tokio::time::Instant;

/// One window's limits; `max == 0` disables the scope.
#[derive(Debug, Clone, Copy)]
pub struct WindowConfig {
	pub max: u32,
	pub window: Duration,
}

impl WindowConfig {
	pub fn disabled() -> Self {
		Self {
			max: 0,
			window: Duration::from_secs(0),
		}
	}

	fn enabled(&self) -> bool {
		self.max > 0 && !self.window.is_zero()
	}
}

#[derive(Debug, Default)]
struct SlidingWindow {
	events: VecDeque<Instant>,
}

impl SlidingWindow {
	fn prune(&mut self, now: Instant, window: Duration) {
		while let Some(oldest) = self.events.front() {
			if now.duration_since(*oldest) >= window {
				self.events.pop_front();
			} else {
				break;
			}
		}
	}

	fn saturated(&mut self, now: Instant, cfg: WindowConfig) -> bool {
		self.prune(now, cfg.window);
		self.events.len() >= cfg.max as usize
	}

	fn record(&mut self, now: Instant) {
		self.events.push_back(now);
	}
}

/// Bound on tracked per-channel windows before the map is flushed.
const MAX_TRACKED_CHANNELS: usize = 4096;

/// Send rate limiter: a global window plus one window per channel.
#[derive(Debug)]
pub struct SendRateLimiter {
	global_cfg: WindowConfig,
	channel_cfg: WindowConfig,
	global: SlidingWindow,
	per_channel: HashMap<ChannelId, SlidingWindow>,
}

impl SendRateLimiter {
	pub fn new(global_cfg: WindowConfig, channel_cfg: WindowConfig) -> Self {
		Self {
			global_cfg,
			channel_cfg,
			global: SlidingWindow::default(),
			per_channel: HashMap::new(),
		}
	}

	/// Admit one send for `channel` and record it in both windows, or reject
	/// without recording anything when either window is saturated.
	pub fn try_acquire(&mut self, channel: ChannelId) -> bool {
		let now = Instant::now();

		if self.global_cfg.enabled() && self.global.saturated(now, self.global_cfg) {
			metrics::counter!("relaybot_rate_limit_global_rejections_total").increment(1);
			return false;
		}

		if self.channel_cfg.enabled() {
			if self.per_channel.len() >= MAX_TRACKED_CHANNELS && !self.per_channel.contains_key(&channel) {
				self.per_channel.clear();
			}
			let window = self.per_channel.entry(channel).or_default();
			if window.saturated(now, self.channel_cfg) {
				metrics::counter!("relaybot_rate_limit_channel_rejections_total").increment(1);
				return false;
			}
			window.record(now);
		}

		if self.global_cfg.enabled() {
			self.global.record(now);
		}

		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cfg(max: u32, secs: u64) -> WindowConfig {
		WindowConfig {
			max,
			window: Duration::from_secs(secs),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn per_channel_window_admits_exactly_max() {
		let mut limiter = SendRateLimiter::new(WindowConfig::disabled(), cfg(3, 10));
		let c1 = ChannelId(1);

		assert!(limiter.try_acquire(c1));
		assert!(limiter.try_acquire(c1));
		assert!(limiter.try_acquire(c1));
		assert!(!limiter.try_acquire(c1));

		// Another channel is unaffected.
		assert!(limiter.try_acquire(ChannelId(2)));

		// After the window passes, the channel is admitted again.
		tokio::time::advance(Duration::from_secs(10)).await;
		assert!(limiter.try_acquire(c1));
	}

	#[tokio::test(start_paused = true)]
	async fn global_window_spans_channels() {
		let mut limiter = SendRateLimiter::new(cfg(2, 10), WindowConfig::disabled());

		assert!(limiter.try_acquire(ChannelId(1)));
		assert!(limiter.try_acquire(ChannelId(2)));
		assert!(!limiter.try_acquire(ChannelId(3)));

		tokio::time::advance(Duration::from_secs(10)).await;
		assert!(limiter.try_acquire(ChannelId(3)));
	}

	#[tokio::test(start_paused = true)]
	async fn rejection_records_nothing() {
		let mut limiter = SendRateLimiter::new(cfg(2, 10), cfg(1, 10));
		let c1 = ChannelId(1);

		assert!(limiter.try_acquire(c1));
		// Channel window saturated; the global window must not tick.
		assert!(!limiter.try_acquire(c1));
		// One global slot remains for another channel.
		assert!(limiter.try_acquire(ChannelId(2)));
		assert!(!limiter.try_acquire(ChannelId(3)));
	}

	#[tokio::test(start_paused = true)]
	async fn disabled_scopes_admit_everything() {
		let mut limiter = SendRateLimiter::new(WindowConfig::disabled(), WindowConfig::disabled());
		for i in 0..100 {
			assert!(limiter.try_acquire(ChannelId(i)));
		}
	}
}
