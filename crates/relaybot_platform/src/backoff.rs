#![forbid(unsafe_code)]

use std::time::Duration;

/// Exponential reconnect backoff, owned by one channel session.
///
/// Each session carries its own state so one flapping channel never throttles
/// reconnects for the others.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
	base: Duration,
	max: Duration,
	current: Duration,
}

impl ReconnectBackoff {
	pub fn new(base: Duration, max: Duration) -> Self {
		let max = max.max(base);
		Self { base, max, current: base }
	}

	/// Delay to wait before the next connection attempt.
	///
	/// Grows multiplicatively up to the configured maximum.
	pub fn next_delay(&mut self) -> Duration {
		let delay = self.current;
		let doubled = self.current.checked_mul(2).unwrap_or(self.max);
		self.current = doubled.min(self.max);
		delay
	}

	/// Restore the base delay after a successful connect.
	pub fn reset(&mut self) {
		self.current = self.base;
	}

	pub fn base(&self) -> Duration {
		self.base
	}

	pub fn max(&self) -> Duration {
		self.max
	}
}

impl Default for ReconnectBackoff {
	fn default() -> Self {
		Self::new(Duration::from_millis(500), Duration::from_secs(30))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn grows_and_caps() {
		let mut b = ReconnectBackoff::new(Duration::from_millis(500), Duration::from_secs(4));

		let mut delays = Vec::new();
		for _ in 0..6 {
			delays.push(b.next_delay());
		}

		assert_eq!(delays[0], Duration::from_millis(500));
		assert_eq!(delays[1], Duration::from_secs(1));
		assert_eq!(delays[2], Duration::from_secs(2));
		assert_eq!(delays[3], Duration::from_secs(4));
		assert_eq!(delays[4], Duration::from_secs(4));
		assert_eq!(delays[5], Duration::from_secs(4));

		for pair in delays.windows(2) {
			assert!(pair[0] <= pair[1], "delays must be non-decreasing");
		}
	}

	#[test]
	fn reset_restores_base() {
		let mut b = ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(30));
		let _ = b.next_delay();
		let _ = b.next_delay();
		b.reset();
		assert_eq!(b.next_delay(), Duration::from_secs(1));
	}

	#[test]
	fn max_below_base_is_clamped() {
		let mut b = ReconnectBackoff::new(Duration::from_secs(5), Duration::from_secs(1));
		assert_eq!(b.next_delay(), Duration::from_secs(5));
		assert_eq!(b.next_delay(), Duration::from_secs(5));
	}
}
