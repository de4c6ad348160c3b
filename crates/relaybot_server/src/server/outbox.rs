#![forbid(unsafe_code)]

//! Outbox dispatcher: turns pending outbox rows into platform sends under
//! dedup, rate-limit and per-channel lock guards.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use relaybot_store::{BotRepository, OutboxMessage};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::server::dedup::{DedupSet, dedup_key};
use crate::server::lock::ChannelLocks;
use crate::server::rate_limit::SendRateLimiter;
use crate::server::state::ChannelStateStore;

/// Delivery mode, selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxMode {
	/// Fixed-interval loop claiming batches.
	Polling,
	/// Bounded pool of workers each claiming one message at a time.
	QueueWorkers,
}

#[derive(Debug, Clone)]
pub struct OutboxConfig {
	pub mode: OutboxMode,
	pub poll_interval: Duration,
	pub batch_size: i64,
	pub concurrency: usize,
	pub max_attempts: i32,
	/// Worker sleep when the queue is empty.
	pub idle_delay: Duration,
	/// Worker sleep after a deferred delivery (lock busy, rate limited),
	/// so a blocked head-of-queue message cannot spin a worker hot.
	pub lock_retry_delay: Duration,
}

impl Default for OutboxConfig {
	fn default() -> Self {
		Self {
			mode: OutboxMode::Polling,
			poll_interval: Duration::from_millis(500),
			batch_size: 32,
			concurrency: 4,
			max_attempts: 5,
			idle_delay: Duration::from_millis(500),
			lock_retry_delay: Duration::from_millis(250),
		}
	}
}

/// The three process-wide send guards.
///
/// Rate and dedup state sit behind plain mutexes (never held across awaits);
/// the lock table is itself safe under concurrent acquisition.
pub struct SendGuards {
	pub rate: Mutex<SendRateLimiter>,
	pub dedup: Mutex<DedupSet>,
	pub locks: ChannelLocks,
}

impl SendGuards {
	pub fn new(rate: SendRateLimiter, dedup: DedupSet, locks: ChannelLocks) -> Self {
		Self {
			rate: Mutex::new(rate),
			dedup: Mutex::new(dedup),
			locks,
		}
	}
}

/// Why a message was left pending for a later pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
	RateLimited,
	LockBusy,
	NotConnected,
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
	/// Sent to the platform and marked sent.
	Sent,
	/// Empty text; dropped silently (marked sent, never retried).
	DroppedEmpty,
	/// Suppressed by the dedup window; marked sent without sending.
	Deduplicated,
	/// Left pending; no work lost.
	Deferred(DeferReason),
	/// Send failed; attempt recorded, still pending.
	FailedRetryable,
	/// Send failed and the retry budget is exhausted; marked failed.
	FailedTerminal,
}

pub struct OutboxDispatcher {
	repo: Arc<dyn BotRepository>,
	store: Arc<ChannelStateStore>,
	guards: Arc<SendGuards>,
	cfg: OutboxConfig,
}

impl OutboxDispatcher {
	pub fn new(
		repo: Arc<dyn BotRepository>,
		store: Arc<ChannelStateStore>,
		guards: Arc<SendGuards>,
		cfg: OutboxConfig,
	) -> Self {
		Self {
			repo,
			store,
			guards,
			cfg,
		}
	}

	/// Claim one batch and attempt delivery for each message.
	///
	/// Returns the number of messages actually sent to a platform.
	pub async fn process_outbox_once(&self) -> usize {
		let batch = match self.repo.claim_outbox_batch(self.cfg.batch_size).await {
			Ok(batch) => batch,
			Err(e) => {
				warn!(error = %e, "outbox claim failed");
				metrics::counter!("relaybot_outbox_claim_errors_total").increment(1);
				return 0;
			}
		};

		let mut sent = 0;
		for msg in &batch {
			if matches!(self.deliver(msg).await, DeliveryOutcome::Sent) {
				sent += 1;
			}
		}

		if sent > 0 {
			debug!(sent, claimed = batch.len(), "outbox pass delivered messages");
		}
		sent
	}

	/// One delivery attempt, guards in order: dedup, rate limit, channel
	/// lock, live connection, send.
	pub async fn deliver(&self, msg: &OutboxMessage) -> DeliveryOutcome {
		let text = msg.text.trim();
		if text.is_empty() {
			self.mark_sent(msg.id).await;
			metrics::counter!("relaybot_outbox_dropped_empty_total").increment(1);
			return DeliveryOutcome::DroppedEmpty;
		}

		// Duplicate enqueues from retried upstream triggers, and the
		// worker-mode race where two workers claim the same row, both land
		// here: whoever sends first records the key, the other suppresses.
		let key = dedup_key(msg.channel_id, text);
		if self.guards.dedup.lock().expect("dedup set poisoned").is_duplicate(&key) {
			debug!(message = msg.id, channel = %msg.channel_id, "duplicate within dedup window; marking sent");
			self.mark_sent(msg.id).await;
			metrics::counter!("relaybot_outbox_deduplicated_total").increment(1);
			return DeliveryOutcome::Deduplicated;
		}

		if !self
			.guards
			.rate
			.lock()
			.expect("rate limiter poisoned")
			.try_acquire(msg.channel_id)
		{
			metrics::counter!("relaybot_outbox_deferred_total", "reason" => "rate_limited").increment(1);
			return DeliveryOutcome::Deferred(DeferReason::RateLimited);
		}

		// Deferring on contention keeps the dispatcher from blocking; the
		// message stays pending.
		let Some(_lock) = self.guards.locks.try_acquire(msg.channel_id) else {
			metrics::counter!("relaybot_outbox_deferred_total", "reason" => "lock_busy").increment(1);
			return DeliveryOutcome::Deferred(DeferReason::LockBusy);
		};

		// A channel missing from the store may simply not have finished
		// (re)connecting yet.
		let Some(handle) = self.store.handle_for(msg.channel_id).await else {
			metrics::counter!("relaybot_outbox_deferred_total", "reason" => "not_connected").increment(1);
			return DeliveryOutcome::Deferred(DeferReason::NotConnected);
		};
		if !handle.is_connected() {
			metrics::counter!("relaybot_outbox_deferred_total", "reason" => "not_connected").increment(1);
			return DeliveryOutcome::Deferred(DeferReason::NotConnected);
		}

		match handle.send_chat(text).await {
			Ok(()) => {
				self.guards.dedup.lock().expect("dedup set poisoned").record(key);
				self.mark_sent(msg.id).await;
				metrics::counter!("relaybot_outbox_sent_total").increment(1);
				DeliveryOutcome::Sent
			}
			Err(e) => {
				warn!(message = msg.id, channel = %msg.channel_id, error = %e, "outbox send failed");
				metrics::counter!("relaybot_outbox_send_errors_total").increment(1);

				let attempts = match self.repo.record_outbox_failure(msg.id).await {
					Ok(attempts) => attempts,
					Err(store_err) => {
						warn!(message = msg.id, error = %store_err, "failed to record outbox attempt");
						return DeliveryOutcome::FailedRetryable;
					}
				};

				if attempts >= self.cfg.max_attempts {
					warn!(message = msg.id, attempts, "outbox message exhausted retries; marking failed");
					if let Err(store_err) = self.repo.mark_outbox_failed(msg.id).await {
						warn!(message = msg.id, error = %store_err, "failed to mark outbox message failed");
					}
					metrics::counter!("relaybot_outbox_failed_total").increment(1);
					DeliveryOutcome::FailedTerminal
				} else {
					DeliveryOutcome::FailedRetryable
				}
			}
		}
	}

	async fn mark_sent(&self, id: i64) {
		if let Err(e) = self.repo.mark_outbox_sent(id).await {
			warn!(message = id, error = %e, "failed to mark outbox message sent");
		}
	}

	/// Spawn delivery tasks for the configured mode.
	pub fn spawn(self: &Arc<Self>, stop_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
		match self.cfg.mode {
			OutboxMode::Polling => vec![self.spawn_polling(stop_rx)],
			OutboxMode::QueueWorkers => {
				let workers = self.cfg.concurrency.max(1);
				(0..workers).map(|i| self.spawn_worker(i, stop_rx.clone())).collect()
			}
		}
	}

	fn spawn_polling(self: &Arc<Self>, mut stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
		let dispatcher = Arc::clone(self);
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(dispatcher.cfg.poll_interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

			loop {
				tokio::select! {
					_ = ticker.tick() => {
						if *stop_rx.borrow() {
							break;
						}
						let _ = dispatcher.process_outbox_once().await;
					}
					changed = stop_rx.changed() => {
						if changed.is_err() || *stop_rx.borrow() {
							break;
						}
					}
				}
			}
		})
	}

	fn spawn_worker(self: &Arc<Self>, worker: usize, mut stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
		let dispatcher = Arc::clone(self);
		tokio::spawn(async move {
			loop {
				if *stop_rx.borrow() {
					break;
				}

				let claimed = match dispatcher.repo.claim_outbox_one().await {
					Ok(claimed) => claimed,
					Err(e) => {
						warn!(worker, error = %e, "outbox worker claim failed");
						None
					}
				};

				match claimed {
					Some(msg) => {
						let outcome = dispatcher.deliver(&msg).await;
						if matches!(outcome, DeliveryOutcome::Deferred(_)) {
							tokio::select! {
								_ = tokio::time::sleep(dispatcher.cfg.lock_retry_delay) => {}
								changed = stop_rx.changed() => {
									if changed.is_err() || *stop_rx.borrow() {
										break;
									}
								}
							}
						}
					}
					None => {
						tokio::select! {
							_ = tokio::time::sleep(dispatcher.cfg.idle_delay) => {}
							changed = stop_rx.changed() => {
								if changed.is_err() || *stop_rx.borrow() {
									break;
								}
							}
						}
					}
				}
			}
		})
	}
}
