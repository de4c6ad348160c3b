#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use relaybot_domain::{ChannelId, ChannelSlug, Platform, PlatformChannelId, UserId};
use relaybot_platform::{SessionError, connection_wiring};
use relaybot_store::{BotRepository, MemoryRepository, NewOutboxMessage, OutboxStatus, Subscription};

use crate::server::dedup::DedupSet;
use crate::server::lock::ChannelLocks;
use crate::server::outbox::{
	DeferReason, DeliveryOutcome, OutboxConfig, OutboxDispatcher, OutboxMode, SendGuards,
};
use crate::server::rate_limit::{SendRateLimiter, WindowConfig};
use crate::server::state::{ChannelSession, ChannelStateStore};

fn subscription(channel: i64) -> Subscription {
	Subscription {
		channel_id: ChannelId(channel),
		user_id: UserId(channel * 10),
		platform: Platform::Trovo,
		platform_channel_id: PlatformChannelId::new(format!("p{channel}")).expect("platform channel id"),
		slug: ChannelSlug::new(format!("slug{channel}")).expect("slug"),
	}
}

struct Fixture {
	repo: Arc<MemoryRepository>,
	store: Arc<ChannelStateStore>,
	guards: Arc<SendGuards>,
}

impl Fixture {
	fn new(channel_max: u32, dedup_window: Duration) -> Self {
		Self {
			repo: Arc::new(MemoryRepository::new()),
			store: Arc::new(ChannelStateStore::new()),
			guards: Arc::new(SendGuards::new(
				SendRateLimiter::new(
					WindowConfig::disabled(),
					WindowConfig {
						max: channel_max,
						window: Duration::from_secs(10),
					},
				),
				DedupSet::new(dedup_window),
				ChannelLocks::new(Duration::from_secs(10)),
			)),
		}
	}

	fn dispatcher(&self, max_attempts: i32) -> OutboxDispatcher {
		OutboxDispatcher::new(
			Arc::clone(&self.repo) as Arc<dyn BotRepository>,
			Arc::clone(&self.store),
			Arc::clone(&self.guards),
			OutboxConfig {
				max_attempts,
				..OutboxConfig::default()
			},
		)
	}

	/// Install a session whose connection acks every send; returns the
	/// platform-send counter.
	async fn connected_session(&self, channel: i64) -> Arc<AtomicUsize> {
		let sub = subscription(channel);
		self.store.insert(ChannelSession::from_subscription(&sub, None)).await;

		let (handle, mut send_rx, connected_tx) = connection_wiring(16);
		let _ = connected_tx.send(true);

		let sent = Arc::new(AtomicUsize::new(0));
		let sent_clone = Arc::clone(&sent);
		tokio::spawn(async move {
			// Keep the watch sender alive for the session's lifetime.
			let _connected_tx = connected_tx;
			while let Some(req) = send_rx.recv().await {
				sent_clone.fetch_add(1, Ordering::SeqCst);
				let _ = req.resp.send(Ok(()));
			}
		});

		self.store.set_handle(sub.channel_id, handle).await;
		sent
	}

	/// Install a session whose connection rejects every send.
	async fn failing_session(&self, channel: i64) {
		let sub = subscription(channel);
		self.store.insert(ChannelSession::from_subscription(&sub, None)).await;

		let (handle, mut send_rx, connected_tx) = connection_wiring(16);
		let _ = connected_tx.send(true);

		tokio::spawn(async move {
			let _connected_tx = connected_tx;
			while let Some(req) = send_rx.recv().await {
				let _ = req.resp.send(Err(SessionError::Transport("boom".to_string())));
			}
		});

		self.store.set_handle(sub.channel_id, handle).await;
	}

	async fn enqueue(&self, channel: i64, text: &str) -> i64 {
		self.repo
			.enqueue_outbox(NewOutboxMessage {
				channel_id: ChannelId(channel),
				target_login: format!("slug{channel}"),
				text: text.to_string(),
			})
			.await
			.expect("enqueue")
	}
}

#[tokio::test]
async fn identical_text_within_dedup_window_sends_once() {
	let fx = Fixture::new(10, Duration::from_secs(30));
	let sent = fx.connected_session(1).await;
	let dispatcher = fx.dispatcher(5);

	fx.enqueue(1, "gg wp").await;
	fx.enqueue(1, "GG WP  ").await;

	let delivered = dispatcher.process_outbox_once().await;
	assert_eq!(delivered, 1, "exactly one platform send");
	assert_eq!(sent.load(Ordering::SeqCst), 1);

	// Both rows are finished: one sent, one sent-without-sending.
	assert_eq!(fx.repo.outbox_with_status(OutboxStatus::Sent).len(), 2);
	assert!(fx.repo.outbox_with_status(OutboxStatus::Pending).is_empty());
}

#[tokio::test]
async fn rate_limit_defers_the_overflow_without_dropping() {
	let fx = Fixture::new(2, Duration::from_secs(0));
	let sent = fx.connected_session(1).await;
	let dispatcher = fx.dispatcher(5);

	fx.enqueue(1, "one").await;
	fx.enqueue(1, "two").await;
	fx.enqueue(1, "three").await;

	let delivered = dispatcher.process_outbox_once().await;
	assert_eq!(delivered, 2, "window admits exactly max");
	assert_eq!(sent.load(Ordering::SeqCst), 2);
	assert_eq!(fx.repo.outbox_with_status(OutboxStatus::Pending).len(), 1);

	// The deferred message survives for a later pass; no attempts burned.
	let pending = fx.repo.outbox_with_status(OutboxStatus::Pending);
	assert_eq!(pending[0].text, "three");
	assert_eq!(pending[0].attempts, 0);
}

#[tokio::test]
async fn busy_channel_lock_defers_delivery() {
	let fx = Fixture::new(10, Duration::from_secs(0));
	let _sent = fx.connected_session(1).await;
	let dispatcher = fx.dispatcher(5);

	let id = fx.enqueue(1, "hello").await;
	let msgs = fx.repo.claim_outbox_batch(10).await.expect("claim");

	let _held = fx.guards.locks.try_acquire(ChannelId(1)).expect("hold lock");
	let outcome = dispatcher.deliver(&msgs[0]).await;
	assert_eq!(outcome, DeliveryOutcome::Deferred(DeferReason::LockBusy));

	let pending = fx.repo.outbox_with_status(OutboxStatus::Pending);
	assert_eq!(pending.len(), 1);
	assert_eq!(pending[0].id, id);
}

#[tokio::test]
async fn missing_session_defers_rather_than_errors() {
	let fx = Fixture::new(10, Duration::from_secs(0));
	let dispatcher = fx.dispatcher(5);

	fx.enqueue(42, "nobody home").await;
	let msgs = fx.repo.claim_outbox_batch(10).await.expect("claim");

	let outcome = dispatcher.deliver(&msgs[0]).await;
	assert_eq!(outcome, DeliveryOutcome::Deferred(DeferReason::NotConnected));
	assert_eq!(fx.repo.outbox_with_status(OutboxStatus::Pending).len(), 1);
}

#[tokio::test]
async fn whitespace_text_is_dropped_silently() {
	let fx = Fixture::new(10, Duration::from_secs(30));
	let sent = fx.connected_session(1).await;
	let dispatcher = fx.dispatcher(5);

	fx.enqueue(1, "   \t ").await;

	let delivered = dispatcher.process_outbox_once().await;
	assert_eq!(delivered, 0);
	assert_eq!(sent.load(Ordering::SeqCst), 0);
	assert_eq!(fx.repo.outbox_with_status(OutboxStatus::Sent).len(), 1);
}

#[tokio::test]
async fn send_failures_retry_until_the_attempt_budget_is_exhausted() {
	let fx = Fixture::new(10, Duration::from_secs(0));
	fx.failing_session(1).await;
	let dispatcher = fx.dispatcher(2);

	fx.enqueue(1, "doomed").await;

	let msgs = fx.repo.claim_outbox_batch(10).await.expect("claim");
	assert_eq!(dispatcher.deliver(&msgs[0]).await, DeliveryOutcome::FailedRetryable);
	assert_eq!(fx.repo.outbox_with_status(OutboxStatus::Pending).len(), 1);

	let msgs = fx.repo.claim_outbox_batch(10).await.expect("claim");
	assert_eq!(dispatcher.deliver(&msgs[0]).await, DeliveryOutcome::FailedTerminal);
	assert_eq!(fx.repo.outbox_with_status(OutboxStatus::Failed).len(), 1);
	assert!(fx.repo.outbox_with_status(OutboxStatus::Pending).is_empty());
}

#[tokio::test]
async fn queue_worker_mode_delivers_and_stops() {
	let fx = Fixture::new(10, Duration::from_secs(0));
	let sent = fx.connected_session(1).await;

	let dispatcher = Arc::new(OutboxDispatcher::new(
		Arc::clone(&fx.repo) as Arc<dyn BotRepository>,
		Arc::clone(&fx.store),
		Arc::clone(&fx.guards),
		OutboxConfig {
			mode: OutboxMode::QueueWorkers,
			concurrency: 2,
			idle_delay: Duration::from_millis(10),
			lock_retry_delay: Duration::from_millis(10),
			..OutboxConfig::default()
		},
	));

	let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
	let tasks = dispatcher.spawn(stop_rx);
	assert_eq!(tasks.len(), 2);

	fx.enqueue(1, "from a worker").await;

	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	while fx.repo.outbox_with_status(OutboxStatus::Sent).is_empty() {
		assert!(tokio::time::Instant::now() < deadline, "worker never delivered");
		tokio::time::sleep(Duration::from_millis(10)).await;
	}

	assert_eq!(sent.load(Ordering::SeqCst), 1);

	let _ = stop_tx.send(true);
	for task in tasks {
		tokio::time::timeout(Duration::from_secs(5), task)
			.await
			.expect("worker did not stop")
			.expect("worker panicked");
	}
}
