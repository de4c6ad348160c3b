#![forbid(unsafe_code)]

//! Socket driver: owns one live WebSocket per channel session and feeds the
//! session machine, executing the actions it returns.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use relaybot_domain::PlatformChannelId;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};
use url::Url;

use crate::dialects::Dialect;
use crate::machine::{Action, Input, Phase, SessionMachine};
use crate::wire::{self, ChatItem};
use crate::{
	ChatEvent, CloseReason, RewardEvent, SecretString, SendRequest, SessionEvent, SessionRunReport, validate_chat_event,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ChannelWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<ChannelWs>> + Send + Sync>;

/// Default connector using `tokio_tungstenite::connect_async`.
pub fn default_connector() -> WsConnector {
	Arc::new(|url: Url| {
		Box::pin(async move {
			let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str()).await?;
			Ok(ws)
		}) as BoxFuture<'static, anyhow::Result<ChannelWs>>
	})
}

/// Task-side wiring for one connection attempt.
pub struct SocketIo<'a> {
	pub events_tx: &'a mpsc::Sender<SessionEvent>,
	pub send_rx: &'a mut mpsc::Receiver<SendRequest>,
	pub connected_tx: &'a watch::Sender<bool>,
	pub stop_rx: &'a mut watch::Receiver<bool>,
}

/// One channel's socket, reusable across reconnect attempts.
pub struct ChannelSocket {
	dialect: Dialect,
	channel: PlatformChannelId,
	connector: WsConnector,
}

impl ChannelSocket {
	pub fn new(dialect: Dialect, channel: PlatformChannelId) -> Self {
		Self {
			dialect,
			channel,
			connector: default_connector(),
		}
	}

	/// Replace the connector (test hook).
	pub fn with_connector(mut self, connector: WsConnector) -> Self {
		self.connector = connector;
		self
	}

	pub fn dialect(&self) -> &Dialect {
		&self.dialect
	}

	/// Run one connect-authenticate-serve cycle until the connection ends.
	///
	/// Never returns an error: every failure collapses into a [`CloseReason`]
	/// for the owning runner's backoff decision.
	pub async fn run(&self, token: &SecretString, io: &mut SocketIo<'_>) -> SessionRunReport {
		let _ = io.connected_tx.send(false);
		let mut reached_ready = false;

		let mut machine = SessionMachine::new(self.dialect.default_keepalive, self.dialect.join_after_auth);
		let actions = machine.step(Input::ConnectRequested);
		debug_assert!(matches!(actions.as_slice(), [Action::OpenSocket]));

		let url = match self.dialect.endpoint(&self.channel) {
			Ok(url) => url,
			Err(e) => {
				warn!(platform = %self.dialect.platform, channel = %self.channel, error = %e, "invalid ws endpoint");
				return SessionRunReport {
					reason: CloseReason::Transport,
					reached_ready,
				};
			}
		};

		let mut ws = match (self.connector)(url).await {
			Ok(ws) => ws,
			Err(e) => {
				debug!(platform = %self.dialect.platform, channel = %self.channel, error = %e, "ws connect failed");
				metrics::counter!("relaybot_session_connect_errors_total").increment(1);
				return SessionRunReport {
					reason: CloseReason::Transport,
					reached_ready,
				};
			}
		};

		let mut next_ping = Instant::now() + machine.keepalive();

		let actions = machine.step(Input::SocketOpened);
		if let Some(reason) = self
			.execute(&mut machine, actions, &mut ws, io, token, &mut next_ping)
			.await
		{
			return SessionRunReport { reason, reached_ready };
		}

		loop {
			let ready = machine.phase() == Phase::Ready;

			let input = tokio::select! {
				changed = io.stop_rx.changed() => {
					if changed.is_err() || *io.stop_rx.borrow() {
						let _ = io.connected_tx.send(false);
						let _ = ws.close(None).await;
						return SessionRunReport {
							reason: CloseReason::Shutdown,
							reached_ready,
						};
					}
					continue;
				}

				msg = ws.next() => match msg {
					None => Input::RemoteClosed,
					Some(Err(e)) => {
						debug!(platform = %self.dialect.platform, channel = %self.channel, error = %e, "ws read error");
						Input::SocketError
					}
					Some(Ok(Message::Text(t))) => match wire::decode(&t) {
						Ok(frame) => Input::Frame(frame),
						Err(e) => {
							// Single bad frame; the connection stays open.
							debug!(platform = %self.dialect.platform, channel = %self.channel, error = %e, "dropping malformed frame");
							metrics::counter!("relaybot_session_malformed_frames_total").increment(1);
							continue;
						}
					},
					Some(Ok(Message::Ping(p))) => {
						if ws.send(Message::Pong(p)).await.is_err() {
							Input::SocketError
						} else {
							continue;
						}
					}
					Some(Ok(Message::Close(_))) => Input::RemoteClosed,
					Some(Ok(_)) => continue,
				},

				req = io.send_rx.recv(), if ready => {
					let Some(req) = req else {
						// Handle dropped; the session is being torn down.
						let _ = io.connected_tx.send(false);
						let _ = ws.close(None).await;
						return SessionRunReport {
							reason: CloseReason::Shutdown,
							reached_ready,
						};
					};
					let frame = self.dialect.chat_frame(&self.channel, &req.text);
					match ws.send(Message::text(frame)).await {
						Ok(()) => {
							metrics::counter!("relaybot_session_sends_total").increment(1);
							let _ = req.resp.send(Ok(()));
							continue;
						}
						Err(e) => {
							let _ = req.resp.send(Err(crate::SessionError::Transport(e.to_string())));
							Input::SocketError
						}
					}
				}

				_ = sleep_until(next_ping) => {
					next_ping = Instant::now() + machine.keepalive();
					Input::KeepaliveDue
				}
			};

			let actions = machine.step(input);
			if let Some(reason) = self
				.execute(&mut machine, actions, &mut ws, io, token, &mut next_ping)
				.await
			{
				return SessionRunReport { reason, reached_ready };
			}
			if machine.phase() == Phase::Ready {
				reached_ready = true;
			}
		}
	}

	async fn execute(
		&self,
		machine: &mut SessionMachine,
		actions: Vec<Action>,
		ws: &mut ChannelWs,
		io: &mut SocketIo<'_>,
		token: &SecretString,
		next_ping: &mut Instant,
	) -> Option<CloseReason> {
		for action in actions {
			match action {
				Action::OpenSocket => {}

				Action::SendAuth { nonce } => {
					let frame = self.dialect.auth_frame(&nonce, token.expose(), &self.channel);
					if let Err(e) = ws.send(Message::text(frame)).await {
						debug!(platform = %self.dialect.platform, channel = %self.channel, error = %e, "auth send failed");
						let _ = machine.step(Input::SocketError);
						let _ = io.connected_tx.send(false);
						return Some(CloseReason::Transport);
					}
				}

				Action::SendJoin => {
					if let Some(frame) = self.dialect.join_frame(&self.channel)
						&& let Err(e) = ws.send(Message::text(frame)).await
					{
						debug!(platform = %self.dialect.platform, channel = %self.channel, error = %e, "join send failed");
						let _ = machine.step(Input::SocketError);
						let _ = io.connected_tx.send(false);
						return Some(CloseReason::Transport);
					}
				}

				Action::StartKeepalive(interval) => {
					*next_ping = Instant::now() + interval;
					if machine.phase() == Phase::Ready {
						let _ = io.connected_tx.send(true);
						metrics::counter!("relaybot_session_connects_total").increment(1);
					}
				}

				Action::SendPing => {
					if ws.send(Message::text(wire::encode_ping(&crate::new_session_id()))).await.is_err() {
						let _ = machine.step(Input::SocketError);
						let _ = io.connected_tx.send(false);
						return Some(CloseReason::Transport);
					}
				}

				Action::SendPong => {
					if ws.send(Message::text(wire::encode_pong())).await.is_err() {
						let _ = machine.step(Input::SocketError);
						let _ = io.connected_tx.send(false);
						return Some(CloseReason::Transport);
					}
				}

				Action::DeliverChats(_) => {
					for item in machine.take_chats() {
						if let Some(event) = self.normalize(item)
							&& io.events_tx.send(event).await.is_err()
						{
							// Pipeline gone; shut the session down.
							let _ = io.connected_tx.send(false);
							let _ = ws.close(None).await;
							return Some(CloseReason::Shutdown);
						}
					}
				}

				Action::Close(reason) => {
					let _ = io.connected_tx.send(false);
					let _ = ws.close(None).await;
					metrics::counter!("relaybot_session_disconnects_total").increment(1);
					return Some(reason);
				}
			}
		}

		None
	}

	fn normalize(&self, item: ChatItem) -> Option<SessionEvent> {
		if self.dialect.is_lifecycle(item.kind) {
			return match wire::classify_lifecycle(&item.content) {
				Some(signal) => Some(SessionEvent::Lifecycle(signal)),
				None => {
					debug!(platform = %self.dialect.platform, channel = %self.channel, content = %item.content, "unclassifiable lifecycle event");
					None
				}
			};
		}

		if self.dialect.is_reward(item.kind) {
			return Some(SessionEvent::Reward(RewardEvent {
				user_id: item.uid,
				display_name: if item.nick_name.is_empty() { item.user_name } else { item.nick_name },
				kind: item.kind,
				detail: item.content,
			}));
		}

		let event = ChatEvent {
			user_id: item.uid,
			login: if item.user_name.is_empty() {
				item.nick_name.to_ascii_lowercase()
			} else {
				item.user_name
			},
			display_name: item.nick_name,
			text: item.content.trim().to_string(),
		};

		match validate_chat_event(&event) {
			Ok(()) => Some(SessionEvent::Chat(event)),
			Err(e) => {
				debug!(platform = %self.dialect.platform, channel = %self.channel, error = %e, "dropping invalid chat item");
				metrics::counter!("relaybot_session_invalid_chats_total").increment(1);
				None
			}
		}
	}
}
