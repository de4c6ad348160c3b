#![forbid(unsafe_code)]

//! Per-session connection state machine.
//!
//! Pure transitions over decoded frames; the socket driver executes the
//! returned actions. Keeping `AwaitingAuth` distinct from `Ready` is what
//! lets the runtime refresh tokens only on real auth rejections instead of
//! on every disconnect.

use std::time::Duration;

use crate::wire::{self, Frame};
use crate::{CloseReason, new_session_id};

/// Session phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	Idle,
	Connecting,
	AwaitingAuth,
	Ready,
	Closed,
}

/// Machine inputs fed by the socket driver.
#[derive(Debug)]
pub enum Input {
	/// Caller asked for a connection.
	ConnectRequested,
	/// Underlying socket opened.
	SocketOpened,
	/// One decoded inbound frame.
	Frame(Frame),
	/// Keepalive timer fired.
	KeepaliveDue,
	/// Socket-level read/write error.
	SocketError,
	/// Remote sent a close frame or the stream ended.
	RemoteClosed,
}

/// Side effects for the driver to execute, in order.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
	OpenSocket,
	SendAuth { nonce: String },
	SendJoin,
	StartKeepalive(Duration),
	SendPing,
	SendPong,
	DeliverChats(usize),
	Close(CloseReason),
}

/// One channel session's protocol state.
#[derive(Debug)]
pub struct SessionMachine {
	phase: Phase,
	auth_nonce: Option<String>,
	keepalive: Duration,
	join_after_auth: bool,
	/// Chats handed out by the last `DeliverChats` action.
	pending_chats: Vec<wire::ChatItem>,
}

impl SessionMachine {
	pub fn new(default_keepalive: Duration, join_after_auth: bool) -> Self {
		Self {
			phase: Phase::Idle,
			auth_nonce: None,
			keepalive: default_keepalive,
			join_after_auth,
			pending_chats: Vec::new(),
		}
	}

	pub fn phase(&self) -> Phase {
		self.phase
	}

	pub fn keepalive(&self) -> Duration {
		self.keepalive
	}

	/// Take the chat batch referenced by the last `DeliverChats` action.
	pub fn take_chats(&mut self) -> Vec<wire::ChatItem> {
		std::mem::take(&mut self.pending_chats)
	}

	fn bounded_keepalive(gap_seconds: u64) -> Duration {
		Duration::from_secs(gap_seconds.max(wire::MIN_KEEPALIVE_SECS))
	}

	fn close(&mut self, reason: CloseReason) -> Vec<Action> {
		self.phase = Phase::Closed;
		self.auth_nonce = None;
		vec![Action::Close(reason)]
	}

	/// Apply one input; returns the actions to execute.
	pub fn step(&mut self, input: Input) -> Vec<Action> {
		match input {
			Input::ConnectRequested => {
				// Already connected or mid-connect is a no-op.
				if self.phase != Phase::Idle {
					return Vec::new();
				}
				self.phase = Phase::Connecting;
				vec![Action::OpenSocket]
			}

			Input::SocketOpened => {
				if self.phase != Phase::Connecting {
					return Vec::new();
				}
				let nonce = new_session_id();
				self.auth_nonce = Some(nonce.clone());
				self.phase = Phase::AwaitingAuth;
				vec![Action::SendAuth { nonce }]
			}

			Input::Frame(frame) => self.on_frame(frame),

			Input::KeepaliveDue => match self.phase {
				Phase::Ready => vec![Action::SendPing],
				// No auth response within the keepalive window.
				Phase::AwaitingAuth => self.close(CloseReason::Transport),
				_ => Vec::new(),
			},

			Input::SocketError => match self.phase {
				Phase::Closed => Vec::new(),
				_ => self.close(CloseReason::Transport),
			},

			Input::RemoteClosed => match self.phase {
				Phase::Closed => Vec::new(),
				_ => self.close(CloseReason::Remote),
			},
		}
	}

	fn on_frame(&mut self, frame: Frame) -> Vec<Action> {
		match frame {
			Frame::Response { nonce, ok, error } => {
				if self.phase != Phase::AwaitingAuth {
					return Vec::new();
				}
				// Only the response to our own AUTH counts.
				if nonce.as_deref() != self.auth_nonce.as_deref() {
					return Vec::new();
				}

				if !ok {
					let detail = error.unwrap_or_else(|| "ok=false".to_string());
					tracing::debug!(detail = %detail, "auth response rejected");
					return self.close(CloseReason::AuthRejected);
				}

				self.phase = Phase::Ready;
				self.auth_nonce = None;

				let mut actions = Vec::new();
				if self.join_after_auth {
					actions.push(Action::SendJoin);
				}
				actions.push(Action::StartKeepalive(self.keepalive));
				actions
			}

			Frame::Ping => {
				// Reply to unsolicited probes immediately, even pre-auth.
				match self.phase {
					Phase::AwaitingAuth | Phase::Ready => vec![Action::SendPong],
					_ => Vec::new(),
				}
			}

			Frame::Pong { gap_seconds } => {
				if self.phase != Phase::Ready {
					return Vec::new();
				}
				match gap_seconds {
					Some(gap) => {
						let next = Self::bounded_keepalive(gap);
						if next != self.keepalive {
							self.keepalive = next;
							vec![Action::StartKeepalive(next)]
						} else {
							Vec::new()
						}
					}
					None => Vec::new(),
				}
			}

			Frame::Chat { chats } => {
				if self.phase != Phase::Ready || chats.is_empty() {
					return Vec::new();
				}
				let count = chats.len();
				self.pending_chats = chats;
				vec![Action::DeliverChats(count)]
			}

			Frame::Other(_) => Vec::new(),
		}
	}
}
