#![forbid(unsafe_code)]

pub mod backoff;
pub mod dialects;
pub mod machine;
pub mod socket;
pub mod token;
pub mod wire;

use std::fmt;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Session-level errors crossing the adapter seam.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
	/// Token invalid or rejected by the platform; triggers a token refresh.
	#[error("authentication rejected: {0}")]
	Auth(String),

	/// Connect/send failure or socket drop; retried with backoff.
	#[error("transport error: {0}")]
	Transport(String),

	/// Unparseable frame or missing required fields; the event is dropped.
	#[error("malformed payload: {0}")]
	Malformed(String),
}

/// Why a live connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
	/// The platform rejected our AUTH frame.
	AuthRejected,
	/// Socket error or failed keepalive.
	Transport,
	/// Remote sent a close frame.
	Remote,
	/// Shutdown requested locally.
	Shutdown,
}

impl fmt::Display for CloseReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::AuthRejected => "auth_rejected",
			Self::Transport => "transport",
			Self::Remote => "remote",
			Self::Shutdown => "shutdown",
		};
		f.write_str(s)
	}
}

/// Outcome of one connect-authenticate-serve cycle.
///
/// `reached_ready` tells the owning runner whether to reset its backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRunReport {
	pub reason: CloseReason,
	pub reached_ready: bool,
}

/// Stream lifecycle signal extracted from a lifecycle chat event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
	Online,
	Offline,
}

/// Normalized conversational chat event.
#[derive(Debug, Clone)]
pub struct ChatEvent {
	pub user_id: String,
	pub login: String,
	pub display_name: String,
	pub text: String,
}

/// Normalized reward redemption (spell cast, gifted sub, ...).
///
/// These skip command matching; they are not conversational messages.
#[derive(Debug, Clone)]
pub struct RewardEvent {
	pub user_id: String,
	pub display_name: String,
	pub kind: u32,
	pub detail: String,
}

/// Inbound event emitted by a channel's live connection.
#[derive(Debug, Clone)]
pub enum SessionEvent {
	Chat(ChatEvent),
	Lifecycle(LifecycleSignal),
	Reward(RewardEvent),
}

/// Validate basic chat event invariants before command matching.
pub fn validate_chat_event(ev: &ChatEvent) -> anyhow::Result<()> {
	if ev.user_id.trim().is_empty() {
		return Err(anyhow!("chat event user id must be non-empty"));
	}
	if ev.text.trim().is_empty() {
		return Err(anyhow!("chat event text must be non-empty"));
	}
	Ok(())
}

/// Outbound send request handed to a channel's connection task.
#[derive(Debug)]
pub struct SendRequest {
	pub text: String,
	pub resp: oneshot::Sender<Result<(), SessionError>>,
}

/// Handle to a channel's live connection held by the channel state store.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
	sender: mpsc::Sender<SendRequest>,
	connected: watch::Receiver<bool>,
}

/// How long a send waits for the connection task to acknowledge.
const SEND_ACK_TIMEOUT: Duration = Duration::from_secs(5);

impl ConnectionHandle {
	pub fn new(sender: mpsc::Sender<SendRequest>, connected: watch::Receiver<bool>) -> Self {
		Self { sender, connected }
	}

	/// Whether the session is currently connected and authenticated.
	pub fn is_connected(&self) -> bool {
		*self.connected.borrow()
	}

	/// Send one chat line; resolves once the socket write completed.
	pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), SessionError> {
		let (tx, rx) = oneshot::channel();
		let req = SendRequest {
			text: text.into(),
			resp: tx,
		};

		self.sender
			.send(req)
			.await
			.map_err(|_| SessionError::Transport("connection task gone".to_string()))?;

		match tokio::time::timeout(SEND_ACK_TIMEOUT, rx).await {
			Ok(Ok(result)) => result,
			Ok(Err(_)) => Err(SessionError::Transport("send ack dropped".to_string())),
			Err(_) => Err(SessionError::Transport("send ack timed out".to_string())),
		}
	}
}

/// Build the wiring for one channel connection.
///
/// Returns the store-facing handle plus the task-facing ends.
pub fn connection_wiring(
	send_capacity: usize,
) -> (ConnectionHandle, mpsc::Receiver<SendRequest>, watch::Sender<bool>) {
	let (send_tx, send_rx) = mpsc::channel(send_capacity);
	let (connected_tx, connected_rx) = watch::channel(false);
	(ConnectionHandle::new(send_tx, connected_rx), send_rx, connected_tx)
}

/// Generate an opaque session id.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn secret_string_redacts() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s}"), "<redacted>");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
		assert_eq!(s.expose(), "hunter2");
	}

	#[test]
	fn chat_event_validation() {
		let ok = ChatEvent {
			user_id: "42".to_string(),
			login: "bob".to_string(),
			display_name: "Bob".to_string(),
			text: "!hello".to_string(),
		};
		assert!(validate_chat_event(&ok).is_ok());

		let empty_user = ChatEvent {
			user_id: "  ".to_string(),
			..ok.clone()
		};
		assert!(validate_chat_event(&empty_user).is_err());

		let empty_text = ChatEvent {
			text: "\t ".to_string(),
			..ok
		};
		assert!(validate_chat_event(&empty_text).is_err());
	}
}
