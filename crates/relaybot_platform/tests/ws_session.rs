#![forbid(unsafe_code)]

//! End-to-end session handshake against a local WebSocket server.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relaybot_domain::{Platform, PlatformChannelId};
use relaybot_platform::dialects::Dialect;
use relaybot_platform::socket::{ChannelSocket, SocketIo};
use relaybot_platform::{CloseReason, LifecycleSignal, SecretString, SessionEvent, connection_wiring};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Message;

async fn local_server() -> (TcpListener, String) {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("local addr");
	(listener, format!("ws://{addr}"))
}

async fn accept_ws(listener: &TcpListener) -> WebSocketStream<TcpStream> {
	let (stream, _addr) = listener.accept().await.expect("accept");
	tokio_tungstenite::accept_async(stream).await.expect("ws accept")
}

async fn read_json(ws: &mut WebSocketStream<TcpStream>) -> serde_json::Value {
	loop {
		let msg = timeout(Duration::from_secs(5), ws.next())
			.await
			.expect("read timeout")
			.expect("stream ended")
			.expect("read error");
		if let Message::Text(t) = msg {
			return serde_json::from_str(&t).expect("json frame");
		}
	}
}

fn test_socket(ws_url: &str) -> ChannelSocket {
	let dialect = Dialect::for_platform(Platform::Trovo).with_ws_url(ws_url.to_string());
	ChannelSocket::new(dialect, PlatformChannelId::new("p1").expect("channel id"))
}

#[tokio::test]
async fn handshake_chat_and_send_roundtrip() {
	let (listener, url) = local_server().await;

	let server = tokio::spawn(async move {
		let mut ws = accept_ws(&listener).await;

		let auth = read_json(&mut ws).await;
		assert_eq!(auth["type"], "AUTH");
		let nonce = auth["nonce"].as_str().expect("nonce").to_string();
		assert_eq!(auth["data"]["token"], "tok-1");

		let response = json!({ "type": "RESPONSE", "nonce": nonce, "data": { "ok": true } });
		ws.send(Message::text(response.to_string())).await.expect("send response");

		let chat = json!({ "type": "CHAT", "data": { "chats": [
			{ "type": 1, "content": "!hello", "uid": "u1", "user_name": "alice", "nick_name": "Alice" },
			{ "type": 5012, "content": "stream is now online" }
		] } });
		ws.send(Message::text(chat.to_string())).await.expect("send chat");

		// The client should push one outbound chat line.
		let outbound = read_json(&mut ws).await;
		assert_eq!(outbound["type"], "CHAT");
		assert_eq!(outbound["data"]["content"], "hi chat");
		assert_eq!(outbound["data"]["channel_id"], "p1");

		ws.close(None).await.expect("close");
	});

	let socket = test_socket(&url);
	let (handle, mut send_rx, connected_tx) = connection_wiring(16);
	let (events_tx, mut events_rx) = mpsc::channel::<SessionEvent>(16);
	let (_stop_tx, mut stop_rx) = watch::channel(false);

	let token = SecretString::new("tok-1");
	let driver = tokio::spawn(async move {
		let mut io = SocketIo {
			events_tx: &events_tx,
			send_rx: &mut send_rx,
			connected_tx: &connected_tx,
			stop_rx: &mut stop_rx,
		};
		socket.run(&token, &mut io).await
	});

	let first = timeout(Duration::from_secs(5), events_rx.recv())
		.await
		.expect("event timeout")
		.expect("events closed");
	match first {
		SessionEvent::Chat(chat) => {
			assert_eq!(chat.user_id, "u1");
			assert_eq!(chat.login, "alice");
			assert_eq!(chat.text, "!hello");
		}
		other => panic!("expected chat event, got {other:?}"),
	}

	let second = timeout(Duration::from_secs(5), events_rx.recv())
		.await
		.expect("event timeout")
		.expect("events closed");
	assert!(matches!(second, SessionEvent::Lifecycle(LifecycleSignal::Online)));

	assert!(handle.is_connected());
	handle.send_chat("hi chat").await.expect("send chat");

	let report = timeout(Duration::from_secs(5), driver).await.expect("driver timeout").expect("join");
	assert_eq!(report.reason, CloseReason::Remote);
	assert!(report.reached_ready);
	assert!(!handle.is_connected());

	server.await.expect("server task");
}

#[tokio::test]
async fn auth_rejection_surfaces_as_auth_close() {
	let (listener, url) = local_server().await;

	let server = tokio::spawn(async move {
		let mut ws = accept_ws(&listener).await;
		let auth = read_json(&mut ws).await;
		let nonce = auth["nonce"].as_str().expect("nonce").to_string();

		let response = json!({
			"type": "RESPONSE",
			"nonce": nonce,
			"data": { "ok": false, "error": "invalid token" }
		});
		ws.send(Message::text(response.to_string())).await.expect("send response");
	});

	let socket = test_socket(&url);
	let (handle, mut send_rx, connected_tx) = connection_wiring(4);
	let (events_tx, _events_rx) = mpsc::channel::<SessionEvent>(4);
	let (_stop_tx, mut stop_rx) = watch::channel(false);

	let token = SecretString::new("bad-token");
	let mut io = SocketIo {
		events_tx: &events_tx,
		send_rx: &mut send_rx,
		connected_tx: &connected_tx,
		stop_rx: &mut stop_rx,
	};

	let report = timeout(Duration::from_secs(5), socket.run(&token, &mut io))
		.await
		.expect("run timeout");
	assert_eq!(report.reason, CloseReason::AuthRejected);
	assert!(!report.reached_ready);
	assert!(!handle.is_connected());

	server.await.expect("server task");
}

#[tokio::test]
async fn shutdown_flag_closes_the_session() {
	let (listener, url) = local_server().await;

	let server = tokio::spawn(async move {
		let mut ws = accept_ws(&listener).await;
		let auth = read_json(&mut ws).await;
		let nonce = auth["nonce"].as_str().expect("nonce").to_string();
		let response = json!({ "type": "RESPONSE", "nonce": nonce, "data": { "ok": true } });
		ws.send(Message::text(response.to_string())).await.expect("send response");

		// Hold the socket open until the client closes.
		while let Some(Ok(msg)) = ws.next().await {
			if matches!(msg, Message::Close(_)) {
				break;
			}
		}
	});

	let socket = test_socket(&url);
	let (handle, mut send_rx, connected_tx) = connection_wiring(4);
	let (events_tx, _events_rx) = mpsc::channel::<SessionEvent>(4);
	let (stop_tx, mut stop_rx) = watch::channel(false);

	let token = SecretString::new("tok-1");
	let driver = tokio::spawn(async move {
		let mut io = SocketIo {
			events_tx: &events_tx,
			send_rx: &mut send_rx,
			connected_tx: &connected_tx,
			stop_rx: &mut stop_rx,
		};
		socket.run(&token, &mut io).await
	});

	// Wait until the session is live, then request shutdown.
	timeout(Duration::from_secs(5), async {
		while !handle.is_connected() {
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("connect timeout");

	stop_tx.send(true).expect("stop signal");

	let report = timeout(Duration::from_secs(5), driver).await.expect("driver timeout").expect("join");
	assert_eq!(report.reason, CloseReason::Shutdown);
	assert!(report.reached_ready);

	server.await.expect("server task");
}
