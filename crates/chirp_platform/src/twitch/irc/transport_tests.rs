use std::time::Duration;

use chirp_domain::{ChannelName, UserLogin};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tungstenite::Message;
use tungstenite::protocol::frame::coding::CloseCode;

use super::*;
use crate::SecretString;
use crate::ws::WsConnector;
use crate::ws::testing::{MockPeer, failing_connector, mock_connector};

const WAIT: Duration = Duration::from_secs(600);

fn config(connector: WsConnector) -> ChatConfig {
	let mut cfg = ChatConfig::new(
		UserLogin::new("ChirpBot").expect("login"),
		SecretString::new("abc123"),
		ChannelName::new("#Bar").expect("channel"),
	);
	cfg.ws_connector = Some(connector);
	cfg
}

async fn open(peers: &mut mpsc::UnboundedReceiver<MockPeer>, token: &str) -> MockPeer {
	let mut peer = timeout(WAIT, peers.recv()).await.expect("connect in time").expect("peer");
	let expected = [
		"CAP REQ :twitch.tv/tags twitch.tv/commands\r\n".to_string(),
		format!("PASS {token}\r\n"),
		"NICK chirpbot\r\n".to_string(),
		"JOIN #bar\r\n".to_string(),
	];
	for line in expected {
		assert_eq!(peer.next_text().await, Some(line));
	}
	peer
}

#[tokio::test(start_paused = true)]
async fn handshake_then_connected_event() {
	let (connector, mut peers) = mock_connector();
	let (transport, handle) = ChatTransport::new(config(connector));
	let mut connected = handle.listen(ChatEventKind::Connected);
	let task = tokio::spawn(transport.run());

	let _peer = open(&mut peers, "oauth:abc123").await;
	let ev = timeout(WAIT, connected.recv()).await.expect("event").expect("open channel");
	assert!(matches!(ev, ChatEvent::Connected { .. }));
	assert_eq!(handle.state(), ChatState::Open);

	handle.shutdown();
	timeout(WAIT, task).await.expect("task ends").expect("join");
}

#[tokio::test(start_paused = true)]
async fn ping_is_answered_without_an_event() {
	let (connector, mut peers) = mock_connector();
	let (transport, handle) = ChatTransport::new(config(connector));
	let mut all = handle.listen_all();
	tokio::spawn(transport.run());

	let mut peer = open(&mut peers, "oauth:abc123").await;
	assert!(matches!(all.recv().await, Some(ChatEvent::Connected { .. })));

	peer.send_text("PING :tmi.twitch.tv\r\n");
	assert_eq!(peer.next_text().await.as_deref(), Some("PONG :tmi.twitch.tv\r\n"));
	assert!(all.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn websocket_ping_gets_a_pong() {
	let (connector, mut peers) = mock_connector();
	let (transport, _handle) = ChatTransport::new(config(connector));
	tokio::spawn(transport.run());

	let mut peer = open(&mut peers, "oauth:abc123").await;
	peer.send(Message::Ping(b"hb".to_vec().into()));
	let reply = peer.next_message().await.expect("reply");
	assert_eq!(reply, Message::Pong(b"hb".to_vec().into()));
}

#[tokio::test(start_paused = true)]
async fn every_line_of_a_frame_is_parsed() {
	let (connector, mut peers) = mock_connector();
	let (transport, handle) = ChatTransport::new(config(connector));
	let mut messages = handle.listen(ChatEventKind::Message);
	let mut rooms = handle.listen(ChatEventKind::RoomState);
	tokio::spawn(transport.run());

	let peer = open(&mut peers, "oauth:abc123").await;
	peer.send_text(
		"@badges=broadcaster/1;user-id=123 :foo!foo@foo.tmi.twitch.tv PRIVMSG #bar :hello\r\n\
		 @room-id=99 :tmi.twitch.tv ROOMSTATE #bar\r\n",
	);

	let Some(ChatEvent::Message(msg)) = messages.recv().await else {
		panic!("expected a message");
	};
	assert_eq!(msg.username, "foo");
	assert_eq!(msg.channel.as_str(), "bar");
	assert_eq!(msg.text, "hello");
	assert!(msg.privileges.broadcaster);

	let Some(ChatEvent::RoomState { room_id, .. }) = rooms.recv().await else {
		panic!("expected roomstate");
	};
	assert_eq!(room_id.get(), 99);
}

#[tokio::test(start_paused = true)]
async fn say_writes_privmsg_lines() {
	let (connector, mut peers) = mock_connector();
	let (transport, handle) = ChatTransport::new(config(connector));
	tokio::spawn(transport.run());

	let mut peer = open(&mut peers, "oauth:abc123").await;
	assert!(handle.say("hi there"));
	assert!(handle.say("second"));
	assert_eq!(peer.next_text().await.as_deref(), Some("PRIVMSG #bar :hi there\r\n"));
	assert_eq!(peer.next_text().await.as_deref(), Some("PRIVMSG #bar :second\r\n"));
}

#[tokio::test(start_paused = true)]
async fn reconnect_directive_reopens_after_backoff() {
	let (connector, mut peers) = mock_connector();
	let (transport, handle) = ChatTransport::new(config(connector));
	let mut connected = handle.listen(ChatEventKind::Connected);
	tokio::spawn(transport.run());

	let mut first = open(&mut peers, "oauth:abc123").await;
	connected.recv().await.expect("first connect");

	first.send_text(":tmi.twitch.tv RECONNECT\r\n");
	let close = first.next_message().await.expect("close frame");
	assert!(matches!(close, Message::Close(Some(ref f)) if f.code == CloseCode::Normal));
	first.drop_connection();
	let closed_at = Instant::now();

	let second = open(&mut peers, "oauth:abc123").await;
	let gap = second.opened_at - closed_at;
	assert!(gap >= Duration::from_secs(1) && gap < Duration::from_secs(2), "gap {gap:?}");
	connected.recv().await.expect("second connect");
}

#[tokio::test(start_paused = true)]
async fn backoff_is_linear_then_gives_up() {
	let (connector, calls) = failing_connector();
	let (transport, handle) = ChatTransport::new(config(connector));
	let mut disconnected = handle.listen(ChatEventKind::Disconnected);
	let task = tokio::spawn(transport.run());

	let ev = timeout(WAIT, disconnected.recv()).await.expect("terminal event").expect("channel");
	assert!(matches!(ev, ChatEvent::Disconnected { .. }));
	timeout(WAIT, task).await.expect("task ends").expect("join");

	let calls = calls.lock().clone();
	assert_eq!(calls.len(), 11);
	let gaps: Vec<u64> = calls.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
	assert_eq!(gaps, (1..=10).collect::<Vec<u64>>());

	tokio::time::sleep(Duration::from_secs(3600)).await;
	assert_eq!(handle.state(), ChatState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_normally_and_stays_down() {
	let (connector, mut peers) = mock_connector();
	let (transport, handle) = ChatTransport::new(config(connector));
	let task = tokio::spawn(transport.run());

	let mut peer = open(&mut peers, "oauth:abc123").await;
	handle.shutdown();

	let close = peer.next_message().await.expect("close frame");
	assert!(matches!(close, Message::Close(Some(ref f)) if f.code == CloseCode::Normal));
	peer.drop_connection();

	timeout(WAIT, task).await.expect("task ends").expect("join");
	assert_eq!(handle.state(), ChatState::ShuttingDown);
	assert!(peers.try_recv().is_err());
	assert!(!handle.say("anyone?"));
}

#[tokio::test(start_paused = true)]
async fn queued_text_survives_a_dropped_socket() {
	let (connector, mut peers) = mock_connector();
	let (transport, handle) = ChatTransport::new(config(connector));
	let mut state = handle.watch_state();
	tokio::spawn(transport.run());

	let mut first = open(&mut peers, "oauth:abc123").await;
	first.drop_connection();
	state.wait_for(|s| *s == ChatState::Disconnected).await.expect("state");

	handle.say("sent later");
	let mut second = open(&mut peers, "oauth:abc123").await;
	assert_eq!(second.next_text().await.as_deref(), Some("PRIVMSG #bar :sent later\r\n"));
}

#[tokio::test(start_paused = true)]
async fn rotated_token_is_used_on_next_connect() {
	let (connector, mut peers) = mock_connector();
	let (transport, handle) = ChatTransport::new(config(connector));
	tokio::spawn(transport.run());

	let mut first = open(&mut peers, "oauth:abc123").await;
	handle.update_token(SecretString::new("oauth:rotated"));
	first.drop_connection();

	let _second = open(&mut peers, "oauth:rotated").await;
}
