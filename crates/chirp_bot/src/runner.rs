#![forbid(unsafe_code)]

use std::sync::Arc;

use chirp_domain::{ChannelName, RoomId, UserId};
use chirp_platform::Listener;
use chirp_platform::twitch::eventsub::{
	CHANNEL_FOLLOW, CHANNEL_RAID, ChannelFollowEvent, ChannelRaidEvent, EventSubConfig, EventSubHandle, EventSubSession,
	Notification, STREAM_OFFLINE, STREAM_ONLINE, SessionEvent, StreamOnlineEvent, SubscribeError,
};
use chirp_platform::twitch::helix::{HelixClient, SubscriptionApi};
use chirp_platform::twitch::irc::{ChatConfig, ChatEvent, ChatHandle, ChatTransport};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::commands::CommandRegistry;
use crate::config::{BotConfig, BotSettings};

const FOLLOW_VERSION: &str = "2";

struct EventSubParts {
	handle: EventSubHandle,
	events: Listener<SessionEvent>,
	task: JoinHandle<()>,
}

/// Hosts one bot: a chat transport, an optional EventSub session and the
/// command registry answering chat.
pub struct BotRunner {
	name: String,
	channel: ChannelName,
	chat: ChatHandle,
	chat_events: Listener<ChatEvent>,
	chat_task: JoinHandle<()>,
	eventsub: Option<EventSubParts>,
	commands: CommandRegistry,
	room_id: Option<RoomId>,
	bot_user_id: Option<UserId>,
	/// Set by a cold session welcome; cleared once the follow subscription is settled.
	follow_wanted: bool,
}

impl BotRunner {
	/// Build transports from config and start them.
	pub fn start(bot: &BotSettings, cfg: &BotConfig, started_at: Instant) -> anyhow::Result<Self> {
		let chat = bot.chat_config(&cfg.chat);

		let eventsub = match (bot.eventsub_config(&cfg.eventsub), bot.client_id.as_deref()) {
			(Some(es), Some(client_id)) => {
				let api: Arc<dyn SubscriptionApi> = Arc::new(HelixClient::new(cfg.eventsub.helix_base_url()?, client_id)?);
				Some((es, api))
			}
			_ => None,
		};

		let commands = CommandRegistry::with_builtins(bot.prefix.clone(), bot.superusers.clone(), started_at);
		Ok(Self::new(bot.name.clone(), chat, eventsub, commands))
	}

	pub fn new(
		name: String,
		chat_cfg: ChatConfig,
		eventsub: Option<(EventSubConfig, Arc<dyn SubscriptionApi>)>,
		commands: CommandRegistry,
	) -> Self {
		let channel = chat_cfg.channel.clone();

		let (transport, chat) = ChatTransport::new(chat_cfg);
		let chat_events = chat.listen_all();
		let chat_task = tokio::spawn(transport.run());

		let eventsub = eventsub.map(|(es_cfg, api)| {
			let (session, handle) = EventSubSession::new(es_cfg, api);
			let events = handle.listen_all();
			let task = tokio::spawn(session.run());
			EventSubParts { handle, events, task }
		});

		Self {
			name,
			channel,
			chat,
			chat_events,
			chat_task,
			eventsub,
			commands,
			room_id: None,
			bot_user_id: None,
			follow_wanted: false,
		}
	}

	/// Runs until `shutdown` flips to true or chat gives up reconnecting.
	pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
		info!(bot = %self.name, channel = %self.channel, eventsub = self.eventsub.is_some(), "bot started");

		loop {
			tokio::select! {
				ev = self.chat_events.recv() => match ev {
					Some(ev) => {
						if !self.on_chat_event(ev).await {
							break;
						}
					}
					None => break,
				},
				ev = next_session_event(&mut self.eventsub) => match ev {
					Some(ev) => self.on_session_event(ev),
					None => {
						if let Some(parts) = self.eventsub.as_mut() {
							debug!(bot = %self.name, "eventsub listener closed");
							parts.events = parts.handle.listen_all();
						}
					}
				},
				changed = shutdown.changed() => {
					if changed.is_err() || *shutdown.borrow() {
						break;
					}
				}
			}

			self.ensure_follow_subscription().await;
		}

		self.stop().await;
	}

	async fn on_chat_event(&mut self, ev: ChatEvent) -> bool {
		match ev {
			ChatEvent::Message(msg) => {
				if let Some(reply) = self.commands.dispatch(&msg).await {
					self.chat.say(reply);
				} else {
					debug!(bot = %self.name, user = %msg.username, "chat message");
				}
			}
			ChatEvent::Ban(ban) => {
				info!(bot = %self.name, channel = %ban.channel, user = %ban.username, duration = %ban.duration, "{}", ban.message);
			}
			ChatEvent::Raid(raid) => {
				info!(bot = %self.name, channel = %raid.channel, from = %raid.username, viewers = ?raid.viewers, "incoming raid");
			}
			ChatEvent::RoomState { channel, room_id } => {
				debug!(bot = %self.name, %channel, %room_id, "room state");
				self.room_id = Some(room_id);
			}
			ChatEvent::BotUserState { user_id } => {
				debug!(bot = %self.name, %user_id, "bot identity confirmed");
				self.bot_user_id = Some(user_id);
			}
			ChatEvent::UserState { channel, badges } => {
				debug!(bot = %self.name, %channel, badges = ?badges.names().collect::<Vec<_>>(), "bot user state");
			}
			ChatEvent::Connected { connection_id } => {
				info!(bot = %self.name, channel = %self.channel, %connection_id, "connected to chat");
			}
			ChatEvent::Disconnected { reason } => {
				error!(bot = %self.name, channel = %self.channel, %reason, "chat disconnected for good; stopping bot");
				return false;
			}
		}
		true
	}

	fn on_session_event(&mut self, ev: SessionEvent) {
		match ev {
			SessionEvent::Ready { session_id, resumed } => {
				info!(bot = %self.name, %session_id, resumed, "eventsub ready");
				if !resumed {
					self.follow_wanted = true;
				}
			}
			SessionEvent::Notification(n) => self.on_notification(&n),
			SessionEvent::Revoked {
				subscription_type,
				subscription_id,
				status,
			} => {
				warn!(bot = %self.name, kind = %subscription_type, %subscription_id, status = ?status, "eventsub subscription revoked");
			}
			SessionEvent::Disconnected { reason } => {
				error!(bot = %self.name, %reason, "eventsub disconnected for good");
			}
		}
	}

	fn on_notification(&self, n: &Notification) {
		let decoded = match n.subscription_type.as_str() {
			CHANNEL_FOLLOW => n
				.decode::<ChannelFollowEvent>()
				.map(|f| info!(bot = %self.name, user = %f.user_name, "new follower")),
			STREAM_ONLINE => n
				.decode::<StreamOnlineEvent>()
				.map(|s| info!(bot = %self.name, broadcaster = %s.broadcaster_user_login, started_at = %s.started_at, "stream online")),
			STREAM_OFFLINE => {
				info!(bot = %self.name, "stream offline");
				Ok(())
			}
			CHANNEL_RAID => n.decode::<ChannelRaidEvent>().map(|r| {
				info!(bot = %self.name, from = %r.from_broadcaster_user_login, viewers = r.viewers, "raid notification")
			}),
			other => {
				debug!(bot = %self.name, kind = other, "unhandled eventsub notification");
				Ok(())
			}
		};

		if let Err(e) = decoded {
			warn!(bot = %self.name, kind = %n.subscription_type, error = %format!("{e:#}"), "bad eventsub payload");
		}
	}

	/// Subscribe to follows once the room, the bot id and a cold session are all known.
	async fn ensure_follow_subscription(&mut self) {
		if !self.follow_wanted {
			return;
		}
		let (Some(room_id), Some(bot_user_id), Some(parts)) = (self.room_id, self.bot_user_id, self.eventsub.as_ref()) else {
			return;
		};

		let condition = serde_json::json!({
			"broadcaster_user_id": room_id.to_string(),
			"moderator_user_id": bot_user_id.to_string(),
		});

		match parts.handle.subscribe(CHANNEL_FOLLOW, FOLLOW_VERSION, condition).await {
			Ok(id) => {
				info!(bot = %self.name, subscription_id = %id, "subscribed to follows");
				self.follow_wanted = false;
			}
			// the next welcome sets follow_wanted again
			Err(SubscribeError::NotReady) => {
				debug!(bot = %self.name, "eventsub not ready; follow subscription deferred");
			}
			Err(e) => {
				error!(bot = %self.name, error = %e, "follow subscription failed");
				self.follow_wanted = false;
			}
		}
	}

	async fn stop(self) {
		info!(bot = %self.name, "stopping bot");
		self.chat.shutdown();
		if let Some(parts) = &self.eventsub {
			parts.handle.shutdown();
		}

		if let Err(e) = self.chat_task.await {
			warn!(bot = %self.name, error = %e, "chat task ended abnormally");
		}
		if let Some(parts) = self.eventsub
			&& let Err(e) = parts.task.await
		{
			warn!(bot = %self.name, error = %e, "eventsub task ended abnormally");
		}
		info!(bot = %self.name, "bot stopped");
	}
}

async fn next_session_event(parts: &mut Option<EventSubParts>) -> Option<SessionEvent> {
	match parts {
		Some(parts) => parts.events.recv().await,
		None => std::future::pending().await,
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex;
	use std::time::Duration;

	use async_trait::async_trait;
	use chirp_domain::UserLogin;
	use chirp_platform::SecretString;
	use chirp_platform::twitch::helix::CreateSubscriptionRequest;
	use futures_util::{SinkExt as _, StreamExt as _};
	use tokio::net::{TcpListener, TcpStream};
	use tokio::time::timeout;
	use tokio_tungstenite::WebSocketStream;
	use tokio_tungstenite::tungstenite::Message;

	use super::*;

	const WAIT: Duration = Duration::from_secs(10);

	#[derive(Default)]
	struct RecordingApi {
		created: Mutex<Vec<CreateSubscriptionRequest>>,
		deleted: Mutex<Vec<String>>,
	}

	#[async_trait]
	impl SubscriptionApi for RecordingApi {
		async fn create_subscription(&self, _token: &SecretString, req: &CreateSubscriptionRequest) -> anyhow::Result<String> {
			let mut created = self.created.lock().expect("lock");
			created.push(req.clone());
			Ok(format!("sub-{}", created.len()))
		}

		async fn delete_subscription(&self, _token: &SecretString, id: &str) -> anyhow::Result<()> {
			self.deleted.lock().expect("lock").push(id.to_string());
			Ok(())
		}
	}

	async fn local_listener() -> (TcpListener, String) {
		let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
		let url = format!("ws://{}", listener.local_addr().expect("addr"));
		(listener, url)
	}

	async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
		let (tcp, _) = timeout(WAIT, listener.accept()).await.expect("accept in time").expect("accept");
		tokio_tungstenite::accept_async(tcp).await.expect("ws handshake")
	}

	async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> Option<String> {
		loop {
			match timeout(WAIT, ws.next()).await.expect("frame in time")? {
				Ok(Message::Text(t)) => return Some(t.to_string()),
				Ok(Message::Close(_)) | Err(_) => return None,
				Ok(_) => continue,
			}
		}
	}

	async fn send_text(ws: &mut WebSocketStream<TcpStream>, text: &str) {
		ws.send(Message::Text(text.to_string().into())).await.expect("send");
	}

	fn chat_config(url: String) -> ChatConfig {
		let mut cfg = ChatConfig::new(
			UserLogin::new("ChirpBot").expect("login"),
			SecretString::new("oauth:abc"),
			ChannelName::new("bar").expect("channel"),
		);
		cfg.ws_url = url;
		cfg
	}

	async fn skip_handshake(ws: &mut WebSocketStream<TcpStream>) {
		for _ in 0..4 {
			next_text(ws).await.expect("handshake line");
		}
	}

	#[tokio::test]
	async fn commands_are_answered_in_chat() {
		let (listener, url) = local_listener().await;
		let commands = CommandRegistry::with_builtins("!", Vec::new(), Instant::now());
		let runner = BotRunner::new("test".to_string(), chat_config(url), None, commands);
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let task = tokio::spawn(runner.run(shutdown_rx));

		let mut chat = accept(&listener).await;
		skip_handshake(&mut chat).await;

		send_text(&mut chat, ":foo!foo@foo.tmi.twitch.tv PRIVMSG #bar :!ping\r\n").await;
		assert_eq!(next_text(&mut chat).await.as_deref(), Some("PRIVMSG #bar :pong\r\n"));

		send_text(&mut chat, ":foo!foo@foo.tmi.twitch.tv PRIVMSG #bar :!nope\r\n").await;
		assert_eq!(
			next_text(&mut chat).await.as_deref(),
			Some("PRIVMSG #bar :Couldn't find the command that you tried to use foo...\r\n")
		);

		shutdown_tx.send_replace(true);
		assert_eq!(next_text(&mut chat).await, None);
		drop(chat);
		timeout(WAIT, task).await.expect("runner stops").expect("join");
	}

	#[tokio::test]
	async fn follow_subscription_waits_for_room_bot_and_session() {
		let (chat_listener, chat_url) = local_listener().await;
		let (es_listener, es_url) = local_listener().await;
		let api = Arc::new(RecordingApi::default());

		let mut es_cfg = EventSubConfig::new(SecretString::new("abc"));
		es_cfg.ws_url = es_url;
		let commands = CommandRegistry::with_builtins("!", Vec::new(), Instant::now());
		let runner = BotRunner::new(
			"test".to_string(),
			chat_config(chat_url),
			Some((es_cfg, api.clone() as Arc<dyn SubscriptionApi>)),
			commands,
		);
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let task = tokio::spawn(runner.run(shutdown_rx));

		let mut chat = accept(&chat_listener).await;
		let mut es = accept(&es_listener).await;
		skip_handshake(&mut chat).await;

		let welcome = serde_json::json!({
			"metadata": {"message_id": "w", "message_type": "session_welcome", "message_timestamp": "2024-01-01T00:00:00Z"},
			"payload": {"session": {"id": "abc", "status": "connected", "keepalive_timeout_seconds": 30, "reconnect_url": null}}
		});
		send_text(&mut es, &welcome.to_string()).await;
		send_text(&mut chat, "@room-id=42 :tmi.twitch.tv ROOMSTATE #bar\r\n").await;

		tokio::time::sleep(Duration::from_millis(200)).await;
		assert!(api.created.lock().expect("lock").is_empty(), "bot id still unknown");

		send_text(&mut chat, "@display-name=ChirpBot;user-id=7 :tmi.twitch.tv GLOBALUSERSTATE\r\n").await;

		let created = timeout(WAIT, async {
			loop {
				if let Some(req) = api.created.lock().expect("lock").first().cloned() {
					return req;
				}
				tokio::time::sleep(Duration::from_millis(20)).await;
			}
		})
		.await
		.expect("follow subscription created");

		assert_eq!(created.kind, CHANNEL_FOLLOW);
		assert_eq!(created.version, "2");
		assert_eq!(created.transport.session_id, "abc");
		assert_eq!(
			created.condition,
			serde_json::json!({"broadcaster_user_id": "42", "moderator_user_id": "7"})
		);

		shutdown_tx.send_replace(true);
		assert_eq!(next_text(&mut es).await, None);
		drop(es);
		assert_eq!(next_text(&mut chat).await, None);
		drop(chat);
		timeout(WAIT, task).await.expect("runner stops").expect("join");

		assert_eq!(*api.deleted.lock().expect("lock"), vec!["sub-1".to_string()]);
		assert_eq!(api.created.lock().expect("lock").len(), 1);
	}
}
