#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chirp_domain::{ChannelName, ConnectionId, UserLogin};
use chirp_util::backoff::ReconnectPolicy;
use futures_util::{SinkExt as _, StreamExt as _};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};
use tungstenite::Message;
use tungstenite::protocol::frame::coding::CloseCode;
use url::Url;

use super::events::{ChatEvent, ChatEventKind};
use super::outbound::{FlushOutcome, LineSink, OutboundConfig, OutboundQueue};
use super::parser::{LineOutcome, ParserContext, parse_line};
use crate::dispatch::{Dispatcher, Listener, ListenerId};
use crate::ws::{BoxWs, WsConnector, close_socket, default_connector};
use crate::SecretString;

pub const DEFAULT_IRC_WS_URL: &str = "wss://irc-ws.chat.twitch.tv:443";

const CAPABILITIES: &str = "CAP REQ :twitch.tv/tags twitch.tv/commands";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct ChatConfig {
	pub ws_url: String,
	pub username: UserLogin,
	/// Chat OAuth token, with or without the `oauth:` prefix.
	pub token: SecretString,
	pub channel: ChannelName,
	/// Log every outbound line.
	pub chat_show: bool,
	pub reconnect: ReconnectPolicy,
	pub outbound: OutboundConfig,
	/// How long to wait for the peer to finish a close handshake.
	pub close_timeout: Duration,
	pub ws_connector: Option<WsConnector>,
}

impl fmt::Debug for ChatConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ChatConfig")
			.field("ws_url", &self.ws_url)
			.field("username", &self.username)
			.field("token", &self.token)
			.field("channel", &self.channel)
			.field("chat_show", &self.chat_show)
			.field("reconnect", &self.reconnect)
			.field("outbound", &self.outbound)
			.finish_non_exhaustive()
	}
}

impl ChatConfig {
	pub fn new(username: UserLogin, token: SecretString, channel: ChannelName) -> Self {
		Self {
			ws_url: DEFAULT_IRC_WS_URL.to_string(),
			username,
			token,
			channel,
			chat_show: false,
			reconnect: ReconnectPolicy::linear(Duration::from_secs(1), Duration::from_secs(60), 10),
			outbound: OutboundConfig::default(),
			close_timeout: Duration::from_secs(5),
			ws_connector: None,
		}
	}

	fn pass_line(&self) -> String {
		let token = self.token.expose().trim();
		if token.starts_with("oauth:") {
			format!("PASS {token}")
		} else {
			format!("PASS oauth:{token}")
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatState {
	Disconnected,
	Connecting,
	Open,
	ShuttingDown,
}

#[derive(Debug)]
pub enum ChatControl {
	Say(String),
	/// Used from the next connection on.
	UpdateToken(SecretString),
	Shutdown,
}

/// Cheap clonable front for a running [`ChatTransport`].
#[derive(Clone)]
pub struct ChatHandle {
	control_tx: mpsc::UnboundedSender<ChatControl>,
	events: Arc<Dispatcher<ChatEventKind, ChatEvent>>,
	state_rx: watch::Receiver<ChatState>,
}

impl ChatHandle {
	/// Queue text for the channel. Returns false once the transport is gone.
	pub fn say(&self, text: impl Into<String>) -> bool {
		self.control_tx.send(ChatControl::Say(text.into())).is_ok()
	}

	pub fn update_token(&self, token: SecretString) -> bool {
		self.control_tx.send(ChatControl::UpdateToken(token)).is_ok()
	}

	pub fn shutdown(&self) -> bool {
		self.control_tx.send(ChatControl::Shutdown).is_ok()
	}

	pub fn listen(&self, kind: ChatEventKind) -> Listener<ChatEvent> {
		self.events.listen(kind)
	}

	pub fn listen_all(&self) -> Listener<ChatEvent> {
		self.events.listen_all()
	}

	pub fn unlisten(&self, id: ListenerId) -> bool {
		self.events.unlisten(id)
	}

	pub fn state(&self) -> ChatState {
		*self.state_rx.borrow()
	}

	pub fn watch_state(&self) -> watch::Receiver<ChatState> {
		self.state_rx.clone()
	}
}

enum SessionEnd {
	Shutdown,
	Closed(String),
}

enum Control {
	Continue { queued: bool },
	Shutdown,
}

/// Owns the chat socket. Reconnects with linear backoff until shut down or
/// out of attempts.
pub struct ChatTransport {
	cfg: ChatConfig,
	connector: WsConnector,
	ctx: ParserContext,
	queue: OutboundQueue,
	events: Arc<Dispatcher<ChatEventKind, ChatEvent>>,
	state_tx: watch::Sender<ChatState>,
	control_rx: mpsc::UnboundedReceiver<ChatControl>,
	attempts: u32,
	shutting_down: bool,
	retry_pending: bool,
}

impl ChatTransport {
	pub fn new(cfg: ChatConfig) -> (Self, ChatHandle) {
		let (control_tx, control_rx) = mpsc::unbounded_channel();
		let (state_tx, state_rx) = watch::channel(ChatState::Disconnected);
		let events = Arc::new(Dispatcher::new());
		let connector = cfg.ws_connector.clone().unwrap_or_else(default_connector);
		let ctx = ParserContext {
			bot_login: cfg.username.clone(),
			channel: cfg.channel.clone(),
		};
		let queue = OutboundQueue::new(cfg.outbound.clone());

		let handle = ChatHandle {
			control_tx,
			events: events.clone(),
			state_rx,
		};
		let transport = Self {
			cfg,
			connector,
			ctx,
			queue,
			events,
			state_tx,
			control_rx,
			attempts: 0,
			shutting_down: false,
			retry_pending: false,
		};
		(transport, handle)
	}

	/// Build and start on the current runtime.
	pub fn spawn(cfg: ChatConfig) -> (ChatHandle, JoinHandle<()>) {
		let (transport, handle) = Self::new(cfg);
		(handle, tokio::spawn(transport.run()))
	}

	pub async fn run(mut self) {
		loop {
			if self.shutting_down {
				break;
			}
			self.set_state(ChatState::Connecting);

			let end = match self.connect().await {
				Ok(ws) => self.drive(ws).await,
				Err(e) => SessionEnd::Closed(format!("{e:#}")),
			};

			match end {
				SessionEnd::Shutdown => break,
				SessionEnd::Closed(reason) => {
					self.set_state(ChatState::Disconnected);
					if self.shutting_down {
						break;
					}
					warn!(channel = %self.cfg.channel, %reason, "chat connection lost");
					if !self.wait_before_reconnect().await {
						break;
					}
				}
			}
		}
		debug!(channel = %self.cfg.channel, "chat transport stopped");
	}

	async fn connect(&self) -> anyhow::Result<BoxWs> {
		let url = Url::parse(&self.cfg.ws_url).with_context(|| format!("parse chat url {}", self.cfg.ws_url))?;
		tokio::time::timeout(CONNECT_TIMEOUT, (self.connector)(url))
			.await
			.context("chat connect timed out")?
	}

	async fn handshake(&self, ws: &mut BoxWs) -> anyhow::Result<()> {
		let lines = [
			CAPABILITIES.to_string(),
			self.cfg.pass_line(),
			format!("NICK {}", self.cfg.username),
			format!("JOIN {}", self.cfg.channel.irc_target()),
		];
		for line in &lines {
			send_line(ws, line).await.context("chat handshake")?;
		}
		Ok(())
	}

	async fn drive(&mut self, mut ws: BoxWs) -> SessionEnd {
		if let Err(e) = self.handshake(&mut ws).await {
			return SessionEnd::Closed(format!("{e:#}"));
		}

		let connection_id = ConnectionId::new_v4();
		self.attempts = 0;
		self.set_state(ChatState::Open);
		info!(channel = %self.cfg.channel, %connection_id, "chat connected");
		self.emit(ChatEvent::Connected { connection_id });

		let target = self.cfg.channel.irc_target();
		let mut next_flush = self.resume_flush();

		loop {
			let flush_at = next_flush;
			tokio::select! {
				cmd = self.control_rx.recv() => match self.apply_control(cmd) {
					Control::Continue { queued } => {
						if queued && next_flush.is_none() {
							next_flush = Some(Instant::now());
						}
					}
					Control::Shutdown => {
						close_socket(&mut ws, CloseCode::Normal, "Graceful shutdown", self.cfg.close_timeout).await;
						return SessionEnd::Shutdown;
					}
				},
				frame = ws.next() => match frame {
					Some(Ok(Message::Text(text))) => {
						for line in text.lines().filter(|l| !l.trim().is_empty()) {
							match parse_line(line, &self.ctx) {
								LineOutcome::Event(ev) => self.emit(ev),
								LineOutcome::Reply(reply) => {
									if let Err(e) = send_line(&mut ws, &reply).await {
										return SessionEnd::Closed(format!("{e:#}"));
									}
								}
								LineOutcome::Reconnect => {
									close_socket(&mut ws, CloseCode::Normal, "Reconnect requested", self.cfg.close_timeout).await;
									return SessionEnd::Closed("server requested reconnect".to_string());
								}
								LineOutcome::Ignored(_) | LineOutcome::Unhandled => {}
							}
						}
					}
					Some(Ok(Message::Ping(payload))) => {
						if let Err(e) = ws.send(Message::Pong(payload)).await {
							return SessionEnd::Closed(format!("pong failed: {e}"));
						}
					}
					Some(Ok(Message::Close(frame))) => {
						let reason = frame.map_or_else(|| "no close frame".to_string(), |f| format!("{} {}", u16::from(f.code), f.reason));
						return SessionEnd::Closed(format!("closed by server: {reason}"));
					}
					Some(Ok(_)) => {}
					Some(Err(e)) => return SessionEnd::Closed(format!("read failed: {e}")),
					None => return SessionEnd::Closed("stream ended".to_string()),
				},
				_ = sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
					let mut sink = PrivmsgSink {
						ws: &mut ws,
						target: &target,
						bot: self.cfg.username.as_str(),
						chat_show: self.cfg.chat_show,
					};
					match self.queue.flush(Instant::now(), &mut sink).await {
						FlushOutcome::Sent { next_in } => next_flush = next_in.map(|d| Instant::now() + d),
						FlushOutcome::Idle => next_flush = None,
						FlushOutcome::RateLimited { retry_in } => next_flush = Some(Instant::now() + retry_in),
						FlushOutcome::WriteFailed { .. } => {
							self.retry_pending = true;
							return SessionEnd::Closed("chat write failed".to_string());
						}
					}
				}
			}
		}
	}

	/// When a fresh socket should first flush leftovers from a previous one.
	fn resume_flush(&mut self) -> Option<Instant> {
		if self.queue.is_empty() {
			return None;
		}
		let delay = if std::mem::take(&mut self.retry_pending) {
			self.queue.config().retry_delay
		} else {
			Duration::ZERO
		};
		Some(Instant::now() + delay)
	}

	/// Returns false when the transport should stop instead.
	async fn wait_before_reconnect(&mut self) -> bool {
		let policy = self.cfg.reconnect;
		if policy.is_exhausted(self.attempts) {
			error!(channel = %self.cfg.channel, attempts = self.attempts, "chat reconnect attempts exhausted; giving up");
			self.emit(ChatEvent::Disconnected {
				reason: format!("gave up after {} reconnect attempts", self.attempts),
			});
			return false;
		}

		self.attempts += 1;
		let delay = policy.delay_for(self.attempts).unwrap_or(policy.max_delay);
		metrics::counter!("chirp_chat_reconnects_total").increment(1);
		info!(
			channel = %self.cfg.channel,
			attempt = self.attempts,
			delay_ms = delay.as_millis() as u64,
			"chat reconnect scheduled"
		);

		let deadline = Instant::now() + delay;
		loop {
			tokio::select! {
				_ = sleep_until(deadline) => return true,
				cmd = self.control_rx.recv() => {
					if let Control::Shutdown = self.apply_control(cmd) {
						return false;
					}
				}
			}
		}
	}

	fn apply_control(&mut self, cmd: Option<ChatControl>) -> Control {
		match cmd {
			Some(ChatControl::Say(text)) => Control::Continue {
				queued: self.queue.enqueue(&text) > 0,
			},
			Some(ChatControl::UpdateToken(token)) => {
				self.cfg.token = token;
				info!(channel = %self.cfg.channel, "chat token updated");
				Control::Continue { queued: false }
			}
			Some(ChatControl::Shutdown) | None => {
				self.shutting_down = true;
				self.set_state(ChatState::ShuttingDown);
				info!(channel = %self.cfg.channel, "chat transport shutting down");
				Control::Shutdown
			}
		}
	}

	fn set_state(&self, state: ChatState) {
		self.state_tx.send_replace(state);
	}

	fn emit(&self, event: ChatEvent) {
		self.events.emit(&event.kind(), event);
	}
}

async fn send_line(ws: &mut BoxWs, line: &str) -> anyhow::Result<()> {
	ws.send(Message::Text(format!("{line}\r\n").into()))
		.await
		.context("write chat line")
}

struct PrivmsgSink<'a> {
	ws: &'a mut BoxWs,
	target: &'a str,
	bot: &'a str,
	chat_show: bool,
}

impl LineSink for PrivmsgSink<'_> {
	async fn write_line(&mut self, line: &str) -> anyhow::Result<()> {
		if self.chat_show {
			info!(channel = %self.target, "{}: {}", self.bot, line);
		}
		send_line(self.ws, &format!("PRIVMSG {} :{}", self.target, line)).await
	}
}
