#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chirp_util::backoff::ReconnectPolicy;
use futures_util::{SinkExt as _, StreamExt as _};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, error, info, warn};
use tungstenite::Message;
use tungstenite::protocol::frame::coding::CloseCode;
use url::Url;

use super::messages::{Inbound, Notification, parse_message};
use crate::SecretString;
use crate::dispatch::{Dispatcher, Listener, ListenerId};
use crate::twitch::helix::{CreateSubscriptionRequest, SubscriptionApi};
use crate::ws::{BoxWs, WsConnector, close_socket, default_connector};

pub const DEFAULT_EVENTSUB_WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct EventSubConfig {
	pub ws_url: String,
	/// Bearer token for subscription calls. Rotate with [`EventSubHandle::update_token`].
	pub token: SecretString,
	pub reconnect: ReconnectPolicy,
	/// Extra wait after the remote end vanished without a close frame.
	pub abnormal_close_grace: Duration,
	/// Used until a welcome announces its own keepalive.
	pub default_keepalive: Duration,
	pub keepalive_slack: Duration,
	pub close_timeout: Duration,
	pub ws_connector: Option<WsConnector>,
}

impl fmt::Debug for EventSubConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EventSubConfig")
			.field("ws_url", &self.ws_url)
			.field("token", &self.token)
			.field("reconnect", &self.reconnect)
			.field("abnormal_close_grace", &self.abnormal_close_grace)
			.field("default_keepalive", &self.default_keepalive)
			.finish_non_exhaustive()
	}
}

impl EventSubConfig {
	pub fn new(token: SecretString) -> Self {
		Self {
			ws_url: DEFAULT_EVENTSUB_WS_URL.to_string(),
			token,
			reconnect: ReconnectPolicy::exponential(Duration::from_secs(1), Duration::from_secs(30), 5),
			abnormal_close_grace: Duration::from_secs(60),
			default_keepalive: Duration::from_secs(10),
			keepalive_slack: Duration::from_secs(5),
			close_timeout: Duration::from_secs(5),
			ws_connector: None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Connecting,
	AwaitingWelcome,
	Ready,
	Disconnected,
	ShuttingDown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
	/// `resumed` is true when a migrated session kept its id, so existing
	/// subscriptions still apply.
	Ready {
		session_id: String,
		resumed: bool,
	},
	Notification(Notification),
	Revoked {
		subscription_type: String,
		subscription_id: String,
		status: Option<String>,
	},
	/// Only raised once reconnecting has been given up.
	Disconnected {
		reason: String,
	},
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionEventKey {
	Ready,
	/// Keyed by subscription type, e.g. `channel.follow`.
	Notification(String),
	Revoked,
	Disconnected,
}

impl SessionEvent {
	pub fn key(&self) -> SessionEventKey {
		match self {
			SessionEvent::Ready { .. } => SessionEventKey::Ready,
			SessionEvent::Notification(n) => SessionEventKey::Notification(n.subscription_type.clone()),
			SessionEvent::Revoked { .. } => SessionEventKey::Revoked,
			SessionEvent::Disconnected { .. } => SessionEventKey::Disconnected,
		}
	}
}

#[derive(Debug, Error)]
pub enum SubscribeError {
	#[error("event session has no ready session id")]
	NotReady,
	#[error("subscription rejected: {0:#}")]
	Rejected(anyhow::Error),
}

struct Shared {
	session_id: Option<String>,
	token: SecretString,
	/// Subscription type to server-assigned id.
	subscriptions: HashMap<String, String>,
}

#[derive(Debug)]
enum SessionControl {
	Shutdown,
}

#[derive(Clone)]
pub struct EventSubHandle {
	control_tx: mpsc::UnboundedSender<SessionControl>,
	events: Arc<Dispatcher<SessionEventKey, SessionEvent>>,
	shared: Arc<Mutex<Shared>>,
	api: Arc<dyn SubscriptionApi>,
	state_rx: watch::Receiver<SessionState>,
}

impl EventSubHandle {
	/// Register `kind` for delivery on the current session.
	///
	/// Not retried on failure; the caller decides what to do.
	pub async fn subscribe(
		&self,
		kind: &str,
		version: &str,
		condition: serde_json::Value,
	) -> Result<String, SubscribeError> {
		let (session_id, token) = {
			let shared = self.shared.lock();
			let session_id = shared.session_id.clone().ok_or(SubscribeError::NotReady)?;
			(session_id, shared.token.clone())
		};

		let req = CreateSubscriptionRequest::websocket(kind, version, condition, &session_id);
		match self.api.create_subscription(&token, &req).await {
			Ok(id) => {
				info!(kind, version, subscription_id = %id, %session_id, "EventSub subscription created");
				self.shared.lock().subscriptions.insert(kind.to_string(), id.clone());
				Ok(id)
			}
			Err(e) => {
				warn!(kind, version, error = %format!("{e:#}"), "EventSub subscription failed");
				Err(SubscribeError::Rejected(e))
			}
		}
	}

	pub async fn unsubscribe(&self, id: &str) -> anyhow::Result<()> {
		unsubscribe_one(self.api.as_ref(), &self.shared, id).await
	}

	/// Best effort. Returns how many deletions failed.
	pub async fn unsubscribe_all(&self) -> usize {
		unsubscribe_all(self.api.as_ref(), &self.shared).await
	}

	/// Takes effect on the next subscription call. Never reconnects.
	pub fn update_token(&self, token: SecretString) {
		self.shared.lock().token = token;
		info!("EventSub token updated");
	}

	pub fn session_id(&self) -> Option<String> {
		self.shared.lock().session_id.clone()
	}

	pub fn subscriptions(&self) -> HashMap<String, String> {
		self.shared.lock().subscriptions.clone()
	}

	pub fn listen(&self, key: SessionEventKey) -> Listener<SessionEvent> {
		self.events.listen(key)
	}

	pub fn listen_notifications(&self, kind: &str) -> Listener<SessionEvent> {
		self.events.listen(SessionEventKey::Notification(kind.to_string()))
	}

	pub fn listen_all(&self) -> Listener<SessionEvent> {
		self.events.listen_all()
	}

	pub fn unlisten(&self, id: ListenerId) -> bool {
		self.events.unlisten(id)
	}

	pub fn state(&self) -> SessionState {
		*self.state_rx.borrow()
	}

	pub fn watch_state(&self) -> watch::Receiver<SessionState> {
		self.state_rx.clone()
	}

	/// Unsubscribes everything, then closes the socket.
	pub fn shutdown(&self) -> bool {
		self.control_tx.send(SessionControl::Shutdown).is_ok()
	}
}

async fn unsubscribe_one(api: &dyn SubscriptionApi, shared: &Mutex<Shared>, id: &str) -> anyhow::Result<()> {
	let token = shared.lock().token.clone();
	api.delete_subscription(&token, id)
		.await
		.with_context(|| format!("delete EventSub subscription {id}"))?;
	shared.lock().subscriptions.retain(|_, v| v != id);
	Ok(())
}

async fn unsubscribe_all(api: &dyn SubscriptionApi, shared: &Mutex<Shared>) -> usize {
	let ids: Vec<String> = shared.lock().subscriptions.values().cloned().collect();
	let mut failed = 0;
	for id in ids {
		if let Err(e) = unsubscribe_one(api, shared, &id).await {
			failed += 1;
			warn!(subscription_id = %id, error = %format!("{e:#}"), "EventSub unsubscribe failed");
		}
	}
	failed
}

enum SessionEnd {
	Shutdown,
	/// Server moved us; reconnect right away.
	Migrate,
	Dropped { abnormal: bool, reason: String },
}

/// Owns the EventSub socket. Reconnects with exponential backoff until shut
/// down or out of attempts.
pub struct EventSubSession {
	cfg: EventSubConfig,
	connector: WsConnector,
	api: Arc<dyn SubscriptionApi>,
	shared: Arc<Mutex<Shared>>,
	events: Arc<Dispatcher<SessionEventKey, SessionEvent>>,
	state_tx: watch::Sender<SessionState>,
	control_rx: mpsc::UnboundedReceiver<SessionControl>,
	attempts: u32,
	shutting_down: bool,
	reconnect_hint: Option<String>,
	next_url: Option<String>,
}

impl EventSubSession {
	pub fn new(cfg: EventSubConfig, api: Arc<dyn SubscriptionApi>) -> (Self, EventSubHandle) {
		let (control_tx, control_rx) = mpsc::unbounded_channel();
		let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
		let events = Arc::new(Dispatcher::new());
		let shared = Arc::new(Mutex::new(Shared {
			session_id: None,
			token: cfg.token.clone(),
			subscriptions: HashMap::new(),
		}));
		let connector = cfg.ws_connector.clone().unwrap_or_else(default_connector);

		let handle = EventSubHandle {
			control_tx,
			events: events.clone(),
			shared: shared.clone(),
			api: api.clone(),
			state_rx,
		};
		let session = Self {
			cfg,
			connector,
			api,
			shared,
			events,
			state_tx,
			control_rx,
			attempts: 0,
			shutting_down: false,
			reconnect_hint: None,
			next_url: None,
		};
		(session, handle)
	}

	pub fn spawn(cfg: EventSubConfig, api: Arc<dyn SubscriptionApi>) -> (EventSubHandle, JoinHandle<()>) {
		let (session, handle) = Self::new(cfg, api);
		(handle, tokio::spawn(session.run()))
	}

	pub async fn run(mut self) {
		loop {
			if self.shutting_down {
				break;
			}
			self.set_state(SessionState::Connecting);

			let url = self.next_url.take().unwrap_or_else(|| self.cfg.ws_url.clone());
			let end = match self.connect(&url).await {
				Ok(ws) => self.drive(ws).await,
				Err(e) => SessionEnd::Dropped {
					abnormal: false,
					reason: format!("{e:#}"),
				},
			};
			self.shared.lock().session_id = None;

			match end {
				SessionEnd::Shutdown => break,
				SessionEnd::Migrate => {
					info!(url = self.next_url.as_deref().unwrap_or(&self.cfg.ws_url), "EventSub migrating session");
				}
				SessionEnd::Dropped { abnormal, reason } => {
					self.set_state(SessionState::Disconnected);
					if self.shutting_down {
						break;
					}
					warn!(%reason, abnormal, "EventSub connection lost");

					if abnormal {
						info!(
							grace_secs = self.cfg.abnormal_close_grace.as_secs(),
							"EventSub closed abnormally; waiting before reconnecting"
						);
						if !self.pause(self.cfg.abnormal_close_grace).await {
							break;
						}
					}
					if !self.wait_before_reconnect().await {
						break;
					}
				}
			}
		}
		debug!("EventSub session stopped");
	}

	async fn connect(&self, url: &str) -> anyhow::Result<BoxWs> {
		let url = Url::parse(url).with_context(|| format!("parse EventSub url {url}"))?;
		tokio::time::timeout(CONNECT_TIMEOUT, (self.connector)(url))
			.await
			.context("EventSub connect timed out")?
	}

	async fn drive(&mut self, mut ws: BoxWs) -> SessionEnd {
		self.attempts = 0;
		self.set_state(SessionState::AwaitingWelcome);

		let slack = self.cfg.keepalive_slack;
		let mut keepalive = self.cfg.default_keepalive;
		let mut deadline = Instant::now() + keepalive + slack;

		loop {
			tokio::select! {
				_cmd = self.control_rx.recv() => {
					self.begin_shutdown().await;
					close_socket(&mut ws, CloseCode::Normal, "Graceful shutdown", self.cfg.close_timeout).await;
					return SessionEnd::Shutdown;
				}
				frame = ws.next() => {
					match frame {
						Some(Ok(Message::Text(text))) => match parse_message(&text) {
							Ok(inbound) => {
								if self.on_message(inbound, &mut keepalive) {
									close_socket(&mut ws, CloseCode::Normal, "Session reconnect", self.cfg.close_timeout).await;
									return SessionEnd::Migrate;
								}
							}
							Err(e) => error!(error = %format!("{e:#}"), "failed to parse EventSub message"),
						},
						Some(Ok(Message::Ping(payload))) => {
							if let Err(e) = ws.send(Message::Pong(payload)).await {
								return SessionEnd::Dropped {
									abnormal: true,
									reason: format!("pong failed: {e}"),
								};
							}
						}
						Some(Ok(Message::Close(frame))) => {
							let abnormal = frame.as_ref().is_some_and(|f| f.code == CloseCode::Abnormal);
							let reason = frame.map_or_else(|| "no close frame".to_string(), |f| format!("{} {}", u16::from(f.code), f.reason));
							return SessionEnd::Dropped {
								abnormal,
								reason: format!("closed by server: {reason}"),
							};
						}
						Some(Ok(_)) => {}
						Some(Err(e)) => {
							return SessionEnd::Dropped {
								abnormal: true,
								reason: format!("read failed: {e}"),
							};
						}
						None => {
							return SessionEnd::Dropped {
								abnormal: true,
								reason: "stream ended without a close frame".to_string(),
							};
						}
					}
					deadline = Instant::now() + keepalive + slack;
				}
				_ = sleep_until(deadline) => {
					warn!(keepalive_secs = keepalive.as_secs(), "EventSub keepalive missed; reconnecting");
					close_socket(&mut ws, CloseCode::Normal, "Keepalive timeout", self.cfg.close_timeout).await;
					return SessionEnd::Dropped {
						abnormal: false,
						reason: "keepalive timeout".to_string(),
					};
				}
			}
		}
	}

	/// Returns true when the server asked us to move to another socket.
	fn on_message(&mut self, inbound: Inbound, keepalive: &mut Duration) -> bool {
		match inbound {
			Inbound::Welcome(session) => {
				if let Some(secs) = session.keepalive_timeout_seconds.filter(|s| *s > 0) {
					*keepalive = Duration::from_secs(secs);
				}
				let resumed = self.reconnect_hint.take().is_some_and(|hint| hint == session.id);
				{
					let mut shared = self.shared.lock();
					shared.session_id = Some(session.id.clone());
					if !resumed {
						shared.subscriptions.clear();
					}
				}
				self.set_state(SessionState::Ready);
				info!(session_id = %session.id, resumed, "EventSub session ready");
				self.emit(SessionEvent::Ready {
					session_id: session.id,
					resumed,
				});
				false
			}
			Inbound::Reconnect(session) => {
				info!(session_id = %session.id, "EventSub reconnect requested");
				self.reconnect_hint = Some(session.id);
				self.next_url = session.reconnect_url;
				true
			}
			Inbound::Keepalive => {
				debug!("EventSub keepalive");
				false
			}
			Inbound::Notification(n) => {
				metrics::counter!("chirp_eventsub_notifications_total", "type" => n.subscription_type.clone()).increment(1);
				debug!(kind = %n.subscription_type, message_id = %n.message_id, "EventSub notification");
				self.emit(SessionEvent::Notification(n));
				false
			}
			Inbound::Revocation(sub) => {
				warn!(kind = %sub.kind, subscription_id = %sub.id, status = ?sub.status, version = %sub.version, "EventSub subscription revoked");
				self.shared.lock().subscriptions.retain(|_, v| *v != sub.id);
				self.emit(SessionEvent::Revoked {
					subscription_type: sub.kind,
					subscription_id: sub.id,
					status: sub.status,
				});
				false
			}
			Inbound::Other(kind) => {
				info!(message_type = %kind, "unhandled EventSub message");
				false
			}
		}
	}

	/// Sleep unless shutdown arrives first. Returns false on shutdown.
	async fn pause(&mut self, d: Duration) -> bool {
		tokio::select! {
			_ = sleep(d) => true,
			_cmd = self.control_rx.recv() => {
				self.begin_shutdown().await;
				false
			}
		}
	}

	/// Best-effort removal of every subscription. Whatever could not be
	/// deleted is forgotten, since no session will deliver it again.
	async fn begin_shutdown(&mut self) {
		self.shutting_down = true;
		self.set_state(SessionState::ShuttingDown);
		info!("EventSub session shutting down");
		let failed = unsubscribe_all(self.api.as_ref(), &self.shared).await;
		if failed > 0 {
			warn!(failed, "some EventSub subscriptions could not be removed");
			self.shared.lock().subscriptions.clear();
		}
	}

	async fn wait_before_reconnect(&mut self) -> bool {
		let policy = self.cfg.reconnect;
		if policy.is_exhausted(self.attempts) {
			error!(attempts = self.attempts, "EventSub reconnect attempts exhausted; giving up");
			self.emit(SessionEvent::Disconnected {
				reason: format!("gave up after {} reconnect attempts", self.attempts),
			});
			return false;
		}

		self.attempts += 1;
		let delay = policy.delay_for(self.attempts).unwrap_or(policy.max_delay);
		metrics::counter!("chirp_eventsub_reconnects_total").increment(1);
		info!(attempt = self.attempts, delay_ms = delay.as_millis() as u64, "EventSub reconnect scheduled");
		self.pause(delay).await
	}

	fn set_state(&self, state: SessionState) {
		self.state_tx.send_replace(state);
	}

	fn emit(&self, event: SessionEvent) {
		self.events.emit(&event.key(), event);
	}
}
