#![forbid(unsafe_code)]

use std::time::SystemTime;

use anyhow::Context;
use serde::Deserialize;
use serde::de::DeserializeOwned;

pub const CHANNEL_FOLLOW: &str = "channel.follow";
pub const STREAM_ONLINE: &str = "stream.online";
pub const STREAM_OFFLINE: &str = "stream.offline";
pub const CHANNEL_RAID: &str = "channel.raid";

/// EventSub metadata (present on all WebSocket messages).
#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadata {
	#[serde(default)]
	pub(crate) message_id: String,
	pub(crate) message_type: String,
	#[serde(default)]
	pub(crate) message_timestamp: Option<String>,
	#[serde(default)]
	pub(crate) subscription_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
	metadata: EventSubMetadata,
	#[serde(default)]
	payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SessionPayload {
	session: SessionInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SessionInfo {
	pub(crate) id: String,
	#[serde(default)]
	pub(crate) keepalive_timeout_seconds: Option<u64>,
	#[serde(default)]
	pub(crate) reconnect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NotificationPayload {
	subscription: EventSubSubscription,
	#[serde(default)]
	event: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RevocationPayload {
	subscription: EventSubSubscription,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct EventSubSubscription {
	pub(crate) id: String,
	#[serde(rename = "type")]
	pub(crate) kind: String,
	#[serde(default)]
	pub(crate) version: String,
	#[serde(default)]
	pub(crate) status: Option<String>,
}

/// One delivered event, payload left as JSON until a consumer asks for a type.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
	pub message_id: String,
	pub subscription_type: String,
	pub subscription_id: String,
	pub subscription_version: String,
	pub timestamp: Option<SystemTime>,
	pub event: serde_json::Value,
}

impl Notification {
	pub fn decode<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
		serde_json::from_value(self.event.clone())
			.with_context(|| format!("decode {} event payload", self.subscription_type))
	}
}

#[derive(Debug)]
pub(crate) enum Inbound {
	Welcome(SessionInfo),
	Reconnect(SessionInfo),
	Keepalive,
	Notification(Notification),
	Revocation(EventSubSubscription),
	Other(String),
}

pub(crate) fn parse_message(raw_json: &str) -> anyhow::Result<Inbound> {
	let env: Envelope = serde_json::from_str(raw_json).context("parse EventSub envelope")?;
	let kind = env.metadata.message_type.as_str();

	let inbound = match kind {
		"session_welcome" => {
			let p: SessionPayload = serde_json::from_value(env.payload).context("parse EventSub welcome")?;
			Inbound::Welcome(p.session)
		}
		"session_reconnect" => {
			let p: SessionPayload = serde_json::from_value(env.payload).context("parse EventSub reconnect")?;
			Inbound::Reconnect(p.session)
		}
		"session_keepalive" => Inbound::Keepalive,
		"notification" => {
			let p: NotificationPayload = serde_json::from_value(env.payload).context("parse EventSub notification")?;
			let timestamp = match env.metadata.message_timestamp.as_deref() {
				Some(ts) => Some(parse_message_timestamp(ts)?),
				None => None,
			};
			Inbound::Notification(Notification {
				message_id: env.metadata.message_id,
				subscription_type: env.metadata.subscription_type.unwrap_or_else(|| p.subscription.kind.clone()),
				subscription_id: p.subscription.id,
				subscription_version: p.subscription.version,
				timestamp,
				event: p.event,
			})
		}
		"revocation" => {
			let p: RevocationPayload = serde_json::from_value(env.payload).context("parse EventSub revocation")?;
			Inbound::Revocation(p.subscription)
		}
		other => Inbound::Other(other.to_string()),
	};
	Ok(inbound)
}

pub(crate) fn parse_message_timestamp(ts: &str) -> anyhow::Result<SystemTime> {
	let dt = chrono::DateTime::parse_from_rfc3339(ts).context("parse EventSub RFC3339 timestamp")?;
	Ok(SystemTime::from(dt.with_timezone(&chrono::Utc)))
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChannelFollowEvent {
	pub user_id: String,
	pub user_login: String,
	pub user_name: String,
	pub broadcaster_user_id: String,
	pub broadcaster_user_login: String,
	#[serde(default)]
	pub followed_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StreamOnlineEvent {
	pub id: String,
	pub broadcaster_user_id: String,
	pub broadcaster_user_login: String,
	#[serde(rename = "type")]
	pub kind: String,
	pub started_at: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StreamOfflineEvent {
	pub broadcaster_user_id: String,
	pub broadcaster_user_login: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChannelRaidEvent {
	pub from_broadcaster_user_id: String,
	pub from_broadcaster_user_login: String,
	pub from_broadcaster_user_name: String,
	pub to_broadcaster_user_id: String,
	pub to_broadcaster_user_login: String,
	pub viewers: u64,
}
