#![forbid(unsafe_code)]

use std::fmt;

use chirp_domain::{ChannelName, ConnectionId, RoomId, UserId};

use super::privileges::Privileges;
use super::tags::{Badges, Tags};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
	/// Login from the `nick!user@host` prefix (the `user` part).
	pub username: String,
	/// The `nick` part of the prefix.
	pub identity: String,
	pub host: String,
	pub channel: ChannelName,
	pub text: String,
	pub tags: Tags,
	pub privileges: Privileges,
}

impl ChatMessage {
	pub fn display_name(&self) -> &str {
		self.tags.text("display-name").unwrap_or(&self.username)
	}

	pub fn user_id(&self) -> Option<UserId> {
		self.tags.text("user-id").and_then(|s| s.parse().ok())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanDuration {
	Permanent,
	/// Seconds when the server told us.
	Timeout(Option<u64>),
}

impl fmt::Display for BanDuration {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			BanDuration::Permanent => f.write_str("permanent"),
			BanDuration::Timeout(Some(secs)) => write!(f, "{secs}s"),
			BanDuration::Timeout(None) => f.write_str("unknown"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEvent {
	pub username: String,
	pub channel: ChannelName,
	pub duration: BanDuration,
	pub message: String,
	pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaidEvent {
	pub username: String,
	pub channel: ChannelName,
	pub viewers: Option<u64>,
	pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
	Message(ChatMessage),
	Ban(BanEvent),
	Raid(RaidEvent),
	RoomState { channel: ChannelName, room_id: RoomId },
	/// The server told us our own user id.
	BotUserState { user_id: UserId },
	UserState { channel: ChannelName, badges: Badges },
	Connected { connection_id: ConnectionId },
	/// Only raised once reconnecting has been given up.
	Disconnected { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatEventKind {
	Message,
	Ban,
	Raid,
	RoomState,
	BotUserState,
	UserState,
	Connected,
	Disconnected,
}

impl ChatEvent {
	pub fn kind(&self) -> ChatEventKind {
		match self {
			ChatEvent::Message(_) => ChatEventKind::Message,
			ChatEvent::Ban(_) => ChatEventKind::Ban,
			ChatEvent::Raid(_) => ChatEventKind::Raid,
			ChatEvent::RoomState { .. } => ChatEventKind::RoomState,
			ChatEvent::BotUserState { .. } => ChatEventKind::BotUserState,
			ChatEvent::UserState { .. } => ChatEventKind::UserState,
			ChatEvent::Connected { .. } => ChatEventKind::Connected,
			ChatEvent::Disconnected { .. } => ChatEventKind::Disconnected,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::BanDuration;

	#[test]
	fn ban_duration_formats() {
		assert_eq!(BanDuration::Permanent.to_string(), "permanent");
		assert_eq!(BanDuration::Timeout(Some(600)).to_string(), "600s");
	}
}
