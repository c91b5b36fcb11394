#![forbid(unsafe_code)]

//! EventSub over websocket: session lifecycle, keepalive watchdog and
//! subscription bookkeeping.

pub mod messages;
mod session;


pub use messages::{
	CHANNEL_FOLLOW, CHANNEL_RAID, ChannelFollowEvent, ChannelRaidEvent, Notification, STREAM_OFFLINE, STREAM_ONLINE,
	StreamOfflineEvent, StreamOnlineEvent,
};
pub use session::{
	DEFAULT_EVENTSUB_WS_URL, EventSubConfig, EventSubHandle, EventSubSession, SessionEvent, SessionEventKey, SessionState,
	SubscribeError,
};
