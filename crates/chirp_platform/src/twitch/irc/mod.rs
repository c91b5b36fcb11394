#![forbid(unsafe_code)]

//! Twitch chat over the IRC-over-websocket gateway.

mod events;
mod line;
mod notice_text;
pub mod outbound;
mod parser;
mod privileges;
pub mod tags;
mod transport;

pub use events::{BanDuration, BanEvent, ChatEvent, ChatEventKind, ChatMessage, RaidEvent};
pub use line::RawLine;
pub use outbound::{FlushOutcome, LineSink, OutboundConfig, OutboundItem, OutboundQueue, split_message};
pub use parser::{LineOutcome, ParserContext, parse_line};
pub use privileges::{Privileges, resolve_privileges};
pub use tags::{Badges, TagValue, Tags, decode_badges, decode_tags, encode_tags};
pub use transport::{ChatConfig, ChatControl, ChatHandle, ChatState, ChatTransport, DEFAULT_IRC_WS_URL};

#[cfg(test)]
mod transport_tests;
