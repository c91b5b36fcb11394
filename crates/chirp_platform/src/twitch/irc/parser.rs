#![forbid(unsafe_code)]

//! Classification of inbound chat lines.
//!
//! Chat, notice and state lines look alike on the wire, so classification is
//! an ordered table of rules and the first rule that claims a line wins.

use chirp_domain::{ChannelName, RoomId, UserId, UserLogin};
use tracing::{debug, info, warn};

use super::events::{BanDuration, BanEvent, ChatEvent, ChatMessage, RaidEvent};
use super::line::RawLine;
use super::notice_text;
use super::privileges::resolve_privileges;
use super::tags::{TagValue, Tags, decode_badges, decode_tags};

/// Identity of the connection a line arrived on.
#[derive(Debug, Clone)]
pub struct ParserContext {
	pub bot_login: UserLogin,
	pub channel: ChannelName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
	Event(ChatEvent),
	/// Line to write back on the same socket.
	Reply(String),
	/// Server asked us to drop and reopen the connection.
	Reconnect,
	/// Recognized and deliberately dropped.
	Ignored(&'static str),
	/// No rule claimed the line.
	Unhandled,
}

struct Input<'a> {
	raw: &'a str,
	line: Option<RawLine<'a>>,
}

impl<'a> Input<'a> {
	fn command(&self) -> Option<&'a str> {
		self.line.as_ref().map(|l| l.command)
	}

	fn tags(&self) -> Tags {
		self.line.as_ref().and_then(|l| l.tags).map(decode_tags).unwrap_or_default()
	}
}

type RuleFn = fn(&Input<'_>, &ParserContext) -> Option<LineOutcome>;

struct Rule {
	name: &'static str,
	apply: RuleFn,
}

const RULES: &[Rule] = &[
	Rule {
		name: "numeric",
		apply: numeric_reply,
	},
	Rule {
		name: "cap",
		apply: capability,
	},
	Rule {
		name: "clearchat",
		apply: clearchat,
	},
	Rule {
		name: "globaluserstate",
		apply: globaluserstate,
	},
	Rule {
		name: "join",
		apply: join,
	},
	Rule {
		name: "notice",
		apply: notice,
	},
	Rule {
		name: "ping",
		apply: ping,
	},
	Rule {
		name: "privmsg",
		apply: privmsg,
	},
	Rule {
		name: "usernotice",
		apply: usernotice,
	},
	Rule {
		name: "reconnect",
		apply: reconnect,
	},
	Rule {
		name: "roomstate",
		apply: roomstate,
	},
	Rule {
		name: "userstate",
		apply: userstate,
	},
];

/// Classify one line (terminators already stripped).
pub fn parse_line(raw: &str, ctx: &ParserContext) -> LineOutcome {
	let (rule, outcome) = classify(raw, ctx);
	match &outcome {
		LineOutcome::Unhandled => {
			metrics::counter!("chirp_chat_lines_unhandled_total").increment(1);
			debug!(channel = %ctx.channel, line = %raw, "unhandled chat line");
		}
		LineOutcome::Ignored(why) => {
			debug!(channel = %ctx.channel, rule, why, "chat line ignored");
		}
		_ => {}
	}
	outcome
}

/// Like [`parse_line`] but also names the rule that claimed the line.
pub(crate) fn classify(raw: &str, ctx: &ParserContext) -> (&'static str, LineOutcome) {
	let input = Input {
		raw,
		line: RawLine::parse(raw),
	};
	RULES
		.iter()
		.find_map(|rule| (rule.apply)(&input, ctx).map(|out| (rule.name, out)))
		.unwrap_or(("unhandled", LineOutcome::Unhandled))
}

fn numeric_reply(input: &Input<'_>, _ctx: &ParserContext) -> Option<LineOutcome> {
	let mut tokens = input.raw.split(' ');
	let second = tokens.nth(1)?;
	tokens.next()?;

	if second.is_empty() || !second.bytes().all(|b| b.is_ascii_digit()) {
		return None;
	}
	match second.parse::<u32>() {
		Ok(n) if n <= 999 => Some(LineOutcome::Ignored("numeric reply")),
		_ => None,
	}
}

fn capability(input: &Input<'_>, _ctx: &ParserContext) -> Option<LineOutcome> {
	(input.command()? == "CAP").then_some(LineOutcome::Ignored("capability negotiation"))
}

fn clearchat(input: &Input<'_>, _ctx: &ParserContext) -> Option<LineOutcome> {
	let line = input.line.as_ref()?;
	if line.command != "CLEARCHAT" || !line.from_server() {
		return None;
	}
	let channel = ChannelName::new(line.channel()?).ok()?;
	let username = line.trailing?.to_string();

	let mut tags = input.tags();
	let (duration, message, msg_id) = match tags.text("ban-duration").map(|d| d.parse::<u64>().ok()) {
		Some(secs) => {
			let duration = BanDuration::Timeout(secs);
			let message = format!("{username} was timed out for {duration}.");
			(duration, message, "timeout_success")
		}
		None => (BanDuration::Permanent, format!("{username} was banned."), "ban_success"),
	};
	tags.insert("msg-id", TagValue::Text(msg_id.to_string()));

	Some(LineOutcome::Event(ChatEvent::Ban(BanEvent {
		username,
		channel,
		duration,
		message,
		tags,
	})))
}

fn globaluserstate(input: &Input<'_>, ctx: &ParserContext) -> Option<LineOutcome> {
	if input.command()? != "GLOBALUSERSTATE" {
		return None;
	}
	let tags = input.tags();
	let display_name = tags.text("display-name")?;
	let user_id: UserId = tags.text("user-id")?.parse().ok()?;

	if !ctx.bot_login.matches(display_name) {
		return Some(LineOutcome::Ignored("globaluserstate for another identity"));
	}
	Some(LineOutcome::Event(ChatEvent::BotUserState { user_id }))
}

fn join(input: &Input<'_>, ctx: &ParserContext) -> Option<LineOutcome> {
	if input.command()? != "JOIN" {
		return None;
	}
	info!(channel = %ctx.channel, "joined #{}", ctx.channel);
	Some(LineOutcome::Ignored("join confirmation"))
}

fn notice(input: &Input<'_>, _ctx: &ParserContext) -> Option<LineOutcome> {
	let line = input.line.as_ref()?;
	if line.command != "NOTICE" || !line.from_server() {
		return None;
	}
	let channel = ChannelName::new(line.channel()?).ok()?;
	let text = line.trailing?;
	let tags = input.tags();
	let msg_id = tags.text("msg-id").unwrap_or_default();

	info!(channel = %channel, msg_id, "NOTICE: {text}");

	let username = notice_text::first_word(text).map(str::to_string);
	let event = match (msg_id, username) {
		("ban_success", Some(username)) => ChatEvent::Ban(BanEvent {
			username,
			channel,
			duration: BanDuration::Permanent,
			message: text.to_string(),
			tags,
		}),
		("timeout_success", Some(username)) => ChatEvent::Ban(BanEvent {
			username,
			channel,
			duration: BanDuration::Timeout(notice_text::timeout_seconds(text)),
			message: text.to_string(),
			tags,
		}),
		("raid", Some(username)) => ChatEvent::Raid(RaidEvent {
			username,
			channel,
			viewers: notice_text::raid_viewers(text),
			tags,
		}),
		("ban_success" | "timeout_success" | "raid", None) => {
			warn!(msg_id, "NOTICE without a username");
			return Some(LineOutcome::Ignored("notice without username"));
		}
		_ => return Some(LineOutcome::Ignored("informational notice")),
	};
	Some(LineOutcome::Event(event))
}

/// Echoes the PING arguments back, keeping the `:` on a trailing token.
fn ping(input: &Input<'_>, _ctx: &ParserContext) -> Option<LineOutcome> {
	if input.command() != Some("PING") {
		return None;
	}
	let line = input.line.as_ref()?;
	let mut reply = String::from("PONG");
	for param in &line.params {
		reply.push(' ');
		reply.push_str(param);
	}
	if let Some(trailing) = line.trailing {
		reply.push_str(" :");
		reply.push_str(trailing);
	}
	Some(LineOutcome::Reply(reply))
}

fn privmsg(input: &Input<'_>, _ctx: &ParserContext) -> Option<LineOutcome> {
	let line = input.line.as_ref()?;
	if line.command != "PRIVMSG" {
		return None;
	}
	let (identity, username, host) = (line.nick()?, line.user()?, line.host()?);
	if identity.is_empty() || username.is_empty() || host.is_empty() {
		return None;
	}
	let channel = ChannelName::new(line.channel()?).ok()?;
	let text = line.trailing?;

	let tags = input.tags();
	let privileges = resolve_privileges(&tags);

	Some(LineOutcome::Event(ChatEvent::Message(ChatMessage {
		username: username.to_string(),
		identity: identity.to_string(),
		host: host.to_string(),
		channel,
		text: text.to_string(),
		tags,
		privileges,
	})))
}

fn usernotice(input: &Input<'_>, _ctx: &ParserContext) -> Option<LineOutcome> {
	let line = input.line.as_ref()?;
	if line.command != "USERNOTICE" || !line.from_server() {
		return None;
	}
	let tags = input.tags();
	let msg_id = tags.text("msg-id").unwrap_or_default();
	let username = tags
		.text("msg-param-displayName")
		.or_else(|| tags.text("msg-param-login"))
		.unwrap_or("unknown");

	info!(msg_id, username, channel = line.channel().unwrap_or_default(), "USERNOTICE received");
	Some(LineOutcome::Ignored("usernotice"))
}

fn reconnect(input: &Input<'_>, ctx: &ParserContext) -> Option<LineOutcome> {
	if input.command()? != "RECONNECT" {
		return None;
	}
	info!(channel = %ctx.channel, "Twitch IRC reconnect requested");
	Some(LineOutcome::Reconnect)
}

fn roomstate(input: &Input<'_>, _ctx: &ParserContext) -> Option<LineOutcome> {
	let line = input.line.as_ref()?;
	if line.command != "ROOMSTATE" {
		return None;
	}
	let channel = ChannelName::new(line.channel()?).ok()?;
	let room_id: RoomId = input.tags().text("room-id")?.parse().ok()?;
	Some(LineOutcome::Event(ChatEvent::RoomState { channel, room_id }))
}

fn userstate(input: &Input<'_>, _ctx: &ParserContext) -> Option<LineOutcome> {
	let line = input.line.as_ref()?;
	if line.command != "USERSTATE" {
		return None;
	}
	line.tags?;
	let channel = ChannelName::new(line.channel()?).ok()?;
	let badges = decode_badges(input.tags().get("badges"));
	Some(LineOutcome::Event(ChatEvent::UserState { channel, badges }))
}
