#![forbid(unsafe_code)]

//! Chat command registry. A message starting with the bot's prefix names a
//! command; unknown names get a fixed reply.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chirp_domain::UserLogin;
use chirp_platform::twitch::irc::ChatMessage;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// One parsed command call.
#[derive(Debug)]
pub struct Invocation<'a> {
	/// Lowercased, prefix stripped.
	pub name: String,
	pub args: Vec<&'a str>,
	pub message: &'a ChatMessage,
	/// Caller is listed in the bot's superusers.
	pub superuser: bool,
}

#[async_trait]
pub trait Command: Send + Sync {
	fn name(&self) -> &'static str;

	fn aliases(&self) -> &'static [&'static str] {
		&[]
	}

	/// Hidden commands still run but are left out of `help`.
	fn hidden(&self) -> bool {
		false
	}

	/// Text to say in chat, if any.
	async fn reply(&self, inv: &Invocation<'_>, registry: &CommandRegistry) -> anyhow::Result<Option<String>>;
}

pub struct CommandRegistry {
	prefix: String,
	superusers: Vec<UserLogin>,
	started_at: Instant,
	commands: Vec<Arc<dyn Command>>,
}

impl CommandRegistry {
	pub fn new(prefix: impl Into<String>, superusers: Vec<UserLogin>, started_at: Instant) -> Self {
		Self {
			prefix: prefix.into(),
			superusers,
			started_at,
			commands: Vec::new(),
		}
	}

	/// Registry preloaded with `help`, `uptime` and `ping`.
	pub fn with_builtins(prefix: impl Into<String>, superusers: Vec<UserLogin>, started_at: Instant) -> Self {
		let mut registry = Self::new(prefix, superusers, started_at);
		registry.register(Arc::new(Help));
		registry.register(Arc::new(Uptime));
		registry.register(Arc::new(Ping));
		registry
	}

	/// Refuses a command whose name or alias is already taken.
	pub fn register(&mut self, command: Arc<dyn Command>) -> bool {
		let taken = std::iter::once(command.name())
			.chain(command.aliases().iter().copied())
			.find(|n| self.find(n).is_some());
		if let Some(name) = taken {
			warn!(command = command.name(), clash = name, "command name already registered; skipping");
			return false;
		}

		if command.aliases().is_empty() {
			info!(command = command.name(), "loaded command");
		} else {
			info!(command = command.name(), aliases = ?command.aliases(), "loaded command");
		}
		self.commands.push(command);
		true
	}

	pub fn prefix(&self) -> &str {
		&self.prefix
	}

	pub fn uptime(&self) -> Duration {
		self.started_at.elapsed()
	}

	/// Names and aliases shown by `help`, in registration order.
	pub fn visible_names(&self) -> Vec<&'static str> {
		self.commands
			.iter()
			.filter(|c| !c.hidden())
			.flat_map(|c| std::iter::once(c.name()).chain(c.aliases().iter().copied()))
			.collect()
	}

	fn find(&self, name: &str) -> Option<&Arc<dyn Command>> {
		self.commands
			.iter()
			.find(|c| c.name().eq_ignore_ascii_case(name) || c.aliases().iter().any(|a| a.eq_ignore_ascii_case(name)))
	}

	pub fn parse<'a>(&self, message: &'a ChatMessage) -> Option<Invocation<'a>> {
		let rest = message.text.strip_prefix(self.prefix.as_str())?;
		let mut words = rest.split(' ');
		let name = words.next().unwrap_or_default().to_lowercase();
		let args = words.filter(|w| !w.is_empty()).collect();
		let superuser = self.superusers.iter().any(|s| s.matches(&message.username));

		Some(Invocation {
			name,
			args,
			message,
			superuser,
		})
	}

	/// Reply for `message`, or `None` when it is not a command or the command stayed quiet.
	pub async fn dispatch(&self, message: &ChatMessage) -> Option<String> {
		let inv = self.parse(message)?;

		let Some(command) = self.find(&inv.name) else {
			info!(command = %inv.name, user = %message.username, "unknown command");
			return Some(format!("Couldn't find the command that you tried to use {}...", message.username));
		};

		debug!(command = command.name(), user = %message.username, superuser = inv.superuser, args = inv.args.len(), "running command");
		match command.reply(&inv, self).await {
			Ok(reply) => reply,
			Err(e) => {
				error!(command = command.name(), error = %format!("{e:#}"), "command failed");
				None
			}
		}
	}
}

struct Help;

#[async_trait]
impl Command for Help {
	fn name(&self) -> &'static str {
		"help"
	}

	async fn reply(&self, _inv: &Invocation<'_>, registry: &CommandRegistry) -> anyhow::Result<Option<String>> {
		let list = registry
			.visible_names()
			.iter()
			.map(|n| format!("{}{n}", registry.prefix()))
			.collect::<Vec<_>>()
			.join(", ");
		Ok(Some(format!("Possible commands: {}", list.to_lowercase())))
	}
}

struct Uptime;

#[async_trait]
impl Command for Uptime {
	fn name(&self) -> &'static str {
		"uptime"
	}

	async fn reply(&self, _inv: &Invocation<'_>, registry: &CommandRegistry) -> anyhow::Result<Option<String>> {
		Ok(Some(format!("Bot has been up for {}", duration_words(registry.uptime()))))
	}
}

struct Ping;

#[async_trait]
impl Command for Ping {
	fn name(&self) -> &'static str {
		"ping"
	}

	async fn reply(&self, _inv: &Invocation<'_>, _registry: &CommandRegistry) -> anyhow::Result<Option<String>> {
		Ok(Some("pong".to_string()))
	}
}

/// `3725s` -> `1 hour, 2 minutes, 5 seconds`. Zero units are skipped.
fn duration_words(d: Duration) -> String {
	let total = d.as_secs();
	let units = [
		(total / 86_400, "day"),
		(total % 86_400 / 3_600, "hour"),
		(total % 3_600 / 60, "minute"),
		(total % 60, "second"),
	];

	let parts: Vec<String> = units
		.iter()
		.filter(|(n, _)| *n > 0)
		.map(|(n, unit)| if *n == 1 { format!("1 {unit}") } else { format!("{n} {unit}s") })
		.collect();

	if parts.is_empty() {
		"0 seconds".to_string()
	} else {
		parts.join(", ")
	}
}

#[cfg(test)]
mod tests {
	use chirp_domain::{ChannelName, UserLogin};
	use chirp_platform::twitch::irc::{ChatEvent, LineOutcome, ParserContext, parse_line};

	use super::*;

	fn message(user: &str, text: &str) -> ChatMessage {
		let ctx = ParserContext {
			bot_login: UserLogin::new("chirpbot").expect("login"),
			channel: ChannelName::new("bar").expect("channel"),
		};
		let line = format!(":{user}!{user}@{user}.tmi.twitch.tv PRIVMSG #bar :{text}");
		match parse_line(&line, &ctx) {
			LineOutcome::Event(ChatEvent::Message(m)) => m,
			other => panic!("expected a message, got {other:?}"),
		}
	}

	fn registry() -> CommandRegistry {
		CommandRegistry::with_builtins("!", vec![UserLogin::new("Alice").expect("login")], Instant::now())
	}

	struct Echo;

	#[async_trait]
	impl Command for Echo {
		fn name(&self) -> &'static str {
			"echo"
		}

		fn aliases(&self) -> &'static [&'static str] {
			&["say"]
		}

		async fn reply(&self, inv: &Invocation<'_>, _registry: &CommandRegistry) -> anyhow::Result<Option<String>> {
			if !inv.superuser {
				return Ok(None);
			}
			Ok(Some(inv.args.join(" ")))
		}
	}

	struct Broken;

	#[async_trait]
	impl Command for Broken {
		fn name(&self) -> &'static str {
			"broken"
		}

		fn hidden(&self) -> bool {
			true
		}

		async fn reply(&self, _inv: &Invocation<'_>, _registry: &CommandRegistry) -> anyhow::Result<Option<String>> {
			anyhow::bail!("upstream unavailable")
		}
	}

	#[tokio::test]
	async fn plain_chat_is_not_a_command() {
		assert_eq!(registry().dispatch(&message("foo", "hello there")).await, None);
	}

	#[tokio::test]
	async fn ping_and_unknown() {
		let r = registry();
		assert_eq!(r.dispatch(&message("foo", "!PING")).await.as_deref(), Some("pong"));
		assert_eq!(
			r.dispatch(&message("foo", "!nope")).await.as_deref(),
			Some("Couldn't find the command that you tried to use foo...")
		);
	}

	#[tokio::test]
	async fn help_lists_visible_commands_with_prefix() {
		let mut r = registry();
		assert!(r.register(Arc::new(Echo)));
		assert!(r.register(Arc::new(Broken)));
		assert_eq!(
			r.dispatch(&message("foo", "!help")).await.as_deref(),
			Some("Possible commands: !help, !uptime, !ping, !echo, !say")
		);
	}

	#[tokio::test]
	async fn superuser_flag_and_args() {
		let mut r = registry();
		r.register(Arc::new(Echo));

		let msg = message("ALICE", "!say  hi  there");
		let inv = r.parse(&msg).expect("command");
		assert_eq!(inv.name, "say");
		assert_eq!(inv.args, vec!["hi", "there"]);

		assert_eq!(r.dispatch(&message("alice", "!say hi there")).await.as_deref(), Some("hi there"));
		assert_eq!(r.dispatch(&message("mallory", "!echo hi")).await, None);
	}

	#[tokio::test]
	async fn duplicate_names_are_refused() {
		struct FakePing;

		#[async_trait]
		impl Command for FakePing {
			fn name(&self) -> &'static str {
				"pong"
			}

			fn aliases(&self) -> &'static [&'static str] {
				&["ping"]
			}

			async fn reply(&self, _inv: &Invocation<'_>, _registry: &CommandRegistry) -> anyhow::Result<Option<String>> {
				Ok(None)
			}
		}

		let mut r = registry();
		assert!(!r.register(Arc::new(FakePing)));
		assert_eq!(r.visible_names(), vec!["help", "uptime", "ping"]);
	}

	#[tokio::test]
	async fn failing_command_stays_quiet() {
		let mut r = registry();
		r.register(Arc::new(Broken));
		assert_eq!(r.dispatch(&message("foo", "!broken")).await, None);
	}

	#[tokio::test(start_paused = true)]
	async fn uptime_reports_elapsed_time() {
		let r = registry();
		tokio::time::advance(Duration::from_secs(3_725)).await;
		assert_eq!(
			r.dispatch(&message("foo", "!uptime")).await.as_deref(),
			Some("Bot has been up for 1 hour, 2 minutes, 5 seconds")
		);
	}

	#[test]
	fn duration_words_formats_units() {
		assert_eq!(duration_words(Duration::ZERO), "0 seconds");
		assert_eq!(duration_words(Duration::from_secs(61)), "1 minute, 1 second");
		assert_eq!(duration_words(Duration::from_secs(2 * 86_400 + 3)), "2 days, 3 seconds");
	}
}
