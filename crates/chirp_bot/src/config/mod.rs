#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use chirp_domain::{ChannelName, UserLogin};
use chirp_platform::SecretString;
use chirp_platform::twitch::eventsub::{DEFAULT_EVENTSUB_WS_URL, EventSubConfig};
use chirp_platform::twitch::helix::DEFAULT_HELIX_BASE_URL;
use chirp_platform::twitch::irc::{ChatConfig, DEFAULT_IRC_WS_URL, OutboundConfig};
use chirp_util::backoff::ReconnectPolicy;
use chirp_util::env::{key_segment, parse_bool, var_non_empty};
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

/// Default config path: `~/.chirp/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chirp").join("config.toml"))
}

/// Load the bot config from TOML and `CHIRP_*` env overrides.
pub fn load_bot_config_from_path(path: &Path) -> anyhow::Result<BotConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();
	Ok(BotConfig::from_file_with_env(file_cfg, var_non_empty))
}

#[derive(Debug, Clone, Default)]
pub struct BotConfig {
	pub server: ServerSettings,
	pub chat: ChatSettings,
	pub eventsub: EventSubSettings,
	/// Enabled bots that passed validation.
	pub bots: Vec<BotSettings>,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

/// Chat transport tuning shared by every bot.
#[derive(Debug, Clone, Default)]
pub struct ChatSettings {
	pub irc_ws_url: Option<String>,
	pub max_message_len: Option<usize>,
	pub rate_limit: Option<u32>,
	pub rate_window: Option<Duration>,
	pub reconnect_base: Option<Duration>,
	pub reconnect_max: Option<Duration>,
	pub reconnect_max_attempts: Option<u32>,
}

/// EventSub tuning shared by every bot.
#[derive(Debug, Clone, Default)]
pub struct EventSubSettings {
	pub ws_url: Option<String>,
	pub helix_base_url: Option<String>,
	pub reconnect_base: Option<Duration>,
	pub reconnect_max: Option<Duration>,
	pub reconnect_max_attempts: Option<u32>,
	pub abnormal_close_grace: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct BotSettings {
	pub name: String,
	pub username: UserLogin,
	pub channel: ChannelName,
	/// Chat OAuth token.
	pub token: SecretString,
	pub client_id: Option<String>,
	/// Token for subscription calls; falls back to `token`.
	pub eventsub_token: Option<SecretString>,
	pub prefix: String,
	pub superusers: Vec<UserLogin>,
	pub chat_show: bool,
	pub eventsub: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	chat: FileChatSettings,

	#[serde(default)]
	eventsub: FileEventSubSettings,

	#[serde(default)]
	bots: Vec<FileBotSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileChatSettings {
	irc_ws_url: Option<String>,
	max_message_len: Option<usize>,
	rate_limit: Option<u32>,
	rate_window_secs: Option<u64>,
	reconnect_base_ms: Option<u64>,
	reconnect_max_ms: Option<u64>,
	reconnect_max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileEventSubSettings {
	ws_url: Option<String>,
	helix_base_url: Option<String>,
	reconnect_base_ms: Option<u64>,
	reconnect_max_ms: Option<u64>,
	reconnect_max_attempts: Option<u32>,
	abnormal_close_grace_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBotSettings {
	name: Option<String>,
	enabled: Option<bool>,
	username: Option<String>,
	channel: Option<String>,
	token: Option<String>,
	client_id: Option<String>,
	eventsub_token: Option<String>,
	prefix: Option<String>,
	#[serde(default)]
	superusers: Vec<String>,
	chat_show: Option<bool>,
	eventsub: Option<bool>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl BotConfig {
	/// Normalize the file mirror, applying overrides from `env` first.
	fn from_file_with_env(mut file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
		apply_bot_env_overrides(&mut file.bots, &env);

		let bots = file
			.bots
			.into_iter()
			.enumerate()
			.filter_map(|(idx, bot)| BotSettings::from_file(idx, bot))
			.collect();

		let mut cfg = Self {
			server: ServerSettings {
				metrics_bind: non_empty(file.server.metrics_bind),
			},
			chat: ChatSettings {
				irc_ws_url: non_empty(file.chat.irc_ws_url),
				max_message_len: file.chat.max_message_len.filter(|v| *v > 0),
				rate_limit: file.chat.rate_limit.filter(|v| *v > 0),
				rate_window: file.chat.rate_window_secs.filter(|v| *v > 0).map(Duration::from_secs),
				reconnect_base: file.chat.reconnect_base_ms.map(Duration::from_millis),
				reconnect_max: file.chat.reconnect_max_ms.map(Duration::from_millis),
				reconnect_max_attempts: file.chat.reconnect_max_attempts,
			},
			eventsub: EventSubSettings {
				ws_url: non_empty(file.eventsub.ws_url),
				helix_base_url: non_empty(file.eventsub.helix_base_url),
				reconnect_base: file.eventsub.reconnect_base_ms.map(Duration::from_millis),
				reconnect_max: file.eventsub.reconnect_max_ms.map(Duration::from_millis),
				reconnect_max_attempts: file.eventsub.reconnect_max_attempts,
				abnormal_close_grace: file.eventsub.abnormal_close_grace_secs.map(Duration::from_secs),
			},
			bots,
		};

		apply_env_overrides(&mut cfg, &env);
		cfg
	}
}

impl BotSettings {
	fn from_file(idx: usize, file: FileBotSettings) -> Option<Self> {
		let label = non_empty(file.name.clone()).unwrap_or_else(|| format!("bots[{idx}]"));

		if !file.enabled.unwrap_or(true) {
			info!(bot = %label, "bot disabled in config; skipping");
			return None;
		}

		let name = non_empty(file.name);
		let username = non_empty(file.username);
		let channel = non_empty(file.channel);
		let token = non_empty(file.token);

		let missing: Vec<&str> = [
			("name", name.is_none()),
			("username", username.is_none()),
			("channel", channel.is_none()),
			("token", token.is_none()),
		]
		.into_iter()
		.filter_map(|(key, absent)| absent.then_some(key))
		.collect();

		let (Some(name), Some(username), Some(channel), Some(token)) = (name, username, channel, token) else {
			warn!(bot = %label, missing = ?missing, "bot config is missing required keys; skipping");
			return None;
		};

		let username = match UserLogin::new(username) {
			Ok(v) => v,
			Err(e) => {
				warn!(bot = %label, error = %e, "invalid bot username; skipping");
				return None;
			}
		};
		let channel = match ChannelName::new(channel) {
			Ok(v) => v,
			Err(e) => {
				warn!(bot = %label, error = %e, "invalid bot channel; skipping");
				return None;
			}
		};

		let superusers = file
			.superusers
			.into_iter()
			.filter_map(|s| match UserLogin::new(s.clone()) {
				Ok(login) => Some(login),
				Err(e) => {
					warn!(bot = %label, superuser = %s, error = %e, "ignoring invalid superuser");
					None
				}
			})
			.collect();

		Some(Self {
			name,
			username,
			channel,
			token: SecretString::new(token),
			client_id: non_empty(file.client_id),
			eventsub_token: non_empty(file.eventsub_token).map(SecretString::new),
			prefix: non_empty(file.prefix).unwrap_or_else(|| "!".to_string()),
			superusers,
			chat_show: file.chat_show.unwrap_or(false),
			eventsub: file.eventsub.unwrap_or(true),
		})
	}

	pub fn chat_config(&self, chat: &ChatSettings) -> ChatConfig {
		let mut cfg = ChatConfig::new(self.username.clone(), self.token.clone(), self.channel.clone());
		cfg.ws_url = chat.irc_ws_url.clone().unwrap_or_else(|| DEFAULT_IRC_WS_URL.to_string());
		cfg.chat_show = self.chat_show;

		let defaults = cfg.reconnect;
		cfg.reconnect = ReconnectPolicy::linear(
			chat.reconnect_base.unwrap_or(defaults.base),
			chat.reconnect_max.unwrap_or(defaults.max_delay),
			chat.reconnect_max_attempts.unwrap_or(defaults.max_attempts),
		);

		let mut outbound = OutboundConfig::default();
		if let Some(len) = chat.max_message_len {
			outbound.max_message_len = len;
		}
		if let Some(limit) = chat.rate_limit {
			outbound.rate_limit = limit;
		}
		if let Some(window) = chat.rate_window {
			outbound.rate_window = window;
		}
		cfg.outbound = outbound;
		cfg
	}

	/// `None` when EventSub is turned off for this bot or it has no client id.
	pub fn eventsub_config(&self, es: &EventSubSettings) -> Option<EventSubConfig> {
		if !self.eventsub {
			debug!(bot = %self.name, "eventsub disabled for bot");
			return None;
		}
		if self.client_id.is_none() {
			warn!(bot = %self.name, "eventsub enabled but no client_id configured; skipping eventsub");
			return None;
		}

		let token = self.eventsub_token.clone().unwrap_or_else(|| self.token.clone());
		let mut cfg = EventSubConfig::new(token);
		cfg.ws_url = es.ws_url.clone().unwrap_or_else(|| DEFAULT_EVENTSUB_WS_URL.to_string());

		let defaults = cfg.reconnect;
		cfg.reconnect = ReconnectPolicy::exponential(
			es.reconnect_base.unwrap_or(defaults.base),
			es.reconnect_max.unwrap_or(defaults.max_delay),
			es.reconnect_max_attempts.unwrap_or(defaults.max_attempts),
		);
		if let Some(grace) = es.abnormal_close_grace {
			cfg.abnormal_close_grace = grace;
		}
		Some(cfg)
	}
}

impl EventSubSettings {
	pub fn helix_base_url(&self) -> anyhow::Result<Url> {
		let raw = self.helix_base_url.as_deref().unwrap_or(DEFAULT_HELIX_BASE_URL);
		Url::parse(raw).with_context(|| format!("parse helix base url {raw}"))
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

/// Per-bot overrides, keyed by bot name: `CHIRP_BOT_<NAME>_TOKEN` and friends.
fn apply_bot_env_overrides(bots: &mut [FileBotSettings], env: &impl Fn(&str) -> Option<String>) {
	for bot in bots.iter_mut() {
		let Some(name) = non_empty(bot.name.clone()) else {
			continue;
		};
		let key = key_segment(&name);

		if let Some(v) = env(&format!("CHIRP_BOT_{key}_TOKEN")) {
			bot.token = Some(v);
			info!(bot = %name, "bot config: token overridden by env");
		}
		if let Some(v) = env(&format!("CHIRP_BOT_{key}_EVENTSUB_TOKEN")) {
			bot.eventsub_token = Some(v);
			info!(bot = %name, "bot config: eventsub_token overridden by env");
		}
		if let Some(v) = env(&format!("CHIRP_BOT_{key}_CLIENT_ID")) {
			bot.client_id = Some(v);
			info!(bot = %name, "bot config: client_id overridden by env");
		}
		if let Some(enabled) = env(&format!("CHIRP_BOT_{key}_ENABLED")).as_deref().and_then(parse_bool) {
			bot.enabled = Some(enabled);
			info!(bot = %name, enabled, "bot config: enabled overridden by env");
		}
	}
}

fn apply_env_overrides(cfg: &mut BotConfig, env: &impl Fn(&str) -> Option<String>) {
	if let Some(v) = env("CHIRP_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env("CHIRP_CHAT_IRC_WS_URL") {
		cfg.chat.irc_ws_url = Some(v);
		info!("chat config: irc_ws_url overridden by env");
	}

	if let Some(v) = env("CHIRP_EVENTSUB_WS_URL") {
		cfg.eventsub.ws_url = Some(v);
		info!("eventsub config: ws_url overridden by env");
	}

	if let Some(v) = env("CHIRP_HELIX_BASE_URL") {
		cfg.eventsub.helix_base_url = Some(v);
		info!("eventsub config: helix_base_url overridden by env");
	}

	if let Some(v) = env("CHIRP_TWITCH_CLIENT_ID") {
		let mut applied = 0;
		for bot in cfg.bots.iter_mut().filter(|b| b.client_id.is_none()) {
			bot.client_id = Some(v.clone());
			applied += 1;
		}
		info!(bots = applied, "twitch config: client_id filled in from env");
	}

	swap_if_inverted("chat", &mut cfg.chat.reconnect_base, &mut cfg.chat.reconnect_max);
	swap_if_inverted("eventsub", &mut cfg.eventsub.reconnect_base, &mut cfg.eventsub.reconnect_max);
}

fn swap_if_inverted(section: &str, base: &mut Option<Duration>, max: &mut Option<Duration>) {
	if let (Some(b), Some(m)) = (*base, *max)
		&& b > m
	{
		warn!(
			section,
			base_ms = b.as_millis() as u64,
			max_ms = m.as_millis() as u64,
			"reconnect base delay exceeds max delay; swapping"
		);
		*base = Some(m);
		*max = Some(b);
	}
}
