#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("not a numeric id: {0}")]
	NotNumeric(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Chat channel login, normalized (no leading `#`, lowercase).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelName(String);

impl ChannelName {
	/// Normalize and validate a channel name. `#Foo` and `foo` are the same channel.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		let trimmed = name.trim();
		let stripped = trimmed.strip_prefix('#').unwrap_or(trimmed);
		if stripped.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if stripped.chars().any(char::is_whitespace) {
			return Err(ParseIdError::InvalidFormat(format!("channel contains whitespace: {name}")));
		}
		Ok(Self(stripped.to_ascii_lowercase()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// `#channel` form used on the wire.
	pub fn irc_target(&self) -> String {
		format!("#{}", self.0)
	}
}

impl fmt::Display for ChannelName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelName::new(s.to_string())
	}
}

impl TryFrom<String> for ChannelName {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		ChannelName::new(value)
	}
}

impl From<ChannelName> for String {
	fn from(value: ChannelName) -> Self {
		value.0
	}
}

/// Account login (lowercase).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserLogin(String);

impl UserLogin {
	pub fn new(login: impl Into<String>) -> Result<Self, ParseIdError> {
		let login = login.into();
		let trimmed = login.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(trimmed.to_ascii_lowercase()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Case-insensitive comparison against a display name or login.
	pub fn matches(&self, other: &str) -> bool {
		self.0.eq_ignore_ascii_case(other.trim())
	}
}

impl fmt::Display for UserLogin {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserLogin {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserLogin::new(s.to_string())
	}
}

macro_rules! numeric_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(pub u64);

		impl $name {
			pub const fn get(self) -> u64 {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}
				s.parse::<u64>()
					.map(Self)
					.map_err(|_| ParseIdError::NotNumeric(s.to_string()))
			}
		}
	};
}

numeric_id!(
	/// Platform account id (`user-id` tag).
	UserId
);

numeric_id!(
	/// Channel owner id (`room-id` tag).
	RoomId
);

/// Opaque per-connection identifier used to correlate log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub uuid::Uuid);

impl ConnectionId {
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn channel_name_strips_hash_and_lowercases() {
		let c = ChannelName::new("#SomeChannel").unwrap();
		assert_eq!(c.as_str(), "somechannel");
		assert_eq!(c.irc_target(), "#somechannel");
		assert_eq!(c, "somechannel".parse::<ChannelName>().unwrap());
	}

	#[test]
	fn rejects_empty_and_spaced_channels() {
		assert_eq!(ChannelName::new("#"), Err(ParseIdError::Empty));
		assert!(ChannelName::new("   ").is_err());
		assert!(ChannelName::new("two words").is_err());
	}

	#[test]
	fn numeric_ids_parse() {
		assert_eq!("123".parse::<UserId>().unwrap(), UserId(123));
		assert_eq!(RoomId(7).to_string(), "7");
		assert!(matches!("abc".parse::<RoomId>(), Err(ParseIdError::NotNumeric(_))));
		assert_eq!("".parse::<UserId>(), Err(ParseIdError::Empty));
	}

	#[test]
	fn login_matches_case_insensitively() {
		let login = UserLogin::new("ChirpBot").unwrap();
		assert_eq!(login.as_str(), "chirpbot");
		assert!(login.matches("CHIRPBOT"));
		assert!(!login.matches("other"));
	}
}
