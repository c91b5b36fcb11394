#![forbid(unsafe_code)]

/// One IRC line split into its parts, borrowing from the input.
///
/// `@tags :prefix COMMAND param param :trailing`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine<'a> {
	pub raw: &'a str,
	/// Tag block including the leading `@`.
	pub tags: Option<&'a str>,
	/// Prefix without the leading `:`.
	pub prefix: Option<&'a str>,
	pub command: &'a str,
	pub params: Vec<&'a str>,
	pub trailing: Option<&'a str>,
}

impl<'a> RawLine<'a> {
	pub fn parse(raw: &'a str) -> Option<Self> {
		let mut rest = raw.trim_end_matches(['\r', '\n']);

		let mut tags = None;
		if rest.starts_with('@') {
			let (t, r) = rest.split_once(' ')?;
			tags = Some(t);
			rest = r.trim_start_matches(' ');
		}

		let mut prefix = None;
		if let Some(p) = rest.strip_prefix(':') {
			let (p, r) = p.split_once(' ')?;
			prefix = Some(p);
			rest = r.trim_start_matches(' ');
		}

		let (command, mut rest) = match rest.split_once(' ') {
			Some((c, r)) => (c, r),
			None => (rest, ""),
		};
		if command.is_empty() {
			return None;
		}

		let mut params = Vec::new();
		let mut trailing = None;
		loop {
			rest = rest.trim_start_matches(' ');
			if rest.is_empty() {
				break;
			}
			if let Some(t) = rest.strip_prefix(':') {
				trailing = Some(t);
				break;
			}
			match rest.split_once(' ') {
				Some((p, r)) => {
					params.push(p);
					rest = r;
				}
				None => {
					params.push(rest);
					break;
				}
			}
		}

		Some(Self {
			raw,
			tags,
			prefix,
			command,
			params,
			trailing,
		})
	}

	/// `nick` from a `nick!user@host` prefix.
	pub fn nick(&self) -> Option<&'a str> {
		let prefix = self.prefix?;
		Some(prefix.split_once('!').map_or(prefix, |(n, _)| n))
	}

	/// `user` from a `nick!user@host` prefix.
	pub fn user(&self) -> Option<&'a str> {
		let (_, rest) = self.prefix?.split_once('!')?;
		rest.split_once('@').map(|(u, _)| u)
	}

	/// `host` from a `nick!user@host` prefix.
	pub fn host(&self) -> Option<&'a str> {
		let (_, rest) = self.prefix?.split_once('!')?;
		rest.split_once('@').map(|(_, h)| h)
	}

	/// First parameter when it names a channel, without the `#`.
	pub fn channel(&self) -> Option<&'a str> {
		self.params.first()?.strip_prefix('#').filter(|c| !c.is_empty())
	}

	pub fn from_server(&self) -> bool {
		self.prefix == Some("tmi.twitch.tv")
	}
}

#[cfg(test)]
mod tests {
	use super::RawLine;

	#[test]
	fn splits_a_tagged_privmsg() {
		let line = RawLine::parse("@badges=;mod=0 :alice!alice@alice.tmi.twitch.tv PRIVMSG #chan :hello there :)").expect("parse");
		assert_eq!(line.tags, Some("@badges=;mod=0"));
		assert_eq!(line.prefix, Some("alice!alice@alice.tmi.twitch.tv"));
		assert_eq!(line.command, "PRIVMSG");
		assert_eq!(line.params, vec!["#chan"]);
		assert_eq!(line.trailing, Some("hello there :)"));
		assert_eq!(line.nick(), Some("alice"));
		assert_eq!(line.user(), Some("alice"));
		assert_eq!(line.host(), Some("alice.tmi.twitch.tv"));
		assert_eq!(line.channel(), Some("chan"));
	}

	#[test]
	fn splits_bare_commands() {
		let line = RawLine::parse("PING :tmi.twitch.tv").expect("parse");
		assert_eq!(line.command, "PING");
		assert!(line.params.is_empty());
		assert_eq!(line.trailing, Some("tmi.twitch.tv"));

		let line = RawLine::parse(":tmi.twitch.tv RECONNECT").expect("parse");
		assert_eq!(line.command, "RECONNECT");
		assert!(line.from_server());
	}

	#[test]
	fn keeps_middle_params() {
		let line = RawLine::parse(":tmi.twitch.tv CAP * ACK :twitch.tv/tags twitch.tv/commands").expect("parse");
		assert_eq!(line.params, vec!["*", "ACK"]);
		assert_eq!(line.trailing, Some("twitch.tv/tags twitch.tv/commands"));
	}

	#[test]
	fn rejects_truncated_lines() {
		assert!(RawLine::parse("").is_none());
		assert!(RawLine::parse("@only-tags").is_none());
		assert!(RawLine::parse(":prefix-only").is_none());
	}
}
