#![forbid(unsafe_code)]

//! IRCv3 message tags and the badge list carried inside them.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagValue {
	Text(String),
	/// Key present with no value (`key` or `key=`).
	Flag,
}

impl TagValue {
	pub fn as_str(&self) -> Option<&str> {
		match self {
			TagValue::Text(s) => Some(s),
			TagValue::Flag => None,
		}
	}

	/// Twitch encodes booleans as `1`/`0`; a bare key counts as set.
	pub fn as_bool(&self) -> Option<bool> {
		match self {
			TagValue::Flag => Some(true),
			TagValue::Text(s) => match s.as_str() {
				"1" | "true" => Some(true),
				"0" | "false" => Some(false),
				_ => None,
			},
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tags(BTreeMap<String, TagValue>);

impl Tags {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, key: &str) -> Option<&TagValue> {
		self.0.get(key)
	}

	/// Text value of `key`, if present and not a bare flag.
	pub fn text(&self, key: &str) -> Option<&str> {
		self.0.get(key).and_then(TagValue::as_str)
	}

	pub fn contains(&self, key: &str) -> bool {
		self.0.contains_key(key)
	}

	pub fn insert(&mut self, key: impl Into<String>, value: TagValue) {
		self.0.insert(key.into(), value);
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &TagValue)> {
		self.0.iter().map(|(k, v)| (k.as_str(), v))
	}
}

impl FromIterator<(String, TagValue)> for Tags {
	fn from_iter<I: IntoIterator<Item = (String, TagValue)>>(iter: I) -> Self {
		Self(iter.into_iter().collect())
	}
}

/// Decode a tag block such as `@badges=moderator/1;mod=1;flags=`.
///
/// The leading `@` is optional. Entries without `=` or with an empty value
/// become [`TagValue::Flag`]. Later duplicates win. Never fails.
pub fn decode_tags(raw: &str) -> Tags {
	let body = raw.strip_prefix('@').unwrap_or(raw);

	let mut tags = Tags::new();
	for entry in body.split(';') {
		let (key, value) = match entry.split_once('=') {
			Some((k, v)) => (k, Some(v)),
			None => (entry, None),
		};
		if key.is_empty() {
			continue;
		}

		let value = match value.map(unescape) {
			Some(v) if !v.is_empty() => TagValue::Text(v),
			_ => TagValue::Flag,
		};
		tags.insert(key, value);
	}
	tags
}

/// Inverse of [`decode_tags`] for well-formed tag sets.
pub fn encode_tags(tags: &Tags) -> String {
	if tags.is_empty() {
		return String::new();
	}

	let mut out = String::from("@");
	for (i, (key, value)) in tags.iter().enumerate() {
		if i > 0 {
			out.push(';');
		}
		out.push_str(key);
		if let TagValue::Text(v) = value {
			out.push('=');
			escape_into(v, &mut out);
		}
	}
	out
}

fn unescape(raw: &str) -> String {
	let mut out = String::with_capacity(raw.len());
	let mut chars = raw.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		match chars.next() {
			Some(':') => out.push(';'),
			Some('s') => out.push(' '),
			Some('r') => out.push('\r'),
			Some('n') => out.push('\n'),
			Some(other) => out.push(other),
			// trailing lone backslash is dropped
			None => {}
		}
	}
	out
}

fn escape_into(value: &str, out: &mut String) {
	for c in value.chars() {
		match c {
			';' => out.push_str("\\:"),
			' ' => out.push_str("\\s"),
			'\\' => out.push_str("\\\\"),
			'\r' => out.push_str("\\r"),
			'\n' => out.push_str("\\n"),
			c => out.push(c),
		}
	}
}

/// Badge name to optional version, e.g. `subscriber/12` or a bare `vip`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Badges(BTreeMap<String, Option<String>>);

impl Badges {
	pub fn contains(&self, name: &str) -> bool {
		self.0.contains_key(name)
	}

	pub fn version(&self, name: &str) -> Option<&str> {
		self.0.get(name).and_then(|v| v.as_deref())
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.0.keys().map(String::as_str)
	}
}

/// Decode the value of a `badges` tag. Absent or bare-flag tags yield an
/// empty set.
pub fn decode_badges(value: Option<&TagValue>) -> Badges {
	match value.and_then(TagValue::as_str) {
		Some(list) => decode_badge_list(list),
		None => Badges::default(),
	}
}

pub fn decode_badge_list(list: &str) -> Badges {
	let mut badges = BTreeMap::new();
	for item in list.split(',') {
		let (name, version) = match item.split_once('/') {
			Some((n, v)) => (n, Some(v)),
			None => (item, None),
		};
		if name.is_empty() {
			continue;
		}
		let version = version.filter(|v| !v.is_empty()).map(str::to_string);
		badges.insert(name.to_string(), version);
	}
	Badges(badges)
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	#[test]
	fn decodes_a_twitch_tag_block() {
		let tags = decode_tags("@badge-info=;badges=moderator/1,subscriber/12;color=#FF0000;display-name=Some\\sUser;mod=1");
		assert_eq!(tags.get("badge-info"), Some(&TagValue::Flag));
		assert_eq!(tags.text("badges"), Some("moderator/1,subscriber/12"));
		assert_eq!(tags.text("display-name"), Some("Some User"));
		assert_eq!(tags.get("mod").and_then(TagValue::as_bool), Some(true));
	}

	#[test]
	fn malformed_entries_degrade_to_flags() {
		let tags = decode_tags("flag;;=orphan;x=1");
		assert_eq!(tags.get("flag"), Some(&TagValue::Flag));
		assert_eq!(tags.text("x"), Some("1"));
		assert_eq!(tags.len(), 2);
	}

	#[test]
	fn empty_input_gives_empty_tags() {
		assert!(decode_tags("").is_empty());
		assert!(decode_tags("@").is_empty());
		assert_eq!(encode_tags(&Tags::new()), "");
	}

	#[test]
	fn escapes_round_trip_through_encode() {
		let tags = decode_tags("@system-msg=a\\:b\\sc\\\\d");
		assert_eq!(tags.text("system-msg"), Some("a;b c\\d"));
		assert_eq!(encode_tags(&tags), "@system-msg=a\\:b\\sc\\\\d");
	}

	#[test]
	fn badges_parse_with_and_without_versions() {
		let tags = decode_tags("@badges=broadcaster/1,vip,premium/");
		let badges = decode_badges(tags.get("badges"));
		assert!(badges.contains("broadcaster"));
		assert_eq!(badges.version("broadcaster"), Some("1"));
		assert!(badges.contains("vip"));
		assert_eq!(badges.version("vip"), None);
		assert_eq!(badges.version("premium"), None);
		assert_eq!(badges.len(), 3);
	}

	#[test]
	fn missing_or_flag_badges_are_empty() {
		assert!(decode_badges(None).is_empty());
		assert!(decode_badges(Some(&TagValue::Flag)).is_empty());
	}

	proptest! {
		#[test]
		fn decode_is_stable_after_one_encode(raw in "[a-z@=;\\\\ -]{0,48}") {
			let once = decode_tags(&raw);
			let again = decode_tags(&encode_tags(&once));
			prop_assert_eq!(again, once);
		}

		#[test]
		fn well_formed_tags_survive_encode(
			entries in proptest::collection::btree_map("[a-z][a-z0-9-]{0,12}", proptest::option::of("[^\\x00]{1,16}"), 0..8)
		) {
			let tags: Tags = entries
				.into_iter()
				.map(|(k, v)| (k, v.map_or(TagValue::Flag, TagValue::Text)))
				.collect();
			prop_assert_eq!(decode_tags(&encode_tags(&tags)), tags);
		}
	}
}
