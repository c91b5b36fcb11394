#![forbid(unsafe_code)]

//! Numbers buried in human-readable NOTICE text.
//!
//! Twitch does not expose these as tags, so they are read from fixed word
//! positions and yield `None` when the wording changes.

/// `<user> has been timed out for <n> seconds.`
const TIMEOUT_SECONDS_WORD: usize = 6;
/// `<user> is raiding with a party of <n>.`
const RAID_VIEWERS_WORD: usize = 7;

pub(crate) fn first_word(text: &str) -> Option<&str> {
	text.split_whitespace().next()
}

pub(crate) fn timeout_seconds(text: &str) -> Option<u64> {
	number_at(text, TIMEOUT_SECONDS_WORD)
}

pub(crate) fn raid_viewers(text: &str) -> Option<u64> {
	number_at(text, RAID_VIEWERS_WORD)
}

fn number_at(text: &str, index: usize) -> Option<u64> {
	let word = text.split_whitespace().nth(index)?;
	let digits: String = word.chars().filter(char::is_ascii_digit).collect();
	if digits.is_empty() {
		return None;
	}
	digits.parse().ok()
}
