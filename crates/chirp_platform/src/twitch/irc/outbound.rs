#![forbid(unsafe_code)]

//! Outgoing chat lines: splitting, part markers and rate limiting.
//!
//! The queue never touches a clock or a socket on its own. Callers pass the
//! current [`Instant`] and a [`LineSink`], which keeps it testable on a
//! simulated clock.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_MAX_MESSAGE_LEN: usize = 350;
/// Unprivileged accounts get 20 messages per 30 seconds.
pub const DEFAULT_RATE_LIMIT: u32 = 20;
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Indexed by remaining queue length, capped at the last entry.
pub const PROGRESSIVE_DELAYS_MS: [u64; 5] = [1000, 1200, 1500, 1200, 1000];

#[derive(Debug, Clone)]
pub struct OutboundConfig {
	pub max_message_len: usize,
	pub rate_limit: u32,
	pub rate_window: Duration,
	pub retry_delay: Duration,
	pub progressive_delays: Vec<Duration>,
}

impl Default for OutboundConfig {
	fn default() -> Self {
		Self {
			max_message_len: DEFAULT_MAX_MESSAGE_LEN,
			rate_limit: DEFAULT_RATE_LIMIT,
			rate_window: DEFAULT_RATE_WINDOW,
			retry_delay: DEFAULT_RETRY_DELAY,
			progressive_delays: PROGRESSIVE_DELAYS_MS.iter().copied().map(Duration::from_millis).collect(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundItem {
	/// Piece of the original text, trailing split space included.
	pub payload: String,
	/// `(index, total)`, 1-based, for multi-part messages.
	pub part: Option<(usize, usize)>,
}

impl OutboundItem {
	/// Text as written after `PRIVMSG #chan :`.
	pub fn line(&self) -> String {
		match self.part {
			Some((i, n)) => format!("[{i}/{n}] {}", self.payload).trim_end().to_string(),
			None => self.payload.trim_end().to_string(),
		}
	}
}

/// Destination for flushed lines.
pub trait LineSink {
	fn write_line(&mut self, line: &str) -> impl Future<Output = anyhow::Result<()>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
	Idle,
	/// A line went out. `next_in` is when to flush again, if anything is left.
	Sent { next_in: Option<Duration> },
	RateLimited { retry_in: Duration },
	/// The item is back at the front of the queue.
	WriteFailed { retry_in: Duration },
}

#[derive(Debug)]
pub struct OutboundQueue {
	cfg: OutboundConfig,
	items: VecDeque<OutboundItem>,
	/// Send times inside the trailing rate window, oldest first.
	sent: VecDeque<Instant>,
}

impl OutboundQueue {
	pub fn new(cfg: OutboundConfig) -> Self {
		Self {
			cfg,
			items: VecDeque::new(),
			sent: VecDeque::new(),
		}
	}

	pub fn len(&self) -> usize {
		self.items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}

	pub fn config(&self) -> &OutboundConfig {
		&self.cfg
	}

	/// Split and queue `text`. Returns how many lines were queued.
	pub fn enqueue(&mut self, text: &str) -> usize {
		let items = split_message(text, self.cfg.max_message_len);
		if items.is_empty() {
			debug!("refusing to queue an empty chat message");
			return 0;
		}
		let n = items.len();
		self.items.extend(items);
		metrics::gauge!("chirp_chat_queue_depth").set(self.items.len() as f64);
		n
	}

	/// Put `item` back ahead of everything else.
	pub fn requeue_front(&mut self, item: OutboundItem) {
		self.items.push_front(item);
	}

	/// Delay before the next flush, or `None` when the queue is drained.
	pub fn next_delay(&self) -> Option<Duration> {
		if self.items.is_empty() {
			return None;
		}
		let table = &self.cfg.progressive_delays;
		let last = table.len().checked_sub(1)?;
		table.get(self.items.len().min(last)).copied()
	}

	/// Drops send times older than the window. Returns how long until a
	/// slot frees up when the window is full.
	fn rate_limit_wait(&mut self, now: Instant) -> Option<Duration> {
		let window = self.cfg.rate_window;
		while self.sent.front().is_some_and(|t| now.saturating_duration_since(*t) >= window) {
			self.sent.pop_front();
		}
		if self.sent.len() < self.cfg.rate_limit as usize {
			return None;
		}
		let wait = self
			.sent
			.front()
			.map_or(self.cfg.retry_delay, |oldest| (*oldest + window).saturating_duration_since(now));
		Some(wait)
	}

	/// Send at most one queued line through `sink`.
	pub async fn flush<S: LineSink>(&mut self, now: Instant, sink: &mut S) -> FlushOutcome {
		if let Some(retry_in) = self.rate_limit_wait(now) {
			metrics::counter!("chirp_chat_rate_limited_total").increment(1);
			debug!(
				sent = self.sent.len(),
				queued = self.items.len(),
				retry_ms = retry_in.as_millis() as u64,
				"chat rate limit reached; deferring"
			);
			return FlushOutcome::RateLimited { retry_in };
		}

		let item = loop {
			match self.items.pop_front() {
				Some(item) if item.payload.trim().is_empty() => continue,
				Some(item) => break item,
				None => return FlushOutcome::Idle,
			}
		};

		let line = item.line();
		let outcome = match sink.write_line(&line).await {
			Ok(()) => {
				self.sent.push_back(now);
				metrics::counter!("chirp_chat_messages_sent_total").increment(1);
				FlushOutcome::Sent {
					next_in: self.next_delay(),
				}
			}
			Err(e) => {
				metrics::counter!("chirp_chat_send_failures_total").increment(1);
				warn!(error = %e, "chat write failed; requeueing");
				self.requeue_front(item);
				FlushOutcome::WriteFailed {
					retry_in: self.cfg.retry_delay,
				}
			}
		};
		metrics::gauge!("chirp_chat_queue_depth").set(self.items.len() as f64);
		outcome
	}
}

/// Split text into chat-sized pieces.
///
/// Lines are split on `\n`, trimmed and emptied lines dropped. Pieces longer
/// than `max_len` characters are cut at the last space that fits, or hard
/// cut. When more than one piece results, each gets an `[i/n]` marker and
/// the cut budget shrinks so the marked line still fits.
pub fn split_message(text: &str, max_len: usize) -> Vec<OutboundItem> {
	let segments: Vec<&str> = text.split('\n').map(str::trim).filter(|s| !s.is_empty()).collect();
	if segments.is_empty() {
		return Vec::new();
	}

	let max_len = max_len.max(1);
	let mut budget = max_len;
	loop {
		let pieces: Vec<&str> = segments.iter().flat_map(|s| cut_segment(s, budget)).collect();
		let total = pieces.len();
		if total == 1 {
			return vec![OutboundItem {
				payload: pieces[0].to_string(),
				part: None,
			}];
		}

		let fits = max_len.saturating_sub(marker_width(total)).max(1);
		if budget <= fits {
			return pieces
				.into_iter()
				.enumerate()
				.map(|(i, p)| OutboundItem {
					payload: p.to_string(),
					part: Some((i + 1, total)),
				})
				.collect();
		}
		budget = fits;
	}
}

/// Width of the widest `[i/n] ` marker for `total` parts.
fn marker_width(total: usize) -> usize {
	let digits = total.to_string().len();
	digits * 2 + 4
}

fn cut_segment(segment: &str, budget: usize) -> Vec<&str> {
	let mut out = Vec::new();
	let mut rest = segment;
	while let Some((limit, _)) = rest.char_indices().nth(budget) {
		// a space right at the limit rides along and is trimmed on send
		let cut = if rest[limit..].starts_with(' ') {
			limit + 1
		} else {
			match rest[..limit].rfind(' ') {
				Some(sp) if sp > 0 => sp + 1,
				_ => limit,
			}
		};
		out.push(&rest[..cut]);
		rest = &rest[cut..];
	}
	if !rest.is_empty() {
		out.push(rest);
	}
	out
}
