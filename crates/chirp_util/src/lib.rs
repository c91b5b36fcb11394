#![forbid(unsafe_code)]

pub mod backoff {
	use std::time::Duration;

	/// How the delay grows between consecutive reconnect attempts.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub enum BackoffCurve {
		/// `base * n`
		Linear,
		/// `base * 2^(n-1)`
		Exponential,
	}

	/// Reconnect policy: delay curve, delay cap and attempt budget.
	///
	/// Attempts are numbered from 1. `delay_for(n)` returns `None` once `n`
	/// exceeds `max_attempts`, which callers treat as "give up".
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct ReconnectPolicy {
		pub curve: BackoffCurve,
		pub base: Duration,
		pub max_delay: Duration,
		pub max_attempts: u32,
	}

	impl ReconnectPolicy {
		pub const fn linear(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
			Self {
				curve: BackoffCurve::Linear,
				base,
				max_delay,
				max_attempts,
			}
		}

		pub const fn exponential(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
			Self {
				curve: BackoffCurve::Exponential,
				base,
				max_delay,
				max_attempts,
			}
		}

		/// Delay before attempt `attempt` (1-based), or `None` when the budget is spent.
		pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
			if attempt == 0 {
				return Some(Duration::ZERO);
			}
			if attempt > self.max_attempts {
				return None;
			}

			let base_ms = self.base.as_millis();
			let ms = match self.curve {
				BackoffCurve::Linear => base_ms.saturating_mul(attempt as u128),
				BackoffCurve::Exponential => {
					let pow = (attempt - 1).min(32);
					base_ms.saturating_mul(1u128 << pow)
				}
			};
			let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
			Some(d.min(self.max_delay))
		}

		pub fn is_exhausted(&self, attempts_made: u32) -> bool {
			attempts_made >= self.max_attempts
		}
	}

}

pub mod env {
	/// Parse common boolean spellings (`1/0`, `true/false`, `yes/no`, `on/off`).
	pub fn parse_bool(v: &str) -> Option<bool> {
		match v.trim().to_ascii_lowercase().as_str() {
			"1" | "true" | "yes" | "on" => Some(true),
			"0" | "false" | "no" | "off" => Some(false),
			_ => None,
		}
	}

	/// Non-empty, trimmed value of an environment variable.
	pub fn var_non_empty(key: &str) -> Option<String> {
		std::env::var(key)
			.ok()
			.map(|v| v.trim().to_string())
			.filter(|v| !v.is_empty())
	}

	/// Uppercase a bot name into an env-var-safe segment (`my-bot` -> `MY_BOT`).
	pub fn key_segment(name: &str) -> String {
		name.trim()
			.chars()
			.map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
			.collect()
	}

}
