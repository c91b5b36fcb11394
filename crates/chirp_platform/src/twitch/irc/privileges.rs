#![forbid(unsafe_code)]

use serde::Serialize;

use super::tags::{Tags, decode_badges};

/// Role flags derived from a message's tags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Privileges {
	pub broadcaster: bool,
	pub moderator: bool,
	pub vip: bool,
	pub subscriber: bool,
	pub turbo: bool,
	pub bits: bool,
}

impl Privileges {
	/// Broadcaster or moderator.
	pub fn is_staff(&self) -> bool {
		self.broadcaster || self.moderator
	}
}

pub fn resolve_privileges(tags: &Tags) -> Privileges {
	let badges = decode_badges(tags.get("badges"));
	let user_type = tags.text("user-type").unwrap_or_default();

	let broadcaster = user_type == "broadcaster" || badges.contains("broadcaster");
	let moderator = matches!(user_type, "mod" | "global_mod" | "staff")
		|| tags.get("mod").and_then(|v| v.as_bool()).unwrap_or(false);

	Privileges {
		broadcaster,
		moderator,
		vip: badges.contains("vip"),
		subscriber: badges.contains("subscriber"),
		turbo: badges.contains("turbo"),
		bits: badges.contains("bits"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::twitch::irc::tags::decode_tags;

	#[test]
	fn broadcaster_badge_sets_broadcaster() {
		let p = resolve_privileges(&decode_tags("@badges=broadcaster/1,subscriber/0;mod=0;user-type="));
		assert!(p.broadcaster);
		assert!(p.subscriber);
		assert!(!p.moderator);
		assert!(!p.vip);
	}

	#[test]
	fn moderator_from_user_type_or_mod_tag() {
		assert!(resolve_privileges(&decode_tags("@user-type=mod")).moderator);
		assert!(resolve_privileges(&decode_tags("@user-type=global_mod")).moderator);
		assert!(resolve_privileges(&decode_tags("@user-type=staff")).moderator);
		assert!(resolve_privileges(&decode_tags("@mod=1")).moderator);
		assert!(!resolve_privileges(&decode_tags("@mod=0")).moderator);
	}

	#[test]
	fn badge_presence_flags() {
		let p = resolve_privileges(&decode_tags("@badges=vip/1,turbo/1,bits/100"));
		assert!(p.vip && p.turbo && p.bits);
		assert!(!p.is_staff());
	}

	#[test]
	fn no_tags_means_no_privileges() {
		assert_eq!(resolve_privileges(&Tags::new()), Privileges::default());
	}
}
