#![forbid(unsafe_code)]

pub mod eventsub;
pub mod helix;
pub mod irc;
