//! campus-bots: automated accounts for the campus community server.

pub mod autopost;
