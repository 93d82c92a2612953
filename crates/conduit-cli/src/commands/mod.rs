// crates/conduit-cli/src/commands/mod.rs
//
// Command module declarations for the Conduit CLI.

pub mod health;
pub mod time;
pub mod users;
