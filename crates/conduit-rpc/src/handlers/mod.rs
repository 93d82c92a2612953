// crates/conduit-rpc/src/handlers/mod.rs
//
// Application procedures served by the dispatcher.
// Each module defines request/response types and handler functions
// for one procedure group.

pub mod time;
pub mod users;
