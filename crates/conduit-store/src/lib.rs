// crates/conduit-store/src/lib.rs
//
// conduit-store: Persistence collaborator for the Conduit user procedures.
//
// Provides an in-memory `UserStore` with serial ids and a unique email
// constraint, matching the record semantics the procedures expect from a
// relational backend.

pub mod memory;

pub use memory::MemoryUserStore;
