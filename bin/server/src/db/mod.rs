//! Database-backed persistence for the server.

pub mod session_store;

pub use session_store::PgSessionStore;
