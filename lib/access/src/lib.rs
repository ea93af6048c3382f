//! Temporary access sessions gated by single-use tokens.
//!
//! The pieces, bottom to top:
//!
//! - [`token`]: opaque single-use token values and the issuer that
//!   binds them to pending sessions.
//! - [`session`]: the session record and its state machine.
//! - [`store`]: the persistence trait every backend implements, built
//!   around compare-and-set transitions.
//! - [`memory`]: an in-process store for tests and local runs.
//! - [`expiry`]: one-shot timers plus the overdue sweep.
//! - [`manager`]: the operations callers use.

pub mod expiry;
pub mod manager;
pub mod memory;
pub mod session;
pub mod store;
pub mod token;

pub use expiry::ExpiryScheduler;
pub use manager::{AccessError, OpenedAccess, SessionLimits, SessionManager, SessionStatus};
pub use memory::InMemorySessionStore;
pub use session::{AccessSession, ClosedBy, SessionState};
pub use store::{SessionStore, SessionStoreError, SessionUpdate};
pub use token::{AccessToken, TokenError, TokenIssuer};
