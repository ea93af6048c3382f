//! Core domain types and utilities for the gatepass service.
//!
//! This crate provides the foundational ID types and error handling
//! shared by the access-control, notification, and server crates.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{EventId, ParseIdError, SessionId};
