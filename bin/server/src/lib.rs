//! gatepass access session server.
//!
//! This crate wires the session manager to PostgreSQL, NATS, and the
//! JSON HTTP facade.

pub mod config;
pub mod db;
pub mod http;
