//! A protocol-aware jump proxy for PostgreSQL clients: the startup
//! message's `database` field encodes `host[:port]/database`, and this
//! crate parses it, rewrites it, dials the real backend, and streams
//! the session while virtualizing cancel keys.

pub mod cancel;
pub mod classify;
pub mod config;
pub mod driver;
pub mod error;
pub mod listener;
pub mod protocol;
pub mod tls;
