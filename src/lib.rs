//! Fathom library crate
//!
//! Exposes the explanation pipeline so tests and external tooling can
//! exercise it without going through CLI startup.

pub mod admin;
pub mod canonicalize;
pub mod config;
pub mod error;
pub mod flow;
pub mod gateway;
pub mod normalize;
pub mod prompt;
pub mod query;
pub mod rate_limit;
pub mod schema;
pub mod store;
