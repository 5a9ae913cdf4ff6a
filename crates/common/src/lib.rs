//! Shared building blocks for the herald binaries: domain types, configuration,
//! the notification store, and connection helpers.

pub mod config;
pub mod db;
pub mod error;
pub mod redis_pool;
pub mod store;
pub mod types;
