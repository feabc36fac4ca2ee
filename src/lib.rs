//! Offline-first query and mutation cache for server entities.

pub mod cache;
pub mod config;
pub mod error;
pub mod query;
pub mod users;
