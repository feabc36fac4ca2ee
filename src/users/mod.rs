//! The user entity: HTTP backend, query keys, and a cached client.

mod cache;
mod cached_client;
mod client;
mod types;

pub use cache::UserKeys;
pub use cached_client::CachedUserClient;
pub use client::{UserApi, UserBackend, DEFAULT_API_URL};
pub use types::User;
