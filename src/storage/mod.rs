//! Token storage backends
//!
//! Durable credential storage for the token store: Redis in production, an
//! in-memory map for development and tests.

pub mod in_memory;
pub mod redis;

pub use self::in_memory::InMemoryTokenStorage;
pub use self::redis::RedisTokenStorage;
