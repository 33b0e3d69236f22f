//! Realtime store abstraction for the communication server
//!
//! Provides a unified interface over the external key/value store that
//! downstream services (historian, model engine, alarm engine) consume,
//! with a Redis production backend and an in-memory backend for tests.

pub mod error;
pub mod numfmt;
pub mod traits;

#[cfg(feature = "redis-backend")]
pub mod redis_impl;

#[cfg(feature = "memory-backend")]
pub mod memory_impl;

pub use error::{Result, RtdbError};
pub use traits::{PubSubMessage, Rtdb};

#[cfg(feature = "redis-backend")]
pub use redis_impl::RedisRtdb;

#[cfg(feature = "memory-backend")]
pub use memory_impl::MemoryRtdb;
