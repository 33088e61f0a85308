//! Named, versioned cache partitions and the strategies that fill them.
//!
//! This module provides:
//! - The partition storage API (`CacheStorage`) with SQLite and in-memory backends
//! - Request keys normalized to method + absolute URL
//! - Cache-first and network-first strategies with detached writes
//! - Persistence of the host's registration record (`Registry`)

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{MemoryStorage, SqliteStorage};
pub use traits::{CacheKey, CacheStorage, CachedEntry, Registration, Registry};
