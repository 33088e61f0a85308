//! Core traits and types for partition storage.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::http::{Request, Response};

/// Normalized lookup key: method plus absolute URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  canonical: String,
}

impl CacheKey {
  pub fn for_request(request: &Request) -> Self {
    let mut url = request.url.clone();
    url.set_fragment(None);
    Self {
      canonical: format!("{} {}", request.method, url),
    }
  }

  /// Readable form, e.g. "GET https://example.com/index.html"
  pub fn as_str(&self) -> &str {
    &self.canonical
  }

  /// SHA256 hash for stable, fixed-length storage keys
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.canonical.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.canonical)
  }
}

/// Listing row for a stored entry.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub key: String,
  pub status: u16,
  pub size: usize,
  pub cached_at: DateTime<Utc>,
}

/// Trait for partition storage backends.
///
/// Every write replaces a whole entry, so concurrent writers for the same key
/// can only race to "last write wins".
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the partition if it does not exist yet.
  fn open(&self, partition: &str) -> Result<()>;

  /// Look up a key in one partition. A missing partition is a miss.
  fn match_in(&self, partition: &str, key: &CacheKey) -> Result<Option<Response>>;

  /// Look up a key across all partitions, oldest partition first.
  fn match_any(&self, key: &CacheKey) -> Result<Option<Response>>;

  /// Store a response, creating the partition on demand.
  fn put(&self, partition: &str, key: &CacheKey, response: &Response) -> Result<()>;

  /// Delete a partition and all its entries. Returns whether it existed.
  fn delete(&self, partition: &str) -> Result<bool>;

  /// Names of all partitions, oldest first.
  fn keys(&self) -> Result<Vec<String>>;

  /// Entries stored in a partition.
  fn entries(&self, partition: &str) -> Result<Vec<CachedEntry>>;
}

/// Which router versions the host currently knows about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registration {
  /// Version controlling pages
  pub active: Option<String>,
  /// Installed version waiting to take over
  pub waiting: Option<String>,
}

/// Persistence for the host's registration record.
pub trait Registry: Send + Sync + 'static {
  fn load_registration(&self) -> Result<Registration>;

  fn store_registration(&self, registration: &Registration) -> Result<()>;
}
