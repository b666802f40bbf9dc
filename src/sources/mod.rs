//! Defines the contract between the cache layer and upstream services.
//!
//! A [Fetcher] is the only thing the cache layer knows about an upstream: something which can
//! asynchronously produce a batch of [Items](Item). Everything else (rate limits, pagination,
//! authentication, parsing) is the fetcher's business. Implementations of upstream protocols
//! live in this module - currently a generic Atom/RSS [feed](feed) fetcher.
//!
//! Items are plain JSON objects. The cache layer only ever looks at two of their fields, both
//! of which are configurable per service: the **id field** (used for keyed containers) and the
//! **updated field** (seconds since the epoch, used for freshness filtering).
//!
//! # Example
//!
//! ```
//! # use aquifer::sources::{Fetcher, Item};
//! # use async_trait::async_trait;
//! # use serde_json::json;
//! struct StaticSource;
//!
//! #[async_trait]
//! impl Fetcher for StaticSource {
//!     async fn fetch_items(&self) -> anyhow::Result<Vec<Item>> {
//!         Ok(vec![json!({ "id": "1", "updated": 100.0 })])
//!     }
//! }
//! ```
use async_trait::async_trait;

pub mod feed;

/// Represents a single cached item.
///
/// Items are schemaless JSON objects so that every upstream can carry whatever payload it
/// produces. The cache layer reads the configured id and updated fields and passes everything
/// else through untouched.
pub type Item = serde_json::Value;

/// Produces a batch of items from an upstream service.
///
/// This is the seam between the cache layer and the outside world. A fetch may take arbitrarily
/// long - callers are expected to wrap it into a timeout (see the **fetch_timeout** of a cache
/// strategy).
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches the current batch of items from the upstream service.
    ///
    /// Implementations should return everything the upstream currently offers. Freshness
    /// filtering against the store's watermark is performed by the caller, not by the fetcher.
    async fn fetch_items(&self) -> anyhow::Result<Vec<Item>>;
}

/// Reads the given string field from an item.
pub fn item_str<'a>(item: &'a Item, field: &str) -> Option<&'a str> {
    item.get(field).and_then(|value| value.as_str())
}

/// Reads an item's identity from the given field.
///
/// String ids are returned as they are, numeric ids are rendered to their decimal
/// representation - upstreams freely mix both, and an item must not lose its identity just
/// because its tracker numbers its entries.
pub fn item_id(item: &Item, field: &str) -> Option<String> {
    match item.get(field) {
        Some(serde_json::Value::String(id)) => Some(id.clone()),
        Some(serde_json::Value::Number(id)) => Some(id.to_string()),
        _ => None,
    }
}

/// Reads the given numeric field (seconds since the epoch) from an item.
pub fn item_f64(item: &Item, field: &str) -> Option<f64> {
    item.get(field).and_then(|value| value.as_f64())
}
