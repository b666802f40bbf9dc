//! Provides the per-service store: a container plus a freshness watermark.
//!
//! A store answers queries purely from memory ([evaluate](Store::evaluate) never suspends) and
//! is filled by [refresh](Store::refresh): fetch from the origin, drop everything which isn't
//! newer than the watermark, merge the rest into the container and advance the watermark.
//!
//! The watermark (**last_refresh**, seconds since the epoch) is what keeps merges cheap: a
//! chatty origin which mostly re-sends known items only contributes the genuinely new ones.
//! Note that a successful refresh advances the watermark even if it contributed zero items -
//! "nothing new" is a refresh outcome, and not advancing would make us re-filter the same batch
//! on every pass. A failed or timed-out fetch on the other hand never touches the watermark.
//!
//! All refreshes of a store are serialized through an async mutex. This is also what provides
//! single-flight behaviour for cache misses: concurrent misses for the same service queue up on
//! this lock, and all but the first are answered by a re-evaluation instead of another origin
//! fetch (see [QueryExecutor](crate::cache::run::QueryExecutor)).
use std::cmp::Ordering;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde_json::json;

use crate::average::Average;
use crate::cache::container::Container;
use crate::cache::run::Query;
use crate::cache::{now_epoch_seconds, ServiceError};
use crate::kv::KvStore;
use crate::sources::{item_f64, Fetcher, Item};

/// Keeps the cached items and the freshness watermark of a single service.
pub struct Store {
    name: String,
    updated_field: String,
    state: RwLock<State>,
    refresh_lock: tokio::sync::Mutex<()>,
    fetcher: Arc<dyn Fetcher>,
    kv: Option<Arc<KvStore>>,
    fetch_metrics: Average,
}

struct State {
    container: Container,
    last_refresh: Option<f64>,
}

impl Store {
    /// Creates a new store for the given service.
    ///
    /// If a [KvStore] is supplied, every merge persists a snapshot and
    /// [restore](Store::restore) can read it back after a restart.
    pub fn new(
        name: impl AsRef<str>,
        container: Container,
        updated_field: impl AsRef<str>,
        fetcher: Arc<dyn Fetcher>,
        kv: Option<Arc<KvStore>>,
    ) -> Self {
        Store {
            name: name.as_ref().to_owned(),
            updated_field: updated_field.as_ref().to_owned(),
            state: RwLock::new(State {
                container,
                last_refresh: None,
            }),
            refresh_lock: tokio::sync::Mutex::new(()),
            fetcher,
            kv,
            fetch_metrics: Average::new(),
        }
    }

    /// Returns the name of the service this store belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the key under which this store persists its snapshot.
    pub fn kv_key(&self) -> String {
        format!("{}_default", &self.name)
    }

    /// Returns the freshness watermark or **None** for a store which was never refreshed.
    pub fn last_refresh(&self) -> Option<f64> {
        self.state.read().unwrap().last_refresh
    }

    #[cfg(test)]
    pub(crate) fn set_last_refresh(&self, watermark: Option<f64>) {
        self.state.write().unwrap().last_refresh = watermark;
    }

    /// Returns the number of items currently cached.
    pub fn len(&self) -> usize {
        self.state.read().unwrap().container.len()
    }

    /// Determines if the store holds no items at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of origin fetches performed so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetch_metrics.count()
    }

    /// Returns the sliding average duration of the last origin fetches in microseconds.
    pub fn avg_fetch_micros(&self) -> i32 {
        self.fetch_metrics.avg()
    }

    /// Answers the given query from memory.
    ///
    /// This is a pure read - it never suspends and never consults the origin. A query with an
    /// **item_key** performs a point lookup, everything else yields the (optionally filtered,
    /// sorted and limited) item list. An empty result simply means the cache cannot satisfy
    /// the query - deciding what to do about that is the caller's business.
    pub fn evaluate(&self, query: &Query) -> Vec<Item> {
        let state = self.state.read().unwrap();

        if let Some(key) = &query.item_key {
            return match state.container.get(key) {
                Some(item) => vec![item.clone()],
                None => Vec::new(),
            };
        }

        let mut results: Vec<Item> = state
            .container
            .iter()
            .filter(|item| match &query.filter {
                Some(predicate) => predicate(item),
                None => true,
            })
            .cloned()
            .collect();

        if let Some(field) = &query.sort_field {
            results.sort_by(|left, right| compare_by_field(left, right, field));
        }
        if query.reverse {
            results.reverse();
        }
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }

        results
    }

    /// Fetches the current batch of items from this store's own origin.
    ///
    /// The fetch duration is recorded in the store's metrics. Note that this performs a raw
    /// fetch - no timeout and no merge. Use [refresh](Store::refresh) for the full cycle.
    pub async fn fetch_items(&self) -> anyhow::Result<Vec<Item>> {
        let watch = Instant::now();
        let result = self.fetcher.fetch_items().await;
        self.fetch_metrics.add(watch.elapsed().as_micros() as i32);

        result
    }

    /// Drops all items which aren't strictly newer than the watermark.
    ///
    /// A store which was never refreshed keeps everything. An item without a readable updated
    /// field is kept as well - it cannot be proven stale, and the container deduplicates it on
    /// merge anyway.
    pub fn filter_fresh(&self, items: Vec<Item>) -> Vec<Item> {
        let watermark = match self.last_refresh() {
            Some(watermark) => watermark,
            None => return items,
        };

        items
            .into_iter()
            .filter(|item| match item_f64(item, &self.updated_field) {
                Some(updated) => updated > watermark,
                None => true,
            })
            .collect()
    }

    /// Merges the given items into the container and advances the watermark.
    ///
    /// Returns the number of items which actually changed the container. The watermark is
    /// advanced even if that number is zero - the refresh itself succeeded. If a [KvStore] is
    /// attached, the new state is persisted (failures are logged, the in-memory state is
    /// authoritative).
    pub async fn update_with(&self, items: Vec<Item>) -> usize {
        let fresh = self.filter_fresh(items);

        let merged = {
            let mut state = self.state.write().unwrap();
            let merged = state.container.insert_all(fresh);
            state.last_refresh = Some(now_epoch_seconds());
            merged
        };

        if let Err(error) = self.persist().await {
            log::warn!("Failed to persist snapshot of '{}': {}", &self.name, error);
        }

        merged
    }

    /// Performs a full refresh cycle: fetch under the given timeout, then merge.
    ///
    /// Returns the number of merged items. A timed-out or failed fetch leaves both the
    /// container and the watermark untouched.
    pub async fn refresh(&self, timeout: Duration) -> Result<usize, ServiceError> {
        let _guard = self.refresh_lock.lock().await;
        let items = self.timed_fetch(None, timeout).await?;

        Ok(self.update_with(items).await)
    }

    /// Acquires the refresh lock of this store.
    ///
    /// The query executor uses this to provide single-flight misses: it holds the guard across
    /// its re-evaluate / fetch / merge sequence.
    pub(crate) async fn lock_refresh(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.refresh_lock.lock().await
    }

    /// Fetches from the given fetcher (or this store's own one) under the given timeout.
    ///
    /// The caller is expected to hold the refresh lock.
    pub(crate) async fn timed_fetch(
        &self,
        fetcher: Option<&dyn Fetcher>,
        timeout: Duration,
    ) -> Result<Vec<Item>, ServiceError> {
        let watch = Instant::now();
        let fetch = match fetcher {
            Some(fetcher) => fetcher.fetch_items(),
            None => self.fetcher.fetch_items(),
        };

        let result = match tokio::time::timeout(timeout, fetch).await {
            Ok(Ok(items)) => Ok(items),
            Ok(Err(cause)) => Err(ServiceError::OriginFetchError {
                service: self.name.clone(),
                cause,
            }),
            Err(_) => Err(ServiceError::OriginFetchTimeout {
                service: self.name.clone(),
                timeout,
            }),
        };
        self.fetch_metrics.add(watch.elapsed().as_micros() as i32);

        result
    }

    /// Evicts all items which are older than the given decay duration.
    ///
    /// Items without a readable updated field are retained. Returns the number of evicted
    /// items.
    pub fn evict_decayed(&self, decay: Duration) -> usize {
        let cutoff = now_epoch_seconds() - decay.as_secs_f64();

        self.state
            .write()
            .unwrap()
            .container
            .retain(|item| match item_f64(item, &self.updated_field) {
                Some(updated) => updated >= cutoff,
                None => true,
            })
    }

    /// Persists the current state into the attached [KvStore].
    ///
    /// A store without an attached [KvStore] treats this as a no-op.
    pub async fn persist(&self) -> anyhow::Result<()> {
        let kv = match &self.kv {
            Some(kv) => kv.clone(),
            None => return Ok(()),
        };

        let snapshot = {
            let state = self.state.read().unwrap();
            json!({
                "items": state.container.to_snapshot(),
                "last_refresh": state.last_refresh,
            })
        };

        kv.put(&self.kv_key(), &snapshot).await
    }

    /// Restores a previously persisted snapshot, returning the number of restored items.
    ///
    /// A missing snapshot (first start) restores nothing and isn't an error.
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let kv = match &self.kv {
            Some(kv) => kv.clone(),
            None => return Ok(0),
        };

        let snapshot = match kv.get(&self.kv_key()).await? {
            Some(snapshot) => snapshot,
            None => return Ok(0),
        };

        let mut state = self.state.write().unwrap();
        let restored = state.container.load_snapshot(&snapshot["items"]);
        state.last_refresh = snapshot["last_refresh"].as_f64();

        Ok(restored)
    }
}

/// Compares two items by the given field.
///
/// Numeric values are compared numerically, everything else falls back to a string
/// comparison. Missing fields sort first.
fn compare_by_field(left: &Item, right: &Item, field: &str) -> Ordering {
    let left_value = left.get(field);
    let right_value = right.get(field);

    match (
        left_value.and_then(|value| value.as_f64()),
        right_value.and_then(|value| value.as_f64()),
    ) {
        (Some(left), Some(right)) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
        _ => {
            let left = left_value.and_then(|value| value.as_str()).unwrap_or("");
            let right = right_value.and_then(|value| value.as_str()).unwrap_or("");
            left.cmp(right)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::cache::container::Container;
    use crate::cache::run::Query;
    use crate::cache::store::Store;
    use crate::cache::ServiceError;
    use crate::kv::KvStore;
    use crate::sources::{Fetcher, Item};

    struct StaticFetcher {
        items: Vec<Item>,
        delay: Duration,
    }

    impl StaticFetcher {
        fn new(items: Vec<Item>) -> Arc<Self> {
            Arc::new(StaticFetcher {
                items,
                delay: Duration::from_millis(0),
            })
        }

        fn slow(items: Vec<Item>, delay: Duration) -> Arc<Self> {
            Arc::new(StaticFetcher { items, delay })
        }
    }

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch_items(&self) -> anyhow::Result<Vec<Item>> {
            tokio::time::sleep(self.delay).await;
            Ok(self.items.clone())
        }
    }

    fn test_store(fetcher: Arc<dyn Fetcher>) -> Store {
        Store::new(
            "test",
            Container::ordered(10, "id"),
            "updated",
            fetcher,
            None,
        )
    }

    #[test]
    fn cold_stores_keep_everything() {
        let store = test_store(StaticFetcher::new(Vec::new()));

        let items = vec![
            json!({ "id": "a", "updated": 50.0 }),
            json!({ "id": "b", "updated": 150.0 }),
        ];

        assert_eq!(store.filter_fresh(items).len(), 2);
    }

    #[test]
    fn filter_fresh_drops_items_at_or_below_the_watermark() {
        let store = test_store(StaticFetcher::new(Vec::new()));
        store.set_last_refresh(Some(100.0));

        let fresh = store.filter_fresh(vec![
            json!({ "id": "a", "updated": 50.0 }),
            json!({ "id": "b", "updated": 100.0 }),
            json!({ "id": "c", "updated": 150.0 }),
            json!({ "id": "d" }),
        ]);

        // Strictly newer wins, the boundary value is stale. An item without a timestamp
        // cannot be proven stale and is kept...
        let ids: Vec<&str> = fresh.iter().map(|item| item["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["c", "d"]);
    }

    #[test]
    fn update_with_advances_the_watermark_even_for_zero_items() {
        crate::testing::test_async(async {
            let store = test_store(StaticFetcher::new(Vec::new()));
            store.set_last_refresh(Some(100.0));

            let merged = store.update_with(Vec::new()).await;
            assert_eq!(merged, 0);

            // "Nothing new" is still a successful refresh...
            assert_eq!(store.last_refresh().unwrap() > 100.0, true);
        });
    }

    #[test]
    fn a_timed_out_fetch_never_advances_the_watermark() {
        crate::testing::test_async(async {
            let store = test_store(StaticFetcher::slow(
                vec![json!({ "id": "a" })],
                Duration::from_millis(250),
            ));

            match store.refresh(Duration::from_millis(10)).await {
                Err(ServiceError::OriginFetchTimeout { service, .. }) => {
                    assert_eq!(service, "test")
                }
                _ => panic!("Expected a timeout"),
            }

            assert_eq!(store.last_refresh(), None);
            assert_eq!(store.is_empty(), true);
        });
    }

    #[test]
    fn refresh_merges_and_counts_fetches() {
        crate::testing::test_async(async {
            let store = test_store(StaticFetcher::new(vec![
                json!({ "id": "a", "updated": 50.0 }),
                json!({ "id": "b", "updated": 150.0 }),
            ]));

            assert_eq!(store.refresh(Duration::from_secs(1)).await.unwrap(), 2);
            assert_eq!(store.len(), 2);
            assert_eq!(store.fetch_count(), 1);

            // A second refresh only fetches - everything is stale now...
            assert_eq!(store.refresh(Duration::from_secs(1)).await.unwrap(), 0);
            assert_eq!(store.fetch_count(), 2);
        });
    }

    #[test]
    fn evaluate_supports_point_lookups_filters_and_limits() {
        crate::testing::test_async(async {
            let store = test_store(StaticFetcher::new(Vec::new()));
            let _ = store
                .update_with(vec![
                    json!({ "id": "a", "updated": 10.0, "flag": true }),
                    json!({ "id": "b", "updated": 30.0, "flag": false }),
                    json!({ "id": "c", "updated": 20.0, "flag": true }),
                ])
                .await;

            // Point lookup...
            let hit = store.evaluate(&Query::new("test").with_key("b"));
            assert_eq!(hit.len(), 1);
            assert_eq!(hit[0]["id"].as_str().unwrap(), "b");
            assert_eq!(store.evaluate(&Query::new("test").with_key("x")).len(), 0);

            // Filtered, sorted descending, limited...
            let query = Query::new("test")
                .with_filter(|item| item["flag"].as_bool().unwrap_or(false))
                .sorted_by("updated")
                .reversed()
                .limited(1);
            let results = store.evaluate(&query);
            assert_eq!(results.len(), 1);
            assert_eq!(results[0]["id"].as_str().unwrap(), "c");

            // Evaluation is a pure read - it never consulted the origin...
            assert_eq!(store.fetch_count(), 0);
        });
    }

    #[test]
    fn decayed_items_are_evicted() {
        crate::testing::test_async(async {
            let store = test_store(StaticFetcher::new(Vec::new()));
            let now = crate::cache::now_epoch_seconds();
            let _ = store
                .update_with(vec![
                    json!({ "id": "old", "updated": now - 1000.0 }),
                    json!({ "id": "new", "updated": now }),
                    json!({ "id": "timeless" }),
                ])
                .await;

            assert_eq!(store.evict_decayed(Duration::from_secs(100)), 1);
            assert_eq!(store.len(), 2);
            assert_eq!(
                store.evaluate(&Query::new("test").with_key("old")).len(),
                0
            );
        });
    }

    #[test]
    fn snapshots_survive_a_persist_restore_cycle() {
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();

        crate::testing::test_async(async {
            let kv = Arc::new(KvStore::open().await.unwrap());
            kv.delete("snapshot-test_default").await.unwrap();

            let store = Store::new(
                "snapshot-test",
                Container::ordered(10, "id"),
                "updated",
                StaticFetcher::new(Vec::new()),
                Some(kv.clone()),
            );
            let _ = store
                .update_with(vec![json!({ "id": "a", "updated": 50.0 })])
                .await;
            let watermark = store.last_refresh().unwrap();

            // A fresh store instance reads the snapshot back...
            let restored = Store::new(
                "snapshot-test",
                Container::ordered(10, "id"),
                "updated",
                StaticFetcher::new(Vec::new()),
                Some(kv.clone()),
            );
            assert_eq!(restored.restore().await.unwrap(), 1);
            assert_eq!(restored.len(), 1);
            assert_eq!(restored.last_refresh().unwrap(), watermark);

            kv.delete("snapshot-test_default").await.unwrap();
        });
    }
}
