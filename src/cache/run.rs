//! Answers queries using the cache-aside pattern.
//!
//! The happy path is a pure in-memory read: evaluate the query against the service's store and
//! respond. Only when the store cannot satisfy the query, the origin is consulted - under the
//! service's **fetch_timeout**, and with the fetched items merged back into the store *before*
//! the response is built. The response is then re-evaluated from the store, so the first
//! caller sees exactly what the next caller will see.
//!
//! Concurrent misses for the same service are collapsed into a single origin fetch: the miss
//! path runs under the store's refresh lock and re-evaluates after acquiring it, so all but the
//! first caller are answered from the freshly merged items.
//!
//! The executor is a boundary: it never panics and never rejects - every failure is converted
//! into the error envelope of its [QueryResponse].
use std::fmt;
use std::sync::Arc;

use crate::cache::registry::ServiceRegistry;
use crate::cache::ServiceError;
use crate::sources::{Fetcher, Item};

/// Describes a single cache query.
///
/// A query always names its service. Everything else is optional: a point lookup via
/// [with_key](Query::with_key), a predicate via [with_filter](Query::with_filter), ordering
/// via [sorted_by](Query::sorted_by) / [reversed](Query::reversed) and a result bound via
/// [limited](Query::limited).
#[derive(Clone)]
pub struct Query {
    /// The service to query.
    pub service: String,
    /// Performs a point lookup for the item with this id.
    pub item_key: Option<String>,
    /// Retains only items for which this predicate holds.
    pub filter: Option<Arc<dyn Fn(&Item) -> bool + Send + Sync>>,
    /// Sorts the results by this field (ascending).
    pub sort_field: Option<String>,
    /// Reverses the result order after sorting.
    pub reverse: bool,
    /// Truncates the results to this many items.
    pub limit: Option<usize>,
}

impl Query {
    /// Creates a query for all items of the given service.
    pub fn new(service: impl AsRef<str>) -> Self {
        Query {
            service: service.as_ref().to_owned(),
            item_key: None,
            filter: None,
            sort_field: None,
            reverse: false,
            limit: None,
        }
    }

    /// Turns the query into a point lookup for the given item id.
    pub fn with_key(mut self, key: impl AsRef<str>) -> Self {
        self.item_key = Some(key.as_ref().to_owned());
        self
    }

    /// Retains only items for which the given predicate holds.
    pub fn with_filter(mut self, filter: impl Fn(&Item) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Sorts the results by the given field, ascending.
    pub fn sorted_by(mut self, field: impl AsRef<str>) -> Self {
        self.sort_field = Some(field.as_ref().to_owned());
        self
    }

    /// Reverses the result order (most useful combined with [sorted_by](Query::sorted_by)).
    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    /// Truncates the results to the given number of items.
    pub fn limited(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("service", &self.service)
            .field("item_key", &self.item_key)
            .field("filter", &self.filter.as_ref().map(|_| "<predicate>"))
            .field("sort_field", &self.sort_field)
            .field("reverse", &self.reverse)
            .field("limit", &self.limit)
            .finish()
    }
}

/// The uniform response envelope of the query executor.
///
/// Every response echoes the originating query, so a caller juggling several in-flight queries
/// can always tell which answer belongs to which question. A response either carries results
/// (with **error** and **message** absent) or an error (with **results** empty) - never both.
#[derive(Debug)]
pub struct QueryResponse {
    /// The query which was answered.
    pub query: Query,
    /// The items answering the query.
    pub results: Vec<Item>,
    /// The number of items in **results**.
    pub results_count: usize,
    /// A stable error identifier (see [ServiceError::kind]), if the query failed.
    pub error: Option<String>,
    /// A human readable description of the failure.
    pub message: Option<String>,
}

impl QueryResponse {
    /// Builds a successful response carrying the given results.
    pub fn success(query: Query, results: Vec<Item>) -> Self {
        QueryResponse {
            query,
            results_count: results.len(),
            results,
            error: None,
            message: None,
        }
    }

    /// Builds a failure response for the given error.
    pub fn failure(query: Query, error: &ServiceError) -> Self {
        QueryResponse {
            query,
            results: Vec::new(),
            results_count: 0,
            error: Some(error.kind().to_owned()),
            message: Some(error.to_string()),
        }
    }

    /// Returns the name of the queried service.
    pub fn service(&self) -> &str {
        &self.query.service
    }

    /// Determines if the query was answered successfully.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Answers queries from the cache, falling back to the origin on a miss.
pub struct QueryExecutor {
    registry: Arc<ServiceRegistry>,
}

impl QueryExecutor {
    /// Creates an executor answering queries against the given registry.
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        QueryExecutor { registry }
    }

    /// Runs the given query.
    ///
    /// If the service's store can satisfy the query, no origin fetch happens at all. On a miss
    /// the origin (or the given **fallback** fetcher, if present) is consulted under the
    /// service's fetch timeout; the result is merged into the store and the query is answered
    /// from the merged state. If even that yields nothing, the response carries a
    /// **CACHE_MISS_UNSATISFIED** error.
    ///
    /// This method never panics and never rejects - all failures are reported within the
    /// response envelope.
    pub async fn run(&self, query: Query, fallback: Option<Arc<dyn Fetcher>>) -> QueryResponse {
        let entry = match self.registry.entry(&query.service) {
            Ok(entry) => entry,
            Err(error) => return QueryResponse::failure(query, &error),
        };
        let store = entry.store();

        let results = store.evaluate(&query);
        if !results.is_empty() {
            return QueryResponse::success(query, results);
        }

        {
            let _guard = store.lock_refresh().await;

            // Another caller might have refilled the store while we waited for the lock...
            let results = store.evaluate(&query);
            if !results.is_empty() {
                return QueryResponse::success(query, results);
            }

            let items = match store
                .timed_fetch(fallback.as_deref(), entry.strategy().fetch_timeout)
                .await
            {
                Ok(items) => items,
                Err(error) => {
                    log::warn!("Cache miss for '{}' not recoverable: {}", &query.service, error);
                    return QueryResponse::failure(query, &error);
                }
            };

            // The merge is awaited before we respond, so the response below is consistent
            // with what the next caller will see...
            let _ = store.update_with(items).await;
        }

        let results = store.evaluate(&query);
        if results.is_empty() {
            let error = ServiceError::CacheMissUnsatisfied(query.service.clone());
            QueryResponse::failure(query, &error)
        } else {
            QueryResponse::success(query, results)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::cache::registry::{ServiceDescriptor, ServiceRegistry};
    use crate::cache::run::{Query, QueryExecutor};
    use crate::sources::{Fetcher, Item};

    struct CountingFetcher {
        items: Vec<Item>,
        delay: Duration,
        fetches: AtomicUsize,
    }

    impl CountingFetcher {
        fn new(items: Vec<Item>) -> Arc<Self> {
            Arc::new(CountingFetcher {
                items,
                delay: Duration::from_millis(0),
                fetches: AtomicUsize::new(0),
            })
        }

        fn slow(items: Vec<Item>, delay: Duration) -> Arc<Self> {
            Arc::new(CountingFetcher {
                items,
                delay,
                fetches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Fetcher for CountingFetcher {
        async fn fetch_items(&self) -> anyhow::Result<Vec<Item>> {
            let _ = self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.items.clone())
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl Fetcher for FailingFetcher {
        async fn fetch_items(&self) -> anyhow::Result<Vec<Item>> {
            Err(anyhow::anyhow!("origin is down"))
        }
    }

    async fn setup(fetcher: Arc<dyn Fetcher>) -> (Arc<ServiceRegistry>, QueryExecutor) {
        let registry = Arc::new(ServiceRegistry::new(None));
        registry
            .register(ServiceDescriptor::new("forums", fetcher))
            .await
            .unwrap();
        let executor = QueryExecutor::new(registry.clone());

        (registry, executor)
    }

    #[test]
    fn a_miss_consults_the_origin_and_caches_the_result() {
        crate::testing::test_async(async {
            let fetcher = CountingFetcher::new(vec![json!({ "id": "1", "updated": 10.0 })]);
            let (_registry, executor) = setup(fetcher.clone()).await;

            let response = executor.run(Query::new("forums"), None).await;
            assert_eq!(response.is_success(), true);
            assert_eq!(response.results_count, 1);
            assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);

            // The second query is a pure cache hit...
            let response = executor.run(Query::new("forums"), None).await;
            assert_eq!(response.results_count, 1);
            assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn prepopulated_stores_answer_without_any_fetch() {
        crate::testing::test_async(async {
            let fetcher = CountingFetcher::new(Vec::new());
            let (registry, executor) = setup(fetcher.clone()).await;

            let entry = registry.entry("forums").unwrap();
            let _ = entry
                .store()
                .update_with(vec![json!({ "id": "x", "updated": 100.0 })])
                .await;

            let response = executor.run(Query::new("forums").with_key("x"), None).await;
            assert_eq!(response.results_count, 1);
            assert_eq!(response.results[0]["id"].as_str().unwrap(), "x");

            // The hit never reached the origin...
            assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn concurrent_misses_share_a_single_fetch() {
        crate::testing::test_async(async {
            let fetcher = CountingFetcher::slow(
                vec![json!({ "id": "1", "updated": 10.0 })],
                Duration::from_millis(50),
            );
            let (_registry, executor) = setup(fetcher.clone()).await;

            let (first, second) = tokio::join!(
                executor.run(Query::new("forums"), None),
                executor.run(Query::new("forums"), None)
            );

            assert_eq!(first.is_success(), true);
            assert_eq!(second.is_success(), true);

            // Both callers were answered, yet the origin was consulted only once...
            assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn unknown_services_yield_an_error_envelope() {
        crate::testing::test_async(async {
            let (_registry, executor) = setup(CountingFetcher::new(Vec::new())).await;

            let response = executor.run(Query::new("unknown"), None).await;
            assert_eq!(response.is_success(), false);
            assert_eq!(response.error.as_deref(), Some("SERVICE_NOT_FOUND"));
            assert_eq!(response.results_count, 0);
            assert_eq!(response.message.is_some(), true);
        });
    }

    #[test]
    fn origin_failures_become_error_envelopes() {
        crate::testing::test_async(async {
            let (_registry, executor) = setup(Arc::new(FailingFetcher)).await;

            let response = executor.run(Query::new("forums"), None).await;
            assert_eq!(response.error.as_deref(), Some("ORIGIN_FETCH_ERROR"));
            assert_eq!(response.results.is_empty(), true);
        });
    }

    #[test]
    fn an_unsatisfiable_miss_is_reported_as_such() {
        crate::testing::test_async(async {
            // The origin answers, but has nothing to offer...
            let (_registry, executor) = setup(CountingFetcher::new(Vec::new())).await;

            let response = executor.run(Query::new("forums"), None).await;
            assert_eq!(response.error.as_deref(), Some("CACHE_MISS_UNSATISFIED"));
        });
    }

    #[test]
    fn a_fallback_fetcher_takes_precedence_on_a_miss() {
        crate::testing::test_async(async {
            let origin = CountingFetcher::new(Vec::new());
            let fallback = CountingFetcher::new(vec![json!({ "id": "9", "updated": 5.0 })]);
            let fallback_fetcher: Arc<dyn Fetcher> = fallback.clone();
            let (_registry, executor) = setup(origin.clone()).await;

            let response = executor
                .run(Query::new("forums"), Some(fallback_fetcher))
                .await;

            assert_eq!(response.results_count, 1);
            assert_eq!(origin.fetches.load(Ordering::SeqCst), 0);
            assert_eq!(fallback.fetches.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn responses_echo_the_originating_query() {
        crate::testing::test_async(async {
            let fetcher = CountingFetcher::new(vec![json!({ "id": "1", "updated": 10.0 })]);
            let (_registry, executor) = setup(fetcher).await;

            let response = executor
                .run(Query::new("forums").with_key("1").limited(7), None)
                .await;
            assert_eq!(response.service(), "forums");
            assert_eq!(response.query.item_key.as_deref(), Some("1"));
            assert_eq!(response.query.limit, Some(7));

            // Failures carry the query as well...
            let response = executor.run(Query::new("unknown").limited(3), None).await;
            assert_eq!(response.is_success(), false);
            assert_eq!(response.service(), "unknown");
            assert_eq!(response.query.limit, Some(3));
        });
    }

    #[test]
    fn point_lookups_fetch_once_and_then_hit() {
        crate::testing::test_async(async {
            let fetcher = CountingFetcher::new(vec![
                json!({ "id": "a", "updated": 1.0 }),
                json!({ "id": "b", "updated": 2.0 }),
            ]);
            let registry = Arc::new(ServiceRegistry::new(None));
            registry
                .register(ServiceDescriptor::new("users", fetcher.clone()).keyed())
                .await
                .unwrap();
            let executor = QueryExecutor::new(registry.clone());

            let response = executor.run(Query::new("users").with_key("b"), None).await;
            assert_eq!(response.results_count, 1);
            assert_eq!(response.results[0]["id"].as_str().unwrap(), "b");

            // The sibling item was cached by the same fetch...
            let response = executor.run(Query::new("users").with_key("a"), None).await;
            assert_eq!(response.results_count, 1);
            assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
        });
    }
}
