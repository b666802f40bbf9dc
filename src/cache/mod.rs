//! Implements the cache-aside core: containers, stores, the service registry, the query
//! executor and the auto-refresh worker.
//!
//! # Overview
//! Every upstream service is represented by a [Store](store::Store): an in-memory
//! [Container](container::Container) of items plus a freshness watermark. Queries are answered
//! by the [QueryExecutor](run::QueryExecutor) straight from the store; only when the store
//! cannot satisfy a query, the origin is consulted - and the fetched items are merged back in
//! before the response is built, so that concurrent callers profit immediately.
//!
//! The [ServiceRegistry](registry::ServiceRegistry) keeps track of which services exist, which
//! of them are enabled and which cache strategy governs each of them. The
//! [AutoRefreshWorker](refresh::AutoRefreshWorker) periodically walks all enabled services and
//! refreshes the ones which are due, so that queries rarely ever hit a cold store.
//!
//! # Choosing a container
//! An **ordered** container is a ring of the most recent items (think "the last 1500 posts") -
//! it answers list-style queries. A **keyed** container indexes items by their id field and
//! answers point lookups. Which one a service uses is part of its
//! [ServiceDescriptor](registry::ServiceDescriptor).
//!
//! # Errors
//! All operations of this module report failures via [ServiceError]. The query executor never
//! lets an error escape as a panic or a rejected future - it converts them into the error
//! envelope of its [QueryResponse](run::QueryResponse).
use std::time::Duration;

use thiserror::Error;

pub mod container;
pub mod refresh;
pub mod registry;
pub mod run;
pub mod store;

pub use container::Container;
pub use refresh::AutoRefreshWorker;
pub use registry::{CacheStrategy, Lifecycle, ServiceDescriptor, ServiceRegistry};
pub use run::{Query, QueryExecutor, QueryResponse};
pub use store::Store;

/// Enumerates the errors reported by the cache layer.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No service with the given name has been registered.
    #[error("No service named '{0}' is registered.")]
    ServiceNotFound(String),

    /// A service with the given name has already been registered.
    #[error("A service named '{0}' is already registered.")]
    ServiceAlreadyRegistered(String),

    /// The service cannot be enabled or disabled as it has no lifecycle controllers.
    #[error("The service '{0}' has no lifecycle controllers attached.")]
    NoLifecycleControllers(String),

    /// Fetching items from the origin took longer than the configured fetch timeout.
    #[error(
        "Fetching items for '{service}' timed out after {}.",
        crate::fmt::format_duration(*timeout)
    )]
    OriginFetchTimeout {
        /// The service being fetched.
        service: String,
        /// The timeout which was applied.
        timeout: Duration,
    },

    /// Fetching items from the origin failed.
    #[error("Fetching items for '{service}' failed: {cause}")]
    OriginFetchError {
        /// The service being fetched.
        service: String,
        /// The underlying fetch error.
        cause: anyhow::Error,
    },

    /// Neither the cache nor the origin produced any items for a query.
    #[error("Neither the cache nor the origin produced items for '{0}'.")]
    CacheMissUnsatisfied(String),

    /// The background worker has already been started.
    #[error("The worker is already running.")]
    WorkerAlreadyRunning,

    /// The background worker isn't running.
    #[error("The worker is not running.")]
    WorkerNotRunning,

    /// The cache strategy of a service is inconsistent.
    #[error("Invalid cache strategy for '{service}': {reason}")]
    InvalidStrategy {
        /// The service being registered.
        service: String,
        /// Describes which setting is inconsistent.
        reason: String,
    },
}

impl ServiceError {
    /// Returns a stable identifier for the error kind.
    ///
    /// This is what ends up in the **error** field of a
    /// [QueryResponse](run::QueryResponse) so that callers can match on it without parsing
    /// messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::ServiceNotFound(_) => "SERVICE_NOT_FOUND",
            ServiceError::ServiceAlreadyRegistered(_) => "SERVICE_ALREADY_REGISTERED",
            ServiceError::NoLifecycleControllers(_) => "NO_LIFECYCLE_CONTROLLERS",
            ServiceError::OriginFetchTimeout { .. } => "ORIGIN_FETCH_TIMEOUT",
            ServiceError::OriginFetchError { .. } => "ORIGIN_FETCH_ERROR",
            ServiceError::CacheMissUnsatisfied(_) => "CACHE_MISS_UNSATISFIED",
            ServiceError::WorkerAlreadyRunning => "WORKER_ALREADY_RUNNING",
            ServiceError::WorkerNotRunning => "WORKER_NOT_RUNNING",
            ServiceError::InvalidStrategy { .. } => "INVALID_STRATEGY",
        }
    }
}

/// Returns the current time as seconds since the epoch.
///
/// This is the time base of all freshness watermarks and of the **updated** fields of items.
pub(crate) fn now_epoch_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}
