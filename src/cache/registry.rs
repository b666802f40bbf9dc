//! Keeps track of all known services and their cache strategies.
//!
//! A service is registered via a [ServiceDescriptor] which names its upstream
//! [Fetcher](crate::sources::Fetcher), the shape of its container, the fields to read from its
//! items and the [CacheStrategy] governing refreshes. Registration creates the service's
//! [Store](crate::cache::store::Store) and, if a snapshot is available, immediately restores
//! it - a restart therefore doesn't begin with a cold cache.
//!
//! Services start out enabled. Toggling a service afterwards runs its [Lifecycle]
//! controllers - a service without controllers cannot be toggled at all, which is reported as
//! [ServiceError::NoLifecycleControllers]. Only enabled services participate in
//! auto-refreshing.
//!
//! The registry itself is plain instance state: it is created by the
//! [Builder](crate::builder::Builder), registered with the
//! [Platform](crate::platform::Platform) and passed around by handle. Tests can therefore run
//! any number of isolated registries in parallel.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use yaml_rust::Yaml;

use crate::cache::container::{Container, DEFAULT_CAPACITY};
use crate::cache::refresh::AutoRefreshWorker;
use crate::cache::run::QueryExecutor;
use crate::cache::store::Store;
use crate::cache::{now_epoch_seconds, ServiceError};
use crate::fmt::parse_duration;
use crate::kv::KvStore;
use crate::platform::Platform;
use crate::sources::Fetcher;

/// Governs how a service's cache is kept fresh.
#[derive(Clone, Debug)]
pub struct CacheStrategy {
    /// Performs an initial refresh directly after registration.
    pub populate_on_startup: bool,
    /// Lets the auto-refresh worker refresh this service periodically.
    pub auto_refresh: bool,
    /// The minimal pause between two automatic refreshes.
    pub auto_refresh_interval: Duration,
    /// The maximal duration a single origin fetch may take.
    pub fetch_timeout: Duration,
    /// Evicts items older than this during refresh passes, if present.
    pub cache_decay: Option<Duration>,
}

impl Default for CacheStrategy {
    fn default() -> Self {
        CacheStrategy {
            populate_on_startup: false,
            auto_refresh: false,
            auto_refresh_interval: Duration::from_secs(300),
            fetch_timeout: Duration::from_secs(5),
            cache_decay: None,
        }
    }
}

impl CacheStrategy {
    /// Ensures that the strategy is internally consistent.
    ///
    /// This is checked at registration time so that a broken strategy can never reach a
    /// running service.
    pub fn validate(&self, service: &str) -> Result<(), ServiceError> {
        if self.fetch_timeout.is_zero() {
            return Err(ServiceError::InvalidStrategy {
                service: service.to_owned(),
                reason: "fetch_timeout must not be zero".to_owned(),
            });
        }
        if self.auto_refresh && self.auto_refresh_interval.is_zero() {
            return Err(ServiceError::InvalidStrategy {
                service: service.to_owned(),
                reason: "auto_refresh requires a non-zero auto_refresh_interval".to_owned(),
            });
        }

        Ok(())
    }

    /// Reads a strategy from the given config section.
    ///
    /// Absent settings keep their defaults. A malformed setting yields an **Err** so that the
    /// previous strategy of a running service remains untouched.
    ///
    /// # Example
    ///
    /// ```
    /// # use aquifer::cache::CacheStrategy;
    /// # use aquifer::config::Config;
    /// # use std::time::Duration;
    /// let config = Config::new("somefile.yml");
    /// config.load_from_string("
    /// services:
    ///     forums:
    ///         strategy:
    ///             auto_refresh: true
    ///             auto_refresh_interval: 5 m
    ///             fetch_timeout: 2 s
    /// ", None).unwrap();
    ///
    /// let handle = config.current();
    /// let strategy = CacheStrategy::from_config(handle.query("services.forums.strategy")).unwrap();
    /// assert_eq!(strategy.auto_refresh, true);
    /// assert_eq!(strategy.auto_refresh_interval, Duration::from_secs(300));
    /// assert_eq!(strategy.fetch_timeout, Duration::from_secs(2));
    /// ```
    pub fn from_config(config: &Yaml) -> anyhow::Result<Self> {
        let mut strategy = CacheStrategy::default();

        if let Some(flag) = config["populate_on_startup"].as_bool() {
            strategy.populate_on_startup = flag;
        }
        if let Some(flag) = config["auto_refresh"].as_bool() {
            strategy.auto_refresh = flag;
        }
        if let Some(interval) = config["auto_refresh_interval"].as_str() {
            strategy.auto_refresh_interval = parse_duration(interval)?;
        }
        if let Some(timeout) = config["fetch_timeout"].as_str() {
            strategy.fetch_timeout = parse_duration(timeout)?;
        }
        if let Some(decay) = config["cache_decay"].as_str() {
            strategy.cache_decay = Some(parse_duration(decay)?);
        }

        Ok(strategy)
    }
}

/// Receives a callback whenever its service is enabled or disabled.
///
/// A typical controller wires the service into whatever serves its data (subscribes a topic,
/// announces a route, ...). Toggling a service without any controllers is refused, as the
/// toggle would have no observable effect.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Invoked when the service is enabled.
    async fn enabled(&self) -> anyhow::Result<()>;

    /// Invoked when the service is disabled.
    async fn disabled(&self) -> anyhow::Result<()>;
}

/// Describes a service to be registered.
///
/// # Example
///
/// ```
/// # use aquifer::cache::{CacheStrategy, ServiceDescriptor};
/// # use aquifer::sources::{Fetcher, Item};
/// # use async_trait::async_trait;
/// # use std::sync::Arc;
/// # struct NewsSource;
/// # #[async_trait]
/// # impl Fetcher for NewsSource {
/// #     async fn fetch_items(&self) -> anyhow::Result<Vec<Item>> { Ok(Vec::new()) }
/// # }
/// let descriptor = ServiceDescriptor::new("news", Arc::new(NewsSource))
///     .capacity(500)
///     .updated_field("published")
///     .strategy(CacheStrategy { auto_refresh: true, ..CacheStrategy::default() });
/// ```
pub struct ServiceDescriptor {
    name: String,
    fetcher: Arc<dyn Fetcher>,
    strategy: CacheStrategy,
    id_field: String,
    updated_field: String,
    keyed: bool,
    capacity: usize,
    controllers: Vec<Arc<dyn Lifecycle>>,
}

impl ServiceDescriptor {
    /// Describes a service with the given name and origin fetcher.
    ///
    /// By default this yields an ordered container of 1500 items reading the **id** and
    /// **updated** fields, governed by the default strategy, without any lifecycle
    /// controllers.
    pub fn new(name: impl AsRef<str>, fetcher: Arc<dyn Fetcher>) -> Self {
        ServiceDescriptor {
            name: name.as_ref().to_owned(),
            fetcher,
            strategy: CacheStrategy::default(),
            id_field: "id".to_owned(),
            updated_field: "updated".to_owned(),
            keyed: false,
            capacity: DEFAULT_CAPACITY,
            controllers: Vec::new(),
        }
    }

    /// Applies the given cache strategy.
    pub fn strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Switches the service to a keyed container (point lookups by id).
    pub fn keyed(mut self) -> Self {
        self.keyed = true;
        self
    }

    /// Limits the ordered container to the given number of items.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Specifies the field carrying an item's identity.
    pub fn id_field(mut self, field: impl AsRef<str>) -> Self {
        self.id_field = field.as_ref().to_owned();
        self
    }

    /// Specifies the field carrying an item's timestamp (seconds since the epoch).
    pub fn updated_field(mut self, field: impl AsRef<str>) -> Self {
        self.updated_field = field.as_ref().to_owned();
        self
    }

    /// Attaches a lifecycle controller.
    pub fn controller(mut self, controller: Arc<dyn Lifecycle>) -> Self {
        self.controllers.push(controller);
        self
    }

    fn build_container(&self) -> Container {
        if self.keyed {
            Container::keyed(&self.id_field)
        } else {
            Container::ordered(self.capacity, &self.id_field)
        }
    }
}

/// Represents a registered service at runtime.
pub struct RegistryEntry {
    name: String,
    strategy: CacheStrategy,
    controllers: Vec<Arc<dyn Lifecycle>>,
    store: Arc<Store>,
    enabled: AtomicBool,
    started_at: f64,
}

impl RegistryEntry {
    /// Returns the name of the service.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the cache strategy governing this service.
    pub fn strategy(&self) -> &CacheStrategy {
        &self.strategy
    }

    /// Provides access to the store backing this service.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Determines if the service is currently enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Returns when the service was registered (seconds since the epoch).
    pub fn started_at(&self) -> f64 {
        self.started_at
    }
}

/// Keeps track of all registered services.
pub struct ServiceRegistry {
    services: Mutex<HashMap<String, Arc<RegistryEntry>>>,
    kv: Option<Arc<KvStore>>,
}

impl ServiceRegistry {
    /// Creates a new, empty registry.
    ///
    /// If a [KvStore] is supplied, all stores created for registered services persist their
    /// snapshots through it.
    pub fn new(kv: Option<Arc<KvStore>>) -> Self {
        ServiceRegistry {
            services: Mutex::new(HashMap::new()),
            kv,
        }
    }

    /// Registers a new service.
    ///
    /// The descriptor's strategy is validated first, and a name collision is refused - in both
    /// cases the registry remains completely unchanged. Otherwise the service's store is
    /// created, a persisted snapshot is restored if available, and - if the strategy says so -
    /// an initial refresh is performed.
    ///
    /// Note that the new service starts out enabled.
    pub async fn register(&self, descriptor: ServiceDescriptor) -> Result<(), ServiceError> {
        descriptor.strategy.validate(&descriptor.name)?;

        let store = Arc::new(Store::new(
            &descriptor.name,
            descriptor.build_container(),
            &descriptor.updated_field,
            descriptor.fetcher.clone(),
            self.kv.clone(),
        ));
        let entry = Arc::new(RegistryEntry {
            name: descriptor.name.clone(),
            strategy: descriptor.strategy.clone(),
            controllers: descriptor.controllers,
            store,
            enabled: AtomicBool::new(true),
            started_at: now_epoch_seconds(),
        });

        {
            let mut services = self.services.lock().unwrap();
            if services.contains_key(&descriptor.name) {
                return Err(ServiceError::ServiceAlreadyRegistered(descriptor.name));
            }
            let _ = services.insert(descriptor.name.clone(), entry.clone());
        }

        match entry.store.restore().await {
            Ok(0) => {}
            Ok(restored) => log::info!(
                "Restored {} items for service '{}' from its snapshot.",
                restored,
                &descriptor.name
            ),
            Err(error) => log::warn!(
                "Failed to restore the snapshot of service '{}': {}",
                &descriptor.name,
                error
            ),
        }

        if entry.strategy.populate_on_startup {
            match entry.store.refresh(entry.strategy.fetch_timeout).await {
                Ok(merged) => log::info!(
                    "Populated service '{}' with {} items on startup.",
                    &descriptor.name,
                    merged
                ),
                Err(error) => log::warn!(
                    "Failed to populate service '{}' on startup: {}",
                    &descriptor.name,
                    error
                ),
            }
        }

        Ok(())
    }

    /// Enables or disables the given service.
    ///
    /// The lifecycle controllers of the service are invoked (and awaited) when the flag
    /// actually changes. A controller failure is logged - the toggle itself still applies, as
    /// the registry's view of the service must stay consistent with what was requested.
    pub async fn enable(&self, name: &str, enabled: bool) -> Result<(), ServiceError> {
        let entry = self.entry(name)?;
        if entry.controllers.is_empty() {
            return Err(ServiceError::NoLifecycleControllers(name.to_owned()));
        }

        if entry.enabled.swap(enabled, Ordering::AcqRel) == enabled {
            // Nothing changed, therefore no controller runs...
            return Ok(());
        }

        for controller in &entry.controllers {
            let result = if enabled {
                controller.enabled().await
            } else {
                controller.disabled().await
            };
            if let Err(error) = result {
                log::error!(
                    "A lifecycle controller of service '{}' failed while switching to {}: {}",
                    name,
                    if enabled { "enabled" } else { "disabled" },
                    error
                );
            }
        }

        log::info!(
            "Service '{}' is now {}.",
            name,
            if enabled { "enabled" } else { "disabled" }
        );

        Ok(())
    }

    /// Resolves the given service name into its registry entry.
    pub fn entry(&self, name: &str) -> Result<Arc<RegistryEntry>, ServiceError> {
        self.services
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::ServiceNotFound(name.to_owned()))
    }

    /// Returns the names of all currently enabled services, sorted alphabetically.
    pub fn list_enabled(&self) -> Vec<String> {
        let mut result: Vec<String> = self
            .services
            .lock()
            .unwrap()
            .values()
            .filter(|entry| entry.is_enabled())
            .map(|entry| entry.name.clone())
            .collect();
        result.sort();

        result
    }

    /// Returns the names of all registered services, sorted alphabetically.
    pub fn list_all(&self) -> Vec<String> {
        let mut result: Vec<String> = self.services.lock().unwrap().keys().cloned().collect();
        result.sort();

        result
    }

    /// Returns all registry entries.
    ///
    /// This is what the auto-refresh worker iterates per pass.
    pub fn entries(&self) -> Vec<Arc<RegistryEntry>> {
        self.services.lock().unwrap().values().cloned().collect()
    }
}

/// Creates and installs a **ServiceRegistry** with its executor and refresh worker.
///
/// If a [KvStore] has been installed before, all stores persist through it. Note that this
/// method is also called by the [Builder](crate::builder::Builder) unless the registry part is
/// disabled.
pub fn install(platform: &Arc<Platform>) -> Arc<ServiceRegistry> {
    let registry = Arc::new(ServiceRegistry::new(platform.find::<KvStore>()));
    platform.register::<ServiceRegistry>(registry.clone());
    platform.register::<QueryExecutor>(Arc::new(QueryExecutor::new(registry.clone())));
    platform.register::<AutoRefreshWorker>(Arc::new(AutoRefreshWorker::new(
        platform.clone(),
        registry.clone(),
    )));

    registry
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::cache::registry::{
        CacheStrategy, Lifecycle, ServiceDescriptor, ServiceRegistry,
    };
    use crate::cache::ServiceError;
    use crate::sources::{Fetcher, Item};

    struct StaticFetcher(Vec<Item>);

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch_items(&self) -> anyhow::Result<Vec<Item>> {
            Ok(self.0.clone())
        }
    }

    struct CountingController {
        enabled: AtomicUsize,
        disabled: AtomicUsize,
    }

    impl CountingController {
        fn new() -> Arc<Self> {
            Arc::new(CountingController {
                enabled: AtomicUsize::new(0),
                disabled: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Lifecycle for CountingController {
        async fn enabled(&self) -> anyhow::Result<()> {
            let _ = self.enabled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn disabled(&self) -> anyhow::Result<()> {
            let _ = self.disabled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn descriptor(name: &str) -> ServiceDescriptor {
        ServiceDescriptor::new(name, Arc::new(StaticFetcher(Vec::new())))
    }

    #[test]
    fn duplicate_registrations_are_refused() {
        crate::testing::test_async(async {
            let registry = ServiceRegistry::new(None);

            registry.register(descriptor("forums")).await.unwrap();
            match registry.register(descriptor("forums")).await {
                Err(ServiceError::ServiceAlreadyRegistered(name)) => assert_eq!(name, "forums"),
                _ => panic!("Expected a duplicate registration error"),
            }

            // The registry still contains the service exactly once...
            assert_eq!(registry.list_all(), vec!["forums".to_owned()]);
        });
    }

    #[test]
    fn invalid_strategies_are_rejected_at_registration() {
        crate::testing::test_async(async {
            let registry = ServiceRegistry::new(None);

            let broken = descriptor("forums").strategy(CacheStrategy {
                auto_refresh: true,
                auto_refresh_interval: Duration::from_secs(0),
                ..CacheStrategy::default()
            });

            match registry.register(broken).await {
                Err(ServiceError::InvalidStrategy { service, .. }) => {
                    assert_eq!(service, "forums")
                }
                _ => panic!("Expected an invalid strategy error"),
            }

            // The rejected service never reached the registry...
            assert_eq!(registry.list_all().is_empty(), true);
        });
    }

    #[test]
    fn enabling_runs_the_lifecycle_controllers() {
        crate::testing::test_async(async {
            let registry = ServiceRegistry::new(None);
            let controller = CountingController::new();

            registry
                .register(descriptor("forums").controller(controller.clone()))
                .await
                .unwrap();

            // A fresh service starts out enabled...
            assert_eq!(registry.list_enabled(), vec!["forums".to_owned()]);

            // Enabling an already enabled service doesn't run the controllers...
            registry.enable("forums", true).await.unwrap();
            assert_eq!(controller.enabled.load(Ordering::SeqCst), 0);

            registry.enable("forums", false).await.unwrap();
            assert_eq!(controller.disabled.load(Ordering::SeqCst), 1);
            assert_eq!(registry.list_enabled().is_empty(), true);

            registry.enable("forums", true).await.unwrap();
            assert_eq!(controller.enabled.load(Ordering::SeqCst), 1);
            assert_eq!(registry.list_enabled(), vec!["forums".to_owned()]);
        });
    }

    #[test]
    fn toggling_requires_controllers() {
        crate::testing::test_async(async {
            let registry = ServiceRegistry::new(None);
            registry.register(descriptor("forums")).await.unwrap();

            match registry.enable("forums", true).await {
                Err(ServiceError::NoLifecycleControllers(name)) => assert_eq!(name, "forums"),
                _ => panic!("Expected a missing controllers error"),
            }

            match registry.enable("unknown", true).await {
                Err(ServiceError::ServiceNotFound(name)) => assert_eq!(name, "unknown"),
                _ => panic!("Expected a missing service error"),
            }
        });
    }

    #[test]
    fn populate_on_startup_warms_the_store() {
        crate::testing::test_async(async {
            let registry = ServiceRegistry::new(None);

            let populated = ServiceDescriptor::new(
                "news",
                Arc::new(StaticFetcher(vec![json!({ "id": "1", "updated": 10.0 })])),
            )
            .strategy(CacheStrategy {
                populate_on_startup: true,
                ..CacheStrategy::default()
            });

            registry.register(populated).await.unwrap();

            let entry = registry.entry("news").unwrap();
            assert_eq!(entry.store().len(), 1);
            assert_eq!(entry.store().last_refresh().is_some(), true);
        });
    }
}
