//! Periodically refreshes all enabled services so that queries rarely hit a cold store.
//!
//! The worker runs as a single spawned task which wakes up every **tick**. Each pass fans out
//! over all services which are enabled, have **auto_refresh** in their strategy and are *due*
//! (their watermark is older than their **auto_refresh_interval**). All due services are
//! refreshed concurrently, each under its own fetch timeout - one slow upstream therefore
//! never delays the others, and an individual failure is logged without affecting the rest of
//! the pass.
//!
//! There is at most one worker per registry: starting it twice is refused, and stopping it
//! awaits the task's termination before the slot is released, so a subsequent start can never
//! race a half-stopped predecessor.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::cache::registry::{RegistryEntry, ServiceRegistry};
use crate::cache::{now_epoch_seconds, ServiceError};
use crate::platform::Platform;

/// Keeps the caches of all enabled services warm.
pub struct AutoRefreshWorker {
    platform: Arc<Platform>,
    registry: Arc<ServiceRegistry>,
    worker: Mutex<WorkerSlot>,
    last_run: Mutex<Option<f64>>,
}

/// The slot stays in **Stopping** while a stop awaits the task, so that a concurrent start
/// cannot sneak a second task in before the old one has terminated.
enum WorkerSlot {
    Idle,
    Running(RunningWorker),
    Stopping,
}

struct RunningWorker {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl AutoRefreshWorker {
    /// Creates a new worker for the given registry.
    ///
    /// Note that this doesn't start anything yet - see [start](AutoRefreshWorker::start).
    pub fn new(platform: Arc<Platform>, registry: Arc<ServiceRegistry>) -> Self {
        AutoRefreshWorker {
            platform,
            registry,
            worker: Mutex::new(WorkerSlot::Idle),
            last_run: Mutex::new(None),
        }
    }

    /// Starts the background task, waking up every **tick**.
    ///
    /// The first pass runs immediately. Starting an already running worker is refused with
    /// [ServiceError::WorkerAlreadyRunning].
    pub fn start(self: &Arc<Self>, tick: Duration) -> Result<(), ServiceError> {
        let mut slot = self.worker.lock().unwrap();
        if !matches!(*slot, WorkerSlot::Idle) {
            return Err(ServiceError::WorkerAlreadyRunning);
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let worker = self.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        if !worker.platform.is_running() {
                            break;
                        }
                        worker.run_pass().await;
                    }
                }
            }
        });

        *slot = WorkerSlot::Running(RunningWorker {
            stop: stop_tx,
            task,
        });
        log::info!(
            "Auto-refresh worker started (tick: {}).",
            crate::fmt::format_duration(tick)
        );

        Ok(())
    }

    /// Stops the background task and awaits its termination.
    ///
    /// Once this returns, no further pass will run and the worker can be started again.
    /// Stopping a worker which isn't running is refused with
    /// [ServiceError::WorkerNotRunning].
    pub async fn stop(&self) -> Result<(), ServiceError> {
        let running = {
            let mut slot = self.worker.lock().unwrap();
            match std::mem::replace(&mut *slot, WorkerSlot::Stopping) {
                WorkerSlot::Running(running) => running,
                other => {
                    *slot = other;
                    return Err(ServiceError::WorkerNotRunning);
                }
            }
        };

        // The task either observes the stop signal or has already ended. The slot stays
        // occupied until the task has actually terminated...
        let _ = running.stop.send(());
        if let Err(error) = running.task.await {
            log::warn!("The auto-refresh task ended abnormally: {}", error);
        }
        *self.worker.lock().unwrap() = WorkerSlot::Idle;
        log::info!("Auto-refresh worker stopped.");

        Ok(())
    }

    /// Determines if the background task is currently running.
    pub fn is_running(&self) -> bool {
        matches!(*self.worker.lock().unwrap(), WorkerSlot::Running(_))
    }

    /// Returns when the last pass started (seconds since the epoch).
    pub fn last_run(&self) -> Option<f64> {
        *self.last_run.lock().unwrap()
    }

    /// Executes a single refresh pass over all due services.
    ///
    /// This is invoked by the background task but can also be called directly (e.g. to force
    /// a refresh from a management command).
    pub async fn run_pass(&self) {
        let now = now_epoch_seconds();
        let due: Vec<Arc<RegistryEntry>> = self
            .registry
            .entries()
            .into_iter()
            .filter(|entry| entry.is_enabled() && entry.strategy().auto_refresh)
            .filter(|entry| is_due(entry, now))
            .collect();

        let refreshes = due.iter().map(|entry| async move {
            if let Some(decay) = entry.strategy().cache_decay {
                let evicted = entry.store().evict_decayed(decay);
                if evicted > 0 {
                    log::debug!("Evicted {} decayed items of '{}'.", evicted, entry.name());
                }
            }

            match entry.store().refresh(entry.strategy().fetch_timeout).await {
                Ok(merged) => log::debug!(
                    "Refreshed '{}': {} new items (avg fetch: {}).",
                    entry.name(),
                    merged,
                    crate::fmt::format_short_duration(entry.store().avg_fetch_micros())
                ),
                Err(error) => log::error!("Auto-refresh of '{}' failed: {}", entry.name(), error),
            }
        });
        let _ = futures::future::join_all(refreshes).await;

        *self.last_run.lock().unwrap() = Some(now);
    }
}

/// Determines if the given service is due for a refresh.
///
/// A store which was never refreshed is always due.
fn is_due(entry: &RegistryEntry, now: f64) -> bool {
    match entry.store().last_refresh() {
        Some(watermark) => now - watermark >= entry.strategy().auto_refresh_interval.as_secs_f64(),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::cache::refresh::AutoRefreshWorker;
    use crate::cache::registry::{
        CacheStrategy, Lifecycle, ServiceDescriptor, ServiceRegistry,
    };
    use crate::cache::ServiceError;
    use crate::platform::Platform;
    use crate::sources::{Fetcher, Item};

    struct CountingFetcher {
        fetches: AtomicUsize,
    }

    impl CountingFetcher {
        fn new() -> Arc<Self> {
            Arc::new(CountingFetcher {
                fetches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Fetcher for CountingFetcher {
        async fn fetch_items(&self) -> anyhow::Result<Vec<Item>> {
            let _ = self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(vec![json!({ "id": "1", "updated": 1.0 })])
        }
    }

    struct NopController;

    #[async_trait]
    impl Lifecycle for NopController {
        async fn enabled(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn disabled(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn auto_refresh_strategy() -> CacheStrategy {
        CacheStrategy {
            auto_refresh: true,
            auto_refresh_interval: Duration::from_secs(60),
            ..CacheStrategy::default()
        }
    }

    async fn register(
        registry: &ServiceRegistry,
        name: &str,
        fetcher: Arc<dyn Fetcher>,
        strategy: CacheStrategy,
    ) {
        registry
            .register(
                ServiceDescriptor::new(name, fetcher)
                    .strategy(strategy)
                    .controller(Arc::new(NopController)),
            )
            .await
            .unwrap();
    }

    #[test]
    fn a_pass_only_refreshes_enabled_auto_refresh_services() {
        crate::testing::test_async(async {
            let registry = Arc::new(ServiceRegistry::new(None));

            let auto = CountingFetcher::new();
            let manual = CountingFetcher::new();
            let disabled = CountingFetcher::new();

            register(&registry, "auto", auto.clone(), auto_refresh_strategy()).await;
            register(&registry, "manual", manual.clone(), CacheStrategy::default()).await;
            register(&registry, "disabled", disabled.clone(), auto_refresh_strategy()).await;

            registry.enable("disabled", false).await.unwrap();

            let worker =
                AutoRefreshWorker::new(Platform::new(), registry.clone());
            worker.run_pass().await;

            assert_eq!(auto.fetches.load(Ordering::SeqCst), 1);
            assert_eq!(manual.fetches.load(Ordering::SeqCst), 0);
            assert_eq!(disabled.fetches.load(Ordering::SeqCst), 0);
            assert_eq!(worker.last_run().is_some(), true);
        });
    }

    #[test]
    fn services_with_a_fresh_watermark_are_skipped() {
        crate::testing::test_async(async {
            let registry = Arc::new(ServiceRegistry::new(None));
            let fetcher = CountingFetcher::new();

            register(&registry, "auto", fetcher.clone(), auto_refresh_strategy()).await;

            // The first pass refreshes the cold store...
            let worker = AutoRefreshWorker::new(Platform::new(), registry.clone());
            worker.run_pass().await;
            assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);

            // ...which makes the service no longer due for the second pass.
            worker.run_pass().await;
            assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn the_worker_is_a_singleton_with_awaited_shutdown() {
        crate::testing::test_async(async {
            let registry = Arc::new(ServiceRegistry::new(None));
            let worker = Arc::new(AutoRefreshWorker::new(Platform::new(), registry));

            worker.start(Duration::from_millis(10)).unwrap();
            assert_eq!(worker.is_running(), true);

            // A second start is refused while the first task is alive...
            match worker.start(Duration::from_millis(10)) {
                Err(ServiceError::WorkerAlreadyRunning) => {}
                _ => panic!("Expected the worker to refuse a second start"),
            }

            // Stop awaits the task, afterwards the slot is free again...
            worker.stop().await.unwrap();
            assert_eq!(worker.is_running(), false);

            match worker.stop().await {
                Err(ServiceError::WorkerNotRunning) => {}
                _ => panic!("Expected the worker to refuse a second stop"),
            }

            // And a restart works...
            worker.start(Duration::from_millis(10)).unwrap();
            worker.stop().await.unwrap();
        });
    }

    struct SlowFetcher;

    #[async_trait]
    impl Fetcher for SlowFetcher {
        async fn fetch_items(&self) -> anyhow::Result<Vec<Item>> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(vec![json!({ "id": "1", "updated": 1.0 })])
        }
    }

    #[test]
    fn a_start_during_an_awaited_stop_is_refused() {
        crate::testing::test_async(async {
            let registry = Arc::new(ServiceRegistry::new(None));
            register(&registry, "slow", Arc::new(SlowFetcher), auto_refresh_strategy()).await;

            let worker = Arc::new(AutoRefreshWorker::new(Platform::new(), registry));
            worker.start(Duration::from_millis(1)).unwrap();

            // Let the first pass get stuck in the slow fetch...
            tokio::time::sleep(Duration::from_millis(20)).await;

            // While stop awaits the task's termination, a concurrent start must still see
            // the slot as occupied...
            let restarter = worker.clone();
            let (stopped, raced) = tokio::join!(worker.stop(), async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                restarter.start(Duration::from_millis(1))
            });
            stopped.unwrap();
            match raced {
                Err(ServiceError::WorkerAlreadyRunning) => {}
                _ => panic!("Expected the start to be refused mid-stop"),
            }

            // Once the stop has completed, the slot is free again...
            worker.start(Duration::from_millis(10)).unwrap();
            worker.stop().await.unwrap();
        });
    }
}
