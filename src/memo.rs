//! Provides a hit-counted cache for expensive computations.
//!
//! A [Memo] maps a computation (identified by a hashed key, see [memo_key]) to its cached
//! result. Unlike the per-service stores, a memo has no notion of freshness - it trades
//! correctness-over-time for never recomputing. What keeps it bounded is its eviction pass:
//! every entry counts its hits, and [evict](Memo::evict) retains only the **max_keys** hottest
//! entries, resetting the counters of the survivors so that yesterday's popularity doesn't
//! shield an entry forever.
//!
//! The eviction pass can run as a background task with the same singleton start/stop contract
//! as the auto-refresh worker. Memos over plain JSON values can additionally persist their
//! entries through the [KvStore](crate::kv::KvStore).
//!
//! # Example
//!
//! ```
//! # use aquifer::memo::{memo_key, Memo};
//! # #[tokio::main]
//! # async fn main() {
//! let memo: Memo<u64> = Memo::new("fib", 128, None);
//!
//! let key = memo_key("fib", &["40"]);
//! let value = memo.get_or_compute(key, || async { Ok(102_334_155) }).await.unwrap();
//! assert_eq!(value, 102_334_155);
//!
//! // The second call never runs the computation...
//! let value = memo.get_or_compute(key, || async { panic!("not invoked") }).await.unwrap();
//! assert_eq!(value, 102_334_155);
//! # }
//! ```
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use linked_hash_map::LinkedHashMap;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::cache::ServiceError;
use crate::kv::KvStore;

/// Derives a memo key from a computation's identity and its arguments.
///
/// The same scope and arguments always yield the same key, therefore a computation finds its
/// cached result across call sites.
///
/// # Example
///
/// ```
/// # use aquifer::memo::memo_key;
/// assert_eq!(memo_key("search", &["rust"]), memo_key("search", &["rust"]));
/// assert_ne!(memo_key("search", &["rust"]), memo_key("search", &["go"]));
/// assert_ne!(memo_key("search", &["rust"]), memo_key("suggest", &["rust"]));
/// ```
pub fn memo_key(scope: &str, args: &[&str]) -> u64 {
    let mut hasher = fnv::FnvHasher::default();
    scope.hash(&mut hasher);
    for arg in args {
        arg.hash(&mut hasher);
    }

    hasher.finish()
}

struct MemoEntry<V> {
    value: V,
    hits: u64,
}

struct RunningWorker {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// The slot stays in **Stopping** while a stop awaits the task, so that a concurrent start
/// cannot sneak a second task in before the old one has terminated.
enum WorkerSlot {
    Idle,
    Running(RunningWorker),
    Stopping,
}

/// Caches the results of expensive computations, bounded by hit-based eviction.
pub struct Memo<V> {
    name: String,
    max_keys: usize,
    entries: Mutex<LinkedHashMap<u64, MemoEntry<V>>>,
    kv: Option<Arc<KvStore>>,
    worker: Mutex<WorkerSlot>,
}

impl<V: Clone> Memo<V> {
    /// Creates a memo retaining at most **max_keys** entries across eviction passes.
    ///
    /// The name identifies the memo in logs and in the [KvStore] (if one is supplied).
    pub fn new(name: impl AsRef<str>, max_keys: usize, kv: Option<Arc<KvStore>>) -> Self {
        Memo {
            name: name.as_ref().to_owned(),
            max_keys,
            entries: Mutex::new(LinkedHashMap::new()),
            kv,
            worker: Mutex::new(WorkerSlot::Idle),
        }
    }

    /// Returns the cached value for the given key or computes (and caches) it.
    ///
    /// A cache hit increments the entry's hit counter, which is what the eviction pass ranks
    /// by. A failing computation caches nothing - the next caller simply retries.
    pub async fn get_or_compute<F, Fut>(&self, key: u64, compute: F) -> anyhow::Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&key) {
            entry.hits += 1;
            return Ok(entry.value.clone());
        }

        let value = compute().await?;

        // A concurrent caller might have cached a value meanwhile - the first one wins...
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .entry(key)
            .or_insert(MemoEntry { value, hits: 0 });

        Ok(entry.value.clone())
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Determines if the memo is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the hit counter of the given entry.
    pub fn hits(&self, key: u64) -> Option<u64> {
        self.entries.lock().unwrap().get(&key).map(|entry| entry.hits)
    }

    /// Trims the memo down to its **max_keys** hottest entries.
    ///
    /// The hit counters of all entries are reset after each pass, even if the memo was within
    /// its bounds and nothing was trimmed. The ranking therefore always reflects the hits since
    /// the previous pass - an entry which was hot long ago never shields itself with its
    /// lifetime total against a currently hot newcomer. Returns the number of evicted entries.
    pub fn evict(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();

        let evicted = if entries.len() > self.max_keys {
            let mut ranked: Vec<(u64, MemoEntry<V>)> =
                std::mem::take(&mut *entries).into_iter().collect();
            ranked.sort_by(|left, right| right.1.hits.cmp(&left.1.hits));

            let evicted = ranked.len() - self.max_keys;
            ranked.truncate(self.max_keys);
            for (key, entry) in ranked {
                let _ = entries.insert(key, entry);
            }

            log::debug!("Evicted {} entries of memo '{}'.", evicted, &self.name);

            evicted
        } else {
            0
        };

        // Counting restarts with every pass so that the ranking covers the most recent
        // window instead of lifetime totals...
        for (_, entry) in entries.iter_mut() {
            entry.hits = 0;
        }

        evicted
    }
}

impl<V: Clone + Send + 'static> Memo<V> {
    /// Starts a background task which runs an eviction pass every **interval**.
    ///
    /// Starting an already running worker is refused with
    /// [ServiceError::WorkerAlreadyRunning].
    pub fn start_eviction(self: &Arc<Self>, interval: Duration) -> Result<(), ServiceError> {
        let mut slot = self.worker.lock().unwrap();
        if !matches!(*slot, WorkerSlot::Idle) {
            return Err(ServiceError::WorkerAlreadyRunning);
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let memo = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would evict before anything was cached...
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let _ = memo.evict();
                    }
                }
            }
        });

        *slot = WorkerSlot::Running(RunningWorker {
            stop: stop_tx,
            task,
        });

        Ok(())
    }

    /// Stops the eviction task and awaits its termination.
    ///
    /// Stopping a worker which isn't running is refused with
    /// [ServiceError::WorkerNotRunning].
    pub async fn stop_eviction(&self) -> Result<(), ServiceError> {
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

        // The slot stays occupied until the task has actually terminated...
        let _ = running.stop.send(());
        if let Err(error) = running.task.await {
            log::warn!(
                "The eviction task of memo '{}' ended abnormally: {}",
                &self.name,
                error
            );
        }
        *self.worker.lock().unwrap() = WorkerSlot::Idle;

        Ok(())
    }
}

impl Memo<serde_json::Value> {
    /// Persists all entries (including their hit counters) into the attached [KvStore].
    ///
    /// A memo without an attached [KvStore] treats this as a no-op. This is typically invoked
    /// after an eviction pass, when the memo is at its smallest.
    pub async fn persist(&self) -> anyhow::Result<()> {
        let kv = match &self.kv {
            Some(kv) => kv.clone(),
            None => return Ok(()),
        };

        let snapshot = {
            let entries = self.entries.lock().unwrap();
            let entries: Vec<serde_json::Value> = entries
                .iter()
                .map(|(key, entry)| {
                    json!({ "key": key, "hits": entry.hits, "value": entry.value })
                })
                .collect();
            json!({ "entries": entries })
        };

        kv.put(&format!("memo_{}", &self.name), &snapshot).await
    }

    /// Restores previously persisted entries, returning how many were restored.
    ///
    /// A missing snapshot restores nothing and isn't an error.
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let kv = match &self.kv {
            Some(kv) => kv.clone(),
            None => return Ok(0),
        };

        let snapshot = match kv.get(&format!("memo_{}", &self.name)).await? {
            Some(snapshot) => snapshot,
            None => return Ok(0),
        };

        let mut entries = self.entries.lock().unwrap();
        let mut restored = 0;
        if let Some(persisted) = snapshot["entries"].as_array() {
            for persisted in persisted {
                if let Some(key) = persisted["key"].as_u64() {
                    let _ = entries.insert(
                        key,
                        MemoEntry {
                            value: persisted["value"].clone(),
                            hits: persisted["hits"].as_u64().unwrap_or(0),
                        },
                    );
                    restored += 1;
                }
            }
        }

        Ok(restored)
    }
}
