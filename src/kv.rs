//! Provides a durable key-value store for JSON snapshots.
//!
//! Stores and memos persist their contents through a single shared [KvStore] so that a restart
//! doesn't begin with a cold cache. Each key is stored as its own JSON file below a common base
//! directory. Writes first go to a **.part** file which is then renamed into place, therefore a
//! crash during a write can never corrupt a previously persisted snapshot.
//!
//! All IO is performed via **tokio::fs** so that writing a large snapshot never blocks the
//! runtime.
//!
//! # Examples
//!
//! ```
//! # use aquifer::kv::KvStore;
//! # use serde_json::json;
//! # #[tokio::main]
//! # async fn main() {
//! let kv = KvStore::open_in("target/kv-doctest").await.unwrap();
//!
//! kv.put("forums_default", &json!({ "items": [] })).await.unwrap();
//! assert_eq!(kv.get("forums_default").await.unwrap().is_some(), true);
//!
//! kv.delete("forums_default").await.unwrap();
//! assert_eq!(kv.get("forums_default").await.unwrap().is_none(), true);
//! # }
//! ```
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::platform::Platform;

/// Stores JSON documents per key in a single base directory.
///
/// This is deliberately simple: one file per key, atomic replace on write. The store doesn't
/// cache anything in memory, as its callers (stores and memos) already hold their current state
/// and only read back on startup.
pub struct KvStore {
    base: PathBuf,
}

impl KvStore {
    /// Opens a store within the given base directory, creating it if required.
    pub async fn open_in(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = path.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&base)
            .await
            .context("Failed to create the key-value base directory.")?;

        Ok(KvStore { base })
    }

    /// Opens a store within the default base directory.
    pub async fn open() -> anyhow::Result<Self> {
        KvStore::open_in(KvStore::base_dir()).await
    }

    #[cfg(not(test))]
    fn base_dir() -> PathBuf {
        Path::new("data").to_path_buf()
    }

    #[cfg(test)]
    fn base_dir() -> PathBuf {
        let mut path = Path::new("target").to_path_buf();
        path.push("test-data");
        path
    }

    /// Resolves the given key into the path of its backing file.
    ///
    /// Keys are sanitized so that a key can never escape the base directory.
    fn resolve(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ch == '.' {
                    ch
                } else {
                    '_'
                }
            })
            .collect();

        let mut path = self.base.clone();
        path.push(format!("{}.json", file_name));
        path
    }

    /// Stores the given value for the given key, replacing a previous value if present.
    pub async fn put(&self, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
        let effective_path = self.resolve(key);
        let mut tmp_path = effective_path.clone();
        let _ = tmp_path.set_extension("json.part");

        let data = serde_json::to_vec(value).context("Failed to serialize value.")?;

        let mut file = File::create(&tmp_path)
            .await
            .context("Failed to open destination file.")?;
        file.write_all(&data)
            .await
            .context("Failed to write data to file.")?;
        file.flush().await.context("Failed flushing to disk.")?;

        tokio::fs::rename(&tmp_path, &effective_path)
            .await
            .context("Failed to rename file to its effective name.")?;

        Ok(())
    }

    /// Returns the value which has previously been stored for the given key.
    pub async fn get(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
        let path = self.resolve(key);

        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(
                serde_json::from_slice(&data).context("Failed to parse stored value.")?,
            )),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error).context("Failed to read stored value."),
        }
    }

    /// Deletes the value stored for the given key.
    ///
    /// Deleting a key which isn't present is not an error.
    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let path = self.resolve(key);

        match tokio::fs::remove_file(&path).await {
            Ok(_) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error).context("Failed to delete stored value."),
        }
    }

    /// Lists all keys currently present in the store.
    pub async fn keys(&self) -> anyhow::Result<Vec<String>> {
        let mut result = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.base)
            .await
            .context("Failed to list the key-value base directory.")?;

        while let Some(entry) = dir
            .next_entry()
            .await
            .context("Failed to list the key-value base directory.")?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(key) = name.strip_suffix(".json") {
                result.push(key.to_owned());
            }
        }

        result.sort();
        Ok(result)
    }
}

/// Creates and installs a **KvStore** into the given platform.
///
/// Note that this method is also called by the [Builder](crate::builder::Builder) unless the
/// **KvStore** part is disabled.
pub async fn install(platform: Arc<Platform>) {
    match KvStore::open().await {
        Ok(kv) => platform.register::<KvStore>(Arc::new(kv)),
        Err(error) => log::error!("Failed to open the key-value store: {}", error),
    }
}

#[cfg(test)]
mod tests {
    use crate::kv::KvStore;
    use serde_json::json;

    #[test]
    fn values_survive_a_put_get_cycle() {
        // We operate on the shared on-disk store below "target"...
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();

        crate::testing::test_async(async {
            let kv = KvStore::open().await.unwrap();

            kv.put("kv_test_default", &json!({ "items": [1, 2, 3], "last_refresh": 42.0 }))
                .await
                .unwrap();

            let value = kv.get("kv_test_default").await.unwrap().unwrap();
            assert_eq!(value["items"].as_array().unwrap().len(), 3);
            assert_eq!(value["last_refresh"].as_f64().unwrap(), 42.0);

            kv.delete("kv_test_default").await.unwrap();
            assert_eq!(kv.get("kv_test_default").await.unwrap().is_none(), true);
        });
    }

    #[test]
    fn missing_keys_yield_none() {
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();

        crate::testing::test_async(async {
            let kv = KvStore::open().await.unwrap();
            assert_eq!(kv.get("kv_test_missing").await.unwrap().is_none(), true);

            // Deleting a missing key is a no-op, not an error...
            kv.delete("kv_test_missing").await.unwrap();
        });
    }

    #[test]
    fn keys_are_sanitized_and_listed() {
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();

        crate::testing::test_async(async {
            let kv = KvStore::open().await.unwrap();

            // A key containing path separators must not escape the base directory...
            kv.put("kv_test/../escape", &json!(1)).await.unwrap();

            let keys = kv.keys().await.unwrap();
            assert_eq!(keys.iter().any(|key| key == "kv_test_.._escape"), true);
            assert_eq!(keys.iter().any(|key| key.contains('/')), false);

            kv.delete("kv_test/../escape").await.unwrap();
        });
    }
}
