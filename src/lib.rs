//! Aquifer keeps slow upstream services cached and warm.
//!
//! # Introduction
//! **Aquifer** is a library for aggregating data from slow or rate-limited upstream services
//! (feeds, forums, package trackers, ...) and serving it from an in-memory cache. Instead of
//! hitting the origin on every request, queries are answered from a per-service **store** which
//! is kept fresh by a background refresh worker. Only when a query cannot be satisfied from the
//! cache, the origin is consulted - and the result is merged back into the store so that the
//! next caller profits from it.
//!
//! This is the classic cache-aside pattern, extended by a freshness **watermark** per store:
//! every successful refresh records when it happened, and subsequent refreshes only merge items
//! which are newer than this watermark. This keeps merges cheap even for chatty upstreams.
//!
//! # Features
//! * **100% Async/Await** - everything builds upon [tokio](https://tokio.rs/) and async/await
//!   primitives as provided by Rust. Background work (auto-refresh, memo eviction) runs as
//!   spawned tasks which are properly awaited on shutdown.
//! * **Reload-aware config facility** which permits to update the configuration during
//!   operation. Cache strategies can therefore be tuned without restarting the process.
//! * **Durable snapshots**. Each store can persist its contents into a simple file based
//!   key-value store so that a restart doesn't begin with a cold cache.
//! * **Simple and well documented code base**. Aquifer isn't a large framework at all. This
//!   permits every user to browse and understand its source code and what to expect from the
//!   system. Also, this is due to the fact that Aquifer stands on the shoulders of giants
//!   (especially [tokio](https://tokio.rs/)).
//!
//! # Modules
//! * **Service registry**: Keeps track of all known services, their cache strategy and their
//!   lifecycle controllers. See [crate::cache::registry].
//! * **Query executor**: Answers queries from the cache and falls back to the origin on a
//!   miss. See [crate::cache::run].
//! * **Auto-refresh worker**: Periodically refreshes all enabled services which are due.
//!   See [crate::cache::refresh].
//! * **Memo**: A hit-counted cache for expensive computations with a bounded keyset.
//!   See [crate::memo].
//! * **KV store**: Durable JSON snapshots, one file per key. See [crate::kv].
//!
//! # Example
//! A short example on how to initialize the library can be found here
//! [Builder](builder::Builder).
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod average;
pub mod builder;
pub mod cache;
pub mod config;
pub mod fmt;
pub mod kv;
pub mod memo;
pub mod platform;
pub mod signals;
pub mod sources;

/// Contains the version of the Aquifer library.
pub const AQUIFER_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to set up the
/// framework, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise the integration tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned closure to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate aquifer;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}

#[cfg(test)]
mod testing {
    use std::sync::Mutex;

    lazy_static::lazy_static! {
        /// Provides a global lock which has to be acquired if a test operates on shared
        /// resources. In our case this is the key-value store which operates on the file
        /// system (all tests share one base directory below "target"). Using this lock, we
        /// can still execute all other tests in parallel and only block if required.
        pub static ref SHARED_TEST_RESOURCES: Mutex<()> = Mutex::new(());
    }

    /// Executes async code within a single threaded tokio runtime.
    pub fn test_async<F: std::future::Future>(future: F) {
        use tokio::runtime;

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let _ = rt.block_on(future);
    }
}
