//! Provides a builder which can be used to setup and initialize the framework.
//!
//! This can be used to create and setup central parts of the framework. As Aquifer provides some
//! optional modules, a builder permits to selectively enable or disable them.
//!
//! # Example
//! Setting up the framework with all features enabled:
//! ```no_run
//! # use aquifer::builder::Builder;
//! #[tokio::main]
//! async fn main() {
//!     // Enable all features and build the platform...
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Register services here...
//!
//!     // Keep running until a signal requests a shutdown...
//!     while platform.is_running() {
//!         tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//!     }
//! }
//! ```
use std::sync::Arc;

use crate::platform::Platform;
use crate::{init_logging, AQUIFER_VERSION};

/// Initializes the framework by creating and initializing all core components.
///
/// As Aquifer provides a bunch of components of which some are optional, the actual setup
/// can be configured here.
///
/// # Example
/// Setting up the framework with all features enabled:
/// ```no_run
/// # use aquifer::builder::Builder;
/// #[tokio::main]
/// async fn main() {
///     let platform = Builder::new().enable_all().build().await;
/// }
/// ```
#[derive(Default)]
pub struct Builder {
    setup_logging: bool,
    enable_signals: bool,
    setup_config: bool,
    setup_kv: bool,
    setup_registry: bool,
}

impl Builder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Builder {
            setup_logging: false,
            enable_signals: false,
            setup_config: false,
            setup_kv: false,
            setup_registry: false,
        }
    }

    /// Enables all features.
    ///
    /// Note that using this method (and then maybe disabling selected components) is quite
    /// convenient, but be aware that new components which might be added in a library update
    /// will then also be enabled by default. This might or might not be the expected behaviour.
    pub fn enable_all(mut self) -> Self {
        self.setup_logging = true;
        self.enable_signals = true;
        self.setup_config = true;
        self.setup_kv = true;
        self.setup_registry = true;

        self
    }

    /// Enables the automatic setup of the logging system.
    ///
    /// Using this, we properly initialize **simplelog** to log to stdout. As we intend Aquifer
    /// to be run in docker containers, this is all that is needed for proper logging. The date
    /// format being used is digestible by established tools like **greylog**.
    pub fn enable_logging(mut self) -> Self {
        self.setup_logging = true;
        self
    }

    /// Disables the automatic setup of the logging system after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_logging(mut self) -> Self {
        self.setup_logging = false;
        self
    }

    /// Installs a signal listener which terminates the framework once **CTRL-C** or **SIGHUP**
    /// is received.
    ///
    /// For more details see: [signals](crate::signals)
    pub fn enable_signals(mut self) -> Self {
        self.enable_signals = true;
        self
    }

    /// Disables installing the signal listener after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_signals(mut self) -> Self {
        self.enable_signals = false;
        self
    }

    /// Installs [config::Config](crate::config::Config) and loads the **settings.yml**.
    ///
    /// For more details see: [config](crate::config)
    pub fn enable_config(mut self) -> Self {
        self.setup_config = true;
        self
    }

    /// Disables setting up a **Config** instance after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_config(mut self) -> Self {
        self.setup_config = false;
        self
    }

    /// Opens and installs a [KvStore](crate::kv::KvStore).
    ///
    /// Service stores and memos persist through this store. For more details see:
    /// [kv](crate::kv)
    pub fn enable_kv(mut self) -> Self {
        self.setup_kv = true;
        self
    }

    /// Disables setting up a **KvStore** instance after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_kv(mut self) -> Self {
        self.setup_kv = false;
        self
    }

    /// Creates and installs a [ServiceRegistry](crate::cache::ServiceRegistry) along with its
    /// [QueryExecutor](crate::cache::QueryExecutor) and [AutoRefreshWorker](crate::cache::AutoRefreshWorker).
    ///
    /// Note that the refresh worker is only created, not started. Starting it is left to the
    /// application via `platform.require::<AutoRefreshWorker>().start(..)` once all services
    /// are registered.
    pub fn enable_registry(mut self) -> Self {
        self.setup_registry = true;
        self
    }

    /// Disables setting up a **ServiceRegistry** after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_registry(mut self) -> Self {
        self.setup_registry = false;
        self
    }

    /// Builds the [Platform](crate::platform::Platform) registry with all the enabled components
    /// being registered.
    pub async fn build(self) -> Arc<Platform> {
        let platform = Platform::new();

        if self.setup_logging {
            init_logging();
        }

        log::info!("~~~ AQUIFER (v {}) initializing...", AQUIFER_VERSION);

        if self.enable_signals {
            crate::signals::install(platform.clone());
        }

        if self.setup_config {
            crate::config::install(platform.clone()).await;
        }

        if self.setup_kv {
            crate::kv::install(platform.clone()).await;
        }

        if self.setup_registry {
            let _ = crate::cache::registry::install(&platform);
        }

        platform
    }
}
