//! Provides a tiny DI like container to expose all components of the system.
//!
//! The platform is more or less a simple map which keeps all central components (the
//! [ServiceRegistry](crate::cache::ServiceRegistry), the [KvStore](crate::kv::KvStore), the
//! [Config](crate::config::Config), ...) as **Arc<T>** around. Also this keeps the central
//! **is_running** flag which is toggled to *false* once
//! [Platform::terminate](Platform::terminate) is invoked.
//!
//! Keeping all shared components here instead of in process-wide globals means that tests can
//! run several fully isolated platforms in parallel and that shutdown is a single, observable
//! event.
//!
//! Note that in common cases [Platform::require](Platform::require) is a good way of fetching a
//! component which is known to be there. However, be aware, that once the system shutdown is
//! initiated, the internal map is cleared and empty (so that all Dropped handlers run).
//! Therefore if the code might be executed after [Platform::terminate](Platform::terminate) was
//! called, you should use [Platform::find](Platform::find) and gracefully handle the **None**
//! case. However, in most cases the lookup of components is performed during startup and
//! therefore **require** can be used.
//!
//! # Examples
//!
//! ```
//! # use std::sync::Arc;
//! # use aquifer::platform::Platform;
//! struct Component {
//!     value : i32
//! }
//!
//! struct UnknownComponent;
//!
//! let platform = Platform::new();
//!
//! // Registers a new component...
//! platform.register::<Component>(Arc::new(Component { value: 42 }));
//!
//! // Obtains a reference to a previously registered component...
//! let component = platform.require::<Component>();
//! assert_eq!(component.value, 42);
//!
//! // Trying to obtain a component which hasn't been registered yet, returns an empty
//! // optional...
//! assert_eq!(platform.find::<UnknownComponent>().is_none(), true);
//!
//! // By default the platform is running...
//! assert_eq!(platform.is_running(), true);
//!
//! // Once terminated...
//! platform.terminate();
//! // All components are immediately released so that their "Dropped" handlers run...
//! assert_eq!(platform.find::<Component>().is_none(), true);
//!
//! // and the platform is no longer considered active...
//! assert_eq!(platform.is_running(), false);
//! ```
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use std::sync::atomic::{AtomicBool, Ordering};

/// Provides a container to keep all central components in a single place.
///
/// # Examples
///
/// Building and accessing components:
/// ```
/// # use aquifer::platform::Platform;
/// # use std::sync::Arc;
///
/// struct Component {}
///
/// #[tokio::main]
/// async fn main() {
///     let platform = Platform::new();
///     platform.register(Arc::new(Component {}));
///     assert_eq!(platform.find::<Component>().is_some(), true);
/// }
/// ```
///
/// Checking the central "is running" flag:
/// ```
/// # use aquifer::platform::Platform;
/// # use std::sync::Arc;
///
/// struct Component {}
///
/// #[tokio::main]
/// async fn main() {
///     let platform = Platform::new();
///     platform.register(Arc::new(Component {}));
///
///     // By default the platform is running...
///     assert_eq!(platform.is_running(), true);
///
///     // once terminated...
///     platform.terminate();
///
///     // all components are evicted so that their Dropped handlers are executed
///     assert_eq!(platform.find::<Component>().is_some(), false);
///
///     // the platform is considered halted...
///     assert_eq!(platform.is_running(), false);
/// }
/// ```
pub struct Platform {
    components: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    is_running: AtomicBool,
    shutdown_at: Mutex<Option<SystemTime>>,
}

impl Platform {
    /// Creates a new platform instance.
    pub fn new() -> Arc<Self> {
        Arc::new(Platform {
            components: Mutex::new(HashMap::new()),
            is_running: AtomicBool::new(true),
            shutdown_at: Mutex::new(None),
        })
    }

    /// Registers a new component.
    ///
    /// # Examples
    /// ```
    /// # use aquifer::platform::Platform;
    /// # use std::sync::Arc;
    ///
    /// struct Component {
    ///     value: i32
    /// }
    ///
    /// let platform = Platform::new();
    /// platform.register::<Component>(Arc::new(Component { value: 42 }));
    /// ```
    pub fn register<T>(&self, component: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        let _ = self
            .components
            .lock()
            .unwrap()
            .insert(TypeId::of::<T>(), component);
    }

    /// Tries to resolve a previously registered component.
    ///
    /// Note, if one knows for certain, that a component will be present,
    /// [Platform::require](Platform::require) can be used.
    ///
    /// # Examples
    /// ```
    /// # use aquifer::platform::Platform;
    /// # use std::sync::Arc;
    ///
    /// struct Component {
    ///     value: i32
    /// }
    ///
    /// struct UnknownComponent;
    ///
    /// let platform = Platform::new();
    /// platform.register::<Component>(Arc::new(Component { value: 42 }));
    ///
    /// // A lookup for a known component yields a result..
    /// assert_eq!(platform.find::<Component>().unwrap().value, 42);
    ///
    /// // A lookup for an unknown component returns None...
    /// assert_eq!(platform.find::<UnknownComponent>().is_none(), true);
    /// ```
    pub fn find<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let components = self.components.lock().unwrap();
        components
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.clone().downcast::<T>().ok())
    }

    /// Resolves a previously registered component.
    ///
    /// Note, if the framework is already shutting down, all components are evicted. Therefore
    /// this might panic even if it worked before [Platform::terminate](Platform::terminate) was
    /// invoked.
    ///
    /// # Panics
    /// Panics if the requested component isn't available.
    ///
    /// # Examples
    /// ```
    /// # use aquifer::platform::Platform;
    /// # use std::sync::Arc;
    ///
    /// struct Component {
    ///     value: i32
    /// }
    ///
    /// let platform = Platform::new();
    /// platform.register::<Component>(Arc::new(Component { value: 42 }));
    ///
    /// // A lookup for a known component yields a result..
    /// assert_eq!(platform.require::<Component>().value, 42);
    /// ```
    ///
    /// Requiring a component which is unknown will panic:
    /// ```should_panic
    /// # use aquifer::platform::Platform;
    /// # use std::sync::Arc;
    ///
    /// struct UnknownComponent;
    ///
    /// let platform = Platform::new();
    ///
    /// // This will panic...
    /// platform.require::<UnknownComponent>();
    /// ```
    pub fn require<T>(&self) -> Arc<T>
    where
        T: Any + Send + Sync,
    {
        if self.is_running() {
            match self.find::<T>() {
                Some(component) => component,
                None => panic!(
                    "A required component ({}) was not available in the platform registry!",
                    std::any::type_name::<T>()
                ),
            }
        } else {
            panic!(
                "A required component ({}) has been requested but the system is already shutting down!",
                std::any::type_name::<T>()
            )
        }
    }

    /// Determines if the platform is still running or if [Platform::terminate](Platform::terminate)
    /// has already been called.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Returns when [terminate](Platform::terminate) was first invoked, if at all.
    pub fn shutdown_at(&self) -> Option<SystemTime> {
        *self.shutdown_at.lock().unwrap()
    }

    /// Terminates the platform.
    ///
    /// This will immediately release all components (so that the Dropped handlers run
    /// eventually). It will also toggle the [is_running()](Platform::is_running) flag to
    /// **false** which all background workers observe, and record the shutdown timestamp
    /// (see [shutdown_at](Platform::shutdown_at)).
    pub fn terminate(&self) {
        // Drop all components so that the Dropped handlers run (sooner or later)...
        self.components.lock().unwrap().clear();

        // A repeated terminate keeps the original timestamp...
        let mut shutdown_at = self.shutdown_at.lock().unwrap();
        if shutdown_at.is_none() {
            *shutdown_at = Some(SystemTime::now());
        }

        // Mark platform as halted...
        self.is_running.store(false, Ordering::Release);
    }
}
