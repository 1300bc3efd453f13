//! Service implementations and their factories.
//!
//! User code implements [`RpcService`] and registers a [`ServiceFactory`]
//! under the fully-qualified service name. The server asks the
//! [`ImplementationRegistry`] for an instance every time the service is
//! (re)registered.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tonic::Status;
use tracing::debug;

use crate::client::Clients;

/// A service implementation.
///
/// Methods receive and return JSON values shaped like the method's input and
/// output messages.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    /// Handle one unary call.
    async fn call(&self, method: &str, request: Value) -> Result<Value, Status>;

    /// Runs once after registration, when every outbound connection is live.
    async fn init(&self) -> Result<(), HookError> {
        Ok(())
    }

    /// Runs once before the instance is unregistered.
    async fn destroy(&self) -> Result<(), HookError> {
        Ok(())
    }
}

/// Failure reported by a lifecycle hook.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HookError(pub String);

impl From<String> for HookError {
    fn from(message: String) -> Self {
        HookError(message)
    }
}

impl From<&str> for HookError {
    fn from(message: &str) -> Self {
        HookError(message.to_string())
    }
}

/// What a factory gets to build an instance with.
#[derive(Clone)]
pub struct ServiceContext {
    /// Name of the app serving the instance.
    pub app_name: String,
    /// Handle to every consumed service.
    pub clients: Clients,
}

type BuildFn = dyn Fn(&ServiceContext) -> Arc<dyn RpcService> + Send + Sync;

/// How an implementation is obtained.
#[derive(Clone)]
pub enum ServiceFactory {
    /// A fresh instance per registration.
    Construct(Arc<BuildFn>),
    /// One process-wide instance, shared with non-RPC callers.
    Shared(Arc<BuildFn>),
}

impl ServiceFactory {
    pub fn construct<F>(build: F) -> Self
    where
        F: Fn(&ServiceContext) -> Arc<dyn RpcService> + Send + Sync + 'static,
    {
        ServiceFactory::Construct(Arc::new(build))
    }

    pub fn shared<F>(build: F) -> Self
    where
        F: Fn(&ServiceContext) -> Arc<dyn RpcService> + Send + Sync + 'static,
    {
        ServiceFactory::Shared(Arc::new(build))
    }
}

impl fmt::Debug for ServiceFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceFactory::Construct(_) => f.write_str("ServiceFactory::Construct"),
            ServiceFactory::Shared(_) => f.write_str("ServiceFactory::Shared"),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    factories: HashMap<String, ServiceFactory>,
    dependencies: HashMap<String, HashSet<String>>,
    shared: HashMap<String, Arc<dyn RpcService>>,
}

/// Registry of implementation factories.
#[derive(Default)]
pub struct ImplementationRegistry {
    state: Mutex<RegistryState>,
}

impl ImplementationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for a service.
    ///
    /// Replacing a factory drops any cached shared instance built by the old one.
    pub fn register(&self, name: impl Into<String>, factory: ServiceFactory) -> &Self {
        let name = name.into();
        if let Ok(mut state) = self.state.lock() {
            state.shared.remove(&name);
            state.factories.insert(name, factory);
        }
        self
    }

    /// Record that the implementation of `name` depends on the named implementations.
    pub fn depends_on<I, S>(&self, name: &str, deps: I) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut state) = self.state.lock() {
            state
                .dependencies
                .entry(name.to_string())
                .or_default()
                .extend(deps.into_iter().map(Into::into));
        }
        self
    }

    /// Whether a factory is registered for the service.
    pub fn contains(&self, name: &str) -> bool {
        self.state
            .lock()
            .map(|state| state.factories.contains_key(name))
            .unwrap_or(false)
    }

    /// Obtain an instance, or `None` when no factory is registered.
    pub fn instantiate(&self, name: &str, ctx: &ServiceContext) -> Option<Arc<dyn RpcService>> {
        let factory = {
            let state = self.state.lock().ok()?;
            if let Some(instance) = state.shared.get(name) {
                return Some(instance.clone());
            }
            state.factories.get(name)?.clone()
        };

        // Factories run unlocked so they may consult the registry themselves.
        match factory {
            ServiceFactory::Construct(build) => Some(build(ctx)),
            ServiceFactory::Shared(build) => {
                let instance = build(ctx);
                let mut state = self.state.lock().ok()?;
                Some(
                    state
                        .shared
                        .entry(name.to_string())
                        .or_insert(instance)
                        .clone(),
                )
            }
        }
    }

    /// The cached shared instance of a service, if one has been built.
    pub fn shared(&self, name: &str) -> Option<Arc<dyn RpcService>> {
        self.state.lock().ok()?.shared.get(name).cloned()
    }

    /// Mark the named implementations and everything they transitively
    /// depend on as stale.
    ///
    /// Returns the invalidated names.
    pub fn invalidate<'a, I>(&self, names: I) -> HashSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let Ok(mut state) = self.state.lock() else {
            return HashSet::new();
        };

        let mut stale: HashSet<String> = HashSet::new();
        let mut queue: Vec<String> = names.into_iter().map(str::to_string).collect();
        while let Some(name) = queue.pop() {
            if !stale.insert(name.clone()) {
                continue;
            }
            if let Some(deps) = state.dependencies.get(&name) {
                queue.extend(deps.iter().cloned());
            }
        }

        for name in &stale {
            if state.shared.remove(name).is_some() {
                debug!(service = %name, "Dropped cached shared instance");
            }
        }
        stale
    }
}

impl fmt::Debug for ImplementationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .state
            .lock()
            .map(|state| state.factories.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("ImplementationRegistry")
            .field("factories", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter;

    #[async_trait]
    impl RpcService for Counter {
        async fn call(&self, _method: &str, request: Value) -> Result<Value, Status> {
            Ok(request)
        }
    }

    fn ctx() -> ServiceContext {
        ServiceContext {
            app_name: "test".to_string(),
            clients: Clients::default(),
        }
    }

    fn counting(builds: Arc<AtomicUsize>, shared: bool) -> ServiceFactory {
        let build = move |_: &ServiceContext| -> Arc<dyn RpcService> {
            builds.fetch_add(1, Ordering::SeqCst);
            Arc::new(Counter)
        };
        if shared {
            ServiceFactory::shared(build)
        } else {
            ServiceFactory::construct(build)
        }
    }

    #[test]
    fn test_construct_builds_every_time() {
        let builds = Arc::new(AtomicUsize::new(0));
        let registry = ImplementationRegistry::new();
        registry.register("services.Echo", counting(builds.clone(), false));

        registry.instantiate("services.Echo", &ctx()).unwrap();
        registry.instantiate("services.Echo", &ctx()).unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert!(registry.shared("services.Echo").is_none());
    }

    #[test]
    fn test_shared_is_cached_until_invalidated() {
        let builds = Arc::new(AtomicUsize::new(0));
        let registry = ImplementationRegistry::new();
        registry.register("services.Echo", counting(builds.clone(), true));

        let a = registry.instantiate("services.Echo", &ctx()).unwrap();
        let b = registry.instantiate("services.Echo", &ctx()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(registry.shared("services.Echo").is_some());

        registry.invalidate(["services.Echo"]);
        assert!(registry.shared("services.Echo").is_none());
        let c = registry.instantiate("services.Echo", &ctx()).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_invalidate_follows_dependencies() {
        let registry = ImplementationRegistry::new();
        let builds = Arc::new(AtomicUsize::new(0));
        for name in ["a", "b", "c", "d"] {
            registry.register(name, counting(builds.clone(), true));
            registry.instantiate(name, &ctx()).unwrap();
        }
        registry.depends_on("a", ["b"]);
        registry.depends_on("b", ["c"]);
        registry.depends_on("c", ["a"]);

        let stale = registry.invalidate(["a"]);
        assert_eq!(
            stale,
            HashSet::from(["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert!(registry.shared("d").is_some());
        assert!(registry.shared("b").is_none());
    }

    #[test]
    fn test_missing_factory_yields_none() {
        let registry = ImplementationRegistry::new();
        assert!(registry.instantiate("services.Nope", &ctx()).is_none());
        assert!(!registry.contains("services.Nope"));
    }
}
