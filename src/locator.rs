//! Host service locator seam.
//!
//! Consumer and handler instances are resolved by factory key, either from
//! the ambient locator (pooled per endpoint) or from a per-message scope.
//! Scope disposal is `Drop`, so release is guaranteed on every exit path.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use crate::consumer::MessageTarget;

pub trait ServiceLocator: Send + Sync {
    /// Resolve a consumer/handler instance by factory key.
    fn resolve(&self, key: &str) -> Result<Arc<dyn MessageTarget>>;

    /// Open a resolution scope for one message dispatch.
    fn create_scope(&self) -> Box<dyn ServiceScope>;
}

pub trait ServiceScope: Send + Sync {
    fn resolve(&self, key: &str) -> Result<Arc<dyn MessageTarget>>;
}

type TargetFactory = Arc<dyn Fn() -> Arc<dyn MessageTarget> + Send + Sync>;

/// A locator backed by a static map: singleton instances plus per-scope
/// factories. Suitable for tests and hosts without a container.
#[derive(Default)]
pub struct StaticLocator {
    singletons: Mutex<HashMap<String, Arc<dyn MessageTarget>>>,
    factories: Mutex<HashMap<String, TargetFactory>>,
}

impl StaticLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shared instance returned for every resolve.
    pub fn register(&self, key: impl Into<String>, target: Arc<dyn MessageTarget>) {
        self.singletons.lock().insert(key.into(), target);
    }

    /// Register a factory invoked once per resolve; scoped resolves get a
    /// fresh instance per scope.
    pub fn register_factory(
        &self,
        key: impl Into<String>,
        factory: impl Fn() -> Arc<dyn MessageTarget> + Send + Sync + 'static,
    ) {
        self.factories.lock().insert(key.into(), Arc::new(factory));
    }

    fn lookup(&self, key: &str) -> Result<Arc<dyn MessageTarget>> {
        if let Some(target) = self.singletons.lock().get(key) {
            return Ok(target.clone());
        }
        if let Some(factory) = self.factories.lock().get(key) {
            return Ok(factory());
        }
        anyhow::bail!("no consumer registered under key '{key}'")
    }
}

impl ServiceLocator for StaticLocator {
    fn resolve(&self, key: &str) -> Result<Arc<dyn MessageTarget>> {
        self.lookup(key)
    }

    fn create_scope(&self) -> Box<dyn ServiceScope> {
        Box::new(StaticScope {
            singletons: self.singletons.lock().clone(),
            factories: self.factories.lock().clone(),
            cache: Mutex::new(HashMap::new()),
        })
    }
}

/// One resolution scope: factory-produced instances are cached for the
/// scope's lifetime, so all subscribers of one dispatch share them.
struct StaticScope {
    singletons: HashMap<String, Arc<dyn MessageTarget>>,
    factories: HashMap<String, TargetFactory>,
    cache: Mutex<HashMap<String, Arc<dyn MessageTarget>>>,
}

impl ServiceScope for StaticScope {
    fn resolve(&self, key: &str) -> Result<Arc<dyn MessageTarget>> {
        if let Some(target) = self.singletons.get(key) {
            return Ok(target.clone());
        }
        if let Some(target) = self.cache.lock().get(key) {
            return Ok(target.clone());
        }
        let factory = self
            .factories
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("no consumer registered under key '{key}'"))?;
        let target = factory();
        self.cache.lock().insert(key.to_string(), target.clone());
        Ok(target)
    }
}
