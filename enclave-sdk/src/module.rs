//! Plugin modules and the engine that turns injected source into them.

use crate::context::PluginContext;
use crate::error::{GuestError, GuestResult};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Implemented by plugin authors.
#[async_trait]
pub trait GuestModule: Send + Sync {
    /// Called once after the entry code is evaluated.
    async fn on_load(&self, ctx: &PluginContext) -> anyhow::Result<()>;

    /// Called before the container is torn down.
    async fn on_unload(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// What a script is being evaluated as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    /// The plugin's entry code; must produce a module.
    Entry,
    /// Third-party library code loaded ahead of the entry.
    Library,
}

/// Evaluates script source inside a container.
pub trait ScriptEngine: Send + Sync {
    fn evaluate(&self, source: &str, kind: ScriptKind)
        -> GuestResult<Option<Arc<dyn GuestModule>>>;
}

pub type ModuleFactory = Arc<dyn Fn() -> Arc<dyn GuestModule> + Send + Sync>;

/// Content-addressed module table: source text is identified by its
/// SHA-256 digest, and each digest maps to a module factory.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    factories: Arc<RwLock<HashMap<String, ModuleFactory>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hex SHA-256 of `source`.
    pub fn digest(source: &str) -> String {
        hex::encode(Sha256::digest(source.as_bytes()))
    }

    /// Binds `source` to a module factory. Returns the source digest.
    pub fn register<F>(&self, source: &str, factory: F) -> String
    where
        F: Fn() -> Arc<dyn GuestModule> + Send + Sync + 'static,
    {
        let digest = Self::digest(source);
        self.factories
            .write()
            .unwrap()
            .insert(digest.clone(), Arc::new(factory));
        digest
    }

    pub fn contains(&self, source: &str) -> bool {
        self.factories
            .read()
            .unwrap()
            .contains_key(&Self::digest(source))
    }
}

impl ScriptEngine for ModuleRegistry {
    fn evaluate(
        &self,
        source: &str,
        kind: ScriptKind,
    ) -> GuestResult<Option<Arc<dyn GuestModule>>> {
        let digest = Self::digest(source);
        let factory = self.factories.read().unwrap().get(&digest).cloned();
        match (factory, kind) {
            (Some(factory), ScriptKind::Entry) => Ok(Some(factory())),
            (None, ScriptKind::Entry) => Err(GuestError::UnknownModule(digest)),
            // Library code stays in the document; it has no lifecycle.
            (_, ScriptKind::Library) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl GuestModule for Noop {
        async fn on_load(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn entry_lookup_is_by_digest() {
        let reg = ModuleRegistry::new();
        let digest = reg.register("export default 1", || Arc::new(Noop));
        assert_eq!(digest, ModuleRegistry::digest("export default 1"));
        assert!(reg.evaluate("export default 1", ScriptKind::Entry).unwrap().is_some());

        let err = reg.evaluate("export default 2", ScriptKind::Entry).err().unwrap();
        assert!(matches!(err, GuestError::UnknownModule(_)));
    }

    #[test]
    fn libraries_never_produce_modules() {
        let reg = ModuleRegistry::new();
        reg.register("lib", || Arc::new(Noop));
        assert!(reg.evaluate("lib", ScriptKind::Library).unwrap().is_none());
        assert!(reg.evaluate("other", ScriptKind::Library).unwrap().is_none());
    }
}
