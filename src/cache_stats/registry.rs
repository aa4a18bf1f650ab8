// src/cache_stats/registry.rs

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, Weak};

use crate::cache_stats::StatsSource;

/// Named caches available for inspection.
///
/// The registry does not keep caches alive. A name whose cache was dropped
/// stays listed but no longer resolves.
#[derive(Default)]
pub struct CacheRegistry {
    caches: RwLock<BTreeMap<String, Weak<dyn StatsSource>>>,
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("names", &self.cache_names())
            .finish()
    }
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `cache` under `name`, replacing any cache previously registered there
    pub fn register<C>(&self, name: impl Into<String>, cache: &Arc<C>)
    where
        C: StatsSource + 'static,
    {
        let source: Arc<dyn StatsSource> = Arc::clone(cache) as Arc<dyn StatsSource>;
        let mut caches = self.write();
        caches.insert(name.into(), Arc::downgrade(&source));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.write().remove(name).is_some()
    }

    /// Registered names in sorted order
    pub fn cache_names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// The live cache registered under `name`, if it still exists
    pub fn get(&self, name: &str) -> Option<Arc<dyn StatsSource>> {
        self.read().get(name).and_then(Weak::upgrade)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Weak<dyn StatsSource>>> {
        self.caches
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Weak<dyn StatsSource>>> {
        self.caches
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
