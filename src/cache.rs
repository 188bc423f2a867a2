//! Connection-scoped metadata cache.
//!
//! Catalog reads are memoized only while a transaction or savepoint is open.
//! The slot is filled by [`CacheSlot::begin`] on entry to the outermost scope
//! and emptied by [`CacheSlot::end`] when it is left, whichever way.

use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::{Mutex, MutexGuard};

use seahash::SeaHasher;
use tracing::trace;

use crate::catalog::{Generator, Population, Variable};

pub type FastMap<K, V> = HashMap<K, V, BuildHasherDefault<SeaHasher>>;

#[derive(Debug, Default)]
pub struct MetadataCache {
    pub populations: FastMap<String, Option<Population>>,
    pub populations_by_id: FastMap<i64, Population>,
    pub generators: FastMap<String, Option<Generator>>,
    pub generators_by_id: FastMap<i64, Generator>,
    pub generators_of: FastMap<i64, Vec<Generator>>,
    /// Variables keyed by population and, for latent ones, generator.
    pub variables: FastMap<(i64, Option<i64>), Vec<Variable>>,
    pub modelnos: FastMap<i64, Vec<u32>>,
}

#[derive(Debug, Default)]
pub struct CacheSlot {
    slot: Mutex<Option<MetadataCache>>,
}

impl CacheSlot {
    fn lock(&self) -> MutexGuard<'_, Option<MetadataCache>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn begin(&self) {
        trace!("metadata cache opened");
        *self.lock() = Some(MetadataCache::default());
    }

    pub fn end(&self) {
        trace!("metadata cache closed");
        *self.lock() = None;
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    /// Forgets everything cached so far, keeping the cache open.
    pub fn invalidate(&self) {
        let mut slot = self.lock();
        if slot.is_some() {
            *slot = Some(MetadataCache::default());
        }
    }

    /// Runs `f` on the open cache, if any.
    pub fn with<R>(&self, f: impl FnOnce(&mut MetadataCache) -> R) -> Option<R> {
        self.lock().as_mut().map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_lives_between_begin_and_end() {
        let slot = CacheSlot::default();
        assert!(slot.with(|c| c.modelnos.len()).is_none());
        slot.begin();
        slot.with(|c| c.modelnos.insert(1, vec![0, 1]));
        assert_eq!(slot.with(|c| c.modelnos.get(&1).cloned()), Some(Some(vec![0, 1])));
        slot.invalidate();
        assert!(slot.is_active());
        assert_eq!(slot.with(|c| c.modelnos.len()), Some(0));
        slot.end();
        assert!(!slot.is_active());
    }
}
