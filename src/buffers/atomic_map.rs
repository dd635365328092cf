use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::{Arc, RwLock};
use rustc_hash::FxHashMap;

/// A copy-on-write map: readers get a cheap snapshot of the current map, writers clone the map,
///  modify the clone and publish it atomically. This is a good fit for handler tables and
///  connection registries which are read on every frame but modified rarely.
pub struct AtomicMap<K,V> {
    map: RwLock<Arc<FxHashMap<K,V>>>,
}
impl <K: Hash+Eq+Clone+Sync+Send,V:Clone+Sync+Send> Default for AtomicMap<K,V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash+Eq+Clone+Sync+Send, V:Clone+Sync+Send> AtomicMap<K,V> {
    pub fn new() -> AtomicMap<K,V> {
        AtomicMap {
            map: RwLock::new(Arc::new(FxHashMap::default())),
        }
    }

    /// a consistent snapshot of the map's current content
    pub fn load(&self) -> Arc<FxHashMap<K,V>> {
        self.map.read().unwrap().clone()
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where K: Borrow<Q>, Q: Hash + Eq + ?Sized,
    {
        self.map.read().unwrap()
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Modifications are serialized, and readers never see a partially modified map. The
    ///  callback's result is passed through.
    pub fn update<R>(&self, f: impl FnOnce(&mut FxHashMap<K,V>) -> R) -> R {
        let mut current = self.map.write().unwrap();
        let mut map: FxHashMap<K,V> = (**current).clone();
        let result = f(&mut map);
        *current = Arc::new(map);
        result
    }

    /// replace the content with an empty map, returning the previous content
    pub fn clear(&self) -> Arc<FxHashMap<K,V>> {
        let mut current = self.map.write().unwrap();
        std::mem::replace(&mut *current, Arc::new(FxHashMap::default()))
    }
}
