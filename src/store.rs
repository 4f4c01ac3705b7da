use crate::types::ResourceKey;
use kube::Resource;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Thread-safe cache of the last observed version of every watched object.
///
/// Objects are stored behind `Arc` and swapped whole, so readers never see a
/// partially applied update.
pub struct Store<K> {
    objects: Arc<RwLock<HashMap<ResourceKey, Arc<K>>>>,
    synced: Arc<watch::Sender<bool>>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            objects: Arc::clone(&self.objects),
            synced: Arc::clone(&self.synced),
        }
    }
}

impl<K> Store<K> {
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
            synced: Arc::new(synced),
        }
    }

    pub fn get_by_key(&self, key: &ResourceKey) -> Option<Arc<K>> {
        self.objects.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Flag the first full listing as applied. Idempotent.
    pub fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Block until the first full listing has been applied or `timeout`
    /// elapses. Returns whether the cache is synced.
    pub async fn wait_for_initial_sync(&self, timeout: Duration) -> bool {
        let mut rx = self.synced.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|synced| *synced)).await,
            Ok(Ok(_))
        )
    }
}

impl<K: Resource> Store<K> {
    /// Insert or overwrite an object, returning its key.
    pub fn apply(&self, obj: K) -> ResourceKey {
        let key = ResourceKey::from_object(&obj);
        self.objects.write().insert(key.clone(), Arc::new(obj));
        key
    }

    /// Remove an object using its last known state, returning its key.
    pub fn delete(&self, obj: &K) -> ResourceKey {
        let key = ResourceKey::from_object(obj);
        self.objects.write().remove(&key);
        key
    }

    /// Swap in a complete listing.
    ///
    /// Returns every key that is listed plus every key that disappeared since
    /// the previous listing, so callers can reconcile both.
    pub fn replace(&self, objects: Vec<K>) -> Vec<ResourceKey> {
        let fresh: HashMap<ResourceKey, Arc<K>> = objects
            .into_iter()
            .map(|obj| (ResourceKey::from_object(&obj), Arc::new(obj)))
            .collect();

        let mut guard = self.objects.write();
        let mut touched: Vec<ResourceKey> = fresh.keys().cloned().collect();
        touched.extend(guard.keys().filter(|k| !fresh.contains_key(*k)).cloned());
        *guard = fresh;
        touched
    }
}
