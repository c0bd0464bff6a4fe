//! Weak-key adapter: a cache whose keys do not keep themselves alive.
//!
//! `WeakKeyCache` wraps an [`InstanceCache`] keyed by [`KeyHandle`], a
//! weak reference to an `Arc<K>` with its hash cached at wrap time.
//! While a key's construction is in flight the handle holds a
//! temporary strong reference, so the construction function always
//! sees a live key even if every other strong reference vanishes
//! mid-construction; the inner cache's key-finalize hook releases it
//! once the builder record is dropped. Expired handles observed during
//! lookups are queued and purged by the background purge sweeper.

use crate::cache::InstanceCache;
use crate::error::{BoxedError, CacheError};
use crate::sweep::{self, Sweep};
use hashbrown::hash_map::DefaultHashBuilder;
use parking_lot::Mutex;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::{Arc, Weak};

/// A cache key holding its referent weakly.
///
/// Two handles are equal when they point at the same allocation, or
/// when both referents are alive and value-equal. An expired referent
/// compares unequal to everything but its own clones, and the hash is
/// cached at wrap time, so expiry never moves a handle inside a map.
pub struct KeyHandle<K> {
    weak: Weak<K>,
    hash: u64,
    /// Shared across clones: the finalize hook clears the slot on the
    /// clone stored in the cache and every other clone sees it.
    strong: Arc<Mutex<Option<Arc<K>>>>,
}

impl<K> KeyHandle<K> {
    /// The key, if it is still alive.
    pub fn upgrade(&self) -> Option<Arc<K>> {
        self.weak.upgrade()
    }

    pub fn is_expired(&self) -> bool {
        self.weak.strong_count() == 0
    }

    pub(crate) fn clear_strong(&self) {
        *self.strong.lock() = None;
    }
}

impl<K> Clone for KeyHandle<K> {
    fn clone(&self) -> Self {
        Self {
            weak: self.weak.clone(),
            hash: self.hash,
            strong: Arc::clone(&self.strong),
        }
    }
}

impl<K: Eq> PartialEq for KeyHandle<K> {
    fn eq(&self, other: &Self) -> bool {
        if Weak::ptr_eq(&self.weak, &other.weak) {
            return true;
        }
        match (self.weak.upgrade(), other.weak.upgrade()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl<K: Eq> Eq for KeyHandle<K> {}

impl<K> Hash for KeyHandle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl<K> std::fmt::Debug for KeyHandle<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyHandle")
            .field("expired", &self.is_expired())
            .finish_non_exhaustive()
    }
}

struct AdapterState<K, I> {
    cache: InstanceCache<KeyHandle<K>, I>,
    hasher: DefaultHashBuilder,
    to_discard: Mutex<Vec<KeyHandle<K>>>,
}

/// A keyed single-flight cache with weakly-held keys. See the module
/// docs for the handle protocol; the operation semantics are those of
/// [`InstanceCache`].
pub struct WeakKeyCache<K, I> {
    state: Arc<AdapterState<K, I>>,
}

impl<K, I> Clone for WeakKeyCache<K, I> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<K, I> WeakKeyCache<K, I>
where
    K: Eq + Hash + Send + Sync + 'static,
    I: Send + Sync + 'static,
{
    /// Creates a cache with a default construction function.
    pub fn new<F>(construct: F) -> Self
    where
        F: Fn(&Arc<K>) -> Result<Arc<I>, BoxedError> + Send + Sync + 'static,
    {
        let inner = InstanceCache::with_key_finalizer(
            move |handle: &KeyHandle<K>| match handle.upgrade() {
                Some(key) => construct(&key),
                None => Err(BoxedError::from("key expired before construction")),
            },
            |handle: &KeyHandle<K>| handle.clear_strong(),
        );
        let state = Arc::new(AdapterState {
            cache: inner,
            hasher: DefaultHashBuilder::default(),
            to_discard: Mutex::new(Vec::new()),
        });
        // Downgrade first; the unsized coercion to `Weak<dyn Sweep>`
        // happens at the call, where no inference is in play.
        let weak = Arc::downgrade(&state);
        sweep::purger().register(weak);
        Self { state }
    }

    fn wrap(&self, key: &Arc<K>, hold: bool) -> KeyHandle<K> {
        KeyHandle {
            weak: Arc::downgrade(key),
            hash: self.state.hasher.hash_one(&**key),
            strong: Arc::new(Mutex::new(hold.then(|| Arc::clone(key)))),
        }
    }

    pub fn get(&self, key: &Arc<K>) -> Option<Arc<I>> {
        self.state.cache.get(&self.wrap(key, false))
    }

    pub fn get_or_construct(&self, key: &Arc<K>) -> Result<Arc<I>, CacheError> {
        let handle = self.wrap(key, true);
        let result = self.state.cache.get_or_construct(&handle);
        handle.clear_strong();
        result
    }

    pub fn get_or_construct_with<F>(&self, key: &Arc<K>, construct: F) -> Result<Arc<I>, CacheError>
    where
        F: FnOnce(&Arc<K>) -> Result<Arc<I>, BoxedError> + Send + 'static,
    {
        let handle = self.wrap(key, true);
        let result = self
            .state
            .cache
            .get_or_construct_with(&handle, Self::lift(construct));
        handle.clear_strong();
        result
    }

    pub fn construct_with<F>(&self, key: &Arc<K>, construct: F) -> Result<Arc<I>, CacheError>
    where
        F: FnOnce(&Arc<K>) -> Result<Arc<I>, BoxedError> + Send + 'static,
    {
        let handle = self.wrap(key, true);
        let result = self
            .state
            .cache
            .construct_with(&handle, Self::lift(construct));
        handle.clear_strong();
        result
    }

    /// Adapts a key-level construction function to the handle level.
    fn lift<F>(
        construct: F,
    ) -> impl FnOnce(&KeyHandle<K>) -> Result<Arc<I>, BoxedError> + Send + 'static
    where
        F: FnOnce(&Arc<K>) -> Result<Arc<I>, BoxedError> + Send + 'static,
    {
        move |handle| match handle.upgrade() {
            Some(key) => construct(&key),
            None => Err(BoxedError::from("key expired before construction")),
        }
    }

    pub fn put(&self, key: &Arc<K>, instance: &Arc<I>) -> Result<Option<Arc<I>>, CacheError> {
        self.state.cache.put(&self.wrap(key, false), instance)
    }

    pub fn remove(&self, key: &Arc<K>) -> Result<Option<Arc<I>>, CacheError> {
        self.state.cache.remove(&self.wrap(key, false))
    }

    /// The live keys currently attached to `instance`.
    pub fn keys_for(&self, instance: &Arc<I>) -> Result<Vec<Arc<K>>, CacheError> {
        let handles = self.state.cache.keys_for(instance)?;
        Ok(self.unwrap_keys(handles))
    }

    /// Every live key in the cache.
    pub fn keys(&self) -> Vec<Arc<K>> {
        let handles = self.state.cache.keys();
        self.unwrap_keys(handles)
    }

    pub fn instances(&self) -> Vec<Arc<I>> {
        self.state.cache.instances()
    }

    pub fn len(&self) -> usize {
        self.state.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.cache.is_empty()
    }

    /// Synchronous reconcile plus purge of expired handles.
    pub fn reconcile(&self) -> Result<(), CacheError> {
        self.state.cache.reconcile()?;
        self.state.sweep();
        Ok(())
    }

    /// Upgrades live handles; expired ones go to the discard queue for
    /// the purge sweeper.
    fn unwrap_keys(&self, handles: impl IntoIterator<Item = KeyHandle<K>>) -> Vec<Arc<K>> {
        let mut live = Vec::new();
        let mut expired = Vec::new();
        for handle in handles {
            match handle.upgrade() {
                Some(key) => live.push(key),
                None => expired.push(handle),
            }
        }
        if !expired.is_empty() {
            self.state.to_discard.lock().extend(expired);
        }
        live
    }
}

impl<K, I> Sweep for AdapterState<K, I>
where
    K: Eq + Hash + Send + Sync + 'static,
    I: Send + Sync + 'static,
{
    fn sweep(&self) {
        let mut expired: Vec<KeyHandle<K>> = std::mem::take(&mut *self.to_discard.lock());
        for handle in self.cache.keys() {
            if handle.is_expired() {
                expired.push(handle);
            }
        }
        for handle in expired {
            if let Err(err) = self.cache.remove(&handle) {
                tracing::warn!(error = %err, "failed to purge an expired key handle");
            }
        }
    }
}
