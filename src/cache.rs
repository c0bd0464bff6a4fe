//! The keyed single-flight cache.
//!
//! `InstanceCache` maps keys to shared instances and guarantees that a
//! concurrently-requested construction runs at most once per key, with
//! every caller receiving the same `Arc`. Instances are held weakly;
//! once the last external strong reference drops, a reconcile sweep
//! removes the entry. A later, forced construction supersedes an
//! in-flight or finished one through the builder override chain.
//!
//! Lock order is fixed: the instance map's section is taken before the
//! in-progress map's section, never the reverse. The construct-thread
//! registry is only ever locked on its own. Construction closures run
//! with no cache lock held.

use crate::builder::{Builder, ConstructFn, Stage};
use crate::error::{BoxedError, CacheError};
use crate::guarded::Guarded;
use crate::sweep::{self, Sweep};
use hashbrown::{HashMap, HashSet};
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

/// Tracked state for one live instance.
struct Entry<K, I> {
    instance: Weak<I>,
    keys: HashSet<K>,
}

/// The completed map: instance identity to key set, plus a key index.
///
/// Instances are indexed by allocation address. An address can be
/// reused after its previous occupant is dropped, so every identity
/// check upgrades the stored weak and compares the live `Arc` instead
/// of trusting the address alone.
pub(crate) struct InstanceMap<K, I> {
    by_instance: HashMap<usize, Entry<K, I>>,
    by_key: HashMap<K, Weak<I>>,
}

fn addr_of<I>(instance: &Arc<I>) -> usize {
    Arc::as_ptr(instance) as usize
}

impl<K, I> InstanceMap<K, I>
where
    K: Eq + Hash + Clone,
{
    fn new() -> Self {
        Self {
            by_instance: HashMap::new(),
            by_key: HashMap::new(),
        }
    }

    fn get(&self, key: &K) -> Option<Arc<I>> {
        self.by_key.get(key)?.upgrade()
    }

    fn contains(&self, instance: &Arc<I>) -> bool {
        self.by_instance
            .get(&addr_of(instance))
            .and_then(|e| e.instance.upgrade())
            .is_some_and(|live| Arc::ptr_eq(&live, instance))
    }

    /// Tracks `instance`, scrubbing a stale entry left behind by a
    /// previous allocation at the same address.
    fn ensure_present(&mut self, instance: &Arc<I>) {
        let addr = addr_of(instance);
        if let Some(existing) = self.by_instance.get(&addr) {
            if existing
                .instance
                .upgrade()
                .is_some_and(|live| Arc::ptr_eq(&live, instance))
            {
                return;
            }
        }
        if let Some(stale) = self.by_instance.remove(&addr) {
            for key in stale.keys {
                if self.by_key.get(&key).is_some_and(|w| w.strong_count() == 0) {
                    self.by_key.remove(&key);
                }
            }
        }
        self.by_instance.insert(
            addr,
            Entry {
                instance: Arc::downgrade(instance),
                keys: HashSet::new(),
            },
        );
    }

    fn attach(&mut self, key: K, instance: &Arc<I>) {
        self.ensure_present(instance);
        if let Some(entry) = self.by_instance.get_mut(&addr_of(instance)) {
            entry.keys.insert(key.clone());
        }
        self.by_key.insert(key, Arc::downgrade(instance));
    }

    /// Removes `key` from its current owner and returns that owner.
    fn detach_key(&mut self, key: &K) -> Option<Arc<I>> {
        let weak = self.by_key.remove(key)?;
        let addr = weak.as_ptr() as usize;
        if let Some(entry) = self.by_instance.get_mut(&addr) {
            if Weak::ptr_eq(&entry.instance, &weak) {
                entry.keys.remove(key);
            }
        }
        weak.upgrade()
    }

    /// Detaches `key` unless it already maps to the instance at
    /// `new_addr`. The displaced previous owner is returned.
    fn displace_key(&mut self, key: &K, new_addr: usize) -> Option<Arc<I>> {
        match self.by_key.get(key) {
            Some(weak) if weak.as_ptr() as usize == new_addr => None,
            Some(_) => self.detach_key(key),
            None => None,
        }
    }

    fn displace_and_attach(&mut self, key: &K, instance: &Arc<I>) -> Option<Arc<I>> {
        let displaced = self.displace_key(key, addr_of(instance));
        self.attach(key.clone(), instance);
        displaced
    }

    fn keys_of(&self, instance: &Arc<I>) -> Option<HashSet<K>> {
        let entry = self.by_instance.get(&addr_of(instance))?;
        entry
            .instance
            .upgrade()
            .is_some_and(|live| Arc::ptr_eq(&live, instance))
            .then(|| entry.keys.clone())
    }

    fn purge_dead(&mut self) {
        self.by_instance.retain(|_, e| e.instance.strong_count() > 0);
        self.by_key.retain(|_, w| w.strong_count() > 0);
    }
}

type DefaultConstruct<K, I> = Arc<dyn Fn(&K) -> Result<Arc<I>, BoxedError> + Send + Sync>;
type KeyFinalizer<K> = Box<dyn Fn(&K) + Send + Sync>;

pub(crate) struct Shared<K, I> {
    instances: Guarded<InstanceMap<K, I>>,
    in_progress: Guarded<HashMap<K, Arc<Builder<K, I>>>>,
    construct_threads: Guarded<HashMap<ThreadId, Arc<Builder<K, I>>>>,
    default_construct: DefaultConstruct<K, I>,
    /// Runs for each key whose builder record is dropped; the weak-key
    /// adapter uses it to release its temporary strong key reference.
    key_finalizer: Option<KeyFinalizer<K>>,
}

/// A keyed, single-flight, weak-reference-aware instance cache.
///
/// Cloning is cheap and yields a handle to the same cache. See the
/// crate docs for the construction and override protocol.
pub struct InstanceCache<K, I> {
    shared: Arc<Shared<K, I>>,
}

impl<K, I> Clone for InstanceCache<K, I> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// How a `get_or_construct` caller proceeds after the planning section.
enum Plan<K, I> {
    Hit(Arc<I>),
    Join(Arc<Builder<K, I>>),
    Own(Arc<Builder<K, I>>),
}

impl<K, I> InstanceCache<K, I>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    I: Send + Sync + 'static,
{
    /// Creates a cache with a default construction function, used by
    /// [`get_or_construct`](Self::get_or_construct).
    pub fn new<F>(construct: F) -> Self
    where
        F: Fn(&K) -> Result<Arc<I>, BoxedError> + Send + Sync + 'static,
    {
        Self::build(Arc::new(construct), None)
    }

    pub(crate) fn with_key_finalizer<F, G>(construct: F, finalizer: G) -> Self
    where
        F: Fn(&K) -> Result<Arc<I>, BoxedError> + Send + Sync + 'static,
        G: Fn(&K) + Send + Sync + 'static,
    {
        Self::build(Arc::new(construct), Some(Box::new(finalizer)))
    }

    fn build(construct: DefaultConstruct<K, I>, finalizer: Option<KeyFinalizer<K>>) -> Self {
        let shared = Arc::new(Shared {
            instances: Guarded::new(InstanceMap::new()),
            in_progress: Guarded::new(HashMap::new()),
            construct_threads: Guarded::new(HashMap::new()),
            default_construct: construct,
            key_finalizer: finalizer,
        });
        // Downgrade first; the unsized coercion to `Weak<dyn Sweep>`
        // happens at the call, where no inference is in play.
        let weak = Arc::downgrade(&shared);
        sweep::reconciler().register(weak);
        Self { shared }
    }

    /// Pure lookup: never constructs, never blocks on a construction.
    ///
    /// A builder that has finished but not yet been reconciled into the
    /// instance map is consulted too, so a finished result is visible
    /// to `get` immediately.
    pub fn get(&self, key: &K) -> Option<Arc<I>> {
        let hit = self.shared.instances.read(|map| map.get(key));
        if hit.is_some() {
            return hit;
        }
        self.shared.in_progress.read(|builders| {
            let start = builders.get(key)?;
            match Builder::peek_chain(start) {
                Some(Ok(instance)) => Some(instance),
                _ => None,
            }
        })
    }

    /// Returns the instance for `key`, constructing it with the cache's
    /// default construction function if necessary. Concurrent callers
    /// for the same key share one construction and one `Arc`.
    pub fn get_or_construct(&self, key: &K) -> Result<Arc<I>, CacheError> {
        let construct = Arc::clone(&self.shared.default_construct);
        self.join_or_own(key, Box::new(move |k: &K| construct(k)))
    }

    /// Like [`get_or_construct`](Self::get_or_construct) with a one-off
    /// construction function. The function runs only if this call ends
    /// up owning a new builder.
    pub fn get_or_construct_with<F>(&self, key: &K, construct: F) -> Result<Arc<I>, CacheError>
    where
        F: FnOnce(&K) -> Result<Arc<I>, BoxedError> + Send + 'static,
    {
        self.join_or_own(key, Box::new(construct))
    }

    fn join_or_own(&self, key: &K, construct: ConstructFn<K, I>) -> Result<Arc<I>, CacheError> {
        let me = thread::current().id();
        if self.current_thread_builder(me).is_some() {
            return Err(CacheError::NestedConstruct);
        }
        let plan = self.shared.instances.read(|map| {
            if let Some(instance) = map.get(key) {
                return Ok(Plan::Hit(instance));
            }
            // Holding the instance read section pins the in-progress
            // map against reconciliation, so the two checks are one
            // consistent snapshot.
            self.shared.in_progress.write(|builders| {
                if let Some(start) = builders.get(key) {
                    Plan::Join(Arc::clone(start))
                } else {
                    let builder = Builder::new(key.clone(), construct, false);
                    builders.insert(key.clone(), Arc::clone(&builder));
                    Plan::Own(builder)
                }
            })
        })?;
        match plan {
            Plan::Hit(instance) => Ok(instance),
            Plan::Join(start) => Builder::resolve(&start, me),
            Plan::Own(builder) => {
                self.run_builder(&builder)?;
                Builder::resolve(&builder, me)
            }
        }
    }

    /// Unconditionally constructs a fresh instance for `key`,
    /// superseding any current instance or in-flight construction. The
    /// override is appended at the chain tail, so its result becomes
    /// authoritative for every waiter.
    pub fn construct_with<F>(&self, key: &K, construct: F) -> Result<Arc<I>, CacheError>
    where
        F: FnOnce(&K) -> Result<Arc<I>, BoxedError> + Send + 'static,
    {
        let me = thread::current().id();
        if self.current_thread_builder(me).is_some() {
            return Err(CacheError::NestedConstruct);
        }
        let builder = Builder::new(key.clone(), Box::new(construct), true);
        self.shared.instances.read(|_| {
            self.shared.in_progress.write(|builders| {
                if let Some(start) = builders.get(key) {
                    Builder::tail(start).supersede(Arc::clone(&builder));
                } else {
                    builders.insert(key.clone(), Arc::clone(&builder));
                }
            })
        })?;
        self.run_builder(&builder)?;
        Builder::resolve(&builder, me)
    }

    /// Attaches `key` to an instance this cache already knows, removing
    /// the key from whichever instance previously owned it. The
    /// displaced previous owner is returned where one was directly
    /// replaced.
    ///
    /// Outside a construction, only instances the cache constructed or
    /// previously accepted are allowed; anything else is rejected as
    /// [`CacheError::UnrecognizedInstance`]. From inside a construction
    /// function, `put` is the supported way to hand the cache a new
    /// instance: the value joins the key's override chain, yielding to
    /// a forced construction already in flight and overriding anything
    /// else.
    pub fn put(&self, key: &K, instance: &Arc<I>) -> Result<Option<Arc<I>>, CacheError> {
        let me = thread::current().id();
        let my_builder = self.current_thread_builder(me);
        self.shared.instances.write(|map| {
            if map.contains(instance) {
                return Ok(map.displace_and_attach(key, instance));
            }
            self.shared.in_progress.write(|builders| {
                let current = builders.get(key).map(Arc::clone);
                let Some(mine) = &my_builder else {
                    // Outside a construction the instance must already
                    // be known: here, only as some chain's outcome.
                    if current
                        .as_ref()
                        .is_some_and(|start| Builder::chain_contains(start, Arc::as_ptr(instance)))
                    {
                        let displaced = map.displace_and_attach(key, instance);
                        self.drop_builder(map, builders, key);
                        return Ok(displaced);
                    }
                    if builders
                        .values()
                        .any(|start| Builder::chain_contains(start, Arc::as_ptr(instance)))
                    {
                        return Ok(map.displace_and_attach(key, instance));
                    }
                    return Err(CacheError::UnrecognizedInstance);
                };
                match current {
                    // A forced construction with a free key installs
                    // its value directly; a plain one queues it so a
                    // later override still gets its chance.
                    None if mine.forced() => Ok(map.displace_and_attach(key, instance)),
                    None => {
                        let ready = Builder::ready(key.clone(), Arc::clone(instance), false);
                        builders.insert(key.clone(), ready);
                        Ok(None)
                    }
                    // A plain put must not discard a forced in-flight
                    // construction: splice at the head instead, leaving
                    // the put value as the fallback.
                    Some(start) if start.forced() && !mine.forced() => {
                        let head = Builder::ready(key.clone(), Arc::clone(instance), false);
                        head.supersede(Arc::clone(&start));
                        builders.insert(key.clone(), head);
                        Ok(None)
                    }
                    Some(start) => {
                        let ready = Builder::ready(key.clone(), Arc::clone(instance), mine.forced());
                        Builder::tail(&start).supersede(ready);
                        Ok(None)
                    }
                }
            })?
        })?
    }

    /// Detaches `key` from whichever instance owns it and returns that
    /// instance. The instance stays tracked while externally reachable;
    /// an in-flight construction keeps running but its record is
    /// dropped, so the key is free again immediately.
    pub fn remove(&self, key: &K) -> Result<Option<Arc<I>>, CacheError> {
        let removed = self.shared.instances.write(|map| {
            self.shared.in_progress.write(|builders| {
                let mut from_builder = None;
                if let Some(start) = builders.get(key).map(Arc::clone) {
                    self.drop_builder(map, builders, key);
                    if let Some(Ok(instance)) = Builder::peek_chain(&start) {
                        map.ensure_present(&instance);
                        from_builder = Some(instance);
                    }
                }
                map.detach_key(key).or(from_builder)
            })
        })??;
        Ok(removed)
    }

    /// Removes `key`'s builder record, keeping every successful chain
    /// outcome tracked. Links still constructing are left untouched:
    /// their waiters hold the chain and resolve once the outcome lands,
    /// and `run_builder` tracks that outcome for a record dropped
    /// mid-flight. Caller holds both write sections.
    fn drop_builder(
        &self,
        map: &mut InstanceMap<K, I>,
        builders: &mut HashMap<K, Arc<Builder<K, I>>>,
        key: &K,
    ) {
        let Some(start) = builders.remove(key) else {
            return;
        };
        for link in Builder::chain_links(&start) {
            if link.stage() < Stage::Returned {
                continue;
            }
            if let Some(Ok(instance)) = link.peek() {
                map.ensure_present(&instance);
            }
            link.mark_finalized();
        }
        if let Some(finalize) = &self.shared.key_finalizer {
            finalize(key);
        }
    }

    /// The keys currently attached to `instance`. Pending builders for
    /// this cache are reconciled first so keys from just-finished
    /// constructions and puts are included.
    pub fn keys_for(&self, instance: &Arc<I>) -> Result<HashSet<K>, CacheError> {
        self.reconcile()?;
        self.shared
            .instances
            .read(|map| map.keys_of(instance))
            .ok_or(CacheError::UnrecognizedInstance)
    }

    /// Detaches every key of `instance` and returns the detached set.
    pub fn clear_keys_for(&self, instance: &Arc<I>) -> Result<HashSet<K>, CacheError> {
        self.reconcile()?;
        let cleared = self.shared.instances.write(|map| {
            let keys = map.keys_of(instance)?;
            for key in &keys {
                map.detach_key(key);
            }
            Some(keys)
        })?;
        cleared.ok_or(CacheError::UnrecognizedInstance)
    }

    /// Every key with a live owner, including keys whose construction
    /// is still in flight.
    pub fn keys(&self) -> HashSet<K> {
        self.shared.instances.read(|map| {
            self.shared.in_progress.read(|builders| {
                let mut keys: HashSet<K> = map
                    .by_key
                    .iter()
                    .filter(|(_, weak)| weak.strong_count() > 0)
                    .map(|(key, _)| key.clone())
                    .collect();
                keys.extend(builders.keys().cloned());
                keys
            })
        })
    }

    /// Every live instance, including finished in-flight results.
    pub fn instances(&self) -> Vec<Arc<I>> {
        self.shared.instances.read(|map| {
            self.shared.in_progress.read(|builders| {
                let mut seen = HashSet::new();
                let mut all = Vec::new();
                for entry in map.by_instance.values() {
                    if let Some(instance) = entry.instance.upgrade() {
                        if seen.insert(addr_of(&instance)) {
                            all.push(instance);
                        }
                    }
                }
                for start in builders.values() {
                    for link in Builder::chain_links(start) {
                        if let Some(Ok(instance)) = link.peek() {
                            if seen.insert(addr_of(&instance)) {
                                all.push(instance);
                            }
                        }
                    }
                }
                all
            })
        })
    }

    /// Live instances matching `predicate`, at most `limit` of them
    /// (`0` meaning no limit).
    pub fn find_where<F>(&self, mut predicate: F, limit: usize) -> Vec<Arc<I>>
    where
        F: FnMut(&I) -> bool,
    {
        let mut found = Vec::new();
        for instance in self.instances() {
            if predicate(&instance) {
                found.push(instance);
                if limit != 0 && found.len() >= limit {
                    break;
                }
            }
        }
        found
    }

    /// Number of distinct live instances.
    pub fn len(&self) -> usize {
        self.instances().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs one synchronous reconcile pass over this cache: finished
    /// builder chains are folded into the instance map and dead entries
    /// are pruned. The background sweeper does the same periodically;
    /// this exists for callers that need the effect deterministically.
    pub fn reconcile(&self) -> Result<(), CacheError> {
        Ok(self.shared.reconcile_pass()?)
    }

    fn current_thread_builder(&self, me: ThreadId) -> Option<Arc<Builder<K, I>>> {
        self.shared
            .construct_threads
            .read(|threads| threads.get(&me).map(Arc::clone))
    }

    /// Executes the builder's construction closure on the calling
    /// thread. No cache lock is held while the closure runs. A panic is
    /// recorded as a construction failure for every waiter, then
    /// resumed on this thread.
    fn run_builder(&self, builder: &Arc<Builder<K, I>>) -> Result<(), CacheError> {
        let me = thread::current().id();
        let Some(construct) = builder.claim(me) else {
            return Ok(());
        };
        self.shared.construct_threads.write(|threads| {
            threads.insert(me, Arc::clone(builder));
        })?;
        builder.begin_construct();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| construct(builder.key())));
        self.shared.construct_threads.write(|threads| {
            threads.remove(&me);
        })?;
        match outcome {
            Ok(Ok(instance)) => builder.complete(Ok(instance)),
            Ok(Err(err)) => builder.complete(Err(CacheError::construction(err))),
            Err(panic_payload) => {
                builder.complete(Err(CacheError::construction_msg(
                    "construction function panicked",
                )));
                sweep::reconciler().wake();
                panic::resume_unwind(panic_payload);
            }
        }
        // remove() may have dropped the record while the construction
        // ran; waiters resolve through the chain they hold, and a
        // successful result still has to enter the instance map.
        self.shared.instances.write(|map| {
            self.shared.in_progress.read(|builders| {
                let registered = builders.get(builder.key()).is_some_and(|start| {
                    Builder::chain_links(start)
                        .iter()
                        .any(|link| Arc::ptr_eq(link, builder))
                });
                if !registered {
                    if let Some(Ok(instance)) = builder.peek() {
                        map.ensure_present(&instance);
                    }
                    builder.mark_finalized();
                }
            })
        })?;
        sweep::reconciler().wake();
        Ok(())
    }
}

impl<K, I> Shared<K, I>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    I: Send + Sync + 'static,
{
    /// One reconcile pass: fold every fully-finished builder chain into
    /// the instance map and prune dead entries. Holds the instance and
    /// in-progress write sections in the fixed order.
    fn reconcile_pass(&self) -> Result<(), crate::error::GuardedError> {
        self.instances.write(|map| {
            self.in_progress.write(|builders| {
                let finished: Vec<K> = builders
                    .iter()
                    .filter(|(_, start)| Builder::chain_ready(start))
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in finished {
                    let Some(start) = builders.remove(&key) else {
                        continue;
                    };
                    let links = Builder::chain_links(&start);
                    for link in &links {
                        link.mark_finalizing();
                    }
                    let mut authoritative = None;
                    for link in &links {
                        if let Some(Ok(instance)) = link.peek() {
                            // Superseded results stay tracked, keyless,
                            // while externally reachable.
                            if let Some(prev) = authoritative.replace(instance) {
                                map.ensure_present(&prev);
                            }
                        }
                    }
                    if let Some(winner) = &authoritative {
                        map.displace_and_attach(&key, winner);
                    }
                    for link in &links {
                        link.mark_finalized();
                    }
                    if let Some(finalize) = &self.key_finalizer {
                        finalize(&key);
                    }
                }
                map.purge_dead();
            })
        })??;
        Ok(())
    }
}

impl<K, I> Sweep for Shared<K, I>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    I: Send + Sync + 'static,
{
    fn sweep(&self) {
        if let Err(err) = self.reconcile_pass() {
            tracing::error!(error = %err, "reconcile sweep failed");
        }
    }
}
