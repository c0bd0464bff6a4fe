//! singleflight-map: a keyed, single-flight, weak-reference-aware
//! instance cache built on a hand-rolled read/write section protocol.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: many threads concurrently ask "give me the canonical object
//!   for key K, constructing it if necessary"; the answer is computed
//!   at most once per key under a stampede, a later forced construction
//!   can supersede an in-flight or finished one, an instance may own
//!   several keys, and entries vanish on their own once nothing external
//!   references the instance (or, with the adapter, the key).
//! - Layers, leaves first:
//!   - Guarded<O>: one mutable object behind read sections and an
//!     exclusive write section; writers are reentrant, a read-to-write
//!     upgrade is rejected as an error instead of deadlocking.
//!   - Builder<K, I>: the per-key in-flight construction record with a
//!     monotonic stage machine; contending builders for one key chain
//!     into an override chain whose tail holds the authoritative result.
//!   - InstanceCache<K, I>: the public cache; instance map (weak
//!     instance to key set, plus a key index) and in-progress map.
//!   - WeakKeyCache<K, I>: facade whose keys are weakly held
//!     `KeyHandle`s with a temporary strong reference pinned for the
//!     duration of a construction.
//!
//! Locking discipline
//! - Fixed order: instance-map section before in-progress section; the
//!   construct-thread registry only ever on its own; a builder's
//!   internal mutex is a leaf. Construction closures run with no cache
//!   lock held, so a slow construction never blocks unrelated callers.
//!
//! Reclamation
//! - Instances are stored as `Weak`; dropping the last external `Arc`
//!   makes the entry collectable. Two process-wide sweep threads bound
//!   the latency: the reconciler folds finished builder chains into
//!   instance maps and prunes dead entries, the purger discards expired
//!   weak-key handles. [`reconcile_now`] (or a cache's `reconcile`)
//!   produces the same effect synchronously; correctness never depends
//!   on the background threads.
//!
//! Failure semantics
//! - A construction failure is recorded on the builder and delivered to
//!   every waiter; the cache never retries on its own. Lock misuse
//!   (waiting on one's own construction, construct-inside-construct,
//!   read-to-write upgrade) is reported as an error instead of
//!   deadlocking.
//!
//! Notes and non-goals
//! - Preemptive OS threads and blocking waits only; no async surface.
//! - No cross-key ordering guarantees and no persistence.
//! - Public API surface is `InstanceCache`, `WeakKeyCache` with its
//!   `KeyHandle`, `Guarded`, the error types, and `reconcile_now`;
//!   builders and sweepers are implementation details.

mod builder;
mod cache;
mod error;
mod guarded;
mod sweep;
mod weak_key;

// Public surface
pub use cache::InstanceCache;
pub use error::{BoxedError, CacheError, GuardedError};
pub use guarded::Guarded;
pub use sweep::reconcile_now;
pub use weak_key::{KeyHandle, WeakKeyCache};
