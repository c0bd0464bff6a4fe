//! Error taxonomy for the cache family.
//!
//! All failures are surfaced synchronously to the calling thread as
//! `Result` values; nothing is swallowed. Construction failures are
//! recorded once on the builder and cloned out to every waiter, which is
//! why [`CacheError`] is `Clone` and wraps its source in an `Arc`.

use std::sync::Arc;

/// Boxed error type accepted from user construction functions.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Misuse of a [`Guarded`](crate::Guarded) container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GuardedError {
    /// The calling thread requested the write section while still holding
    /// an unreleased read section on the same container. Granting it
    /// could deadlock with another thread doing the same, so it is
    /// rejected instead.
    #[error("write section requested while the calling thread holds a read section")]
    UpgradeDeadlock,
}

/// Errors reported by [`InstanceCache`](crate::InstanceCache) and
/// [`WeakKeyCache`](crate::WeakKeyCache) operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// `put` was called with an instance this cache did not construct and
    /// never previously accepted. Accepting it would break the
    /// one-cache-owns-its-instances invariant.
    #[error("instance was not constructed by and is unknown to this cache")]
    UnrecognizedInstance,

    /// The calling thread tried to wait on the builder it is itself
    /// executing. Waiting would deadlock, so the cycle is reported.
    #[error("thread attempted to wait on its own in-flight construction")]
    SelfJoin,

    /// A construct-family operation was invoked from inside another
    /// construction function on the same cache. Use `put` from within a
    /// construction instead.
    #[error("construct called from inside another construction on the same cache")]
    NestedConstruct,

    /// The user construction function failed. The failure is delivered to
    /// every caller waiting on the same builder; the cache never retries
    /// on its own.
    #[error("construction failed: {0}")]
    Construction(Arc<BoxedError>),

    /// Lock misuse bubbled up from an internal [`Guarded`](crate::Guarded)
    /// container.
    #[error(transparent)]
    Guarded(#[from] GuardedError),
}

impl CacheError {
    pub(crate) fn construction(err: BoxedError) -> Self {
        CacheError::Construction(Arc::new(err))
    }

    pub(crate) fn construction_msg(msg: impl Into<String>) -> Self {
        let boxed: BoxedError = msg.into().into();
        CacheError::Construction(Arc::new(boxed))
    }
}
