//! Builder: the per-key in-flight construction record.
//!
//! A builder is created when a key has no instance and no in-flight
//! construction, when a caller forces reconstruction, or when `put`
//! supplies an already-known instance mid-construction. Exactly one
//! thread executes the construction closure of a builder; every other
//! interested thread parks on the builder's condvar and shares the
//! recorded outcome.
//!
//! Builders for the same key form a singly-linked *override chain*
//! through `superseded_by`. Appends are serialized under the owning
//! cache's in-progress write section, and the chain tail is authoritative
//! once finished: the last override wins, and earlier successful results
//! remain as fallbacks if a later link fails. The builder's internal lock
//! is a leaf; nothing else is ever acquired while it is held.

use crate::error::{BoxedError, CacheError};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::ThreadId;

/// One-shot construction closure, invoked at most once per builder.
pub(crate) type ConstructFn<K, I> = Box<dyn FnOnce(&K) -> Result<Arc<I>, BoxedError> + Send>;

/// Monotonic lifecycle of a builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Stage {
    /// Created; construction not yet claimed.
    Idle,
    /// A thread has claimed the construction closure.
    PreConstruct,
    /// The construction closure is running.
    Construct,
    /// The outcome has been recorded and is visible to waiters.
    Returned,
    /// The reconciler is moving the result into the instance map.
    Finalizing,
    /// Bookkeeping complete; the builder record can be dropped.
    Finalized,
}

struct State<K, I> {
    stage: Stage,
    construct: Option<ConstructFn<K, I>>,
    outcome: Option<Result<Arc<I>, CacheError>>,
    superseded_by: Option<Arc<Builder<K, I>>>,
    construct_thread: Option<ThreadId>,
}

pub(crate) struct Builder<K, I> {
    key: K,
    /// Created by a forced (`construct_with`) override.
    forced: bool,
    /// Carries a genuine construction closure, as opposed to a
    /// ready-made record installed by `put`.
    constructing: bool,
    state: Mutex<State<K, I>>,
    progress: Condvar,
}

/// What a waiter observed on one chain link.
pub(crate) enum Waited<K, I> {
    /// The link reached `Returned`; its outcome is readable.
    Ready,
    /// The link was superseded; continue at the next link.
    Superseded(Arc<Builder<K, I>>),
}

impl<K, I> Builder<K, I> {
    pub(crate) fn new(key: K, construct: ConstructFn<K, I>, forced: bool) -> Arc<Self> {
        Arc::new(Self {
            key,
            forced,
            constructing: true,
            state: Mutex::new(State {
                stage: Stage::Idle,
                construct: Some(construct),
                outcome: None,
                superseded_by: None,
                construct_thread: None,
            }),
            progress: Condvar::new(),
        })
    }

    /// A pre-finished builder carrying an instance supplied by `put`.
    pub(crate) fn ready(key: K, instance: Arc<I>, forced: bool) -> Arc<Self> {
        Arc::new(Self {
            key,
            forced,
            constructing: false,
            state: Mutex::new(State {
                stage: Stage::Returned,
                construct: None,
                outcome: Some(Ok(instance)),
                superseded_by: None,
                construct_thread: None,
            }),
            progress: Condvar::new(),
        })
    }

    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    pub(crate) fn forced(&self) -> bool {
        self.forced
    }

    /// Claims the construction closure for the calling thread. Returns
    /// `None` if the builder was already claimed or carries no closure.
    pub(crate) fn claim(&self, me: ThreadId) -> Option<ConstructFn<K, I>> {
        let mut s = self.state.lock();
        if s.stage != Stage::Idle {
            return None;
        }
        let f = s.construct.take()?;
        s.stage = Stage::PreConstruct;
        s.construct_thread = Some(me);
        self.progress.notify_all();
        Some(f)
    }

    /// Marks the construction closure as running.
    pub(crate) fn begin_construct(&self) {
        let mut s = self.state.lock();
        s.stage = Stage::Construct;
        self.progress.notify_all();
    }

    /// Records the outcome and releases every waiter. Stages only move
    /// forward: a completion landing after the record was finalized
    /// still publishes the outcome without regressing the stage.
    pub(crate) fn complete(&self, outcome: Result<Arc<I>, CacheError>) {
        let mut s = self.state.lock();
        s.outcome = Some(outcome);
        if s.stage < Stage::Returned {
            s.stage = Stage::Returned;
        }
        s.construct_thread = None;
        self.progress.notify_all();
    }

    /// Links `next` as this builder's successor. The caller must hold the
    /// owning cache's in-progress write section, which serializes chain
    /// mutations; a builder gains at most one successor.
    pub(crate) fn supersede(&self, next: Arc<Builder<K, I>>) {
        let mut s = self.state.lock();
        debug_assert!(s.superseded_by.is_none());
        s.superseded_by = Some(next);
        self.progress.notify_all();
    }

    pub(crate) fn next(&self) -> Option<Arc<Builder<K, I>>> {
        self.state.lock().superseded_by.clone()
    }

    pub(crate) fn stage(&self) -> Stage {
        self.state.lock().stage
    }

    /// Non-blocking view of the outcome, if one has been recorded.
    pub(crate) fn peek(&self) -> Option<Result<Arc<I>, CacheError>> {
        let s = self.state.lock();
        if s.stage >= Stage::Returned {
            s.outcome.clone()
        } else {
            None
        }
    }

    /// Blocks until this link is ready or superseded. Reports
    /// [`CacheError::SelfJoin`] instead of deadlocking if the calling
    /// thread is the one executing this builder's construction.
    pub(crate) fn wait_ready(&self, me: ThreadId) -> Result<Waited<K, I>, CacheError> {
        let mut s = self.state.lock();
        loop {
            if let Some(next) = &s.superseded_by {
                return Ok(Waited::Superseded(Arc::clone(next)));
            }
            if s.stage >= Stage::Returned {
                return Ok(Waited::Ready);
            }
            if s.construct_thread == Some(me) {
                return Err(CacheError::SelfJoin);
            }
            self.progress.wait(&mut s);
        }
    }

    pub(crate) fn mark_finalizing(&self) {
        let mut s = self.state.lock();
        if s.stage == Stage::Returned {
            s.stage = Stage::Finalizing;
            self.progress.notify_all();
        }
    }

    pub(crate) fn mark_finalized(&self) {
        let mut s = self.state.lock();
        if s.stage < Stage::Finalized {
            s.stage = Stage::Finalized;
            self.progress.notify_all();
        }
    }

    /// All links of the chain starting at `start`, head to tail.
    pub(crate) fn chain_links(start: &Arc<Builder<K, I>>) -> Vec<Arc<Builder<K, I>>> {
        let mut links = vec![Arc::clone(start)];
        let mut cur = Arc::clone(start);
        while let Some(next) = cur.next() {
            links.push(Arc::clone(&next));
            cur = next;
        }
        links
    }

    /// The current tail of the chain starting at `start`.
    pub(crate) fn tail(start: &Arc<Builder<K, I>>) -> Arc<Builder<K, I>> {
        let mut cur = Arc::clone(start);
        while let Some(next) = cur.next() {
            cur = next;
        }
        cur
    }

    /// Whether every link of the chain has produced an outcome.
    pub(crate) fn chain_ready(start: &Arc<Builder<K, I>>) -> bool {
        Self::chain_links(start)
            .iter()
            .all(|l| l.stage() >= Stage::Returned)
    }

    /// Whether any link's successful outcome is the given allocation.
    pub(crate) fn chain_contains(start: &Arc<Builder<K, I>>, ptr: *const I) -> bool {
        Self::chain_links(start).iter().any(|l| {
            matches!(l.peek(), Some(Ok(ref i)) if std::ptr::eq(Arc::as_ptr(i), ptr))
        })
    }

    /// Non-blocking chain resolution: the deepest successful outcome at
    /// or after `start`, if any link has finished.
    pub(crate) fn peek_chain(start: &Arc<Builder<K, I>>) -> Option<Result<Arc<I>, CacheError>> {
        let mut last_ok = None;
        let mut last_err = None;
        for link in Self::chain_links(start) {
            match link.peek() {
                Some(Ok(i)) => last_ok = Some(i),
                Some(Err(e)) => last_err = Some(e),
                None => {}
            }
        }
        match (last_ok, last_err) {
            (Some(i), _) => Some(Ok(i)),
            (None, Some(e)) => Some(Err(e)),
            (None, None) => None,
        }
    }

    /// Blocking chain resolution for a caller that entered at `start`:
    /// waits for the chain tail to finish, then returns the deepest
    /// successful outcome, falling back through earlier links when a
    /// later one failed. If nothing at or after `start` succeeded, the
    /// last failure is propagated.
    pub(crate) fn resolve(
        start: &Arc<Builder<K, I>>,
        me: ThreadId,
    ) -> Result<Arc<I>, CacheError> {
        let mut cur = Arc::clone(start);
        loop {
            match cur.wait_ready(me)? {
                Waited::Superseded(next) => cur = next,
                // An override may land right after the tail finishes;
                // re-walk until the tail is still the tail once ready.
                Waited::Ready => match cur.next() {
                    Some(next) => cur = next,
                    None => break,
                },
            }
        }
        match Self::peek_chain(start) {
            Some(outcome) => outcome,
            // Unreachable in practice: the tail just reported Ready.
            None => Err(CacheError::construction_msg(
                "construction finished without recording an outcome",
            )),
        }
    }
}

impl<K, I> std::fmt::Debug for Builder<K, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("forced", &self.forced)
            .field("constructing", &self.constructing)
            .field("stage", &self.stage())
            .finish_non_exhaustive()
    }
}
