//! Guarded: read/write synchronization around a single shared object.
//!
//! The object is passed to the constructor and is only ever touched
//! through closures submitted to [`Guarded::read`] or [`Guarded::write`].
//! Multiple threads can read at one time. Only one thread can write at a
//! time, and no other thread can read while a writer is active. A thread
//! holding the write section may still run nested `read` and `write`
//! calls (they execute directly). A thread holding an unreleased *read*
//! section must not request the write section: granting the upgrade could
//! deadlock against another thread doing the same, so it is rejected with
//! [`GuardedError::UpgradeDeadlock`] instead.
//!
//! Bookkeeping policy: each read call registers a small section record
//! (thread id plus a shared `active` flag). Finishing a read only flips
//! the flag, which keeps the common read path to one atomic store; stale
//! records are pruned lazily (amortized during registration once the
//! vector grows past a threshold), and a writer acquiring the section
//! performs its own confirmation sweep while it waits, so correctness
//! never depends on when the lazy pruning runs.

use crate::error::GuardedError;
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Prune finished section records once the bookkeeping vector reaches
/// this length.
const PRUNE_THRESHOLD: usize = 64;

/// Upper bound on how long a waiting writer sleeps between confirmation
/// sweeps. A finishing reader normally wakes the writer immediately; the
/// timeout only bounds the cost of a lost wakeup.
const WRITER_SWEEP_INTERVAL: Duration = Duration::from_millis(25);

struct ReadSection {
    thread: ThreadId,
    active: Arc<AtomicBool>,
}

struct LockState {
    reads: Vec<ReadSection>,
    writer: Option<ThreadId>,
}

/// Read/write container for one shared object. See the module docs.
pub struct Guarded<O> {
    data: UnsafeCell<O>,
    state: Mutex<LockState>,
    turnstile: Condvar,
    writer_waiting: AtomicBool,
}

// SAFETY: the protocol below guarantees that `&mut O` exists only on the
// unique writer thread while no read section is active, and that shared
// `&O` access happens only while no writer is active (or reentrantly on
// the writer thread itself). `O: Send` moves with the container; `O: Sync`
// is required because read closures observe `&O` from many threads.
unsafe impl<O: Send> Send for Guarded<O> {}
unsafe impl<O: Send + Sync> Sync for Guarded<O> {}

impl<O> Guarded<O> {
    pub fn new(object: O) -> Self {
        Self {
            data: UnsafeCell::new(object),
            state: Mutex::new(LockState {
                reads: Vec::new(),
                writer: None,
            }),
            turnstile: Condvar::new(),
            writer_waiting: AtomicBool::new(false),
        }
    }

    /// Runs `f` against a shared view of the object.
    ///
    /// Concurrent callers proceed in parallel. If the calling thread
    /// already holds the write section, `f` runs directly (reentrant).
    pub fn read<R>(&self, f: impl FnOnce(&O) -> R) -> R {
        let me = thread::current().id();
        let flag = {
            let mut s = self.state.lock();
            if s.writer == Some(me) {
                drop(s);
                // SAFETY: this thread holds the write section, so it has
                // exclusive access; the outer write closure is suspended
                // in this call and cannot touch the object concurrently.
                return f(unsafe { &*self.data.get() });
            }
            while s.writer.is_some() {
                self.turnstile.wait(&mut s);
            }
            if s.reads.len() >= PRUNE_THRESHOLD {
                // Amortized lazy prune of finished section records.
                s.reads.retain(|r| r.active.load(Ordering::SeqCst));
            }
            let flag = Arc::new(AtomicBool::new(true));
            s.reads.push(ReadSection {
                thread: me,
                active: Arc::clone(&flag),
            });
            flag
        };

        let _section = SectionGuard {
            guarded: self,
            flag: &flag,
        };
        // SAFETY: the section record registered above keeps every writer
        // out until the guard drops; only shared access happens here.
        f(unsafe { &*self.data.get() })
    }

    /// Runs `f` against the object with exclusive access.
    ///
    /// Blocks until all currently active read sections have ended and any
    /// other writer has finished. Reentrant for the thread that already
    /// holds the write section. Fails with
    /// [`GuardedError::UpgradeDeadlock`] if the calling thread still
    /// holds an unreleased read section.
    pub fn write<R>(&self, f: impl FnOnce(&mut O) -> R) -> Result<R, GuardedError> {
        let me = thread::current().id();
        {
            let mut s = self.state.lock();
            if s.writer == Some(me) {
                drop(s);
                // SAFETY: reentrant write; this thread already holds the
                // write section and the outer closure is suspended in
                // this call.
                return Ok(f(unsafe { &mut *self.data.get() }));
            }
            if s.reads
                .iter()
                .any(|r| r.thread == me && r.active.load(Ordering::SeqCst))
            {
                return Err(GuardedError::UpgradeDeadlock);
            }
            while s.writer.is_some() {
                self.turnstile.wait(&mut s);
            }
            s.writer = Some(me);
            // Confirmation sweep: new readers are now turned away at
            // registration; wait for the ones already in flight.
            loop {
                s.reads.retain(|r| r.active.load(Ordering::SeqCst));
                if s.reads.is_empty() {
                    break;
                }
                self.writer_waiting.store(true, Ordering::SeqCst);
                self.turnstile.wait_for(&mut s, WRITER_SWEEP_INTERVAL);
            }
            self.writer_waiting.store(false, Ordering::SeqCst);
        }

        let _write = WriteGuard { guarded: self };
        // SAFETY: this thread is the registered writer and all read
        // sections have ended; access is exclusive until the guard drops.
        Ok(f(unsafe { &mut *self.data.get() }))
    }
}

impl<O: std::fmt::Debug> std::fmt::Debug for Guarded<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guarded").finish_non_exhaustive()
    }
}

/// Ends a read section on drop (including on unwind): flips the active
/// flag and wakes a waiting writer if one announced itself.
struct SectionGuard<'a, O> {
    guarded: &'a Guarded<O>,
    flag: &'a AtomicBool,
}

impl<O> Drop for SectionGuard<'_, O> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
        if self.guarded.writer_waiting.load(Ordering::SeqCst) {
            // Lock-step with the writer's wait so the notify cannot slip
            // in between its activity check and its sleep.
            let _s = self.guarded.state.lock();
            self.guarded.turnstile.notify_all();
        }
    }
}

/// Releases the write section on drop (including on unwind).
struct WriteGuard<'a, O> {
    guarded: &'a Guarded<O>,
}

impl<O> Drop for WriteGuard<'_, O> {
    fn drop(&mut self) {
        let mut s = self.guarded.state.lock();
        s.writer = None;
        self.guarded.turnstile.notify_all();
    }
}
