//! Shared background sweep threads.
//!
//! Two process-wide sweepers serve every cache in the process: the
//! reconciler folds finished builder chains into instance maps on a
//! short interval, and the purger clears expired weak-key handles on a
//! longer one. Caches register a `Weak` handle; a dropped cache simply
//! falls out of the registry on the next pass. The threads are spawned
//! lazily on first registration.
//!
//! Correctness never depends on these threads running. They bound
//! reclamation and finalization latency; [`reconcile_now`] (or the
//! per-cache `reconcile`) gives the same effect synchronously.

use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::Duration;

pub(crate) trait Sweep: Send + Sync {
    /// One pass over this target. Must not block on user code and must
    /// swallow (log) its own failures.
    fn sweep(&self);
}

struct Registry {
    targets: Vec<Weak<dyn Sweep>>,
    thread_running: bool,
}

pub(crate) struct Sweeper {
    name: &'static str,
    interval: Duration,
    registry: Mutex<Registry>,
    /// Wake flag and its lock, separate from the registry so a
    /// registration never waits behind the interval sleep.
    wake_flag: Mutex<bool>,
    wake: Condvar,
}

impl Sweeper {
    const fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            registry: Mutex::new(Registry {
                targets: Vec::new(),
                thread_running: false,
            }),
            wake_flag: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    pub(crate) fn register(&'static self, target: Weak<dyn Sweep>) {
        let mut registry = self.registry.lock();
        registry.targets.push(target);
        if !registry.thread_running {
            let spawned = std::thread::Builder::new()
                .name(self.name.to_owned())
                .spawn(move || self.run_loop());
            match spawned {
                Ok(_) => registry.thread_running = true,
                Err(err) => {
                    // Leave the flag clear so a later registration
                    // retries; sweeps still run via reconcile_now.
                    tracing::error!(error = %err, sweeper = self.name, "failed to spawn sweep thread");
                }
            }
        }
    }

    /// Requests an early pass from the background thread.
    pub(crate) fn wake(&self) {
        *self.wake_flag.lock() = true;
        self.wake.notify_all();
    }

    /// Runs one pass synchronously on the calling thread.
    pub(crate) fn run_pass(&self) {
        let live: Vec<Arc<dyn Sweep>> = {
            let mut registry = self.registry.lock();
            registry.targets.retain(|t| t.strong_count() > 0);
            registry.targets.iter().filter_map(Weak::upgrade).collect()
        };
        for target in live {
            target.sweep();
        }
    }

    fn run_loop(&'static self) {
        loop {
            {
                let mut woken = self.wake_flag.lock();
                if !*woken {
                    self.wake.wait_for(&mut woken, self.interval);
                }
                *woken = false;
            }
            self.run_pass();
        }
    }
}

static RECONCILER: Sweeper = Sweeper::new("singleflight-reconcile", Duration::from_millis(100));
static PURGER: Sweeper = Sweeper::new("singleflight-purge", Duration::from_millis(1000));

pub(crate) fn reconciler() -> &'static Sweeper {
    &RECONCILER
}

pub(crate) fn purger() -> &'static Sweeper {
    &PURGER
}

/// Runs one synchronous sweep over every live cache in the process:
/// finished constructions are folded into their instance maps, dead
/// weak entries are pruned, and expired weak-key handles are purged.
pub fn reconcile_now() {
    RECONCILER.run_pass();
    PURGER.run_pass();
}
