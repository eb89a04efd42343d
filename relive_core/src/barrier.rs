//! A rendezvous barrier for hosts whose processing units are threads.
//!
//! Each unit joins once and calls [`UnitHandle::safepoint`] regularly. A
//! stop request parks every joined unit at its next safepoint, runs the
//! requested closure on the requesting thread and then lets them go. The
//! requesting thread must not itself be a joined unit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::host::Quiesce;

#[derive(Debug, Default)]
struct State {
    joined: usize,
    parked: usize,
    stopping: bool,
    generation: u64,
}

#[derive(Debug, Default)]
pub struct Rendezvous {
    requested: AtomicBool,
    state: Mutex<State>,
    cond: Condvar,
}

impl Rendezvous {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers the calling thread as a unit. Waits out a stop in progress.
    pub fn join(self: &Arc<Self>) -> UnitHandle {
        let mut state = self.state.lock();
        while state.stopping {
            self.cond.wait(&mut state);
        }
        state.joined += 1;
        UnitHandle { rv: self.clone() }
    }

    pub fn joined(&self) -> usize {
        self.state.lock().joined
    }

    fn park(&self) {
        let mut state = self.state.lock();
        if !state.stopping {
            return;
        }
        let generation = state.generation;
        state.parked += 1;
        self.cond.notify_all();
        while state.stopping && state.generation == generation {
            self.cond.wait(&mut state);
        }
        state.parked -= 1;
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.stopping = false;
        state.generation += 1;
        self.requested.store(false, Ordering::Release);
        self.cond.notify_all();
    }
}

impl Quiesce for Rendezvous {
    fn stop_machine(&self, timeout: Duration, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        let deadline = Instant::now() + timeout;
        {
            let mut state = self.state.lock();
            while state.stopping {
                if self.cond.wait_until(&mut state, deadline).timed_out() {
                    return Err(Error::QuiesceTimeout(timeout));
                }
            }
            state.stopping = true;
            self.requested.store(true, Ordering::Release);

            while state.parked < state.joined {
                if self.cond.wait_until(&mut state, deadline).timed_out()
                    && state.parked < state.joined
                {
                    warn!(
                        parked = state.parked,
                        joined = state.joined,
                        "units failed to rendezvous"
                    );
                    drop(state);
                    self.release();
                    return Err(Error::QuiesceTimeout(timeout));
                }
            }
            debug!(units = state.joined, "all units parked");
        }

        let res = f();
        self.release();
        res
    }
}

/// A joined unit. Dropping it leaves the rendezvous.
#[derive(Debug)]
pub struct UnitHandle {
    rv: Arc<Rendezvous>,
}

impl UnitHandle {
    /// Parks here while a stop is in progress.
    pub fn safepoint(&self) {
        if self.rv.requested.load(Ordering::Acquire) {
            self.rv.park();
        }
    }
}

impl Drop for UnitHandle {
    fn drop(&mut self) {
        let mut state = self.rv.state.lock();
        state.joined -= 1;
        self.rv.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::thread;

    #[test]
    fn no_units_runs_immediately() {
        let rv = Rendezvous::new();
        let mut ran = false;
        rv.stop_machine(Duration::from_millis(10), &mut || -> Result<()> {
            ran = true;
            Ok(())
        })
        .unwrap();
        assert!(ran);
    }

    #[test]
    fn units_are_parked_while_stopped() {
        let rv = Rendezvous::new();
        let stop = Arc::new(AtomicBool::new(false));
        let ticks = Arc::new(AtomicU64::new(0));

        let units: Vec<_> = (0..3)
            .map(|_| {
                let unit = rv.join();
                let stop = stop.clone();
                let ticks = ticks.clone();
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        ticks.fetch_add(1, Ordering::Relaxed);
                        unit.safepoint();
                    }
                })
            })
            .collect();

        for _ in 0..20 {
            rv.stop_machine(Duration::from_secs(5), &mut || -> Result<()> {
                let before = ticks.load(Ordering::Relaxed);
                thread::sleep(Duration::from_millis(1));
                assert_eq!(ticks.load(Ordering::Relaxed), before);
                Ok(())
            })
            .unwrap();
        }

        stop.store(true, Ordering::Relaxed);
        for unit in units {
            unit.join().unwrap();
        }
        assert_eq!(rv.joined(), 0);
    }

    #[test]
    fn times_out_on_missing_unit() {
        let rv = Rendezvous::new();
        let lazy = rv.join();
        let mut ran = false;
        let err = rv
            .stop_machine(Duration::from_millis(20), &mut || -> Result<()> {
                ran = true;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, Error::QuiesceTimeout(_)));
        assert!(!ran);

        // the failed request leaves nothing behind
        lazy.safepoint();
    }
}
