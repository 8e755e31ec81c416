use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct State {
    active: bool,
    epoch: u64,
    /// Attached mutator threads.
    registered: usize,
    /// Threads currently parked at a poll or inside a blocked region.
    safe: usize,
}

/// Cooperative safepoints.
///
/// Mutators poll; a synchronizer raises the request and waits until every
/// registered thread is either parked at a poll or inside a blocked region.
/// Threads leaving a blocked region while a safepoint is active wait for it
/// to end.
#[derive(Debug, Default)]
pub struct SafepointCoordinator {
    requested: AtomicBool,
    state: Mutex<State>,
    arrived: Condvar,
    released: Condvar,
}

impl SafepointCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self) {
        let mut state = self.state.lock();
        while state.active {
            self.released.wait(&mut state);
        }
        state.registered += 1;
    }

    pub(crate) fn unregister(&self) {
        let mut state = self.state.lock();
        state.registered -= 1;
        self.arrived.notify_all();
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Completed or running safepoints so far.
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    pub fn registered(&self) -> usize {
        self.state.lock().registered
    }

    /// Park the caller if a safepoint is in progress. Returns whether it
    /// parked.
    pub fn poll(&self) -> bool {
        if !self.is_requested() {
            return false;
        }
        let mut state = self.state.lock();
        if !state.active {
            return false;
        }
        state.safe += 1;
        self.arrived.notify_all();
        let epoch = state.epoch;
        while state.active && state.epoch == epoch {
            self.released.wait(&mut state);
        }
        state.safe -= 1;
        true
    }

    /// Mark the caller safe for the lifetime of the guard, e.g. while it
    /// blocks on a contended monitor.
    pub fn block(&self) -> BlockedRegion<'_> {
        let mut state = self.state.lock();
        state.safe += 1;
        self.arrived.notify_all();
        BlockedRegion { coordinator: self }
    }

    /// Bring every registered thread to a safe state. Must not be called from
    /// an attached thread. Threads resume when the guard is dropped.
    pub fn synchronize(&self) -> Safepoint<'_> {
        let mut state = self.state.lock();
        while state.active {
            self.released.wait(&mut state);
        }
        state.active = true;
        state.epoch += 1;
        self.requested.store(true, Ordering::Release);
        log::debug!(
            "safepoint #{} requested, {} threads",
            state.epoch,
            state.registered
        );
        while state.safe < state.registered {
            self.arrived.wait(&mut state);
        }
        log::debug!("safepoint #{} reached", state.epoch);
        Safepoint { coordinator: self }
    }

    fn end(&self) {
        let mut state = self.state.lock();
        state.active = false;
        self.requested.store(false, Ordering::Release);
        log::debug!("safepoint #{} released", state.epoch);
        self.released.notify_all();
    }
}

pub struct BlockedRegion<'a> {
    coordinator: &'a SafepointCoordinator,
}

impl Drop for BlockedRegion<'_> {
    fn drop(&mut self) {
        let coordinator = self.coordinator;
        let mut state = coordinator.state.lock();
        while state.active {
            coordinator.released.wait(&mut state);
        }
        state.safe -= 1;
    }
}

/// All registered threads are stopped while this is alive.
pub struct Safepoint<'a> {
    coordinator: &'a SafepointCoordinator,
}

impl Drop for Safepoint<'_> {
    fn drop(&mut self) {
        self.coordinator.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn poll_without_request_is_a_no_op() {
        let sp = SafepointCoordinator::new();
        sp.register();
        assert!(!sp.poll());
        sp.unregister();
        assert_eq!(sp.registered(), 0);
    }

    #[test]
    fn synchronize_with_no_threads_returns_immediately() {
        let sp = SafepointCoordinator::new();
        let guard = sp.synchronize();
        assert!(sp.is_requested());
        drop(guard);
        assert!(!sp.is_requested());
        assert_eq!(sp.epoch(), 1);
    }

    #[test]
    fn mutators_park_until_released() {
        let sp = Arc::new(SafepointCoordinator::new());
        let parked = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let workers: Vec<_> = (0..3)
            .map(|_| {
                sp.register();
                let sp = sp.clone();
                let parked = parked.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        if sp.poll() {
                            parked.fetch_add(1, Ordering::SeqCst);
                        }
                        thread::yield_now();
                    }
                    sp.unregister();
                })
            })
            .collect();

        {
            let _safepoint = sp.synchronize();
            assert_eq!(sp.state.lock().safe, 3);
        }
        stop.store(true, Ordering::Release);
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(parked.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn blocked_threads_count_as_safe() {
        let sp = Arc::new(SafepointCoordinator::new());
        sp.register();
        let region = sp.block();
        // would hang if the blocked thread were not counted
        drop(sp.synchronize());
        drop(region);
        sp.unregister();
    }
}
