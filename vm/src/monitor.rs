use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::error::{Exception, ExceptionKind, VmResult};
use crate::frame::{LockSlot, LockSlotId, LockStack};
use crate::oops::ObjectRef;
use crate::safepoint::SafepointCoordinator;
use crate::thread::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("{owner} does not own the monitor of {object}")]
    NotOwner { owner: ThreadId, object: ObjectRef },
}

impl From<MonitorError> for Exception {
    fn from(err: MonitorError) -> Self {
        Exception::new(ExceptionKind::IllegalMonitorStateException, err.to_string())
    }
}

/// Object-monitor implementation. Monitors are re-entrant per owner.
pub trait ObjectMonitor: Send + Sync {
    /// Acquire without blocking.
    fn try_lock(&self, owner: ThreadId, object: ObjectRef) -> bool;

    /// Acquire, blocking while another thread owns the monitor.
    fn lock(&self, owner: ThreadId, object: ObjectRef);

    fn unlock(&self, owner: ThreadId, object: ObjectRef) -> Result<(), MonitorError>;

    fn holds_lock(&self, owner: ThreadId, object: ObjectRef) -> bool;
}

#[derive(Debug, Clone, Copy)]
struct Ownership {
    owner: ThreadId,
    recursions: u32,
}

/// Monitor table keyed by object, with owner and recursion count.
#[derive(Default)]
pub struct MonitorTable {
    owners: Mutex<HashMap<ObjectRef, Ownership, ahash::RandomState>>,
    released: Condvar,
    contended: AtomicUsize,
}

impl MonitorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquisitions that had to wait.
    pub fn contended(&self) -> usize {
        self.contended.load(Ordering::Relaxed)
    }

    pub fn owner_of(&self, object: ObjectRef) -> Option<ThreadId> {
        self.owners.lock().get(&object).map(|o| o.owner)
    }

    fn acquire(
        owners: &mut HashMap<ObjectRef, Ownership, ahash::RandomState>,
        owner: ThreadId,
        object: ObjectRef,
    ) -> bool {
        match owners.entry(object) {
            Entry::Vacant(slot) => {
                slot.insert(Ownership { owner, recursions: 1 });
                true
            }
            Entry::Occupied(mut held) if held.get().owner == owner => {
                held.get_mut().recursions += 1;
                true
            }
            Entry::Occupied(_) => false,
        }
    }
}

impl ObjectMonitor for MonitorTable {
    fn try_lock(&self, owner: ThreadId, object: ObjectRef) -> bool {
        Self::acquire(&mut self.owners.lock(), owner, object)
    }

    fn lock(&self, owner: ThreadId, object: ObjectRef) {
        let mut owners = self.owners.lock();
        if Self::acquire(&mut owners, owner, object) {
            return;
        }
        self.contended.fetch_add(1, Ordering::Relaxed);
        while !Self::acquire(&mut owners, owner, object) {
            self.released.wait(&mut owners);
        }
    }

    fn unlock(&self, owner: ThreadId, object: ObjectRef) -> Result<(), MonitorError> {
        let mut owners = self.owners.lock();
        let Entry::Occupied(mut held) = owners.entry(object) else {
            return Err(MonitorError::NotOwner { owner, object });
        };
        if held.get().owner != owner {
            return Err(MonitorError::NotOwner { owner, object });
        }
        held.get_mut().recursions -= 1;
        if held.get().recursions == 0 {
            held.remove();
            self.released.notify_all();
        }
        Ok(())
    }

    fn holds_lock(&self, owner: ThreadId, object: ObjectRef) -> bool {
        self.owners
            .lock()
            .get(&object)
            .is_some_and(|held| held.owner == owner)
    }
}

/// Monitor enter and exit over a frame's lock slots.
pub struct MonitorManager {
    monitors: Arc<dyn ObjectMonitor>,
    safepoints: Arc<SafepointCoordinator>,
}

impl MonitorManager {
    pub fn new(
        monitors: Arc<dyn ObjectMonitor>,
        safepoints: Arc<SafepointCoordinator>,
    ) -> Self {
        Self {
            monitors,
            safepoints,
        }
    }

    pub fn monitors(&self) -> &Arc<dyn ObjectMonitor> {
        &self.monitors
    }

    /// Lock `object` and record it in `slot`. The slot becomes active only
    /// once the monitor is held.
    pub fn monitor_enter(
        &self,
        thread: ThreadId,
        locks: &mut LockStack,
        slot: LockSlotId,
        object: Option<ObjectRef>,
    ) -> VmResult<()> {
        let Some(object) = object else {
            return Err(Exception::new(
                ExceptionKind::NullPointerException,
                "monitorenter on null",
            ));
        };
        match locks.get(slot) {
            Some(s) if !s.is_active() => {}
            _ => {
                return Err(Exception::new(
                    ExceptionKind::InternalError,
                    format!("lock slot {} is not free", slot.index()),
                ));
            }
        }

        if !self.monitors.try_lock(thread, object) {
            log::trace!("{thread}: contended monitor {object}");
            let _blocked = self.safepoints.block();
            self.monitors.lock(thread, object);
        }

        if let Some(s) = locks.get_mut(slot) {
            s.bind(object);
        }
        Ok(())
    }

    /// Unlock the object held by `slot`. Fails without touching any lock
    /// state if the slot is inactive or the monitor is not ours.
    pub fn monitor_exit(
        &self,
        thread: ThreadId,
        locks: &mut LockStack,
        slot: LockSlotId,
    ) -> VmResult<()> {
        let Some(object) = locks.get(slot).and_then(LockSlot::object) else {
            return Err(Exception::new(
                ExceptionKind::IllegalMonitorStateException,
                format!("lock slot {} is not active", slot.index()),
            ));
        };
        if !self.monitors.holds_lock(thread, object) {
            return Err(MonitorError::NotOwner { owner: thread, object }.into());
        }
        self.monitors.unlock(thread, object)?;
        if let Some(s) = locks.get_mut(slot) {
            s.clear();
        }
        Ok(())
    }

    /// Release every active slot of an unwinding frame, in enumeration
    /// order. Returns the released objects.
    pub fn release_frame_monitors(
        &self,
        thread: ThreadId,
        locks: &mut LockStack,
    ) -> Vec<ObjectRef> {
        let active: Vec<_> = locks.active().collect();
        let mut released = Vec::with_capacity(active.len());
        for (slot, object) in active {
            if let Err(err) = self.monitors.unlock(thread, object) {
                log::warn!("{thread}: releasing slot {}: {err}", slot.index());
            }
            if let Some(s) = locks.get_mut(slot) {
                s.clear();
            }
            released.push(object);
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    const T1: ThreadId = ThreadId(1);
    const T2: ThreadId = ThreadId(2);

    fn obj(addr: u64) -> ObjectRef {
        ObjectRef::new(addr).unwrap()
    }

    fn manager() -> (Arc<MonitorTable>, MonitorManager) {
        let table = Arc::new(MonitorTable::new());
        let manager =
            MonitorManager::new(table.clone(), Arc::new(SafepointCoordinator::new()));
        (table, manager)
    }

    #[test]
    fn table_is_reentrant_per_owner() {
        let table = MonitorTable::new();
        assert!(table.try_lock(T1, obj(8)));
        assert!(table.try_lock(T1, obj(8)));
        assert!(!table.try_lock(T2, obj(8)));
        assert_eq!(table.unlock(T2, obj(8)), Err(MonitorError::NotOwner { owner: T2, object: obj(8) }));
        table.unlock(T1, obj(8)).unwrap();
        assert!(table.holds_lock(T1, obj(8)));
        table.unlock(T1, obj(8)).unwrap();
        assert_eq!(table.owner_of(obj(8)), None);
    }

    #[test]
    fn enter_null_is_npe_and_slot_stays_free() {
        let (_, mgr) = manager();
        let mut locks = LockStack::new(1);
        let slot = locks.allocate().unwrap();
        let err = mgr.monitor_enter(T1, &mut locks, slot, None).unwrap_err();
        assert_eq!(err.kind, ExceptionKind::NullPointerException);
        assert!(!locks.get(slot).unwrap().is_active());
    }

    #[test]
    fn exit_by_non_owner_changes_nothing() {
        let (table, mgr) = manager();
        let mut mine = LockStack::new(1);
        let slot = mine.allocate().unwrap();
        mgr.monitor_enter(T1, &mut mine, slot, Some(obj(16))).unwrap();

        // another thread's slot claims the same object without owning it
        let mut theirs = LockStack::new(1);
        let forged = theirs.allocate().unwrap();
        theirs.get_mut(forged).unwrap().bind(obj(16));
        let err = mgr.monitor_exit(T2, &mut theirs, forged).unwrap_err();
        assert_eq!(err.kind, ExceptionKind::IllegalMonitorStateException);
        assert!(theirs.get(forged).unwrap().is_active());
        assert_eq!(table.owner_of(obj(16)), Some(T1));

        let mut empty = LockStack::new(1);
        let inactive = empty.allocate().unwrap();
        let err = mgr.monitor_exit(T1, &mut empty, inactive).unwrap_err();
        assert_eq!(err.kind, ExceptionKind::IllegalMonitorStateException);

        mgr.monitor_exit(T1, &mut mine, slot).unwrap();
        assert!(!mine.get(slot).unwrap().is_active());
        assert_eq!(table.owner_of(obj(16)), None);
    }

    #[test]
    fn release_in_enumeration_order() {
        let (table, mgr) = manager();
        let mut locks = LockStack::new(3);
        for addr in [8, 16, 8] {
            let slot = locks.allocate().unwrap();
            mgr.monitor_enter(T1, &mut locks, slot, Some(obj(addr))).unwrap();
        }
        let released = mgr.release_frame_monitors(T1, &mut locks);
        assert_eq!(released, vec![obj(8), obj(16), obj(8)]);
        assert_eq!(locks.active().count(), 0);
        assert_eq!(table.owner_of(obj(8)), None);
        assert!(mgr.release_frame_monitors(T1, &mut locks).is_empty());
    }

    #[test]
    fn contended_enter_blocks_until_release() {
        let (table, mgr) = manager();
        let mgr = Arc::new(mgr);
        let mut locks = LockStack::new(1);
        let slot = locks.allocate().unwrap();
        mgr.monitor_enter(T1, &mut locks, slot, Some(obj(32))).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let waiter = {
            let mgr = mgr.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut locks = LockStack::new(1);
                let slot = locks.allocate().unwrap();
                barrier.wait();
                mgr.monitor_enter(T2, &mut locks, slot, Some(obj(32))).unwrap();
                assert!(locks.get(slot).unwrap().is_active());
                mgr.monitor_exit(T2, &mut locks, slot).unwrap();
            })
        };

        barrier.wait();
        while table.contended() == 0 {
            thread::yield_now();
        }
        mgr.monitor_exit(T1, &mut locks, slot).unwrap();
        waiter.join().unwrap();
        assert_eq!(table.owner_of(obj(32)), None);
    }
}
