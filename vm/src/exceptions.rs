use crate::error::{Exception, ExceptionKind};
use crate::method::Method;
use crate::monitor::MonitorManager;
use crate::oops::KlassId;
use crate::thread::{StackCheck, VMThread};

pub fn create_exception(kind: ExceptionKind, message: impl Into<String>) -> Exception {
    let exception = Exception::new(kind, message);
    log::trace!("created {exception}");
    exception
}

pub fn null_pointer(what: &str) -> Exception {
    create_exception(ExceptionKind::NullPointerException, what)
}

pub fn class_cast(from: KlassId, to: KlassId) -> Exception {
    create_exception(
        ExceptionKind::ClassCastException,
        format!("{from} cannot be cast to {to}"),
    )
}

pub fn array_index_out_of_bounds(index: i32, length: u32) -> Exception {
    create_exception(
        ExceptionKind::ArrayIndexOutOfBoundsException,
        format!("index {index} out of bounds for length {length}"),
    )
}

pub fn negative_array_size(length: i32) -> Exception {
    create_exception(ExceptionKind::NegativeArraySizeException, length.to_string())
}

pub fn arithmetic(message: &str) -> Exception {
    create_exception(ExceptionKind::ArithmeticException, message)
}

pub fn abstract_method(method: &Method) -> Exception {
    create_exception(ExceptionKind::AbstractMethodError, method.to_string())
}

pub fn incompatible_class_change(message: impl Into<String>) -> Exception {
    create_exception(ExceptionKind::IncompatibleClassChangeError, message)
}

pub fn illegal_monitor_state(message: impl Into<String>) -> Exception {
    create_exception(ExceptionKind::IllegalMonitorStateException, message)
}

pub fn stack_overflow(depth: usize) -> Exception {
    create_exception(
        ExceptionKind::StackOverflowError,
        format!("stack depth {depth}"),
    )
}

/// Where an exception ends up after unwinding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unwind {
    /// Continue at `bci` in the frame that is now at `depth`.
    Handler {
        bci: usize,
        depth: usize,
        exception: Exception,
    },
    /// No frame handles it; all frames have been popped.
    Uncaught(Exception),
}

/// Find the handler for `exception`, unwinding frames that have none.
///
/// Each unwound frame has its active lock slots released in enumeration
/// order before it is popped. The search itself needs stack headroom: a
/// thread without it gets its reserve zone opened and a stack overflow is
/// delivered in place of `exception`.
pub fn exception_handler_for_exception(
    thread: &mut VMThread,
    monitors: &MonitorManager,
    exception: Exception,
) -> Unwind {
    let mut exception = exception;
    let depth = thread.depth();
    if thread.stack_guard().check(depth) != StackCheck::Ok {
        if thread.stack_guard_mut().enter_reserved() {
            log::warn!(
                "{}: no headroom to handle {exception}, delivering stack overflow",
                thread.id()
            );
            exception = stack_overflow(depth);
        } else {
            log::error!("{}: stack reserve exhausted during unwind", thread.id());
        }
    }

    let id = thread.id();
    loop {
        let Some(frame) = thread.top_frame_mut() else {
            log::debug!("{id}: uncaught {exception}");
            return Unwind::Uncaught(exception);
        };
        let bci = frame.bci();
        let handler = frame
            .method()
            .exception_handlers()
            .iter()
            .find(|h| h.covers(bci, exception.kind))
            .map(|h| h.handler_bci);

        if let Some(handler_bci) = handler {
            frame.set_bci(handler_bci);
            frame.set_mdp(None);
            let depth = thread.depth();
            thread.stack_guard_mut().rearm(depth);
            log::trace!("{id}: {exception} handled at bci {handler_bci}, depth {depth}");
            return Unwind::Handler {
                bci: handler_bci,
                depth,
                exception,
            };
        }

        let released = monitors.release_frame_monitors(id, frame.locks_mut());
        if !released.is_empty() {
            log::trace!(
                "{id}: unwinding {} released {} monitors",
                frame.method(),
                released.len()
            );
        }
        thread.pop_frame();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::{ExceptionHandler, Signature};
    use crate::monitor::{MonitorTable, ObjectMonitor};
    use crate::oops::ObjectRef;
    use crate::safepoint::SafepointCoordinator;
    use crate::thread::{GuardZone, StackGuard, ThreadId};
    use std::sync::Arc;

    fn setup(limit: usize) -> (Arc<MonitorTable>, MonitorManager, VMThread) {
        let safepoints = Arc::new(SafepointCoordinator::new());
        let table = Arc::new(MonitorTable::new());
        let manager = MonitorManager::new(table.clone(), safepoints.clone());
        let thread = VMThread::new(ThreadId(3), StackGuard::new(limit, 2), safepoints);
        (table, manager, thread)
    }

    fn method(handler: Option<ExceptionHandler>) -> Arc<Method> {
        let mut b = Method::builder("f", Signature::parse("()V").unwrap())
            .code(vec![0; 32])
            .max_monitors(2);
        if let Some(h) = handler {
            b = b.exception_handler(h);
        }
        b.build()
    }

    fn catch_all_runtime() -> ExceptionHandler {
        ExceptionHandler {
            start_bci: 0,
            end_bci: 10,
            handler_bci: 20,
            catch: Some(ExceptionKind::RuntimeException),
        }
    }

    #[test]
    fn handler_in_top_frame() {
        let (_, mgr, mut t) = setup(8);
        t.push_frame(method(Some(catch_all_runtime()))).unwrap();
        t.frame_view().unwrap().set_mdp(Some(3));
        let unwind = exception_handler_for_exception(&mut t, &mgr, null_pointer("x"));
        let Unwind::Handler { bci, depth, exception } = unwind else {
            panic!("expected handler, got {unwind:?}");
        };
        assert_eq!((bci, depth), (20, 1));
        assert_eq!(exception.kind, ExceptionKind::NullPointerException);
        assert_eq!(t.frame_view().unwrap().mdp(), None);
    }

    #[test]
    fn unwinding_releases_each_frames_monitors_once() {
        let (table, mgr, mut t) = setup(8);
        t.push_frame(method(Some(catch_all_runtime()))).unwrap();
        let objects: Vec<_> = (1..=4).map(|i| ObjectRef::new(i * 8).unwrap()).collect();
        for pair in objects.chunks(2) {
            t.push_frame(method(None)).unwrap();
            for &obj in pair {
                let id = t.id();
                let frame = t.top_frame_mut().unwrap();
                let slot = frame.locks_mut().allocate().unwrap();
                mgr.monitor_enter(id, frame.locks_mut(), slot, Some(obj)).unwrap();
            }
        }

        let unwind = exception_handler_for_exception(&mut t, &mgr, arithmetic("/ by zero"));
        assert!(matches!(unwind, Unwind::Handler { depth: 1, .. }));
        for obj in objects {
            assert!(!table.holds_lock(t.id(), obj));
        }
    }

    #[test]
    fn errors_pass_runtime_handlers() {
        let (_, mgr, mut t) = setup(8);
        t.push_frame(method(Some(catch_all_runtime()))).unwrap();
        let unwind = exception_handler_for_exception(
            &mut t,
            &mgr,
            incompatible_class_change("A"),
        );
        assert!(matches!(unwind, Unwind::Uncaught(ref e) if e.kind == ExceptionKind::IncompatibleClassChangeError));
        assert_eq!(t.depth(), 0);
    }

    #[test]
    fn overflow_during_handler_search_is_delivered_late() {
        let (_, mgr, mut t) = setup(3);
        t.push_frame(method(Some(ExceptionHandler {
            start_bci: 0,
            end_bci: 10,
            handler_bci: 30,
            catch: Some(ExceptionKind::VirtualMachineError),
        })))
        .unwrap();
        t.push_frame(method(None)).unwrap();
        t.push_frame(method(Some(catch_all_runtime()))).unwrap();
        assert!(t.push_frame(method(None)).is_err());

        let unwind = exception_handler_for_exception(&mut t, &mgr, null_pointer("y"));
        let Unwind::Handler { bci, depth, exception } = unwind else {
            panic!("expected handler, got {unwind:?}");
        };
        assert_eq!(exception.kind, ExceptionKind::StackOverflowError);
        assert_eq!((bci, depth), (30, 1));
        assert_eq!(t.stack_guard().zone(), GuardZone::Enabled);
    }
}
