use core::fmt;
use std::sync::Arc;

use crate::error::{Exception, ExceptionKind, VmResult};
use crate::frame::{Frame, FrameStack, FrameView};
use crate::method::Method;
use crate::safepoint::SafepointCoordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardZone {
    /// Normal execution; depth is bounded by the limit.
    Enabled,
    /// A stack overflow is being delivered; the reserve is usable.
    Reserved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackCheck {
    Ok,
    /// Recoverable: raise `StackOverflowError`.
    Overflow,
    /// The reserve itself is exhausted.
    Exhausted,
}

/// Call-depth guard with a reserve zone for delivering stack overflows.
#[derive(Debug)]
pub struct StackGuard {
    limit: usize,
    reserve: usize,
    zone: GuardZone,
}

impl StackGuard {
    pub fn new(limit: usize, reserve: usize) -> Self {
        Self {
            limit,
            reserve,
            zone: GuardZone::Enabled,
        }
    }

    #[inline]
    pub fn zone(&self) -> GuardZone {
        self.zone
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Whether a thread at `depth` may grow by one more frame.
    pub fn check(&self, depth: usize) -> StackCheck {
        match self.zone {
            GuardZone::Enabled if depth < self.limit => StackCheck::Ok,
            GuardZone::Enabled => StackCheck::Overflow,
            GuardZone::Reserved if depth < self.limit + self.reserve => {
                StackCheck::Ok
            }
            GuardZone::Reserved => StackCheck::Exhausted,
        }
    }

    /// Open the reserve zone. Returns `false` if it was already open.
    pub fn enter_reserved(&mut self) -> bool {
        let was_enabled = self.zone == GuardZone::Enabled;
        self.zone = GuardZone::Reserved;
        was_enabled
    }

    /// Close the reserve once the stack is back below the limit.
    pub fn rearm(&mut self, depth: usize) -> bool {
        if self.zone == GuardZone::Reserved && depth < self.limit {
            self.zone = GuardZone::Enabled;
            return true;
        }
        false
    }
}

/// A mutator thread attached to the runtime.
///
/// Owns its frames and its pending-exception marker. Registered with the
/// safepoint coordinator for its whole lifetime.
pub struct VMThread {
    id: ThreadId,
    frames: FrameStack,
    pending: Option<Exception>,
    guard: StackGuard,
    safepoints: Arc<SafepointCoordinator>,
}

impl VMThread {
    pub(crate) fn new(
        id: ThreadId,
        guard: StackGuard,
        safepoints: Arc<SafepointCoordinator>,
    ) -> Self {
        safepoints.register();
        Self {
            id,
            frames: FrameStack::default(),
            pending: None,
            guard,
            safepoints,
        }
    }

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.frames.depth()
    }

    pub fn frames(&self) -> &FrameStack {
        &self.frames
    }

    pub fn stack_guard(&self) -> &StackGuard {
        &self.guard
    }

    pub(crate) fn stack_guard_mut(&mut self) -> &mut StackGuard {
        &mut self.guard
    }

    /// Push an activation of `method`, raising `StackOverflowError` at the
    /// depth limit.
    pub fn push_frame(&mut self, method: Arc<Method>) -> VmResult<()> {
        match self.guard.check(self.frames.depth()) {
            StackCheck::Ok => {
                self.frames.push(Frame::new(method));
                Ok(())
            }
            StackCheck::Overflow | StackCheck::Exhausted => {
                Err(crate::exceptions::stack_overflow(self.frames.depth()))
            }
        }
    }

    pub fn pop_frame(&mut self) -> Option<Frame> {
        let frame = self.frames.pop();
        if self.guard.rearm(self.frames.depth()) {
            log::debug!("{}: stack guard re-armed", self.id);
        }
        frame
    }

    pub fn top_frame(&self) -> Option<&Frame> {
        self.frames.top()
    }

    pub(crate) fn top_frame_mut(&mut self) -> Option<&mut Frame> {
        self.frames.top_mut()
    }

    /// View of the topmost activation.
    pub fn frame_view(&mut self) -> VmResult<FrameView<'_>> {
        let id = self.id;
        self.frames.top_mut().map(FrameView::new).ok_or_else(|| {
            Exception::new(
                ExceptionKind::InternalError,
                format!("{id} has no interpreted frame"),
            )
        })
    }

    // ── pending exception ─────────────────────────────────────────

    pub fn pending_exception(&self) -> Option<&Exception> {
        self.pending.as_ref()
    }

    #[inline]
    pub fn has_pending_exception(&self) -> bool {
        self.pending.is_some()
    }

    pub fn set_pending_exception(&mut self, exception: Exception) {
        log::trace!("{}: pending {exception}", self.id);
        self.pending = Some(exception);
    }

    pub fn take_pending_exception(&mut self) -> Option<Exception> {
        self.pending.take()
    }

    /// Fold a runtime result into the pending-exception marker, the way a
    /// dispatch loop consumes it.
    pub fn check<T>(&mut self, result: VmResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(exception) => {
                self.set_pending_exception(exception);
                None
            }
        }
    }
}

impl Drop for VMThread {
    fn drop(&mut self) {
        self.safepoints.unregister();
    }
}

impl fmt::Debug for VMThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VMThread")
            .field("id", &self.id)
            .field("depth", &self.frames.depth())
            .field("pending", &self.pending)
            .field("guard", &self.guard)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::Signature;

    fn thread(limit: usize, reserve: usize) -> VMThread {
        VMThread::new(
            ThreadId(1),
            StackGuard::new(limit, reserve),
            Arc::new(SafepointCoordinator::new()),
        )
    }

    fn method() -> Arc<Method> {
        Method::builder("f", Signature::parse("()V").unwrap()).build()
    }

    #[test]
    fn guard_zones() {
        let mut guard = StackGuard::new(4, 2);
        assert_eq!(guard.check(3), StackCheck::Ok);
        assert_eq!(guard.check(4), StackCheck::Overflow);
        assert!(guard.enter_reserved());
        assert!(!guard.enter_reserved());
        assert_eq!(guard.check(5), StackCheck::Ok);
        assert_eq!(guard.check(6), StackCheck::Exhausted);
        assert!(!guard.rearm(4));
        assert!(guard.rearm(3));
        assert_eq!(guard.zone(), GuardZone::Enabled);
    }

    #[test]
    fn push_beyond_limit_is_stack_overflow() {
        let mut t = thread(2, 1);
        t.push_frame(method()).unwrap();
        t.push_frame(method()).unwrap();
        let err = t.push_frame(method()).unwrap_err();
        assert_eq!(err.kind, ExceptionKind::StackOverflowError);
        assert_eq!(t.depth(), 2);
    }

    #[test]
    fn check_sets_pending_marker() {
        let mut t = thread(2, 1);
        assert_eq!(t.check(Ok::<_, Exception>(5)), Some(5));
        assert!(!t.has_pending_exception());

        let r: VmResult<()> =
            Err(Exception::new(ExceptionKind::ClassCastException, "A to B"));
        assert_eq!(t.check(r), None);
        assert_eq!(
            t.take_pending_exception().map(|e| e.kind),
            Some(ExceptionKind::ClassCastException)
        );
        assert!(!t.has_pending_exception());
    }

    #[test]
    fn frame_view_requires_a_frame() {
        let mut t = thread(2, 1);
        assert!(t.frame_view().is_err());
        t.push_frame(method()).unwrap();
        assert_eq!(t.frame_view().unwrap().bci(), 0);
    }
}
