use std::sync::Arc;

use bytecode::{Instruction, Op, decode_at};

use crate::error::{Exception, ExceptionKind, VmResult};
use crate::method::Method;
use crate::oops::{ObjectRef, Value};
use crate::resolution::{CpCacheEntry, Site};

/// Frame-local record of one synchronized region. Active while it holds an
/// object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockSlot {
    object: Option<ObjectRef>,
}

impl LockSlot {
    #[inline]
    pub fn object(&self) -> Option<ObjectRef> {
        self.object
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.object.is_some()
    }

    pub(crate) fn bind(&mut self, object: ObjectRef) {
        self.object = Some(object);
    }

    pub(crate) fn clear(&mut self) {
        self.object = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockSlotId(usize);

impl LockSlotId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Fixed-capacity lock slots of one frame. Slots below the high-water mark
/// enumerate in allocation order.
#[derive(Debug)]
pub struct LockStack {
    slots: Box<[LockSlot]>,
    top: usize,
}

impl LockStack {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![LockSlot::default(); capacity].into_boxed_slice(),
            top: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots handed out so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.top
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.top == 0
    }

    /// An inactive slot: the first free one below the mark, or a fresh one.
    pub fn allocate(&mut self) -> Option<LockSlotId> {
        if let Some(free) = self.slots[..self.top].iter().position(|s| !s.is_active()) {
            return Some(LockSlotId(free));
        }
        if self.top == self.slots.len() {
            return None;
        }
        self.top += 1;
        Some(LockSlotId(self.top - 1))
    }

    /// The most recently allocated active slot holding `object`.
    pub fn find(&self, object: ObjectRef) -> Option<LockSlotId> {
        self.slots[..self.top]
            .iter()
            .rposition(|s| s.object == Some(object))
            .map(LockSlotId)
    }

    pub fn first(&self) -> Option<LockSlotId> {
        (self.top > 0).then_some(LockSlotId(0))
    }

    pub fn last(&self) -> Option<LockSlotId> {
        self.top.checked_sub(1).map(LockSlotId)
    }

    pub fn next(&self, slot: LockSlotId) -> Option<LockSlotId> {
        let next = slot.0 + 1;
        (next < self.top).then_some(LockSlotId(next))
    }

    pub fn get(&self, slot: LockSlotId) -> Option<&LockSlot> {
        self.slots[..self.top].get(slot.0)
    }

    pub fn get_mut(&mut self, slot: LockSlotId) -> Option<&mut LockSlot> {
        self.slots[..self.top].get_mut(slot.0)
    }

    /// Active slots in enumeration order.
    pub fn active(&self) -> impl Iterator<Item = (LockSlotId, ObjectRef)> + '_ {
        self.slots[..self.top]
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.object.map(|o| (LockSlotId(i), o)))
    }
}

/// One interpreted activation.
#[derive(Debug)]
pub struct Frame {
    method: Arc<Method>,
    bci: usize,
    mdp: Option<usize>,
    locals: Vec<Value>,
    locks: LockStack,
}

impl Frame {
    pub fn new(method: Arc<Method>) -> Self {
        let locals = vec![Value::default(); method.max_locals()];
        let locks = LockStack::new(method.max_monitors());
        Self {
            method,
            bci: 0,
            mdp: None,
            locals,
            locks,
        }
    }

    pub fn method(&self) -> &Arc<Method> {
        &self.method
    }

    #[inline]
    pub fn bci(&self) -> usize {
        self.bci
    }

    pub fn locks(&self) -> &LockStack {
        &self.locks
    }

    pub(crate) fn locks_mut(&mut self) -> &mut LockStack {
        &mut self.locks
    }

    pub(crate) fn set_bci(&mut self, bci: usize) {
        self.bci = bci;
    }

    pub(crate) fn set_mdp(&mut self, mdp: Option<usize>) {
        self.mdp = mdp;
    }
}

/// The calling thread's frames, innermost last.
#[derive(Debug, Default)]
pub struct FrameStack {
    frames: Vec<Frame>,
}

impl FrameStack {
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Frame> {
        self.frames.iter()
    }
}

/// Read/update access to the topmost activation.
pub struct FrameView<'a> {
    frame: &'a mut Frame,
}

impl<'a> FrameView<'a> {
    pub fn new(frame: &'a mut Frame) -> Self {
        Self { frame }
    }

    pub fn method(&self) -> &Arc<Method> {
        &self.frame.method
    }

    #[inline]
    pub fn bci(&self) -> usize {
        self.frame.bci
    }

    pub fn set_bci(&mut self, bci: usize) {
        self.frame.bci = bci;
    }

    /// Bytecode from the current bci on.
    pub fn bcp(&self) -> &[u8] {
        self.frame
            .method
            .code()
            .get(self.frame.bci..)
            .unwrap_or_default()
    }

    /// Profile cursor, a data index into the method's profile data.
    #[inline]
    pub fn mdp(&self) -> Option<usize> {
        self.frame.mdp
    }

    pub fn set_mdp(&mut self, mdp: Option<usize>) {
        self.frame.mdp = mdp;
    }

    pub fn instruction(&self) -> VmResult<Instruction> {
        decode_at(self.frame.method.code(), self.frame.bci)
            .map(|(instr, _)| instr)
            .ok_or_else(|| self.malformed())
    }

    pub fn op(&self) -> VmResult<Op> {
        self.bcp()
            .first()
            .and_then(|&b| Op::try_from(b).ok())
            .ok_or_else(|| self.malformed())
    }

    /// Length of the instruction at the current bci.
    pub fn instruction_length(&self) -> VmResult<usize> {
        self.op().map(Op::length)
    }

    pub fn cache_index(&self) -> VmResult<u16> {
        self.instruction()?.cache_index().ok_or_else(|| {
            Exception::new(
                ExceptionKind::InternalError,
                format!("no cache index at bci {}", self.frame.bci),
            )
        })
    }

    pub fn number_of_dimensions(&self) -> VmResult<u8> {
        match self.instruction()? {
            Instruction::MultiANewArray { dims, .. } => Ok(dims),
            other => Err(Exception::new(
                ExceptionKind::InternalError,
                format!("{other} carries no dimensions"),
            )),
        }
    }

    pub fn cache_entry(&self) -> VmResult<&CpCacheEntry> {
        let index = self.cache_index()?;
        self.frame.method.cp_cache().entry(index).ok_or_else(|| {
            Exception::new(
                ExceptionKind::InternalError,
                format!("cache index {index} out of range"),
            )
        })
    }

    /// The cache-indexed site at the current bci.
    pub fn site(&self) -> VmResult<Site<'_>> {
        Ok(Site {
            cache: self.frame.method.cp_cache(),
            index: self.cache_index()?,
            op: self.op()?,
        })
    }

    pub fn local(&self, index: usize) -> Option<Value> {
        self.frame.locals.get(index).copied()
    }

    pub fn set_local(&mut self, index: usize, value: Value) -> VmResult<()> {
        let slot = self.frame.locals.get_mut(index).ok_or_else(|| {
            Exception::new(
                ExceptionKind::InternalError,
                format!("local {index} out of range"),
            )
        })?;
        *slot = value;
        Ok(())
    }

    // ── lock slots ─────────────────────────────────────────────────

    pub fn first_lock_slot(&self) -> Option<LockSlotId> {
        self.frame.locks.first()
    }

    pub fn last_lock_slot(&self) -> Option<LockSlotId> {
        self.frame.locks.last()
    }

    pub fn next_lock_slot(&self, slot: LockSlotId) -> Option<LockSlotId> {
        self.frame.locks.next(slot)
    }

    pub fn lock_slot(&self, slot: LockSlotId) -> Option<&LockSlot> {
        self.frame.locks.get(slot)
    }

    pub fn locks(&self) -> &LockStack {
        &self.frame.locks
    }

    pub fn locks_mut(&mut self) -> &mut LockStack {
        &mut self.frame.locks
    }

    fn malformed(&self) -> Exception {
        Exception::new(
            ExceptionKind::InternalError,
            format!(
                "malformed bytecode in {} at bci {}",
                self.frame.method, self.frame.bci
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::Signature;
    use bytecode::BytecodeBuilder;

    fn obj(addr: u64) -> ObjectRef {
        ObjectRef::new(addr).unwrap()
    }

    #[test]
    fn lock_stack_enumerates_in_allocation_order() {
        let mut locks = LockStack::new(3);
        let a = locks.allocate().unwrap();
        locks.get_mut(a).unwrap().bind(obj(1));
        let b = locks.allocate().unwrap();
        locks.get_mut(b).unwrap().bind(obj(2));

        assert_eq!(locks.first(), Some(a));
        assert_eq!(locks.next(a), Some(b));
        assert_eq!(locks.last(), Some(b));
        assert_eq!(locks.next(b), None);
        assert_eq!(
            locks.active().map(|(_, o)| o).collect::<Vec<_>>(),
            vec![obj(1), obj(2)]
        );
    }

    #[test]
    fn lock_stack_reuses_free_slots_and_is_bounded() {
        let mut locks = LockStack::new(2);
        let a = locks.allocate().unwrap();
        // an unbound slot is handed out again
        assert_eq!(locks.allocate(), Some(a));
        locks.get_mut(a).unwrap().bind(obj(1));
        let b = locks.allocate().unwrap();
        locks.get_mut(b).unwrap().bind(obj(1));
        assert_eq!(locks.allocate(), None);

        // recursive entries: find returns the innermost
        assert_eq!(locks.find(obj(1)), Some(b));
        locks.get_mut(a).unwrap().clear();
        assert_eq!(locks.allocate(), Some(a));
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn view_decodes_current_instruction() {
        let mut b = BytecodeBuilder::new();
        b.nop();
        b.multi_anew_array(1, 3);
        let method = Method::builder("m", Signature::parse("()V").unwrap())
            .code(b.into_bytes())
            .build();
        let mut frame = Frame::new(method);
        let mut view = FrameView::new(&mut frame);

        assert_eq!(view.instruction().unwrap(), Instruction::Nop);
        assert!(view.cache_index().is_err());
        view.set_bci(1);
        assert_eq!(view.op().unwrap(), Op::MultiANewArray);
        assert_eq!(view.cache_index().unwrap(), 1);
        assert_eq!(view.number_of_dimensions().unwrap(), 3);
        assert_eq!(view.instruction_length().unwrap(), 4);
        // the method's cache is empty
        assert_eq!(
            view.cache_entry().unwrap_err().kind,
            ExceptionKind::InternalError
        );

        view.set_bci(5);
        assert!(view.bcp().is_empty());
        assert!(view.instruction().is_err());
    }
}
