use crate::op::Op;
use crate::BasicType;

/// A forward branch whose offset has not yet been resolved.
///
/// Created by the branch emitters on [`BytecodeBuilder`]. Resolve it with
/// [`BytecodeBuilder::bind`].
#[derive(Debug)]
pub struct Label {
    /// Position of the i16 offset bytes in the buffer.
    offset_pos: usize,
    /// Position right after the branch instruction (base for relative offset).
    base: usize,
}

/// Builds a bytecode byte sequence.
pub struct BytecodeBuilder {
    buf: Vec<u8>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Current byte offset in the bytecode stream.
    pub fn current_offset(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn emit_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_op(&mut self, op: Op) {
        self.buf.push(op as u8);
    }

    fn emit_indexed(&mut self, op: Op, idx: u16) {
        self.emit_op(op);
        self.emit_u16(idx);
    }

    fn emit_forward(&mut self, op: Op) -> Label {
        self.emit_op(op);
        let offset_pos = self.buf.len();
        self.emit_u16(0);
        Label {
            offset_pos,
            base: self.buf.len(),
        }
    }

    fn emit_backward(&mut self, op: Op, target: usize) {
        self.emit_op(op);
        let base = self.buf.len() + 2;
        let offset = target as isize - base as isize;
        self.emit_u16(offset as i16 as u16);
    }

    // ── instructions ───────────────────────────────────────────────

    pub fn nop(&mut self) {
        self.emit_op(Op::Nop);
    }

    pub fn ldc(&mut self, idx: u16) {
        self.emit_indexed(Op::Ldc, idx);
    }

    pub fn get_static(&mut self, idx: u16) {
        self.emit_indexed(Op::GetStatic, idx);
    }

    pub fn put_static(&mut self, idx: u16) {
        self.emit_indexed(Op::PutStatic, idx);
    }

    pub fn get_field(&mut self, idx: u16) {
        self.emit_indexed(Op::GetField, idx);
    }

    pub fn put_field(&mut self, idx: u16) {
        self.emit_indexed(Op::PutField, idx);
    }

    /// Any of the six invoke opcodes.
    pub fn invoke(&mut self, op: Op, idx: u16) {
        debug_assert!(op.is_invoke(), "{op:?} is not an invoke");
        self.emit_indexed(op, idx);
    }

    pub fn new_instance(&mut self, idx: u16) {
        self.emit_indexed(Op::New, idx);
    }

    pub fn new_array(&mut self, elem: BasicType) {
        debug_assert!(elem.is_array_element());
        self.emit_op(Op::NewArray);
        self.emit_u8(elem as u8);
    }

    pub fn anew_array(&mut self, idx: u16) {
        self.emit_indexed(Op::ANewArray, idx);
    }

    pub fn multi_anew_array(&mut self, idx: u16, dims: u8) {
        self.emit_indexed(Op::MultiANewArray, idx);
        self.emit_u8(dims);
    }

    pub fn check_cast(&mut self, idx: u16) {
        self.emit_indexed(Op::CheckCast, idx);
    }

    pub fn instance_of(&mut self, idx: u16) {
        self.emit_indexed(Op::InstanceOf, idx);
    }

    pub fn monitor_enter(&mut self) {
        self.emit_op(Op::MonitorEnter);
    }

    pub fn monitor_exit(&mut self) {
        self.emit_op(Op::MonitorExit);
    }

    pub fn goto(&mut self) -> Label {
        self.emit_forward(Op::Goto)
    }

    pub fn if_zero(&mut self) -> Label {
        self.emit_forward(Op::IfZero)
    }

    pub fn if_non_zero(&mut self) -> Label {
        self.emit_forward(Op::IfNonZero)
    }

    pub fn jsr(&mut self) -> Label {
        self.emit_forward(Op::Jsr)
    }

    /// Backward `Goto` to an already emitted offset (a loop back-edge).
    pub fn goto_back(&mut self, target: usize) {
        self.emit_backward(Op::Goto, target);
    }

    /// Backward conditional branch, taken when the top of stack is non-zero.
    pub fn if_non_zero_back(&mut self, target: usize) {
        self.emit_backward(Op::IfNonZero, target);
    }

    pub fn ret(&mut self, local: u8) {
        self.emit_op(Op::Ret);
        self.emit_u8(local);
    }

    pub fn return_(&mut self) {
        self.emit_op(Op::Return);
    }

    pub fn throw(&mut self) {
        self.emit_op(Op::Throw);
    }

    /// Resolve a forward branch to the current offset.
    pub fn bind(&mut self, label: Label) {
        let offset = self.buf.len() as isize - label.base as isize;
        let bytes = (offset as i16).to_le_bytes();
        self.buf[label.offset_pos..label.offset_pos + 2]
            .copy_from_slice(&bytes);
    }
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
