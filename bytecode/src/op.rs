/// Bytecode opcodes.
///
/// Constant-pool cache indices are 16-bit little-endian. Branch offsets are
/// signed 16-bit and relative to the end of the branch instruction, so a
/// back-edge always carries a negative offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    Nop = 0x00,

    /// Push a constant resolved through the cache.
    /// Operands: `idx:u16`
    Ldc,

    /// Read a static field.
    /// Operands: `idx:u16`
    GetStatic,

    /// Write a static field.
    /// Operands: `idx:u16`
    PutStatic,

    /// Read an instance field.
    /// Operands: `idx:u16`
    GetField,

    /// Write an instance field.
    /// Operands: `idx:u16`
    PutField,

    /// Operands: `idx:u16`
    InvokeVirtual,

    /// Operands: `idx:u16`
    InvokeSpecial,

    /// Operands: `idx:u16`
    InvokeStatic,

    /// Operands: `idx:u16`
    InvokeInterface,

    /// Call-site linked invocation. The resolved entry carries an appendix.
    /// Operands: `idx:u16`
    InvokeDynamic,

    /// Signature-polymorphic handle invocation.
    /// Operands: `idx:u16`
    InvokeHandle,

    /// Allocate an instance of a resolved class.
    /// Operands: `idx:u16`
    New,

    /// Allocate a primitive array.
    /// Operands: `elem:u8` (a [`BasicType`](crate::BasicType) code)
    NewArray,

    /// Allocate a reference array.
    /// Operands: `idx:u16`
    ANewArray,

    /// Allocate a multi-dimensional array.
    /// Operands: `idx:u16`, `dims:u8`
    MultiANewArray,

    /// Operands: `idx:u16`
    CheckCast,

    /// Operands: `idx:u16`
    InstanceOf,

    /// Enter a synchronized region.
    MonitorEnter,

    /// Leave a synchronized region.
    MonitorExit,

    /// Unconditional relative jump.
    /// Operands: `offset:i16`
    Goto,

    /// Jump if the top of stack is zero.
    /// Operands: `offset:i16`
    IfZero,

    /// Jump if the top of stack is non-zero.
    /// Operands: `offset:i16`
    IfNonZero,

    /// Jump to a local subroutine, pushing the return bci.
    /// Operands: `offset:i16`
    Jsr,

    /// Return from a local subroutine to the bci stored in a local.
    /// Operands: `local:u8`
    Ret,

    Return,

    /// Throw the exception on top of stack.
    Throw,
}

impl Op {
    pub const COUNT: usize = Op::Throw as usize + 1;

    /// Encoded length of the instruction including the opcode byte.
    pub const fn length(self) -> usize {
        match self {
            Op::Nop
            | Op::MonitorEnter
            | Op::MonitorExit
            | Op::Return
            | Op::Throw => 1,
            Op::NewArray | Op::Ret => 2,
            Op::MultiANewArray => 4,
            _ => 3,
        }
    }

    pub const fn is_field_access(self) -> bool {
        matches!(
            self,
            Op::GetStatic | Op::PutStatic | Op::GetField | Op::PutField
        )
    }

    pub const fn is_invoke(self) -> bool {
        matches!(
            self,
            Op::InvokeVirtual
                | Op::InvokeSpecial
                | Op::InvokeStatic
                | Op::InvokeInterface
                | Op::InvokeDynamic
                | Op::InvokeHandle
        )
    }

    pub const fn is_branch(self) -> bool {
        matches!(self, Op::Goto | Op::IfZero | Op::IfNonZero | Op::Jsr)
    }

    pub const fn is_conditional(self) -> bool {
        matches!(self, Op::IfZero | Op::IfNonZero)
    }

    /// Whether the instruction carries a 16-bit constant-pool cache index
    /// right after the opcode.
    pub const fn has_cache_index(self) -> bool {
        matches!(
            self,
            Op::Ldc
                | Op::GetStatic
                | Op::PutStatic
                | Op::GetField
                | Op::PutField
                | Op::InvokeVirtual
                | Op::InvokeSpecial
                | Op::InvokeStatic
                | Op::InvokeInterface
                | Op::InvokeDynamic
                | Op::InvokeHandle
                | Op::New
                | Op::ANewArray
                | Op::MultiANewArray
                | Op::CheckCast
                | Op::InstanceOf
        )
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte < Self::COUNT as u8 {
            // SAFETY: Op is repr(u8) with contiguous variants starting at 0.
            Ok(unsafe { core::mem::transmute::<u8, Op>(byte) })
        } else {
            Err(byte)
        }
    }
}
