use core::fmt;

use crate::BasicType;

/// A decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    Ldc { idx: u16 },
    GetStatic { idx: u16 },
    PutStatic { idx: u16 },
    GetField { idx: u16 },
    PutField { idx: u16 },
    InvokeVirtual { idx: u16 },
    InvokeSpecial { idx: u16 },
    InvokeStatic { idx: u16 },
    InvokeInterface { idx: u16 },
    InvokeDynamic { idx: u16 },
    InvokeHandle { idx: u16 },
    New { idx: u16 },
    NewArray { elem: BasicType },
    ANewArray { idx: u16 },
    MultiANewArray { idx: u16, dims: u8 },
    CheckCast { idx: u16 },
    InstanceOf { idx: u16 },
    MonitorEnter,
    MonitorExit,
    Goto { offset: i16 },
    IfZero { offset: i16 },
    IfNonZero { offset: i16 },
    Jsr { offset: i16 },
    Ret { local: u8 },
    Return,
    Throw,
}

impl Instruction {
    /// The constant-pool cache index carried by the instruction, if any.
    pub fn cache_index(self) -> Option<u16> {
        match self {
            Instruction::Ldc { idx }
            | Instruction::GetStatic { idx }
            | Instruction::PutStatic { idx }
            | Instruction::GetField { idx }
            | Instruction::PutField { idx }
            | Instruction::InvokeVirtual { idx }
            | Instruction::InvokeSpecial { idx }
            | Instruction::InvokeStatic { idx }
            | Instruction::InvokeInterface { idx }
            | Instruction::InvokeDynamic { idx }
            | Instruction::InvokeHandle { idx }
            | Instruction::New { idx }
            | Instruction::ANewArray { idx }
            | Instruction::MultiANewArray { idx, .. }
            | Instruction::CheckCast { idx }
            | Instruction::InstanceOf { idx } => Some(idx),
            _ => None,
        }
    }

    /// Relative branch offset for branching instructions.
    pub fn branch_offset(self) -> Option<i16> {
        match self {
            Instruction::Goto { offset }
            | Instruction::IfZero { offset }
            | Instruction::IfNonZero { offset }
            | Instruction::Jsr { offset } => Some(offset),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nop => write!(f, "Nop"),
            Self::Ldc { idx } => write!(f, "Ldc #{idx}"),
            Self::GetStatic { idx } => write!(f, "GetStatic #{idx}"),
            Self::PutStatic { idx } => write!(f, "PutStatic #{idx}"),
            Self::GetField { idx } => write!(f, "GetField #{idx}"),
            Self::PutField { idx } => write!(f, "PutField #{idx}"),
            Self::InvokeVirtual { idx } => write!(f, "InvokeVirtual #{idx}"),
            Self::InvokeSpecial { idx } => write!(f, "InvokeSpecial #{idx}"),
            Self::InvokeStatic { idx } => write!(f, "InvokeStatic #{idx}"),
            Self::InvokeInterface { idx } => {
                write!(f, "InvokeInterface #{idx}")
            }
            Self::InvokeDynamic { idx } => write!(f, "InvokeDynamic #{idx}"),
            Self::InvokeHandle { idx } => write!(f, "InvokeHandle #{idx}"),
            Self::New { idx } => write!(f, "New #{idx}"),
            Self::NewArray { elem } => write!(f, "NewArray {elem}"),
            Self::ANewArray { idx } => write!(f, "ANewArray #{idx}"),
            Self::MultiANewArray { idx, dims } => {
                write!(f, "MultiANewArray #{idx} {dims}")
            }
            Self::CheckCast { idx } => write!(f, "CheckCast #{idx}"),
            Self::InstanceOf { idx } => write!(f, "InstanceOf #{idx}"),
            Self::MonitorEnter => write!(f, "MonitorEnter"),
            Self::MonitorExit => write!(f, "MonitorExit"),
            Self::Goto { offset } => write!(f, "Goto {offset}"),
            Self::IfZero { offset } => write!(f, "IfZero {offset}"),
            Self::IfNonZero { offset } => write!(f, "IfNonZero {offset}"),
            Self::Jsr { offset } => write!(f, "Jsr {offset}"),
            Self::Ret { local } => write!(f, "Ret l{local}"),
            Self::Return => write!(f, "Return"),
            Self::Throw => write!(f, "Throw"),
        }
    }
}
