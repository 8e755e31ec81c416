use crate::instruction::Instruction;
use crate::op::Op;
use crate::BasicType;

/// Decodes a bytecode byte slice into [`Instruction`]s.
///
/// Unlike a dispatch loop, the runtime only decodes at a known bci, so the
/// decoder is checked: a truncated instruction or an unknown opcode yields
/// `None` instead of reading past the end.
pub struct BytecodeDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BytecodeDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Start decoding at `bci`.
    pub fn at(bytes: &'a [u8], bci: usize) -> Self {
        Self { bytes, pos: bci }
    }

    /// Current byte offset in the stream.
    #[inline(always)]
    pub fn offset(&self) -> usize {
        self.pos
    }

    #[inline(always)]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Decode the next instruction, or `None` at end-of-stream or on
    /// malformed input.
    pub fn decode_next(&mut self) -> Option<Instruction> {
        let op = Op::try_from(*self.bytes.get(self.pos)?).ok()?;
        let operands = self.bytes.get(self.pos + 1..self.pos + op.length())?;
        let instr = decode_operands(op, operands)?;
        self.pos += op.length();
        Some(instr)
    }
}

impl Iterator for BytecodeDecoder<'_> {
    type Item = Instruction;

    fn next(&mut self) -> Option<Instruction> {
        self.decode_next()
    }
}

/// Decode the single instruction starting at `bci`.
pub fn decode_at(bytes: &[u8], bci: usize) -> Option<(Instruction, usize)> {
    let mut decoder = BytecodeDecoder::at(bytes, bci);
    let instr = decoder.decode_next()?;
    Some((instr, decoder.offset()))
}

#[inline(always)]
fn u16_at(operands: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([operands[at], operands[at + 1]])
}

fn decode_operands(op: Op, operands: &[u8]) -> Option<Instruction> {
    // `operands` has exactly `op.length() - 1` bytes.
    let instr = match op {
        Op::Nop => Instruction::Nop,
        Op::Ldc => Instruction::Ldc { idx: u16_at(operands, 0) },
        Op::GetStatic => Instruction::GetStatic { idx: u16_at(operands, 0) },
        Op::PutStatic => Instruction::PutStatic { idx: u16_at(operands, 0) },
        Op::GetField => Instruction::GetField { idx: u16_at(operands, 0) },
        Op::PutField => Instruction::PutField { idx: u16_at(operands, 0) },
        Op::InvokeVirtual => Instruction::InvokeVirtual {
            idx: u16_at(operands, 0),
        },
        Op::InvokeSpecial => Instruction::InvokeSpecial {
            idx: u16_at(operands, 0),
        },
        Op::InvokeStatic => Instruction::InvokeStatic {
            idx: u16_at(operands, 0),
        },
        Op::InvokeInterface => Instruction::InvokeInterface {
            idx: u16_at(operands, 0),
        },
        Op::InvokeDynamic => Instruction::InvokeDynamic {
            idx: u16_at(operands, 0),
        },
        Op::InvokeHandle => Instruction::InvokeHandle {
            idx: u16_at(operands, 0),
        },
        Op::New => Instruction::New { idx: u16_at(operands, 0) },
        Op::NewArray => Instruction::NewArray {
            elem: BasicType::try_from(operands[0]).ok()?,
        },
        Op::ANewArray => Instruction::ANewArray { idx: u16_at(operands, 0) },
        Op::MultiANewArray => Instruction::MultiANewArray {
            idx: u16_at(operands, 0),
            dims: operands[2],
        },
        Op::CheckCast => Instruction::CheckCast { idx: u16_at(operands, 0) },
        Op::InstanceOf => {
            Instruction::InstanceOf { idx: u16_at(operands, 0) }
        }
        Op::MonitorEnter => Instruction::MonitorEnter,
        Op::MonitorExit => Instruction::MonitorExit,
        Op::Goto => Instruction::Goto {
            offset: u16_at(operands, 0) as i16,
        },
        Op::IfZero => Instruction::IfZero {
            offset: u16_at(operands, 0) as i16,
        },
        Op::IfNonZero => Instruction::IfNonZero {
            offset: u16_at(operands, 0) as i16,
        },
        Op::Jsr => Instruction::Jsr {
            offset: u16_at(operands, 0) as i16,
        },
        Op::Ret => Instruction::Ret { local: operands[0] },
        Op::Return => Instruction::Return,
        Op::Throw => Instruction::Throw,
    };
    Some(instr)
}
