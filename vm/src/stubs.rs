//! Native argument layout and the x86-64 signature handler generator.
//!
//! A handler is called as `extern "C" fn(from: *const u64, to: *mut
//! OutgoingArgs) -> u64`. `from` points at the method's argument slots,
//! `to` at the register and stack image the native call is made from. The
//! return value is the result type code for the caller's result handler.
//!
//! Slot 0 of `int_regs` belongs to the environment pointer and slot 1 to
//! the receiver or class handle; the caller fills what the handler leaves.

use core::mem::offset_of;

use assembler::x64::{Assembler, Mem, Reg};
use bytecode::BasicType;

use crate::error::{Exception, ExceptionKind, VmResult};
use crate::method::Method;
use crate::signature::{CodeBufferError, Fingerprint, SignatureGenerator};

pub const INT_ARG_REGS: usize = 6;
pub const FP_ARG_REGS: usize = 8;
pub const MAX_STACK_ARGS: usize = 256;

const FIRST_INT_ARG: usize = 2;
const RECEIVER_REG: usize = 1;

/// Register and stack image of an outgoing native call.
#[repr(C)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingArgs {
    pub int_regs: [u64; INT_ARG_REGS],
    pub fp_regs: [u64; FP_ARG_REGS],
    pub stack: [u64; MAX_STACK_ARGS],
}

impl Default for OutgoingArgs {
    fn default() -> Self {
        Self {
            int_regs: [0; INT_ARG_REGS],
            fp_regs: [0; FP_ARG_REGS],
            stack: [0; MAX_STACK_ARGS],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgClass {
    /// 32-bit integer, sign-extended.
    Int,
    Long,
    Float,
    Double,
    /// Reference passed as the address of its slot, or 0 for null.
    Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLocation {
    Int(usize),
    Fp(usize),
    Stack(usize),
}

impl ArgLocation {
    /// Byte offset of the location inside [`OutgoingArgs`].
    pub fn offset(self) -> usize {
        match self {
            ArgLocation::Int(i) => offset_of!(OutgoingArgs, int_regs) + 8 * i,
            ArgLocation::Fp(i) => offset_of!(OutgoingArgs, fp_regs) + 8 * i,
            ArgLocation::Stack(i) => offset_of!(OutgoingArgs, stack) + 8 * i,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgMove {
    pub slot: usize,
    pub class: ArgClass,
    pub to: ArgLocation,
}

/// Where every argument of a signature goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCallLayout {
    moves: Vec<ArgMove>,
    result: BasicType,
    stack_slots: usize,
}

impl NativeCallLayout {
    pub fn new(
        is_static: bool,
        params: impl IntoIterator<Item = BasicType>,
        result: BasicType,
    ) -> Self {
        let mut moves = Vec::new();
        let mut slot = 0;
        if !is_static {
            moves.push(ArgMove {
                slot: 0,
                class: ArgClass::Handle,
                to: ArgLocation::Int(RECEIVER_REG),
            });
            slot = 1;
        }

        let mut next_int = FIRST_INT_ARG;
        let mut next_fp = 0;
        let mut next_stack = 0;
        for param in params {
            let class = match param {
                BasicType::Long => ArgClass::Long,
                BasicType::Float => ArgClass::Float,
                BasicType::Double => ArgClass::Double,
                BasicType::Object | BasicType::Array => ArgClass::Handle,
                BasicType::Void => continue,
                _ => ArgClass::Int,
            };
            let to = if param.is_floating() && next_fp < FP_ARG_REGS {
                next_fp += 1;
                ArgLocation::Fp(next_fp - 1)
            } else if !param.is_floating() && next_int < INT_ARG_REGS {
                next_int += 1;
                ArgLocation::Int(next_int - 1)
            } else {
                next_stack += 1;
                ArgLocation::Stack(next_stack - 1)
            };
            moves.push(ArgMove { slot, class, to });
            slot += param.slots();
        }

        Self {
            moves,
            result,
            stack_slots: next_stack,
        }
    }

    pub fn for_method(method: &Method) -> Self {
        let signature = method.signature();
        Self::new(
            method.is_static(),
            signature.params.iter().copied(),
            signature.ret,
        )
    }

    /// `None` for overflow fingerprints, which have no encoded shape.
    pub fn for_fingerprint(fingerprint: Fingerprint) -> Option<Self> {
        let result = fingerprint.result()?;
        Some(Self::new(fingerprint.is_static(), fingerprint.params(), result))
    }

    pub fn moves(&self) -> &[ArgMove] {
        &self.moves
    }

    #[inline]
    pub fn result(&self) -> BasicType {
        self.result
    }

    #[inline]
    pub fn stack_slots(&self) -> usize {
        self.stack_slots
    }

    /// Argument slots read from the interpreter side.
    pub fn slots_read(&self) -> usize {
        self.moves
            .iter()
            .map(|m| match m.class {
                ArgClass::Long | ArgClass::Double => m.slot + 2,
                _ => m.slot + 1,
            })
            .max()
            .unwrap_or(0)
    }
}

/// Marshal arguments by interpreting the layout at call time. Produces the
/// same image a generated handler would.
pub fn slow_signature_handler(
    method: &Method,
    from: &[u64],
    to: &mut OutgoingArgs,
) -> VmResult<u64> {
    let layout = NativeCallLayout::for_method(method);
    if layout.stack_slots() > MAX_STACK_ARGS {
        return Err(Exception::new(
            ExceptionKind::InternalError,
            format!("{method}: {} stack arguments", layout.stack_slots()),
        ));
    }
    if from.len() < layout.slots_read() {
        return Err(Exception::new(
            ExceptionKind::InternalError,
            format!(
                "{method}: {} argument slots, {} needed",
                from.len(),
                layout.slots_read()
            ),
        ));
    }

    for mv in layout.moves() {
        let raw = from[mv.slot];
        let value = match mv.class {
            ArgClass::Int => raw as u32 as i32 as i64 as u64,
            ArgClass::Long | ArgClass::Double => raw,
            ArgClass::Float => raw as u32 as u64,
            ArgClass::Handle if raw == 0 => 0,
            ArgClass::Handle => &from[mv.slot] as *const u64 as u64,
        };
        match mv.to {
            ArgLocation::Int(i) => to.int_regs[i] = value,
            ArgLocation::Fp(i) => to.fp_regs[i] = value,
            ArgLocation::Stack(i) => to.stack[i] = value,
        }
    }
    Ok(layout.result() as u64)
}

/// System V x86-64 handler generator: `rdi` holds `from`, `rsi` holds `to`.
#[derive(Debug, Default)]
pub struct X64SignatureGenerator;

impl SignatureGenerator for X64SignatureGenerator {
    fn generate(
        &mut self,
        fingerprint: Fingerprint,
        limit: usize,
    ) -> Result<Vec<u8>, CodeBufferError> {
        let layout = NativeCallLayout::for_fingerprint(fingerprint)
            .ok_or(CodeBufferError::Unsupported(fingerprint))?;
        let mut a = Assembler::with_limit(format!("handler {fingerprint}"), limit);

        for mv in layout.moves() {
            let src = Mem::new(Reg::Rdi, 8 * mv.slot as i32);
            match mv.class {
                ArgClass::Int => a.movsxd_rm(Reg::Rax, src),
                ArgClass::Long | ArgClass::Double => a.mov_rm64(Reg::Rax, src),
                ArgClass::Float => a.mov_rm32(Reg::Rax, src),
                ArgClass::Handle => {
                    a.lea(Reg::Rax, src);
                    a.xor_rr32(Reg::Rcx, Reg::Rcx);
                    a.cmp_mi8(src, 0);
                    a.cmove(Reg::Rax, Reg::Rcx);
                }
            }
            a.mov_mr64(Mem::new(Reg::Rsi, mv.to.offset() as i32), Reg::Rax);
        }
        a.mov_ri64(Reg::Rax, layout.result() as i64);
        a.ret();

        Ok(a.finalize()?.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::{MethodFlags, Signature};
    use crate::oops::Value;
    use std::sync::Arc;

    fn native(descriptor: &str, flags: MethodFlags) -> Arc<Method> {
        Method::builder("n", Signature::parse(descriptor).unwrap())
            .flags(MethodFlags::NATIVE | flags)
            .build()
    }

    #[test]
    fn outgoing_layout_offsets() {
        assert_eq!(ArgLocation::Int(2).offset(), 16);
        assert_eq!(ArgLocation::Fp(0).offset(), 48);
        assert_eq!(ArgLocation::Stack(1).offset(), 120);
    }

    #[test]
    fn classifies_registers_then_stack() {
        let layout = NativeCallLayout::new(
            false,
            [
                BasicType::Int,
                BasicType::Long,
                BasicType::Double,
                BasicType::Object,
                BasicType::Char,
                BasicType::Int,
            ],
            BasicType::Void,
        );
        let moves = layout.moves();
        assert_eq!(moves[0], ArgMove { slot: 0, class: ArgClass::Handle, to: ArgLocation::Int(1) });
        assert_eq!(moves[1], ArgMove { slot: 1, class: ArgClass::Int, to: ArgLocation::Int(2) });
        assert_eq!(moves[2], ArgMove { slot: 2, class: ArgClass::Long, to: ArgLocation::Int(3) });
        assert_eq!(moves[3], ArgMove { slot: 4, class: ArgClass::Double, to: ArgLocation::Fp(0) });
        assert_eq!(moves[4], ArgMove { slot: 6, class: ArgClass::Handle, to: ArgLocation::Int(4) });
        assert_eq!(moves[5], ArgMove { slot: 7, class: ArgClass::Int, to: ArgLocation::Int(5) });
        assert_eq!(moves[6], ArgMove { slot: 8, class: ArgClass::Int, to: ArgLocation::Stack(0) });
        assert_eq!(layout.stack_slots(), 1);
        assert_eq!(layout.slots_read(), 9);
    }

    #[test]
    fn slow_handler_marshals_values_and_handles() {
        let m = native("(IFLjava/lang/Object;)J", MethodFlags::STATIC);
        let from = [
            Value::Int(-2).to_slot(),
            Value::Float(1.5).to_slot(),
            Value::NULL.to_slot(),
        ];
        let mut to = OutgoingArgs::default();
        let ret = slow_signature_handler(&m, &from, &mut to).unwrap();
        assert_eq!(ret, BasicType::Long as u64);
        assert_eq!(to.int_regs[2], (-2i64) as u64);
        assert_eq!(to.fp_regs[0], 1.5f32.to_bits() as u64);
        assert_eq!(to.int_regs[3], 0);

        let from = [0, 0, 0x1234];
        slow_signature_handler(&m, &from, &mut to).unwrap();
        assert_eq!(to.int_regs[3], &from[2] as *const u64 as u64);

        let err = slow_signature_handler(&m, &from[..2], &mut to).unwrap_err();
        assert_eq!(err.kind, ExceptionKind::InternalError);
    }

    #[test]
    fn overflow_fingerprint_is_unsupported() {
        let mut generator = X64SignatureGenerator;
        assert!(matches!(
            generator.generate(Fingerprint::OVERFLOW, 1024),
            Err(CodeBufferError::Unsupported(_))
        ));
    }

    #[test]
    fn generator_respects_the_scratch_limit() {
        let sig = Signature::parse(&format!("({})V", "J".repeat(13))).unwrap();
        let fp = Fingerprint::of(&sig, true);
        let mut generator = X64SignatureGenerator;
        assert!(matches!(
            generator.generate(fp, 32),
            Err(CodeBufferError::Assembler(_))
        ));
        assert!(generator.generate(fp, 1024).is_ok());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn generated_handler_matches_slow_handler() {
        type Handler = extern "C" fn(*const u64, *mut OutgoingArgs) -> u64;

        let descriptors = [
            ("(IJ)V", MethodFlags::STATIC),
            ("(BLjava/lang/Object;FD)Z", MethodFlags::empty()),
            ("(IIIIIDDDDDDDD)I", MethodFlags::STATIC),
            ("(JFFFFFFFFF)F", MethodFlags::STATIC),
        ];
        let mut blob = heap::CodeBlob::new(4096).unwrap();
        let mut generator = X64SignatureGenerator;

        for (descriptor, flags) in descriptors {
            let m = native(descriptor, flags);
            let fp = Fingerprint::for_method(&m);
            let code = generator.generate(fp, 1024).unwrap();
            let offset = blob.append(&code).unwrap();
            // SAFETY: the blob holds the complete handler just generated
            let handler: Handler =
                unsafe { std::mem::transmute(blob.entry(offset)) };

            let slots = m.signature().parameter_slots(m.is_static());
            let from: Vec<u64> = (0..slots)
                .map(|i| if i % 3 == 1 { 0 } else { 0xFFFF_FF00 + i as u64 })
                .collect();

            let mut expected = OutgoingArgs::default();
            let expected_ret =
                slow_signature_handler(&m, &from, &mut expected).unwrap();
            let mut actual = Box::<OutgoingArgs>::default();
            let actual_ret = handler(from.as_ptr(), &mut *actual);

            assert_eq!(actual_ret, expected_ret, "{descriptor}");
            assert_eq!(*actual, expected, "{descriptor}");
        }
    }
}
