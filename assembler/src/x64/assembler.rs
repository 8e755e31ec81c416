use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AssemblerError {
    #[error("cannot finalize empty function")]
    EmptyFunction,
    #[error("code buffer overflow: {needed} bytes emitted, limit is {limit}")]
    BufferOverflow { needed: usize, limit: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Reg {
    #[inline]
    fn enc(self) -> u8 {
        self as u8
    }

    #[inline]
    fn low3(self) -> u8 {
        self.enc() & 0b111
    }

    #[inline]
    fn high(self) -> bool {
        (self.enc() & 0b1000) != 0
    }
}

/// `[base + disp]` memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Reg,
    pub disp: i32,
}

impl Mem {
    pub const fn new(base: Reg, disp: i32) -> Self {
        Self { base, disp }
    }
}

/// Emits x86-64 machine code into a growable byte buffer.
///
/// The output is position independent: there are no absolute addresses and
/// no relocations, so finalized bytes can be copied anywhere.
pub struct Assembler {
    name: String,
    bytes: Vec<u8>,
    limit: usize,
}

impl Assembler {
    pub fn new() -> Self {
        Self::with_name("<anonymous>")
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self::with_limit(name, usize::MAX)
    }

    /// An assembler whose output may not exceed `limit` bytes.
    pub fn with_limit(name: impl Into<String>, limit: usize) -> Self {
        Self {
            name: name.into(),
            bytes: Vec::new(),
            limit,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn mov_ri64(&mut self, dst: Reg, imm: i64) {
        self.emit_rex(true, false, false, dst.high());
        self.emit_u8(0xB8 + dst.low3());
        self.emit_u64(imm as u64);
    }

    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex(true, src.high(), false, dst.high());
        self.emit_u8(0x89);
        self.emit_modrm(0b11, src.low3(), dst.low3());
    }

    /// `mov dst, qword [mem]`
    pub fn mov_rm64(&mut self, dst: Reg, src: Mem) {
        self.emit_rex(true, dst.high(), false, src.base.high());
        self.emit_u8(0x8B);
        self.emit_mem(dst.low3(), src);
    }

    /// `mov dst32, dword [mem]`, zero-extending into the full register.
    pub fn mov_rm32(&mut self, dst: Reg, src: Mem) {
        self.emit_rex(false, dst.high(), false, src.base.high());
        self.emit_u8(0x8B);
        self.emit_mem(dst.low3(), src);
    }

    /// `movsxd dst, dword [mem]`
    pub fn movsxd_rm(&mut self, dst: Reg, src: Mem) {
        self.emit_rex(true, dst.high(), false, src.base.high());
        self.emit_u8(0x63);
        self.emit_mem(dst.low3(), src);
    }

    /// `mov qword [mem], src`
    pub fn mov_mr64(&mut self, dst: Mem, src: Reg) {
        self.emit_rex(true, src.high(), false, dst.base.high());
        self.emit_u8(0x89);
        self.emit_mem(src.low3(), dst);
    }

    pub fn lea(&mut self, dst: Reg, src: Mem) {
        self.emit_rex(true, dst.high(), false, src.base.high());
        self.emit_u8(0x8D);
        self.emit_mem(dst.low3(), src);
    }

    /// `xor dst32, src32`, the usual way to zero a register.
    pub fn xor_rr32(&mut self, dst: Reg, src: Reg) {
        self.emit_rex(false, src.high(), false, dst.high());
        self.emit_u8(0x31);
        self.emit_modrm(0b11, src.low3(), dst.low3());
    }

    /// `cmp qword [mem], imm8`
    pub fn cmp_mi8(&mut self, lhs: Mem, imm: i8) {
        self.emit_rex(true, false, false, lhs.base.high());
        self.emit_u8(0x83);
        self.emit_mem(0b111, lhs);
        self.emit_u8(imm as u8);
    }

    /// `cmove dst, src`
    pub fn cmove(&mut self, dst: Reg, src: Reg) {
        self.emit_rex(true, dst.high(), false, src.high());
        self.emit_u8(0x0F);
        self.emit_u8(0x44);
        self.emit_modrm(0b11, dst.low3(), src.low3());
    }

    pub fn ret(&mut self) {
        self.emit_u8(0xC3);
    }

    pub fn finalize(self) -> Result<AssembledCode, AssemblerError> {
        if self.bytes.is_empty() {
            return Err(AssemblerError::EmptyFunction);
        }
        if self.bytes.len() > self.limit {
            return Err(AssemblerError::BufferOverflow {
                needed: self.bytes.len(),
                limit: self.limit,
            });
        }
        Ok(AssembledCode {
            name: self.name,
            bytes: self.bytes,
        })
    }

    #[inline]
    fn emit_u8(&mut self, v: u8) {
        self.bytes.push(v);
    }

    #[inline]
    fn emit_u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn emit_u64(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn emit_modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        debug_assert!(mode < 4);
        debug_assert!(reg < 8);
        debug_assert!(rm < 8);
        self.emit_u8((mode << 6) | ((reg & 7) << 3) | (rm & 7));
    }

    /// ModRM (+ SIB) + disp32 for `[base + disp]`. rsp/r12 as base need a SIB
    /// byte; mod=10 always carries a displacement so rbp/r13 need nothing.
    #[inline]
    fn emit_mem(&mut self, reg: u8, mem: Mem) {
        self.emit_modrm(0b10, reg, mem.base.low3());
        if mem.base.low3() == 0b100 {
            self.emit_u8(0x24);
        }
        self.emit_u32(mem.disp as u32);
    }

    #[inline]
    fn emit_rex(&mut self, w: bool, r: bool, x: bool, b: bool) {
        let rex = 0x40
            | ((w as u8) << 3)
            | ((r as u8) << 2)
            | ((x as u8) << 1)
            | (b as u8);
        if rex != 0x40 {
            self.emit_u8(rex);
        }
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Finalized, relocatable machine code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledCode {
    name: String,
    bytes: Vec<u8>,
}

impl AssembledCode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn machine_code(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_one_insn(emit: impl FnOnce(&mut Assembler)) -> Vec<u8> {
        let mut a = Assembler::with_name("single");
        emit(&mut a);
        a.ret();
        a.finalize().expect("finalize").into_bytes()
    }

    #[test]
    fn encodes_mov_ri64() {
        let bytes =
            compile_one_insn(|a| a.mov_ri64(Reg::Rax, 0x1122_3344_5566_7788));
        assert_eq!(bytes[0], 0x48);
        assert_eq!(bytes[1], 0xB8);
        assert_eq!(
            &bytes[2..10],
            &[0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
        assert_eq!(bytes[10], 0xC3);
    }

    #[test]
    fn encodes_mov_rr_with_rex() {
        let bytes = compile_one_insn(|a| a.mov_rr(Reg::R8, Reg::R15));
        assert_eq!(&bytes[0..3], &[0x4D, 0x89, 0xF8]);
    }

    #[test]
    fn encodes_loads() {
        let bytes = compile_one_insn(|a| a.mov_rm64(Reg::Rax, Mem::new(Reg::Rdi, 8)));
        assert_eq!(&bytes[0..7], &[0x48, 0x8B, 0x87, 8, 0, 0, 0]);

        let bytes = compile_one_insn(|a| a.mov_rm32(Reg::Rax, Mem::new(Reg::Rdi, 16)));
        assert_eq!(&bytes[0..6], &[0x8B, 0x87, 16, 0, 0, 0]);

        let bytes = compile_one_insn(|a| a.movsxd_rm(Reg::Rax, Mem::new(Reg::Rdi, 0)));
        assert_eq!(&bytes[0..7], &[0x48, 0x63, 0x87, 0, 0, 0, 0]);
    }

    #[test]
    fn encodes_store_with_extended_registers() {
        let bytes =
            compile_one_insn(|a| a.mov_mr64(Mem::new(Reg::R11, -8), Reg::R9));
        assert_eq!(&bytes[0..7], &[0x4D, 0x89, 0x8B, 0xF8, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn rsp_and_r12_bases_need_sib() {
        let bytes = compile_one_insn(|a| a.lea(Reg::Rax, Mem::new(Reg::Rsp, 0)));
        assert_eq!(&bytes[0..8], &[0x48, 0x8D, 0x84, 0x24, 0, 0, 0, 0]);

        let bytes = compile_one_insn(|a| a.mov_rm64(Reg::Rcx, Mem::new(Reg::R12, 4)));
        assert_eq!(&bytes[0..8], &[0x49, 0x8B, 0x8C, 0x24, 4, 0, 0, 0]);
    }

    #[test]
    fn encodes_null_check_sequence() {
        let bytes = compile_one_insn(|a| {
            a.xor_rr32(Reg::Rcx, Reg::Rcx);
            a.cmp_mi8(Mem::new(Reg::Rdi, 0), 0);
            a.cmove(Reg::Rax, Reg::Rcx);
        });
        assert_eq!(&bytes[0..2], &[0x31, 0xC9]);
        assert_eq!(&bytes[2..10], &[0x48, 0x83, 0xBF, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[10..14], &[0x48, 0x0F, 0x44, 0xC1]);
    }

    #[test]
    fn empty_function_errors() {
        let a = Assembler::with_name("empty");
        let err = a.finalize().expect_err("finalize should fail");
        assert!(matches!(err, AssemblerError::EmptyFunction));
    }

    #[test]
    fn limit_is_enforced_on_finalize() {
        let mut a = Assembler::with_limit("tiny", 4);
        a.mov_ri64(Reg::Rax, 1);
        a.ret();
        assert_eq!(
            a.finalize(),
            Err(AssemblerError::BufferOverflow { needed: 11, limit: 4 })
        );
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn execute_copied_into_code_blob() {
        let mut a = Assembler::with_name("copy");
        // *rsi = *rdi; return 42
        a.mov_rm64(Reg::Rax, Mem::new(Reg::Rdi, 0));
        a.mov_mr64(Mem::new(Reg::Rsi, 0), Reg::Rax);
        a.mov_ri64(Reg::Rax, 42);
        a.ret();
        let code = a.finalize().expect("finalize");

        let mut blob = heap::CodeBlob::new(64).expect("blob");
        let offset = blob.append(code.machine_code()).expect("append");
        let f: extern "C" fn(*const u64, *mut u64) -> u64 =
            unsafe { std::mem::transmute(blob.entry(offset)) };

        let src = 7u64;
        let mut dst = 0u64;
        assert_eq!(f(&src, &mut dst), 42);
        assert_eq!(dst, 7);
    }
}
