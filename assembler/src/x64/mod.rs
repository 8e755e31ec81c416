mod assembler;

pub use assembler::{AssembledCode, Assembler, AssemblerError, Mem, Reg};
