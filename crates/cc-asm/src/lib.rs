// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Target-generic assembler backends.
//!
//! Each architecture implements the same fragment vocabulary behind the
//! [`Emitter`] trait so the IR compiler never branches on the target. The
//! shared [`EmissionContext`] owns labels, jump patches and the literal,
//! const and BSS data sections; `finalize` lays the sections out after the
//! text and turns every pointer patch into a relocation against load
//! base 0.

pub mod arm64;
mod ctx;
mod printf;
pub mod riscv;
pub mod x86_64;

pub use arm64::Arm64Emitter;
pub use ctx::{EmissionContext, JumpKind, Section};
pub use riscv::{RV64_HALT, Rv64Emitter, RvReg};
pub use x86_64::X86Emitter;

/// Supported CPU architectures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    Aarch64,
    Riscv64,
}

impl Arch {
    /// Host architecture, when it is one we can emit for.
    pub fn host() -> Option<Arch> {
        if cfg!(target_arch = "x86_64") {
            Some(Arch::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Arch::Aarch64)
        } else if cfg!(target_arch = "riscv64") {
            Some(Arch::Riscv64)
        } else {
            None
        }
    }
}

/// Machine register in the target's native numbering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Reg(pub u8);

/// Jump conditions shared by every backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cond {
    Always,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Zero,
    Neg,
    Above,
    Below,
}

/// Two-operand ALU operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Cmp,
}

/// Syscall numbers and constants the printf helper needs per target.
#[derive(Clone, Copy, Debug)]
pub struct SyscallAbi {
    pub write: u64,
    pub openat: u64,
    pub close: u64,
}

/// Finalized machine code for one method or one linked program.
///
/// Every offset in `relocations` points at an 8-byte little-endian field
/// in `code` holding an address relative to load base 0; loaders add the
/// real base. BSS is conceptually appended after `code` and zeroed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AsmProgram {
    pub code: Vec<u8>,
    pub relocations: Vec<u64>,
    pub bss_size: u64,
}

impl AsmProgram {
    /// Copy of `code` with every relocated field rebased to `base`.
    /// BSS keeps its base-0 position directly after `code`, which matches
    /// the single-segment ELF layout.
    pub fn relocated(&self, base: u64) -> Result<Vec<u8>> {
        let mut code = self.code.clone();
        for &offset in &self.relocations {
            let offset = offset as usize;
            let field = code
                .get_mut(offset..offset + 8)
                .ok_or(AsmError::RelocationOutOfRange(offset as u64))?;
            let value = u64::from_le_bytes((&*field).try_into().unwrap());
            field.copy_from_slice(&value.wrapping_add(base).to_le_bytes());
        }
        Ok(code)
    }
}

/// Assembler error type
#[derive(thiserror::Error, Debug)]
pub enum AsmError {
    #[error("unknown label: {0}")]
    UnknownLabel(String),
    #[error("label defined twice: {0}")]
    DuplicateLabel(String),
    #[error("jump displacement out of range for label {0}")]
    JumpOutOfRange(String),
    #[error("relocation offset {0} out of range")]
    RelocationOutOfRange(u64),
    #[error("immediate {0} does not fit the instruction encoding")]
    ImmediateTooLarge(i64),
    #[error("memory displacement {0} not encodable")]
    BadDisplacement(i64),
    #[error("pointers may not reside in bss")]
    PointerInBss,
    #[error("unknown const section entry: {0}")]
    UnknownConst(String),
    #[error("register {0:?} not valid here")]
    BadRegister(Reg),
    #[error("printf format has more %x placeholders than arguments")]
    PrintfArity,
}

pub type Result<T> = std::result::Result<T, AsmError>;

/// The uniform fragment vocabulary. One emitter per method; `finalize`
/// consumes it and yields the method's [`AsmProgram`].
pub trait Emitter {
    fn arch(&self) -> Arch;
    fn ctx(&self) -> &EmissionContext;
    fn ctx_mut(&mut self) -> &mut EmissionContext;

    // ABI description for the IR compiler.
    fn param_regs(&self) -> &'static [Reg];
    fn scratch_regs(&self) -> &'static [Reg];
    fn syscall_num_reg(&self) -> Reg;
    fn syscall_arg_regs(&self) -> &'static [Reg];
    fn return_reg(&self) -> Reg;
    fn stack_pointer(&self) -> Reg;
    /// Caller-saved temporaries the printf expansion may clobber freely.
    fn printf_temp_regs(&self) -> [Reg; 4];
    fn syscall_abi(&self) -> SyscallAbi;

    fn mov_imm(&mut self, dst: Reg, imm: u64) -> Result<()>;
    fn mov_reg(&mut self, dst: Reg, src: Reg) -> Result<()>;
    /// `[base + disp] = src` (64-bit).
    fn mov_to_mem(&mut self, base: Reg, disp: i32, src: Reg) -> Result<()>;
    /// `dst = [base + disp]` (64-bit).
    fn mov_from_mem(&mut self, dst: Reg, base: Reg, disp: i32) -> Result<()>;
    fn alu_reg(&mut self, op: AluOp, dst: Reg, src: Reg) -> Result<()>;
    fn alu_imm(&mut self, op: AluOp, dst: Reg, imm: i64) -> Result<()>;
    fn shl_imm(&mut self, dst: Reg, shift: u8) -> Result<()>;
    fn shr_imm(&mut self, dst: Reg, shift: u8) -> Result<()>;
    fn mul_imm(&mut self, dst: Reg, imm: i64) -> Result<()>;
    /// Set flags from `reg` (AND against itself).
    fn test_zero(&mut self, reg: Reg) -> Result<()>;
    fn call_reg(&mut self, reg: Reg) -> Result<()>;
    fn call_label(&mut self, label: &str) -> Result<()>;
    fn jump_label(&mut self, cond: Cond, label: &str) -> Result<()>;
    fn bind_label(&mut self, label: &str) -> Result<()>;
    fn ret(&mut self) -> Result<()>;
    fn syscall(&mut self) -> Result<()>;
    /// Grow (negative) or shrink (positive) the stack frame.
    fn adjust_sp(&mut self, delta: i64) -> Result<()>;
    /// `dst = sp + disp`.
    fn lea_sp(&mut self, dst: Reg, disp: i32) -> Result<()>;
    /// Pointer to pooled literal bytes.
    fn load_constant_bytes(&mut self, dst: Reg, bytes: &[u8], zero_term: bool) -> Result<()>;
    /// Pointer to a named const-section blob.
    fn load_const_ptr(&mut self, dst: Reg, name: &str) -> Result<()>;
    /// Pointer to a fresh zeroed BSS reservation.
    fn reserve_zero(&mut self, dst: Reg, size: u64) -> Result<()>;
    /// Load a raw 64-bit value through a full 8-byte field so a later
    /// program-link scan can rewrite it in place. Never relocated here.
    fn load_token(&mut self, dst: Reg, token: u64) -> Result<()>;
    /// Store the low byte of `src` to `[base]`.
    fn store_byte(&mut self, base: Reg, src: Reg) -> Result<()>;
    /// Zero-extending byte load from `[base]`.
    fn load_byte(&mut self, dst: Reg, base: Reg) -> Result<()>;

    /// Hex-formatted debug printf via the write syscall, `/dev/kmsg`
    /// fallback on failure. `args` hold the `%x` values.
    fn printf(&mut self, format: &str, args: &[Reg]) -> Result<()>;

    /// Finish the method: flush target state and lay out data sections.
    fn finalize(self) -> Result<AsmProgram>;
}
