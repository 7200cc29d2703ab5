// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Target-generic intermediate representation and its compiler.
//!
//! A program is a set of named methods plus global reservations; a method
//! is an ordered list of fragments over symbolic variables. The compiler
//! lowers fragments through the uniform assembler vocabulary, so adding a
//! target is an assembler concern, not an IR one. Cross-method and global
//! references are deferred through 48-bit hash tokens resolved by the
//! program linker.

mod compile;
mod interp;
mod link;
mod program;
mod validate;

pub use compile::compile_method;
pub use interp::interpret;
pub use link::{compile_standalone_program, fnv1a_64, global_token, is_token, method_token};
pub use program::{CmpOp, CondExpr, Expr, Global, Method, Program, Stmt};
pub use validate::validate_program;

use cc_asm::AsmError;

/// IR compiler error type
#[derive(thiserror::Error, Debug)]
pub enum IrError {
    #[error("assembler error: {0}")]
    Asm(#[from] AsmError),
    #[error("unknown variable: {0}")]
    UnknownVariable(String),
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error("unknown global: {0}")]
    UnknownGlobal(String),
    #[error("unknown stack slot: {0}")]
    UnknownSlot(String),
    #[error("stack slot {slot} access at {disp}+8 exceeds size {size}")]
    SlotOutOfBounds { slot: String, disp: u64, size: u64 },
    #[error("too many parameters: {0} exceeds the argument registers")]
    TooManyParams(usize),
    #[error("too many syscall arguments: {0}")]
    TooManySyscallArgs(usize),
    #[error("expression too deep: out of scratch registers")]
    RegistersExhausted,
    #[error("raw fragment targets {0:?}, compiling for {1:?}")]
    RawArchMismatch(cc_asm::Arch, cc_asm::Arch),
    #[error("entrypoint method not found: {0}")]
    MissingEntrypoint(String),
    #[error("method {method}: label {label} bound twice")]
    DuplicateLabel { method: String, label: String },
    #[error("method {method}: goto targets undefined label {label}")]
    UndefinedLabel { method: String, label: String },
    #[error("unresolved link token {token:#018x} at code offset {at}")]
    UnresolvedToken { token: u64, at: usize },
    #[error("architecture {0:?} is not supported by the IR compiler")]
    UnsupportedArch(cc_asm::Arch),
    #[error("fragment not supported by the reference interpreter")]
    Uninterpretable,
    #[error("interpreter exceeded step budget")]
    StepBudget,
    #[error("interpreter fell through without a return")]
    NoReturn,
}

pub type Result<T> = std::result::Result<T, IrError>;
