// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Debug printf expansion.
//!
//! Lowers `printf(format, args…)` into straight-line code: literal runs
//! are written from the literal section, `%x` arguments are hex-formatted
//! into a stack buffer with leading zeros trimmed, and every write falls
//! back to `/dev/kmsg` when the stdout write syscall fails (early guest
//! init has no usable stdout). Labels are unique per use site via the
//! context's label counter.

use crate::{AluOp, AsmError, Cond, Emitter, Reg, Result};

enum Seg {
    Lit(Vec<u8>),
    Hex(usize),
}

fn parse_format(format: &str, arg_count: usize) -> Result<Vec<Seg>> {
    let mut segs = Vec::new();
    let mut lit = Vec::new();
    let mut next_arg = 0usize;
    let bytes = format.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 1 < bytes.len() && bytes[i + 1] == b'x' {
            if !lit.is_empty() {
                segs.push(Seg::Lit(std::mem::take(&mut lit)));
            }
            if next_arg >= arg_count {
                return Err(AsmError::PrintfArity);
            }
            segs.push(Seg::Hex(next_arg));
            next_arg += 1;
            i += 2;
        } else {
            lit.push(bytes[i]);
            i += 1;
        }
    }
    if !lit.is_empty() {
        segs.push(Seg::Lit(lit));
    }
    Ok(segs)
}

/// Stack frame inside a printf expansion:
/// `[sp+0,16)` hex buffer, `[sp+16]` write pointer, `[sp+24]` write
/// length, args spilled from `[sp+32]` on.
const BUF: i32 = 0;
const PTR: i32 = 16;
const LEN: i32 = 24;
const ARGS: i32 = 32;

pub(crate) fn emit_printf<E: Emitter + ?Sized>(
    e: &mut E,
    format: &str,
    args: &[Reg],
) -> Result<()> {
    let segs = parse_format(format, args.len())?;
    let sp = e.stack_pointer();
    let frame = ((ARGS as usize + 8 * args.len() + 15) & !15) as i64;

    e.adjust_sp(-frame)?;
    for (i, &reg) in args.iter().enumerate() {
        e.mov_to_mem(sp, ARGS + 8 * i as i32, reg)?;
    }

    let [val, digit, ptr, count] = e.printf_temp_regs();
    for seg in &segs {
        match seg {
            Seg::Lit(bytes) => {
                e.load_constant_bytes(ptr, bytes, false)?;
                e.mov_imm(count, bytes.len() as u64)?;
                e.mov_to_mem(sp, PTR, ptr)?;
                e.mov_to_mem(sp, LEN, count)?;
                emit_write(e)?;
            }
            Seg::Hex(arg) => {
                let id = e.ctx_mut().next_label_id();
                let l_conv = format!(".pf{}_conv", id);
                let l_store = format!(".pf{}_store", id);
                let l_trim = format!(".pf{}_trim", id);
                let l_done = format!(".pf{}_done", id);

                e.mov_from_mem(val, sp, ARGS + 8 * *arg as i32)?;
                // Fill the 16-digit buffer from its end.
                e.lea_sp(ptr, BUF + 16)?;
                e.mov_imm(count, 16)?;
                e.bind_label(&l_conv)?;
                e.mov_reg(digit, val)?;
                e.alu_imm(AluOp::And, digit, 0xf)?;
                e.alu_imm(AluOp::Add, digit, b'0' as i64)?;
                e.alu_imm(AluOp::Cmp, digit, b'9' as i64)?;
                e.jump_label(Cond::Le, &l_store)?;
                e.alu_imm(AluOp::Add, digit, (b'a' - b'0' - 10) as i64)?;
                e.bind_label(&l_store)?;
                e.alu_imm(AluOp::Sub, ptr, 1)?;
                e.store_byte(ptr, digit)?;
                e.shr_imm(val, 4)?;
                e.alu_imm(AluOp::Sub, count, 1)?;
                e.alu_imm(AluOp::Cmp, count, 0)?;
                e.jump_label(Cond::Gt, &l_conv)?;

                // Trim leading zeros, keeping at least one digit.
                e.lea_sp(ptr, BUF)?;
                e.mov_imm(count, 16)?;
                e.bind_label(&l_trim)?;
                e.alu_imm(AluOp::Cmp, count, 1)?;
                e.jump_label(Cond::Le, &l_done)?;
                e.load_byte(digit, ptr)?;
                e.alu_imm(AluOp::Cmp, digit, b'0' as i64)?;
                e.jump_label(Cond::Ne, &l_done)?;
                e.alu_imm(AluOp::Add, ptr, 1)?;
                e.alu_imm(AluOp::Sub, count, 1)?;
                e.jump_label(Cond::Always, &l_trim)?;
                e.bind_label(&l_done)?;

                e.mov_to_mem(sp, PTR, ptr)?;
                e.mov_to_mem(sp, LEN, count)?;
                emit_write(e)?;
            }
        }
    }

    e.adjust_sp(frame)?;
    Ok(())
}

/// Write `[sp+PTR]..+[sp+LEN]` to stdout; on failure, retry via
/// `openat(AT_FDCWD, "/dev/kmsg", O_WRONLY)`.
fn emit_write<E: Emitter + ?Sized>(e: &mut E) -> Result<()> {
    let id = e.ctx_mut().next_label_id();
    let l_ok = format!(".pfw{}_ok", id);

    let abi = e.syscall_abi();
    let a = e.syscall_arg_regs();
    let num = e.syscall_num_reg();
    let ret = e.return_reg();
    let sp = e.stack_pointer();
    let fd_save = e.printf_temp_regs()[0];

    e.mov_imm(a[0], 1)?;
    e.mov_from_mem(a[1], sp, PTR)?;
    e.mov_from_mem(a[2], sp, LEN)?;
    e.mov_imm(num, abi.write)?;
    e.syscall()?;
    e.test_zero(ret)?;
    e.jump_label(Cond::Ge, &l_ok)?;

    // AT_FDCWD = -100
    e.mov_imm(a[0], (-100i64) as u64)?;
    e.load_constant_bytes(a[1], b"/dev/kmsg", true)?;
    e.mov_imm(a[2], 1)?; // O_WRONLY
    e.mov_imm(num, abi.openat)?;
    e.syscall()?;
    e.test_zero(ret)?;
    e.jump_label(Cond::Neg, &l_ok)?;

    e.mov_reg(fd_save, ret)?;
    e.mov_reg(a[0], fd_save)?;
    e.mov_from_mem(a[1], sp, PTR)?;
    e.mov_from_mem(a[2], sp, LEN)?;
    e.mov_imm(num, abi.write)?;
    e.syscall()?;

    e.mov_reg(a[0], fd_save)?;
    e.mov_imm(num, abi.close)?;
    e.syscall()?;

    e.bind_label(&l_ok)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x86_64::{RDI, X86Emitter};
    use crate::{Arm64Emitter, Emitter};

    #[test]
    fn literal_only_format_emits_one_write() {
        let mut e = X86Emitter::new();
        e.printf("boot ok\n", &[]).unwrap();
        e.ret().unwrap();
        let program = e.finalize().unwrap();
        // One literal pointer, one /dev/kmsg pointer.
        assert_eq!(program.relocations.len(), 2);
    }

    #[test]
    fn hex_segments_expand_per_use_site() {
        let mut e = X86Emitter::new();
        e.printf("a=%x b=%x\n", &[RDI, RDI]).unwrap();
        e.printf("c=%x\n", &[RDI]).unwrap();
        e.ret().unwrap();
        // Distinct label ids per use site keep binding from colliding.
        assert!(e.finalize().is_ok());
    }

    #[test]
    fn arity_mismatch_is_an_error() {
        let mut e = X86Emitter::new();
        assert!(matches!(
            e.printf("x=%x\n", &[]),
            Err(AsmError::PrintfArity)
        ));
    }

    #[test]
    fn arm64_printf_assembles() {
        let mut e = Arm64Emitter::new();
        e.printf("v=%x\n", &[crate::arm64::X0]).unwrap();
        e.ret().unwrap();
        let program = e.finalize().unwrap();
        assert!(program.code.len() % 4 == 0 || !program.code.is_empty());
        assert!(!program.relocations.is_empty());
    }
}
