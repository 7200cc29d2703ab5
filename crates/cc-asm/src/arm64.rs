// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! AArch64 (A64) instruction encoder.
//!
//! Wide immediates use MOVZ/MOVK chains. Address materialization never
//! uses ADRP: every pointer load goes through a literal pool of 8-byte
//! absolute slots appended after the text, loaded with PC-relative LDR.
//! Pool slots holding section pointers become relocations; slots holding
//! link tokens stay raw for the program linker to rewrite.

use std::collections::HashMap;

use crate::ctx::{EmissionContext, JumpKind, Section};
use crate::{AluOp, Arch, AsmError, AsmProgram, Cond, Emitter, Reg, Result, SyscallAbi};

pub const X0: Reg = Reg(0);
pub const X1: Reg = Reg(1);
pub const X2: Reg = Reg(2);
pub const X3: Reg = Reg(3);
pub const X4: Reg = Reg(4);
pub const X5: Reg = Reg(5);
pub const X6: Reg = Reg(6);
pub const X7: Reg = Reg(7);
pub const X8: Reg = Reg(8);
pub const X9: Reg = Reg(9);
pub const X10: Reg = Reg(10);
pub const X11: Reg = Reg(11);
pub const X12: Reg = Reg(12);
pub const X13: Reg = Reg(13);
pub const X14: Reg = Reg(14);
pub const X15: Reg = Reg(15);
/// Intra-procedure scratch, reserved for immediate materialization.
const X16: Reg = Reg(16);
pub const SP: Reg = Reg(31);

const PARAM_REGS: &[Reg] = &[X0, X1, X2, X3, X4, X5, X6, X7];
const SCRATCH_REGS: &[Reg] = &[X9, X10, X11, X12, X13, X14, X15];
const SYSCALL_ARG_REGS: &[Reg] = &[X0, X1, X2, X3, X4, X5];

fn cond_code(cond: Cond) -> Option<u32> {
    Some(match cond {
        Cond::Always => return None,
        Cond::Eq | Cond::Zero => 0b0000,
        Cond::Ne => 0b0001,
        Cond::Below => 0b0011,
        Cond::Neg => 0b0100,
        Cond::Above => 0b1000,
        Cond::Ge => 0b1010,
        Cond::Lt => 0b1011,
        Cond::Gt => 0b1100,
        Cond::Le => 0b1101,
    })
}

/// What an 8-byte literal-pool slot will contain.
#[derive(Clone, PartialEq, Eq, Hash)]
enum PoolValue {
    /// Raw 64-bit value, left untouched by relocation (link tokens).
    Raw(u64),
    /// Absolute pointer into a data section, relocated at load time.
    Ptr(Section, u64),
}

pub struct Arm64Emitter {
    ctx: EmissionContext,
    pool: Vec<PoolValue>,
    pool_index: HashMap<PoolValue, usize>,
    /// `(text position of LDR, pool slot)` fixed up when the pool flushes.
    pool_loads: Vec<(usize, usize)>,
}

impl Default for Arm64Emitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Arm64Emitter {
    pub fn new() -> Self {
        Arm64Emitter {
            ctx: EmissionContext::new(),
            pool: Vec::new(),
            pool_index: HashMap::new(),
            pool_loads: Vec::new(),
        }
    }

    fn check_reg(reg: Reg) -> Result<u32> {
        if reg.0 > 30 {
            return Err(AsmError::BadRegister(reg));
        }
        Ok(reg.0 as u32)
    }

    fn check_reg_or_sp(reg: Reg) -> Result<u32> {
        if reg.0 > 31 {
            return Err(AsmError::BadRegister(reg));
        }
        Ok(reg.0 as u32)
    }

    /// PC-relative 64-bit LDR from a pool slot emitted at flush time.
    fn load_pool(&mut self, dst: Reg, value: PoolValue) -> Result<()> {
        let dst = Self::check_reg(dst)?;
        let slot = match self.pool_index.get(&value) {
            Some(&slot) => slot,
            None => {
                let slot = self.pool.len();
                self.pool.push(value.clone());
                self.pool_index.insert(value, slot);
                slot
            }
        };
        let at = self.ctx.text_len();
        self.ctx.emit_u32(0x5800_0000 | dst);
        self.pool_loads.push((at, slot));
        Ok(())
    }

    /// Append the pool after the text and resolve every pending LDR.
    fn flush_pool(&mut self) -> Result<()> {
        if self.pool.is_empty() {
            return Ok(());
        }
        while self.ctx.text_len() % 8 != 0 {
            self.ctx.emit_u32(0);
        }
        let mut slot_positions = Vec::with_capacity(self.pool.len());
        let pool = std::mem::take(&mut self.pool);
        for value in &pool {
            let at = self.ctx.text_len();
            slot_positions.push(at);
            match value {
                PoolValue::Raw(v) => self.ctx.emit_u64(*v),
                PoolValue::Ptr(section, offset) => {
                    self.ctx.emit_u64(0);
                    self.ctx.add_text_pointer_patch(at, *section, *offset);
                }
            }
        }
        for (ldr_at, slot) in std::mem::take(&mut self.pool_loads) {
            let disp = slot_positions[slot] as i64 - ldr_at as i64;
            let words = disp / 4;
            if disp % 4 != 0 || words >= 1 << 18 || words < -(1 << 18) {
                return Err(AsmError::JumpOutOfRange(format!("pool slot {}", slot)));
            }
            let word = 0x5800_0000 | (((words as u32) & 0x0007_ffff) << 5) | pool_rt(&self.ctx, ldr_at);
            self.ctx.patch_u32(ldr_at, word);
        }
        Ok(())
    }
}

/// Destination register of the placeholder LDR previously emitted at `at`.
fn pool_rt(ctx: &EmissionContext, at: usize) -> u32 {
    let word = u32::from_le_bytes(ctx.text()[at..at + 4].try_into().unwrap());
    word & 0x1f
}

impl Emitter for Arm64Emitter {
    fn arch(&self) -> Arch {
        Arch::Aarch64
    }

    fn ctx(&self) -> &EmissionContext {
        &self.ctx
    }

    fn ctx_mut(&mut self) -> &mut EmissionContext {
        &mut self.ctx
    }

    fn param_regs(&self) -> &'static [Reg] {
        PARAM_REGS
    }

    fn scratch_regs(&self) -> &'static [Reg] {
        SCRATCH_REGS
    }

    fn syscall_num_reg(&self) -> Reg {
        X8
    }

    fn syscall_arg_regs(&self) -> &'static [Reg] {
        SYSCALL_ARG_REGS
    }

    fn return_reg(&self) -> Reg {
        X0
    }

    fn stack_pointer(&self) -> Reg {
        SP
    }

    fn printf_temp_regs(&self) -> [Reg; 4] {
        [X9, X10, X11, X12]
    }

    fn syscall_abi(&self) -> SyscallAbi {
        SyscallAbi {
            write: 64,
            openat: 56,
            close: 57,
        }
    }

    fn mov_imm(&mut self, dst: Reg, imm: u64) -> Result<()> {
        let dst = Self::check_reg(dst)?;
        // MOVZ for the low half-word, MOVK for every further non-zero one.
        self.ctx.emit_u32(0xd280_0000 | (((imm & 0xffff) as u32) << 5) | dst);
        for hw in 1..4u32 {
            let chunk = (imm >> (hw * 16)) & 0xffff;
            if chunk != 0 {
                self.ctx.emit_u32(0xf280_0000 | (hw << 21) | ((chunk as u32) << 5) | dst);
            }
        }
        Ok(())
    }

    fn mov_reg(&mut self, dst: Reg, src: Reg) -> Result<()> {
        let (dst, src) = (Self::check_reg(dst)?, Self::check_reg(src)?);
        // ORR dst, xzr, src
        self.ctx.emit_u32(0xaa00_03e0 | (src << 16) | dst);
        Ok(())
    }

    fn mov_to_mem(&mut self, base: Reg, disp: i32, src: Reg) -> Result<()> {
        let (base, src) = (Self::check_reg_or_sp(base)?, Self::check_reg(src)?);
        let imm = scaled_offset(disp)?;
        self.ctx.emit_u32(0xf900_0000 | (imm << 10) | (base << 5) | src);
        Ok(())
    }

    fn mov_from_mem(&mut self, dst: Reg, base: Reg, disp: i32) -> Result<()> {
        let (base, dst) = (Self::check_reg_or_sp(base)?, Self::check_reg(dst)?);
        let imm = scaled_offset(disp)?;
        self.ctx.emit_u32(0xf940_0000 | (imm << 10) | (base << 5) | dst);
        Ok(())
    }

    fn alu_reg(&mut self, op: AluOp, dst: Reg, src: Reg) -> Result<()> {
        let (dst, src) = (Self::check_reg(dst)?, Self::check_reg(src)?);
        let word = match op {
            AluOp::Add => 0x8b00_0000 | (src << 16) | (dst << 5) | dst,
            AluOp::Sub => 0xcb00_0000 | (src << 16) | (dst << 5) | dst,
            AluOp::And => 0x8a00_0000 | (src << 16) | (dst << 5) | dst,
            AluOp::Or => 0xaa00_0000 | (src << 16) | (dst << 5) | dst,
            AluOp::Xor => 0xca00_0000 | (src << 16) | (dst << 5) | dst,
            // SUBS xzr, dst, src
            AluOp::Cmp => 0xeb00_001f | (src << 16) | (dst << 5),
        };
        self.ctx.emit_u32(word);
        Ok(())
    }

    fn alu_imm(&mut self, op: AluOp, dst: Reg, imm: i64) -> Result<()> {
        match op {
            AluOp::Add | AluOp::Sub => {
                let dst = Self::check_reg_or_sp(dst)?;
                let (mut op, mut left) = (op, imm);
                if left < 0 {
                    op = if op == AluOp::Add { AluOp::Sub } else { AluOp::Add };
                    left = -left;
                }
                let base: u32 = if op == AluOp::Add { 0x9100_0000 } else { 0xd100_0000 };
                let mut left = left as u64;
                loop {
                    let chunk = left.min(4095) as u32;
                    self.ctx.emit_u32(base | (chunk << 10) | (dst << 5) | dst);
                    left -= chunk as u64;
                    if left == 0 {
                        break;
                    }
                }
                Ok(())
            }
            AluOp::Cmp => {
                let rn = Self::check_reg(dst)?;
                if (0..=4095).contains(&imm) {
                    // SUBS xzr, dst, #imm
                    self.ctx.emit_u32(0xf100_001f | ((imm as u32) << 10) | (rn << 5));
                    Ok(())
                } else {
                    self.mov_imm(X16, imm as u64)?;
                    self.alu_reg(AluOp::Cmp, dst, X16)
                }
            }
            AluOp::And | AluOp::Or | AluOp::Xor => {
                // Bitmask immediates are not worth encoding here; go
                // through the reserved scratch register.
                self.mov_imm(X16, imm as u64)?;
                self.alu_reg(op, dst, X16)
            }
        }
    }

    fn shl_imm(&mut self, dst: Reg, shift: u8) -> Result<()> {
        let dst = Self::check_reg(dst)?;
        let shift = (shift & 63) as u32;
        let immr = (64 - shift) % 64;
        let imms = 63 - shift;
        self.ctx.emit_u32(0xd340_0000 | (immr << 16) | (imms << 10) | (dst << 5) | dst);
        Ok(())
    }

    fn shr_imm(&mut self, dst: Reg, shift: u8) -> Result<()> {
        let dst = Self::check_reg(dst)?;
        let shift = (shift & 63) as u32;
        self.ctx.emit_u32(0xd340_0000 | (shift << 16) | (63 << 10) | (dst << 5) | dst);
        Ok(())
    }

    fn mul_imm(&mut self, dst: Reg, imm: i64) -> Result<()> {
        let rd = Self::check_reg(dst)?;
        self.mov_imm(X16, imm as u64)?;
        // MADD dst, dst, x16, xzr
        self.ctx.emit_u32(0x9b00_7c00 | ((X16.0 as u32) << 16) | (rd << 5) | rd);
        Ok(())
    }

    fn test_zero(&mut self, reg: Reg) -> Result<()> {
        let reg = Self::check_reg(reg)?;
        // ANDS xzr, reg, reg
        self.ctx.emit_u32(0xea00_001f | (reg << 16) | (reg << 5));
        Ok(())
    }

    fn call_reg(&mut self, reg: Reg) -> Result<()> {
        let reg = Self::check_reg(reg)?;
        self.ctx.emit_u32(0xd63f_0000 | (reg << 5));
        Ok(())
    }

    fn call_label(&mut self, label: &str) -> Result<()> {
        let at = self.ctx.text_len();
        self.ctx.emit_u32(0x9400_0000);
        self.ctx.add_jump_patch(at, label, JumpKind::Arm64Imm26);
        Ok(())
    }

    fn jump_label(&mut self, cond: Cond, label: &str) -> Result<()> {
        let at = self.ctx.text_len();
        match cond_code(cond) {
            None => {
                self.ctx.emit_u32(0x1400_0000);
                self.ctx.add_jump_patch(at, label, JumpKind::Arm64Imm26);
            }
            Some(cc) => {
                self.ctx.emit_u32(0x5400_0000 | cc);
                self.ctx.add_jump_patch(at, label, JumpKind::Arm64Imm19);
            }
        }
        Ok(())
    }

    fn bind_label(&mut self, label: &str) -> Result<()> {
        self.ctx.bind_label(label)
    }

    fn ret(&mut self) -> Result<()> {
        self.ctx.emit_u32(0xd65f_03c0);
        Ok(())
    }

    fn syscall(&mut self) -> Result<()> {
        // SVC #0
        self.ctx.emit_u32(0xd400_0001);
        Ok(())
    }

    fn adjust_sp(&mut self, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        if delta < 0 {
            self.alu_imm(AluOp::Sub, SP, -delta)
        } else {
            self.alu_imm(AluOp::Add, SP, delta)
        }
    }

    fn lea_sp(&mut self, dst: Reg, disp: i32) -> Result<()> {
        let dst = Self::check_reg(dst)?;
        if !(0..=4095).contains(&disp) {
            return Err(AsmError::BadDisplacement(disp as i64));
        }
        // ADD dst, sp, #disp
        self.ctx.emit_u32(0x9100_0000 | ((disp as u32) << 10) | (31 << 5) | dst);
        Ok(())
    }

    fn load_constant_bytes(&mut self, dst: Reg, bytes: &[u8], zero_term: bool) -> Result<()> {
        let off = self.ctx.add_literal(bytes, zero_term);
        self.load_pool(dst, PoolValue::Ptr(Section::Literal, off))
    }

    fn load_const_ptr(&mut self, dst: Reg, name: &str) -> Result<()> {
        let off = self.ctx.const_offset(name)?;
        self.load_pool(dst, PoolValue::Ptr(Section::Const, off))
    }

    fn reserve_zero(&mut self, dst: Reg, size: u64) -> Result<()> {
        let off = self.ctx.reserve_bss(size);
        self.load_pool(dst, PoolValue::Ptr(Section::Bss, off))
    }

    fn load_token(&mut self, dst: Reg, token: u64) -> Result<()> {
        self.load_pool(dst, PoolValue::Raw(token))
    }

    fn store_byte(&mut self, base: Reg, src: Reg) -> Result<()> {
        let (base, src) = (Self::check_reg_or_sp(base)?, Self::check_reg(src)?);
        self.ctx.emit_u32(0x3900_0000 | (base << 5) | src);
        Ok(())
    }

    fn load_byte(&mut self, dst: Reg, base: Reg) -> Result<()> {
        let (base, dst) = (Self::check_reg_or_sp(base)?, Self::check_reg(dst)?);
        self.ctx.emit_u32(0x3940_0000 | (base << 5) | dst);
        Ok(())
    }

    fn printf(&mut self, format: &str, args: &[Reg]) -> Result<()> {
        crate::printf::emit_printf(self, format, args)
    }

    fn finalize(mut self) -> Result<AsmProgram> {
        self.flush_pool()?;
        self.ctx.finalize()
    }
}

fn scaled_offset(disp: i32) -> Result<u32> {
    if disp < 0 || disp % 8 != 0 || disp / 8 >= 4096 {
        return Err(AsmError::BadDisplacement(disp as i64));
    }
    Ok((disp / 8) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(f: impl FnOnce(&mut Arm64Emitter)) -> Vec<u32> {
        let mut e = Arm64Emitter::new();
        f(&mut e);
        e.ctx()
            .text()
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn movz_movk_chain() {
        // mov x0, #1
        assert_eq!(words(|e| e.mov_imm(X0, 1).unwrap()), [0xd280_0020]);
        // mov x8, #93 (exit)
        assert_eq!(words(|e| e.mov_imm(X8, 93).unwrap()), [0xd280_0ba8]);
        // 0x1111000000002222: movz for the low half, movk only for hw3
        let w = words(|e| e.mov_imm(X1, 0x1111_0000_0000_2222).unwrap());
        assert_eq!(w.len(), 2);
        assert_eq!(w[0], 0xd280_0000 | (0x2222 << 5) | 1);
        assert_eq!(w[1], 0xf280_0000 | (3 << 21) | (0x1111 << 5) | 1);
    }

    #[test]
    fn loads_and_stores() {
        // str x0, [sp, #16]
        assert_eq!(words(|e| e.mov_to_mem(SP, 16, X0).unwrap()), [0xf900_0be0]);
        // ldr x1, [sp]
        assert_eq!(words(|e| e.mov_from_mem(X1, SP, 0).unwrap()), [0xf940_03e1]);
        assert!(matches!(
            {
                let mut e = Arm64Emitter::new();
                e.mov_to_mem(SP, 12, X0)
            },
            Err(AsmError::BadDisplacement(12))
        ));
    }

    #[test]
    fn alu_and_flags() {
        // add x0, x0, x1
        assert_eq!(words(|e| e.alu_reg(AluOp::Add, X0, X1).unwrap()), [0x8b01_0000]);
        // cmp x2, x3 == subs xzr, x2, x3
        assert_eq!(words(|e| e.alu_reg(AluOp::Cmp, X2, X3).unwrap()), [0xeb03_005f]);
        // sub sp, sp, #32
        assert_eq!(words(|e| e.adjust_sp(-32).unwrap()), [0xd100_83ff]);
        // tst x4, x4
        assert_eq!(words(|e| e.test_zero(X4).unwrap()), [0xea04_009f]);
    }

    #[test]
    fn control_flow_words() {
        assert_eq!(words(|e| e.ret().unwrap()), [0xd65f_03c0]);
        assert_eq!(words(|e| e.syscall().unwrap()), [0xd400_0001]);
        assert_eq!(words(|e| e.call_reg(X9).unwrap()), [0xd63f_0120]);
    }

    #[test]
    fn backward_branch_resolves() {
        let mut e = Arm64Emitter::new();
        e.bind_label("top").unwrap();
        e.mov_imm(X0, 0).unwrap();
        e.jump_label(Cond::Always, "top").unwrap();
        let program = e.finalize().unwrap();
        let word = u32::from_le_bytes(program.code[4..8].try_into().unwrap());
        // B with imm26 == -1 word
        assert_eq!(word, 0x1400_0000 | 0x03ff_ffff);
    }

    #[test]
    fn conditional_branch_uses_imm19() {
        let mut e = Arm64Emitter::new();
        e.jump_label(Cond::Eq, "end").unwrap();
        e.mov_imm(X0, 0).unwrap();
        e.bind_label("end").unwrap();
        let program = e.finalize().unwrap();
        let word = u32::from_le_bytes(program.code[0..4].try_into().unwrap());
        assert_eq!(word, 0x5400_0000 | (2 << 5)); // two words forward, cond EQ
    }

    #[test]
    fn pool_load_becomes_relocated_slot() {
        let mut e = Arm64Emitter::new();
        e.load_constant_bytes(X1, b"ok\n", false).unwrap();
        e.ret().unwrap();
        let program = e.finalize().unwrap();
        assert_eq!(program.relocations.len(), 1);
        let slot = program.relocations[0] as usize;
        // The LDR at 0 points at the slot.
        let ldr = u32::from_le_bytes(program.code[0..4].try_into().unwrap());
        assert_eq!(ldr & 0xff00_0000, 0x5800_0000);
        let imm19 = ((ldr >> 5) & 0x7ffff) as usize;
        assert_eq!(imm19 * 4, slot);
        // The slot holds the literal address (base 0).
        let value = u64::from_le_bytes(program.code[slot..slot + 8].try_into().unwrap());
        assert_eq!(&program.code[value as usize..value as usize + 3], b"ok\n");
    }

    #[test]
    fn token_slots_stay_raw() {
        let mut e = Arm64Emitter::new();
        e.load_token(X2, 0x5ead_0000_1234_5678).unwrap();
        e.ret().unwrap();
        let program = e.finalize().unwrap();
        assert!(program.relocations.is_empty());
        let pos = program.code.len() - 8;
        let value = u64::from_le_bytes(program.code[pos..pos + 8].try_into().unwrap());
        assert_eq!(value, 0x5ead_0000_1234_5678);
    }
}
