// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Minimal RV64 emitter. Only the subset needed for in-guest init stubs:
//! ADDI, LUI+ADDI wide loads, LD/SD, SLLI/SRLI and the distinguished halt
//! store. Not wired into the IR compiler.

use crate::{AsmError, AsmProgram, Result};

/// RISC-V integer register x0..x31.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RvReg(pub u8);

pub const X0: RvReg = RvReg(0);

/// `sd x0, 0(x0)`: the conventional halt trap for the bring-up monitor.
pub const RV64_HALT: u32 = 0x0000_3023;

#[derive(Default)]
pub struct Rv64Emitter {
    words: Vec<u32>,
}

impl Rv64Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(reg: RvReg) -> Result<u32> {
        if reg.0 > 31 {
            return Err(AsmError::BadRegister(crate::Reg(reg.0)));
        }
        Ok(reg.0 as u32)
    }

    fn emit(&mut self, word: u32) {
        self.words.push(word);
    }

    pub fn addi(&mut self, rd: RvReg, rs1: RvReg, imm: i32) -> Result<()> {
        let (rd, rs1) = (Self::check(rd)?, Self::check(rs1)?);
        if !(-2048..=2047).contains(&imm) {
            return Err(AsmError::ImmediateTooLarge(imm as i64));
        }
        self.emit(((imm as u32) << 20) | (rs1 << 15) | (rd << 7) | 0x13);
        Ok(())
    }

    pub fn lui(&mut self, rd: RvReg, imm20: u32) -> Result<()> {
        let rd = Self::check(rd)?;
        self.emit((imm20 << 12) | (rd << 7) | 0x37);
        Ok(())
    }

    /// Load a 32-bit immediate via LUI + ADDI, with the usual carry
    /// adjustment for a negative low part.
    pub fn load_imm32(&mut self, rd: RvReg, imm: i32) -> Result<()> {
        let low = (imm << 20) >> 20; // sign-extended low 12
        let mut high = imm.wrapping_sub(low) as u32 >> 12;
        high &= 0xf_ffff;
        if high != 0 {
            self.lui(rd, high)?;
            if low != 0 {
                self.addi(rd, rd, low)?;
            }
        } else {
            self.addi(rd, X0, low)?;
        }
        Ok(())
    }

    pub fn ld(&mut self, rd: RvReg, base: RvReg, imm: i32) -> Result<()> {
        let (rd, base) = (Self::check(rd)?, Self::check(base)?);
        if !(-2048..=2047).contains(&imm) {
            return Err(AsmError::ImmediateTooLarge(imm as i64));
        }
        self.emit(((imm as u32) << 20) | (base << 15) | (3 << 12) | (rd << 7) | 0x03);
        Ok(())
    }

    pub fn sd(&mut self, src: RvReg, base: RvReg, imm: i32) -> Result<()> {
        let (src, base) = (Self::check(src)?, Self::check(base)?);
        if !(-2048..=2047).contains(&imm) {
            return Err(AsmError::ImmediateTooLarge(imm as i64));
        }
        let imm = imm as u32;
        self.emit(
            ((imm >> 5) << 25)
                | (src << 20)
                | (base << 15)
                | (3 << 12)
                | ((imm & 0x1f) << 7)
                | 0x23,
        );
        Ok(())
    }

    pub fn slli(&mut self, rd: RvReg, rs1: RvReg, shamt: u8) -> Result<()> {
        let (rd, rs1) = (Self::check(rd)?, Self::check(rs1)?);
        self.emit((((shamt & 63) as u32) << 20) | (rs1 << 15) | (1 << 12) | (rd << 7) | 0x13);
        Ok(())
    }

    pub fn srli(&mut self, rd: RvReg, rs1: RvReg, shamt: u8) -> Result<()> {
        let (rd, rs1) = (Self::check(rd)?, Self::check(rs1)?);
        self.emit((((shamt & 63) as u32) << 20) | (rs1 << 15) | (5 << 12) | (rd << 7) | 0x13);
        Ok(())
    }

    /// Store-to-null halt recognized by the bring-up monitor.
    pub fn halt(&mut self) {
        self.emit(RV64_HALT);
    }

    pub fn finalize(self) -> AsmProgram {
        let mut code = Vec::with_capacity(self.words.len() * 4);
        for word in self.words {
            code.extend_from_slice(&word.to_le_bytes());
        }
        AsmProgram {
            code,
            relocations: Vec::new(),
            bss_size: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halt_is_sd_x0_x0() {
        let mut e = Rv64Emitter::new();
        e.sd(X0, X0, 0).unwrap();
        assert_eq!(e.words, [RV64_HALT]);
    }

    #[test]
    fn addi_encodes_negative_immediates() {
        let mut e = Rv64Emitter::new();
        // addi x5, x0, -1
        e.addi(RvReg(5), X0, -1).unwrap();
        assert_eq!(e.words, [0xfff0_0293]);
    }

    #[test]
    fn load_imm32_carries_into_lui() {
        let mut e = Rv64Emitter::new();
        // 0x12345 has a high low-bit pattern that forces the carry path.
        e.load_imm32(RvReg(1), 0x0001_2fff).unwrap();
        assert_eq!(e.words.len(), 2);
        let mut check = Rv64Emitter::new();
        check.lui(RvReg(1), 0x13).unwrap();
        check.addi(RvReg(1), RvReg(1), -1).unwrap();
        assert_eq!(e.words, check.words);
    }

    #[test]
    fn shifts() {
        let mut e = Rv64Emitter::new();
        e.slli(RvReg(2), RvReg(2), 4).unwrap();
        e.srli(RvReg(2), RvReg(2), 4).unwrap();
        assert_eq!(e.words, [0x0041_1113, 0x0041_5113]);
    }
}
