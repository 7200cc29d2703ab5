// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-method emission state: the text buffer, the three data sections,
//! label bookkeeping and the patch lists resolved on finalize.

use std::collections::HashMap;

use crate::{AsmError, AsmProgram, Result};

/// Logical data sections laid out after the text, in this order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Section {
    Literal,
    Const,
    Bss,
}

/// How a pending jump or call is encoded at its patch site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JumpKind {
    /// 4-byte displacement field, PC-relative from the byte after it.
    Rel32,
    /// AArch64 B / BL: imm26 word-offset field inside the instruction.
    Arm64Imm26,
    /// AArch64 B.cond: imm19 word-offset field at bit 5.
    Arm64Imm19,
}

#[derive(Clone, Debug)]
struct JumpPatch {
    at: usize,
    label: String,
    kind: JumpKind,
}

/// Where an 8-byte pointer field lives.
#[derive(Clone, Copy, Debug)]
enum PatchSite {
    Text(usize),
    Data(Section, usize),
}

#[derive(Clone, Debug)]
struct PointerPatch {
    site: PatchSite,
    target: Section,
    offset: u64,
}

#[derive(Default)]
pub struct EmissionContext {
    text: Vec<u8>,
    literal: Vec<u8>,
    literal_pool: HashMap<(Vec<u8>, bool), u64>,
    const_data: Vec<u8>,
    const_names: HashMap<String, (u64, u64)>,
    bss_size: u64,
    labels: HashMap<String, usize>,
    jump_patches: Vec<JumpPatch>,
    pointer_patches: Vec<PointerPatch>,
    label_counter: u64,
}

impl EmissionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &[u8] {
        &self.text
    }

    pub fn text_len(&self) -> usize {
        self.text.len()
    }

    pub fn emit(&mut self, bytes: &[u8]) {
        self.text.extend_from_slice(bytes);
    }

    pub fn emit_u32(&mut self, word: u32) {
        self.text.extend_from_slice(&word.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.text.extend_from_slice(&value.to_le_bytes());
    }

    /// Patch an already-emitted 32-bit word in place (arm64 pool loads).
    pub fn patch_u32(&mut self, at: usize, word: u32) {
        self.text[at..at + 4].copy_from_slice(&word.to_le_bytes());
    }

    /// Monotonic counter for generated label names, confined to this
    /// context so emission stays reproducible.
    pub fn next_label_id(&mut self) -> u64 {
        let id = self.label_counter;
        self.label_counter += 1;
        id
    }

    pub fn bind_label(&mut self, name: &str) -> Result<()> {
        let at = self.text.len();
        if self.labels.insert(name.to_string(), at).is_some() {
            return Err(AsmError::DuplicateLabel(name.to_string()));
        }
        Ok(())
    }

    pub fn add_jump_patch(&mut self, at: usize, label: &str, kind: JumpKind) {
        self.jump_patches.push(JumpPatch {
            at,
            label: label.to_string(),
            kind,
        });
    }

    /// Intern literal bytes, optionally zero-terminated, pooled by value.
    pub fn add_literal(&mut self, bytes: &[u8], zero_term: bool) -> u64 {
        let key = (bytes.to_vec(), zero_term);
        if let Some(&off) = self.literal_pool.get(&key) {
            return off;
        }
        let off = self.literal.len() as u64;
        self.literal.extend_from_slice(bytes);
        if zero_term {
            self.literal.push(0);
        }
        self.literal_pool.insert(key, off);
        off
    }

    /// Append named const-section bytes. Later references use the name.
    pub fn add_const(&mut self, name: &str, bytes: &[u8]) -> u64 {
        let off = self.const_data.len() as u64;
        self.const_data.extend_from_slice(bytes);
        self.const_names.insert(name.to_string(), (off, bytes.len() as u64));
        off
    }

    pub fn const_offset(&self, name: &str) -> Result<u64> {
        self.const_names
            .get(name)
            .map(|&(off, _)| off)
            .ok_or_else(|| AsmError::UnknownConst(name.to_string()))
    }

    /// Reserve zeroed BSS space, 16-byte aligned per reservation.
    pub fn reserve_bss(&mut self, size: u64) -> u64 {
        self.bss_size = (self.bss_size + 15) & !15;
        let off = self.bss_size;
        self.bss_size += size;
        off
    }

    pub fn bss_size(&self) -> u64 {
        self.bss_size
    }

    /// Register an 8-byte in-text field at `at` that must hold the
    /// absolute address of `(target, offset)` after finalize.
    pub fn add_text_pointer_patch(&mut self, at: usize, target: Section, offset: u64) {
        self.pointer_patches.push(PointerPatch {
            site: PatchSite::Text(at),
            target,
            offset,
        });
    }

    /// Same, for an 8-byte field inside the literal or const section.
    pub fn add_data_pointer_patch(
        &mut self,
        section: Section,
        at: usize,
        target: Section,
        offset: u64,
    ) -> Result<()> {
        if section == Section::Bss {
            return Err(AsmError::PointerInBss);
        }
        self.pointer_patches.push(PointerPatch {
            site: PatchSite::Data(section, at),
            target,
            offset,
        });
        Ok(())
    }

    /// Lay out `text ‖ literal ‖ const`, resolve every pointer patch into
    /// a relocation and every pending jump into its displacement field.
    pub fn finalize(mut self) -> Result<AsmProgram> {
        // Align text to 8 bytes.
        while self.text.len() % 8 != 0 {
            self.text.push(0);
        }
        let text_len = self.text.len() as u64;
        let literal_base = text_len;
        let const_base = literal_base + self.literal.len() as u64;
        let bss_base = const_base + self.const_data.len() as u64;

        let section_base = |s: Section| match s {
            Section::Literal => literal_base,
            Section::Const => const_base,
            Section::Bss => bss_base,
        };

        let mut code = self.text;
        code.extend_from_slice(&self.literal);
        code.extend_from_slice(&self.const_data);

        let mut relocations = Vec::with_capacity(self.pointer_patches.len());
        for patch in &self.pointer_patches {
            let value = section_base(patch.target) + patch.offset;
            let at = match patch.site {
                PatchSite::Text(at) => at as u64,
                PatchSite::Data(section, at) => {
                    if section == Section::Bss {
                        return Err(AsmError::PointerInBss);
                    }
                    section_base(section) + at as u64
                }
            };
            let at_usize = at as usize;
            let field = code
                .get_mut(at_usize..at_usize + 8)
                .ok_or(AsmError::RelocationOutOfRange(at))?;
            field.copy_from_slice(&value.to_le_bytes());
            relocations.push(at);
        }
        relocations.sort_unstable();

        for jump in &self.jump_patches {
            let target = *self
                .labels
                .get(&jump.label)
                .ok_or_else(|| AsmError::UnknownLabel(jump.label.clone()))? as i64;
            match jump.kind {
                JumpKind::Rel32 => {
                    // Displacement from the byte after the field.
                    let disp = target - (jump.at as i64 + 4);
                    if disp > i32::MAX as i64 || disp < i32::MIN as i64 {
                        return Err(AsmError::JumpOutOfRange(jump.label.clone()));
                    }
                    code[jump.at..jump.at + 4].copy_from_slice(&(disp as i32).to_le_bytes());
                }
                JumpKind::Arm64Imm26 => {
                    let disp = target - jump.at as i64;
                    let words = disp / 4;
                    if disp % 4 != 0 || words >= 1 << 25 || words < -(1 << 25) {
                        return Err(AsmError::JumpOutOfRange(jump.label.clone()));
                    }
                    let mut word = u32::from_le_bytes(code[jump.at..jump.at + 4].try_into().unwrap());
                    word |= (words as u32) & 0x03ff_ffff;
                    code[jump.at..jump.at + 4].copy_from_slice(&word.to_le_bytes());
                }
                JumpKind::Arm64Imm19 => {
                    let disp = target - jump.at as i64;
                    let words = disp / 4;
                    if disp % 4 != 0 || words >= 1 << 18 || words < -(1 << 18) {
                        return Err(AsmError::JumpOutOfRange(jump.label.clone()));
                    }
                    let mut word = u32::from_le_bytes(code[jump.at..jump.at + 4].try_into().unwrap());
                    word |= ((words as u32) & 0x0007_ffff) << 5;
                    code[jump.at..jump.at + 4].copy_from_slice(&word.to_le_bytes());
                }
            }
        }

        Ok(AsmProgram {
            code,
            relocations,
            bss_size: self.bss_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_pool_dedups_by_bytes_and_termination() {
        let mut ctx = EmissionContext::new();
        let a = ctx.add_literal(b"ok", false);
        let b = ctx.add_literal(b"ok", false);
        let c = ctx.add_literal(b"ok", true);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn finalize_places_sections_and_relocations() {
        let mut ctx = EmissionContext::new();
        ctx.emit(&[0x90, 0x90, 0x90]); // three bytes of text
        let lit = ctx.add_literal(b"hello", false);
        ctx.emit(&[0u8; 8]);
        ctx.add_text_pointer_patch(3, Section::Literal, lit);
        let program = ctx.finalize().unwrap();

        // Text padded to 8, literal follows.
        assert_eq!(program.code.len(), 16 + 5);
        assert_eq!(&program.code[16..21], b"hello");
        assert_eq!(program.relocations, vec![3]);
        let field = u64::from_le_bytes(program.code[3..11].try_into().unwrap());
        assert_eq!(field, 16); // literal base + 0

        // Rebasing shifts the field by exactly the base.
        let rebased = program.relocated(0x40_0000).unwrap();
        let field = u64::from_le_bytes(rebased[3..11].try_into().unwrap());
        assert_eq!(field, 0x40_0000 + 16);
    }

    #[test]
    fn bss_reservations_are_16_byte_aligned() {
        let mut ctx = EmissionContext::new();
        assert_eq!(ctx.reserve_bss(8), 0);
        assert_eq!(ctx.reserve_bss(24), 16);
        assert_eq!(ctx.reserve_bss(1), 48);
        assert_eq!(ctx.bss_size(), 49);
    }

    #[test]
    fn rel32_jumps_resolve_from_following_byte() {
        let mut ctx = EmissionContext::new();
        ctx.bind_label("top").unwrap();
        ctx.emit(&[0xe9]); // jmp rel32
        let at = ctx.text_len();
        ctx.emit(&[0, 0, 0, 0]);
        ctx.add_jump_patch(at, "top", JumpKind::Rel32);
        let program = ctx.finalize().unwrap();
        let disp = i32::from_le_bytes(program.code[1..5].try_into().unwrap());
        assert_eq!(disp, -5);
    }

    #[test]
    fn unknown_label_is_fatal() {
        let mut ctx = EmissionContext::new();
        ctx.emit(&[0xe9]);
        let at = ctx.text_len();
        ctx.emit(&[0, 0, 0, 0]);
        ctx.add_jump_patch(at, "nowhere", JumpKind::Rel32);
        assert!(matches!(ctx.finalize(), Err(AsmError::UnknownLabel(_))));
    }
}
