// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Program linking.
//!
//! Methods compile independently; cross-method and global references are
//! 48-bit FNV-1a tokens behind the `0x5ead`/`0x5eae` prefixes, loaded
//! through full 8-byte fields. The linker concatenates methods, rebases
//! their relocations, lays out the combined BSS and rewrites every token
//! field in place. Any token-prefixed field that does not resolve aborts
//! the link, so prefix collisions fail loudly instead of corrupting code.

use std::collections::HashMap;

use cc_asm::{Arch, Arm64Emitter, AsmProgram, Emitter, X86Emitter};

use crate::{IrError, Program, Result, compile_method};

const TOKEN_MASK: u64 = 0x0000_ffff_ffff_ffff;
const METHOD_PREFIX: u64 = 0x5ead;
const GLOBAL_PREFIX: u64 = 0x5eae;

pub fn fnv1a_64(name: &str) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &byte in name.as_bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    hash
}

/// Placeholder for a method address, resolved at program link.
pub fn method_token(name: &str) -> u64 {
    (METHOD_PREFIX << 48) | (fnv1a_64(name) & TOKEN_MASK)
}

/// Placeholder for a global address, resolved at program link.
pub fn global_token(name: &str) -> u64 {
    (GLOBAL_PREFIX << 48) | (fnv1a_64(name) & TOKEN_MASK)
}

/// Whether a 64-bit field value carries a link-token prefix.
pub fn is_token(value: u64) -> bool {
    matches!(value >> 48, METHOD_PREFIX | GLOBAL_PREFIX)
}

/// Compile every method and link them into one relocatable blob.
pub fn compile_standalone_program(program: &Program, arch: Arch) -> Result<AsmProgram> {
    match arch {
        Arch::X86_64 => link(program, X86Emitter::new),
        Arch::Aarch64 => link(program, Arm64Emitter::new),
        other => Err(IrError::UnsupportedArch(other)),
    }
}

fn link<E: Emitter>(program: &Program, new_emitter: fn() -> E) -> Result<AsmProgram> {
    crate::validate_program(program)?;

    // Entrypoint first, remaining methods in sorted-name order.
    let mut order = vec![program.entrypoint.as_str()];
    order.extend(program.methods.keys().map(String::as_str).filter(|&n| n != program.entrypoint));

    let mut code: Vec<u8> = Vec::new();
    let mut pieces: Vec<(usize, AsmProgram)> = Vec::new();
    let mut method_offsets: HashMap<&str, u64> = HashMap::new();
    for &name in &order {
        while code.len() % 16 != 0 {
            code.push(0);
        }
        let offset = code.len();
        let asm = compile_method(&program.methods[name], new_emitter())?;
        method_offsets.insert(name, offset as u64);
        code.extend_from_slice(&asm.code);
        pieces.push((offset, asm));
    }
    while code.len() % 16 != 0 {
        code.push(0);
    }
    let code_end = code.len() as u64;

    // Per-method private BSS first, each 16-byte aligned, then globals.
    let mut relocations: Vec<u64> = Vec::new();
    let mut bss_cursor = 0u64;
    for (offset, asm) in &pieces {
        bss_cursor = (bss_cursor + 15) & !15;
        let method_bss = bss_cursor;
        bss_cursor += asm.bss_size;

        // Rebase this method's relocations into the combined layout. A
        // value at or past the method's own code length addresses its BSS.
        for &r in &asm.relocations {
            let pos = offset + r as usize;
            let value = read_u64(&code, pos);
            let rebased = if value < asm.code.len() as u64 {
                value + *offset as u64
            } else {
                code_end + method_bss + (value - asm.code.len() as u64)
            };
            write_u64(&mut code, pos, rebased);
            relocations.push(pos as u64);
        }
    }

    let mut global_addrs: HashMap<u64, u64> = HashMap::new();
    for (name, global) in &program.globals {
        let align = 1u64 << global.align_pow2;
        bss_cursor = (bss_cursor + align - 1) & !(align - 1);
        global_addrs.insert(global_token(name), code_end + bss_cursor);
        bss_cursor += global.size;
    }

    let method_addrs: HashMap<u64, u64> =
        order.iter().map(|&n| (method_token(n), method_offsets[n])).collect();

    // Token scan: every prefixed 8-byte field must resolve; anything else
    // is a collision or an undefined symbol, both fatal.
    let mut pos = 0usize;
    while pos + 8 <= code.len() {
        let value = read_u64(&code, pos);
        let resolved = match value >> 48 {
            METHOD_PREFIX => Some(
                method_addrs
                    .get(&value)
                    .copied()
                    .ok_or(IrError::UnresolvedToken { token: value, at: pos })?,
            ),
            GLOBAL_PREFIX => Some(
                global_addrs
                    .get(&value)
                    .copied()
                    .ok_or(IrError::UnresolvedToken { token: value, at: pos })?,
            ),
            _ => None,
        };
        match resolved {
            Some(address) => {
                write_u64(&mut code, pos, address);
                relocations.push(pos as u64);
                pos += 8;
            }
            None => pos += 1,
        }
    }

    relocations.sort_unstable();
    Ok(AsmProgram {
        code,
        relocations,
        bss_size: bss_cursor,
    })
}

fn read_u64(code: &[u8], pos: usize) -> u64 {
    u64::from_le_bytes(code[pos..pos + 8].try_into().unwrap())
}

fn write_u64(code: &mut [u8], pos: usize, value: u64) {
    code[pos..pos + 8].copy_from_slice(&value.to_le_bytes());
}
