// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! JIT loader: maps emitted code into an executable region, applies
//! relocations and exposes the entrypoint as a callable function.
//!
//! The mapping starts read-write, code is copied to offset 0, every
//! relocated field is rebased, then the code pages flip to read-execute
//! while BSS stays writable after them. Exactly one [`CompiledFunc`] owns
//! a region; dropping it unmaps everything. Publishing the value is the
//! memory barrier that makes cross-thread execution sound.

use std::io;

use cc_asm::AsmProgram;
use tracing::debug;

/// JIT loader error type
#[derive(thiserror::Error, Debug)]
pub enum JitError {
    #[error("empty program")]
    EmptyProgram,
    #[error("relocation offset {0} out of range")]
    RelocationOutOfRange(u64),
    #[error("calls take at most {max} register arguments, got {got}")]
    TooManyArgs { max: usize, got: usize },
    #[error("mmap failed: {0}")]
    Mmap(io::Error),
    #[error("mprotect failed: {0}")]
    Mprotect(io::Error),
}

pub type Result<T> = std::result::Result<T, JitError>;

/// Register-argument limit of the host ABI.
#[cfg(target_arch = "aarch64")]
pub const MAX_CALL_ARGS: usize = 8;
#[cfg(not(target_arch = "aarch64"))]
pub const MAX_CALL_ARGS: usize = 6;

/// One loaded program. The region is unmapped on drop.
pub struct CompiledFunc {
    base: *mut u8,
    total: usize,
    code_len: usize,
}

// The code pages are immutable after load; BSS writes are the caller's
// concern, as they would be for any static. Publication of the value is
// the required barrier.
unsafe impl Send for CompiledFunc {}
unsafe impl Sync for CompiledFunc {}

impl CompiledFunc {
    /// Map `program` and return the callable entrypoint at offset 0.
    pub fn load(program: &AsmProgram) -> Result<CompiledFunc> {
        if program.code.is_empty() {
            return Err(JitError::EmptyProgram);
        }
        let page = page_size();
        let code_alloc = round_up(program.code.len(), page);
        let total = round_up(code_alloc + program.bss_size as usize, page);

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(JitError::Mmap(io::Error::last_os_error()));
        }
        let base = base as *mut u8;

        let func = CompiledFunc {
            base,
            total,
            code_len: program.code.len(),
        };

        let region = unsafe { std::slice::from_raw_parts_mut(base, total) };
        region[..program.code.len()].copy_from_slice(&program.code);

        // Rebase every relocated field. Values addressing BSS must jump
        // over the padded code pages first.
        let bss_shift = (code_alloc - program.code.len()) as u64;
        for &offset in &program.relocations {
            let offset = offset as usize;
            let field = region
                .get_mut(offset..offset + 8)
                .ok_or(JitError::RelocationOutOfRange(offset as u64))?;
            let mut value = u64::from_le_bytes((&*field).try_into().unwrap());
            if value >= program.code.len() as u64 {
                value += bss_shift;
            }
            value = value.wrapping_add(base as u64);
            field.copy_from_slice(&value.to_le_bytes());
        }

        let rc = unsafe {
            libc::mprotect(
                base as *mut libc::c_void,
                code_alloc,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(JitError::Mprotect(io::Error::last_os_error()));
        }

        #[cfg(target_arch = "aarch64")]
        flush_icache(base, program.code.len());

        debug!(
            code_len = program.code.len(),
            total,
            relocations = program.relocations.len(),
            "mapped jit region"
        );
        Ok(func)
    }

    pub fn entry(&self) -> *const u8 {
        self.base
    }

    pub fn code_len(&self) -> usize {
        self.code_len
    }

    /// Dispatch up to [`MAX_CALL_ARGS`] word arguments into the ABI
    /// argument registers and return the ABI return register.
    ///
    /// # Safety
    ///
    /// The loaded code must follow the C calling convention for the given
    /// arity and must not outlive its inputs.
    pub unsafe fn call(&self, args: &[u64]) -> Result<u64> {
        if args.len() > MAX_CALL_ARGS {
            return Err(JitError::TooManyArgs {
                max: MAX_CALL_ARGS,
                got: args.len(),
            });
        }
        type F0 = unsafe extern "C" fn() -> u64;
        type F1 = unsafe extern "C" fn(u64) -> u64;
        type F2 = unsafe extern "C" fn(u64, u64) -> u64;
        type F3 = unsafe extern "C" fn(u64, u64, u64) -> u64;
        type F4 = unsafe extern "C" fn(u64, u64, u64, u64) -> u64;
        type F5 = unsafe extern "C" fn(u64, u64, u64, u64, u64) -> u64;
        type F6 = unsafe extern "C" fn(u64, u64, u64, u64, u64, u64) -> u64;
        type F7 = unsafe extern "C" fn(u64, u64, u64, u64, u64, u64, u64) -> u64;
        type F8 = unsafe extern "C" fn(u64, u64, u64, u64, u64, u64, u64, u64) -> u64;

        let entry = self.base;
        let a = args;
        let result = unsafe {
            use std::mem::transmute as cast;
            match a.len() {
                0 => cast::<_, F0>(entry)(),
                1 => cast::<_, F1>(entry)(a[0]),
                2 => cast::<_, F2>(entry)(a[0], a[1]),
                3 => cast::<_, F3>(entry)(a[0], a[1], a[2]),
                4 => cast::<_, F4>(entry)(a[0], a[1], a[2], a[3]),
                5 => cast::<_, F5>(entry)(a[0], a[1], a[2], a[3], a[4]),
                6 => cast::<_, F6>(entry)(a[0], a[1], a[2], a[3], a[4], a[5]),
                7 => cast::<_, F7>(entry)(a[0], a[1], a[2], a[3], a[4], a[5], a[6]),
                _ => cast::<_, F8>(entry)(a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7]),
            }
        };
        Ok(result)
    }
}

impl Drop for CompiledFunc {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}

fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 { 4096 } else { sz as usize }
}

fn round_up(value: usize, to: usize) -> usize {
    (value + to - 1) / to * to
}

/// Clean the data cache and invalidate the instruction cache over the
/// freshly written code so the core does not execute stale lines.
#[cfg(target_arch = "aarch64")]
fn flush_icache(start: *mut u8, len: usize) {
    const LINE: usize = 64;
    unsafe {
        let mut p = start as usize & !(LINE - 1);
        let end = start as usize + len;
        while p < end {
            std::arch::asm!("dc cvau, {addr}", addr = in(reg) p);
            p += LINE;
        }
        std::arch::asm!("dsb ish");
        let mut p = start as usize & !(LINE - 1);
        while p < end {
            std::arch::asm!("ic ivau, {addr}", addr = in(reg) p);
            p += LINE;
        }
        std::arch::asm!("dsb ish");
        std::arch::asm!("isb");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cc_asm::{AluOp, Emitter};

    #[test]
    fn rejects_empty_programs() {
        let program = AsmProgram::default();
        assert!(matches!(CompiledFunc::load(&program), Err(JitError::EmptyProgram)));
    }

    #[test]
    fn too_many_args_is_an_error() {
        let program = AsmProgram {
            code: vec![0xc3],
            relocations: vec![],
            bss_size: 0,
        };
        let func = CompiledFunc::load(&program).unwrap();
        let args = vec![0u64; MAX_CALL_ARGS + 1];
        assert!(matches!(
            unsafe { func.call(&args) },
            Err(JitError::TooManyArgs { .. })
        ));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn constant_return_round_trips() {
        use cc_asm::x86_64::{RAX, X86Emitter};
        let mut e = X86Emitter::new();
        e.mov_imm(RAX, 41).unwrap();
        e.alu_imm(AluOp::Add, RAX, 1).unwrap();
        e.ret().unwrap();
        let func = CompiledFunc::load(&e.finalize().unwrap()).unwrap();
        assert_eq!(unsafe { func.call(&[]) }.unwrap(), 42);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn literal_pointer_survives_relocation() {
        use cc_asm::x86_64::{RAX, X86Emitter};
        // Return the address of the literal; check its bytes from Rust.
        let mut e = X86Emitter::new();
        e.load_constant_bytes(RAX, b"jit!", false).unwrap();
        e.ret().unwrap();
        let func = CompiledFunc::load(&e.finalize().unwrap()).unwrap();
        let addr = unsafe { func.call(&[]) }.unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, 4) };
        assert_eq!(bytes, b"jit!");
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn arm64_constant_return_round_trips() {
        use cc_asm::arm64::{Arm64Emitter, X0};
        let mut e = Arm64Emitter::new();
        e.mov_imm(X0, 41).unwrap();
        e.alu_imm(AluOp::Add, X0, 1).unwrap();
        e.ret().unwrap();
        let func = CompiledFunc::load(&e.finalize().unwrap()).unwrap();
        assert_eq!(unsafe { func.call(&[]) }.unwrap(), 42);
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn arm64_pool_pointer_survives_relocation() {
        use cc_asm::arm64::{Arm64Emitter, X0};
        let mut e = Arm64Emitter::new();
        e.load_constant_bytes(X0, b"jit!", false).unwrap();
        e.ret().unwrap();
        let func = CompiledFunc::load(&e.finalize().unwrap()).unwrap();
        let addr = unsafe { func.call(&[]) }.unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, 4) };
        assert_eq!(bytes, b"jit!");
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn bss_reference_lands_past_padded_code() {
        use cc_asm::x86_64::{RAX, X86Emitter};
        let mut e = X86Emitter::new();
        e.reserve_zero(RAX, 64).unwrap();
        e.ret().unwrap();
        let program = e.finalize().unwrap();
        let func = CompiledFunc::load(&program).unwrap();
        let addr = unsafe { func.call(&[]) }.unwrap();
        let base = func.entry() as u64;
        // BSS begins on the page after the code.
        assert!(addr >= base + program.code.len() as u64);
        assert_eq!(addr % page_size() as u64, 0);
        let bss = unsafe { std::slice::from_raw_parts(addr as *const u8, 64) };
        assert!(bss.iter().all(|&b| b == 0));
    }
}
