// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Standalone static ELF64 writer.
//!
//! Wraps an emitted program in a minimal executable: one RWX PT_LOAD
//! segment, no section headers, entry at the configured base address.
//! The emitted code is relocated for that base before writing, with BSS
//! carried purely as `p_memsz` past `p_filesz`.

use cc_asm::{Arch, AsmProgram};

const EHDR_SIZE: u64 = 64;
const PHDR_SIZE: u64 = 56;

const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;
const PT_LOAD: u32 = 1;
const PF_RWX: u32 = 7;

/// ELF writer error type
#[derive(thiserror::Error, Debug)]
pub enum ElfError {
    #[error("segment offset {0:#x} overlaps the ELF headers")]
    OffsetTooSmall(u64),
    #[error("segment alignment {0:#x} is not a power of two")]
    BadAlignment(u64),
    #[error("segment offset {offset:#x} not aligned to {alignment:#x}")]
    UnalignedOffset { offset: u64, alignment: u64 },
    #[error("base address {base:#x} below segment offset {offset:#x}")]
    BaseBelowOffset { base: u64, offset: u64 },
    #[error("base address {base:#x} incongruent with offset {offset:#x} modulo {alignment:#x}")]
    IncongruentBase {
        base: u64,
        offset: u64,
        alignment: u64,
    },
    #[error("architecture {0:?} has no ELF machine id here")]
    UnsupportedArch(Arch),
    #[error("relocation failed: {0}")]
    Reloc(#[from] cc_asm::AsmError),
}

pub type Result<T> = std::result::Result<T, ElfError>;

/// Load-segment placement. The defaults produce the classic tiny static
/// executable layout.
#[derive(Clone, Copy, Debug)]
pub struct ElfOptions {
    pub base_address: u64,
    pub segment_offset: u64,
    pub segment_alignment: u64,
}

impl Default for ElfOptions {
    fn default() -> Self {
        ElfOptions {
            base_address: 0x40_1000,
            segment_offset: 0x1000,
            segment_alignment: 0x1000,
        }
    }
}

impl ElfOptions {
    fn validate(&self) -> Result<()> {
        if self.segment_offset < EHDR_SIZE + PHDR_SIZE {
            return Err(ElfError::OffsetTooSmall(self.segment_offset));
        }
        if !self.segment_alignment.is_power_of_two() {
            return Err(ElfError::BadAlignment(self.segment_alignment));
        }
        if self.segment_offset % self.segment_alignment != 0 {
            return Err(ElfError::UnalignedOffset {
                offset: self.segment_offset,
                alignment: self.segment_alignment,
            });
        }
        if self.base_address < self.segment_offset {
            return Err(ElfError::BaseBelowOffset {
                base: self.base_address,
                offset: self.segment_offset,
            });
        }
        if (self.base_address - self.segment_offset) % self.segment_alignment != 0 {
            return Err(ElfError::IncongruentBase {
                base: self.base_address,
                offset: self.segment_offset,
                alignment: self.segment_alignment,
            });
        }
        Ok(())
    }
}

fn machine_for(arch: Arch) -> Result<u16> {
    match arch {
        Arch::X86_64 => Ok(EM_X86_64),
        Arch::Aarch64 => Ok(EM_AARCH64),
        Arch::Riscv64 => Err(ElfError::UnsupportedArch(arch)),
    }
}

/// Emit a complete static executable image for `program`.
pub fn write_elf(program: &AsmProgram, arch: Arch, options: &ElfOptions) -> Result<Vec<u8>> {
    options.validate()?;
    let machine = machine_for(arch)?;
    let code = program.relocated(options.base_address)?;

    let filesz = code.len() as u64;
    let memsz = filesz + program.bss_size;

    let mut out = Vec::with_capacity(options.segment_offset as usize + code.len());

    // ELF64 header
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&ET_EXEC.to_le_bytes());
    out.extend_from_slice(&machine.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes()); // e_version
    out.extend_from_slice(&options.base_address.to_le_bytes()); // e_entry
    out.extend_from_slice(&EHDR_SIZE.to_le_bytes()); // e_phoff
    out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes()); // e_ehsize
    out.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes()); // e_phentsize
    out.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

    // Program header: the single PT_LOAD segment
    out.extend_from_slice(&PT_LOAD.to_le_bytes());
    out.extend_from_slice(&PF_RWX.to_le_bytes());
    out.extend_from_slice(&options.segment_offset.to_le_bytes()); // p_offset
    out.extend_from_slice(&options.base_address.to_le_bytes()); // p_vaddr
    out.extend_from_slice(&options.base_address.to_le_bytes()); // p_paddr
    out.extend_from_slice(&filesz.to_le_bytes());
    out.extend_from_slice(&memsz.to_le_bytes());
    out.extend_from_slice(&options.segment_alignment.to_le_bytes());

    out.resize(options.segment_offset as usize, 0);
    out.extend_from_slice(&code);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trivial_program() -> AsmProgram {
        AsmProgram {
            code: vec![0xc3; 8],
            relocations: vec![0],
            bss_size: 32,
        }
    }

    #[test]
    fn header_fields_are_well_formed() {
        let image = write_elf(&trivial_program(), Arch::X86_64, &ElfOptions::default()).unwrap();
        assert_eq!(&image[0..4], &[0x7f, b'E', b'L', b'F']);
        assert_eq!(image[4], 2); // ELFCLASS64
        assert_eq!(image[5], 1); // little-endian
        assert_eq!(u16::from_le_bytes(image[16..18].try_into().unwrap()), ET_EXEC);
        assert_eq!(u16::from_le_bytes(image[18..20].try_into().unwrap()), EM_X86_64);
        assert_eq!(
            u64::from_le_bytes(image[24..32].try_into().unwrap()),
            0x40_1000
        );
        // e_shoff stays zero: no section headers at all.
        assert_eq!(u64::from_le_bytes(image[40..48].try_into().unwrap()), 0);
        assert_eq!(u16::from_le_bytes(image[56..58].try_into().unwrap()), 1); // e_phnum
    }

    #[test]
    fn program_header_covers_code_and_bss() {
        let program = trivial_program();
        let image = write_elf(&program, Arch::X86_64, &ElfOptions::default()).unwrap();
        let ph = &image[64..64 + 56];
        assert_eq!(u32::from_le_bytes(ph[0..4].try_into().unwrap()), PT_LOAD);
        assert_eq!(u32::from_le_bytes(ph[4..8].try_into().unwrap()), PF_RWX);
        assert_eq!(u64::from_le_bytes(ph[8..16].try_into().unwrap()), 0x1000);
        assert_eq!(u64::from_le_bytes(ph[16..24].try_into().unwrap()), 0x40_1000);
        let filesz = u64::from_le_bytes(ph[32..40].try_into().unwrap());
        let memsz = u64::from_le_bytes(ph[40..48].try_into().unwrap());
        assert_eq!(filesz, program.code.len() as u64);
        assert_eq!(memsz, filesz + program.bss_size);
        assert_eq!(image.len(), 0x1000 + program.code.len());
    }

    #[test]
    fn relocations_are_rebased_to_the_load_address() {
        let image = write_elf(&trivial_program(), Arch::X86_64, &ElfOptions::default()).unwrap();
        let field = u64::from_le_bytes(image[0x1000..0x1008].try_into().unwrap());
        // The field at relocation offset 0 gains exactly the base address.
        let original = u64::from_le_bytes([0xc3; 8]);
        assert_eq!(field, original.wrapping_add(0x40_1000));
    }

    #[test]
    fn placement_validation() {
        let program = trivial_program();
        let bad = ElfOptions {
            segment_offset: 64,
            ..Default::default()
        };
        assert!(matches!(
            write_elf(&program, Arch::X86_64, &bad),
            Err(ElfError::OffsetTooSmall(_))
        ));

        let bad = ElfOptions {
            segment_alignment: 0x1001,
            ..Default::default()
        };
        assert!(matches!(
            write_elf(&program, Arch::X86_64, &bad),
            Err(ElfError::BadAlignment(_))
        ));

        let bad = ElfOptions {
            base_address: 0x800,
            ..Default::default()
        };
        assert!(matches!(
            write_elf(&program, Arch::X86_64, &bad),
            Err(ElfError::BaseBelowOffset { .. })
        ));

        let bad = ElfOptions {
            base_address: 0x1800,
            ..Default::default()
        };
        assert!(matches!(
            write_elf(&program, Arch::X86_64, &bad),
            Err(ElfError::IncongruentBase { .. })
        ));
    }
}
