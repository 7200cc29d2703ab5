// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end: an IR program emitted as a standalone ELF must execute on
//! the host without any loader involvement.

use cc_asm::Arch;
use cc_elf::{ElfOptions, write_elf};
use cc_ir::{Expr, Method, Program, Stmt, compile_standalone_program};

fn hello_program() -> Program {
    let mut program = Program::new("main");
    program.add_method(Method::new(
        "main",
        vec![
            // write(1, "ok\n", 3)
            Stmt::Syscall {
                num: Expr::Imm(1),
                args: vec![
                    Expr::Imm(1),
                    Expr::ConstBytes {
                        bytes: b"ok\n".to_vec(),
                        zero_term: false,
                    },
                    Expr::Imm(3),
                ],
                result: None,
            },
            // exit(0)
            Stmt::Syscall {
                num: Expr::Imm(60),
                args: vec![Expr::Imm(0)],
                result: None,
            },
        ],
    ));
    program
}

#[test]
fn image_is_structurally_valid() {
    let linked = compile_standalone_program(&hello_program(), Arch::X86_64).unwrap();
    let image = write_elf(&linked, Arch::X86_64, &ElfOptions::default()).unwrap();
    assert_eq!(&image[0..4], b"\x7fELF");
    // Entry equals the default base address.
    assert_eq!(
        u64::from_le_bytes(image[24..32].try_into().unwrap()),
        0x40_1000
    );
    // Exactly one program header, no sections.
    assert_eq!(u16::from_le_bytes(image[56..58].try_into().unwrap()), 1);
    assert_eq!(u64::from_le_bytes(image[40..48].try_into().unwrap()), 0);
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[test]
fn hello_world_runs_and_prints_ok() {
    use std::os::unix::fs::PermissionsExt;

    let linked = compile_standalone_program(&hello_program(), Arch::X86_64).unwrap();
    let image = write_elf(&linked, Arch::X86_64, &ElfOptions::default()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello");
    std::fs::write(&path, &image).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let output = std::process::Command::new(&path).output().unwrap();
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(output.stdout, b"ok\n");
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[test]
fn printf_fragment_prints_hex() {
    use std::os::unix::fs::PermissionsExt;

    let mut program = Program::new("main");
    program.add_method(Method::new(
        "main",
        vec![
            Stmt::Assign("v".into(), Expr::Imm(0xbeef)),
            Stmt::Printf {
                format: "v=%x\n".into(),
                args: vec![Expr::var("v")],
            },
            Stmt::Syscall {
                num: Expr::Imm(60),
                args: vec![Expr::Imm(0)],
                result: None,
            },
        ],
    ));

    let linked = compile_standalone_program(&program, Arch::X86_64).unwrap();
    let image = write_elf(&linked, Arch::X86_64, &ElfOptions::default()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hexprint");
    std::fs::write(&path, &image).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let output = std::process::Command::new(&path).output().unwrap();
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(output.stdout, b"v=beef\n");
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[test]
fn cross_method_calls_link_and_run() {
    use std::os::unix::fs::PermissionsExt;

    // main exits with helper(40, 2).
    let mut program = Program::new("main");
    program.add_method(Method::new(
        "main",
        vec![
            Stmt::Call {
                target: Expr::MethodPointer("helper".into()),
                args: vec![Expr::Imm(40), Expr::Imm(2)],
                result: Some("code".into()),
            },
            Stmt::Syscall {
                num: Expr::Imm(60),
                args: vec![Expr::var("code")],
                result: None,
            },
        ],
    ));
    program.add_method(Method::new(
        "helper",
        vec![
            Stmt::DeclareParam("a".into()),
            Stmt::DeclareParam("b".into()),
            Stmt::Return(Some(Expr::var("a").add(Expr::var("b")))),
        ],
    ));

    let linked = compile_standalone_program(&program, Arch::X86_64).unwrap();
    let image = write_elf(&linked, Arch::X86_64, &ElfOptions::default()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calls");
    std::fs::write(&path, &image).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let output = std::process::Command::new(&path).output().unwrap();
    assert_eq!(output.status.code(), Some(42));
}
