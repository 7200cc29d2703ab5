// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Cross-target lowering: the same IR must assemble for both primary
//! targets, with target-appropriate relocation shapes.

use cc_asm::{Arch, Arm64Emitter, X86Emitter};
use cc_ir::{
    CmpOp, CondExpr, Expr, Method, Program, Stmt, compile_method, compile_standalone_program,
};

fn sample_method() -> Method {
    Method::new(
        "clamp_sum",
        vec![
            Stmt::DeclareParam("a".into()),
            Stmt::DeclareParam("b".into()),
            Stmt::Assign("sum".into(), Expr::var("a").add(Expr::var("b"))),
            Stmt::If {
                cond: CondExpr::Cmp {
                    lhs: Expr::var("sum"),
                    op: CmpOp::Le,
                    rhs: Expr::Imm(255),
                },
                then_body: vec![Stmt::Return(Some(Expr::var("sum")))],
                else_body: vec![Stmt::Return(Some(Expr::Imm(255)))],
            },
        ],
    )
}

#[test]
fn both_targets_lower_the_same_method() {
    let x86 = compile_method(&sample_method(), X86Emitter::new()).unwrap();
    let arm = compile_method(&sample_method(), Arm64Emitter::new()).unwrap();
    assert!(!x86.code.is_empty());
    assert!(!arm.code.is_empty());
    // A64 text is word-sized.
    assert_eq!(arm.code.len() % 4, 0);
}

#[test]
fn arm64_literals_relocate_through_pool_slots() {
    let method = Method::new(
        "greet",
        vec![
            Stmt::Assign(
                "p".into(),
                Expr::ConstBytes {
                    bytes: b"hello".to_vec(),
                    zero_term: true,
                },
            ),
            Stmt::Return(Some(Expr::var("p"))),
        ],
    );
    let program = compile_method(&method, Arm64Emitter::new()).unwrap();
    assert_eq!(program.relocations.len(), 1);
    let at = program.relocations[0] as usize;
    // The pool slot holds the literal's base-0 address.
    let value = u64::from_le_bytes(program.code[at..at + 8].try_into().unwrap());
    let lit = &program.code[value as usize..value as usize + 6];
    assert_eq!(lit, b"hello\0");
}

#[test]
fn standalone_programs_link_for_aarch64() {
    let mut program = Program::new("main");
    program.add_global("scratch", 128, 4);
    program.add_method(Method::new(
        "main",
        vec![
            Stmt::Assign("buf".into(), Expr::GlobalPointer("scratch".into())),
            Stmt::Call {
                target: Expr::MethodPointer("helper".into()),
                args: vec![Expr::var("buf")],
                result: Some("r".into()),
            },
            // exit(r) via the arm64 syscall convention
            Stmt::Syscall {
                num: Expr::Imm(93),
                args: vec![Expr::var("r")],
                result: None,
            },
        ],
    ));
    program.add_method(Method::new(
        "helper",
        vec![
            Stmt::DeclareParam("p".into()),
            Stmt::Return(Some(Expr::var("p").and(Expr::Imm(0xff)))),
        ],
    ));

    let linked = compile_standalone_program(&program, Arch::Aarch64).unwrap();
    assert!(linked.bss_size >= 128);
    // Every token was resolved and registered as a relocation.
    let mut pos = 0;
    while pos + 8 <= linked.code.len() {
        let v = u64::from_le_bytes(linked.code[pos..pos + 8].try_into().unwrap());
        assert!(!cc_ir::is_token(v), "unresolved token at {}", pos);
        pos += 1;
    }
    assert!(linked.relocations.len() >= 2);
}

#[test]
fn riscv_is_not_an_ir_target() {
    let mut program = Program::new("main");
    program.add_method(Method::new("main", vec![Stmt::Return(None)]));
    assert!(matches!(
        compile_standalone_program(&program, Arch::Riscv64),
        Err(cc_ir::IrError::UnsupportedArch(Arch::Riscv64))
    ));
}
