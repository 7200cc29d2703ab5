// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Structural validation ahead of linking: label discipline per method
//! and symbol references that must resolve. Catching these before
//! emission gives file/line-free but at least name-carrying diagnostics
//! instead of a late token-scan failure.

use std::collections::HashSet;

use crate::{CondExpr, Expr, IrError, Method, Program, Result, Stmt};

/// Check the whole program: entrypoint presence, per-method label
/// discipline, and method/global pointer targets.
pub fn validate_program(program: &Program) -> Result<()> {
    if !program.methods.contains_key(&program.entrypoint) {
        return Err(IrError::MissingEntrypoint(program.entrypoint.clone()));
    }
    for method in program.methods.values() {
        validate_method(program, method)?;
    }
    Ok(())
}

fn validate_method(program: &Program, method: &Method) -> Result<()> {
    let mut labels = HashSet::new();
    collect_labels(&method.body, method, &mut labels)?;
    check_body(program, method, &method.body, &labels)
}

fn collect_labels(
    body: &[Stmt],
    method: &Method,
    labels: &mut HashSet<String>,
) -> Result<()> {
    for stmt in body {
        match stmt {
            Stmt::Label(name) => {
                if !labels.insert(name.clone()) {
                    return Err(IrError::DuplicateLabel {
                        method: method.name.clone(),
                        label: name.clone(),
                    });
                }
            }
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                collect_labels(then_body, method, labels)?;
                collect_labels(else_body, method, labels)?;
            }
            Stmt::WithStackSlot { body, .. } => collect_labels(body, method, labels)?,
            _ => {}
        }
    }
    Ok(())
}

fn check_body(
    program: &Program,
    method: &Method,
    body: &[Stmt],
    labels: &HashSet<String>,
) -> Result<()> {
    for stmt in body {
        match stmt {
            Stmt::Goto(label) => {
                if !labels.contains(label) {
                    return Err(IrError::UndefinedLabel {
                        method: method.name.clone(),
                        label: label.clone(),
                    });
                }
            }
            Stmt::Assign(_, expr) | Stmt::SlotStore { value: expr, .. } => {
                check_expr(program, expr)?;
            }
            Stmt::Return(Some(expr)) => check_expr(program, expr)?,
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                match cond {
                    CondExpr::IsZero(e) | CondExpr::IsNegative(e) => check_expr(program, e)?,
                    CondExpr::Cmp { lhs, rhs, .. } => {
                        check_expr(program, lhs)?;
                        check_expr(program, rhs)?;
                    }
                }
                check_body(program, method, then_body, labels)?;
                check_body(program, method, else_body, labels)?;
            }
            Stmt::Syscall { num, args, .. } => {
                check_expr(program, num)?;
                for arg in args {
                    check_expr(program, arg)?;
                }
            }
            Stmt::Printf { args, .. } => {
                for arg in args {
                    check_expr(program, arg)?;
                }
            }
            Stmt::Call { target, args, .. } => {
                check_expr(program, target)?;
                for arg in args {
                    check_expr(program, arg)?;
                }
            }
            Stmt::WithStackSlot { body, .. } => {
                check_body(program, method, body, labels)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn check_expr(program: &Program, expr: &Expr) -> Result<()> {
    match expr {
        Expr::MethodPointer(name) => {
            if !program.methods.contains_key(name) {
                return Err(IrError::UnknownMethod(name.clone()));
            }
        }
        Expr::GlobalPointer(name) => {
            if !program.globals.contains_key(name) {
                return Err(IrError::UnknownGlobal(name.clone()));
            }
        }
        Expr::Add(a, b) | Expr::Sub(a, b) | Expr::And(a, b) => {
            check_expr(program, a)?;
            check_expr(program, b)?;
        }
        Expr::Shl(a, _) | Expr::Shr(a, _) => check_expr(program, a)?,
        _ => {}
    }
    Ok(())
}
