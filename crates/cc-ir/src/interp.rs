// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Reference interpreter for the arithmetic/control subset of the IR.
//!
//! Used by the codegen-equivalence tests: for any supported method,
//! `jit(method)(args)` must equal `interpret(method, args)`. Fragments
//! with machine-level side effects (syscalls, printf, calls, slots, raw
//! bytes) are out of scope and reported as uninterpretable.

use std::collections::HashMap;

use crate::{CmpOp, CondExpr, Expr, IrError, Method, Result, Stmt};

const STEP_BUDGET: usize = 1_000_000;

enum FlatOp<'m> {
    Assign(&'m str, &'m Expr),
    BranchIfTrue(&'m CondExpr, String),
    Jump(String),
    Label(String),
    Return(Option<&'m Expr>),
}

/// Execute `method` over 64-bit word semantics and return its result.
pub fn interpret(method: &Method, args: &[u64]) -> Result<u64> {
    let mut ops = Vec::new();
    let mut params = Vec::new();
    let mut synth = 0usize;
    flatten(&method.body, &mut ops, &mut params, &mut synth)?;

    let mut labels: HashMap<&str, usize> = HashMap::new();
    for (i, op) in ops.iter().enumerate() {
        if let FlatOp::Label(name) = op {
            labels.insert(name, i);
        }
    }

    let mut vars: HashMap<&str, u64> = HashMap::new();
    for (i, &name) in params.iter().enumerate() {
        vars.insert(name, args.get(i).copied().unwrap_or(0));
    }

    let mut pc = 0usize;
    let mut steps = 0usize;
    while pc < ops.len() {
        steps += 1;
        if steps > STEP_BUDGET {
            return Err(IrError::StepBudget);
        }
        match &ops[pc] {
            FlatOp::Label(_) => pc += 1,
            FlatOp::Assign(name, expr) => {
                let value = eval(expr, &vars)?;
                vars.insert(*name, value);
                pc += 1;
            }
            FlatOp::BranchIfTrue(cond, target) => {
                if eval_cond(cond, &vars)? {
                    pc = *labels.get(target.as_str()).ok_or_else(|| {
                        IrError::UnknownVariable(target.clone())
                    })?;
                } else {
                    pc += 1;
                }
            }
            FlatOp::Jump(target) => {
                pc = *labels
                    .get(target.as_str())
                    .ok_or_else(|| IrError::UnknownVariable(target.clone()))?;
            }
            FlatOp::Return(value) => {
                return match value {
                    Some(expr) => eval(expr, &vars),
                    None => Ok(0),
                };
            }
        }
    }
    Err(IrError::NoReturn)
}

fn flatten<'m>(
    body: &'m [Stmt],
    ops: &mut Vec<FlatOp<'m>>,
    params: &mut Vec<&'m str>,
    synth: &mut usize,
) -> Result<()> {
    for stmt in body {
        match stmt {
            Stmt::DeclareParam(name) => params.push(name.as_str()),
            Stmt::Assign(name, expr) => ops.push(FlatOp::Assign(name, expr)),
            Stmt::Label(name) => ops.push(FlatOp::Label(name.clone())),
            Stmt::Goto(name) => ops.push(FlatOp::Jump(name.clone())),
            Stmt::Return(value) => ops.push(FlatOp::Return(value.as_ref())),
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                let id = *synth;
                *synth += 1;
                let l_then = format!("__if{}_then", id);
                let l_else = format!("__if{}_else", id);
                let l_end = format!("__if{}_end", id);
                ops.push(FlatOp::BranchIfTrue(cond, l_then.clone()));
                ops.push(FlatOp::Jump(l_else.clone()));
                ops.push(FlatOp::Label(l_then));
                flatten(then_body, ops, params, synth)?;
                ops.push(FlatOp::Jump(l_end.clone()));
                ops.push(FlatOp::Label(l_else));
                flatten(else_body, ops, params, synth)?;
                ops.push(FlatOp::Label(l_end));
            }
            Stmt::Syscall { .. }
            | Stmt::Printf { .. }
            | Stmt::Call { .. }
            | Stmt::WithStackSlot { .. }
            | Stmt::SlotStore { .. }
            | Stmt::Raw { .. } => return Err(IrError::Uninterpretable),
        }
    }
    Ok(())
}

fn eval(expr: &Expr, vars: &HashMap<&str, u64>) -> Result<u64> {
    Ok(match expr {
        Expr::Imm(value) => *value as u64,
        Expr::Var(name) => *vars
            .get(name.as_str())
            .ok_or_else(|| IrError::UnknownVariable(name.clone()))?,
        Expr::Add(a, b) => eval(a, vars)?.wrapping_add(eval(b, vars)?),
        Expr::Sub(a, b) => eval(a, vars)?.wrapping_sub(eval(b, vars)?),
        Expr::And(a, b) => eval(a, vars)? & eval(b, vars)?,
        Expr::Shl(a, s) => eval(a, vars)? << (s & 63),
        Expr::Shr(a, s) => eval(a, vars)? >> (s & 63),
        Expr::ConstBytes { .. }
        | Expr::MethodPointer(_)
        | Expr::GlobalPointer(_)
        | Expr::SlotLoad { .. }
        | Expr::SlotPointer { .. } => return Err(IrError::Uninterpretable),
    })
}

fn eval_cond(cond: &CondExpr, vars: &HashMap<&str, u64>) -> Result<bool> {
    Ok(match cond {
        CondExpr::IsZero(expr) => eval(expr, vars)? == 0,
        CondExpr::IsNegative(expr) => (eval(expr, vars)? as i64) < 0,
        CondExpr::Cmp { lhs, op, rhs } => {
            let (l, r) = (eval(lhs, vars)?, eval(rhs, vars)?);
            let (ls, rs) = (l as i64, r as i64);
            match op {
                CmpOp::Eq => l == r,
                CmpOp::Ne => l != r,
                CmpOp::Lt => ls < rs,
                CmpOp::Le => ls <= rs,
                CmpOp::Gt => ls > rs,
                CmpOp::Ge => ls >= rs,
                CmpOp::Above => l > r,
                CmpOp::Below => l < r,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_method() -> Method {
        Method::new(
            "add",
            vec![
                Stmt::DeclareParam("a".into()),
                Stmt::DeclareParam("b".into()),
                Stmt::Return(Some(Expr::var("a").add(Expr::var("b")))),
            ],
        )
    }

    #[test]
    fn adds_two_params() {
        assert_eq!(interpret(&add_method(), &[3, 4]).unwrap(), 7);
    }

    #[test]
    fn loops_with_goto_terminate() {
        // sum = 0; i = n; while (i != 0) { sum += i; i -= 1 }
        let method = Method::new(
            "sum",
            vec![
                Stmt::DeclareParam("n".into()),
                Stmt::Assign("sum".into(), Expr::Imm(0)),
                Stmt::Assign("i".into(), Expr::var("n")),
                Stmt::Label("loop".into()),
                Stmt::If {
                    cond: CondExpr::IsZero(Expr::var("i")),
                    then_body: vec![Stmt::Return(Some(Expr::var("sum")))],
                    else_body: vec![],
                },
                Stmt::Assign("sum".into(), Expr::var("sum").add(Expr::var("i"))),
                Stmt::Assign("i".into(), Expr::var("i").sub(Expr::Imm(1))),
                Stmt::Goto("loop".into()),
            ],
        );
        assert_eq!(interpret(&method, &[10]).unwrap(), 55);
    }

    #[test]
    fn signed_and_unsigned_compares_differ() {
        let cmp = |op: CmpOp| {
            Method::new(
                "m",
                vec![
                    Stmt::DeclareParam("a".into()),
                    Stmt::DeclareParam("b".into()),
                    Stmt::If {
                        cond: CondExpr::Cmp {
                            lhs: Expr::var("a"),
                            op,
                            rhs: Expr::var("b"),
                        },
                        then_body: vec![Stmt::Return(Some(Expr::Imm(1)))],
                        else_body: vec![Stmt::Return(Some(Expr::Imm(0)))],
                    },
                ],
            )
        };
        let neg_one = -1i64 as u64;
        assert_eq!(interpret(&cmp(CmpOp::Lt), &[neg_one, 1]).unwrap(), 1);
        assert_eq!(interpret(&cmp(CmpOp::Below), &[neg_one, 1]).unwrap(), 0);
    }

    #[test]
    fn infinite_loop_hits_step_budget() {
        let method = Method::new(
            "spin",
            vec![Stmt::Label("l".into()), Stmt::Goto("l".into())],
        );
        assert!(matches!(interpret(&method, &[]), Err(IrError::StepBudget)));
    }

    #[test]
    fn syscalls_are_uninterpretable() {
        let method = Method::new(
            "m",
            vec![Stmt::Syscall {
                num: Expr::Imm(60),
                args: vec![Expr::Imm(0)],
                result: None,
            }],
        );
        assert!(matches!(interpret(&method, &[]), Err(IrError::Uninterpretable)));
    }
}
