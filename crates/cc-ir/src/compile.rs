// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Method lowering.
//!
//! A pre-pass assigns every variable a dense 8-byte stack offset and sizes
//! the scratch-slot region; the frame is rounded to the 16-byte ABI
//! alignment. Registers come from a free list over the target's
//! caller-saved pool and live only for the duration of one statement;
//! results are spilled back to their stack slot immediately.

use std::collections::{HashMap, HashSet};

use cc_asm::{AluOp, AsmProgram, Cond, Emitter, Reg};

use crate::link::{global_token, method_token};
use crate::{CmpOp, CondExpr, Expr, IrError, Method, Result, Stmt};

pub fn compile_method<E: Emitter>(method: &Method, mut emitter: E) -> Result<AsmProgram> {
    let frame = FrameLayout::build(method)?;
    if frame.params.len() > emitter.param_regs().len() {
        return Err(IrError::TooManyParams(frame.params.len()));
    }

    let mut compiler = MethodCompiler {
        pool: emitter.scratch_regs().to_vec(),
        e: &mut emitter,
        frame: &frame,
        active_slots: HashMap::new(),
        slot_cursor: 0,
    };

    // Prologue: carve the frame, then pin incoming arguments to their
    // variable slots before any body fragment can clobber them.
    compiler.e.adjust_sp(-frame.frame_size)?;
    for (i, name) in frame.params.iter().enumerate() {
        let reg = compiler.e.param_regs()[i];
        let off = frame.var_offset(name)?;
        let sp = compiler.e.stack_pointer();
        compiler.e.mov_to_mem(sp, off, reg)?;
    }

    compiler.lower_body(&method.body)?;

    // Implicit fall-through return mirrors the prologue.
    compiler.e.adjust_sp(frame.frame_size)?;
    compiler.e.ret()?;

    emitter.finalize().map_err(IrError::Asm)
}

/// Stack frame layout computed before lowering.
struct FrameLayout {
    var_offsets: HashMap<String, i32>,
    params: Vec<String>,
    /// Byte offset of the scratch-slot region, above the variables.
    slot_area: i32,
    frame_size: i64,
}

impl FrameLayout {
    fn build(method: &Method) -> Result<Self> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut params = Vec::new();
        collect_vars(&method.body, &mut order, &mut seen, &mut params);

        let var_offsets: HashMap<String, i32> =
            order.iter().enumerate().map(|(i, n)| (n.clone(), (i * 8) as i32)).collect();
        let slot_area = (order.len() * 8) as i32;
        let slot_bytes = max_slot_bytes(&method.body, 0);
        let frame_size = ((slot_area as u64 + slot_bytes + 15) & !15) as i64;

        Ok(FrameLayout {
            var_offsets,
            params,
            slot_area,
            frame_size,
        })
    }

    fn var_offset(&self, name: &str) -> Result<i32> {
        self.var_offsets
            .get(name)
            .copied()
            .ok_or_else(|| IrError::UnknownVariable(name.to_string()))
    }
}

fn collect_vars(
    body: &[Stmt],
    order: &mut Vec<String>,
    seen: &mut HashSet<String>,
    params: &mut Vec<String>,
) {
    let mut add = |name: &String, order: &mut Vec<String>, seen: &mut HashSet<String>| {
        if seen.insert(name.clone()) {
            order.push(name.clone());
        }
    };
    for stmt in body {
        match stmt {
            Stmt::DeclareParam(name) => {
                params.push(name.clone());
                add(name, order, seen);
            }
            Stmt::Assign(name, _) => add(name, order, seen),
            Stmt::Syscall {
                result: Some(name), ..
            }
            | Stmt::Call {
                result: Some(name), ..
            } => add(name, order, seen),
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                collect_vars(then_body, order, seen, params);
                collect_vars(else_body, order, seen, params);
            }
            Stmt::WithStackSlot { body, .. } => collect_vars(body, order, seen, params),
            _ => {}
        }
    }
}

fn slot_chunk(size: u64) -> u64 {
    ((size.max(1) + 7) / 8) * 8
}

fn max_slot_bytes(body: &[Stmt], current: u64) -> u64 {
    let mut max = current;
    for stmt in body {
        match stmt {
            Stmt::WithStackSlot { size, body, .. } => {
                let inner = max_slot_bytes(body, current + slot_chunk(*size));
                max = max.max(inner);
            }
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                max = max.max(max_slot_bytes(then_body, current));
                max = max.max(max_slot_bytes(else_body, current));
            }
            _ => {}
        }
    }
    max
}

struct MethodCompiler<'a, E: Emitter> {
    e: &'a mut E,
    frame: &'a FrameLayout,
    pool: Vec<Reg>,
    /// name → (frame offset, size) for slots whose scope is open.
    active_slots: HashMap<String, (i32, u64)>,
    slot_cursor: u64,
}

impl<E: Emitter> MethodCompiler<'_, E> {
    fn alloc(&mut self) -> Result<Reg> {
        self.pool.pop().ok_or(IrError::RegistersExhausted)
    }

    fn release(&mut self, reg: Reg) {
        self.pool.push(reg);
    }

    /// Take a specific register out of the pool; returns whether it was
    /// actually there (argument registers often are not).
    fn reserve(&mut self, reg: Reg) -> bool {
        match self.pool.iter().position(|&r| r == reg) {
            Some(i) => {
                self.pool.remove(i);
                true
            }
            None => false,
        }
    }

    fn sp(&self) -> Reg {
        self.e.stack_pointer()
    }

    fn lower_body(&mut self, body: &[Stmt]) -> Result<()> {
        for stmt in body {
            self.lower_stmt(stmt)?;
        }
        Ok(())
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::DeclareParam(_) => Ok(()),
            Stmt::Assign(name, expr) => {
                let off = self.frame.var_offset(name)?;
                let reg = self.alloc()?;
                self.eval_into(expr, reg)?;
                let sp = self.sp();
                self.e.mov_to_mem(sp, off, reg)?;
                self.release(reg);
                Ok(())
            }
            Stmt::Label(name) => self.e.bind_label(name).map_err(IrError::Asm),
            Stmt::Goto(name) => self.e.jump_label(Cond::Always, name).map_err(IrError::Asm),
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => self.lower_if(cond, then_body, else_body),
            Stmt::Return(value) => self.lower_return(value.as_ref()),
            Stmt::Syscall { num, args, result } => self.lower_syscall(num, args, result.as_deref()),
            Stmt::Printf { format, args } => self.lower_printf(format, args),
            Stmt::Call {
                target,
                args,
                result,
            } => self.lower_call(target, args, result.as_deref()),
            Stmt::WithStackSlot { name, size, body } => self.lower_slot_scope(name, *size, body),
            Stmt::SlotStore { slot, disp, value } => {
                let off = self.slot_offset(slot, *disp, 8)?;
                let reg = self.alloc()?;
                self.eval_into(value, reg)?;
                let sp = self.sp();
                self.e.mov_to_mem(sp, off, reg)?;
                self.release(reg);
                Ok(())
            }
            Stmt::Raw { arch, bytes } => {
                if *arch != self.e.arch() {
                    return Err(IrError::RawArchMismatch(*arch, self.e.arch()));
                }
                self.e.ctx_mut().emit(bytes);
                Ok(())
            }
        }
    }

    fn lower_if(
        &mut self,
        cond: &CondExpr,
        then_body: &[Stmt],
        else_body: &[Stmt],
    ) -> Result<()> {
        let id = self.e.ctx_mut().next_label_id();
        let l_then = format!(".if{}_then", id);
        let l_else = format!(".if{}_else", id);
        let l_end = format!(".if{}_end", id);

        self.jump_if_true(cond, &l_then)?;
        self.e.jump_label(Cond::Always, &l_else)?;
        self.e.bind_label(&l_then)?;
        self.lower_body(then_body)?;
        self.e.jump_label(Cond::Always, &l_end)?;
        self.e.bind_label(&l_else)?;
        self.lower_body(else_body)?;
        self.e.bind_label(&l_end)?;
        Ok(())
    }

    fn jump_if_true(&mut self, cond: &CondExpr, label: &str) -> Result<()> {
        match cond {
            CondExpr::IsZero(expr) => {
                let reg = self.alloc()?;
                self.eval_into(expr, reg)?;
                self.e.test_zero(reg)?;
                self.release(reg);
                self.e.jump_label(Cond::Zero, label)?;
            }
            CondExpr::IsNegative(expr) => {
                let reg = self.alloc()?;
                self.eval_into(expr, reg)?;
                self.e.test_zero(reg)?;
                self.release(reg);
                self.e.jump_label(Cond::Neg, label)?;
            }
            CondExpr::Cmp { lhs, op, rhs } => {
                let rl = self.alloc()?;
                self.eval_into(lhs, rl)?;
                let rr = self.alloc()?;
                self.eval_into(rhs, rr)?;
                self.e.alu_reg(AluOp::Cmp, rl, rr)?;
                self.release(rr);
                self.release(rl);
                match op {
                    CmpOp::Eq => self.e.jump_label(Cond::Eq, label)?,
                    CmpOp::Ne => self.e.jump_label(Cond::Ne, label)?,
                    CmpOp::Lt => self.e.jump_label(Cond::Lt, label)?,
                    CmpOp::Gt => self.e.jump_label(Cond::Gt, label)?,
                    CmpOp::Above => self.e.jump_label(Cond::Above, label)?,
                    CmpOp::Below => self.e.jump_label(Cond::Below, label)?,
                    // Composite conditions expand to an ordered pair.
                    CmpOp::Le => {
                        self.e.jump_label(Cond::Lt, label)?;
                        self.e.jump_label(Cond::Eq, label)?;
                    }
                    CmpOp::Ge => {
                        self.e.jump_label(Cond::Gt, label)?;
                        self.e.jump_label(Cond::Eq, label)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn lower_return(&mut self, value: Option<&Expr>) -> Result<()> {
        if let Some(expr) = value {
            let ret = self.e.return_reg();
            let reserved = self.reserve(ret);
            self.eval_into(expr, ret)?;
            if reserved {
                self.release(ret);
            }
        }
        self.e.adjust_sp(self.frame.frame_size)?;
        self.e.ret()?;
        Ok(())
    }

    fn lower_syscall(&mut self, num: &Expr, args: &[Expr], result: Option<&str>) -> Result<()> {
        let arg_regs = self.e.syscall_arg_regs();
        if args.len() > arg_regs.len() {
            return Err(IrError::TooManySyscallArgs(args.len()));
        }
        let num_reg = self.e.syscall_num_reg();

        // Bias evaluation toward the destination registers: reserve them
        // up front so subexpression temporaries cannot collide.
        let mut reserved = Vec::new();
        for &reg in arg_regs[..args.len()].iter().chain([num_reg].iter()) {
            if self.reserve(reg) {
                reserved.push(reg);
            }
        }
        let arg_regs = arg_regs.to_vec();
        for (i, arg) in args.iter().enumerate() {
            self.eval_into(arg, arg_regs[i])?;
        }
        self.eval_into(num, num_reg)?;
        self.e.syscall()?;

        if let Some(name) = result {
            let off = self.frame.var_offset(name)?;
            let ret = self.e.return_reg();
            let sp = self.sp();
            self.e.mov_to_mem(sp, off, ret)?;
        }
        for reg in reserved {
            self.release(reg);
        }
        Ok(())
    }

    fn lower_printf(&mut self, format: &str, args: &[Expr]) -> Result<()> {
        let mut regs = Vec::with_capacity(args.len());
        for arg in args {
            let reg = self.alloc()?;
            self.eval_into(arg, reg)?;
            regs.push(reg);
        }
        self.e.printf(format, &regs)?;
        for reg in regs {
            self.release(reg);
        }
        Ok(())
    }

    fn lower_call(&mut self, target: &Expr, args: &[Expr], result: Option<&str>) -> Result<()> {
        let param_regs = self.e.param_regs();
        if args.len() > param_regs.len() {
            return Err(IrError::TooManyParams(args.len()));
        }
        let mut reserved = Vec::new();
        for &reg in &param_regs[..args.len()] {
            if self.reserve(reg) {
                reserved.push(reg);
            }
        }
        let param_regs = param_regs.to_vec();
        for (i, arg) in args.iter().enumerate() {
            self.eval_into(arg, param_regs[i])?;
        }
        let tgt = self.alloc()?;
        self.eval_into(target, tgt)?;
        self.e.call_reg(tgt)?;
        self.release(tgt);

        if let Some(name) = result {
            let off = self.frame.var_offset(name)?;
            let ret = self.e.return_reg();
            let sp = self.sp();
            self.e.mov_to_mem(sp, off, ret)?;
        }
        for reg in reserved {
            self.release(reg);
        }
        Ok(())
    }

    fn lower_slot_scope(&mut self, name: &str, size: u64, body: &[Stmt]) -> Result<()> {
        let bytes = slot_chunk(size);
        let offset = self.frame.slot_area + self.slot_cursor as i32;
        self.active_slots.insert(name.to_string(), (offset, bytes));
        self.slot_cursor += bytes;

        let result = self.lower_body(body);

        self.slot_cursor -= bytes;
        self.active_slots.remove(name);
        result
    }

    fn slot_offset(&self, slot: &str, disp: u64, access: u64) -> Result<i32> {
        let &(offset, size) = self
            .active_slots
            .get(slot)
            .ok_or_else(|| IrError::UnknownSlot(slot.to_string()))?;
        if disp + access > size {
            return Err(IrError::SlotOutOfBounds {
                slot: slot.to_string(),
                disp,
                size,
            });
        }
        Ok(offset + disp as i32)
    }

    fn eval_into(&mut self, expr: &Expr, dst: Reg) -> Result<()> {
        match expr {
            Expr::Imm(value) => self.e.mov_imm(dst, *value as u64)?,
            Expr::Var(name) => {
                let off = self.frame.var_offset(name)?;
                let sp = self.sp();
                self.e.mov_from_mem(dst, sp, off)?;
            }
            Expr::Add(lhs, rhs) => self.eval_binop(AluOp::Add, lhs, rhs, dst)?,
            Expr::Sub(lhs, rhs) => self.eval_binop(AluOp::Sub, lhs, rhs, dst)?,
            Expr::And(lhs, rhs) => self.eval_binop(AluOp::And, lhs, rhs, dst)?,
            Expr::Shl(inner, shift) => {
                self.eval_into(inner, dst)?;
                self.e.shl_imm(dst, *shift)?;
            }
            Expr::Shr(inner, shift) => {
                self.eval_into(inner, dst)?;
                self.e.shr_imm(dst, *shift)?;
            }
            Expr::ConstBytes { bytes, zero_term } => {
                self.e.load_constant_bytes(dst, bytes, *zero_term)?;
            }
            Expr::MethodPointer(name) => self.e.load_token(dst, method_token(name))?,
            Expr::GlobalPointer(name) => self.e.load_token(dst, global_token(name))?,
            Expr::SlotLoad { slot, disp } => {
                let off = self.slot_offset(slot, *disp, 8)?;
                let sp = self.sp();
                self.e.mov_from_mem(dst, sp, off)?;
            }
            Expr::SlotPointer { slot, disp } => {
                let off = self.slot_offset(slot, *disp, 1)?;
                self.e.lea_sp(dst, off)?;
            }
        }
        Ok(())
    }

    fn eval_binop(&mut self, op: AluOp, lhs: &Expr, rhs: &Expr, dst: Reg) -> Result<()> {
        self.eval_into(lhs, dst)?;
        if let Expr::Imm(v) = rhs {
            if (i32::MIN as i64..=i32::MAX as i64).contains(v) {
                self.e.alu_imm(op, dst, *v)?;
                return Ok(());
            }
        }
        let tmp = self.alloc()?;
        self.eval_into(rhs, tmp)?;
        self.e.alu_reg(op, dst, tmp)?;
        self.release(tmp);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cc_asm::x86_64::X86Emitter;

    fn compile(body: Vec<Stmt>) -> Result<AsmProgram> {
        compile_method(&Method::new("m", body), X86Emitter::new())
    }

    #[test]
    fn frame_rounds_to_sixteen_bytes() {
        let layout = FrameLayout::build(&Method::new(
            "m",
            vec![
                Stmt::DeclareParam("a".into()),
                Stmt::Assign("b".into(), Expr::Imm(1)),
                Stmt::Assign("c".into(), Expr::Imm(2)),
            ],
        ))
        .unwrap();
        // Three 8-byte variables round up to 32.
        assert_eq!(layout.frame_size, 32);
        assert_eq!(layout.var_offset("a").unwrap(), 0);
        assert_eq!(layout.var_offset("b").unwrap(), 8);
        assert_eq!(layout.var_offset("c").unwrap(), 16);
    }

    #[test]
    fn nested_slot_scopes_stack_their_reservations() {
        let body = vec![Stmt::WithStackSlot {
            name: "outer".into(),
            size: 16,
            body: vec![Stmt::WithStackSlot {
                name: "inner".into(),
                size: 8,
                body: vec![],
            }],
        }];
        assert_eq!(max_slot_bytes(&body, 0), 24);
        // Sibling scopes reuse the same space.
        let siblings = vec![
            Stmt::WithStackSlot {
                name: "a".into(),
                size: 32,
                body: vec![],
            },
            Stmt::WithStackSlot {
                name: "b".into(),
                size: 16,
                body: vec![],
            },
        ];
        assert_eq!(max_slot_bytes(&siblings, 0), 32);
    }

    #[test]
    fn unknown_variable_is_an_error() {
        let err = compile(vec![Stmt::Return(Some(Expr::var("ghost")))]).unwrap_err();
        assert!(matches!(err, IrError::UnknownVariable(name) if name == "ghost"));
    }

    #[test]
    fn too_many_params_is_an_error() {
        let body: Vec<Stmt> =
            (0..8).map(|i| Stmt::DeclareParam(format!("p{}", i))).collect();
        assert!(matches!(compile(body), Err(IrError::TooManyParams(8))));
    }

    #[test]
    fn slot_access_is_bounds_checked() {
        let body = vec![Stmt::WithStackSlot {
            name: "buf".into(),
            size: 16,
            body: vec![Stmt::SlotStore {
                slot: "buf".into(),
                disp: 16,
                value: Expr::Imm(0),
            }],
        }];
        assert!(matches!(
            compile(body),
            Err(IrError::SlotOutOfBounds { disp: 16, .. })
        ));
    }

    #[test]
    fn slot_use_outside_its_scope_is_an_error() {
        let body = vec![
            Stmt::WithStackSlot {
                name: "buf".into(),
                size: 8,
                body: vec![],
            },
            Stmt::SlotStore {
                slot: "buf".into(),
                disp: 0,
                value: Expr::Imm(0),
            },
        ];
        assert!(matches!(compile(body), Err(IrError::UnknownSlot(_))));
    }

    #[test]
    fn raw_fragments_must_match_the_target() {
        let body = vec![Stmt::Raw {
            arch: cc_asm::Arch::Aarch64,
            bytes: vec![0xd6, 0x5f, 0x03, 0xc0],
        }];
        assert!(matches!(compile(body), Err(IrError::RawArchMismatch(_, _))));

        let body = vec![Stmt::Raw {
            arch: cc_asm::Arch::X86_64,
            bytes: vec![0x90],
        }];
        let program = compile(body).unwrap();
        assert_eq!(program.code[0], 0x90);
    }

    #[test]
    fn params_spill_into_their_slots() {
        let program = compile(vec![
            Stmt::DeclareParam("a".into()),
            Stmt::Return(Some(Expr::var("a"))),
        ])
        .unwrap();
        // sub rsp, 16; mov [rsp], rdi ...
        assert_eq!(&program.code[..4], &[0x48, 0x83, 0xec, 0x10]);
        assert_eq!(&program.code[4..8], &[0x48, 0x89, 0x3c, 0x24]);
    }
}
