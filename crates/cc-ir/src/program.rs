// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! IR data model: programs, methods and the fragment vocabulary.

use std::collections::BTreeMap;

use cc_asm::Arch;

/// A compilable unit: an entrypoint, methods by name, global reservations
/// by name. `BTreeMap` keeps link order deterministic.
#[derive(Clone, Debug, Default)]
pub struct Program {
    pub entrypoint: String,
    pub methods: BTreeMap<String, Method>,
    pub globals: BTreeMap<String, Global>,
}

impl Program {
    pub fn new(entrypoint: impl Into<String>) -> Self {
        Program {
            entrypoint: entrypoint.into(),
            methods: BTreeMap::new(),
            globals: BTreeMap::new(),
        }
    }

    pub fn add_method(&mut self, method: Method) -> &mut Self {
        self.methods.insert(method.name.clone(), method);
        self
    }

    pub fn add_global(&mut self, name: impl Into<String>, size: u64, align_pow2: u32) -> &mut Self {
        self.globals.insert(name.into(), Global { size, align_pow2 });
        self
    }
}

/// A zero-initialized program-wide reservation.
#[derive(Clone, Copy, Debug)]
pub struct Global {
    pub size: u64,
    pub align_pow2: u32,
}

#[derive(Clone, Debug)]
pub struct Method {
    pub name: String,
    pub body: Vec<Stmt>,
}

impl Method {
    pub fn new(name: impl Into<String>, body: Vec<Stmt>) -> Self {
        Method {
            name: name.into(),
            body,
        }
    }
}

/// Value-producing fragments. Every value is a 64-bit word; variables are
/// symbolic stack slots resolved by the compiler's frame pass.
#[derive(Clone, Debug)]
pub enum Expr {
    Imm(i64),
    Var(String),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Shl(Box<Expr>, u8),
    Shr(Box<Expr>, u8),
    /// Pointer to pooled literal bytes.
    ConstBytes { bytes: Vec<u8>, zero_term: bool },
    /// Address of a method, resolved at program link.
    MethodPointer(String),
    /// Address of a program global, resolved at program link.
    GlobalPointer(String),
    /// 64-bit load from an in-scope stack slot.
    SlotLoad { slot: String, disp: u64 },
    /// Address of a byte within an in-scope stack slot.
    SlotPointer { slot: String, disp: u64 },
}

impl Expr {
    pub fn add(self, rhs: Expr) -> Expr {
        Expr::Add(Box::new(self), Box::new(rhs))
    }

    pub fn sub(self, rhs: Expr) -> Expr {
        Expr::Sub(Box::new(self), Box::new(rhs))
    }

    pub fn and(self, rhs: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(rhs))
    }

    pub fn shl(self, shift: u8) -> Expr {
        Expr::Shl(Box::new(self), shift)
    }

    pub fn shr(self, shift: u8) -> Expr {
        Expr::Shr(Box::new(self), shift)
    }

    pub fn var(name: impl Into<String>) -> Expr {
        Expr::Var(name.into())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Unsigned greater-than.
    Above,
    /// Unsigned less-than.
    Below,
}

#[derive(Clone, Debug)]
pub enum CondExpr {
    IsZero(Expr),
    IsNegative(Expr),
    Cmp { lhs: Expr, op: CmpOp, rhs: Expr },
}

/// Statement fragments, in method order.
#[derive(Clone, Debug)]
pub enum Stmt {
    /// Bind the next incoming argument register to a variable. Collected
    /// in order by a pre-pass; position in the body is otherwise inert.
    DeclareParam(String),
    Assign(String, Expr),
    If {
        cond: CondExpr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    Label(String),
    Goto(String),
    Return(Option<Expr>),
    Syscall {
        num: Expr,
        args: Vec<Expr>,
        result: Option<String>,
    },
    /// Hex-formatted debug output; `%x` placeholders consume `args`.
    Printf { format: String, args: Vec<Expr> },
    Call {
        target: Expr,
        args: Vec<Expr>,
        result: Option<String>,
    },
    /// Reserve `size` bytes of scratch stack for the body's scope.
    WithStackSlot {
        name: String,
        size: u64,
        body: Vec<Stmt>,
    },
    /// 64-bit store into an in-scope stack slot.
    SlotStore {
        slot: String,
        disp: u64,
        value: Expr,
    },
    /// Raw pre-encoded bytes for exactly one target.
    Raw { arch: Arch, bytes: Vec<u8> },
}
