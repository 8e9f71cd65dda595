// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Shared helpers for the conformance suite.
//!
//! A small expression language that can be both evaluated directly (with 32-bit wrapping
//! arithmetic) and compiled to bytecode, plus a deterministic generator for random expressions,
//! so the VM can be checked against a reference evaluator.

use stack_tape::asm::{Asm, BuildError, ProgramBuilder};
use stack_tape::native::{NoNatives, Natives};
use stack_tape::program::Program;
use stack_tape::trace::TraceMask;
use stack_tape::vm::{FaultInfo, Limits, Vm};

/// Runs `program` on a fresh VM without natives.
pub(crate) fn run(program: &Program) -> Result<i32, FaultInfo> {
    run_with(NoNatives, program)
}

/// Runs `program` on a fresh VM with `natives`.
pub(crate) fn run_with<N: Natives>(natives: N, program: &Program) -> Result<i32, FaultInfo> {
    Vm::new(natives, Limits::default()).run(program, TraceMask::NONE, None)
}

/// Builds a single-function program from `body`.
pub(crate) fn single(num_vars: u16, body: impl FnOnce(&mut Asm)) -> Result<Program, BuildError> {
    let mut a = Asm::new();
    body(&mut a);
    let mut pb = ProgramBuilder::new();
    pb.push_function(a, 0, num_vars)?;
    pb.build()
}

/// An integer expression over stack-only instructions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Expr {
    /// A constant; small ones compile to `BIPUSH`, the rest to `ILDC`.
    Const(i32),
    /// `lhs + rhs`
    Add(Box<Expr>, Box<Expr>),
    /// `lhs - rhs`
    Sub(Box<Expr>, Box<Expr>),
    /// `lhs * rhs`
    Mul(Box<Expr>, Box<Expr>),
    /// `lhs & rhs`
    And(Box<Expr>, Box<Expr>),
    /// `lhs | rhs`
    Or(Box<Expr>, Box<Expr>),
    /// `lhs ^ rhs`
    Xor(Box<Expr>, Box<Expr>),
    /// `e * e`, compiled with `DUP`.
    Square(Box<Expr>),
    /// `lhs - rhs` with the operands emitted in reverse and fixed up with `SWAP`.
    SwappedSub(Box<Expr>, Box<Expr>),
    /// `e` stored to a local and loaded back, compiled with `VSTORE`/`VLOAD`.
    ViaLocal(Box<Expr>),
}

impl Expr {
    /// Evaluates with 32-bit two's-complement wrapping.
    #[must_use]
    pub(crate) fn eval(&self) -> i32 {
        match self {
            Self::Const(v) => *v,
            Self::Add(l, r) => l.eval().wrapping_add(r.eval()),
            Self::Sub(l, r) | Self::SwappedSub(l, r) => l.eval().wrapping_sub(r.eval()),
            Self::Mul(l, r) => l.eval().wrapping_mul(r.eval()),
            Self::And(l, r) => l.eval() & r.eval(),
            Self::Or(l, r) => l.eval() | r.eval(),
            Self::Xor(l, r) => l.eval() ^ r.eval(),
            Self::Square(e) => {
                let v = e.eval();
                v.wrapping_mul(v)
            }
            Self::ViaLocal(e) => e.eval(),
        }
    }

    /// Emits code that leaves the value on the operand stack.
    pub(crate) fn emit(&self, a: &mut Asm, pb: &mut ProgramBuilder) -> Result<(), BuildError> {
        match self {
            Self::Const(v) => match i8::try_from(*v) {
                Ok(small) => {
                    a.bipush(small);
                }
                Err(_) => {
                    let idx = pb.int_const(*v)?;
                    a.ildc(idx);
                }
            },
            Self::Add(l, r) => binary(a, pb, l, r, Asm::iadd)?,
            Self::Sub(l, r) => binary(a, pb, l, r, Asm::isub)?,
            Self::Mul(l, r) => binary(a, pb, l, r, Asm::imul)?,
            Self::And(l, r) => binary(a, pb, l, r, Asm::iand)?,
            Self::Or(l, r) => binary(a, pb, l, r, Asm::ior)?,
            Self::Xor(l, r) => binary(a, pb, l, r, Asm::ixor)?,
            Self::Square(e) => {
                e.emit(a, pb)?;
                a.dup().imul();
            }
            Self::SwappedSub(l, r) => {
                r.emit(a, pb)?;
                l.emit(a, pb)?;
                a.swap().isub();
            }
            Self::ViaLocal(e) => {
                e.emit(a, pb)?;
                a.vstore(0).vload(0);
            }
        }
        Ok(())
    }

    /// Compiles to a one-function program that returns the expression's value.
    pub(crate) fn to_program(&self) -> Result<Program, BuildError> {
        let mut pb = ProgramBuilder::new();
        let mut a = Asm::new();
        self.emit(&mut a, &mut pb)?;
        a.ret();
        pb.push_function(a, 0, 1)?;
        pb.build()
    }
}

fn binary(
    a: &mut Asm,
    pb: &mut ProgramBuilder,
    l: &Expr,
    r: &Expr,
    op: fn(&mut Asm) -> &mut Asm,
) -> Result<(), BuildError> {
    l.emit(a, pb)?;
    r.emit(a, pb)?;
    op(a);
    Ok(())
}

/// Deterministic xorshift generator for reproducible random inputs.
#[derive(Clone, Debug)]
pub(crate) struct XorShift(u64);

impl XorShift {
    /// Creates a generator; a zero seed is replaced by a fixed non-zero one.
    #[must_use]
    pub(crate) fn new(seed: u64) -> Self {
        Self(if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed })
    }

    /// Next 64 random bits.
    pub(crate) fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// A random `i32` covering the full range.
    pub(crate) fn next_i32(&mut self) -> i32 {
        let b = self.next_u64().to_le_bytes();
        i32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    /// A random value in `0..n` (`n` must be non-zero).
    pub(crate) fn below(&mut self, n: u64) -> u64 {
        self.next_u64() % n
    }

    /// A random expression at most `depth` operators deep.
    pub(crate) fn expr(&mut self, depth: u32) -> Expr {
        if depth == 0 || self.below(4) == 0 {
            return match self.below(3) {
                0 => Expr::Const(self.next_i32()),
                _ => Expr::Const(i32::from(i8::from_le_bytes([self.next_u64().to_le_bytes()[0]]))),
            };
        }
        let choice = self.below(9);
        let mut sub = || Box::new(self.expr(depth - 1));
        match choice {
            0 => Expr::Add(sub(), sub()),
            1 => Expr::Sub(sub(), sub()),
            2 => Expr::Mul(sub(), sub()),
            3 => Expr::And(sub(), sub()),
            4 => Expr::Or(sub(), sub()),
            5 => Expr::Xor(sub(), sub()),
            6 => Expr::Square(sub()),
            7 => Expr::SwappedSub(sub(), sub()),
            _ => Expr::ViaLocal(sub()),
        }
    }
}
