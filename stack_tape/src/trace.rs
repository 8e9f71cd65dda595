// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Tracing hooks for `stack_tape`.
//!
//! Tracing is optional and `no_std` friendly. The VM only emits events requested by a
//! [`TraceMask`].
//!
//! To enable tracing, pass a [`TraceMask`] and [`TraceSink`] to [`Vm::run`].

#[cfg(doc)]
use crate::vm::Vm;

use crate::opcode::Opcode;
use crate::program::Program;
use crate::value::{FuncId, NativeId};
use crate::vm::FaultInfo;

/// A set of trace events requested by a [`TraceSink`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TraceMask(u32);

impl core::ops::BitOr for TraceMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for TraceMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl TraceMask {
    /// No tracing.
    pub const NONE: Self = Self(0);
    /// Trace run boundaries.
    ///
    /// Enables:
    /// - [`TraceSink::run_start`]
    /// - [`TraceSink::run_end`]
    pub const RUN: Self = Self(1 << 0);
    /// Trace each executed instruction.
    ///
    /// Enables:
    /// - [`TraceSink::instr`]
    pub const INSTR: Self = Self(1 << 1);
    /// Trace interpreted call frames.
    ///
    /// Enables (for [`ScopeKind::CallFrame`]):
    /// - [`TraceSink::scope_enter`]
    /// - [`TraceSink::scope_exit`]
    pub const CALL: Self = Self(1 << 2);
    /// Trace native calls.
    ///
    /// Enables (for [`ScopeKind::NativeCall`]):
    /// - [`TraceSink::scope_enter`]
    /// - [`TraceSink::scope_exit`]
    pub const NATIVE: Self = Self(1 << 3);
    /// Every event.
    pub const ALL: Self = Self(Self::RUN.0 | Self::INSTR.0 | Self::CALL.0 | Self::NATIVE.0);

    /// Returns `true` if this mask includes all bits in `other`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// The kind of scope being entered/exited.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScopeKind {
    /// An interpreted call frame (function activation).
    CallFrame {
        /// Function id for the frame being entered/exited.
        func: FuncId,
    },
    /// A native call.
    NativeCall {
        /// Native pool index.
        native: NativeId,
        /// Native implementation table index.
        table_index: u16,
    },
}

/// Run outcome for tracing.
#[derive(Clone, Debug)]
pub enum TraceOutcome<'a> {
    /// The outermost `RETURN` produced this exit value.
    Ok(i32),
    /// The run ended with a fault.
    Fault(&'a FaultInfo),
}

/// A trace sink that can receive VM events.
pub trait TraceSink {
    /// Returns the set of events the sink wants.
    fn mask(&self) -> TraceMask {
        TraceMask::NONE
    }

    /// Called at the start of a VM run.
    ///
    /// Called only if `mask()` includes [`TraceMask::RUN`].
    fn run_start(&mut self, _program: &Program, _entry: FuncId, _arg_count: usize) {}

    /// Called before each instruction executes.
    ///
    /// Called only if `mask()` includes [`TraceMask::INSTR`].
    ///
    /// - `func`: current function id
    /// - `pc`: byte offset of the opcode
    /// - `opcode`: the decoded opcode
    /// - `stack_depth`: operand-stack depth before the instruction
    fn instr(
        &mut self,
        _program: &Program,
        _func: FuncId,
        _pc: usize,
        _opcode: Opcode,
        _stack_depth: usize,
    ) {
    }

    /// Called when entering a scope.
    ///
    /// - `depth`: number of interpreted frames (suspended plus active) after entering
    /// - `func`: function active at the scope boundary
    /// - `pc`: program counter at the scope boundary
    fn scope_enter(
        &mut self,
        _program: &Program,
        _kind: ScopeKind,
        _depth: usize,
        _func: FuncId,
        _pc: usize,
    ) {
    }

    /// Called when exiting a scope.
    ///
    /// - `depth`: number of interpreted frames before exiting
    fn scope_exit(
        &mut self,
        _program: &Program,
        _kind: ScopeKind,
        _depth: usize,
        _func: FuncId,
        _pc: usize,
    ) {
    }

    /// Called at the end of a VM run.
    ///
    /// Called only if `mask()` includes [`TraceMask::RUN`].
    fn run_end(&mut self, _program: &Program, _outcome: TraceOutcome<'_>) {}
}
