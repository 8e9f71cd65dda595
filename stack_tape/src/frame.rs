// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Call frames and the call stack.
//!
//! The interpreter keeps exactly one active [`Frame`] by value. A call moves the active frame onto
//! the [`CallStack`] and installs a fresh one for the callee; `RETURN` moves the caller back.

use alloc::vec;
use alloc::vec::Vec;

use crate::stack::OperandStack;
use crate::value::{FuncId, Value};

/// Execution context of one function invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Function whose code this frame executes.
    pub func: FuncId,
    /// Byte offset of the next instruction in the function's code.
    pub pc: usize,
    /// Operand stack.
    pub stack: OperandStack,
    /// Local variables, sized to the function's declared local count.
    pub locals: Vec<Value>,
}

impl Frame {
    /// Creates a frame for `func` at pc 0 with an empty stack and `num_vars` zeroed locals.
    #[must_use]
    pub fn new(func: FuncId, num_vars: u16) -> Self {
        Self {
            func,
            pc: 0,
            stack: OperandStack::new(),
            locals: vec![Value::default(); usize::from(num_vars)],
        }
    }
}

/// Suspended caller frames, innermost last.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallStack {
    frames: Vec<Frame>,
}

impl CallStack {
    /// Creates an empty call stack.
    #[must_use]
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// Suspends `frame`.
    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Resumes the most recently suspended frame.
    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    /// Number of suspended frames.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Returns `true` when no frame is suspended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Iterates suspended frames from outermost to innermost.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Frame> + '_ {
        self.frames.iter()
    }
}
