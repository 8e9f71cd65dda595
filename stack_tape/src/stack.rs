// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-frame operand stack.

use alloc::vec::Vec;

use crate::value::Value;

/// A LIFO stack of [`Value`]s owned by one frame.
///
/// Popping an empty stack returns `None`; the interpreter reports that as a contract violation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperandStack {
    values: Vec<Value>,
}

impl OperandStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    /// Pushes `v` onto the top.
    #[inline]
    pub fn push(&mut self, v: Value) {
        self.values.push(v);
    }

    /// Pops the top value.
    #[inline]
    pub fn pop(&mut self) -> Option<Value> {
        self.values.pop()
    }

    /// Returns the top value without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<Value> {
        self.values.last().copied()
    }

    /// Returns the number of values on the stack.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the stack is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the values bottom-to-top.
    #[must_use]
    pub fn as_slice(&self) -> &[Value] {
        &self.values
    }
}
