// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! In-memory program representation.
//!
//! A [`Program`] is what a loader hands to the VM: the function pool, the integer and string
//! constant pools, and the native descriptor pool. The VM treats it as read-only.
//!
//! Function 0 is the entry point.

use alloc::string::String;
use alloc::vec::Vec;

use crate::value::{FuncId, NativeId};

/// A function in the function pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Function {
    /// Number of arguments, which occupy locals `0..num_args`.
    pub num_args: u16,
    /// Number of locals (including arguments).
    pub num_vars: u16,
    /// Bytecode.
    pub code: Vec<u8>,
    /// Optional debug name used by diagnostics and profilers.
    pub name: Option<String>,
}

/// A native descriptor in the native pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NativeInfo {
    /// Number of arguments the native expects.
    pub num_args: u16,
    /// Key into the embedder's native implementation table.
    pub function_table_index: u16,
}

/// A loaded program.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Program {
    /// Function pool.
    pub functions: Vec<Function>,
    /// Integer constant pool.
    pub int_pool: Vec<i32>,
    /// String constant pool: NUL-terminated strings packed back to back.
    pub string_pool: Vec<u8>,
    /// Native descriptor pool.
    pub natives: Vec<NativeInfo>,
}

impl Program {
    /// Creates a program from its pools.
    #[must_use]
    pub fn new(
        functions: Vec<Function>,
        int_pool: Vec<i32>,
        string_pool: Vec<u8>,
        natives: Vec<NativeInfo>,
    ) -> Self {
        Self {
            functions,
            int_pool,
            string_pool,
            natives,
        }
    }

    /// Returns the function at `id`.
    #[must_use]
    pub fn function(&self, id: FuncId) -> Option<&Function> {
        self.functions.get(usize::from(id.0))
    }

    /// Returns the native descriptor at `id`.
    #[must_use]
    pub fn native(&self, id: NativeId) -> Option<NativeInfo> {
        self.natives.get(usize::from(id.0)).copied()
    }

    /// Returns the integer constant at `idx`.
    #[must_use]
    pub fn int_const(&self, idx: u16) -> Option<i32> {
        self.int_pool.get(usize::from(idx)).copied()
    }

    /// Returns the NUL-terminated string starting at byte `offset` of the string pool, without
    /// its terminator.
    #[must_use]
    pub fn string_at(&self, offset: usize) -> Option<&[u8]> {
        let tail = self.string_pool.get(offset..)?;
        let end = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
        Some(&tail[..end])
    }

    /// Returns the debug name of `id`, if one was recorded.
    #[must_use]
    pub fn function_name(&self, id: FuncId) -> Option<&str> {
        self.function(id)?.name.as_deref()
    }
}
