// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Native-call ABI for `stack_tape`.
//!
//! `INVOKENATIVE` pops the declared number of arguments, hands them (argument 0 first) to the
//! embedder's [`Natives`] implementation together with a [`NativeContext`], and pushes the single
//! returned [`Value`]. Natives run synchronously and cannot re-enter the interpreter.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::heap::Heap;
use crate::program::Program;
use crate::value::{Address, Pointer, Value};

/// Errors a native call can return.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NativeError {
    /// No implementation is registered under the descriptor's table index.
    UnknownNative {
        /// The native implementation table index.
        table_index: u16,
    },
    /// Argument `index` had the wrong kind or pointed at something unusable.
    BadArgument {
        /// Zero-based argument position.
        index: usize,
    },
    /// The native failed during execution.
    Failed(String),
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNative { table_index } => {
                write!(f, "no native registered at table index {table_index}")
            }
            Self::BadArgument { index } => write!(f, "bad native argument {index}"),
            Self::Failed(msg) => write!(f, "native failed: {msg}"),
        }
    }
}

impl core::error::Error for NativeError {}

/// VM state visible to a native call.
pub struct NativeContext<'a> {
    heap: &'a mut Heap,
    program: &'a Program,
}

impl fmt::Debug for NativeContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeContext")
            .field("heap_objects", &self.heap.len())
            .finish_non_exhaustive()
    }
}

impl<'a> NativeContext<'a> {
    /// Creates a context over `heap` for a native called from `program`.
    #[must_use]
    pub fn new(heap: &'a mut Heap, program: &'a Program) -> Self {
        Self { heap, program }
    }

    /// Returns the VM heap.
    #[must_use]
    pub fn heap(&self) -> &Heap {
        self.heap
    }

    /// Returns the VM heap for mutation.
    pub fn heap_mut(&mut self) -> &mut Heap {
        self.heap
    }

    /// Returns the calling program.
    #[must_use]
    pub fn program(&self) -> &Program {
        self.program
    }

    /// Reads the NUL-terminated string that `v` points at, replacing invalid UTF-8.
    ///
    /// `arg` is the argument position reported on failure.
    pub fn read_string(&self, v: Value, arg: usize) -> Result<String, NativeError> {
        let bytes = v
            .as_ptr()
            .and_then(|p| c_string(self.heap, self.program, p))
            .ok_or(NativeError::BadArgument { index: arg })?;
        Ok(lossy(bytes))
    }

    /// Allocates `s` as a NUL-terminated heap string and returns a pointer to it.
    pub fn alloc_string(&mut self, s: &str) -> Result<Value, NativeError> {
        let obj = self
            .heap
            .alloc_c_string(s.as_bytes())
            .map_err(|e| NativeError::Failed(alloc::format!("{e}")))?;
        Ok(Value::Ptr(Pointer::to(Address::Cell { obj, offset: 0 })))
    }
}

/// Reads the NUL-terminated byte string `ptr` points at, from the string pool or the heap.
///
/// Returns `None` for null, tagged, or non-string pointers.
pub(crate) fn c_string<'a>(heap: &'a Heap, program: &'a Program, ptr: Pointer) -> Option<&'a [u8]> {
    match ptr {
        Pointer::Ref {
            addr: Address::Str(offset),
            tag: None,
        } => program.string_at(offset as usize),
        Pointer::Ref {
            addr: Address::Cell { obj, offset },
            tag: None,
        } => heap.c_str(obj, offset).ok(),
        _ => None,
    }
}

/// The embedder's native implementation table.
pub trait Natives {
    /// Invokes the native registered under `table_index` with `args` (argument 0 first).
    fn call(
        &mut self,
        table_index: u16,
        args: &[Value],
        ctx: &mut NativeContext<'_>,
    ) -> Result<Value, NativeError>;
}

/// A natives implementation that rejects every call.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoNatives;

impl Natives for NoNatives {
    fn call(
        &mut self,
        table_index: u16,
        _args: &[Value],
        _ctx: &mut NativeContext<'_>,
    ) -> Result<Value, NativeError> {
        Err(NativeError::UnknownNative { table_index })
    }
}

/// Signature of a table-registered native.
pub type NativeFn = fn(&mut NativeContext<'_>, &[Value]) -> Result<Value, NativeError>;

/// A function-pointer table indexed by `function_table_index`.
#[derive(Clone, Debug, Default)]
pub struct NativeTable {
    slots: Vec<Option<NativeFn>>,
}

impl NativeTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Registers `f` at `table_index`, replacing any previous entry.
    pub fn register(&mut self, table_index: u16, f: NativeFn) -> &mut Self {
        let ix = usize::from(table_index);
        if self.slots.len() <= ix {
            self.slots.resize(ix + 1, None);
        }
        self.slots[ix] = Some(f);
        self
    }

    /// Returns `true` if something is registered at `table_index`.
    #[must_use]
    pub fn contains(&self, table_index: u16) -> bool {
        self.slots
            .get(usize::from(table_index))
            .is_some_and(Option::is_some)
    }
}

impl Natives for NativeTable {
    fn call(
        &mut self,
        table_index: u16,
        args: &[Value],
        ctx: &mut NativeContext<'_>,
    ) -> Result<Value, NativeError> {
        let f = self
            .slots
            .get(usize::from(table_index))
            .copied()
            .flatten()
            .ok_or(NativeError::UnknownNative { table_index })?;
        f(ctx, args)
    }
}

impl<N: Natives + ?Sized> Natives for &mut N {
    fn call(
        &mut self,
        table_index: u16,
        args: &[Value],
        ctx: &mut NativeContext<'_>,
    ) -> Result<Value, NativeError> {
        (**self).call(table_index, args, ctx)
    }
}

/// Returns the integer argument at `index`.
pub fn int_arg(args: &[Value], index: usize) -> Result<i32, NativeError> {
    args.get(index)
        .and_then(|v| v.as_int())
        .ok_or(NativeError::BadArgument { index })
}

/// Copies `bytes` into an owned string for diagnostics.
pub(crate) fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
