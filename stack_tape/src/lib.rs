// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `stack_tape`: a stack-based bytecode VM for C0-style programs.
//!
//! A [`Program`](program::Program) holds a function pool, integer and string constant pools, and
//! a native descriptor pool. The [`Vm`](vm::Vm) runs function 0 by fetching one instruction at a
//! time, manipulating an operand stack and locals per frame, and managing a call stack across
//! invocations. Heap objects (blocks, arrays, tagged pointers) live in a VM-owned
//! [`Heap`](heap::Heap).
//!
//! Any runtime fault (arithmetic, memory, assertion, user error, native failure, malformed
//! bytecode, exceeded limit) ends the run with a [`FaultInfo`](vm::FaultInfo) naming the faulting
//! function and instruction.
//!
//! ## Example
//! ```
//! use stack_tape::asm::{Asm, ProgramBuilder};
//! use stack_tape::native::NoNatives;
//! use stack_tape::trace::TraceMask;
//! use stack_tape::vm::{Limits, Vm};
//!
//! // g(x) = x + 2; main = g(10)
//! let mut pb = ProgramBuilder::new();
//! let main = pb.declare_function(0, 0)?;
//! let g = pb.declare_function(1, 1)?;
//!
//! let mut a = Asm::new();
//! a.bipush(10).invokestatic(g).ret();
//! pb.define_function(main, a)?;
//!
//! let mut a = Asm::new();
//! a.vload(0).bipush(2).iadd().ret();
//! pb.define_function(g, a)?;
//!
//! let program = pb.build()?;
//! let mut vm = Vm::new(NoNatives, Limits::default());
//! assert_eq!(vm.run(&program, TraceMask::NONE, None), Ok(12));
//! # Ok::<(), stack_tape::asm::BuildError>(())
//! ```
//!
//! ## Features
//! - `std`: links `std`. The crate is otherwise `no_std` with `alloc`.

#![no_std]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod asm;
pub mod bytecode;
pub mod disasm;
pub mod format;
pub mod frame;
pub mod heap;
pub mod native;
pub mod opcode;
pub mod program;
pub mod stack;
pub mod trace;
pub mod value;
pub mod vm;
