// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Profiling adapters for `stack_tape` (currently Tracy).
//!
//! This crate is `std`-only and keeps `stack_tape` itself free of profiling dependencies.
//! It listens for scope enter/exit callbacks and emits matching profiling scopes: one per
//! interpreted call frame and one per native call.
//!
//! A run that faults is reported as a Tracy message naming the faulting function and offset.
//!
//! ## Backend
//! This crate currently supports the Tracy backend via `tracy-client`. When no Tracy client is
//! running the sink still tracks scopes but emits nothing.
//!
//! ## Example
//! ```ignore
//! use stack_tape::trace::TraceSink;
//! use stack_tape_profiling::{ProfilingTraceSink, ProgramSymbolResolver};
//!
//! let mut sink = ProfilingTraceSink::with_resolver(ProgramSymbolResolver::default());
//! let mask = sink.mask();
//! vm.run(&program, mask, Some(&mut sink))?;
//! # Ok::<(), stack_tape::vm::FaultInfo>(())
//! ```

mod resolver;
mod sink;

pub use resolver::{DefaultLabelResolver, LabelResolver, ProgramSymbolResolver};
pub use sink::ProfilingTraceSink;
