// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Benchmark scenarios for `stack_tape`.
//!
//! Each builder returns a ready-to-run [`Program`] whose entry point takes no arguments. The
//! scenarios stress one part of the VM at a time: the dispatch loop, call/return, heap access
//! and native calls.

use stack_tape::asm::{Asm, BuildError, ProgramBuilder};
use stack_tape::native::{NativeContext, NativeError, NativeTable, int_arg};
use stack_tape::program::Program;
use stack_tape::value::Value;

/// Table index of the native used by [`native_calls`].
pub const INCR_NATIVE: u16 = 0;

/// `s = 0; for (i = 0; i < n; i++) s += i; return s;`
///
/// Pure dispatch-loop throughput: locals, arithmetic and a backward branch.
pub fn sum_loop(n: i32) -> Result<Program, BuildError> {
    let mut pb = ProgramBuilder::new();
    let limit = pb.int_const(n)?;
    let mut a = Asm::new();
    let top = a.label();
    let done = a.label();
    a.bipush(0).vstore(0).bipush(0).vstore(1);
    a.place(top);
    a.vload(0).ildc(limit).if_icmpge(done);
    a.vload(1).vload(0).iadd().vstore(1);
    a.vload(0).bipush(1).iadd().vstore(0);
    a.goto(top);
    a.place(done);
    a.vload(1).ret();
    let main = pb.push_function(a, 0, 2)?;
    pb.set_function_name(main, "sum_loop")?;
    pb.build()
}

/// Naive recursive Fibonacci.
///
/// Dominated by `INVOKESTATIC`/`RETURN` and frame setup.
pub fn fib(n: i8) -> Result<Program, BuildError> {
    let mut pb = ProgramBuilder::new();
    let main = pb.declare_function(0, 0)?;
    let fib = pb.declare_function(1, 1)?;

    let mut a = Asm::new();
    a.bipush(n).invokestatic(fib).ret();
    pb.define_function(main, a)?;

    let mut a = Asm::new();
    let recurse = a.label();
    a.vload(0).bipush(2).if_icmpge(recurse);
    a.vload(0).ret();
    a.place(recurse);
    a.vload(0).bipush(1).isub().invokestatic(fib);
    a.vload(0).bipush(2).isub().invokestatic(fib);
    a.iadd().ret();
    pb.define_function(fib, a)?;
    pb.set_function_name(fib, "fib")?;
    pb.build()
}

/// Fills an `int[len]` with `0..len` and sums it back.
///
/// Exercises `NEWARRAY`, `AADDS` and integer cell loads/stores.
pub fn array_fill(len: i32) -> Result<Program, BuildError> {
    let mut pb = ProgramBuilder::new();
    let n = pb.int_const(len)?;
    let mut a = Asm::new();
    let fill = a.label();
    let sum = a.label();
    let sum_top = a.label();
    let done = a.label();
    // locals: 0 = array, 1 = i, 2 = s
    a.ildc(n).newarray(4).vstore(0);
    a.bipush(0).vstore(1);
    a.place(fill);
    a.vload(1).ildc(n).if_icmpge(sum);
    a.vload(0).vload(1).aadds().vload(1).imstore();
    a.vload(1).bipush(1).iadd().vstore(1);
    a.goto(fill);
    a.place(sum);
    a.bipush(0).vstore(1).bipush(0).vstore(2);
    a.place(sum_top);
    a.vload(1).vload(0).arraylength().if_icmpge(done);
    a.vload(2).vload(0).vload(1).aadds().imload().iadd().vstore(2);
    a.vload(1).bipush(1).iadd().vstore(1);
    a.goto(sum_top);
    a.place(done);
    a.vload(2).ret();
    let main = pb.push_function(a, 0, 3)?;
    pb.set_function_name(main, "array_fill")?;
    pb.build()
}

/// Calls the [`INCR_NATIVE`] native `n` times, threading a counter through it.
pub fn native_calls(n: i32) -> Result<Program, BuildError> {
    let mut pb = ProgramBuilder::new();
    let limit = pb.int_const(n)?;
    let incr = pb.native(1, INCR_NATIVE)?;
    let mut a = Asm::new();
    let top = a.label();
    let done = a.label();
    a.bipush(0).vstore(0);
    a.place(top);
    a.vload(0).ildc(limit).if_icmpge(done);
    a.vload(0).invokenative(incr).vstore(0);
    a.goto(top);
    a.place(done);
    a.vload(0).ret();
    pb.push_function(a, 0, 1)?;
    pb.build()
}

fn incr(_: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, NativeError> {
    Ok(Value::Int(int_arg(args, 0)?.wrapping_add(1)))
}

/// Native table for [`native_calls`].
#[must_use]
pub fn natives() -> NativeTable {
    let mut table = NativeTable::new();
    table.register(INCR_NATIVE, incr);
    table
}
