// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Interpreter for `stack_tape` bytecode.
//!
//! The VM fetches one instruction at a time from the active frame, applies it to the operand
//! stack, locals, heap or call stack, and loops until the outermost `RETURN` yields the program's
//! exit value. Every fault is fatal: the run stops at the faulting instruction and reports a
//! [`FaultInfo`] without unwinding anything.

use alloc::string::String;
use alloc::vec;
use core::fmt;

use crate::bytecode::{BytecodeError, Instr, branch_target, decode_at};
use crate::frame::{CallStack, Frame};
use crate::heap::{Heap, HeapError};
use crate::native::{NativeContext, NativeError, Natives, c_string, lossy};
use crate::program::Program;
use crate::stack::OperandStack;
use crate::trace::{ScopeKind, TraceMask, TraceOutcome, TraceSink};
use crate::value::{Address, FuncId, NativeId, ObjHandle, Pointer, Value, ValueKind};

/// Execution limits for a VM run.
///
/// The default is unlimited: a program that loops forever runs forever.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Limits {
    /// Instruction budget; each executed instruction costs 1.
    pub fuel: Option<u64>,
    /// Maximum number of interpreted frames (active plus suspended).
    pub max_call_depth: Option<usize>,
}

impl Limits {
    /// No limits.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            fuel: None,
            max_call_depth: None,
        }
    }
}

/// An arithmetic fault.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArithError {
    /// `IDIV`/`IREM` by zero.
    DivByZero,
    /// `IDIV`/`IREM` of `i32::MIN` by `-1`.
    DivOverflow,
    /// `ISHL`/`ISHR` by a negative amount or by 32 or more.
    ShiftOutOfRange {
        /// The offending shift amount.
        amount: i32,
    },
}

impl fmt::Display for ArithError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DivByZero => write!(f, "division by zero"),
            Self::DivOverflow => write!(f, "division overflow (INT_MIN / -1)"),
            Self::ShiftOutOfRange { amount } => write!(f, "shift by {amount} out of range"),
        }
    }
}

/// A memory fault.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemoryError {
    /// A null pointer was dereferenced.
    NullDeref,
    /// `AADDS` index was not below the array's element count.
    IndexOutOfBounds {
        /// Index as popped.
        index: i32,
        /// Element count.
        count: u32,
    },
    /// `NEWARRAY` with a negative element count.
    NegativeArraySize {
        /// Count as popped.
        count: i32,
    },
    /// `CHECKTAG` found a different (or no) tag.
    TagMismatch {
        /// Tag immediate.
        expected: u16,
        /// Tag carried by the pointer.
        actual: Option<u16>,
    },
    /// The pointer does not refer to memory of the requested shape.
    WrongShape {
        /// What the instruction needed.
        expected: &'static str,
    },
    /// A store into the read-only string pool.
    ReadOnly,
    /// Heap-level failure (bounds, cell type, allocation size).
    Heap(HeapError),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NullDeref => write!(f, "null pointer dereference"),
            Self::IndexOutOfBounds { index, count } => {
                write!(f, "array index {index} out of bounds for length {count}")
            }
            Self::NegativeArraySize { count } => write!(f, "negative array size {count}"),
            Self::TagMismatch { expected, actual } => match actual {
                Some(t) => write!(f, "tag mismatch (expected {expected}, found {t})"),
                None => write!(f, "tag mismatch (expected {expected}, pointer is untagged)"),
            },
            Self::WrongShape { expected } => write!(f, "pointer does not refer to {expected}"),
            Self::ReadOnly => write!(f, "write to read-only string pool"),
            Self::Heap(e) => write!(f, "{e}"),
        }
    }
}

/// A malformed-program condition.
///
/// These indicate bytecode that a correct compiler would never emit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContractViolation {
    /// Pop from an empty operand stack.
    StackUnderflow,
    /// The opcode byte is not in the instruction set.
    InvalidOpcode {
        /// The raw byte.
        opcode: u8,
    },
    /// The code ended inside an instruction's immediates.
    TruncatedInstruction,
    /// The pc left the function's code.
    PcOutOfBounds,
    /// An operand had the wrong kind.
    TypeMismatch {
        /// Kind the instruction needed.
        expected: ValueKind,
        /// Kind found on the stack.
        actual: ValueKind,
    },
    /// Local slot beyond the frame's declared locals.
    LocalOutOfBounds {
        /// Slot immediate.
        slot: u8,
    },
    /// Function-pool index out of range.
    FunctionOutOfBounds(FuncId),
    /// Native-pool index out of range.
    NativeOutOfBounds(NativeId),
    /// Integer-pool index out of range.
    IntPoolOutOfBounds {
        /// Pool index.
        idx: u16,
    },
    /// String-pool offset out of range.
    StringPoolOutOfBounds {
        /// Byte offset.
        idx: u16,
    },
    /// Values remained on the operand stack after `RETURN` popped the result.
    StackNotEmptyOnReturn {
        /// Number of leftover values.
        remaining: usize,
    },
    /// A function declares fewer locals than arguments.
    TooFewLocals(FuncId),
    /// A tagged pointer was used without `CHECKTAG`.
    TaggedPointer,
    /// `INVOKEDYNAMIC` on something other than a function or native descriptor.
    NotAFunction,
    /// `ATHROW`/`ASSERT` message pointer does not refer to a string.
    BadMessage,
    /// The entry point was given the wrong number of arguments.
    EntryArity {
        /// Declared argument count.
        expected: u16,
        /// Supplied argument count.
        actual: usize,
    },
}

impl fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackUnderflow => write!(f, "operand stack underflow"),
            Self::InvalidOpcode { opcode } => write!(f, "invalid opcode 0x{opcode:02x}"),
            Self::TruncatedInstruction => write!(f, "truncated instruction"),
            Self::PcOutOfBounds => write!(f, "pc out of bounds"),
            Self::TypeMismatch { expected, actual } => {
                write!(f, "type mismatch (expected {expected}, got {actual})")
            }
            Self::LocalOutOfBounds { slot } => write!(f, "local {slot} out of bounds"),
            Self::FunctionOutOfBounds(id) => write!(f, "function {} out of bounds", id.0),
            Self::NativeOutOfBounds(id) => write!(f, "native {} out of bounds", id.0),
            Self::IntPoolOutOfBounds { idx } => write!(f, "integer constant {idx} out of bounds"),
            Self::StringPoolOutOfBounds { idx } => {
                write!(f, "string constant offset {idx} out of bounds")
            }
            Self::StackNotEmptyOnReturn { remaining } => {
                write!(f, "{remaining} values left on the stack at return")
            }
            Self::TooFewLocals(id) => {
                write!(f, "function {} declares fewer locals than arguments", id.0)
            }
            Self::TaggedPointer => write!(f, "tagged pointer used without checktag"),
            Self::NotAFunction => write!(f, "invokedynamic target is not a function"),
            Self::BadMessage => write!(f, "error message is not a string"),
            Self::EntryArity { expected, actual } => {
                write!(f, "entry expects {expected} arguments, got {actual}")
            }
        }
    }
}

/// An embedder-configured limit was hit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimitExceeded {
    /// [`Limits::fuel`] ran out.
    Fuel,
    /// [`Limits::max_call_depth`] was exceeded.
    CallDepth,
}

impl fmt::Display for LimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fuel => write!(f, "fuel limit exceeded"),
            Self::CallDepth => write!(f, "call depth limit exceeded"),
        }
    }
}

/// A fatal runtime condition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Bad division or shift.
    Arithmetic(ArithError),
    /// Null dereference, out-of-bounds access, tag mismatch.
    Memory(MemoryError),
    /// `ASSERT` failed; carries the program's message.
    Assertion(String),
    /// `ATHROW`; carries the program's message.
    User(String),
    /// A native implementation failed.
    Native(NativeError),
    /// The bytecode broke an invariant a well-formed program keeps.
    Contract(ContractViolation),
    /// An embedder-configured limit was hit.
    Limit(LimitExceeded),
}

/// The category of a [`Fault`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// [`Fault::Arithmetic`].
    Arithmetic,
    /// [`Fault::Memory`].
    Memory,
    /// [`Fault::Assertion`].
    Assertion,
    /// [`Fault::User`].
    User,
    /// [`Fault::Native`].
    Native,
    /// [`Fault::Contract`].
    Contract,
    /// [`Fault::Limit`].
    Limit,
}

impl Fault {
    /// Returns the fault category.
    #[must_use]
    pub const fn kind(&self) -> FaultKind {
        match self {
            Self::Arithmetic(_) => FaultKind::Arithmetic,
            Self::Memory(_) => FaultKind::Memory,
            Self::Assertion(_) => FaultKind::Assertion,
            Self::User(_) => FaultKind::User,
            Self::Native(_) => FaultKind::Native,
            Self::Contract(_) => FaultKind::Contract,
            Self::Limit(_) => FaultKind::Limit,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Arithmetic(e) => write!(f, "arithmetic error: {e}"),
            Self::Memory(e) => write!(f, "memory error: {e}"),
            Self::Assertion(msg) => write!(f, "assertion failed: {msg}"),
            Self::User(msg) => write!(f, "error: {msg}"),
            Self::Native(e) => write!(f, "native error: {e}"),
            Self::Contract(e) => write!(f, "malformed program: {e}"),
            Self::Limit(e) => write!(f, "{e}"),
        }
    }
}

impl core::error::Error for Fault {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Memory(MemoryError::Heap(e)) => Some(e),
            Self::Native(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ArithError> for Fault {
    fn from(e: ArithError) -> Self {
        Self::Arithmetic(e)
    }
}

impl From<MemoryError> for Fault {
    fn from(e: MemoryError) -> Self {
        Self::Memory(e)
    }
}

impl From<HeapError> for Fault {
    fn from(e: HeapError) -> Self {
        Self::Memory(MemoryError::Heap(e))
    }
}

impl From<ContractViolation> for Fault {
    fn from(e: ContractViolation) -> Self {
        Self::Contract(e)
    }
}

impl From<BytecodeError> for Fault {
    fn from(e: BytecodeError) -> Self {
        match e {
            BytecodeError::Decode(_) => Self::Contract(ContractViolation::TruncatedInstruction),
            BytecodeError::UnknownOpcode { opcode } => {
                Self::Contract(ContractViolation::InvalidOpcode { opcode })
            }
        }
    }
}

/// A fault annotated with location information.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FaultInfo {
    /// Function executing when the fault occurred.
    pub func: FuncId,
    /// Byte offset of the faulting instruction's opcode.
    pub pc: usize,
    /// The fault.
    pub fault: Fault,
}

impl FaultInfo {
    /// Returns the fault category.
    #[must_use]
    pub const fn kind(&self) -> FaultKind {
        self.fault.kind()
    }
}

impl fmt::Display for FaultInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fault at f{} pc={}: {}", self.func.0, self.pc, self.fault)
    }
}

impl core::error::Error for FaultInfo {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        Some(&self.fault)
    }
}

enum Flow {
    Continue,
    Exit(i32),
}

/// Interpreter state for one run: the active frame (held by value) and the suspended callers.
#[derive(Debug)]
struct ExecState {
    frame: Frame,
    calls: CallStack,
    fuel: Option<u64>,
}

impl ExecState {
    /// Interpreted frames, active included.
    fn depth(&self) -> usize {
        self.calls.depth() + 1
    }
}

/// A stack-based bytecode VM.
pub struct Vm<N: Natives> {
    natives: N,
    limits: Limits,

    /// Heap storage. VM-owned so embedders can inspect objects after a run.
    heap: Heap,
}

impl<N: Natives> fmt::Debug for Vm<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("limits", &self.limits)
            .field("heap_objects", &self.heap.len())
            .finish_non_exhaustive()
    }
}

impl<N: Natives> Vm<N> {
    /// Creates a new VM with `natives` and `limits`.
    #[must_use]
    pub fn new(natives: N, limits: Limits) -> Self {
        Self {
            natives,
            limits,
            heap: Heap::new(),
        }
    }

    /// Returns the heap.
    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Returns the heap for mutation.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Returns the natives implementation.
    pub fn natives_mut(&mut self) -> &mut N {
        &mut self.natives
    }

    /// Returns the configured limits.
    #[must_use]
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Runs `program` from function 0 with no arguments and returns its exit value.
    pub fn run(
        &mut self,
        program: &Program,
        trace_mask: TraceMask,
        trace: Option<&mut dyn TraceSink>,
    ) -> Result<i32, FaultInfo> {
        self.run_function(program, FuncId(0), &[], trace_mask, trace)
    }

    /// Runs `program` from `entry` with `args` placed in locals `0..args.len()`.
    ///
    /// Tracing is controlled by `trace_mask`; pass `None` for `trace` to disable tracing.
    pub fn run_function(
        &mut self,
        program: &Program,
        entry: FuncId,
        args: &[Value],
        trace_mask: TraceMask,
        mut trace: Option<&mut dyn TraceSink>,
    ) -> Result<i32, FaultInfo> {
        if trace_mask.contains(TraceMask::RUN)
            && let Some(t) = trace.as_mut()
        {
            t.run_start(program, entry, args.len());
        }

        let result = self.run_body(program, entry, args, trace_mask, &mut trace);

        if trace_mask.contains(TraceMask::RUN)
            && let Some(t) = trace.as_mut()
        {
            let outcome = match &result {
                Ok(v) => TraceOutcome::Ok(*v),
                Err(e) => TraceOutcome::Fault(e),
            };
            t.run_end(program, outcome);
        }

        result
    }

    fn run_body(
        &mut self,
        program: &Program,
        entry: FuncId,
        args: &[Value],
        trace_mask: TraceMask,
        trace: &mut Option<&mut dyn TraceSink>,
    ) -> Result<i32, FaultInfo> {
        let at_entry = |fault: ContractViolation| FaultInfo {
            func: entry,
            pc: 0,
            fault: Fault::Contract(fault),
        };
        let entry_fn = program
            .function(entry)
            .ok_or_else(|| at_entry(ContractViolation::FunctionOutOfBounds(entry)))?;
        if args.len() != usize::from(entry_fn.num_args) {
            return Err(at_entry(ContractViolation::EntryArity {
                expected: entry_fn.num_args,
                actual: args.len(),
            }));
        }
        if entry_fn.num_vars < entry_fn.num_args {
            return Err(at_entry(ContractViolation::TooFewLocals(entry)));
        }

        let mut frame = Frame::new(entry, entry_fn.num_vars);
        frame.locals[..args.len()].copy_from_slice(args);
        let mut state = ExecState {
            frame,
            calls: CallStack::new(),
            fuel: self.limits.fuel,
        };

        if trace_mask.contains(TraceMask::CALL)
            && let Some(t) = trace.as_mut()
        {
            t.scope_enter(program, ScopeKind::CallFrame { func: entry }, 1, entry, 0);
        }

        loop {
            let pc = state.frame.pc;
            match self.step(program, &mut state, trace_mask, trace) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit(v)) => return Ok(v),
                Err(fault) => {
                    if trace_mask.contains(TraceMask::CALL)
                        && let Some(t) = trace.as_mut()
                    {
                        close_frames(program, &state, pc, &mut **t);
                    }
                    return Err(FaultInfo {
                        func: state.frame.func,
                        pc,
                        fault,
                    });
                }
            }
        }
    }

    /// Executes one instruction of the active frame.
    ///
    /// On error the active frame is still the one that faulted.
    fn step(
        &mut self,
        program: &Program,
        state: &mut ExecState,
        trace_mask: TraceMask,
        trace: &mut Option<&mut dyn TraceSink>,
    ) -> Result<Flow, Fault> {
        if let Some(fuel) = state.fuel.as_mut() {
            if *fuel == 0 {
                return Err(Fault::Limit(LimitExceeded::Fuel));
            }
            *fuel -= 1;
        }

        let func_id = state.frame.func;
        let code = &program
            .function(func_id)
            .ok_or(ContractViolation::FunctionOutOfBounds(func_id))?
            .code;
        let pc = state.frame.pc;
        if pc >= code.len() {
            return Err(ContractViolation::PcOutOfBounds.into());
        }
        let di = decode_at(code, pc)?;

        if trace_mask.contains(TraceMask::INSTR)
            && let Some(t) = trace.as_mut()
        {
            t.instr(program, func_id, pc, di.opcode, state.frame.stack.len());
        }

        // Default fallthrough: branches and calls overwrite this.
        state.frame.pc = di.next_pc();
        let stack = &mut state.frame.stack;

        match di.instr {
            Instr::Nop => {}
            Instr::Pop => {
                pop(stack)?;
            }
            Instr::Dup => {
                let v = pop(stack)?;
                stack.push(v);
                stack.push(v);
            }
            Instr::Swap => {
                let v1 = pop(stack)?;
                let v2 = pop(stack)?;
                stack.push(v1);
                stack.push(v2);
            }
            Instr::Return => return self.ret(program, state, trace_mask, trace),

            Instr::Iadd => int_binop(stack, |a, b| Ok(a.wrapping_add(b)))?,
            Instr::Isub => int_binop(stack, |a, b| Ok(a.wrapping_sub(b)))?,
            Instr::Imul => int_binop(stack, |a, b| Ok(a.wrapping_mul(b)))?,
            Instr::Idiv => int_binop(stack, |a, b| checked_div(a, b).map(|(q, _)| q))?,
            Instr::Irem => int_binop(stack, |a, b| checked_div(a, b).map(|(_, r)| r))?,
            Instr::Iand => int_binop(stack, |a, b| Ok(a & b))?,
            Instr::Ior => int_binop(stack, |a, b| Ok(a | b))?,
            Instr::Ixor => int_binop(stack, |a, b| Ok(a ^ b))?,
            Instr::Ishl => int_binop(stack, |a, b| Ok(a << shift_amount(b)?))?,
            Instr::Ishr => int_binop(stack, |a, b| Ok(a >> shift_amount(b)?))?,

            Instr::Bipush { imm } => stack.push(Value::Int(i32::from(imm))),
            Instr::Ildc { idx } => {
                let i = program
                    .int_const(idx)
                    .ok_or(ContractViolation::IntPoolOutOfBounds { idx })?;
                stack.push(Value::Int(i));
            }
            Instr::Aldc { idx } => {
                if usize::from(idx) >= program.string_pool.len() {
                    return Err(ContractViolation::StringPoolOutOfBounds { idx }.into());
                }
                stack.push(Value::Ptr(Pointer::to(Address::Str(u32::from(idx)))));
            }
            Instr::AconstNull => stack.push(Value::NULL),

            Instr::Vload { slot } => {
                let v = *state
                    .frame
                    .locals
                    .get(usize::from(slot))
                    .ok_or(ContractViolation::LocalOutOfBounds { slot })?;
                state.frame.stack.push(v);
            }
            Instr::Vstore { slot } => {
                let v = pop(stack)?;
                *state
                    .frame
                    .locals
                    .get_mut(usize::from(slot))
                    .ok_or(ContractViolation::LocalOutOfBounds { slot })? = v;
            }

            Instr::Athrow => {
                let msg = pop_ptr(stack)?;
                return Err(Fault::User(self.message(program, msg)?));
            }
            Instr::Assert => {
                let msg = pop_ptr(stack)?;
                let cond = pop_int(stack)?;
                if cond == 0 {
                    return Err(Fault::Assertion(self.message(program, msg)?));
                }
            }

            Instr::IfCmpeq { rel } => {
                let v1 = pop(stack)?;
                let v2 = pop(stack)?;
                branch_if(&mut state.frame, di.offset, rel, v2 == v1)?;
            }
            Instr::IfCmpne { rel } => {
                let v1 = pop(stack)?;
                let v2 = pop(stack)?;
                branch_if(&mut state.frame, di.offset, rel, v2 != v1)?;
            }
            Instr::IfIcmplt { rel } => {
                let (v2, v1) = pop_int_pair(stack)?;
                branch_if(&mut state.frame, di.offset, rel, v2 < v1)?;
            }
            Instr::IfIcmpge { rel } => {
                let (v2, v1) = pop_int_pair(stack)?;
                branch_if(&mut state.frame, di.offset, rel, v2 >= v1)?;
            }
            Instr::IfIcmpgt { rel } => {
                let (v2, v1) = pop_int_pair(stack)?;
                branch_if(&mut state.frame, di.offset, rel, v2 > v1)?;
            }
            Instr::IfIcmple { rel } => {
                let (v2, v1) = pop_int_pair(stack)?;
                branch_if(&mut state.frame, di.offset, rel, v2 <= v1)?;
            }
            Instr::Goto { rel } => branch_if(&mut state.frame, di.offset, rel, true)?,

            Instr::Invokestatic { func } => {
                self.invoke_static(program, state, func, trace_mask, trace)?;
            }
            Instr::Invokenative { native } => {
                self.invoke_native(program, state, native, trace_mask, trace)?;
            }

            Instr::New { size } => {
                let obj = self.heap.alloc_block(u32::from(size));
                stack.push(Value::Ptr(Pointer::to(Address::Cell { obj, offset: 0 })));
            }
            Instr::Imload => {
                let (obj, offset) = cell(pop_ptr(stack)?)?;
                let v = self.heap.load_int(obj, offset)?;
                stack.push(Value::Int(v));
            }
            Instr::Imstore => {
                let x = pop_int(stack)?;
                let (obj, offset) = cell(pop_ptr(stack)?)?;
                self.heap.store_int(obj, offset, x)?;
            }
            Instr::Amload => {
                let (obj, offset) = cell(pop_ptr(stack)?)?;
                let p = self.heap.load_ptr(obj, offset)?;
                stack.push(Value::Ptr(p));
            }
            Instr::Amstore => {
                let x = pop_ptr(stack)?;
                let (obj, offset) = cell(pop_ptr(stack)?)?;
                self.heap.store_ptr(obj, offset, x)?;
            }
            Instr::Cmload => {
                let p = pop_ptr(stack)?;
                let b = match p {
                    Pointer::Ref {
                        addr: Address::Str(offset),
                        tag: None,
                    } => *program
                        .string_pool
                        .get(offset as usize)
                        .ok_or(MemoryError::WrongShape {
                            expected: "a character",
                        })?,
                    _ => {
                        let (obj, offset) = cell(p)?;
                        self.heap.load_byte(obj, offset)?
                    }
                };
                stack.push(Value::Int(i32::from(b)));
            }
            Instr::Cmstore => {
                let x = pop_int(stack)?;
                let p = pop_ptr(stack)?;
                if let Pointer::Ref {
                    addr: Address::Str(_),
                    tag: None,
                } = p
                {
                    return Err(MemoryError::ReadOnly.into());
                }
                let (obj, offset) = cell(p)?;
                self.heap.store_byte(obj, offset, x.to_le_bytes()[0] & 0x7f)?;
            }
            Instr::Aaddf { field } => {
                let (obj, offset) = cell(pop_ptr(stack)?)?;
                let Some(offset) = offset.checked_add(u32::from(field)) else {
                    return Err(HeapError::OutOfBounds {
                        offset,
                        width: u32::from(field),
                        size: self.heap.size(obj)?,
                    }
                    .into());
                };
                stack.push(Value::Ptr(Pointer::to(Address::Cell { obj, offset })));
            }

            Instr::Newarray { elt_size } => {
                let n = pop_int(stack)?;
                let count =
                    u32::try_from(n).map_err(|_| MemoryError::NegativeArraySize { count: n })?;
                let obj = self.heap.alloc_array(count, elt_size)?;
                stack.push(Value::Ptr(Pointer::to(Address::Array(obj))));
            }
            Instr::Arraylength => {
                let obj = array(pop_ptr(stack)?)?;
                let count = self.heap.array_len(obj)?;
                // Counts come from non-negative `i32`s.
                stack.push(Value::Int(i32::try_from(count).unwrap_or(i32::MAX)));
            }
            Instr::Aadds => {
                let index = pop_int(stack)?;
                let obj = array(pop_ptr(stack)?)?;
                // Negative indices reinterpret as huge unsigned values and fail the bounds check.
                let Some(offset) = self.heap.array_elem_offset(obj, index as u32)? else {
                    return Err(MemoryError::IndexOutOfBounds {
                        index,
                        count: self.heap.array_len(obj)?,
                    }
                    .into());
                };
                stack.push(Value::Ptr(Pointer::to(Address::Cell { obj, offset })));
            }

            Instr::Checktag { tag } => match pop_ptr(stack)? {
                Pointer::Null => return Err(MemoryError::NullDeref.into()),
                p @ Pointer::Ref { tag: actual, .. } => {
                    if actual != Some(tag) {
                        return Err(MemoryError::TagMismatch {
                            expected: tag,
                            actual,
                        }
                        .into());
                    }
                    stack.push(Value::Ptr(p.untagged()));
                }
            },
            Instr::Hastag { tag } => {
                let p = pop_ptr(stack)?;
                if p.is_null() {
                    return Err(MemoryError::NullDeref.into());
                }
                stack.push(Value::from_bool(p.tag() == Some(tag)));
            }
            Instr::Addtag { tag } => {
                let p = pop_ptr(stack)?;
                stack.push(Value::Ptr(p.with_tag(tag)));
            }
            Instr::AddrofStatic { func } => {
                if program.function(func).is_none() {
                    return Err(ContractViolation::FunctionOutOfBounds(func).into());
                }
                stack.push(Value::Ptr(Pointer::to(Address::Func(func))));
            }
            Instr::AddrofNative { native } => {
                if program.native(native).is_none() {
                    return Err(ContractViolation::NativeOutOfBounds(native).into());
                }
                stack.push(Value::Ptr(Pointer::to(Address::Native(native))));
            }
            Instr::Invokedynamic => match pop_ptr(stack)? {
                Pointer::Null => return Err(MemoryError::NullDeref.into()),
                Pointer::Ref { tag: Some(_), .. } => {
                    return Err(ContractViolation::TaggedPointer.into());
                }
                Pointer::Ref {
                    addr: Address::Func(func),
                    ..
                } => self.invoke_static(program, state, func, trace_mask, trace)?,
                Pointer::Ref {
                    addr: Address::Native(native),
                    ..
                } => self.invoke_native(program, state, native, trace_mask, trace)?,
                Pointer::Ref { .. } => return Err(ContractViolation::NotAFunction.into()),
            },
        }

        Ok(Flow::Continue)
    }

    /// Suspends the active frame and switches to `callee` at pc 0.
    fn invoke_static(
        &mut self,
        program: &Program,
        state: &mut ExecState,
        callee: FuncId,
        trace_mask: TraceMask,
        trace: &mut Option<&mut dyn TraceSink>,
    ) -> Result<(), Fault> {
        let f = program
            .function(callee)
            .ok_or(ContractViolation::FunctionOutOfBounds(callee))?;
        if f.num_vars < f.num_args {
            return Err(ContractViolation::TooFewLocals(callee).into());
        }
        if let Some(max) = self.limits.max_call_depth
            && state.depth() >= max
        {
            return Err(Fault::Limit(LimitExceeded::CallDepth));
        }
        let num_args = usize::from(f.num_args);
        if state.frame.stack.len() < num_args {
            return Err(ContractViolation::StackUnderflow.into());
        }

        let mut callee_frame = Frame::new(callee, f.num_vars);
        pop_args(&mut state.frame.stack, &mut callee_frame.locals[..num_args])?;
        let caller = core::mem::replace(&mut state.frame, callee_frame);
        state.calls.push(caller);

        if trace_mask.contains(TraceMask::CALL)
            && let Some(t) = trace.as_mut()
        {
            t.scope_enter(
                program,
                ScopeKind::CallFrame { func: callee },
                state.depth(),
                callee,
                0,
            );
        }
        Ok(())
    }

    /// Calls a native synchronously; the call stack does not grow.
    fn invoke_native(
        &mut self,
        program: &Program,
        state: &mut ExecState,
        native: NativeId,
        trace_mask: TraceMask,
        trace: &mut Option<&mut dyn TraceSink>,
    ) -> Result<(), Fault> {
        let info = program
            .native(native)
            .ok_or(ContractViolation::NativeOutOfBounds(native))?;
        let num_args = usize::from(info.num_args);
        if state.frame.stack.len() < num_args {
            return Err(ContractViolation::StackUnderflow.into());
        }
        let mut args = vec![Value::default(); num_args];
        pop_args(&mut state.frame.stack, &mut args)?;

        let kind = ScopeKind::NativeCall {
            native,
            table_index: info.function_table_index,
        };
        let (func, pc, depth) = (state.frame.func, state.frame.pc, state.depth());
        if trace_mask.contains(TraceMask::NATIVE)
            && let Some(t) = trace.as_mut()
        {
            t.scope_enter(program, kind, depth, func, pc);
        }

        let mut ctx = NativeContext::new(&mut self.heap, program);
        let result = self
            .natives
            .call(info.function_table_index, &args, &mut ctx);

        if trace_mask.contains(TraceMask::NATIVE)
            && let Some(t) = trace.as_mut()
        {
            t.scope_exit(program, kind, depth, func, pc);
        }

        state.frame.stack.push(result.map_err(Fault::Native)?);
        Ok(())
    }

    /// `RETURN`: hands the result to the caller, or ends the run from the outermost frame.
    fn ret(
        &mut self,
        program: &Program,
        state: &mut ExecState,
        trace_mask: TraceMask,
        trace: &mut Option<&mut dyn TraceSink>,
    ) -> Result<Flow, Fault> {
        let rv = pop(&mut state.frame.stack)?;
        if !state.frame.stack.is_empty() {
            return Err(ContractViolation::StackNotEmptyOnReturn {
                remaining: state.frame.stack.len(),
            }
            .into());
        }

        if state.calls.is_empty() && rv.kind() == ValueKind::Ptr {
            return Err(type_mismatch(ValueKind::Int, rv));
        }

        if trace_mask.contains(TraceMask::CALL)
            && let Some(t) = trace.as_mut()
        {
            let func = state.frame.func;
            t.scope_exit(
                program,
                ScopeKind::CallFrame { func },
                state.depth(),
                func,
                state.frame.pc,
            );
        }

        match state.calls.pop() {
            Some(mut caller) => {
                caller.stack.push(rv);
                // Dropping the callee frame releases its stack and locals.
                state.frame = caller;
                Ok(Flow::Continue)
            }
            None => match rv {
                Value::Int(v) => Ok(Flow::Exit(v)),
                Value::Ptr(_) => Err(type_mismatch(ValueKind::Int, rv)),
            },
        }
    }

    fn message(&self, program: &Program, p: Pointer) -> Result<String, Fault> {
        c_string(&self.heap, program, p)
            .map(lossy)
            .ok_or(Fault::Contract(ContractViolation::BadMessage))
    }
}

fn type_mismatch(expected: ValueKind, actual: Value) -> Fault {
    Fault::Contract(ContractViolation::TypeMismatch {
        expected,
        actual: actual.kind(),
    })
}

/// Exits the scope of every live frame after a fault, innermost first.
///
/// The active frame reports the faulting `pc`; suspended frames report their resume offset.
fn close_frames(program: &Program, state: &ExecState, pc: usize, trace: &mut dyn TraceSink) {
    let active = core::iter::once((state.frame.func, pc));
    let suspended = state.calls.iter().rev().map(|f| (f.func, f.pc));
    for ((func, pc), depth) in active.chain(suspended).zip((1..=state.depth()).rev()) {
        trace.scope_exit(program, ScopeKind::CallFrame { func }, depth, func, pc);
    }
}

#[inline]
fn pop(stack: &mut OperandStack) -> Result<Value, Fault> {
    stack
        .pop()
        .ok_or(Fault::Contract(ContractViolation::StackUnderflow))
}

#[inline]
fn pop_int(stack: &mut OperandStack) -> Result<i32, Fault> {
    let v = pop(stack)?;
    v.as_int().ok_or_else(|| type_mismatch(ValueKind::Int, v))
}

#[inline]
fn pop_ptr(stack: &mut OperandStack) -> Result<Pointer, Fault> {
    let v = pop(stack)?;
    v.as_ptr().ok_or_else(|| type_mismatch(ValueKind::Ptr, v))
}

/// Pops `v1` then `v2` and returns them as `(v2, v1)`, i.e. in push order.
#[inline]
fn pop_int_pair(stack: &mut OperandStack) -> Result<(i32, i32), Fault> {
    let v1 = pop_int(stack)?;
    let v2 = pop_int(stack)?;
    Ok((v2, v1))
}

/// Pops `dst.len()` values so that the last one popped lands in `dst[0]`.
fn pop_args(stack: &mut OperandStack, dst: &mut [Value]) -> Result<(), Fault> {
    for slot in dst.iter_mut().rev() {
        *slot = pop(stack)?;
    }
    Ok(())
}

/// Pops the right operand, then the left, and pushes `f(left, right)`.
#[inline]
fn int_binop(
    stack: &mut OperandStack,
    f: impl FnOnce(i32, i32) -> Result<i32, Fault>,
) -> Result<(), Fault> {
    let (lhs, rhs) = pop_int_pair(stack)?;
    stack.push(Value::Int(f(lhs, rhs)?));
    Ok(())
}

/// Truncating quotient and remainder.
fn checked_div(a: i32, b: i32) -> Result<(i32, i32), Fault> {
    if b == 0 {
        return Err(ArithError::DivByZero.into());
    }
    if a == i32::MIN && b == -1 {
        return Err(ArithError::DivOverflow.into());
    }
    Ok((a / b, a % b))
}

fn shift_amount(b: i32) -> Result<u32, Fault> {
    u32::try_from(b)
        .ok()
        .filter(|s| *s < 32)
        .ok_or(Fault::Arithmetic(ArithError::ShiftOutOfRange { amount: b }))
}

fn branch_if(frame: &mut Frame, opcode_pc: usize, rel: i16, taken: bool) -> Result<(), Fault> {
    if taken {
        frame.pc = branch_target(opcode_pc, rel).ok_or(ContractViolation::PcOutOfBounds)?;
    }
    Ok(())
}

/// Resolves a pointer used by a cell load/store to `(object, byte offset)`.
fn cell(p: Pointer) -> Result<(ObjHandle, u32), Fault> {
    match p {
        Pointer::Null => Err(MemoryError::NullDeref.into()),
        Pointer::Ref { tag: Some(_), .. } => Err(ContractViolation::TaggedPointer.into()),
        Pointer::Ref {
            addr: Address::Cell { obj, offset },
            ..
        } => Ok((obj, offset)),
        Pointer::Ref { .. } => Err(MemoryError::WrongShape {
            expected: "heap memory",
        }
        .into()),
    }
}

fn array(p: Pointer) -> Result<ObjHandle, Fault> {
    match p {
        Pointer::Null => Err(MemoryError::NullDeref.into()),
        Pointer::Ref { tag: Some(_), .. } => Err(ContractViolation::TaggedPointer.into()),
        Pointer::Ref {
            addr: Address::Array(obj),
            ..
        } => Ok(obj),
        Pointer::Ref { .. } => Err(MemoryError::WrongShape {
            expected: "an array",
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{Asm, ProgramBuilder};
    use crate::native::{NativeTable, NoNatives, int_arg};
    use alloc::vec::Vec;

    fn program(num_vars: u16, body: impl FnOnce(&mut Asm)) -> Program {
        let mut a = Asm::new();
        body(&mut a);
        let mut pb = ProgramBuilder::new();
        pb.push_function(a, 0, num_vars).unwrap();
        pb.build().unwrap()
    }

    fn run(p: &Program) -> Result<i32, FaultInfo> {
        Vm::new(NoNatives, Limits::default()).run(p, TraceMask::NONE, None)
    }

    fn fault(p: &Program) -> (usize, Fault) {
        let e = run(p).unwrap_err();
        (e.pc, e.fault)
    }

    #[test]
    fn multiplies_small_constants() {
        let p = program(0, |a| {
            a.bipush(5).bipush(3).imul().ret();
        });
        assert_eq!(run(&p), Ok(15));
    }

    #[test]
    fn arithmetic_wraps() {
        let mut pb = ProgramBuilder::new();
        let max = pb.int_const(i32::MAX).unwrap();
        let mut a = Asm::new();
        a.ildc(max).bipush(1).iadd().ret();
        pb.push_function(a, 0, 0).unwrap();
        assert_eq!(run(&pb.build().unwrap()), Ok(i32::MIN));
    }

    #[test]
    fn division_faults_carry_the_opcode_offset() {
        let p = program(0, |a| {
            a.bipush(7).bipush(0).idiv().ret();
        });
        assert_eq!(fault(&p), (4, Fault::Arithmetic(ArithError::DivByZero)));

        let p = program(0, |a| {
            a.bipush(7).bipush(0).irem().ret();
        });
        assert_eq!(fault(&p), (4, Fault::Arithmetic(ArithError::DivByZero)));

        let mut pb = ProgramBuilder::new();
        let min = pb.int_const(i32::MIN).unwrap();
        let mut a = Asm::new();
        a.ildc(min).bipush(-1).idiv().ret();
        pb.push_function(a, 0, 0).unwrap();
        assert_eq!(
            fault(&pb.build().unwrap()),
            (5, Fault::Arithmetic(ArithError::DivOverflow))
        );
    }

    #[test]
    fn division_truncates_toward_zero() {
        for (x, y) in [(7, 2), (-7, 2), (7, -2), (-7, -2)] {
            let p = program(0, |a| {
                // (x / y) * y + x % y
                a.bipush(x).bipush(y).idiv().bipush(y).imul();
                a.bipush(x).bipush(y).irem().iadd().ret();
            });
            assert_eq!(run(&p), Ok(i32::from(x)));
        }
        let p = program(0, |a| {
            a.bipush(-7).bipush(2).irem().ret();
        });
        assert_eq!(run(&p), Ok(-1));
    }

    #[test]
    fn shifts_are_range_checked() {
        let p = program(0, |a| {
            a.bipush(-16).bipush(2).ishr().ret();
        });
        assert_eq!(run(&p), Ok(-4));
        let p = program(0, |a| {
            a.bipush(1).bipush(31).ishl().ret();
        });
        assert_eq!(run(&p), Ok(i32::MIN));
        for amount in [32, -1] {
            let p = program(0, |a| {
                a.bipush(1).bipush(amount).ishl().ret();
            });
            assert_eq!(
                fault(&p).1,
                Fault::Arithmetic(ArithError::ShiftOutOfRange {
                    amount: i32::from(amount)
                })
            );
        }
    }

    #[test]
    fn bitwise_ops() {
        let p = program(0, |a| {
            a.bipush(0b1100).bipush(0b1010).ixor();
            a.bipush(0b0110).ior();
            a.bipush(0b0011).iand().ret();
        });
        assert_eq!(run(&p), Ok(0b0010));
    }

    #[test]
    fn stack_shuffles() {
        let p = program(0, |a| {
            // 1 2 -> 2 1 -> 2 1 1 -> 2 2 -> 0
            a.bipush(1).bipush(2).swap().dup().iadd().isub().ret();
        });
        assert_eq!(run(&p), Ok(0));
        let p = program(0, |a| {
            a.bipush(9).bipush(4).pop().nop().ret();
        });
        assert_eq!(run(&p), Ok(9));
    }

    #[test]
    fn loop_sums_to_ten() {
        // i = 0; s = 0; while (i < 5) { s += i; i += 1; } return s;
        let p = program(2, |a| {
            let top = a.label();
            let done = a.label();
            a.bipush(0).vstore(0).bipush(0).vstore(1);
            a.place(top);
            a.vload(0).bipush(5).if_icmpge(done);
            a.vload(1).vload(0).iadd().vstore(1);
            a.vload(0).bipush(1).iadd().vstore(0);
            a.goto(top);
            a.place(done);
            a.vload(1).ret();
        });
        assert_eq!(run(&p), Ok(10));
    }

    #[test]
    fn pointer_equality_branches() {
        let p = program(0, |a| {
            let eq = a.label();
            a.aconst_null().aconst_null().if_cmpeq(eq);
            a.bipush(0).ret();
            a.place(eq);
            a.bipush(1).ret();
        });
        assert_eq!(run(&p), Ok(1));
    }

    #[test]
    fn calls_pass_arguments_and_restore_callers() {
        // main: 100, f(10) -> 100 + 12
        // f(x): 99, g(x), swap, pop (the call leaves f's own stack intact)
        // g(x): x + 2
        let mut pb = ProgramBuilder::new();
        let main = pb.declare_function(0, 0).unwrap();
        let f = pb.declare_function(1, 1).unwrap();
        let g = pb.declare_function(1, 1).unwrap();
        let mut a = Asm::new();
        a.bipush(100).bipush(10).invokestatic(f).iadd().ret();
        pb.define_function(main, a).unwrap();
        let mut a = Asm::new();
        a.bipush(99).vload(0).invokestatic(g).swap().pop().ret();
        pb.define_function(f, a).unwrap();
        let mut a = Asm::new();
        a.vload(0).bipush(2).iadd().ret();
        pb.define_function(g, a).unwrap();
        assert_eq!(run(&pb.build().unwrap()), Ok(112));
    }

    #[test]
    fn arguments_land_in_order() {
        let mut pb = ProgramBuilder::new();
        let main = pb.declare_function(0, 0).unwrap();
        let sub = pb.declare_function(2, 3).unwrap();
        let mut a = Asm::new();
        a.bipush(10).bipush(3).invokestatic(sub).ret();
        pb.define_function(main, a).unwrap();
        let mut a = Asm::new();
        // Extra local starts at zero.
        a.vload(0).vload(1).isub().vload(2).iadd().ret();
        pb.define_function(sub, a).unwrap();
        assert_eq!(run(&pb.build().unwrap()), Ok(7));
    }

    #[test]
    fn run_function_takes_entry_arguments() {
        let mut pb = ProgramBuilder::new();
        let mut a = Asm::new();
        a.bipush(0).ret();
        pb.push_function(a, 0, 0).unwrap();
        let mut a = Asm::new();
        a.vload(0).vload(1).imul().ret();
        let mul = pb.push_function(a, 2, 2).unwrap();
        let p = pb.build().unwrap();

        let mut vm = Vm::new(NoNatives, Limits::default());
        let args = [Value::Int(6), Value::Int(7)];
        assert_eq!(vm.run_function(&p, mul, &args, TraceMask::NONE, None), Ok(42));
        let err = vm
            .run_function(&p, mul, &args[..1], TraceMask::NONE, None)
            .unwrap_err();
        assert_eq!(
            err.fault,
            Fault::Contract(ContractViolation::EntryArity {
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn return_with_leftovers_is_a_contract_violation() {
        let p = program(0, |a| {
            a.bipush(1).bipush(2).ret();
        });
        assert_eq!(
            fault(&p),
            (
                4,
                Fault::Contract(ContractViolation::StackNotEmptyOnReturn { remaining: 1 })
            )
        );
    }

    #[test]
    fn malformed_code_is_reported() {
        let p = program(0, |a| {
            a.pop();
        });
        assert_eq!(
            fault(&p),
            (0, Fault::Contract(ContractViolation::StackUnderflow))
        );

        let p = program(0, |a| {
            a.bipush(1).raw(0xEE);
        });
        assert_eq!(
            fault(&p),
            (2, Fault::Contract(ContractViolation::InvalidOpcode { opcode: 0xEE }))
        );

        let p = program(0, |a| {
            a.raw(0x13).raw(0x00);
        });
        assert_eq!(
            fault(&p),
            (0, Fault::Contract(ContractViolation::TruncatedInstruction))
        );

        let p = program(0, |a| {
            a.bipush(1).pop();
        });
        assert_eq!(fault(&p), (3, Fault::Contract(ContractViolation::PcOutOfBounds)));

        let p = program(1, |a| {
            a.vload(1).ret();
        });
        assert_eq!(
            fault(&p),
            (0, Fault::Contract(ContractViolation::LocalOutOfBounds { slot: 1 }))
        );

        let p = program(0, |a| {
            a.aconst_null().bipush(1).iadd().ret();
        });
        assert_eq!(
            fault(&p).1,
            Fault::Contract(ContractViolation::TypeMismatch {
                expected: ValueKind::Int,
                actual: ValueKind::Ptr,
            })
        );

        let p = program(0, |a| {
            a.aconst_null().ret();
        });
        assert_eq!(fault(&p).1.kind(), FaultKind::Contract);
    }

    #[test]
    fn pool_indices_are_checked() {
        let p = program(0, |a| {
            a.ildc(3).ret();
        });
        assert_eq!(
            fault(&p).1,
            Fault::Contract(ContractViolation::IntPoolOutOfBounds { idx: 3 })
        );
        let p = program(0, |a| {
            a.invokestatic(FuncId(9)).ret();
        });
        assert_eq!(
            fault(&p).1,
            Fault::Contract(ContractViolation::FunctionOutOfBounds(FuncId(9)))
        );
        let p = program(0, |a| {
            a.invokenative(NativeId(0)).ret();
        });
        assert_eq!(
            fault(&p).1,
            Fault::Contract(ContractViolation::NativeOutOfBounds(NativeId(0)))
        );
    }

    #[test]
    fn struct_fields_round_trip() {
        // struct { int a; int b; T* next; } = 16 bytes
        let p = program(1, |a| {
            a.new_obj(16).vstore(0);
            a.vload(0).aaddf(4).bipush(42).imstore();
            a.vload(0).aaddf(8).vload(0).amstore();
            // p->next->b
            a.vload(0).aaddf(8).amload().aaddf(4).imload().ret();
        });
        assert_eq!(run(&p), Ok(42));
    }

    #[test]
    fn fresh_blocks_are_zeroed() {
        let p = program(0, |a| {
            let null = a.label();
            a.new_obj(8).amload().aconst_null().if_cmpeq(null);
            a.bipush(0).ret();
            a.place(null);
            a.new_obj(4).imload().bipush(7).iadd().ret();
        });
        assert_eq!(run(&p), Ok(7));
    }

    #[test]
    fn memory_faults() {
        let p = program(0, |a| {
            a.aconst_null().imload().ret();
        });
        assert_eq!(fault(&p), (1, Fault::Memory(MemoryError::NullDeref)));

        let p = program(0, |a| {
            a.new_obj(4).aaddf(4).imload().ret();
        });
        assert_eq!(
            fault(&p),
            (
                4,
                Fault::Memory(MemoryError::Heap(HeapError::OutOfBounds {
                    offset: 4,
                    width: 4,
                    size: 4
                }))
            )
        );

        let p = program(0, |a| {
            a.new_obj(8).dup().new_obj(1).amstore().imload().ret();
        });
        assert_eq!(
            fault(&p).1,
            Fault::Memory(MemoryError::Heap(HeapError::PointerCell { offset: 0 }))
        );
    }

    #[test]
    fn arrays_index_and_count() {
        // int[] xs = alloc_array(int, 5); xs[4] = 9; return xs[4] + length(xs);
        let p = program(1, |a| {
            a.bipush(5).newarray(4).vstore(0);
            a.vload(0).bipush(4).aadds().bipush(9).imstore();
            a.vload(0).bipush(4).aadds().imload();
            a.vload(0).arraylength().iadd().ret();
        });
        assert_eq!(run(&p), Ok(14));

        for index in [5, -1] {
            let p = program(0, |a| {
                a.bipush(5).newarray(4).bipush(index).aadds().imload().ret();
            });
            assert_eq!(
                fault(&p).1,
                Fault::Memory(MemoryError::IndexOutOfBounds {
                    index: i32::from(index),
                    count: 5
                })
            );
        }

        let p = program(0, |a| {
            a.bipush(-2).newarray(4).arraylength().ret();
        });
        assert_eq!(
            fault(&p),
            (2, Fault::Memory(MemoryError::NegativeArraySize { count: -2 }))
        );

        let p = program(0, |a| {
            a.bipush(0).newarray(4).arraylength().ret();
        });
        assert_eq!(run(&p), Ok(0));

        let p = program(0, |a| {
            a.aconst_null().arraylength().ret();
        });
        assert_eq!(fault(&p).1, Fault::Memory(MemoryError::NullDeref));
    }

    #[test]
    fn pointer_arrays_hold_pointers() {
        let p = program(1, |a| {
            a.bipush(3).newarray(8).vstore(0);
            a.vload(0).bipush(2).aadds().new_obj(4).amstore();
            a.vload(0).bipush(2).aadds().amload().imload().ret();
        });
        assert_eq!(run(&p), Ok(0));
    }

    #[test]
    fn chars_from_pool_and_heap() {
        let mut pb = ProgramBuilder::new();
        let s = pb.string_const("AZ").unwrap();
        let c = pb.int_const(200).unwrap();
        let mut a = Asm::new();
        // "AZ"[1] + heap char (200 & 0x7f)
        a.aldc(s + 1).cmload();
        a.new_obj(1).dup().ildc(c).cmstore().cmload();
        a.iadd().ret();
        pb.push_function(a, 0, 0).unwrap();
        assert_eq!(run(&pb.build().unwrap()), Ok(90 + 72));

        let mut pb = ProgramBuilder::new();
        let s = pb.string_const("x").unwrap();
        let mut a = Asm::new();
        a.aldc(s).bipush(65).cmstore().bipush(0).ret();
        pb.push_function(a, 0, 0).unwrap();
        assert_eq!(
            fault(&pb.build().unwrap()),
            (5, Fault::Memory(MemoryError::ReadOnly))
        );
    }

    #[test]
    fn tags_check_and_strip() {
        let p = program(1, |a| {
            a.new_obj(4).addtag(7).vstore(0);
            a.vload(0).hastag(7);
            a.vload(0).hastag(8).iadd();
            a.vload(0).checktag(7).imload().iadd().ret();
        });
        assert_eq!(run(&p), Ok(1));

        let p = program(0, |a| {
            a.new_obj(4).addtag(7).checktag(8).pop().bipush(0).ret();
        });
        assert_eq!(
            fault(&p),
            (
                5,
                Fault::Memory(MemoryError::TagMismatch {
                    expected: 8,
                    actual: Some(7)
                })
            )
        );

        let p = program(0, |a| {
            a.new_obj(4).checktag(1).pop().bipush(0).ret();
        });
        assert_eq!(
            fault(&p).1,
            Fault::Memory(MemoryError::TagMismatch {
                expected: 1,
                actual: None
            })
        );

        let p = program(0, |a| {
            a.aconst_null().addtag(3).checktag(3).pop().bipush(0).ret();
        });
        assert_eq!(fault(&p).1, Fault::Memory(MemoryError::NullDeref));

        let p = program(0, |a| {
            a.new_obj(4).addtag(2).imload().ret();
        });
        assert_eq!(fault(&p).1, Fault::Contract(ContractViolation::TaggedPointer));
    }

    #[test]
    fn errors_carry_program_messages() {
        let mut pb = ProgramBuilder::new();
        let s = pb.string_const("boom").unwrap();
        let mut a = Asm::new();
        a.aldc(s).athrow();
        pb.push_function(a, 0, 0).unwrap();
        assert_eq!(
            fault(&pb.build().unwrap()),
            (3, Fault::User(String::from("boom")))
        );

        let mut pb = ProgramBuilder::new();
        let s = pb.string_const("x > 0").unwrap();
        let mut a = Asm::new();
        a.bipush(1).aldc(s).assert();
        a.bipush(0).aldc(s).assert();
        a.bipush(0).ret();
        pb.push_function(a, 0, 0).unwrap();
        let err = run(&pb.build().unwrap()).unwrap_err();
        assert_eq!(err.pc, 11);
        assert_eq!(err.fault, Fault::Assertion(String::from("x > 0")));
        assert_eq!(err.kind(), FaultKind::Assertion);
    }

    fn add3(_: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, NativeError> {
        Ok(Value::Int(
            int_arg(args, 0)? * 100 + int_arg(args, 1)? * 10 + int_arg(args, 2)?,
        ))
    }

    fn fail(_: &mut NativeContext<'_>, _: &[Value]) -> Result<Value, NativeError> {
        Err(NativeError::Failed(String::from("nope")))
    }

    #[test]
    fn natives_receive_arguments_in_order() {
        let mut pb = ProgramBuilder::new();
        let n = pb.native(3, 4).unwrap();
        let mut a = Asm::new();
        a.bipush(9).bipush(1).bipush(2).bipush(3).invokenative(n).iadd().ret();
        pb.push_function(a, 0, 0).unwrap();
        let p = pb.build().unwrap();

        let mut table = NativeTable::new();
        table.register(4, add3);
        let mut vm = Vm::new(table, Limits::default());
        assert_eq!(vm.run(&p, TraceMask::NONE, None), Ok(132));

        vm.natives_mut().register(4, fail);
        let err = vm.run(&p, TraceMask::NONE, None).unwrap_err();
        assert_eq!(err.pc, 8);
        assert_eq!(err.fault, Fault::Native(NativeError::Failed(String::from("nope"))));
    }

    #[test]
    fn invokedynamic_calls_through_descriptors() {
        let mut pb = ProgramBuilder::new();
        let main = pb.declare_function(0, 1).unwrap();
        let neg = pb.declare_function(1, 1).unwrap();
        let n = pb.native(3, 0).unwrap();
        let mut a = Asm::new();
        a.bipush(5).addrof_static(neg).invokedynamic().vstore(0);
        a.bipush(1).bipush(2).bipush(3).addrof_native(n).invokedynamic();
        a.vload(0).iadd().ret();
        pb.define_function(main, a).unwrap();
        let mut a = Asm::new();
        a.bipush(0).vload(0).isub().ret();
        pb.define_function(neg, a).unwrap();
        let p = pb.build().unwrap();

        let mut table = NativeTable::new();
        table.register(0, add3);
        let mut vm = Vm::new(table, Limits::default());
        assert_eq!(vm.run(&p, TraceMask::NONE, None), Ok(118));

        let p = program(0, |a| {
            a.new_obj(1).invokedynamic().ret();
        });
        assert_eq!(fault(&p).1, Fault::Contract(ContractViolation::NotAFunction));
        let p = program(0, |a| {
            a.aconst_null().invokedynamic().ret();
        });
        assert_eq!(fault(&p).1, Fault::Memory(MemoryError::NullDeref));
    }

    #[test]
    fn fuel_stops_infinite_loops() {
        let p = program(0, |a| {
            let top = a.label();
            a.place(top);
            a.goto(top);
        });
        let mut vm = Vm::new(
            NoNatives,
            Limits {
                fuel: Some(100),
                max_call_depth: None,
            },
        );
        let err = vm.run(&p, TraceMask::NONE, None).unwrap_err();
        assert_eq!(err.fault, Fault::Limit(LimitExceeded::Fuel));
        assert_eq!(err.pc, 0);
    }

    #[test]
    fn call_depth_limit() {
        let mut pb = ProgramBuilder::new();
        let f = pb.declare_function(0, 0).unwrap();
        let mut a = Asm::new();
        a.invokestatic(f).ret();
        pb.define_function(f, a).unwrap();
        let p = pb.build().unwrap();
        let mut vm = Vm::new(
            NoNatives,
            Limits {
                fuel: None,
                max_call_depth: Some(64),
            },
        );
        let err = vm.run(&p, TraceMask::NONE, None).unwrap_err();
        assert_eq!(err.fault, Fault::Limit(LimitExceeded::CallDepth));
    }

    #[test]
    fn heap_persists_across_runs() {
        let p = program(0, |a| {
            a.new_obj(4).pop().bipush(0).ret();
        });
        let mut vm = Vm::new(NoNatives, Limits::default());
        vm.run(&p, TraceMask::NONE, None).unwrap();
        vm.run(&p, TraceMask::NONE, None).unwrap();
        assert_eq!(vm.heap().len(), 2);
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl TraceSink for Recorder {
        fn mask(&self) -> TraceMask {
            TraceMask::ALL
        }

        fn run_start(&mut self, _: &Program, entry: FuncId, arg_count: usize) {
            self.events.push(alloc::format!("start f{} {arg_count}", entry.0));
        }

        fn instr(
            &mut self,
            _: &Program,
            func: FuncId,
            pc: usize,
            opcode: crate::opcode::Opcode,
            depth: usize,
        ) {
            self.events
                .push(alloc::format!("f{}@{pc} {} {depth}", func.0, opcode.mnemonic()));
        }

        fn scope_enter(&mut self, _: &Program, kind: ScopeKind, depth: usize, _: FuncId, _: usize) {
            self.events.push(alloc::format!("enter {kind:?} {depth}"));
        }

        fn scope_exit(&mut self, _: &Program, kind: ScopeKind, depth: usize, _: FuncId, _: usize) {
            self.events.push(alloc::format!("exit {kind:?} {depth}"));
        }

        fn run_end(&mut self, _: &Program, outcome: TraceOutcome<'_>) {
            let s = match outcome {
                TraceOutcome::Ok(v) => alloc::format!("end ok {v}"),
                TraceOutcome::Fault(info) => alloc::format!("end fault {}", info.pc),
            };
            self.events.push(s);
        }
    }

    #[test]
    fn trace_reports_nested_scopes() {
        let mut pb = ProgramBuilder::new();
        let main = pb.declare_function(0, 0).unwrap();
        let id = pb.declare_function(1, 1).unwrap();
        let mut a = Asm::new();
        a.bipush(4).invokestatic(id).ret();
        pb.define_function(main, a).unwrap();
        let mut a = Asm::new();
        a.vload(0).ret();
        pb.define_function(id, a).unwrap();
        let p = pb.build().unwrap();

        let mut rec = Recorder::default();
        let mask = rec.mask();
        let mut vm = Vm::new(NoNatives, Limits::default());
        assert_eq!(vm.run(&p, mask, Some(&mut rec)), Ok(4));
        let expected = [
            "start f0 0",
            "enter CallFrame { func: FuncId(0) } 1",
            "f0@0 bipush 0",
            "f0@2 invokestatic 1",
            "enter CallFrame { func: FuncId(1) } 2",
            "f1@0 vload 0",
            "f1@2 return 1",
            "exit CallFrame { func: FuncId(1) } 2",
            "f0@5 return 1",
            "exit CallFrame { func: FuncId(0) } 1",
            "end ok 4",
        ];
        assert_eq!(rec.events, expected);
    }

    #[test]
    fn trace_mask_filters_events() {
        let p = program(0, |a| {
            a.bipush(1).bipush(0).idiv().ret();
        });
        let mut rec = Recorder::default();
        let mut vm = Vm::new(NoNatives, Limits::default());
        let err = vm.run(&p, TraceMask::RUN, Some(&mut rec)).unwrap_err();
        assert_eq!(err.kind(), FaultKind::Arithmetic);
        assert_eq!(rec.events, ["start f0 0", "end fault 4"]);
    }

    #[test]
    fn faults_close_every_open_frame() {
        let mut pb = ProgramBuilder::new();
        let main = pb.declare_function(0, 0).unwrap();
        let f = pb.declare_function(0, 0).unwrap();
        let mut a = Asm::new();
        a.invokestatic(f).ret();
        pb.define_function(main, a).unwrap();
        let mut a = Asm::new();
        a.bipush(1).bipush(0).idiv().ret();
        pb.define_function(f, a).unwrap();
        let p = pb.build().unwrap();

        let mut rec = Recorder::default();
        let mut vm = Vm::new(NoNatives, Limits::default());
        let err = vm.run(&p, TraceMask::CALL, Some(&mut rec)).unwrap_err();
        assert_eq!((err.func, err.pc), (f, 4));
        let expected = [
            "enter CallFrame { func: FuncId(0) } 1",
            "enter CallFrame { func: FuncId(1) } 2",
            "exit CallFrame { func: FuncId(1) } 2",
            "exit CallFrame { func: FuncId(0) } 1",
        ];
        assert_eq!(rec.events, expected);
    }

    #[test]
    fn pointer_exit_value_closes_the_frame_once() {
        let p = program(0, |a| {
            a.aconst_null().ret();
        });
        let mut rec = Recorder::default();
        let mut vm = Vm::new(NoNatives, Limits::default());
        let err = vm.run(&p, TraceMask::CALL, Some(&mut rec)).unwrap_err();
        assert_eq!(err.kind(), FaultKind::Contract);
        assert_eq!(
            rec.events,
            [
                "enter CallFrame { func: FuncId(0) } 1",
                "exit CallFrame { func: FuncId(0) } 1",
            ]
        );
    }

    #[test]
    fn fault_info_displays_location() {
        let info = FaultInfo {
            func: FuncId(2),
            pc: 17,
            fault: Fault::Arithmetic(ArithError::DivByZero),
        };
        assert_eq!(
            alloc::format!("{info}"),
            "fault at f2 pc=17: arithmetic error: division by zero"
        );
    }
}
