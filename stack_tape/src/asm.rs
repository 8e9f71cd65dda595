// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bytecode assembler and program builder.
//!
//! [`Asm`] emits one function's bytecode with symbolic labels for branch targets. Branch offsets
//! are patched when [`Asm::finish`] is called. [`ProgramBuilder`] collects functions, interns
//! constants and native descriptors, and produces a [`Program`].
//!
//! ## Example
//! ```
//! use stack_tape::asm::{Asm, ProgramBuilder};
//! use stack_tape::native::NoNatives;
//! use stack_tape::trace::TraceMask;
//! use stack_tape::vm::{Limits, Vm};
//!
//! let mut a = Asm::new();
//! a.bipush(5).bipush(3).imul().ret();
//!
//! let mut pb = ProgramBuilder::new();
//! pb.push_function(a, 0, 0)?;
//! let program = pb.build()?;
//!
//! let mut vm = Vm::new(NoNatives, Limits::default());
//! assert_eq!(vm.run(&program, TraceMask::NONE, None), Ok(15));
//! # Ok::<(), stack_tape::asm::BuildError>(())
//! ```

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::bytecode::Instr;
use crate::program::{Function, NativeInfo, Program};
use crate::value::{FuncId, NativeId};

/// A branch target within one [`Asm`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Label(u32);

/// Assembly errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AsmError {
    /// A branch refers to a label that was never placed.
    UnresolvedLabel(Label),
    /// A branch target does not fit in a signed 16-bit offset.
    BranchOutOfRange {
        /// Byte offset of the branch opcode.
        at: usize,
        /// Byte offset of the target.
        target: usize,
    },
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnresolvedLabel(l) => write!(f, "label {} was never placed", l.0),
            Self::BranchOutOfRange { at, target } => {
                write!(f, "branch at {at} cannot reach {target}")
            }
        }
    }
}

impl core::error::Error for AsmError {}

#[derive(Clone, Debug)]
struct Fixup {
    opcode_pc: usize,
    label: Label,
}

/// Single-function bytecode assembler.
#[derive(Clone, Debug, Default)]
pub struct Asm {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl Asm {
    /// Creates an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current byte offset (where the next instruction will be emitted).
    #[must_use]
    pub fn pc(&self) -> usize {
        self.code.len()
    }

    /// Creates a new unplaced label.
    pub fn label(&mut self) -> Label {
        let id = u32::try_from(self.labels.len()).unwrap_or(u32::MAX);
        self.labels.push(None);
        Label(id)
    }

    /// Places `label` at the current offset.
    pub fn place(&mut self, label: Label) -> &mut Self {
        if let Some(slot) = self.labels.get_mut(label.0 as usize) {
            *slot = Some(self.code.len());
        }
        self
    }

    /// Emits an already-encoded instruction.
    ///
    /// Branch offsets are emitted as given; prefer the label-taking methods for branches.
    pub fn instr(&mut self, instr: Instr) -> &mut Self {
        instr.encode(&mut self.code);
        self
    }

    /// Emits a raw byte. Useful for building deliberately malformed code.
    pub fn raw(&mut self, byte: u8) -> &mut Self {
        self.code.push(byte);
        self
    }

    fn branch(&mut self, make: fn(i16) -> Instr, label: Label) -> &mut Self {
        self.fixups.push(Fixup {
            opcode_pc: self.code.len(),
            label,
        });
        self.instr(make(0))
    }

    /// Resolves labels and returns the finished bytecode.
    pub fn finish(self) -> Result<Vec<u8>, AsmError> {
        let Self {
            mut code,
            labels,
            fixups,
        } = self;
        for fixup in fixups {
            let target = labels
                .get(fixup.label.0 as usize)
                .copied()
                .flatten()
                .ok_or(AsmError::UnresolvedLabel(fixup.label))?;
            // Targets are relative to the byte after the opcode.
            let base = fixup.opcode_pc + 1;
            let out_of_range = AsmError::BranchOutOfRange {
                at: fixup.opcode_pc,
                target,
            };
            let rel = if target >= base {
                i16::try_from(target - base).map_err(|_| out_of_range.clone())?
            } else {
                i16::try_from(base - target)
                    .ok()
                    .and_then(i16::checked_neg)
                    .ok_or(out_of_range)?
            };
            code[base..base + 2].copy_from_slice(&rel.to_be_bytes());
        }
        Ok(code)
    }
}

macro_rules! simple {
    ($($(#[$meta:meta])* $name:ident => $instr:ident;)*) => {
        impl Asm {
            $(
                $(#[$meta])*
                pub fn $name(&mut self) -> &mut Self {
                    self.instr(Instr::$instr)
                }
            )*
        }
    };
}

simple! {
    /// `NOP`
    nop => Nop;
    /// `ACONST_NULL`
    aconst_null => AconstNull;
    /// `POP`
    pop => Pop;
    /// `DUP`
    dup => Dup;
    /// `SWAP`
    swap => Swap;
    /// `IADD`
    iadd => Iadd;
    /// `ISUB`
    isub => Isub;
    /// `IMUL`
    imul => Imul;
    /// `IDIV`
    idiv => Idiv;
    /// `IREM`
    irem => Irem;
    /// `IAND`
    iand => Iand;
    /// `IOR`
    ior => Ior;
    /// `IXOR`
    ixor => Ixor;
    /// `ISHL`
    ishl => Ishl;
    /// `ISHR`
    ishr => Ishr;
    /// `RETURN`
    ret => Return;
    /// `ATHROW`
    athrow => Athrow;
    /// `ASSERT`
    assert => Assert;
    /// `IMLOAD`
    imload => Imload;
    /// `IMSTORE`
    imstore => Imstore;
    /// `AMLOAD`
    amload => Amload;
    /// `AMSTORE`
    amstore => Amstore;
    /// `CMLOAD`
    cmload => Cmload;
    /// `CMSTORE`
    cmstore => Cmstore;
    /// `ARRAYLENGTH`
    arraylength => Arraylength;
    /// `AADDS`
    aadds => Aadds;
    /// `INVOKEDYNAMIC`
    invokedynamic => Invokedynamic;
}

impl Asm {
    /// `BIPUSH imm`
    pub fn bipush(&mut self, imm: i8) -> &mut Self {
        self.instr(Instr::Bipush { imm })
    }

    /// `ILDC idx`
    pub fn ildc(&mut self, idx: u16) -> &mut Self {
        self.instr(Instr::Ildc { idx })
    }

    /// `ALDC idx`
    pub fn aldc(&mut self, idx: u16) -> &mut Self {
        self.instr(Instr::Aldc { idx })
    }

    /// `VLOAD slot`
    pub fn vload(&mut self, slot: u8) -> &mut Self {
        self.instr(Instr::Vload { slot })
    }

    /// `VSTORE slot`
    pub fn vstore(&mut self, slot: u8) -> &mut Self {
        self.instr(Instr::Vstore { slot })
    }

    /// `IF_CMPEQ label`
    pub fn if_cmpeq(&mut self, label: Label) -> &mut Self {
        self.branch(|rel| Instr::IfCmpeq { rel }, label)
    }

    /// `IF_CMPNE label`
    pub fn if_cmpne(&mut self, label: Label) -> &mut Self {
        self.branch(|rel| Instr::IfCmpne { rel }, label)
    }

    /// `IF_ICMPLT label`
    pub fn if_icmplt(&mut self, label: Label) -> &mut Self {
        self.branch(|rel| Instr::IfIcmplt { rel }, label)
    }

    /// `IF_ICMPGE label`
    pub fn if_icmpge(&mut self, label: Label) -> &mut Self {
        self.branch(|rel| Instr::IfIcmpge { rel }, label)
    }

    /// `IF_ICMPGT label`
    pub fn if_icmpgt(&mut self, label: Label) -> &mut Self {
        self.branch(|rel| Instr::IfIcmpgt { rel }, label)
    }

    /// `IF_ICMPLE label`
    pub fn if_icmple(&mut self, label: Label) -> &mut Self {
        self.branch(|rel| Instr::IfIcmple { rel }, label)
    }

    /// `GOTO label`
    pub fn goto(&mut self, label: Label) -> &mut Self {
        self.branch(|rel| Instr::Goto { rel }, label)
    }

    /// `INVOKESTATIC func`
    pub fn invokestatic(&mut self, func: FuncId) -> &mut Self {
        self.instr(Instr::Invokestatic { func })
    }

    /// `INVOKENATIVE native`
    pub fn invokenative(&mut self, native: NativeId) -> &mut Self {
        self.instr(Instr::Invokenative { native })
    }

    /// `NEW size`
    pub fn new_obj(&mut self, size: u8) -> &mut Self {
        self.instr(Instr::New { size })
    }

    /// `AADDF field`
    pub fn aaddf(&mut self, field: u8) -> &mut Self {
        self.instr(Instr::Aaddf { field })
    }

    /// `NEWARRAY elt_size`
    pub fn newarray(&mut self, elt_size: u8) -> &mut Self {
        self.instr(Instr::Newarray { elt_size })
    }

    /// `CHECKTAG tag`
    pub fn checktag(&mut self, tag: u16) -> &mut Self {
        self.instr(Instr::Checktag { tag })
    }

    /// `HASTAG tag`
    pub fn hastag(&mut self, tag: u16) -> &mut Self {
        self.instr(Instr::Hastag { tag })
    }

    /// `ADDTAG tag`
    pub fn addtag(&mut self, tag: u16) -> &mut Self {
        self.instr(Instr::Addtag { tag })
    }

    /// `ADDROF_STATIC func`
    pub fn addrof_static(&mut self, func: FuncId) -> &mut Self {
        self.instr(Instr::AddrofStatic { func })
    }

    /// `ADDROF_NATIVE native`
    pub fn addrof_native(&mut self, native: NativeId) -> &mut Self {
        self.instr(Instr::AddrofNative { native })
    }
}

/// Errors from [`ProgramBuilder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildError {
    /// A declared function was never given a body.
    MissingFunctionBody(FuncId),
    /// A function id that was never declared.
    BadFuncId(FuncId),
    /// A pool grew past its 16-bit index space.
    TooManyEntries {
        /// Which pool overflowed.
        pool: &'static str,
    },
    /// Assembling a function body failed.
    Asm {
        /// The function being defined.
        func: FuncId,
        /// The underlying error.
        error: AsmError,
    },
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingFunctionBody(id) => write!(f, "function {} has no body", id.0),
            Self::BadFuncId(id) => write!(f, "function {} was not declared", id.0),
            Self::TooManyEntries { pool } => write!(f, "too many entries in the {pool} pool"),
            Self::Asm { func, error } => write!(f, "function {}: {error}", func.0),
        }
    }
}

impl core::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Asm { error, .. } => Some(error),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
struct PendingFunction {
    num_args: u16,
    num_vars: u16,
    code: Option<Vec<u8>>,
    name: Option<String>,
}

/// Builds a [`Program`] from assembled functions.
///
/// Function ids are handed out in declaration order, so the first declared function is the
/// entry point.
#[derive(Clone, Debug, Default)]
pub struct ProgramBuilder {
    functions: Vec<PendingFunction>,
    int_pool: Vec<i32>,
    int_index: BTreeMap<i32, u16>,
    string_pool: Vec<u8>,
    string_index: BTreeMap<String, u16>,
    natives: Vec<NativeInfo>,
}

impl ProgramBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a function id so bodies can refer to it before it is defined.
    pub fn declare_function(&mut self, num_args: u16, num_vars: u16) -> Result<FuncId, BuildError> {
        let id = u16::try_from(self.functions.len())
            .map_err(|_| BuildError::TooManyEntries { pool: "function" })?;
        self.functions.push(PendingFunction {
            num_args,
            num_vars,
            code: None,
            name: None,
        });
        Ok(FuncId(id))
    }

    /// Assembles `asm` as the body of a previously declared function.
    pub fn define_function(&mut self, func: FuncId, asm: Asm) -> Result<(), BuildError> {
        let slot = self
            .functions
            .get_mut(usize::from(func.0))
            .ok_or(BuildError::BadFuncId(func))?;
        slot.code = Some(asm.finish().map_err(|error| BuildError::Asm { func, error })?);
        Ok(())
    }

    /// Declares and defines a function in one step.
    pub fn push_function(
        &mut self,
        asm: Asm,
        num_args: u16,
        num_vars: u16,
    ) -> Result<FuncId, BuildError> {
        let id = self.declare_function(num_args, num_vars)?;
        self.define_function(id, asm)?;
        Ok(id)
    }

    /// Attaches a debug name to `func`.
    pub fn set_function_name(&mut self, func: FuncId, name: &str) -> Result<(), BuildError> {
        let slot = self
            .functions
            .get_mut(usize::from(func.0))
            .ok_or(BuildError::BadFuncId(func))?;
        slot.name = Some(String::from(name));
        Ok(())
    }

    /// Interns an integer constant and returns its pool index.
    pub fn int_const(&mut self, value: i32) -> Result<u16, BuildError> {
        if let Some(idx) = self.int_index.get(&value) {
            return Ok(*idx);
        }
        let idx = u16::try_from(self.int_pool.len())
            .map_err(|_| BuildError::TooManyEntries { pool: "integer" })?;
        self.int_pool.push(value);
        self.int_index.insert(value, idx);
        Ok(idx)
    }

    /// Interns a string constant and returns its byte offset in the string pool.
    ///
    /// Interior NULs truncate the string as seen by the program.
    pub fn string_const(&mut self, s: &str) -> Result<u16, BuildError> {
        if let Some(idx) = self.string_index.get(s) {
            return Ok(*idx);
        }
        let idx = u16::try_from(self.string_pool.len())
            .map_err(|_| BuildError::TooManyEntries { pool: "string" })?;
        self.string_pool.extend_from_slice(s.as_bytes());
        self.string_pool.push(0);
        self.string_index.insert(String::from(s), idx);
        Ok(idx)
    }

    /// Appends a native descriptor and returns its pool index.
    pub fn native(
        &mut self,
        num_args: u16,
        function_table_index: u16,
    ) -> Result<NativeId, BuildError> {
        let id = u16::try_from(self.natives.len())
            .map_err(|_| BuildError::TooManyEntries { pool: "native" })?;
        self.natives.push(NativeInfo {
            num_args,
            function_table_index,
        });
        Ok(NativeId(id))
    }

    /// Finishes the program.
    pub fn build(self) -> Result<Program, BuildError> {
        let mut functions = Vec::with_capacity(self.functions.len());
        for (i, f) in self.functions.into_iter().enumerate() {
            let id = FuncId(u16::try_from(i).unwrap_or(u16::MAX));
            let code = f.code.ok_or(BuildError::MissingFunctionBody(id))?;
            functions.push(Function {
                num_args: f.num_args,
                num_vars: f.num_vars,
                code,
                name: f.name,
            });
        }
        Ok(Program::new(
            functions,
            self.int_pool,
            self.string_pool,
            self.natives,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::decode_instructions;
    use alloc::vec;

    #[test]
    fn forward_and_backward_branches_patch() {
        let mut a = Asm::new();
        let top = a.label();
        let done = a.label();
        a.place(top);
        a.bipush(1).bipush(2).if_icmplt(done); // 0, 2, 4
        a.goto(top); // 7
        a.place(done);
        a.bipush(0).ret(); // 10
        let code = a.finish().unwrap();

        let instrs = decode_instructions(&code).unwrap();
        assert_eq!(instrs[2].instr, Instr::IfIcmplt { rel: 5 });
        assert_eq!(instrs[2].branch_target(), Some(10));
        assert_eq!(instrs[3].instr, Instr::Goto { rel: -8 });
        assert_eq!(instrs[3].branch_target(), Some(0));
    }

    #[test]
    fn unplaced_label_is_an_error() {
        let mut a = Asm::new();
        let l = a.label();
        a.goto(l);
        assert_eq!(a.finish(), Err(AsmError::UnresolvedLabel(l)));
    }

    #[test]
    fn far_branch_is_out_of_range() {
        let mut a = Asm::new();
        let l = a.label();
        a.goto(l);
        for _ in 0..40_000 {
            a.nop();
        }
        a.place(l);
        assert!(matches!(a.finish(), Err(AsmError::BranchOutOfRange { at: 0, .. })));
    }

    #[test]
    fn builder_interns_constants() {
        let mut pb = ProgramBuilder::new();
        assert_eq!(pb.int_const(70_000), Ok(0));
        assert_eq!(pb.int_const(-1), Ok(1));
        assert_eq!(pb.int_const(70_000), Ok(0));
        assert_eq!(pb.string_const("hi"), Ok(0));
        assert_eq!(pb.string_const("there"), Ok(3));
        assert_eq!(pb.string_const("hi"), Ok(0));
        assert_eq!(pb.native(2, 9), Ok(NativeId(0)));

        let mut a = Asm::new();
        a.bipush(0).ret();
        let f = pb.push_function(a, 0, 1).unwrap();
        pb.set_function_name(f, "main").unwrap();
        let p = pb.build().unwrap();
        assert_eq!(p.int_pool, vec![70_000, -1]);
        assert_eq!(p.string_pool, b"hi\0there\0".to_vec());
        assert_eq!(p.function_name(FuncId(0)), Some("main"));
    }

    #[test]
    fn declared_but_undefined_function_fails_build() {
        let mut pb = ProgramBuilder::new();
        let f = pb.declare_function(0, 0).unwrap();
        assert_eq!(pb.build(), Err(BuildError::MissingFunctionBody(f)));

        let mut pb = ProgramBuilder::new();
        assert_eq!(
            pb.define_function(FuncId(3), Asm::new()),
            Err(BuildError::BadFuncId(FuncId(3)))
        );
    }
}
