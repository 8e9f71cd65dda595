// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Human-readable bytecode listings.
//!
//! Each line is `offset: mnemonic immediates`. Branch targets are printed as absolute offsets,
//! and pool references are annotated with what they refer to.

use alloc::string::String;
use core::fmt::{self, Write as _};

use crate::bytecode::{BytecodeError, DecodedInstr, Instr, decode_instructions};
use crate::native::lossy;
use crate::program::Program;
use crate::value::FuncId;

/// Disassembly errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisasmError {
    /// The function id is not in the program.
    BadFuncId(FuncId),
    /// The code could not be decoded.
    Bytecode {
        /// Function being listed.
        func: FuncId,
        /// The underlying error.
        error: BytecodeError,
    },
}

impl fmt::Display for DisasmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadFuncId(id) => write!(f, "function {} does not exist", id.0),
            Self::Bytecode { func, error } => write!(f, "function {}: {error}", func.0),
        }
    }
}

impl core::error::Error for DisasmError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Bytecode { error, .. } => Some(error),
            Self::BadFuncId(_) => None,
        }
    }
}

/// Lists one function, preceded by a header line.
pub fn disassemble_function(program: &Program, func: FuncId) -> Result<String, DisasmError> {
    let mut out = String::new();
    write_function(&mut out, program, func)?;
    Ok(out)
}

/// Lists every function in the program, separated by blank lines.
pub fn disassemble_program(program: &Program) -> Result<String, DisasmError> {
    let mut out = String::new();
    for i in 0..program.functions.len() {
        if i > 0 {
            out.push('\n');
        }
        let id = FuncId(u16::try_from(i).unwrap_or(u16::MAX));
        write_function(&mut out, program, id)?;
    }
    Ok(out)
}

fn write_function(out: &mut String, program: &Program, func: FuncId) -> Result<(), DisasmError> {
    let f = program.function(func).ok_or(DisasmError::BadFuncId(func))?;
    let instrs =
        decode_instructions(&f.code).map_err(|error| DisasmError::Bytecode { func, error })?;

    // Writing into a `String` cannot fail.
    let _ = write!(out, "func {}", func.0);
    if let Some(name) = &f.name {
        let _ = write!(out, " <{name}>");
    }
    let _ = writeln!(out, " (args={}, vars={}):", f.num_args, f.num_vars);
    for di in &instrs {
        let _ = write!(out, "  {:4}: ", di.offset);
        let _ = write_instr(out, program, di);
        out.push('\n');
    }
    Ok(())
}

fn write_instr(out: &mut String, program: &Program, di: &DecodedInstr) -> fmt::Result {
    out.push_str(di.opcode.mnemonic());
    if let Some(rel) = di.instr.branch_rel() {
        return match di.branch_target() {
            Some(target) => write!(out, " {target}"),
            None => write!(out, " <{rel:+}>"),
        };
    }
    match di.instr {
        Instr::Bipush { imm } => write!(out, " {imm}"),
        Instr::Vload { slot } | Instr::Vstore { slot } => write!(out, " {slot}"),
        Instr::New { size } => write!(out, " {size}"),
        Instr::Aaddf { field } => write!(out, " {field}"),
        Instr::Newarray { elt_size } => write!(out, " {elt_size}"),
        Instr::Checktag { tag } | Instr::Hastag { tag } | Instr::Addtag { tag } => {
            write!(out, " {tag}")
        }
        Instr::Ildc { idx } => {
            write!(out, " {idx}")?;
            match program.int_const(idx) {
                Some(v) => write!(out, "    ; {v}"),
                None => write!(out, "    ; <bad index>"),
            }
        }
        Instr::Aldc { idx } => {
            write!(out, " {idx}")?;
            match program.string_at(usize::from(idx)) {
                Some(s) => write!(out, "    ; {:?}", lossy(s)),
                None => write!(out, "    ; <bad offset>"),
            }
        }
        Instr::Invokestatic { func } | Instr::AddrofStatic { func } => {
            write!(out, " {}", func.0)?;
            match (program.function(func), program.function_name(func)) {
                (Some(_), Some(name)) => write!(out, "    ; {name}"),
                (Some(_), None) => Ok(()),
                (None, _) => write!(out, "    ; <bad function>"),
            }
        }
        Instr::Invokenative { native } | Instr::AddrofNative { native } => {
            write!(out, " {}", native.0)?;
            match program.native(native) {
                Some(n) => write!(
                    out,
                    "    ; table={} args={}",
                    n.function_table_index, n.num_args
                ),
                None => write!(out, "    ; <bad native>"),
            }
        }
        _ => Ok(()),
    }
}
