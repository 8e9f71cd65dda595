// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bytecode decoding for `stack_tape`.
//!
//! Every instruction is a one-byte opcode followed by zero, one or two big-endian immediate
//! bytes. Branch offsets are signed and relative to the first offset byte, i.e. `opcode_pc + 1`.

use alloc::vec::Vec;
use core::fmt;

use crate::format::{DecodeError, Reader};
use crate::opcode::Opcode;
use crate::value::{FuncId, NativeId};

/// A bytecode decoding error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BytecodeError {
    /// The byte stream was truncated inside an instruction.
    Decode(DecodeError),
    /// The opcode byte is not recognized.
    UnknownOpcode {
        /// The unrecognized opcode byte.
        opcode: u8,
    },
}

impl fmt::Display for BytecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "truncated instruction: {e}"),
            Self::UnknownOpcode { opcode } => write!(f, "invalid opcode 0x{opcode:02x}"),
        }
    }
}

impl core::error::Error for BytecodeError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Decode(e) => Some(e),
            Self::UnknownOpcode { .. } => None,
        }
    }
}

impl From<DecodeError> for BytecodeError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

/// A decoded instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs, reason = "variants mirror the opcode table")]
pub enum Instr {
    Nop,
    Pop,
    Dup,
    Swap,
    Return,

    Iadd,
    Isub,
    Imul,
    Idiv,
    Irem,
    Iand,
    Ior,
    Ixor,
    Ishl,
    Ishr,

    Bipush { imm: i8 },
    Ildc { idx: u16 },
    Aldc { idx: u16 },
    AconstNull,

    Vload { slot: u8 },
    Vstore { slot: u8 },

    Athrow,
    Assert,

    IfCmpeq { rel: i16 },
    IfCmpne { rel: i16 },
    IfIcmplt { rel: i16 },
    IfIcmpge { rel: i16 },
    IfIcmpgt { rel: i16 },
    IfIcmple { rel: i16 },
    Goto { rel: i16 },

    Invokestatic { func: FuncId },
    Invokenative { native: NativeId },

    New { size: u8 },
    Imload,
    Imstore,
    Amload,
    Amstore,
    Cmload,
    Cmstore,
    Aaddf { field: u8 },

    Newarray { elt_size: u8 },
    Arraylength,
    Aadds,

    Checktag { tag: u16 },
    Hastag { tag: u16 },
    Addtag { tag: u16 },
    AddrofStatic { func: FuncId },
    AddrofNative { native: NativeId },
    Invokedynamic,
}

/// A decoded instruction with its byte offset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DecodedInstr {
    /// Byte offset of the opcode within the function's code.
    pub offset: usize,
    /// Opcode.
    pub opcode: Opcode,
    /// The instruction with its immediates.
    pub instr: Instr,
    /// Encoded length in bytes (opcode plus immediates).
    pub len: usize,
}

impl DecodedInstr {
    /// Byte offset of the instruction that follows this one.
    #[must_use]
    pub fn next_pc(&self) -> usize {
        self.offset + self.len
    }

    /// Absolute branch target, if this is a branch and the target is not negative.
    #[must_use]
    pub fn branch_target(&self) -> Option<usize> {
        self.instr
            .branch_rel()
            .and_then(|rel| branch_target(self.offset, rel))
    }
}

/// Computes the absolute target of a branch at `opcode_pc` with relative offset `rel`.
///
/// The offset is measured from the first offset byte. Returns `None` if the target is negative.
#[must_use]
pub fn branch_target(opcode_pc: usize, rel: i16) -> Option<usize> {
    opcode_pc
        .checked_add(1)?
        .checked_add_signed(isize::from(rel))
}

impl Instr {
    /// Returns the opcode for this instruction.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Nop => Opcode::Nop,
            Self::Pop => Opcode::Pop,
            Self::Dup => Opcode::Dup,
            Self::Swap => Opcode::Swap,
            Self::Return => Opcode::Return,
            Self::Iadd => Opcode::Iadd,
            Self::Isub => Opcode::Isub,
            Self::Imul => Opcode::Imul,
            Self::Idiv => Opcode::Idiv,
            Self::Irem => Opcode::Irem,
            Self::Iand => Opcode::Iand,
            Self::Ior => Opcode::Ior,
            Self::Ixor => Opcode::Ixor,
            Self::Ishl => Opcode::Ishl,
            Self::Ishr => Opcode::Ishr,
            Self::Bipush { .. } => Opcode::Bipush,
            Self::Ildc { .. } => Opcode::Ildc,
            Self::Aldc { .. } => Opcode::Aldc,
            Self::AconstNull => Opcode::AconstNull,
            Self::Vload { .. } => Opcode::Vload,
            Self::Vstore { .. } => Opcode::Vstore,
            Self::Athrow => Opcode::Athrow,
            Self::Assert => Opcode::Assert,
            Self::IfCmpeq { .. } => Opcode::IfCmpeq,
            Self::IfCmpne { .. } => Opcode::IfCmpne,
            Self::IfIcmplt { .. } => Opcode::IfIcmplt,
            Self::IfIcmpge { .. } => Opcode::IfIcmpge,
            Self::IfIcmpgt { .. } => Opcode::IfIcmpgt,
            Self::IfIcmple { .. } => Opcode::IfIcmple,
            Self::Goto { .. } => Opcode::Goto,
            Self::Invokestatic { .. } => Opcode::Invokestatic,
            Self::Invokenative { .. } => Opcode::Invokenative,
            Self::New { .. } => Opcode::New,
            Self::Imload => Opcode::Imload,
            Self::Imstore => Opcode::Imstore,
            Self::Amload => Opcode::Amload,
            Self::Amstore => Opcode::Amstore,
            Self::Cmload => Opcode::Cmload,
            Self::Cmstore => Opcode::Cmstore,
            Self::Aaddf { .. } => Opcode::Aaddf,
            Self::Newarray { .. } => Opcode::Newarray,
            Self::Arraylength => Opcode::Arraylength,
            Self::Aadds => Opcode::Aadds,
            Self::Checktag { .. } => Opcode::Checktag,
            Self::Hastag { .. } => Opcode::Hastag,
            Self::Addtag { .. } => Opcode::Addtag,
            Self::AddrofStatic { .. } => Opcode::AddrofStatic,
            Self::AddrofNative { .. } => Opcode::AddrofNative,
            Self::Invokedynamic => Opcode::Invokedynamic,
        }
    }

    /// Returns the relative branch offset for branch instructions.
    #[must_use]
    pub const fn branch_rel(&self) -> Option<i16> {
        match self {
            Self::IfCmpeq { rel }
            | Self::IfCmpne { rel }
            | Self::IfIcmplt { rel }
            | Self::IfIcmpge { rel }
            | Self::IfIcmpgt { rel }
            | Self::IfIcmple { rel }
            | Self::Goto { rel } => Some(*rel),
            _ => None,
        }
    }

    /// Appends the encoding of this instruction to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.opcode().byte());
        match *self {
            Self::Bipush { imm } => out.extend_from_slice(&imm.to_be_bytes()),
            Self::Vload { slot } | Self::Vstore { slot } => out.push(slot),
            Self::New { size } => out.push(size),
            Self::Aaddf { field } => out.push(field),
            Self::Newarray { elt_size } => out.push(elt_size),
            Self::Ildc { idx } | Self::Aldc { idx } => out.extend_from_slice(&idx.to_be_bytes()),
            Self::Checktag { tag } | Self::Hastag { tag } | Self::Addtag { tag } => {
                out.extend_from_slice(&tag.to_be_bytes());
            }
            Self::Invokestatic { func } | Self::AddrofStatic { func } => {
                out.extend_from_slice(&func.0.to_be_bytes());
            }
            Self::Invokenative { native } | Self::AddrofNative { native } => {
                out.extend_from_slice(&native.0.to_be_bytes());
            }
            Self::IfCmpeq { rel }
            | Self::IfCmpne { rel }
            | Self::IfIcmplt { rel }
            | Self::IfIcmpge { rel }
            | Self::IfIcmpgt { rel }
            | Self::IfIcmple { rel }
            | Self::Goto { rel } => out.extend_from_slice(&rel.to_be_bytes()),
            _ => {}
        }
    }
}

/// Decodes the instruction whose opcode byte is at `pc`.
pub fn decode_at(code: &[u8], pc: usize) -> Result<DecodedInstr, BytecodeError> {
    let mut r = Reader::at(code, pc);
    let byte = r.read_u8()?;
    let opcode = Opcode::from_byte(byte).ok_or(BytecodeError::UnknownOpcode { opcode: byte })?;
    let instr = match opcode {
        Opcode::Nop => Instr::Nop,
        Opcode::Pop => Instr::Pop,
        Opcode::Dup => Instr::Dup,
        Opcode::Swap => Instr::Swap,
        Opcode::Return => Instr::Return,
        Opcode::Iadd => Instr::Iadd,
        Opcode::Isub => Instr::Isub,
        Opcode::Imul => Instr::Imul,
        Opcode::Idiv => Instr::Idiv,
        Opcode::Irem => Instr::Irem,
        Opcode::Iand => Instr::Iand,
        Opcode::Ior => Instr::Ior,
        Opcode::Ixor => Instr::Ixor,
        Opcode::Ishl => Instr::Ishl,
        Opcode::Ishr => Instr::Ishr,
        Opcode::Bipush => Instr::Bipush { imm: r.read_i8()? },
        Opcode::Ildc => Instr::Ildc { idx: r.read_u16()? },
        Opcode::Aldc => Instr::Aldc { idx: r.read_u16()? },
        Opcode::AconstNull => Instr::AconstNull,
        Opcode::Vload => Instr::Vload { slot: r.read_u8()? },
        Opcode::Vstore => Instr::Vstore { slot: r.read_u8()? },
        Opcode::Athrow => Instr::Athrow,
        Opcode::Assert => Instr::Assert,
        Opcode::IfCmpeq => Instr::IfCmpeq { rel: r.read_i16()? },
        Opcode::IfCmpne => Instr::IfCmpne { rel: r.read_i16()? },
        Opcode::IfIcmplt => Instr::IfIcmplt { rel: r.read_i16()? },
        Opcode::IfIcmpge => Instr::IfIcmpge { rel: r.read_i16()? },
        Opcode::IfIcmpgt => Instr::IfIcmpgt { rel: r.read_i16()? },
        Opcode::IfIcmple => Instr::IfIcmple { rel: r.read_i16()? },
        Opcode::Goto => Instr::Goto { rel: r.read_i16()? },
        Opcode::Invokestatic => Instr::Invokestatic {
            func: FuncId(r.read_u16()?),
        },
        Opcode::Invokenative => Instr::Invokenative {
            native: NativeId(r.read_u16()?),
        },
        Opcode::New => Instr::New { size: r.read_u8()? },
        Opcode::Imload => Instr::Imload,
        Opcode::Imstore => Instr::Imstore,
        Opcode::Amload => Instr::Amload,
        Opcode::Amstore => Instr::Amstore,
        Opcode::Cmload => Instr::Cmload,
        Opcode::Cmstore => Instr::Cmstore,
        Opcode::Aaddf => Instr::Aaddf {
            field: r.read_u8()?,
        },
        Opcode::Newarray => Instr::Newarray {
            elt_size: r.read_u8()?,
        },
        Opcode::Arraylength => Instr::Arraylength,
        Opcode::Aadds => Instr::Aadds,
        Opcode::Checktag => Instr::Checktag { tag: r.read_u16()? },
        Opcode::Hastag => Instr::Hastag { tag: r.read_u16()? },
        Opcode::Addtag => Instr::Addtag { tag: r.read_u16()? },
        Opcode::AddrofStatic => Instr::AddrofStatic {
            func: FuncId(r.read_u16()?),
        },
        Opcode::AddrofNative => Instr::AddrofNative {
            native: NativeId(r.read_u16()?),
        },
        Opcode::Invokedynamic => Instr::Invokedynamic,
    };
    Ok(DecodedInstr {
        offset: pc,
        opcode,
        instr,
        len: r.offset() - pc,
    })
}

/// Decodes a whole function body into instructions in stream order.
pub fn decode_instructions(code: &[u8]) -> Result<Vec<DecodedInstr>, BytecodeError> {
    let mut out = Vec::new();
    let mut pc = 0;
    while pc < code.len() {
        let di = decode_at(code, pc)?;
        pc = di.next_pc();
        out.push(di);
    }
    Ok(out)
}
