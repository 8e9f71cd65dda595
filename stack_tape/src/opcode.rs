// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Opcode byte values.
//!
//! These match the C0VM encoding bit for bit, so programs produced by existing C0 toolchains run
//! unchanged.

macro_rules! opcodes {
    ($($(#[$doc:meta])* $name:ident = $byte:literal, $mnemonic:literal, $width:literal;)*) => {
        /// An instruction opcode.
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($(#[$doc])* $name = $byte,)*
        }

        impl Opcode {
            /// Every opcode, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$name,)*];

            /// Parses an opcode from its byte value.
            #[must_use]
            pub const fn from_byte(b: u8) -> Option<Self> {
                match b {
                    $($byte => Some(Self::$name),)*
                    _ => None,
                }
            }

            /// Returns the lowercase assembly mnemonic.
            #[must_use]
            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $(Self::$name => $mnemonic,)*
                }
            }

            /// Returns the number of immediate bytes following the opcode byte.
            #[must_use]
            pub const fn operand_width(self) -> usize {
                match self {
                    $(Self::$name => $width,)*
                }
            }
        }
    };
}

opcodes! {
    /// Do nothing.
    Nop = 0x00, "nop", 0;
    /// Push the null pointer.
    AconstNull = 0x01, "aconst_null", 0;
    /// Push a sign-extended byte.
    Bipush = 0x10, "bipush", 1;
    /// Push an integer constant.
    Ildc = 0x13, "ildc", 2;
    /// Push a string constant.
    Aldc = 0x14, "aldc", 2;
    /// Push a local variable.
    Vload = 0x15, "vload", 1;
    /// Push a function descriptor pointer.
    AddrofStatic = 0x16, "addrof_static", 2;
    /// Push a native descriptor pointer.
    AddrofNative = 0x17, "addrof_native", 2;
    /// Load an integer cell.
    Imload = 0x2E, "imload", 0;
    /// Load a pointer cell.
    Amload = 0x2F, "amload", 0;
    /// Load a byte cell.
    Cmload = 0x34, "cmload", 0;
    /// Pop into a local variable.
    Vstore = 0x36, "vstore", 1;
    /// Store an integer cell.
    Imstore = 0x4E, "imstore", 0;
    /// Store a pointer cell.
    Amstore = 0x4F, "amstore", 0;
    /// Store a byte cell (low 7 bits).
    Cmstore = 0x55, "cmstore", 0;
    /// Discard the top value.
    Pop = 0x57, "pop", 0;
    /// Duplicate the top value.
    Dup = 0x59, "dup", 0;
    /// Exchange the top two values.
    Swap = 0x5F, "swap", 0;
    /// Integer addition.
    Iadd = 0x60, "iadd", 0;
    /// Add a field offset to a pointer.
    Aaddf = 0x62, "aaddf", 1;
    /// Compute the address of an array element.
    Aadds = 0x63, "aadds", 0;
    /// Integer subtraction.
    Isub = 0x64, "isub", 0;
    /// Integer multiplication.
    Imul = 0x68, "imul", 0;
    /// Integer division.
    Idiv = 0x6C, "idiv", 0;
    /// Integer remainder.
    Irem = 0x70, "irem", 0;
    /// Shift left.
    Ishl = 0x78, "ishl", 0;
    /// Arithmetic shift right.
    Ishr = 0x7A, "ishr", 0;
    /// Bitwise and.
    Iand = 0x7E, "iand", 0;
    /// Bitwise or.
    Ior = 0x80, "ior", 0;
    /// Bitwise exclusive or.
    Ixor = 0x82, "ixor", 0;
    /// Branch if equal.
    IfCmpeq = 0x9F, "if_cmpeq", 2;
    /// Branch if not equal.
    IfCmpne = 0xA0, "if_cmpne", 2;
    /// Branch if less than.
    IfIcmplt = 0xA1, "if_icmplt", 2;
    /// Branch if greater or equal.
    IfIcmpge = 0xA2, "if_icmpge", 2;
    /// Branch if greater than.
    IfIcmpgt = 0xA3, "if_icmpgt", 2;
    /// Branch if less or equal.
    IfIcmple = 0xA4, "if_icmple", 2;
    /// Unconditional branch.
    Goto = 0xA7, "goto", 2;
    /// Return from the current function.
    Return = 0xB0, "return", 0;
    /// Call through a descriptor pointer.
    Invokedynamic = 0xB6, "invokedynamic", 0;
    /// Call a native function.
    Invokenative = 0xB7, "invokenative", 2;
    /// Call an interpreted function.
    Invokestatic = 0xB8, "invokestatic", 2;
    /// Allocate a zeroed block.
    New = 0xBB, "new", 1;
    /// Allocate a zeroed array.
    Newarray = 0xBC, "newarray", 1;
    /// Push an array's element count.
    Arraylength = 0xBE, "arraylength", 0;
    /// Raise a user error.
    Athrow = 0xBF, "athrow", 0;
    /// Check a pointer tag and untag it.
    Checktag = 0xC0, "checktag", 2;
    /// Test a pointer tag.
    Hastag = 0xC1, "hastag", 2;
    /// Tag a pointer.
    Addtag = 0xC2, "addtag", 2;
    /// Assert a condition.
    Assert = 0xCF, "assert", 0;
}

impl Opcode {
    /// Returns the opcode byte value.
    #[must_use]
    pub const fn byte(self) -> u8 {
        self as u8
    }

    /// Returns `true` if control never falls through to the next instruction.
    #[must_use]
    pub const fn is_terminator(self) -> bool {
        matches!(self, Self::Return | Self::Goto | Self::Athrow)
    }

    /// Returns `true` for instructions carrying a relative branch offset.
    #[must_use]
    pub const fn is_branch(self) -> bool {
        matches!(
            self,
            Self::IfCmpeq
                | Self::IfCmpne
                | Self::IfIcmplt
                | Self::IfIcmpge
                | Self::IfIcmpgt
                | Self::IfIcmple
                | Self::Goto
        )
    }
}
