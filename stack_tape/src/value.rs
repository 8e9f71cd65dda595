// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Runtime value model for `stack_tape`.
//!
//! A [`Value`] is either a 32-bit integer or a pointer. Pointers never carry raw addresses: they
//! name an [`Address`] (a heap object plus byte offset, an array header, a string-pool offset, or
//! a function/native descriptor) and an optional dynamic-type tag.

use core::fmt;

/// A function-pool index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u16);

/// A native-pool index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeId(pub u16);

/// A handle to an object in the VM heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjHandle(pub u32);

/// The referent of a non-null pointer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Address {
    /// A byte cell inside a heap block or an array payload.
    Cell {
        /// Owning heap object.
        obj: ObjHandle,
        /// Byte offset into the object's memory.
        offset: u32,
    },
    /// The header of an array object (what `NEWARRAY` pushes).
    Array(ObjHandle),
    /// A byte offset into the program's string pool.
    Str(u32),
    /// A function descriptor (`ADDROF_STATIC`).
    Func(FuncId),
    /// A native descriptor (`ADDROF_NATIVE`).
    Native(NativeId),
}

/// A pointer value.
///
/// Tagging wraps an address with a `u16` tag. Re-tagging replaces the tag; wrappers never nest.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Pointer {
    /// The null pointer.
    Null,
    /// A pointer to `addr`, optionally tagged.
    Ref {
        /// Referent.
        addr: Address,
        /// Dynamic-type tag, if this is a tagged pointer.
        tag: Option<u16>,
    },
}

impl Pointer {
    /// Returns a plain (untagged) pointer to `addr`.
    #[must_use]
    pub const fn to(addr: Address) -> Self {
        Self::Ref { addr, tag: None }
    }

    /// Returns `true` for the null pointer.
    #[must_use]
    pub const fn is_null(self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns this pointer wrapped with `tag`, replacing any existing tag.
    ///
    /// Tagging the null pointer yields the null pointer.
    #[must_use]
    pub const fn with_tag(self, tag: u16) -> Self {
        match self {
            Self::Null => Self::Null,
            Self::Ref { addr, .. } => Self::Ref {
                addr,
                tag: Some(tag),
            },
        }
    }

    /// Returns the plain pointer with any tag removed.
    #[must_use]
    pub const fn untagged(self) -> Self {
        match self {
            Self::Null => Self::Null,
            Self::Ref { addr, .. } => Self::Ref { addr, tag: None },
        }
    }

    /// Returns the tag, if any.
    #[must_use]
    pub const fn tag(self) -> Option<u16> {
        match self {
            Self::Null => None,
            Self::Ref { tag, .. } => tag,
        }
    }
}

/// The kind of a [`Value`], used in diagnostics.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// A 32-bit integer.
    Int,
    /// A pointer (including null).
    Ptr,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int => write!(f, "int"),
            Self::Ptr => write!(f, "pointer"),
        }
    }
}

/// A runtime value.
///
/// Equality is value-level for integers and reference identity (address, offset and tag) for
/// pointers; an integer never equals a pointer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    /// Signed 32-bit integer.
    Int(i32),
    /// Pointer.
    Ptr(Pointer),
}

impl Value {
    /// The null pointer value.
    pub const NULL: Self = Self::Ptr(Pointer::Null);

    /// Returns the value kind.
    #[must_use]
    pub const fn kind(self) -> ValueKind {
        match self {
            Self::Int(_) => ValueKind::Int,
            Self::Ptr(_) => ValueKind::Ptr,
        }
    }

    /// Returns the integer payload, if this is an integer.
    #[must_use]
    pub const fn as_int(self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(i),
            Self::Ptr(_) => None,
        }
    }

    /// Returns the pointer payload, if this is a pointer.
    #[must_use]
    pub const fn as_ptr(self) -> Option<Pointer> {
        match self {
            Self::Int(_) => None,
            Self::Ptr(p) => Some(p),
        }
    }

    /// Converts a boolean to the integer `1` or `0`.
    #[must_use]
    pub const fn from_bool(b: bool) -> Self {
        Self::Int(b as i32)
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::Int(0)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i)
    }
}

impl From<Pointer> for Value {
    fn from(p: Pointer) -> Self {
        Self::Ptr(p)
    }
}
