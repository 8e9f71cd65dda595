// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Heap arena for `stack_tape`.
//!
//! Every allocation (`NEW`, `NEWARRAY`, strings produced by natives) lives in a `Vec`-backed arena
//! owned by the VM and is addressed by an [`ObjHandle`]. Nothing is ever freed.
//!
//! Object memory is raw bytes. Pointers cannot be stored as bytes, so pointer cells live in a
//! side table keyed by byte offset; the bytes underneath a pointer cell stay zero. Loads validate
//! the requested view: reading an integer that overlaps a pointer cell, or reading a pointer
//! where only non-zero integer bytes were written, is an error.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::value::{ObjHandle, Pointer};

/// Size in bytes of an integer cell.
pub const INT_SIZE: u32 = 4;

/// Size in bytes of a pointer cell.
pub const PTR_SIZE: u32 = 8;

/// A heap access error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeapError {
    /// Handle was out of bounds.
    BadHandle,
    /// Access of `width` bytes at `offset` falls outside an object of `size` bytes.
    OutOfBounds {
        /// Byte offset of the access.
        offset: u32,
        /// Width of the access in bytes.
        width: u32,
        /// Size of the object's memory in bytes.
        size: u32,
    },
    /// An array operation was applied to a plain block.
    NotArray,
    /// An integer or byte load overlapped a stored pointer.
    PointerCell {
        /// Byte offset of the access.
        offset: u32,
    },
    /// A pointer load found non-zero bytes that never held a pointer.
    NotPointerCell {
        /// Byte offset of the access.
        offset: u32,
    },
    /// The requested allocation does not fit in the address space of one object.
    TooLarge,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadHandle => write!(f, "heap handle out of bounds"),
            Self::OutOfBounds {
                offset,
                width,
                size,
            } => write!(
                f,
                "access of {width} bytes at offset {offset} outside object of {size} bytes"
            ),
            Self::NotArray => write!(f, "object is not an array"),
            Self::PointerCell { offset } => {
                write!(f, "offset {offset} holds a pointer, not integer data")
            }
            Self::NotPointerCell { offset } => {
                write!(f, "offset {offset} holds integer data, not a pointer")
            }
            Self::TooLarge => write!(f, "allocation too large"),
        }
    }
}

impl core::error::Error for HeapError {}

/// The shape of a heap object.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    /// An untyped block from `NEW` (or a native-allocated string).
    Block,
    /// An array object from `NEWARRAY`.
    Array {
        /// Element count.
        count: u32,
        /// Element size in bytes.
        elt_size: u8,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct HeapObject {
    kind: ObjectKind,
    bytes: Vec<u8>,
    ptrs: BTreeMap<u32, Pointer>,
}

impl HeapObject {
    fn zeroed(kind: ObjectKind, size: usize) -> Self {
        Self {
            kind,
            bytes: vec![0; size],
            ptrs: BTreeMap::new(),
        }
    }

    fn size(&self) -> u32 {
        u32::try_from(self.bytes.len()).unwrap_or(u32::MAX)
    }

    fn range(&self, offset: u32, width: u32) -> Result<core::ops::Range<usize>, HeapError> {
        let oob = || HeapError::OutOfBounds {
            offset,
            width,
            size: self.size(),
        };
        let end = offset.checked_add(width).ok_or_else(oob)?;
        if end > self.size() {
            return Err(oob());
        }
        Ok(offset as usize..end as usize)
    }

    /// Returns `true` if a pointer cell overlaps `[offset, offset + width)`.
    fn overlaps_ptr(&self, offset: u32, width: u32) -> bool {
        let lo = offset.saturating_sub(PTR_SIZE - 1);
        let hi = offset.saturating_add(width);
        self.ptrs.range(lo..hi).next().is_some()
    }

    fn clear_ptrs(&mut self, offset: u32, width: u32) {
        let lo = offset.saturating_sub(PTR_SIZE - 1);
        let hi = offset.saturating_add(width);
        let doomed: Vec<u32> = self.ptrs.range(lo..hi).map(|(k, _)| *k).collect();
        for k in doomed {
            self.ptrs.remove(&k);
        }
    }
}

/// The VM heap.
#[derive(Clone, Debug, Default)]
pub struct Heap {
    objects: Vec<HeapObject>,
}

impl Heap {
    /// Creates an empty heap.
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
        }
    }

    /// Returns the number of live objects (which is every object ever allocated).
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns `true` if nothing has been allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Allocates a zero-initialized block of `size` bytes.
    pub fn alloc_block(&mut self, size: u32) -> ObjHandle {
        self.push(HeapObject::zeroed(ObjectKind::Block, size as usize))
    }

    /// Allocates a block holding `bytes` followed by a NUL terminator.
    pub fn alloc_c_string(&mut self, bytes: &[u8]) -> Result<ObjHandle, HeapError> {
        let len = bytes.len().checked_add(1).ok_or(HeapError::TooLarge)?;
        u32::try_from(len).map_err(|_| HeapError::TooLarge)?;
        let mut obj = HeapObject::zeroed(ObjectKind::Block, len);
        obj.bytes[..bytes.len()].copy_from_slice(bytes);
        Ok(self.push(obj))
    }

    /// Allocates a zero-initialized array of `count` elements of `elt_size` bytes each.
    pub fn alloc_array(&mut self, count: u32, elt_size: u8) -> Result<ObjHandle, HeapError> {
        let size = count
            .checked_mul(u32::from(elt_size))
            .ok_or(HeapError::TooLarge)?;
        Ok(self.push(HeapObject::zeroed(
            ObjectKind::Array { count, elt_size },
            size as usize,
        )))
    }

    /// Returns the shape of `obj`.
    pub fn kind(&self, obj: ObjHandle) -> Result<ObjectKind, HeapError> {
        Ok(self.object(obj)?.kind)
    }

    /// Returns the size in bytes of `obj`'s memory.
    pub fn size(&self, obj: ObjHandle) -> Result<u32, HeapError> {
        Ok(self.object(obj)?.size())
    }

    /// Returns the element count of array `obj`.
    pub fn array_len(&self, obj: ObjHandle) -> Result<u32, HeapError> {
        match self.object(obj)?.kind {
            ObjectKind::Array { count, .. } => Ok(count),
            ObjectKind::Block => Err(HeapError::NotArray),
        }
    }

    /// Returns the payload byte offset of element `index` of array `obj`, or `None` if the index
    /// is out of bounds.
    pub fn array_elem_offset(&self, obj: ObjHandle, index: u32) -> Result<Option<u32>, HeapError> {
        match self.object(obj)?.kind {
            ObjectKind::Array { count, elt_size } => {
                if index >= count {
                    return Ok(None);
                }
                // `count * elt_size` was checked at allocation time.
                Ok(Some(index * u32::from(elt_size)))
            }
            ObjectKind::Block => Err(HeapError::NotArray),
        }
    }

    /// Loads a little-endian integer cell.
    pub fn load_int(&self, obj: ObjHandle, offset: u32) -> Result<i32, HeapError> {
        let o = self.object(obj)?;
        let r = o.range(offset, INT_SIZE)?;
        if o.overlaps_ptr(offset, INT_SIZE) {
            return Err(HeapError::PointerCell { offset });
        }
        let mut buf = [0_u8; 4];
        buf.copy_from_slice(&o.bytes[r]);
        Ok(i32::from_le_bytes(buf))
    }

    /// Stores a little-endian integer cell, replacing any overlapping pointer cells.
    pub fn store_int(&mut self, obj: ObjHandle, offset: u32, value: i32) -> Result<(), HeapError> {
        let o = self.object_mut(obj)?;
        let r = o.range(offset, INT_SIZE)?;
        o.clear_ptrs(offset, INT_SIZE);
        o.bytes[r].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Loads a byte cell.
    pub fn load_byte(&self, obj: ObjHandle, offset: u32) -> Result<u8, HeapError> {
        let o = self.object(obj)?;
        let r = o.range(offset, 1)?;
        if o.overlaps_ptr(offset, 1) {
            return Err(HeapError::PointerCell { offset });
        }
        Ok(o.bytes[r.start])
    }

    /// Stores a byte cell, replacing any overlapping pointer cells.
    pub fn store_byte(&mut self, obj: ObjHandle, offset: u32, value: u8) -> Result<(), HeapError> {
        let o = self.object_mut(obj)?;
        let r = o.range(offset, 1)?;
        o.clear_ptrs(offset, 1);
        o.bytes[r.start] = value;
        Ok(())
    }

    /// Loads a pointer cell. Zeroed memory reads as [`Pointer::Null`].
    pub fn load_ptr(&self, obj: ObjHandle, offset: u32) -> Result<Pointer, HeapError> {
        let o = self.object(obj)?;
        let r = o.range(offset, PTR_SIZE)?;
        if let Some(p) = o.ptrs.get(&offset) {
            return Ok(*p);
        }
        if o.overlaps_ptr(offset, PTR_SIZE) {
            return Err(HeapError::PointerCell { offset });
        }
        if o.bytes[r].iter().all(|b| *b == 0) {
            Ok(Pointer::Null)
        } else {
            Err(HeapError::NotPointerCell { offset })
        }
    }

    /// Stores a pointer cell, replacing anything it overlaps.
    pub fn store_ptr(
        &mut self,
        obj: ObjHandle,
        offset: u32,
        value: Pointer,
    ) -> Result<(), HeapError> {
        let o = self.object_mut(obj)?;
        let r = o.range(offset, PTR_SIZE)?;
        o.clear_ptrs(offset, PTR_SIZE);
        o.bytes[r].fill(0);
        if !value.is_null() {
            o.ptrs.insert(offset, value);
        }
        Ok(())
    }

    /// Reads the NUL-terminated byte string starting at `offset`.
    ///
    /// A string that runs to the end of the object without a terminator is returned as-is.
    pub fn c_str(&self, obj: ObjHandle, offset: u32) -> Result<&[u8], HeapError> {
        let o = self.object(obj)?;
        let tail = o
            .bytes
            .get(offset as usize..)
            .ok_or(HeapError::OutOfBounds {
                offset,
                width: 1,
                size: o.size(),
            })?;
        let end = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
        Ok(&tail[..end])
    }

    /// Returns a debug view of `obj` for diagnostics.
    pub fn debug_object(&self, obj: ObjHandle) -> Result<String, HeapError> {
        let o = self.object(obj)?;
        Ok(match o.kind {
            ObjectKind::Block => format!("Block(size={}, ptrs={})", o.size(), o.ptrs.len()),
            ObjectKind::Array { count, elt_size } => {
                format!("Array(count={count}, elt_size={elt_size})")
            }
        })
    }

    fn push(&mut self, obj: HeapObject) -> ObjHandle {
        let idx = u32::try_from(self.objects.len()).unwrap_or(u32::MAX);
        self.objects.push(obj);
        ObjHandle(idx)
    }

    fn object(&self, obj: ObjHandle) -> Result<&HeapObject, HeapError> {
        self.objects.get(obj.0 as usize).ok_or(HeapError::BadHandle)
    }

    fn object_mut(&mut self, obj: ObjHandle) -> Result<&mut HeapObject, HeapError> {
        self.objects
            .get_mut(obj.0 as usize)
            .ok_or(HeapError::BadHandle)
    }
}
