//! The capability set every block storage backend implements.

use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::deflate::Deflator;
use crate::extent::Extent;

/// Identifies a concrete backend in persisted data.
///
/// The discriminant is the byte written to disk; never renumber existing tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TypeTag {
    Dense4Bit = 1,
    Dense8Bit = 2,
    Dense16Bit = 3,
    Sparse4Bit = 4,
    Sparse8Bit = 5,
    Sparse16Bit = 6,
}

impl TypeTag {
    /// Every known tag, dense first.
    pub const ALL: [TypeTag; 6] = [
        TypeTag::Dense4Bit,
        TypeTag::Dense8Bit,
        TypeTag::Dense16Bit,
        TypeTag::Sparse4Bit,
        TypeTag::Sparse8Bit,
        TypeTag::Sparse16Bit,
    ];

    /// Parses a stored tag byte. Returns `None` for bytes naming no backend.
    pub fn from_u8(raw: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| *tag as u8 == raw)
    }

    /// The byte written to disk for this tag.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Element width of the backend.
    pub fn bit_width(self) -> u8 {
        match self {
            TypeTag::Dense4Bit | TypeTag::Sparse4Bit => 4,
            TypeTag::Dense8Bit | TypeTag::Sparse8Bit => 8,
            TypeTag::Dense16Bit | TypeTag::Sparse16Bit => 16,
        }
    }

    pub fn is_sparse(self) -> bool {
        matches!(
            self,
            TypeTag::Sparse4Bit | TypeTag::Sparse8Bit | TypeTag::Sparse16Bit
        )
    }

    /// The dense backend for a given element width, if one exists.
    pub fn dense_for_bits(bits: u8) -> Option<Self> {
        match bits {
            4 => Some(TypeTag::Dense4Bit),
            8 => Some(TypeTag::Dense8Bit),
            16 => Some(TypeTag::Dense16Bit),
            _ => None,
        }
    }
}

/// A fixed-extent 3D array holding one small integer per voxel.
///
/// Coordinates must lie inside [`extent`](Self::extent) and values inside the
/// backend's width range. Both are caller contracts: they are checked with
/// debug assertions only, and release builds may alias another cell, panic on
/// indexing, or truncate the value to the backend's width.
///
/// All operations take `&self`. A single coordinate's `get`, `set` and
/// `compare_and_set` are atomic with respect to each other; nothing is atomic
/// across coordinates. Deflation must not overlap mutation of the instance
/// being replaced (see [`BlockDataSlot`](crate::slot::BlockDataSlot)).
pub trait BlockArray: Debug + Send + Sync {
    /// Tag used to pick a serialization handler.
    fn type_tag(&self) -> TypeTag;

    fn extent(&self) -> Extent;

    /// Bits per element; fixed per concrete type.
    fn bit_width(&self) -> u8 {
        self.type_tag().bit_width()
    }

    /// Current element at `(x, y, z)`.
    fn get(&self, x: usize, y: usize, z: usize) -> i32;

    /// Stores `value` at `(x, y, z)` and returns the previous element.
    fn set(&self, x: usize, y: usize, z: usize, value: i32) -> i32;

    /// Stores `value` only if the current element equals `expected`.
    ///
    /// Returns whether the store happened.
    fn compare_and_set(&self, x: usize, y: usize, z: usize, value: i32, expected: i32) -> bool;

    /// Offers this array to `deflator`, which returns a more compact
    /// equivalent or `None` when it finds no improvement.
    fn deflate(&self, deflator: &dyn Deflator) -> Option<Box<dyn BlockArray>>;

    /// Exact length of the serialized payload.
    fn encoded_len(&self) -> usize;

    /// Appends the serialized payload (exactly `encoded_len` bytes) to `out`.
    fn write_payload(&self, out: &mut Vec<u8>);

    /// Approximate heap memory held by the array.
    fn storage_bytes(&self) -> usize;
}

/// Deflates `array`, returning the same `Arc` when the deflator declines.
pub fn deflate_array(array: Arc<dyn BlockArray>, deflator: &dyn Deflator) -> Arc<dyn BlockArray> {
    match array.deflate(deflator) {
        Some(deflated) => {
            debug_assert_eq!(deflated.extent(), array.extent());
            Arc::from(deflated)
        }
        None => array,
    }
}

/// Returns `true` if both arrays share an extent and agree at every coordinate.
pub fn contents_equal(a: &dyn BlockArray, b: &dyn BlockArray) -> bool {
    let extent = a.extent();
    if extent != b.extent() {
        return false;
    }
    (0..extent.size_z()).all(|z| {
        (0..extent.size_x()).all(|x| (0..extent.size_y()).all(|y| a.get(x, y, z) == b.get(x, y, z)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_bytes_roundtrip() {
        for tag in TypeTag::ALL {
            assert_eq!(TypeTag::from_u8(tag.as_u8()), Some(tag));
        }
        assert_eq!(TypeTag::from_u8(0), None);
        assert_eq!(TypeTag::from_u8(7), None);
    }

    #[test]
    fn test_tag_widths() {
        assert_eq!(TypeTag::Sparse16Bit.bit_width(), 16);
        assert!(TypeTag::Sparse4Bit.is_sparse());
        assert!(!TypeTag::Dense4Bit.is_sparse());
        assert_eq!(TypeTag::dense_for_bits(8), Some(TypeTag::Dense8Bit));
        assert_eq!(TypeTag::dense_for_bits(2), None);
    }
}
