//! Coordinate arithmetic for a fixed-size block volume.
//!
//! Elements are laid out column-major: all `size_y` elements of the vertical
//! column at `(x, z)` are contiguous, and columns are ordered x-fastest. A
//! column is the unit of compaction, so its index doubles as the row key.

use serde::{Deserialize, Serialize};

use crate::error::BlockDataError;

/// Largest accepted volume. Every width's packed size in bits, and every
/// payload length derived from it, stays below `isize::MAX`.
pub const MAX_VOLUME: usize = isize::MAX as usize / 32;

/// Dimensions of one block array. Immutable for the life of an instance and
/// preserved across deflation and inflation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "[usize; 3]", into = "[usize; 3]")]
pub struct Extent {
    size_x: usize,
    size_y: usize,
    size_z: usize,
}

impl Extent {
    /// Creates an extent.
    ///
    /// # Panics
    ///
    /// Panics if any dimension is zero or the volume exceeds [`MAX_VOLUME`].
    pub fn new(size_x: usize, size_y: usize, size_z: usize) -> Self {
        match Self::try_new(size_x, size_y, size_z) {
            Ok(extent) => extent,
            Err(err) => panic!("{err}"),
        }
    }

    /// Creates an extent from untrusted input (e.g. a persisted header).
    pub fn try_new(size_x: usize, size_y: usize, size_z: usize) -> Result<Self, BlockDataError> {
        let valid = size_x > 0
            && size_y > 0
            && size_z > 0
            && size_x
                .checked_mul(size_y)
                .and_then(|xy| xy.checked_mul(size_z))
                .is_some_and(|volume| volume <= MAX_VOLUME);
        if !valid {
            return Err(BlockDataError::InvalidExtent {
                size_x,
                size_y,
                size_z,
            });
        }
        Ok(Self {
            size_x,
            size_y,
            size_z,
        })
    }

    pub fn size_x(&self) -> usize {
        self.size_x
    }

    pub fn size_y(&self) -> usize {
        self.size_y
    }

    pub fn size_z(&self) -> usize {
        self.size_z
    }

    /// Total number of elements.
    pub fn volume(&self) -> usize {
        self.size_x * self.size_y * self.size_z
    }

    /// Number of vertical columns (one per X-Z position).
    pub fn size_xz(&self) -> usize {
        self.size_x * self.size_z
    }

    /// Number of contiguous elements per column.
    pub fn row_size(&self) -> usize {
        self.size_y
    }

    /// Returns `true` if `(x, y, z)` lies inside the extent.
    pub fn contains(&self, x: usize, y: usize, z: usize) -> bool {
        x < self.size_x && y < self.size_y && z < self.size_z
    }

    /// Index of the column containing `(x, _, z)`.
    #[inline]
    pub fn row_key(&self, x: usize, z: usize) -> usize {
        debug_assert!(
            x < self.size_x && z < self.size_z,
            "column ({x}, {z}) outside {self:?}"
        );
        x + z * self.size_x
    }

    /// Linear element offset of `(x, y, z)`.
    ///
    /// Coordinates are only checked in debug builds. In release builds an
    /// out-of-range coordinate aliases another element or indexes past the
    /// buffer (which then panics on the slice access).
    #[inline]
    pub fn linear_offset(&self, x: usize, y: usize, z: usize) -> usize {
        debug_assert!(
            self.contains(x, y, z),
            "({x}, {y}, {z}) outside {self:?}"
        );
        (x + z * self.size_x) * self.size_y + y
    }

    /// Inverse of [`row_key`](Self::row_key).
    pub fn column_coords(&self, row_key: usize) -> (usize, usize) {
        (row_key % self.size_x, row_key / self.size_x)
    }
}

impl TryFrom<[usize; 3]> for Extent {
    type Error = BlockDataError;

    fn try_from([size_x, size_y, size_z]: [usize; 3]) -> Result<Self, Self::Error> {
        Self::try_new(size_x, size_y, size_z)
    }
}

impl From<Extent> for [usize; 3] {
    fn from(extent: Extent) -> Self {
        [extent.size_x, extent.size_y, extent.size_z]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_offset_is_bijection() {
        let extent = Extent::new(3, 5, 4);
        let mut seen = vec![false; extent.volume()];
        for z in 0..4 {
            for y in 0..5 {
                for x in 0..3 {
                    let offset = extent.linear_offset(x, y, z);
                    assert!(!seen[offset], "offset {offset} produced twice");
                    seen[offset] = true;
                }
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_columns_are_contiguous() {
        let extent = Extent::new(16, 256, 16);
        let base = extent.linear_offset(7, 0, 9);
        for y in 0..256 {
            assert_eq!(extent.linear_offset(7, y, 9), base + y);
        }
        assert_eq!(base, extent.row_key(7, 9) * extent.row_size());
    }

    #[test]
    fn test_row_key_roundtrip() {
        let extent = Extent::new(5, 2, 7);
        for z in 0..7 {
            for x in 0..5 {
                let key = extent.row_key(x, z);
                assert!(key < extent.size_xz());
                assert_eq!(extent.column_coords(key), (x, z));
            }
        }
    }

    #[test]
    fn test_try_new_rejects_zero_dimension() {
        assert!(matches!(
            Extent::try_new(16, 0, 16),
            Err(BlockDataError::InvalidExtent { size_y: 0, .. })
        ));
        assert!(Extent::try_new(usize::MAX, 2, 2).is_err());
        assert!(Extent::try_new(1, 1, 1).is_ok());
    }

    #[test]
    fn test_try_new_rejects_volume_too_large_to_pack() {
        // Fits usize, but 16 bits per element would not.
        let side = 1 << 20;
        assert!(matches!(
            Extent::try_new(side, side, side),
            Err(BlockDataError::InvalidExtent { .. })
        ));
        assert!(Extent::try_new(MAX_VOLUME, 1, 1).is_ok());
        assert!(Extent::try_new(MAX_VOLUME + 1, 1, 1).is_err());
    }

    #[test]
    fn test_array_conversion_validates() {
        let extent = Extent::try_from([16, 256, 16]).unwrap();
        assert_eq!(<[usize; 3]>::from(extent), [16, 256, 16]);
        assert!(Extent::try_from([4, 4, 0]).is_err());
    }

    #[test]
    #[should_panic]
    fn test_new_panics_on_zero_dimension() {
        let _ = Extent::new(0, 1, 1);
    }
}
