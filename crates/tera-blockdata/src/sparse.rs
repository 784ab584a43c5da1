//! Column-compacted block arrays produced by deflation.
//!
//! Every vertical column is either uniform (one stored element stands for all
//! `size_y` cells) or expanded (a full packed column). Uniform values are
//! written once at construction and never change; a write that breaks a
//! uniform column expands just that column, seeded with the uniform value.
//! Expansion goes through a per-column [`OnceLock`], so concurrent writers
//! racing to expand the same column agree on a single buffer.
//!
//! ## Payload layout
//!
//! | Part | Size |
//! |------|------|
//! | Column mask, bit set = expanded, LSB first | `ceil(columns / 8)` |
//! | Values of uniform columns, packed | `ceil(uniform * bits / 8)` |
//! | Expanded columns back to back, packed | `ceil(expanded * size_y * bits / 8)` |

use std::marker::PhantomData;
use std::mem;
use std::sync::OnceLock;

use crate::array::{BlockArray, TypeTag};
use crate::deflate::Deflator;
use crate::error::BlockDataError;
use crate::extent::Extent;
use crate::packed::PackedCells;
use crate::width::{Bits4, Bits8, Bits16, ElementWidth};

/// Sparse storage of `W::BITS`-bit elements with one value per uniform column.
#[derive(Debug)]
pub struct SparseArray<W: ElementWidth> {
    extent: Extent,
    /// One element per column. Ignored for expanded columns.
    uniform: PackedCells,
    /// Full column storage, created on the first divergent write.
    expanded: Box<[OnceLock<PackedCells>]>,
    _width: PhantomData<W>,
}

pub type SparseArray4Bit = SparseArray<Bits4>;
pub type SparseArray8Bit = SparseArray<Bits8>;
pub type SparseArray16Bit = SparseArray<Bits16>;

impl<W: ElementWidth> SparseArray<W> {
    /// Creates an array whose every column is uniformly `value`.
    pub fn filled(extent: Extent, value: i32) -> Self {
        let columns = extent.size_xz();
        let raw = W::encode(value);
        Self {
            extent,
            uniform: PackedCells::from_raw_iter(
                W::BITS,
                columns,
                std::iter::repeat_n(raw, columns),
            ),
            expanded: (0..columns).map(|_| OnceLock::new()).collect(),
            _width: PhantomData,
        }
    }

    /// Builds an array from per-column uniformity.
    ///
    /// `uniform[column]` is the column's value when it is uniform, `None`
    /// otherwise; non-uniform columns are filled from `value_at(offset)` with
    /// the linear offset of each cell.
    pub(crate) fn from_columns(
        extent: Extent,
        uniform: &[Option<i32>],
        mut value_at: impl FnMut(usize) -> i32,
    ) -> Self {
        debug_assert_eq!(uniform.len(), extent.size_xz());
        let row_size = extent.row_size();
        let mut uniform_cells = PackedCells::new(W::BITS, uniform.len());
        let mut expanded = Vec::with_capacity(uniform.len());
        for (column, value) in uniform.iter().enumerate() {
            match value {
                Some(value) => {
                    uniform_cells.put(column, W::encode(*value));
                    expanded.push(OnceLock::new());
                }
                None => {
                    let base = column * row_size;
                    let cells = PackedCells::from_raw_iter(
                        W::BITS,
                        row_size,
                        (0..row_size).map(|y| W::encode(value_at(base + y))),
                    );
                    expanded.push(OnceLock::from(cells));
                }
            }
        }
        Self {
            extent,
            uniform: uniform_cells,
            expanded: expanded.into_boxed_slice(),
            _width: PhantomData,
        }
    }

    /// Rebuilds an array from its serialized payload.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDataError::PayloadLength`] if `bytes` is shorter than the
    /// column mask or its length disagrees with the number of expanded
    /// columns the mask declares, and [`BlockDataError::MaskPadding`] if the
    /// mask's unused high bits are not zero.
    pub fn from_bytes(extent: Extent, bytes: &[u8]) -> Result<Self, BlockDataError> {
        let columns = extent.size_xz();
        let row_size = extent.row_size();
        let mask_len = columns.div_ceil(8);
        if bytes.len() < mask_len {
            return Err(BlockDataError::PayloadLength {
                tag: W::SPARSE_TAG,
                expected: mask_len,
                actual: bytes.len(),
            });
        }

        let mask = &bytes[..mask_len];
        let padding = columns % 8;
        if padding != 0 && mask[mask_len - 1] >> padding != 0 {
            return Err(BlockDataError::MaskPadding(W::SPARSE_TAG));
        }
        let is_expanded = |column: usize| (mask[column / 8] >> (column % 8)) & 1 == 1;
        let expanded_count = (0..columns).filter(|&column| is_expanded(column)).count();
        let expected = Self::payload_len(extent, expanded_count);
        if bytes.len() != expected {
            return Err(BlockDataError::PayloadLength {
                tag: W::SPARSE_TAG,
                expected,
                actual: bytes.len(),
            });
        }

        let uniform_count = columns - expanded_count;
        let uniform_end = mask_len + PackedCells::byte_len(W::BITS, uniform_count);
        let packed_uniform =
            PackedCells::from_bytes(W::BITS, uniform_count, &bytes[mask_len..uniform_end]);
        let packed_expanded = PackedCells::from_bytes(
            W::BITS,
            expanded_count * row_size,
            &bytes[uniform_end..],
        );

        let mut uniform = PackedCells::new(W::BITS, columns);
        let mut expanded = Vec::with_capacity(columns);
        let (mut next_uniform, mut next_expanded) = (0, 0);
        for column in 0..columns {
            if is_expanded(column) {
                let base = next_expanded * row_size;
                let cells = PackedCells::from_raw_iter(
                    W::BITS,
                    row_size,
                    (0..row_size).map(|y| packed_expanded.load(base + y)),
                );
                expanded.push(OnceLock::from(cells));
                next_expanded += 1;
            } else {
                uniform.put(column, packed_uniform.load(next_uniform));
                expanded.push(OnceLock::new());
                next_uniform += 1;
            }
        }

        Ok(Self {
            extent,
            uniform,
            expanded: expanded.into_boxed_slice(),
            _width: PhantomData,
        })
    }

    /// Payload length for an extent with `expanded` expanded columns.
    pub fn payload_len(extent: Extent, expanded: usize) -> usize {
        sparse_payload_len(W::BITS, extent, expanded)
    }

    /// Number of columns currently holding full storage.
    pub fn expanded_columns(&self) -> usize {
        self.expanded.iter().filter(|lock| lock.get().is_some()).count()
    }

    /// Returns `true` if the column at `row_key` holds full storage.
    pub fn is_column_expanded(&self, row_key: usize) -> bool {
        self.expanded[row_key].get().is_some()
    }

    /// Element at `y` within column `row_key`.
    pub(crate) fn column_value(&self, row_key: usize, y: usize) -> i32 {
        match self.expanded[row_key].get() {
            Some(cells) => W::decode(cells.load(y)),
            None => W::decode(self.uniform.load(row_key)),
        }
    }

    /// Returns the column's storage, expanding it from its uniform value first
    /// if needed.
    #[cold]
    fn expand(&self, row_key: usize) -> &PackedCells {
        self.expanded[row_key].get_or_init(|| {
            let raw = self.uniform.load(row_key);
            let row_size = self.extent.row_size();
            PackedCells::from_raw_iter(W::BITS, row_size, std::iter::repeat_n(raw, row_size))
        })
    }

    #[inline]
    fn locate(&self, x: usize, y: usize, z: usize) -> usize {
        debug_assert!(
            self.extent.contains(x, y, z),
            "({x}, {y}, {z}) outside {:?}",
            self.extent
        );
        self.extent.row_key(x, z)
    }
}

impl<W: ElementWidth> BlockArray for SparseArray<W> {
    fn type_tag(&self) -> TypeTag {
        W::SPARSE_TAG
    }

    fn extent(&self) -> Extent {
        self.extent
    }

    fn bit_width(&self) -> u8 {
        W::BITS
    }

    #[inline]
    fn get(&self, x: usize, y: usize, z: usize) -> i32 {
        self.column_value(self.locate(x, y, z), y)
    }

    fn set(&self, x: usize, y: usize, z: usize, value: i32) -> i32 {
        let row_key = self.locate(x, y, z);
        let raw = W::encode(value);
        let cells = match self.expanded[row_key].get() {
            Some(cells) => cells,
            None => {
                let current = self.uniform.load(row_key);
                if current == raw {
                    return W::decode(current);
                }
                self.expand(row_key)
            }
        };
        W::decode(cells.swap(y, raw))
    }

    fn compare_and_set(&self, x: usize, y: usize, z: usize, value: i32, expected: i32) -> bool {
        if !W::fits(expected) {
            return false;
        }
        let row_key = self.locate(x, y, z);
        let expected = W::encode(expected);
        let raw = W::encode(value);
        let cells = match self.expanded[row_key].get() {
            Some(cells) => cells,
            None => {
                let current = self.uniform.load(row_key);
                if current != expected {
                    return false;
                }
                if current == raw {
                    return true;
                }
                self.expand(row_key)
            }
        };
        cells.compare_exchange(y, expected, raw)
    }

    fn deflate(&self, deflator: &dyn Deflator) -> Option<Box<dyn BlockArray>> {
        W::visit_sparse(deflator, self)
    }

    fn encoded_len(&self) -> usize {
        Self::payload_len(self.extent, self.expanded_columns())
    }

    fn write_payload(&self, out: &mut Vec<u8>) {
        let columns = self.extent.size_xz();
        let mask_start = out.len();
        out.resize(mask_start + columns.div_ceil(8), 0);

        let mut uniform_values = Vec::new();
        let mut expanded = Vec::new();
        for (column, lock) in self.expanded.iter().enumerate() {
            match lock.get() {
                Some(cells) => {
                    out[mask_start + column / 8] |= 1 << (column % 8);
                    expanded.push(cells);
                }
                None => uniform_values.push(self.uniform.load(column)),
            }
        }

        PackedCells::from_raw_iter(W::BITS, uniform_values.len(), uniform_values.iter().copied())
            .write_bytes(out);
        PackedCells::from_raw_iter(
            W::BITS,
            expanded.len() * self.extent.row_size(),
            expanded.iter().copied().flat_map(|cells| cells.iter()),
        )
        .write_bytes(out);
    }

    fn storage_bytes(&self) -> usize {
        let expanded: usize = self
            .expanded
            .iter()
            .filter_map(OnceLock::get)
            .map(PackedCells::storage_bytes)
            .sum();
        self.uniform.storage_bytes()
            + self.expanded.len() * mem::size_of::<OnceLock<PackedCells>>()
            + expanded
    }
}

/// Payload length of a sparse array of `bits`-bit elements with `expanded`
/// expanded columns.
pub(crate) fn sparse_payload_len(bits: u8, extent: Extent, expanded: usize) -> usize {
    let columns = extent.size_xz();
    columns.div_ceil(8)
        + PackedCells::byte_len(bits, columns - expanded)
        + PackedCells::byte_len(bits, expanded * extent.row_size())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
