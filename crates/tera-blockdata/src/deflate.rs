//! Deflation: replacing a backend with a smaller one holding the same content.
//!
//! Backends double-dispatch into a [`Deflator`]: each calls the entry point
//! matching its own concrete type, handing over its raw layout. The visitor
//! either builds a replacement or declines with `None`. Declining is never an
//! error and leaves the original untouched.

use tera_config::DeflateConfig;

use crate::array::{BlockArray, TypeTag};
use crate::dense::DenseArray;
use crate::extent::Extent;
use crate::packed::PackedCells;
use crate::sparse::{
    SparseArray, SparseArray4Bit, SparseArray8Bit, SparseArray16Bit, sparse_payload_len,
};
use crate::width::{Bits4, Bits8, Bits16, ElementWidth, narrowest_bits};

/// Raw view of a dense backend: its packed buffer, column height and extent.
#[derive(Clone, Copy, Debug)]
pub struct RawLayout<'a> {
    /// Elements in column-major order.
    pub cells: &'a PackedCells,
    /// Contiguous elements per column.
    pub row_size: usize,
    pub extent: Extent,
}

/// Visitor with one entry point per concrete backend.
///
/// Every entry point defaults to declining, so a deflator only implements the
/// backends it knows how to improve.
pub trait Deflator {
    fn deflate_dense_4bit(&self, _layout: RawLayout<'_>) -> Option<Box<dyn BlockArray>> {
        None
    }

    fn deflate_dense_8bit(&self, _layout: RawLayout<'_>) -> Option<Box<dyn BlockArray>> {
        None
    }

    fn deflate_dense_16bit(&self, _layout: RawLayout<'_>) -> Option<Box<dyn BlockArray>> {
        None
    }

    fn deflate_sparse_4bit(&self, _array: &SparseArray4Bit) -> Option<Box<dyn BlockArray>> {
        None
    }

    fn deflate_sparse_8bit(&self, _array: &SparseArray8Bit) -> Option<Box<dyn BlockArray>> {
        None
    }

    fn deflate_sparse_16bit(&self, _array: &SparseArray16Bit) -> Option<Box<dyn BlockArray>> {
        None
    }
}

/// What [`ColumnDeflator`] is allowed to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeflatePolicy {
    /// Move to a narrower element width when every value fits.
    pub narrow_bit_width: bool,
    /// Store uniform columns as a single value.
    pub sparse_columns: bool,
    /// Only replace when the payload shrinks by at least this many bytes
    /// beyond the mandatory one.
    pub min_savings_bytes: usize,
}

impl DeflatePolicy {
    /// A policy under which every deflation declines.
    pub fn disabled() -> Self {
        Self {
            narrow_bit_width: false,
            sparse_columns: false,
            min_savings_bytes: 0,
        }
    }
}

impl Default for DeflatePolicy {
    fn default() -> Self {
        Self {
            narrow_bit_width: true,
            sparse_columns: true,
            min_savings_bytes: 0,
        }
    }
}

impl From<&DeflateConfig> for DeflatePolicy {
    fn from(config: &DeflateConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        Self {
            narrow_bit_width: config.narrow_bit_width,
            sparse_columns: config.sparse_columns,
            min_savings_bytes: config.min_savings_bytes,
        }
    }
}

/// Standard deflator: detects uniform columns and unused high bits.
///
/// Each visit scans every column once, then weighs dense and sparse layouts
/// at the current width and at the narrowest width holding every value. The
/// smallest payload wins (ties go to dense, then to the narrower width), and
/// it replaces the visited array only if strictly smaller. Applying the
/// deflator to its own output therefore always declines.
#[derive(Clone, Copy, Debug, Default)]
pub struct ColumnDeflator {
    policy: DeflatePolicy,
}

impl ColumnDeflator {
    pub fn new(policy: DeflatePolicy) -> Self {
        Self { policy }
    }

    pub fn from_config(config: &DeflateConfig) -> Self {
        Self::new(DeflatePolicy::from(config))
    }

    pub fn policy(&self) -> DeflatePolicy {
        self.policy
    }

    fn deflate_dense<W: ElementWidth>(&self, layout: RawLayout<'_>) -> Option<Box<dyn BlockArray>> {
        let current_len = PackedCells::byte_len(W::BITS, layout.extent.volume());
        self.compact(
            W::DENSE_TAG,
            current_len,
            layout.extent,
            layout.row_size,
            |offset| W::decode(layout.cells.load(offset)),
        )
    }

    fn deflate_sparse<W: ElementWidth>(
        &self,
        array: &SparseArray<W>,
    ) -> Option<Box<dyn BlockArray>> {
        let row_size = array.extent().row_size();
        self.compact(
            W::SPARSE_TAG,
            array.encoded_len(),
            array.extent(),
            row_size,
            |offset| array.column_value(offset / row_size, offset % row_size),
        )
    }

    fn compact(
        &self,
        from: TypeTag,
        current_len: usize,
        extent: Extent,
        row_size: usize,
        value_at: impl Fn(usize) -> i32,
    ) -> Option<Box<dyn BlockArray>> {
        let scan = ColumnScan::run(extent.size_xz(), row_size, &value_at);
        let Some(layout) = self.choose(from.bit_width(), current_len, extent, &scan) else {
            tracing::trace!(?from, current_len, "deflation declined");
            return None;
        };

        let deflated = match layout.bits {
            4 => layout.build::<Bits4>(extent, &scan, value_at),
            8 => layout.build::<Bits8>(extent, &scan, value_at),
            _ => layout.build::<Bits16>(extent, &scan, value_at),
        };
        tracing::debug!(
            ?from,
            to = ?deflated.type_tag(),
            before = current_len,
            after = deflated.encoded_len(),
            "deflated block array"
        );
        Some(deflated)
    }

    /// Picks the smallest allowed layout, or `None` if none beats `current_len`.
    fn choose(
        &self,
        current_bits: u8,
        current_len: usize,
        extent: Extent,
        scan: &ColumnScan,
    ) -> Option<Layout> {
        let narrow_bits = if self.policy.narrow_bit_width {
            narrowest_bits(scan.min, scan.max).min(current_bits)
        } else {
            current_bits
        };
        let expanded = scan.uniform.iter().filter(|value| value.is_none()).count();

        let mut candidates = vec![Layout::dense(current_bits), Layout::dense(narrow_bits)];
        if self.policy.sparse_columns {
            candidates.push(Layout::sparse(current_bits));
            candidates.push(Layout::sparse(narrow_bits));
        }

        let best = candidates.into_iter().min_by_key(|layout| {
            (layout.payload_len(extent, expanded), layout.sparse, layout.bits)
        })?;
        let best_len = best.payload_len(extent, expanded);
        (best_len + self.policy.min_savings_bytes < current_len).then_some(best)
    }
}

impl Deflator for ColumnDeflator {
    fn deflate_dense_4bit(&self, layout: RawLayout<'_>) -> Option<Box<dyn BlockArray>> {
        self.deflate_dense::<Bits4>(layout)
    }

    fn deflate_dense_8bit(&self, layout: RawLayout<'_>) -> Option<Box<dyn BlockArray>> {
        self.deflate_dense::<Bits8>(layout)
    }

    fn deflate_dense_16bit(&self, layout: RawLayout<'_>) -> Option<Box<dyn BlockArray>> {
        self.deflate_dense::<Bits16>(layout)
    }

    fn deflate_sparse_4bit(&self, array: &SparseArray4Bit) -> Option<Box<dyn BlockArray>> {
        self.deflate_sparse(array)
    }

    fn deflate_sparse_8bit(&self, array: &SparseArray8Bit) -> Option<Box<dyn BlockArray>> {
        self.deflate_sparse(array)
    }

    fn deflate_sparse_16bit(&self, array: &SparseArray16Bit) -> Option<Box<dyn BlockArray>> {
        self.deflate_sparse(array)
    }
}

/// Value range and per-column uniformity of one array.
#[derive(Debug)]
struct ColumnScan {
    min: i32,
    max: i32,
    /// `Some(value)` for columns holding a single value.
    uniform: Vec<Option<i32>>,
}

impl ColumnScan {
    fn run(columns: usize, row_size: usize, value_at: impl Fn(usize) -> i32) -> Self {
        let mut min = i32::MAX;
        let mut max = i32::MIN;
        let mut uniform = Vec::with_capacity(columns);
        for column in 0..columns {
            let base = column * row_size;
            let first = value_at(base);
            let mut same = true;
            for offset in base..base + row_size {
                let value = value_at(offset);
                min = min.min(value);
                max = max.max(value);
                same &= value == first;
            }
            uniform.push(same.then_some(first));
        }
        Self { min, max, uniform }
    }
}

/// A candidate representation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Layout {
    bits: u8,
    sparse: bool,
}

impl Layout {
    fn dense(bits: u8) -> Self {
        Self {
            bits,
            sparse: false,
        }
    }

    fn sparse(bits: u8) -> Self {
        Self { bits, sparse: true }
    }

    fn payload_len(&self, extent: Extent, expanded: usize) -> usize {
        if self.sparse {
            sparse_payload_len(self.bits, extent, expanded)
        } else {
            PackedCells::byte_len(self.bits, extent.volume())
        }
    }

    fn build<W: ElementWidth>(
        &self,
        extent: Extent,
        scan: &ColumnScan,
        value_at: impl Fn(usize) -> i32,
    ) -> Box<dyn BlockArray> {
        debug_assert_eq!(self.bits, W::BITS);
        if self.sparse {
            Box::new(SparseArray::<W>::from_columns(extent, &scan.uniform, value_at))
        } else {
            Box::new(DenseArray::<W>::from_linear(extent, value_at))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
