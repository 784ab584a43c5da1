//! Recoverable failures surfaced to the persistence layer.

use thiserror::Error;

use crate::array::TypeTag;

/// Errors produced while building arrays from external input or dispatching
/// through the handler registry.
///
/// Caller contract violations (out-of-range coordinates or values) are not
/// represented here; they fail fast with a panic.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockDataError {
    /// An extent has a zero dimension or a volume above [`MAX_VOLUME`](crate::MAX_VOLUME).
    #[error("invalid extent {size_x}x{size_y}x{size_z}")]
    InvalidExtent {
        /// Requested X dimension.
        size_x: usize,
        /// Requested Y dimension.
        size_y: usize,
        /// Requested Z dimension.
        size_z: usize,
    },
    /// Raw bytes do not have the length the tag implies for the extent.
    #[error("payload length mismatch for {tag:?}: expected {expected} bytes, got {actual}")]
    PayloadLength {
        /// Backend the bytes were decoded as.
        tag: TypeTag,
        /// Length implied by the tag and extent.
        expected: usize,
        /// Length actually supplied.
        actual: usize,
    },
    /// A sparse column mask has bits set past the last column.
    #[error("column mask for {0:?} sets bits past the last column")]
    MaskPadding(TypeTag),
    /// The stored tag byte does not name any backend.
    #[error("unknown type tag: {0}")]
    UnknownTypeTag(u8),
    /// The tag is valid but no handler has been registered for it.
    #[error("no handler registered for {0:?}")]
    MissingHandler(TypeTag),
    /// A handler was asked to serialize a backend it does not own.
    #[error("handler for {expected:?} cannot serialize {actual:?}")]
    HandlerMismatch {
        /// Tag the handler owns.
        expected: TypeTag,
        /// Tag of the array it was handed.
        actual: TypeTag,
    },
    /// No dense backend exists for the requested element width.
    #[error("unsupported bit width: {0}")]
    UnsupportedBitWidth(u8),
}
