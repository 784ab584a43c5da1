//! Self-describing binary blobs for a single block array.
//!
//! The TBLK format wraps a backend payload with everything needed to decode
//! it without outside context: the type tag, the extent, and the compression
//! applied. It is what the persistence layer writes per chunk.
//!
//! ## Binary Layout
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | Magic bytes `[0x54, 0x42, 0x4C, 0x4B]` ("TBLK") |
//! | 4 | 1 | Format version (`u8`, currently 1) |
//! | 5 | 1 | Type tag (`u8`) |
//! | 6 | 1 | Compression (`u8`: 0 = none, 1 = run-length) |
//! | 7 | 12 | `size_x`, `size_y`, `size_z` (`u32` each, little-endian) |
//! | 19 | 4 | Raw payload length (`u32`, little-endian) |
//! | 23 | 4 | Stored payload length (`u32`, little-endian) |
//! | 27 | N | Stored payload |
//!
//! Run-length compression is used only when it is strictly smaller than the
//! raw payload.

use crate::array::{BlockArray, TypeTag};
use crate::error::BlockDataError;
use crate::extent::Extent;
use crate::handler::HandlerRegistry;
use crate::packed::PackedCells;
use crate::rle::{RleError, rle_decode, rle_encode, rle_encoded_len, rle_from_bytes, rle_to_bytes};

/// Magic bytes identifying the TBLK format.
const MAGIC: [u8; 4] = *b"TBLK";

/// Current format version.
const FORMAT_VERSION: u8 = 1;

/// Size of the fixed header preceding the payload.
const HEADER_LEN: usize = 27;

const COMPRESSION_NONE: u8 = 0;
const COMPRESSION_RLE: u8 = 1;

/// Errors that can occur while decoding a blob.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum BlobError {
    /// The data does not start with the expected magic bytes.
    #[error("invalid magic bytes")]
    InvalidMagic,
    /// The format version is not supported by this build.
    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u8),
    /// The data is shorter than its header says.
    #[error("data truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    /// The compression byte names no known scheme.
    #[error("unknown compression scheme: {0}")]
    UnknownCompression(u8),
    /// An uncompressed payload whose stored and raw lengths disagree.
    #[error("payload length mismatch: raw {raw}, stored {stored}")]
    LengthMismatch { raw: usize, stored: usize },
    /// The header declares a raw payload longer than any array of its tag and
    /// extent can have.
    #[error("declared payload of {declared} bytes exceeds the {max} byte maximum")]
    PayloadTooLarge { declared: usize, max: usize },
    /// Bytes remain after the payload.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    /// The run-length encoded payload is malformed.
    #[error(transparent)]
    Rle(#[from] RleError),
    /// The header or payload was rejected by the block data layer.
    #[error(transparent)]
    BlockData(#[from] BlockDataError),
}

/// Serializes `array` into a TBLK blob.
pub fn encode_blob(array: &dyn BlockArray) -> Vec<u8> {
    let mut payload = Vec::with_capacity(array.encoded_len());
    array.write_payload(&mut payload);

    let (compression, stored) = if rle_encoded_len(&payload) < payload.len() {
        (COMPRESSION_RLE, rle_to_bytes(&rle_encode(&payload)))
    } else {
        (COMPRESSION_NONE, payload.clone())
    };

    let extent = array.extent();
    let mut buf = Vec::with_capacity(HEADER_LEN + stored.len());
    buf.extend_from_slice(&MAGIC);
    buf.push(FORMAT_VERSION);
    buf.push(array.type_tag().as_u8());
    buf.push(compression);
    for size in [extent.size_x(), extent.size_y(), extent.size_z()] {
        buf.extend_from_slice(&header_u32(size).to_le_bytes());
    }
    buf.extend_from_slice(&header_u32(payload.len()).to_le_bytes());
    buf.extend_from_slice(&header_u32(stored.len()).to_le_bytes());
    buf.extend_from_slice(&stored);

    tracing::trace!(
        tag = ?array.type_tag(),
        raw = payload.len(),
        stored = stored.len(),
        compression,
        "encoded block data blob"
    );
    buf
}

/// Decodes a TBLK blob with the process-wide registry.
///
/// # Errors
///
/// Returns a [`BlobError`] if the blob is malformed or its payload does not
/// match its declared backend and extent.
pub fn decode_blob(data: &[u8]) -> Result<Box<dyn BlockArray>, BlobError> {
    decode_blob_with(HandlerRegistry::global(), data)
}

/// Decodes a TBLK blob with an explicit registry.
pub fn decode_blob_with(
    registry: &HandlerRegistry,
    data: &[u8],
) -> Result<Box<dyn BlockArray>, BlobError> {
    if data.len() < MAGIC.len() || data[..MAGIC.len()] != MAGIC {
        return Err(BlobError::InvalidMagic);
    }
    if data.len() < 5 {
        return Err(BlobError::Truncated {
            expected: 5,
            actual: data.len(),
        });
    }
    let version = data[4];
    if version != FORMAT_VERSION {
        return Err(BlobError::UnsupportedVersion(version));
    }
    if data.len() < HEADER_LEN {
        return Err(BlobError::Truncated {
            expected: HEADER_LEN,
            actual: data.len(),
        });
    }

    let raw_tag = data[5];
    let compression = data[6];
    let extent = Extent::try_new(read_u32(data, 7), read_u32(data, 11), read_u32(data, 15))?;
    let raw_len = read_u32(data, 19);
    let stored_len = read_u32(data, 23);

    let end = HEADER_LEN
        .checked_add(stored_len)
        .ok_or(BlobError::Truncated {
            expected: usize::MAX,
            actual: data.len(),
        })?;
    if data.len() < end {
        return Err(BlobError::Truncated {
            expected: end,
            actual: data.len(),
        });
    }
    if data.len() > end {
        return Err(BlobError::TrailingBytes(data.len() - end));
    }
    let stored = &data[HEADER_LEN..end];

    let array = match compression {
        COMPRESSION_NONE => {
            if raw_len != stored_len {
                return Err(BlobError::LengthMismatch {
                    raw: raw_len,
                    stored: stored_len,
                });
            }
            registry.deserialize(raw_tag, extent, stored)?
        }
        COMPRESSION_RLE => {
            let tag =
                TypeTag::from_u8(raw_tag).ok_or(BlockDataError::UnknownTypeTag(raw_tag))?;
            let max = max_payload_len(tag, extent);
            if raw_len > max {
                return Err(BlobError::PayloadTooLarge {
                    declared: raw_len,
                    max,
                });
            }
            let payload = rle_decode(&rle_from_bytes(stored)?, raw_len)?;
            registry.deserialize(raw_tag, extent, &payload)?
        }
        other => return Err(BlobError::UnknownCompression(other)),
    };
    Ok(array)
}

/// Longest payload a backend of `tag` can have at `extent`: the full packed
/// volume, plus the column mask and one byte of padding for sparse backends.
fn max_payload_len(tag: TypeTag, extent: Extent) -> usize {
    let packed = PackedCells::byte_len(tag.bit_width(), extent.volume());
    if tag.is_sparse() {
        // Uniform values and expanded columns are padded separately.
        packed + extent.size_xz().div_ceil(8) + 1
    } else {
        packed
    }
}

fn read_u32(data: &[u8], offset: usize) -> usize {
    let bytes = [
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ];
    u32::from_le_bytes(bytes) as usize
}

/// Header fields are `u32`; extents and payloads never come near that.
fn header_u32(value: usize) -> u32 {
    debug_assert!(u32::try_from(value).is_ok(), "{value} does not fit a blob header field");
    value as u32
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
