//! Byte-level run-length coding of block array payloads.
//!
//! Payloads of terrain chunks are dominated by long runs of the same byte
//! (air above the surface, stone below). Runs are stored as `(count, value)`
//! triples and only used when they beat the raw payload.

/// A single run: `count` consecutive copies of `value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RleRun {
    /// Number of consecutive identical bytes (1..=65535).
    pub count: u16,
    pub value: u8,
}

/// Encoded size of one run: `count: u16 LE` + `value: u8`.
pub const RUN_BYTES: usize = 3;

/// Errors that can occur during RLE decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RleError {
    /// Decoded length does not match expected length.
    #[error("RLE length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    /// The encoded runs are not a whole number of run records.
    #[error("RLE data length {0} is not a multiple of {RUN_BYTES}")]
    PartialRun(usize),
    /// A run claims zero bytes.
    #[error("RLE run {0} is empty")]
    EmptyRun(usize),
}

/// Encodes bytes into runs capped at `u16::MAX`. Empty input gives no runs.
pub fn rle_encode(bytes: &[u8]) -> Vec<RleRun> {
    let mut runs: Vec<RleRun> = Vec::new();
    for &value in bytes {
        match runs.last_mut() {
            Some(run) if run.value == value && run.count < u16::MAX => run.count += 1,
            _ => runs.push(RleRun { count: 1, value }),
        }
    }
    runs
}

/// Decodes runs back into bytes.
///
/// # Errors
///
/// Returns [`RleError::LengthMismatch`] if the runs do not add up to
/// exactly `expected_len` bytes.
pub fn rle_decode(runs: &[RleRun], expected_len: usize) -> Result<Vec<u8>, RleError> {
    let actual: usize = runs.iter().map(|run| run.count as usize).sum();
    if actual != expected_len {
        return Err(RleError::LengthMismatch {
            expected: expected_len,
            actual,
        });
    }
    let mut result = Vec::with_capacity(expected_len);
    for run in runs {
        result.extend(std::iter::repeat_n(run.value, run.count as usize));
    }
    Ok(result)
}

/// Number of bytes `bytes` would take once run-length encoded, without
/// building the runs.
pub fn rle_encoded_len(bytes: &[u8]) -> usize {
    let mut runs = 0;
    let mut current: Option<(u8, u16)> = None;
    for &value in bytes {
        current = match current {
            Some((prev, count)) if prev == value && count < u16::MAX => Some((prev, count + 1)),
            _ => {
                runs += 1;
                Some((value, 1))
            }
        };
    }
    runs * RUN_BYTES
}

/// Serializes runs to bytes: each run is `count: u16 LE` + `value: u8`.
pub fn rle_to_bytes(runs: &[RleRun]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(runs.len() * RUN_BYTES);
    for run in runs {
        buf.extend_from_slice(&run.count.to_le_bytes());
        buf.push(run.value);
    }
    buf
}

/// Parses runs serialized by [`rle_to_bytes`].
///
/// # Errors
///
/// Returns [`RleError::PartialRun`] if `data` is not a whole number of runs
/// and [`RleError::EmptyRun`] if a run has a zero count.
pub fn rle_from_bytes(data: &[u8]) -> Result<Vec<RleRun>, RleError> {
    if data.len() % RUN_BYTES != 0 {
        return Err(RleError::PartialRun(data.len()));
    }
    data.chunks_exact(RUN_BYTES)
        .enumerate()
        .map(|(index, chunk)| {
            let count = u16::from_le_bytes([chunk[0], chunk[1]]);
            if count == 0 {
                return Err(RleError::EmptyRun(index));
            }
            Ok(RleRun {
                count,
                value: chunk[2],
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
