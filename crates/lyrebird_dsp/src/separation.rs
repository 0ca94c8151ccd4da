//! Stereo Channel Separation
//!
//! Splits interleaved 16-bit little-endian stereo into independent left and
//! right channel buffers. The primary path writes into caller-provided
//! buffers (sized by the caller from its buffer pool); the fallback path
//! allocates two owned halves and is used when no pooled buffers are
//! available or the processor is shedding load.
//!
//! On well-formed input both paths produce byte-identical channel data; the
//! fallback only skips the downstream sync and quality stages.

use crate::error::{DspError, DspResult};

/// Bytes per 16-bit sample
pub const BYTES_PER_SAMPLE: usize = 2;

/// Bytes per interleaved stereo frame (one left + one right sample)
pub const BYTES_PER_FRAME: usize = 2 * BYTES_PER_SAMPLE;

/// De-interleave a stereo frame into two caller-provided channel buffers.
///
/// `input` is interleaved 16-bit LE stereo (`L0 R0 L1 R1 ...`). Returns the
/// number of bytes written to each channel buffer.
pub fn split_into(input: &[u8], left: &mut [u8], right: &mut [u8]) -> DspResult<usize> {
    if input.is_empty() {
        return Err(DspError::EmptyFrame);
    }
    if input.len() % BYTES_PER_FRAME != 0 {
        return Err(DspError::MalformedFrame(input.len()));
    }

    let channel_bytes = input.len() / 2;
    if left.len() < channel_bytes {
        return Err(DspError::OutputTooSmall {
            needed: channel_bytes,
            have: left.len(),
        });
    }
    if right.len() < channel_bytes {
        return Err(DspError::OutputTooSmall {
            needed: channel_bytes,
            have: right.len(),
        });
    }

    for (i, frame) in input.chunks_exact(BYTES_PER_FRAME).enumerate() {
        let off = i * BYTES_PER_SAMPLE;
        left[off] = frame[0];
        left[off + 1] = frame[1];
        right[off] = frame[2];
        right[off + 1] = frame[3];
    }

    Ok(channel_bytes)
}

/// Minimal channel separation used when pooled buffers are unavailable.
///
/// Produces the same de-interleave as [`split_into`] on well-formed input.
/// Input that is not a whole number of stereo frames is split in half raw
/// rather than dropped, so no captured audio is lost on the degraded path.
pub fn fallback_split(input: &[u8]) -> (Vec<u8>, Vec<u8>) {
    if !input.is_empty() && input.len() % BYTES_PER_FRAME == 0 {
        let channel_bytes = input.len() / 2;
        let mut left = vec![0u8; channel_bytes];
        let mut right = vec![0u8; channel_bytes];
        for (i, frame) in input.chunks_exact(BYTES_PER_FRAME).enumerate() {
            let off = i * BYTES_PER_SAMPLE;
            left[off] = frame[0];
            left[off + 1] = frame[1];
            right[off] = frame[2];
            right[off + 1] = frame[3];
        }
        (left, right)
    } else {
        let mid = input.len() / 2;
        (input[..mid].to_vec(), input[mid..].to_vec())
    }
}

/// Decode a 16-bit LE byte buffer into samples.
///
/// Trailing odd bytes are ignored.
pub fn decode_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Encode samples back into a 16-bit LE byte buffer.
///
/// Returns the number of bytes written; `out` must hold at least
/// `2 * samples.len()` bytes.
pub fn encode_samples(samples: &[i16], out: &mut [u8]) -> DspResult<usize> {
    let needed = samples.len() * BYTES_PER_SAMPLE;
    if out.len() < needed {
        return Err(DspError::OutputTooSmall {
            needed,
            have: out.len(),
        });
    }
    for (i, s) in samples.iter().enumerate() {
        let b = s.to_le_bytes();
        out[i * BYTES_PER_SAMPLE] = b[0];
        out[i * BYTES_PER_SAMPLE + 1] = b[1];
    }
    Ok(needed)
}

/// Interleave two channel sample slices into a stereo byte buffer.
///
/// Channels are truncated to the shorter of the two.
pub fn interleave(left: &[i16], right: &[i16]) -> Vec<u8> {
    let frames = left.len().min(right.len());
    let mut out = Vec::with_capacity(frames * BYTES_PER_FRAME);
    for i in 0..frames {
        out.extend_from_slice(&left[i].to_le_bytes());
        out.extend_from_slice(&right[i].to_le_bytes());
    }
    out
}
