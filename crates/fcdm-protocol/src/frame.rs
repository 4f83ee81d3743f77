//! Length-prefixed JSON framing.
//!
//! A frame is a 4-byte little-endian body length followed by the JSON encoding
//! of a [`Frame`]. Descriptors travel out of band (SCM_RIGHTS) and are matched
//! to frames by the count each frame declares.

use thiserror::Error;

use crate::messages::Frame;

pub const HEADER_LEN: usize = 4;

/// Upper bound on a frame body. Bulk media never travels inline, so anything
/// this large is a corrupt stream.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),

    #[error("malformed frame body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializes `frame` with its length header.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(body.len()));
    }

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Pops one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed; `buf` is left untouched in
/// that case.
pub fn decode(buf: &mut Vec<u8>) -> Result<Option<Frame>, FrameError> {
    let Some(header) = buf.first_chunk::<HEADER_LEN>() else {
        return Ok(None);
    };
    let len = u32::from_le_bytes(*header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    if buf.len() < HEADER_LEN + len {
        return Ok(None);
    }

    let frame = serde_json::from_slice(&buf[HEADER_LEN..HEADER_LEN + len])?;
    buf.drain(..HEADER_LEN + len);
    Ok(Some(frame))
}
