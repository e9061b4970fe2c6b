//! Rendering server-originated content onto the wire.
//!
//! Every content-carrying method (`Basic.Deliver`, `Basic.Get-Ok`,
//! `Basic.Return`) becomes a method frame, a content header frame, and zero
//! or more body frames. Body bytes are split so no frame payload exceeds the
//! negotiated frame-max minus the 8-byte envelope.

use bytes::Bytes;
use ottermq_proto::{
    BasicProperties, ContentHeader, FRAME_OVERHEAD, Method, ProtocolError, RawFrame,
};

/// Render `method` plus its content as a frame sequence for `channel`.
///
/// An empty body yields just the method and header frames.
pub fn content_frames(
    channel: u16,
    method: Method,
    properties: &BasicProperties,
    body: &Bytes,
    frame_max: u32,
) -> Result<Vec<RawFrame>, ProtocolError> {
    let chunk = if frame_max == 0 {
        body.len().max(1)
    } else {
        (frame_max as usize).saturating_sub(FRAME_OVERHEAD).max(1)
    };

    let mut frames = Vec::with_capacity(2 + body.len().div_ceil(chunk.max(1)));
    frames.push(method.into_frame(channel)?);

    let header = ContentHeader::basic(body.len() as u64, properties.clone());
    frames.push(RawFrame::header(channel, header.encode()?));

    let mut offset = 0;
    while offset < body.len() {
        let end = (offset + chunk).min(body.len());
        frames.push(RawFrame::body(channel, body.slice(offset..end)));
        offset = end;
    }

    Ok(frames)
}
