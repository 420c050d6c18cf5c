//! Payload codecs for the channel requests the proxy inspects.
//!
//! Only `pty-req` and `window-change` are ever decoded; everything else is
//! mirrored opaquely. Parse failures leave the original request to be
//! forwarded unchanged; the resize is simply not applied locally.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;

fn get_u32(buf: &mut Bytes, request: &'static str, field: &'static str) -> Result<u32, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::Truncated { request, field });
    }
    Ok(buf.get_u32())
}

/// Decoded `pty-req` payload. Pixel dimensions and encoded terminal modes
/// are ignored on parse and synthesised on serialisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyReqData {
    pub term: String,
    pub width: u32,
    pub height: u32,
}

impl PtyReqData {
    /// Parse a `pty-req` payload: u32 TERM length, TERM, then width
    /// (columns), height (rows), pixel width, pixel height, modes.
    pub fn parse(payload: &[u8]) -> Result<Self, CodecError> {
        let mut buf = Bytes::copy_from_slice(payload);
        let term_len = get_u32(&mut buf, "pty-req", "term length")? as usize;
        if buf.remaining() < term_len {
            return Err(CodecError::Truncated {
                request: "pty-req",
                field: "term",
            });
        }
        let term = String::from_utf8(buf.split_to(term_len).to_vec())
            .map_err(|_| CodecError::InvalidTerm)?;
        let width = get_u32(&mut buf, "pty-req", "width")?;
        let height = get_u32(&mut buf, "pty-req", "height")?;
        Ok(Self {
            term,
            width,
            height,
        })
    }

    /// Serialise back to the wire form, synthesising pixel dimensions as
    /// eight pixels per cell and empty terminal modes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.term.len() + 24);
        buf.put_u32(self.term.len() as u32);
        buf.put_slice(self.term.as_bytes());
        buf.put_u32(self.width);
        buf.put_u32(self.height);
        buf.put_u32(self.width * 8);
        buf.put_u32(self.height * 8);
        buf.put_u32(0); // empty encoded terminal modes
        buf.to_vec()
    }
}

/// Decoded `window-change` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowChange {
    pub width: u32,
    pub height: u32,
}

impl WindowChange {
    /// Parse a `window-change` payload: width (columns), height (rows),
    /// then pixel dimensions which are ignored.
    pub fn parse(payload: &[u8]) -> Result<Self, CodecError> {
        let mut buf = Bytes::copy_from_slice(payload);
        let width = get_u32(&mut buf, "window-change", "width")?;
        let height = get_u32(&mut buf, "window-change", "height")?;
        Ok(Self { width, height })
    }

    /// Serialise back to the wire form, synthesising pixel dimensions as
    /// eight pixels per cell.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u32(self.width);
        buf.put_u32(self.height);
        buf.put_u32(self.width * 8);
        buf.put_u32(self.height * 8);
        buf.to_vec()
    }
}
