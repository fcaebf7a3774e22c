//! OSC 1.0 wire codec
//!
//! Strings are UTF-8 plus one NUL, zero-padded to a 4-byte boundary. Numbers
//! are 4 big-endian bytes. Blobs carry a 4-byte big-endian length and are
//! padded like strings. Bundles start with `#bundle\0`, an 8-byte timetag and
//! a sequence of length-prefixed elements.
//!
//! Encoding goes through `rosc` after validation. Decoding is done here: it
//! skips typetags it does not know without consuming payload bytes and keeps
//! the elements of a bundle decoded before an overrunning one, both of which
//! the mixer's traffic relies on.

use bytes::Buf;
use tracing::{debug, trace};

use super::types::{bare, OscBundle, OscMessage, OscPacket, OscTime, OscType};
use crate::error::{OscError, Result};

/// Literal that opens every bundle
pub const BUNDLE_MARKER: &[u8; 8] = b"#bundle\0";

/// Marker (8) + timetag (8)
const BUNDLE_HEADER_LEN: usize = 16;

/// Bytes needed to pad `len` to the next multiple of 4
#[inline]
fn pad_len(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

fn check_address(addr: &str) -> Result<()> {
    if addr.is_empty() || !addr.starts_with('/') {
        return Err(OscError::InvalidAddress(addr.to_string()));
    }
    check_string(addr)
}

/// A NUL would terminate the string early on the wire
fn check_string(s: &str) -> Result<()> {
    if s.contains('\0') {
        return Err(OscError::InvalidString(s.to_string()));
    }
    Ok(())
}

fn check_message(msg: &OscMessage) -> Result<()> {
    check_address(&msg.addr)?;
    for arg in &msg.args {
        if let OscType::String(s) = arg {
            check_string(s)?;
        }
    }
    Ok(())
}

fn check_packet(packet: &OscPacket) -> Result<()> {
    match packet {
        OscPacket::Message(msg) => check_message(msg),
        OscPacket::Bundle(bundle) => bundle.content.iter().try_for_each(check_packet),
    }
}

/// Encode a message or bundle.
///
/// Addresses must start with '/' and no string may contain a NUL, so that
/// decoding the result gives back the same packet.
pub fn encode(packet: &OscPacket) -> Result<Vec<u8>> {
    check_packet(packet)?;
    rosc::encoder::encode(packet).map_err(|e| OscError::Encode(format!("{:?}", e)))
}

/// Encode a single message
pub fn encode_message(msg: &OscMessage) -> Result<Vec<u8>> {
    encode(&OscPacket::Message(msg.clone()))
}

/// Decode one datagram.
///
/// Bundles are detected by their marker. Inside a bundle, an element whose
/// declared length overruns the buffer stops the scan but keeps everything
/// decoded so far; an element that fails to decode is skipped.
pub fn decode(buf: &[u8]) -> Result<OscPacket> {
    if buf.starts_with(BUNDLE_MARKER) {
        decode_bundle(buf).map(OscPacket::Bundle)
    } else {
        decode_message(buf).map(OscPacket::Message)
    }
}

fn decode_bundle(buf: &[u8]) -> Result<OscBundle> {
    if buf.len() < BUNDLE_HEADER_LEN {
        return Err(OscError::malformed(format!(
            "bundle header truncated ({} bytes)",
            buf.len()
        )));
    }

    let mut reader = Reader::new(buf);
    reader.skip(BUNDLE_MARKER.len());
    let timetag = OscTime {
        seconds: reader.read_u32()?,
        fractional: reader.read_u32()?,
    };

    let mut elements = Vec::new();
    while reader.remaining() >= 4 {
        let len = reader.read_u32()? as usize;
        let Some(element) = reader.take(len) else {
            debug!(
                "Bundle element declares {} bytes but only {} remain, stopping scan",
                len,
                reader.remaining()
            );
            break;
        };
        if element.is_empty() {
            continue;
        }
        match decode(element) {
            Ok(packet) => elements.push(packet),
            Err(e) => debug!("Skipping bundle element: {}", e),
        }
    }

    Ok(OscBundle {
        timetag,
        content: elements,
    })
}

fn decode_message(buf: &[u8]) -> Result<OscMessage> {
    let mut reader = Reader::new(buf);

    let addr = reader.read_string()?;
    if addr.is_empty() || !addr.starts_with('/') {
        return Err(OscError::malformed(format!("bad address pattern {:?}", addr)));
    }

    // Typetag string omitted entirely: treat as no arguments
    if reader.remaining() == 0 {
        return Ok(bare(addr));
    }

    let tags = reader.read_string()?;
    let Some(tags) = tags.strip_prefix(',') else {
        trace!("{}: typetag string {:?} lacks ',', ignoring arguments", addr, tags);
        return Ok(bare(addr));
    };

    let mut args = Vec::with_capacity(tags.len());
    for tag in tags.chars() {
        let arg = match tag {
            'i' => OscType::Int(reader.read_u32()? as i32),
            'f' => OscType::Float(f32::from_bits(reader.read_u32()?)),
            's' => OscType::String(reader.read_string()?),
            'T' => OscType::Bool(true),
            'F' => OscType::Bool(false),
            'b' => OscType::Blob(reader.read_blob()?),
            other => {
                trace!("{}: skipping unsupported typetag '{}'", addr, other);
                continue;
            }
        };
        args.push(arg);
    }

    Ok(OscMessage { addr, args })
}

/// Bounds-checked cursor over a datagram
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn skip(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.buf.len());
    }

    /// Move to the next multiple of 4, never past the end
    fn align(&mut self) {
        self.skip(pad_len(self.pos));
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if n > self.remaining() {
            return None;
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let pos = self.pos;
        let mut word = self
            .take(4)
            .ok_or_else(|| OscError::malformed(format!("32-bit value truncated at offset {}", pos)))?;
        Ok(word.get_u32())
    }

    fn read_string(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| OscError::malformed(format!("unterminated string at offset {}", self.pos)))?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|e| OscError::malformed(format!("string is not UTF-8: {}", e)))?
            .to_owned();
        self.pos += nul + 1;
        self.align();
        Ok(s)
    }

    fn read_blob(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        let data = self.take(len).ok_or_else(|| {
            OscError::malformed(format!(
                "blob declares {} bytes but only {} remain",
                len,
                self.remaining()
            ))
        })?;
        let data = data.to_vec();
        self.align();
        Ok(data)
    }
}
