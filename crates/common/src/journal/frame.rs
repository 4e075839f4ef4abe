//! Record framing: `[len u32 LE][checksum u32 LE][payload]`.
//!
//! The checksum is the first four bytes of the BLAKE3 hash of the payload.

use std::io::{self, Read};

pub const HEADER_LEN: usize = 8;

/// Frames claiming a longer payload are treated as corrupt.
pub const MAX_PAYLOAD: usize = 256 * 1024 * 1024;

pub fn checksum(payload: &[u8]) -> u32 {
    let hash = blake3::hash(payload);
    let bytes = hash.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[derive(Debug)]
pub enum Frame {
    Complete(Vec<u8>),
    /// Stream ended inside a frame
    Torn,
    /// Checksum mismatch on a complete frame
    Corrupt,
    End,
}

/// Read one frame from `reader`.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Frame> {
    let mut header = [0u8; HEADER_LEN];
    match read_full(reader, &mut header)? {
        0 => return Ok(Frame::End),
        n if n < HEADER_LEN => return Ok(Frame::Torn),
        _ => {}
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let sum = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_PAYLOAD {
        return Ok(Frame::Corrupt);
    }

    let mut payload = vec![0u8; len];
    if read_full(reader, &mut payload)? < len {
        return Ok(Frame::Torn);
    }
    if checksum(&payload) != sum {
        return Ok(Frame::Corrupt);
    }
    Ok(Frame::Complete(payload))
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
