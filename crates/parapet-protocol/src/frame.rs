//! Length-prefixed framing: `u32 LE length ‖ u8 opcode ‖ body`.
//!
//! The length field counts the opcode byte plus the body, not itself.
//! All integers on the wire are little-endian.

use std::io::{Read, Write};

use parapet_types::{ParapetError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::OpCode;

/// Maximum accepted frame length (opcode + body).
///
/// Large enough for the commit_version chunk list of a multi-gigabyte file
/// (a few dozen bytes per chunk); small enough that a corrupt length prefix
/// cannot exhaust memory.
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

#[derive(Debug)]
pub struct Frame {
    pub opcode: OpCode,
    pub body: Vec<u8>,
}

/// Write one frame. The caller is responsible for serializing writers so
/// frames are never interleaved on the stream.
pub fn write_frame(w: &mut dyn Write, opcode: OpCode, body: &[u8]) -> Result<()> {
    let len = 1u32
        .checked_add(body.len() as u32)
        .filter(|l| *l <= MAX_FRAME_LEN)
        .ok_or_else(|| {
            ParapetError::Transport(format!("outgoing frame too large: {} bytes", body.len()))
        })?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&[opcode as u8])?;
    w.write_all(body)?;
    w.flush()?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean EOF at a frame boundary
/// (the peer closed the connection); EOF mid-frame is a transport error.
pub fn read_frame(r: &mut dyn Read) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match read_exact_or_eof(r, &mut len_buf)? {
        ReadOutcome::Eof => return Ok(None),
        ReadOutcome::Filled => {}
    }
    let len = u32::from_le_bytes(len_buf);
    if len < 1 {
        return Err(ParapetError::Transport("zero-length frame".into()));
    }
    if len > MAX_FRAME_LEN {
        return Err(ParapetError::Transport(format!(
            "frame length {len} exceeds limit of {MAX_FRAME_LEN}"
        )));
    }

    let mut op_buf = [0u8; 1];
    r.read_exact(&mut op_buf)
        .map_err(|e| ParapetError::Transport(format!("truncated frame header: {e}")))?;
    let opcode = OpCode::from_u8(op_buf[0]).ok_or(ParapetError::UnknownOpcode(op_buf[0]))?;

    let mut body = vec![0u8; (len - 1) as usize];
    r.read_exact(&mut body)
        .map_err(|e| ParapetError::Transport(format!("truncated frame body: {e}")))?;

    Ok(Some(Frame { opcode, body }))
}

enum ReadOutcome {
    Filled,
    Eof,
}

/// Fill `buf` completely, distinguishing EOF-before-any-bytes from EOF mid-read.
fn read_exact_or_eof(r: &mut dyn Read, buf: &mut [u8]) -> Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(ReadOutcome::Eof),
            Ok(0) => {
                return Err(ParapetError::Transport(
                    "connection closed mid-frame".into(),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ParapetError::Transport(format!("read failed: {e}"))),
        }
    }
    Ok(ReadOutcome::Filled)
}

/// Serialize a message body as msgpack.
pub fn encode_body<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(msg)?)
}

/// Deserialize a msgpack message body.
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, OpCode::Probe, b"hello").unwrap();

        let frame = read_frame(&mut Cursor::new(&buf)).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Probe);
        assert_eq!(frame.body, b"hello");
    }

    #[test]
    fn empty_body_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, OpCode::Stats, b"").unwrap();

        let frame = read_frame(&mut Cursor::new(&buf)).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Stats);
        assert!(frame.body.is_empty());
    }

    #[test]
    fn clean_eof_returns_none() {
        let frame = read_frame(&mut Cursor::new(Vec::new())).unwrap();
        assert!(frame.is_none());
    }

    #[test]
    fn eof_mid_frame_is_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, OpCode::Probe, b"hello").unwrap();
        buf.truncate(buf.len() - 2);
        assert!(read_frame(&mut Cursor::new(&buf)).is_err());
    }

    #[test]
    fn oversized_length_rejected() {
        let mut buf = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        buf.push(OpCode::Probe as u8);
        assert!(read_frame(&mut Cursor::new(&buf)).is_err());
    }

    #[test]
    fn zero_length_rejected() {
        let buf = 0u32.to_le_bytes().to_vec();
        assert!(read_frame(&mut Cursor::new(&buf)).is_err());
    }

    #[test]
    fn unknown_opcode_rejected() {
        let mut buf = 1u32.to_le_bytes().to_vec();
        buf.push(0xee);
        let err = read_frame(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(
            err,
            parapet_types::ParapetError::UnknownOpcode(0xee)
        ));
    }

    #[test]
    fn length_is_little_endian() {
        let mut buf = Vec::new();
        write_frame(&mut buf, OpCode::Probe, b"ab").unwrap();
        // length = opcode (1) + body (2)
        assert_eq!(&buf[..4], &3u32.to_le_bytes());
    }

    #[test]
    fn multiple_frames_in_sequence() {
        let mut buf = Vec::new();
        write_frame(&mut buf, OpCode::Probe, b"one").unwrap();
        write_frame(&mut buf, OpCode::Stats, b"two").unwrap();

        let mut cursor = Cursor::new(&buf);
        let f1 = read_frame(&mut cursor).unwrap().unwrap();
        let f2 = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(f1.body, b"one");
        assert_eq!(f2.body, b"two");
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }
}
