use std::io::{Read, Write};

use flounder_error::{FlounderError, Result};

/// Upper bound for client messages.
pub const MAX_CLIENT_MESSAGE: usize = 64 * 1024;

/// Write one frame: 8-byte little-endian length, then the payload.
pub fn write_frame(stream: &mut impl Write, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u64;
    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(payload)?;
    stream.flush()?;
    Ok(())
}

/// Read one frame, enforcing `limit` on the announced size; reads until the
/// whole payload arrived. Returns `None` on a cleanly closed connection.
pub fn read_frame(stream: &mut impl Read, limit: Option<usize>) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; 8];
    match stream.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u64::from_le_bytes(header) as usize;
    if let Some(limit) = limit {
        if len > limit {
            return Err(FlounderError::MessageTooLarge { size: len, limit });
        }
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        assert_eq!(&buf[..8], &5u64.to_le_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let payload = read_frame(&mut cursor, None).unwrap().unwrap();
        assert_eq!(payload, b"hello");
        assert!(read_frame(&mut cursor, None).unwrap().is_none());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[0u8; 100]).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor, Some(10)).is_err());
    }
}
