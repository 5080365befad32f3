//! Length-prefixed framing over a byte stream.
//!
//! Each frame is an 8-byte little-endian length followed by that many
//! payload bytes. Short reads, short writes and a closed peer are transport
//! errors; the caller tears the connection down, there are no retries here.

use {
    crate::error::TransportError,
    std::io::{self, Read, Write},
};

pub const LEN_PREFIX: usize = 8;
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16 MiB

pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<(), TransportError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let len = payload.len() as u64;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(payload)?;
    w.flush()?;
    Ok(())
}

pub fn read_frame<R: Read>(r: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut len_buf = [0u8; LEN_PREFIX];
    r.read_exact(&mut len_buf).map_err(closed_on_eof)?;

    let len = u64::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).map_err(closed_on_eof)?;
    Ok(payload)
}

fn closed_on_eof(e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe => TransportError::Closed,
        _ => TransportError::Io(e),
    }
}

/// A stream that speaks framed messages.
pub struct FramedChannel<S> {
    stream: S,
}

impl<S: Read + Write> FramedChannel<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        write_frame(&mut self.stream, payload)
    }

    pub fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        read_frame(&mut self.stream)
    }

    pub fn send_string(&mut self, text: &str) -> Result<(), TransportError> {
        self.send(text.as_bytes())
    }

    pub fn receive_string(&mut self) -> Result<String, TransportError> {
        String::from_utf8(self.receive()?).map_err(|_| TransportError::InvalidUtf8)
    }
}
