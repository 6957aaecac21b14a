//! Demultiplexing of the engine's framed log stream
//!
//! A non-TTY log body is a sequence of frames:
//!
//! ```text
//! [stream type: u8][0, 0, 0][payload size: u32 big-endian][payload]
//! ```
//!
//! The size bytes may take any value, including `\n`, so frames are split by
//! length and never by scanning for line terminators.

use super::ByteStream;
use std::io::{Error, ErrorKind};
use tokio::io::AsyncReadExt;

/// Width of the frame header
pub const FRAME_HEADER_WIDTH: usize = 8;

/// Upper bound on a single payload; the engine splits long lines well below this
const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// Reads whole frames off a following log stream
pub struct LogFrames {
    stream: ByteStream,
    frame: Vec<u8>,
}

impl LogFrames {
    pub fn new(stream: ByteStream) -> Self {
        Self {
            stream,
            frame: Vec::with_capacity(1024),
        }
    }

    /// Next frame, header included; `None` once the stream ends on a frame boundary.
    ///
    /// A stream that ends inside a frame yields an `UnexpectedEof` error.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<&[u8]>> {
        let mut header = [0u8; FRAME_HEADER_WIDTH];
        let mut filled = 0;
        while filled < FRAME_HEADER_WIDTH {
            let n = self.stream.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(Error::new(
                    ErrorKind::UnexpectedEof,
                    "log stream ended inside a frame header",
                ));
            }
            filled += n;
        }

        let size = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if size > MAX_FRAME_PAYLOAD {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("log frame of {size} bytes exceeds the {MAX_FRAME_PAYLOAD} byte limit"),
            ));
        }

        self.frame.clear();
        self.frame.extend_from_slice(&header);
        self.frame.resize(FRAME_HEADER_WIDTH + size, 0);
        self.stream
            .read_exact(&mut self.frame[FRAME_HEADER_WIDTH..])
            .await?;

        Ok(Some(&self.frame))
    }
}

/// Wrap `payload` in a stdout frame header
#[cfg(test)]
pub(crate) fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_WIDTH + payload.len());
    frame.extend_from_slice(&[1, 0, 0, 0]);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}
