//! Frame codec for the bridge wire protocol.
//!
//! Each frame is a big-endian length prefix followed by exactly that many
//! payload bytes:
//!
//! ```text
//! [u32 BE length] [payload: length bytes]
//! ```
//!
//! The payload is one UTF-8 JSON record (see [`super::message`]), but this
//! layer treats it as opaque bytes. Zero-length payloads are legal here;
//! they fail later as a decode error.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::BridgeError;

/// Default maximum frame payload size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Size of the length prefix in bytes.
const HEADER_LEN: usize = 4;

/// Bytes requested from the stream per read.
const READ_CHUNK: usize = 8 * 1024;

/// Encode a payload into a wire-format byte vector.
///
/// Returns `[u32 BE length][payload]`.
///
/// # Errors
///
/// Returns [`BridgeError::FrameTooLarge`] if the payload exceeds `max_frame_size`.
pub fn encode_frame(payload: &[u8], max_frame_size: u32) -> Result<Vec<u8>, BridgeError> {
    let length = checked_length(payload.len(), max_frame_size)?;
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Write one frame.
///
/// The prefix and payload go out in a single `write_all` so that a caller
/// holding a write lock never interleaves with another frame.
///
/// # Errors
///
/// Returns [`BridgeError::FrameTooLarge`] before writing anything if the
/// payload is too large, or [`BridgeError::Transport`] if the write fails.
pub async fn write_frame<W>(
    writer: &mut W,
    payload: &[u8],
    max_frame_size: u32,
) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_frame(payload, max_frame_size)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and return its payload.
///
/// Short reads are retried until the full prefix and payload have arrived.
/// Not cancel-safe: dropping the future mid-frame loses the bytes already
/// read. Use [`FrameReader`] where reads may be cancelled.
///
/// # Errors
///
/// Returns [`BridgeError::Transport`] if the stream fails or ends before the
/// frame is complete, or [`BridgeError::FrameTooLarge`] if the declared
/// length exceeds `max_frame_size`.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: u32) -> Result<Vec<u8>, BridgeError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let length = u32::from_be_bytes(header);
    if length > max_frame_size {
        return Err(BridgeError::FrameTooLarge {
            length: length as usize,
            max: max_frame_size,
        });
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and pull complete payloads with
/// [`FrameDecoder::next_frame`]. Incomplete data stays buffered.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_size: u32,
}

impl FrameDecoder {
    /// Create a decoder with an empty buffer.
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_size,
        }
    }

    /// Change the size limit applied to frames not yet extracted.
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.max_frame_size = max_frame_size;
    }

    /// Append bytes read from the stream.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete payload, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::FrameTooLarge`] as soon as a header declares a
    /// length above the limit.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, BridgeError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if length > self.max_frame_size {
            return Err(BridgeError::FrameTooLarge {
                length: length as usize,
                max: self.max_frame_size,
            });
        }

        let total = HEADER_LEN + length as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        let payload = self.buf[HEADER_LEN..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(payload))
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

/// Read side of a framed stream.
///
/// Unlike [`read_frame`], [`FrameReader::next_frame`] is cancel-safe: bytes
/// of a frame that is still arriving are kept in the decoder, so dropping
/// the future (for example on a caller's timeout) loses nothing.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Wrap `inner` with an empty decoder.
    pub fn new(inner: R, max_frame_size: u32) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(max_frame_size),
        }
    }

    /// Change the frame size limit.
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.decoder.set_max_frame_size(max_frame_size);
    }

    /// Read until one complete frame is available and return its payload.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::FrameTooLarge`] for an oversized header, or
    /// [`BridgeError::Transport`] if the stream fails or ends (`UnexpectedEof`).
    pub async fn next_frame(&mut self) -> Result<Vec<u8>, BridgeError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(payload) = self.decoder.next_frame()? {
                return Ok(payload);
            }

            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return Err(BridgeError::Transport(io::ErrorKind::UnexpectedEof.into()));
            }
            self.decoder.feed(&chunk[..n]);
        }
    }
}

fn checked_length(len: usize, max_frame_size: u32) -> Result<u32, BridgeError> {
    match u32::try_from(len) {
        Ok(length) if length <= max_frame_size => Ok(length),
        _ => Err(BridgeError::FrameTooLarge {
            length: len,
            max: max_frame_size,
        }),
    }
}
