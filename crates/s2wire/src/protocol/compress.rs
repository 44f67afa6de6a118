//! Compressed protocol layer (CLIENT_COMPRESS).
//!
//! Once negotiated, the plain packet stream is carried inside compressed
//! frames with a 7-byte header:
//! - 3 bytes: length of the frame body as sent
//! - 1 byte: compression sequence number
//! - 3 bytes: uncompressed body length, 0 when the body is stored as-is
//!
//! Bodies are zlib streams. Short chunks are sent stored.

use std::io::{self, Read, Write};

use flate2::Compression as Level;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use s2wire_core::error::ProtocolErrorKind;
use s2wire_core::{Error, Result};

use crate::protocol::MAX_PACKET_SIZE;
use crate::protocol::framer::transport_error;

/// Size of the compressed frame header.
pub const COMPRESSED_HEADER_SIZE: usize = 7;

/// Chunks shorter than this are never deflated.
pub const MIN_COMPRESS_LENGTH: usize = 50;

fn u24(bytes: &[u8]) -> usize {
    usize::from(bytes[0]) | (usize::from(bytes[1]) << 8) | (usize::from(bytes[2]) << 16)
}

fn put_u24(out: &mut Vec<u8>, value: usize) {
    out.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
}

/// Per-connection compression state: the frame sequence counter and the
/// decompressed bytes not yet consumed by the packet reader.
#[derive(Debug, Default)]
pub struct Compression {
    sequence: u8,
    inbound: Vec<u8>,
    pos: usize,
}

impl Compression {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart frame numbering; called at the start of every command.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Decompressed bytes buffered but not yet read.
    pub fn buffered(&self) -> usize {
        self.inbound.len() - self.pos
    }

    /// Wrap already-framed packet bytes into compressed frames.
    pub fn encode(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() + COMPRESSED_HEADER_SIZE);
        for chunk in data.chunks(MAX_PACKET_SIZE) {
            self.encode_frame(chunk, &mut out)?;
        }
        Ok(out)
    }

    fn encode_frame(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        let deflated = if chunk.len() < MIN_COMPRESS_LENGTH {
            None
        } else {
            let mut encoder = ZlibEncoder::new(Vec::with_capacity(chunk.len() / 2), Level::default());
            encoder.write_all(chunk)?;
            let compressed = encoder.finish()?;
            (compressed.len() < chunk.len()).then_some(compressed)
        };

        match deflated {
            Some(body) => {
                put_u24(out, body.len());
                out.push(self.sequence);
                put_u24(out, chunk.len());
                out.extend_from_slice(&body);
            }
            None => {
                put_u24(out, chunk.len());
                out.push(self.sequence);
                put_u24(out, 0);
                out.extend_from_slice(chunk);
            }
        }
        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }

    /// Fill `buf` from the decompressed stream, pulling frames as needed.
    pub fn read_exact<R: Read + ?Sized>(&mut self, stream: &mut R, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.pos >= self.inbound.len() {
                self.fill(stream)?;
                continue;
            }
            let n = (self.inbound.len() - self.pos).min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&self.inbound[self.pos..self.pos + n]);
            self.pos += n;
            filled += n;
        }
        Ok(())
    }

    fn fill<R: Read + ?Sized>(&mut self, stream: &mut R) -> Result<()> {
        let mut header = [0u8; COMPRESSED_HEADER_SIZE];
        stream
            .read_exact(&mut header)
            .map_err(|e| transport_error("read failed", e))?;
        let body_len = u24(&header[0..3]);
        let uncompressed_len = u24(&header[4..7]);
        if header[3] != self.sequence {
            return Err(Error::protocol(
                ProtocolErrorKind::SequenceMismatch,
                format!(
                    "compressed frame sequence {} received, expected {}",
                    header[3], self.sequence
                ),
            ));
        }
        self.sequence = header[3].wrapping_add(1);

        let mut body = vec![0u8; body_len];
        stream
            .read_exact(&mut body)
            .map_err(|e| transport_error("read failed", e))?;

        self.inbound = if uncompressed_len == 0 {
            body
        } else {
            // One byte past the announced length is enough to detect a lie.
            let mut out = Vec::with_capacity(uncompressed_len);
            ZlibDecoder::new(body.as_slice())
                .take(uncompressed_len as u64 + 1)
                .read_to_end(&mut out)
                .map_err(|e| Error::malformed(format!("cannot inflate compressed frame: {}", e)))?;
            if out.len() != uncompressed_len {
                return Err(Error::malformed(format!(
                    "compressed frame inflated to {} bytes, header announced {}",
                    out.len(),
                    uncompressed_len
                )));
            }
            out
        };
        self.pos = 0;
        tracing::trace!(
            body_len,
            uncompressed_len,
            sequence = header[3],
            "read compressed frame"
        );
        Ok(())
    }
}
