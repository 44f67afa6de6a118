//! Packet framing over the transport.
//!
//! The framer owns the byte stream and the per-command sequence counter. It
//! splits outbound payloads at [`MAX_PACKET_SIZE`], reassembles inbound
//! payloads that span several frames, and detects sequence desyncs. When
//! compression is active the framed bytes travel through
//! [`Compression`](super::compress::Compression).

use std::fmt;
use std::io::{self, Read, Write};

use s2wire_core::error::{ConnectionError, ConnectionErrorKind, ProtocolErrorKind};
use s2wire_core::{Error, Result};

use crate::protocol::compress::Compression;
use crate::protocol::{MAX_PACKET_SIZE, PacketHeader};

/// Upper bound on a reassembled inbound payload.
pub const MAX_INBOUND_PAYLOAD: usize = 1 << 30;

/// A bidirectional byte stream the framer can drive (TCP, TLS, test pipes).
pub trait Transport: Read + Write + Send {}

impl<T: Read + Write + Send> Transport for T {}

/// Map an I/O failure on the transport to a connection error.
pub(crate) fn transport_error(context: &str, err: io::Error) -> Error {
    if matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    ) {
        return Error::Timeout;
    }
    let kind = if err.kind() == io::ErrorKind::ConnectionRefused {
        ConnectionErrorKind::Refused
    } else {
        ConnectionErrorKind::Disconnected
    };
    Error::Connection(ConnectionError {
        kind,
        message: format!("{}: {}", context, err),
        source: Some(Box::new(err)),
    })
}

pub struct Framer {
    stream: Box<dyn Transport>,
    sequence: u8,
    compression: Option<Compression>,
    max_packet_size: usize,
}

impl fmt::Debug for Framer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framer")
            .field("sequence", &self.sequence)
            .field("compressed", &self.compression.is_some())
            .field("max_packet_size", &self.max_packet_size)
            .finish_non_exhaustive()
    }
}

impl Framer {
    pub fn new(stream: Box<dyn Transport>, max_packet_size: usize) -> Self {
        Self {
            stream,
            sequence: 0,
            compression: None,
            max_packet_size,
        }
    }

    /// Expected sequence number of the next packet in either direction.
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn is_compressed(&self) -> bool {
        self.compression.is_some()
    }

    /// Start a new command exchange.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
        if let Some(c) = self.compression.as_mut() {
            c.reset_sequence();
        }
    }

    /// Expect the first reply packet of an already-sent command.
    ///
    /// Pipelined commands are all written before any reply is read, so the
    /// counter has to be rewound for each response in turn.
    pub fn expect_reply(&mut self) {
        self.sequence = 1;
    }

    /// Switch the stream to compressed frames. Takes effect for the next
    /// command.
    pub fn enable_compression(&mut self) {
        self.compression = Some(Compression::new());
    }

    /// Replace the underlying transport, e.g. to wrap it in TLS.
    pub fn upgrade<F>(&mut self, wrap: F) -> Result<()>
    where
        F: FnOnce(Box<dyn Transport>) -> Result<Box<dyn Transport>>,
    {
        let plain = std::mem::replace(&mut self.stream, Box::new(io::empty()));
        self.stream = wrap(plain)?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.compression.as_mut() {
            Some(c) => c.read_exact(&mut self.stream, buf),
            None => self
                .stream
                .read_exact(buf)
                .map_err(|e| transport_error("read failed", e)),
        }
    }

    /// Read one logical payload, reassembling continuation frames.
    pub fn read_payload(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; PacketHeader::SIZE];
            self.read_exact(&mut header)?;
            let header = PacketHeader::from_bytes(&header);

            // Under compression the frame counter is checked instead.
            if self.compression.is_none() && header.sequence_id != self.sequence {
                return Err(Error::protocol(
                    ProtocolErrorKind::SequenceMismatch,
                    format!(
                        "packet sequence {} received, expected {}",
                        header.sequence_id, self.sequence
                    ),
                ));
            }
            self.sequence = header.sequence_id.wrapping_add(1);

            let len = header.payload_length as usize;
            if payload.len() + len > MAX_INBOUND_PAYLOAD {
                return Err(Error::protocol(
                    ProtocolErrorKind::PacketTooLarge {
                        must_reconnect: true,
                    },
                    format!("inbound payload exceeds {} bytes", MAX_INBOUND_PAYLOAD),
                ));
            }
            let start = payload.len();
            payload.resize(start + len, 0);
            self.read_exact(&mut payload[start..])?;
            tracing::trace!(len, sequence = header.sequence_id, "read packet");

            if len < MAX_PACKET_SIZE {
                return Ok(payload);
            }
        }
    }

    /// Write one logical payload in the current sequence.
    ///
    /// A payload over the configured max packet size is rejected before any
    /// byte is written, so the session stays usable.
    pub fn write_payload(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_packet_size {
            return Err(Error::protocol(
                ProtocolErrorKind::PacketTooLarge {
                    must_reconnect: false,
                },
                format!(
                    "packet of {} bytes exceeds max_allowed_packet ({})",
                    payload.len(),
                    self.max_packet_size
                ),
            ));
        }
        let framed = self.frame(payload);
        let wire = match self.compression.as_mut() {
            Some(c) => c
                .encode(&framed)
                .map_err(|e| transport_error("compression failed", e))?,
            None => framed,
        };
        self.stream
            .write_all(&wire)
            .and_then(|()| self.stream.flush())
            .map_err(|e| transport_error("write failed", e))?;
        tracing::trace!(len = payload.len(), sequence = self.sequence, "wrote packet");
        Ok(())
    }

    /// Start a command: reset the sequence and write its payload.
    pub fn write_command(&mut self, payload: &[u8]) -> Result<()> {
        self.reset_sequence();
        self.write_payload(payload)
    }

    /// Split a payload into frames, advancing the sequence per frame.
    ///
    /// A payload whose length is an exact multiple of the max frame size is
    /// terminated by an empty frame.
    fn frame(&mut self, payload: &[u8]) -> Vec<u8> {
        let frames = payload.len() / MAX_PACKET_SIZE + 1;
        let mut out = Vec::with_capacity(payload.len() + frames * PacketHeader::SIZE);
        let mut offset = 0;
        loop {
            let len = (payload.len() - offset).min(MAX_PACKET_SIZE);
            let header = PacketHeader {
                payload_length: len as u32,
                sequence_id: self.sequence,
            };
            out.extend_from_slice(&header.to_bytes());
            out.extend_from_slice(&payload[offset..offset + len]);
            self.sequence = self.sequence.wrapping_add(1);
            offset += len;
            if len < MAX_PACKET_SIZE {
                return out;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// In-memory transport: reads from a script, records writes.
    struct Pipe {
        input: io::Cursor<Vec<u8>>,
        output: Arc<Mutex<Vec<u8>>>,
    }

    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn framer(input: Vec<u8>) -> (Framer, Arc<Mutex<Vec<u8>>>) {
        let output = Arc::new(Mutex::new(Vec::new()));
        let pipe = Pipe {
            input: io::Cursor::new(input),
            output: Arc::clone(&output),
        };
        (Framer::new(Box::new(pipe), 64 * 1024 * 1024), output)
    }

    #[test]
    fn write_command_resets_sequence() {
        let (mut f, out) = framer(Vec::new());
        f.write_command(b"\x0e").unwrap();
        f.write_payload(b"x").unwrap();
        f.write_command(b"\x0e").unwrap();
        assert_eq!(
            out.lock().unwrap().as_slice(),
            &[1, 0, 0, 0, 0x0e, 1, 0, 0, 1, b'x', 1, 0, 0, 0, 0x0e]
        );
        assert_eq!(f.sequence(), 1);
    }

    #[test]
    fn read_checks_sequence() {
        let (mut f, _) = framer(vec![1, 0, 0, 0, 0x00]);
        f.reset_sequence();
        assert_eq!(f.read_payload().unwrap(), vec![0x00]);

        let (mut f, _) = framer(vec![1, 0, 0, 5, 0x00]);
        let err = f.read_payload().unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ref p) if p.kind == ProtocolErrorKind::SequenceMismatch
        ));
        assert!(err.requires_reconnect());
    }

    #[test]
    fn oversized_payload_is_rejected_before_write() {
        let output = Arc::new(Mutex::new(Vec::new()));
        let pipe = Pipe {
            input: io::Cursor::new(Vec::new()),
            output: Arc::clone(&output),
        };
        let mut f = Framer::new(Box::new(pipe), 16);
        let err = f.write_command(&[0u8; 17]).unwrap_err();
        assert!(!err.requires_reconnect());
        assert!(output.lock().unwrap().is_empty());
    }

    #[test]
    fn max_size_payload_gets_empty_terminator() {
        let (mut f, out) = framer(Vec::new());
        let payload = vec![7u8; MAX_PACKET_SIZE];
        f.write_command(&payload).unwrap();
        let out = out.lock().unwrap();
        assert_eq!(out.len(), MAX_PACKET_SIZE + 8);
        assert_eq!(&out[..4], &[0xFF, 0xFF, 0xFF, 0]);
        assert_eq!(&out[MAX_PACKET_SIZE + 4..], &[0, 0, 0, 1]);
        assert_eq!(f.sequence(), 2);
    }

    #[test]
    fn reassembles_split_payload() {
        let mut input = vec![0xFF, 0xFF, 0xFF, 0];
        input.extend(std::iter::repeat_n(1u8, MAX_PACKET_SIZE));
        input.extend([2, 0, 0, 1, 9, 9]);
        let (mut f, _) = framer(input);
        let payload = f.read_payload().unwrap();
        assert_eq!(payload.len(), MAX_PACKET_SIZE + 2);
        assert_eq!(&payload[MAX_PACKET_SIZE..], &[9, 9]);
        assert_eq!(f.sequence(), 2);
    }

    #[test]
    fn compressed_round_trip_through_pipe() {
        let (mut writer, out) = framer(Vec::new());
        writer.enable_compression();
        writer.write_command(&[b'q'; 300]).unwrap();
        let wire = out.lock().unwrap().clone();

        let (mut reader, _) = framer(wire);
        reader.enable_compression();
        assert_eq!(reader.read_payload().unwrap(), vec![b'q'; 300]);
    }

    #[test]
    fn compressed_read_checks_frame_sequence() {
        let mut input = vec![5, 0, 0, 9, 0, 0, 0];
        input.extend([1, 0, 0, 5, 0x00]);
        let (mut f, _) = framer(input);
        f.enable_compression();
        f.reset_sequence();
        let err = f.read_payload().unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ref p) if p.kind == ProtocolErrorKind::SequenceMismatch
        ));
        assert!(err.requires_reconnect());

        let mut input = vec![5, 0, 0, 0, 0, 0, 0];
        input.extend([1, 0, 0, 5, 0x00]);
        let (mut f, _) = framer(input);
        f.enable_compression();
        assert_eq!(f.read_payload().unwrap(), vec![0x00]);
    }

    #[test]
    fn eof_on_transport_is_disconnect() {
        let (mut f, _) = framer(vec![5, 0]);
        let err = f.read_payload().unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ref c) if c.kind == ConnectionErrorKind::Disconnected
        ));
    }
}
