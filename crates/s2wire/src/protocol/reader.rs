//! Byte cursor over a received packet payload.
//!
//! Reads fixed-width little-endian integers, length-encoded integers and
//! strings, and the generic OK / ERR / EOF packets.

use crate::protocol::capabilities::CLIENT_SESSION_TRACK;
use crate::protocol::server_status::SERVER_SESSION_STATE_CHANGED;
use crate::protocol::{EofPacket, ErrPacket, OkPacket, SessionChange, session_track};

/// A read cursor over one packet payload.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Create a new reader from a byte slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current cursor position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Get remaining bytes in the buffer.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Check if we've reached the end of the data.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Peek at the next byte without advancing.
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos)?;
        self.pos += 1;
        Some(*byte)
    }

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Some(out)
    }

    pub fn read_u16_le(&mut self) -> Option<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    /// Read a u24 (little-endian, 3 bytes).
    pub fn read_u24_le(&mut self) -> Option<u32> {
        let b: [u8; 3] = self.read_array()?;
        Some(u32::from(b[0]) | (u32::from(b[1]) << 8) | (u32::from(b[2]) << 16))
    }

    pub fn read_u32_le(&mut self) -> Option<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_u64_le(&mut self) -> Option<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    /// Read a length-encoded integer.
    ///
    /// - 0x00-0xFA: 1-byte value
    /// - 0xFC: 2-byte value follows
    /// - 0xFD: 3-byte value follows
    /// - 0xFE: 8-byte value follows
    /// - 0xFB: NULL marker, returns `None`
    pub fn read_lenenc_int(&mut self) -> Option<u64> {
        let first = self.read_u8()?;
        match first {
            0x00..=0xFA => Some(u64::from(first)),
            0xFC => self.read_u16_le().map(u64::from),
            0xFD => self.read_u24_le().map(u64::from),
            0xFE => self.read_u64_le(),
            0xFB | 0xFF => None,
        }
    }

    /// Read a length-encoded byte range without copying.
    pub fn read_lenenc_slice(&mut self) -> Option<&'a [u8]> {
        let len = usize::try_from(self.read_lenenc_int()?).ok()?;
        self.read_bytes(len)
    }

    /// Read a length-encoded string.
    pub fn read_lenenc_string(&mut self) -> Option<String> {
        self.read_lenenc_slice()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read a length-encoded byte vector.
    pub fn read_lenenc_bytes(&mut self) -> Option<Vec<u8>> {
        self.read_lenenc_slice().map(<[u8]>::to_vec)
    }

    /// Read a null-terminated string.
    pub fn read_null_string(&mut self) -> Option<String> {
        let rest = self.data.get(self.pos..)?;
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let s = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += (end + 1).min(rest.len());
        Some(s)
    }

    /// Read a fixed-length string.
    pub fn read_string(&mut self, len: usize) -> Option<String> {
        let bytes = self.read_bytes(len)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Read remaining data as a string.
    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    /// Read a fixed number of bytes.
    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(bytes)
    }

    /// Read remaining bytes.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.data.get(self.pos..).unwrap_or(&[]);
        self.pos = self.data.len();
        rest
    }

    /// Skip a number of bytes.
    pub fn skip(&mut self, n: usize) -> bool {
        if self.remaining() >= n {
            self.pos += n;
            true
        } else {
            false
        }
    }

    /// Parse an OK packet (0x00, or 0xFE when it terminates a result).
    ///
    /// With `CLIENT_SESSION_TRACK` the info string is length-encoded and may
    /// be followed by a state-change block when the status flags say so.
    pub fn parse_ok_packet(&mut self, capabilities: u64) -> Option<OkPacket> {
        if matches!(self.peek(), Some(0x00 | 0xFE)) {
            self.skip(1);
        }

        let affected_rows = self.read_lenenc_int()?;
        let last_insert_id = self.read_lenenc_int()?;
        let status_flags = self.read_u16_le()?;
        let warnings = self.read_u16_le()?;
        let mut ok = OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            ..OkPacket::default()
        };

        if capabilities & CLIENT_SESSION_TRACK == 0 {
            ok.info = self.read_rest_string();
            return Some(ok);
        }
        if self.is_empty() {
            return Some(ok);
        }
        ok.info = self.read_lenenc_string()?;
        if status_flags & SERVER_SESSION_STATE_CHANGED != 0 && !self.is_empty() {
            let block = self.read_lenenc_slice()?;
            ok.session_changes = parse_session_changes(block)?;
        }
        Some(ok)
    }

    /// Parse an Error packet.
    ///
    /// - 0xFF header
    /// - error_code: 2 bytes
    /// - '#' marker + sql_state: 5 bytes (absent during early handshake)
    /// - error_message: rest of packet
    pub fn parse_err_packet(&mut self) -> Option<ErrPacket> {
        if self.peek() == Some(0xFF) {
            self.skip(1);
        }

        let error_code = self.read_u16_le()?;
        let sql_state = if self.peek() == Some(b'#') {
            self.skip(1);
            self.read_string(5)?
        } else {
            String::new()
        };
        let error_message = self.read_rest_string();

        Some(ErrPacket {
            error_code,
            sql_state,
            error_message,
        })
    }

    /// Parse a classic EOF packet: 0xFE, warnings (2), status flags (2).
    pub fn parse_eof_packet(&mut self) -> Option<EofPacket> {
        if self.peek() == Some(0xFE) {
            self.skip(1);
        }

        let warnings = self.read_u16_le()?;
        let status_flags = self.read_u16_le()?;
        Some(EofPacket {
            warnings,
            status_flags,
        })
    }
}

fn parse_session_changes(block: &[u8]) -> Option<Vec<SessionChange>> {
    let mut reader = PacketReader::new(block);
    let mut changes = Vec::new();
    while !reader.is_empty() {
        let kind = reader.read_u8()?;
        let data = reader.read_lenenc_slice()?;
        let mut entry = PacketReader::new(data);
        let change = match kind {
            session_track::SYSTEM_VARIABLES => SessionChange::SystemVariable {
                name: entry.read_lenenc_string()?,
                value: entry.read_lenenc_string().unwrap_or_default(),
            },
            session_track::SCHEMA => SessionChange::Schema(entry.read_lenenc_string()?),
            session_track::STATE_CHANGE => {
                SessionChange::StateChanged(entry.read_lenenc_slice()? == b"1")
            }
            other => SessionChange::Other(other),
        };
        changes.push(change);
    }
    Some(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::writer::PacketWriter;

    #[test]
    fn test_read_fixed_width() {
        let data = [
            0x42, 0x34, 0x12, 0x56, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 0x01, 0x02, 0x03, 0x04,
            0x05, 0x06, 0x07, 0x08,
        ];
        let mut reader = PacketReader::new(&data);
        assert_eq!(reader.read_u8(), Some(0x42));
        assert_eq!(reader.read_u16_le(), Some(0x1234));
        assert_eq!(reader.read_u24_le(), Some(0x0012_3456));
        assert_eq!(reader.read_u32_le(), Some(0x1234_5678));
        assert_eq!(reader.read_u64_le(), Some(0x0807_0605_0403_0201));
        assert_eq!(reader.read_u8(), None);
    }

    #[test]
    fn test_short_reads_do_not_advance() {
        let mut reader = PacketReader::new(&[0x01, 0x02]);
        assert_eq!(reader.read_u32_le(), None);
        assert_eq!(reader.position(), 0);
        assert_eq!(reader.read_u16_le(), Some(0x0201));
    }

    #[test]
    fn test_read_lenenc_int() {
        let mut reader = PacketReader::new(&[0x42]);
        assert_eq!(reader.read_lenenc_int(), Some(0x42));

        let mut reader = PacketReader::new(&[0xFC, 0x34, 0x12]);
        assert_eq!(reader.read_lenenc_int(), Some(0x1234));

        let mut reader = PacketReader::new(&[0xFD, 0x56, 0x34, 0x12]);
        assert_eq!(reader.read_lenenc_int(), Some(0x0012_3456));

        let mut reader = PacketReader::new(&[0xFE, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(reader.read_lenenc_int(), Some(0x0807_0605_0403_0201));

        let mut reader = PacketReader::new(&[0xFB]);
        assert_eq!(reader.read_lenenc_int(), None);
    }

    #[test]
    fn test_strings() {
        let mut reader = PacketReader::new(b"hello\0world\0\x03abc");
        assert_eq!(reader.read_null_string().as_deref(), Some("hello"));
        assert_eq!(reader.read_null_string().as_deref(), Some("world"));
        assert_eq!(reader.read_lenenc_string().as_deref(), Some("abc"));
        assert!(reader.is_empty());
    }

    #[test]
    fn test_parse_ok_packet_plain() {
        let data = [0x00, 0x01, 0x2A, 0x02, 0x00, 0x00, 0x00];
        let ok = PacketReader::new(&data).parse_ok_packet(0).unwrap();
        assert_eq!(ok.affected_rows, 1);
        assert_eq!(ok.last_insert_id, 42);
        assert_eq!(ok.status_flags, 2);
        assert_eq!(ok.warnings, 0);
    }

    #[test]
    fn test_parse_ok_packet_with_session_track() {
        let mut entries = PacketWriter::new();
        let mut schema = PacketWriter::new();
        schema.write_lenenc_string("analytics");
        entries.write_u8(session_track::SCHEMA);
        entries.write_lenenc_bytes(schema.as_bytes());
        let mut var = PacketWriter::new();
        var.write_lenenc_string("autocommit");
        var.write_lenenc_string("OFF");
        entries.write_u8(session_track::SYSTEM_VARIABLES);
        entries.write_lenenc_bytes(var.as_bytes());

        let mut ok = PacketWriter::new();
        ok.write_u8(0x00);
        ok.write_lenenc_int(0);
        ok.write_lenenc_int(0);
        ok.write_u16_le(SERVER_SESSION_STATE_CHANGED);
        ok.write_u16_le(0);
        ok.write_lenenc_string("");
        ok.write_lenenc_bytes(entries.as_bytes());

        let parsed = PacketReader::new(ok.as_bytes())
            .parse_ok_packet(CLIENT_SESSION_TRACK)
            .unwrap();
        assert_eq!(
            parsed.session_changes,
            vec![
                SessionChange::Schema("analytics".into()),
                SessionChange::SystemVariable {
                    name: "autocommit".into(),
                    value: "OFF".into()
                }
            ]
        );
    }

    #[test]
    fn test_parse_err_packet() {
        let mut data = vec![0xFF, 0x15, 0x04, b'#'];
        data.extend_from_slice(b"28000");
        data.extend_from_slice(b"Access denied");
        let err = PacketReader::new(&data).parse_err_packet().unwrap();
        assert_eq!(err.error_code, 1045);
        assert_eq!(err.sql_state, "28000");
        assert_eq!(err.error_message, "Access denied");
    }

    #[test]
    fn test_parse_eof_packet() {
        let data = [0xFE, 0x00, 0x00, 0x02, 0x00];
        let eof = PacketReader::new(&data).parse_eof_packet().unwrap();
        assert_eq!(eof.warnings, 0);
        assert_eq!(eof.status_flags, 2);
    }
}
