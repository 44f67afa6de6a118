//! Column descriptors parsed from column-definition packets.

use std::sync::Arc;

use s2wire_core::{Error, Result};

use crate::protocol::PacketReader;
use crate::protocol::capabilities::EXTENDED_TYPE_INFO;
use crate::types::decode::Codec;
use crate::protocol::charset;
use crate::types::{ElementType, FieldType, column_flags};

/// Trailing vendor extension code after the fixed column fields.
mod ext_code {
    pub const NONE: u8 = 0;
    pub const BSON: u8 = 1;
    pub const VECTOR: u8 = 2;
}

/// Extended type metadata keys in the EXTENDED_TYPE_INFO block.
mod ext_key {
    pub const TYPE_NAME: u8 = 0;
    pub const FORMAT: u8 = 1;
}

/// Extended column type resolved from the name/format strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedType {
    Vector {
        dimension: u32,
        element: ElementType,
    },
    Bson,
}

/// Immutable column metadata.
///
/// Descriptors are shared behind `Arc` by every row of a result. The only
/// derivation is [`with_alias`](Self::with_alias), which yields a new
/// descriptor with the same decoding behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    pub schema: String,
    /// Table name or alias
    pub table: String,
    pub org_table: String,
    /// Column name or projection alias
    pub name: String,
    pub org_name: String,
    pub charset: u16,
    /// Display length
    pub column_length: u32,
    pub field_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
    pub extended_name: Option<String>,
    pub extended_format: Option<String>,
    codec: Codec,
}

impl ColumnDescriptor {
    /// Build a descriptor directly (used for synthesized results and tests).
    pub fn new(name: impl Into<String>, field_type: FieldType, flags: u16) -> Self {
        let mut col = Self {
            schema: String::new(),
            table: String::new(),
            org_table: String::new(),
            name: name.into(),
            org_name: String::new(),
            charset: u16::from(if field_type.is_blob() {
                charset::BINARY
            } else {
                charset::DEFAULT_CHARSET
            }),
            column_length: 0,
            field_type,
            flags,
            decimals: 0,
            extended_name: None,
            extended_format: None,
            codec: Codec::Null,
        };
        col.codec = Codec::for_column(&col);
        col
    }

    /// Attach extended type strings (e.g. `VECTOR` / `3,F32`).
    pub fn with_extended(mut self, name: &str, format: Option<&str>) -> Self {
        self.extended_name = Some(name.to_string());
        self.extended_format = format.map(str::to_string);
        self.codec = Codec::for_column(&self);
        self
    }

    /// Parse a column-definition packet (protocol 4.1).
    pub fn parse(data: &[u8], capabilities: u64) -> Result<Self> {
        let malformed = || Error::malformed("truncated column definition");
        let mut reader = PacketReader::new(data);

        let _catalog = reader.read_lenenc_slice().ok_or_else(malformed)?;
        let schema = reader.read_lenenc_string().ok_or_else(malformed)?;
        let table = reader.read_lenenc_string().ok_or_else(malformed)?;
        let org_table = reader.read_lenenc_string().ok_or_else(malformed)?;
        let name = reader.read_lenenc_string().ok_or_else(malformed)?;
        let org_name = reader.read_lenenc_string().ok_or_else(malformed)?;

        let mut extended_name = None;
        let mut extended_format = None;
        if capabilities & EXTENDED_TYPE_INFO != 0 {
            let block = reader.read_lenenc_slice().ok_or_else(malformed)?;
            let mut ext = PacketReader::new(block);
            while !ext.is_empty() {
                let key = ext.read_u8().ok_or_else(malformed)?;
                let value = ext.read_lenenc_string().ok_or_else(malformed)?;
                match key {
                    ext_key::TYPE_NAME => extended_name = Some(value),
                    ext_key::FORMAT => extended_format = Some(value),
                    _ => {}
                }
            }
        }

        let _fixed_len = reader.read_lenenc_int().ok_or_else(malformed)?;
        let charset = reader.read_u16_le().ok_or_else(malformed)?;
        let column_length = reader.read_u32_le().ok_or_else(malformed)?;
        let field_type = FieldType::from_u8(reader.read_u8().ok_or_else(malformed)?);
        let flags = reader.read_u16_le().ok_or_else(malformed)?;
        let decimals = reader.read_u8().ok_or_else(malformed)?;
        reader.skip(2);

        // Vendor extension emitted when extended type metadata is enabled
        // for the session.
        if extended_name.is_none() {
            match reader.read_u8() {
                Some(ext_code::BSON) => extended_name = Some("BSON".to_string()),
                Some(ext_code::VECTOR) => {
                    let dimension = reader.read_u32_le().ok_or_else(malformed)?;
                    let element = reader
                        .read_u8()
                        .and_then(ElementType::from_code)
                        .ok_or_else(|| Error::malformed("unknown vector element type"))?;
                    extended_name = Some("VECTOR".to_string());
                    extended_format = Some(format!("{},{}", dimension, element.name()));
                }
                Some(ext_code::NONE) | None | Some(_) => {}
            }
        }

        let mut col = Self {
            schema,
            table,
            org_table,
            name,
            org_name,
            charset,
            column_length,
            field_type,
            flags,
            decimals,
            extended_name,
            extended_format,
            codec: Codec::Null,
        };
        col.codec = Codec::for_column(&col);
        Ok(col)
    }

    /// Recreate this descriptor with `alias` as its visible name.
    #[must_use]
    pub fn with_alias(&self, alias: &str) -> Self {
        Self {
            name: alias.to_string(),
            ..self.clone()
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Resolve the extended type, if the strings name a known one.
    pub fn extended_type(&self) -> Option<ExtendedType> {
        let name = self.extended_name.as_deref()?;
        if name.eq_ignore_ascii_case("bson") {
            return Some(ExtendedType::Bson);
        }
        if !name.eq_ignore_ascii_case("vector") {
            return None;
        }
        let (dim, elem) = self.extended_format.as_deref()?.split_once(',')?;
        Some(ExtendedType::Vector {
            dimension: dim.trim().parse().ok()?,
            element: ElementType::from_name(elem)?,
        })
    }

    pub const fn is_nullable(&self) -> bool {
        self.flags & column_flags::NOT_NULL == 0
    }

    pub const fn is_primary_key(&self) -> bool {
        self.flags & column_flags::PRIMARY_KEY != 0
    }

    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    pub const fn is_auto_increment(&self) -> bool {
        self.flags & column_flags::AUTO_INCREMENT != 0
    }

    /// String/blob column with the binary collation.
    pub fn is_binary(&self) -> bool {
        self.charset == u16::from(charset::BINARY)
    }

    /// Wire type name used in diagnostics, e.g. `BIGINT UNSIGNED`.
    pub fn type_name(&self) -> String {
        if let Some(ext) = &self.extended_name {
            return match &self.extended_format {
                Some(fmt) => format!("{}({})", ext.to_ascii_uppercase(), fmt),
                None => ext.to_ascii_uppercase(),
            };
        }
        let base = match self.field_type {
            FieldType::Blob | FieldType::TinyBlob | FieldType::MediumBlob | FieldType::LongBlob
                if !self.is_binary() =>
            {
                "TEXT"
            }
            FieldType::VarString | FieldType::VarChar if self.is_binary() => "VARBINARY",
            FieldType::String if self.is_binary() => "BINARY",
            other => other.name(),
        };
        if self.is_unsigned() && self.field_type.is_integer() {
            format!("{} UNSIGNED", base)
        } else {
            base.to_string()
        }
    }
}

/// Shared column list of one result.
pub type Columns = Arc<[ColumnDescriptor]>;

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::PacketWriter;

    /// Encode a column-definition packet the way a server would.
    pub(crate) fn column_packet(
        name: &str,
        field_type: FieldType,
        flags: u16,
        charset: u16,
        trailer: &[u8],
    ) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_lenenc_string("def");
        w.write_lenenc_string("db");
        w.write_lenenc_string("t");
        w.write_lenenc_string("t");
        w.write_lenenc_string(name);
        w.write_lenenc_string(name);
        w.write_lenenc_int(0x0c);
        w.write_u16_le(charset);
        w.write_u32_le(11);
        w.write_u8(field_type as u8);
        w.write_u16_le(flags);
        w.write_u8(0);
        w.write_u16_le(0);
        w.write_bytes(trailer);
        w.into_bytes()
    }

    #[test]
    fn parse_basic_column() {
        let data = column_packet(
            "id",
            FieldType::LongLong,
            column_flags::NOT_NULL | column_flags::UNSIGNED | column_flags::PRIMARY_KEY,
            63,
            &[],
        );
        let col = ColumnDescriptor::parse(&data, 0).unwrap();
        assert_eq!(col.name, "id");
        assert_eq!(col.table, "t");
        assert_eq!(col.field_type, FieldType::LongLong);
        assert!(col.is_unsigned());
        assert!(col.is_primary_key());
        assert!(!col.is_nullable());
        assert_eq!(col.type_name(), "BIGINT UNSIGNED");
        assert_eq!(col.extended_type(), None);
    }

    #[test]
    fn parse_vendor_vector_trailer() {
        let mut trailer = vec![ext_code::VECTOR];
        trailer.extend_from_slice(&3u32.to_le_bytes());
        trailer.push(1);
        let data = column_packet("emb", FieldType::Blob, column_flags::BINARY, 63, &trailer);
        let col = ColumnDescriptor::parse(&data, 0).unwrap();
        assert_eq!(col.extended_format.as_deref(), Some("3,F32"));
        assert_eq!(
            col.extended_type(),
            Some(ExtendedType::Vector {
                dimension: 3,
                element: ElementType::F32
            })
        );
        assert_eq!(
            col.codec(),
            Codec::Vector {
                dimension: 3,
                element: ElementType::F32
            }
        );
    }

    #[test]
    fn parse_extended_type_info_block() {
        let mut w = PacketWriter::new();
        for s in ["def", "db", "t", "t", "doc", "doc"] {
            w.write_lenenc_string(s);
        }
        let mut block = PacketWriter::new();
        block.write_u8(ext_key::TYPE_NAME);
        block.write_lenenc_string("bson");
        w.write_lenenc_bytes(block.as_bytes());
        w.write_lenenc_int(0x0c);
        w.write_u16_le(63);
        w.write_u32_le(0);
        w.write_u8(FieldType::Blob as u8);
        w.write_u16_le(column_flags::BINARY);
        w.write_u8(0);
        w.write_u16_le(0);

        let col = ColumnDescriptor::parse(w.as_bytes(), EXTENDED_TYPE_INFO).unwrap();
        assert_eq!(col.extended_type(), Some(ExtendedType::Bson));
        assert_eq!(col.codec(), Codec::Bson);
    }

    #[test]
    fn alias_keeps_decoding() {
        let col = ColumnDescriptor::new("price", FieldType::NewDecimal, 0);
        let aliased = col.with_alias("p");
        assert_eq!(aliased.name, "p");
        assert_eq!(col.name, "price");
        assert_eq!(aliased.codec(), col.codec());
        assert_eq!(aliased.field_type, col.field_type);
    }

    #[test]
    fn truncated_packet_is_malformed() {
        let data = column_packet("x", FieldType::Long, 0, 45, &[]);
        assert!(ColumnDescriptor::parse(&data[..data.len() - 8], 0).is_err());
    }
}
