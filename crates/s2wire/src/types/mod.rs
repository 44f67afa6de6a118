//! Column type system.
//!
//! - [`FieldType`]: wire type codes (`MYSQL_TYPE_*`)
//! - [`ColumnDescriptor`]: immutable column metadata, with the vendor
//!   extended type (VECTOR / BSON) when the server sends one
//! - [`decode`]: the decoder registry, a match over [`Codec`] producing any
//!   requested target type from text or binary encoding
//! - [`encode`]: binary parameter encoding and client-side interpolation

pub mod column;
pub mod decode;
pub mod encode;
pub mod temporal;

pub use column::{ColumnDescriptor, ExtendedType};
pub use decode::{Codec, FromColumn, decode_value};
pub use temporal::{Date, DateTime, Time};

/// How a row's values are laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Text protocol (COM_QUERY): every value is a length-encoded string.
    Text,
    /// Binary protocol (COM_STMT_EXECUTE): fixed-width or length-prefixed
    /// values with a NULL bitmap.
    Binary,
}

/// Wire type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Parse a field type from a byte. Unknown codes are treated as strings.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 | 0x11 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B | 0x13 => FieldType::Time,
            0x0C | 0x12 => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFF => FieldType::Geometry,
            _ => FieldType::String,
        }
    }

    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    #[must_use]
    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
                | FieldType::NewDate
        )
    }

    #[must_use]
    pub const fn is_blob(self) -> bool {
        matches!(
            self,
            FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
                | FieldType::Geometry
        )
    }

    /// Get the type name as a string.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            FieldType::Decimal | FieldType::NewDecimal => "DECIMAL",
            FieldType::Tiny => "TINYINT",
            FieldType::Short => "SMALLINT",
            FieldType::Long => "INT",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Null => "NULL",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::LongLong => "BIGINT",
            FieldType::Int24 => "MEDIUMINT",
            FieldType::Date | FieldType::NewDate => "DATE",
            FieldType::Time => "TIME",
            FieldType::DateTime => "DATETIME",
            FieldType::Year => "YEAR",
            FieldType::VarChar | FieldType::VarString => "VARCHAR",
            FieldType::Bit => "BIT",
            FieldType::Json => "JSON",
            FieldType::Enum => "ENUM",
            FieldType::Set => "SET",
            FieldType::TinyBlob => "TINYBLOB",
            FieldType::MediumBlob => "MEDIUMBLOB",
            FieldType::LongBlob => "LONGBLOB",
            FieldType::Blob => "BLOB",
            FieldType::String => "CHAR",
            FieldType::Geometry => "GEOMETRY",
        }
    }
}

/// Column flags in result set metadata.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
}

/// Element type of a VECTOR column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    F32,
    F64,
    I8,
    I16,
    I32,
    I64,
}

impl ElementType {
    /// Vendor element code carried in column metadata.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => ElementType::F32,
            2 => ElementType::F64,
            3 => ElementType::I8,
            4 => ElementType::I16,
            5 => ElementType::I32,
            6 => ElementType::I64,
            _ => return None,
        })
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.trim().to_ascii_uppercase().as_str() {
            "F32" => ElementType::F32,
            "F64" => ElementType::F64,
            "I8" => ElementType::I8,
            "I16" => ElementType::I16,
            "I32" => ElementType::I32,
            "I64" => ElementType::I64,
            _ => return None,
        })
    }

    pub const fn name(self) -> &'static str {
        match self {
            ElementType::F32 => "F32",
            ElementType::F64 => "F64",
            ElementType::I8 => "I8",
            ElementType::I16 => "I16",
            ElementType::I32 => "I32",
            ElementType::I64 => "I64",
        }
    }

    /// Size of one element in the binary encoding.
    pub const fn width(self) -> usize {
        match self {
            ElementType::I8 => 1,
            ElementType::I16 => 2,
            ElementType::F32 | ElementType::I32 => 4,
            ElementType::F64 | ElementType::I64 => 8,
        }
    }
}

/// A decoded VECTOR value.
#[derive(Debug, Clone, PartialEq)]
pub enum Vector {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl Vector {
    pub fn len(&self) -> usize {
        match self {
            Vector::F32(v) => v.len(),
            Vector::F64(v) => v.len(),
            Vector::I8(v) => v.len(),
            Vector::I16(v) => v.len(),
            Vector::I32(v) => v.len(),
            Vector::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            Vector::F32(_) => ElementType::F32,
            Vector::F64(_) => ElementType::F64,
            Vector::I8(_) => ElementType::I8,
            Vector::I16(_) => ElementType::I16,
            Vector::I32(_) => ElementType::I32,
            Vector::I64(_) => ElementType::I64,
        }
    }

    /// Elements widened to f64.
    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            Vector::F32(v) => v.iter().map(|&x| f64::from(x)).collect(),
            Vector::F64(v) => v.clone(),
            Vector::I8(v) => v.iter().map(|&x| f64::from(x)).collect(),
            Vector::I16(v) => v.iter().map(|&x| f64::from(x)).collect(),
            Vector::I32(v) => v.iter().map(|&x| f64::from(x)).collect(),
            Vector::I64(v) => v.iter().map(|&x| x as f64).collect(),
        }
    }

    /// Packed little-endian binary form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() * self.element_type().width());
        match self {
            Vector::F32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Vector::F64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Vector::I8(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Vector::I16(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Vector::I32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Vector::I64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
        }
        out
    }
}

impl std::fmt::Display for Vector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn join<T: std::fmt::Display>(f: &mut std::fmt::Formatter<'_>, v: &[T]) -> std::fmt::Result {
            write!(f, "[")?;
            for (i, x) in v.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}", x)?;
            }
            write!(f, "]")
        }
        match self {
            Vector::F32(v) => join(f, v),
            Vector::F64(v) => join(f, v),
            Vector::I8(v) => join(f, v),
            Vector::I16(v) => join(f, v),
            Vector::I32(v) => join(f, v),
            Vector::I64(v) => join(f, v),
        }
    }
}
