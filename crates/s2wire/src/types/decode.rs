//! Column decoder registry.
//!
//! Decoding is two steps. [`Codec::decode`] turns the raw value bytes of one
//! column into a [`Scalar`], the widest faithful representation of the wire
//! value for its encoding (text or binary). [`FromColumn`] then converts the
//! scalar into the representation the caller asked for, failing with
//! `Overflow` on narrowing and `TypeMismatch` on incompatible targets.
//!
//! Integers travel as `i128` between the two steps, so unsigned 64-bit
//! values are never reinterpreted as signed.

use std::ops::Range;

use s2wire_core::Value;
use s2wire_core::error::{DecodeError, DecodeErrorKind};

use crate::protocol::PacketReader;
use crate::types::column::ColumnDescriptor;
use crate::types::{Date, DateTime, ElementType, Encoding, FieldType, Time, Vector};
use crate::types::{ExtendedType, column_flags};

/// Decoding strategy selected once per column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Null,
    /// Fixed-width integer; `width` is the binary-protocol size in bytes.
    Int {
        width: u8,
        unsigned: bool,
    },
    Float,
    Double,
    Decimal,
    Bit,
    Date,
    Time,
    DateTime,
    Json,
    /// Character data
    Text,
    /// Binary strings and blobs
    Bytes,
    Vector {
        dimension: u32,
        element: ElementType,
    },
    Bson,
}

impl Codec {
    /// Pick the codec for a column from its wire type, flags and extended type.
    pub fn for_column(col: &ColumnDescriptor) -> Self {
        match col.extended_type() {
            Some(ExtendedType::Vector { dimension, element }) => {
                return Codec::Vector { dimension, element };
            }
            Some(ExtendedType::Bson) => return Codec::Bson,
            None => {}
        }
        let unsigned = col.flags & column_flags::UNSIGNED != 0;
        match col.field_type {
            FieldType::Null => Codec::Null,
            FieldType::Tiny => Codec::Int { width: 1, unsigned },
            FieldType::Short => Codec::Int { width: 2, unsigned },
            FieldType::Year => Codec::Int {
                width: 2,
                unsigned: true,
            },
            FieldType::Int24 | FieldType::Long => Codec::Int { width: 4, unsigned },
            FieldType::LongLong => Codec::Int { width: 8, unsigned },
            FieldType::Float => Codec::Float,
            FieldType::Double => Codec::Double,
            FieldType::Decimal | FieldType::NewDecimal => Codec::Decimal,
            FieldType::Bit => Codec::Bit,
            FieldType::Date | FieldType::NewDate => Codec::Date,
            FieldType::Time => Codec::Time,
            FieldType::DateTime | FieldType::Timestamp => Codec::DateTime,
            FieldType::Json => Codec::Json,
            FieldType::Geometry => Codec::Bytes,
            FieldType::Enum | FieldType::Set => Codec::Text,
            FieldType::TinyBlob
            | FieldType::MediumBlob
            | FieldType::LongBlob
            | FieldType::Blob
            | FieldType::VarString
            | FieldType::VarChar
            | FieldType::String => {
                if col.is_binary() {
                    Codec::Bytes
                } else {
                    Codec::Text
                }
            }
        }
    }

    /// Size of the value in a binary row, or `None` for length-encoded values.
    pub const fn binary_width(self) -> Option<usize> {
        match self {
            Codec::Null => Some(0),
            Codec::Int { width, .. } => Some(width as usize),
            Codec::Float => Some(4),
            Codec::Double => Some(8),
            _ => None,
        }
    }

    /// Decode raw value bytes. `Ok(None)` means the value reads as SQL NULL
    /// (NULL-typed columns and zero dates).
    pub fn decode<'a>(
        self,
        raw: &'a [u8],
        encoding: Encoding,
        col: &ColumnDescriptor,
    ) -> Result<Option<Scalar<'a>>, DecodeError> {
        let malformed = |msg: String| {
            DecodeError::new(DecodeErrorKind::Malformed, col.type_name(), "raw", msg)
        };
        let text = || std::str::from_utf8(raw).map_err(|e| malformed(e.to_string()));

        let scalar = match (self, encoding) {
            (Codec::Null, _) => return Ok(None),

            (Codec::Int { width, unsigned }, Encoding::Binary) => {
                if raw.len() != usize::from(width) {
                    return Err(malformed(format!(
                        "expected {} bytes, found {}",
                        width,
                        raw.len()
                    )));
                }
                Scalar::Int(binary_int(raw, unsigned))
            }
            (Codec::Int { .. }, Encoding::Text) => {
                let s = text()?.trim();
                Scalar::Int(s.parse().map_err(|_| malformed(format!("invalid integer '{}'", s)))?)
            }

            (Codec::Float, Encoding::Binary) => {
                let bytes: [u8; 4] = raw
                    .try_into()
                    .map_err(|_| malformed(format!("FLOAT of {} bytes", raw.len())))?;
                Scalar::Float(f32::from_le_bytes(bytes))
            }
            (Codec::Double, Encoding::Binary) => {
                let bytes: [u8; 8] = raw
                    .try_into()
                    .map_err(|_| malformed(format!("DOUBLE of {} bytes", raw.len())))?;
                Scalar::Double(f64::from_le_bytes(bytes))
            }
            (Codec::Float, Encoding::Text) => {
                let s = text()?.trim();
                Scalar::Float(s.parse().map_err(|_| malformed(format!("invalid float '{}'", s)))?)
            }
            (Codec::Double, Encoding::Text) => {
                let s = text()?.trim();
                Scalar::Double(s.parse().map_err(|_| malformed(format!("invalid double '{}'", s)))?)
            }

            (Codec::Decimal, _) => Scalar::Decimal(text()?),
            (Codec::Text, _) => Scalar::Text(text()?),
            (Codec::Json, _) => Scalar::Json(text()?),
            (Codec::Bytes, _) => Scalar::Bytes(raw),
            (Codec::Bson, _) => Scalar::Bson(raw),

            (Codec::Bit, _) => {
                if raw.len() > 8 {
                    return Err(malformed(format!("BIT value of {} bytes", raw.len())));
                }
                Scalar::Bit(raw.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
            }

            (Codec::Date, Encoding::Text) => match Date::parse(text()?).map_err(malformed)? {
                Some(d) => Scalar::Date(d),
                None => return Ok(None),
            },
            (Codec::Date, Encoding::Binary) => match DateTime::from_binary(raw).map_err(malformed)? {
                Some(dt) => Scalar::Date(dt.date),
                None => return Ok(None),
            },
            (Codec::Time, Encoding::Text) => Scalar::Time(Time::parse(text()?).map_err(malformed)?),
            (Codec::Time, Encoding::Binary) => Scalar::Time(Time::from_binary(raw).map_err(malformed)?),
            (Codec::DateTime, Encoding::Text) => {
                match DateTime::parse(text()?).map_err(malformed)? {
                    Some(dt) => Scalar::DateTime(dt),
                    None => return Ok(None),
                }
            }
            (Codec::DateTime, Encoding::Binary) => {
                match DateTime::from_binary(raw).map_err(malformed)? {
                    Some(dt) => Scalar::DateTime(dt),
                    None => return Ok(None),
                }
            }

            (Codec::Vector { dimension, element }, encoding) => {
                let packed = raw.len() % element.width() == 0
                    && (dimension == 0 || raw.len() == dimension as usize * element.width());
                let vector = if raw.first() == Some(&b'[')
                    && (encoding == Encoding::Text || !packed)
                {
                    parse_vector(text()?, element).map_err(malformed)?
                } else if packed {
                    unpack_vector(raw, element)
                } else {
                    return Err(malformed(format!(
                        "{} bytes is not a VECTOR({},{})",
                        raw.len(),
                        dimension,
                        element.name()
                    )));
                };
                if dimension != 0 && vector.len() != dimension as usize {
                    return Err(malformed(format!(
                        "vector of {} elements, column dimension is {}",
                        vector.len(),
                        dimension
                    )));
                }
                Scalar::Vector(vector)
            }
        };
        Ok(Some(scalar))
    }
}

/// Sign- or zero-extend a little-endian integer.
fn binary_int(raw: &[u8], unsigned: bool) -> i128 {
    let mut buf = [0u8; 16];
    buf[..raw.len()].copy_from_slice(raw);
    let negative = !unsigned && raw.last().is_some_and(|b| b & 0x80 != 0);
    if negative {
        buf[raw.len()..].fill(0xFF);
    }
    i128::from_le_bytes(buf)
}

fn unpack_vector(raw: &[u8], element: ElementType) -> Vector {
    macro_rules! unpack {
        ($variant:ident, $t:ty) => {{
            const N: usize = std::mem::size_of::<$t>();
            Vector::$variant(
                raw.chunks_exact(N)
                    .map(|c| {
                        let mut b = [0u8; N];
                        b.copy_from_slice(c);
                        <$t>::from_le_bytes(b)
                    })
                    .collect(),
            )
        }};
    }
    match element {
        ElementType::F32 => unpack!(F32, f32),
        ElementType::F64 => unpack!(F64, f64),
        ElementType::I8 => unpack!(I8, i8),
        ElementType::I16 => unpack!(I16, i16),
        ElementType::I32 => unpack!(I32, i32),
        ElementType::I64 => unpack!(I64, i64),
    }
}

/// Parse the JSON-array text form, e.g. `[1.5,2,3]`.
fn parse_vector(text: &str, element: ElementType) -> Result<Vector, String> {
    let body = text
        .trim()
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| format!("invalid vector '{}'", text))?;
    let items: Vec<&str> = if body.trim().is_empty() {
        Vec::new()
    } else {
        body.split(',').map(str::trim).collect()
    };
    macro_rules! parse_all {
        ($variant:ident, $t:ty) => {
            Vector::$variant(
                items
                    .iter()
                    .map(|s| s.parse::<$t>().map_err(|_| format!("invalid element '{}'", s)))
                    .collect::<Result<_, _>>()?,
            )
        };
    }
    Ok(match element {
        ElementType::F32 => parse_all!(F32, f32),
        ElementType::F64 => parse_all!(F64, f64),
        ElementType::I8 => parse_all!(I8, i8),
        ElementType::I16 => parse_all!(I16, i16),
        ElementType::I32 => parse_all!(I32, i32),
        ElementType::I64 => parse_all!(I64, i64),
    })
}

/// Intermediate decoded value, borrowing from the row buffer where it can.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar<'a> {
    Int(i128),
    Float(f32),
    Double(f64),
    Decimal(&'a str),
    Text(&'a str),
    Bytes(&'a [u8]),
    Bit(u64),
    Date(Date),
    Time(Time),
    DateTime(DateTime),
    Json(&'a str),
    Vector(Vector),
    Bson(&'a [u8]),
}

/// A representation a column value can be decoded into.
pub trait FromColumn: Sized {
    /// Target name used in decode errors.
    const TARGET: &'static str;

    fn from_scalar(scalar: Scalar<'_>, col: &ColumnDescriptor) -> Result<Self, DecodeError>;
}

/// Decode one column value into `T`. `raw` is `None` for SQL NULL.
pub fn decode_value<T: FromColumn>(
    col: &ColumnDescriptor,
    encoding: Encoding,
    raw: Option<&[u8]>,
) -> Result<Option<T>, DecodeError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let decoded = col
        .codec()
        .decode(raw, encoding, col)
        .and_then(|scalar| scalar.map(|s| T::from_scalar(s, col)).transpose());
    decoded.map_err(|mut e| {
        if e.target == "raw" {
            e.target = T::TARGET;
        }
        e.in_column(&col.name)
    })
}

fn mismatch(col: &ColumnDescriptor, target: &'static str) -> DecodeError {
    let wire = col.type_name();
    let message = format!("cannot decode {} as {}", wire, target);
    DecodeError::new(DecodeErrorKind::TypeMismatch, wire, target, message)
}

fn overflow(col: &ColumnDescriptor, target: &'static str, value: impl std::fmt::Display) -> DecodeError {
    let message = format!("value {} out of range for {}", value, target);
    DecodeError::new(DecodeErrorKind::Overflow, col.type_name(), target, message)
}

fn malformed(col: &ColumnDescriptor, target: &'static str, message: String) -> DecodeError {
    DecodeError::new(DecodeErrorKind::Malformed, col.type_name(), target, message)
}

fn float_to_int(v: f64, col: &ColumnDescriptor, target: &'static str) -> Result<i128, DecodeError> {
    if !v.is_finite() {
        return Err(overflow(col, target, v));
    }
    // Saturates for huge magnitudes, which the target range check rejects.
    Ok(v.trunc() as i128)
}

fn parse_integral(s: &str, col: &ColumnDescriptor, target: &'static str) -> Result<i128, DecodeError> {
    let s = s.trim();
    if let Ok(v) = s.parse::<i128>() {
        return Ok(v);
    }
    match s.parse::<f64>() {
        Ok(v) => float_to_int(v, col, target),
        Err(_) => Err(malformed(col, target, format!("'{}' is not a number", s))),
    }
}

fn integral(scalar: Scalar<'_>, col: &ColumnDescriptor, target: &'static str) -> Result<i128, DecodeError> {
    match scalar {
        Scalar::Int(v) => Ok(v),
        Scalar::Bit(v) => Ok(i128::from(v)),
        Scalar::Float(v) => float_to_int(f64::from(v), col, target),
        Scalar::Double(v) => float_to_int(v, col, target),
        Scalar::Decimal(s) | Scalar::Text(s) => parse_integral(s, col, target),
        _ => Err(mismatch(col, target)),
    }
}

fn real(scalar: Scalar<'_>, col: &ColumnDescriptor, target: &'static str) -> Result<f64, DecodeError> {
    match scalar {
        Scalar::Int(v) => Ok(v as f64),
        Scalar::Bit(v) => Ok(v as f64),
        Scalar::Float(v) => Ok(f64::from(v)),
        Scalar::Double(v) => Ok(v),
        Scalar::Decimal(s) | Scalar::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| malformed(col, target, format!("'{}' is not a number", s))),
        _ => Err(mismatch(col, target)),
    }
}

macro_rules! int_target {
    ($($t:ty),* $(,)?) => {$(
        impl FromColumn for $t {
            const TARGET: &'static str = stringify!($t);

            fn from_scalar(scalar: Scalar<'_>, col: &ColumnDescriptor) -> Result<Self, DecodeError> {
                let wide = integral(scalar, col, Self::TARGET)?;
                <$t>::try_from(wide).map_err(|_| overflow(col, Self::TARGET, wide))
            }
        }
    )*};
}

int_target!(i8, i16, i32, i64, u8, u16, u32, u64);

impl FromColumn for bool {
    const TARGET: &'static str = "bool";

    fn from_scalar(scalar: Scalar<'_>, col: &ColumnDescriptor) -> Result<Self, DecodeError> {
        match scalar {
            Scalar::Int(v) => Ok(v != 0),
            Scalar::Bit(v) => Ok(v != 0),
            Scalar::Float(v) => Ok(v != 0.0),
            Scalar::Double(v) => Ok(v != 0.0),
            Scalar::Decimal(s) | Scalar::Text(s) => {
                let s = s.trim();
                if s.is_empty() || s == "0" || s.eq_ignore_ascii_case("false") {
                    Ok(false)
                } else if s == "1" || s.eq_ignore_ascii_case("true") {
                    Ok(true)
                } else {
                    s.parse::<f64>()
                        .map(|v| v != 0.0)
                        .map_err(|_| malformed(col, Self::TARGET, format!("'{}' is not a boolean", s)))
                }
            }
            _ => Err(mismatch(col, Self::TARGET)),
        }
    }
}

impl FromColumn for f64 {
    const TARGET: &'static str = "f64";

    fn from_scalar(scalar: Scalar<'_>, col: &ColumnDescriptor) -> Result<Self, DecodeError> {
        real(scalar, col, Self::TARGET)
    }
}

impl FromColumn for f32 {
    const TARGET: &'static str = "f32";

    fn from_scalar(scalar: Scalar<'_>, col: &ColumnDescriptor) -> Result<Self, DecodeError> {
        if let Scalar::Float(v) = scalar {
            return Ok(v);
        }
        let v = real(scalar, col, Self::TARGET)?;
        if v.is_finite() && v.abs() > f64::from(f32::MAX) {
            return Err(overflow(col, Self::TARGET, v));
        }
        Ok(v as f32)
    }
}

impl FromColumn for String {
    const TARGET: &'static str = "String";

    fn from_scalar(scalar: Scalar<'_>, col: &ColumnDescriptor) -> Result<Self, DecodeError> {
        Ok(match scalar {
            Scalar::Int(v) => v.to_string(),
            Scalar::Float(v) => v.to_string(),
            Scalar::Double(v) => v.to_string(),
            Scalar::Bit(v) => v.to_string(),
            Scalar::Decimal(s) | Scalar::Text(s) | Scalar::Json(s) => s.to_string(),
            Scalar::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Scalar::Date(d) => d.to_string(),
            Scalar::Time(t) => t.to_string(),
            Scalar::DateTime(dt) => dt.to_string(),
            Scalar::Vector(v) => v.to_string(),
            Scalar::Bson(_) => return Err(mismatch(col, Self::TARGET)),
        })
    }
}

impl FromColumn for Vec<u8> {
    const TARGET: &'static str = "bytes";

    fn from_scalar(scalar: Scalar<'_>, col: &ColumnDescriptor) -> Result<Self, DecodeError> {
        match scalar {
            Scalar::Bytes(b) | Scalar::Bson(b) => Ok(b.to_vec()),
            Scalar::Decimal(s) | Scalar::Text(s) | Scalar::Json(s) => Ok(s.as_bytes().to_vec()),
            Scalar::Bit(v) => {
                let n = (col.column_length as usize).div_ceil(8).clamp(1, 8);
                Ok(v.to_be_bytes()[8 - n..].to_vec())
            }
            Scalar::Vector(v) => Ok(v.to_bytes()),
            _ => Err(mismatch(col, Self::TARGET)),
        }
    }
}

impl FromColumn for Date {
    const TARGET: &'static str = "Date";

    fn from_scalar(scalar: Scalar<'_>, col: &ColumnDescriptor) -> Result<Self, DecodeError> {
        match scalar {
            Scalar::Date(d) => Ok(d),
            Scalar::DateTime(dt) => Ok(dt.date),
            Scalar::Text(s) => Date::parse(s)
                .map_err(|e| malformed(col, Self::TARGET, e))?
                .ok_or_else(|| malformed(col, Self::TARGET, "zero date".to_string())),
            _ => Err(mismatch(col, Self::TARGET)),
        }
    }
}

impl FromColumn for Time {
    const TARGET: &'static str = "Time";

    fn from_scalar(scalar: Scalar<'_>, col: &ColumnDescriptor) -> Result<Self, DecodeError> {
        match scalar {
            Scalar::Time(t) => Ok(t),
            Scalar::DateTime(dt) => Ok(Time {
                negative: false,
                hours: u32::from(dt.hour),
                minutes: dt.minute,
                seconds: dt.second,
                micros: dt.micros,
            }),
            Scalar::Text(s) => Time::parse(s).map_err(|e| malformed(col, Self::TARGET, e)),
            _ => Err(mismatch(col, Self::TARGET)),
        }
    }
}

impl FromColumn for DateTime {
    const TARGET: &'static str = "DateTime";

    fn from_scalar(scalar: Scalar<'_>, col: &ColumnDescriptor) -> Result<Self, DecodeError> {
        match scalar {
            Scalar::DateTime(dt) => Ok(dt),
            Scalar::Date(date) => Ok(DateTime {
                date,
                hour: 0,
                minute: 0,
                second: 0,
                micros: 0,
            }),
            Scalar::Text(s) => DateTime::parse(s)
                .map_err(|e| malformed(col, Self::TARGET, e))?
                .ok_or_else(|| malformed(col, Self::TARGET, "zero datetime".to_string())),
            _ => Err(mismatch(col, Self::TARGET)),
        }
    }
}

impl FromColumn for uuid::Uuid {
    const TARGET: &'static str = "Uuid";

    fn from_scalar(scalar: Scalar<'_>, col: &ColumnDescriptor) -> Result<Self, DecodeError> {
        match scalar {
            Scalar::Text(s) => {
                uuid::Uuid::parse_str(s.trim()).map_err(|e| malformed(col, Self::TARGET, e.to_string()))
            }
            Scalar::Bytes(b) if b.len() == 16 => {
                uuid::Uuid::from_slice(b).map_err(|e| malformed(col, Self::TARGET, e.to_string()))
            }
            Scalar::Bytes(b) => std::str::from_utf8(b)
                .ok()
                .and_then(|s| uuid::Uuid::parse_str(s.trim()).ok())
                .ok_or_else(|| malformed(col, Self::TARGET, format!("{} bytes is not a UUID", b.len()))),
            _ => Err(mismatch(col, Self::TARGET)),
        }
    }
}

impl FromColumn for Vector {
    const TARGET: &'static str = "Vector";

    fn from_scalar(scalar: Scalar<'_>, col: &ColumnDescriptor) -> Result<Self, DecodeError> {
        match scalar {
            Scalar::Vector(v) => Ok(v),
            _ => Err(mismatch(col, Self::TARGET)),
        }
    }
}

impl FromColumn for serde_json::Value {
    const TARGET: &'static str = "json";

    fn from_scalar(scalar: Scalar<'_>, col: &ColumnDescriptor) -> Result<Self, DecodeError> {
        match scalar {
            Scalar::Json(s) | Scalar::Text(s) => {
                serde_json::from_str(s).map_err(|e| malformed(col, Self::TARGET, e.to_string()))
            }
            Scalar::Int(v) => i64::try_from(v)
                .map(serde_json::Value::from)
                .or_else(|_| u64::try_from(v).map(serde_json::Value::from))
                .map_err(|_| overflow(col, Self::TARGET, v)),
            Scalar::Double(v) => Ok(serde_json::Value::from(v)),
            Scalar::Float(v) => Ok(serde_json::Value::from(f64::from(v))),
            _ => Err(mismatch(col, Self::TARGET)),
        }
    }
}

impl FromColumn for Value {
    const TARGET: &'static str = "Value";

    fn from_scalar(scalar: Scalar<'_>, col: &ColumnDescriptor) -> Result<Self, DecodeError> {
        Ok(match scalar {
            Scalar::Int(v) => int_value(v, col.codec())
                .ok_or_else(|| overflow(col, Self::TARGET, v))?,
            Scalar::Float(v) => Value::Float(v),
            Scalar::Double(v) => Value::Double(v),
            Scalar::Decimal(s) => Value::Decimal(s.to_string()),
            Scalar::Text(s) => Value::Text(s.to_string()),
            Scalar::Bytes(b) | Scalar::Bson(b) => Value::Bytes(b.to_vec()),
            Scalar::Bit(v) => Value::from(v),
            Scalar::Date(d) => Value::Date(d.days_since_epoch()),
            Scalar::Time(t) => Value::Time(t.total_micros()),
            Scalar::DateTime(dt) => Value::Timestamp(dt.micros_since_epoch()),
            Scalar::Json(s) => Value::Json(
                serde_json::from_str(s).map_err(|e| malformed(col, Self::TARGET, e.to_string()))?,
            ),
            Scalar::Vector(v) => Value::Array(match v {
                Vector::F32(v) => v.into_iter().map(Value::Float).collect(),
                Vector::F64(v) => v.into_iter().map(Value::Double).collect(),
                Vector::I8(v) => v.into_iter().map(Value::TinyInt).collect(),
                Vector::I16(v) => v.into_iter().map(Value::SmallInt).collect(),
                Vector::I32(v) => v.into_iter().map(Value::Int).collect(),
                Vector::I64(v) => v.into_iter().map(Value::BigInt).collect(),
            }),
        })
    }
}

/// Narrowest `Value` variant that can hold every value of the column type.
fn int_value(v: i128, codec: Codec) -> Option<Value> {
    let Codec::Int { width, unsigned } = codec else {
        return i64::try_from(v)
            .map(Value::BigInt)
            .or_else(|_| u64::try_from(v).map(Value::UnsignedBigInt))
            .ok();
    };
    Some(match (width, unsigned) {
        (1, false) => Value::TinyInt(i8::try_from(v).ok()?),
        (1, true) | (2, false) => Value::SmallInt(i16::try_from(v).ok()?),
        (2, true) | (4, false) => Value::Int(i32::try_from(v).ok()?),
        _ => match i64::try_from(v) {
            Ok(v) => Value::BigInt(v),
            Err(_) => Value::UnsignedBigInt(u64::try_from(v).ok()?),
        },
    })
}

/// Locate every value of a text-protocol row. `None` marks SQL NULL.
pub(crate) fn text_row_ranges(
    payload: &[u8],
    columns: usize,
) -> s2wire_core::Result<Vec<Option<Range<usize>>>> {
    let mut reader = PacketReader::new(payload);
    let mut ranges = Vec::with_capacity(columns);
    for _ in 0..columns {
        if reader.peek() == Some(0xFB) {
            reader.skip(1);
            ranges.push(None);
            continue;
        }
        let len = reader
            .read_lenenc_int()
            .ok_or_else(|| s2wire_core::Error::malformed("truncated text row"))?;
        let start = reader.position();
        if !reader.skip(len as usize) {
            return Err(s2wire_core::Error::malformed("text row value exceeds packet"));
        }
        ranges.push(Some(start..reader.position()));
    }
    Ok(ranges)
}

/// Locate every value of a binary-protocol row.
///
/// Layout: 0x00 header, NULL bitmap with a 2-bit offset, then the non-NULL
/// values in column order.
pub(crate) fn binary_row_ranges(
    payload: &[u8],
    columns: &[ColumnDescriptor],
) -> s2wire_core::Result<Vec<Option<Range<usize>>>> {
    let truncated = || s2wire_core::Error::malformed("truncated binary row");
    let mut reader = PacketReader::new(payload);
    if reader.read_u8() != Some(0x00) {
        return Err(s2wire_core::Error::malformed("binary row must start with 0x00"));
    }
    let bitmap = reader.read_bytes((columns.len() + 7 + 2) / 8).ok_or_else(truncated)?;

    let mut ranges = Vec::with_capacity(columns.len());
    for (i, col) in columns.iter().enumerate() {
        let bit = i + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            ranges.push(None);
            continue;
        }
        let len = match col.codec().binary_width() {
            Some(width) => width,
            None => reader.read_lenenc_int().ok_or_else(truncated)? as usize,
        };
        let start = reader.position();
        if !reader.skip(len) {
            return Err(truncated());
        }
        ranges.push(Some(start..reader.position()));
    }
    Ok(ranges)
}
