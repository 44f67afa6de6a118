//! Parameter encoding.
//!
//! - binary protocol: the COM_STMT_EXECUTE payload, typed per parameter,
//!   with large values moved out to COM_STMT_SEND_LONG_DATA
//! - text protocol: client-side interpolation of `?` placeholders with
//!   escaped literals, used when server-side prepare is off

use s2wire_core::{Error, Result, Value};

use crate::protocol::{Command, PacketReader, PacketWriter};
use crate::types::{Date, DateTime, FieldType, Time};

/// Parameters at least this large are streamed as long data.
pub const LONG_DATA_THRESHOLD: usize = 1 << 20;

/// COM_STMT_EXECUTE flag: no server-side cursor.
const CURSOR_TYPE_NO_CURSOR: u8 = 0x00;

/// Response to COM_STMT_PREPARE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtPrepareOk {
    pub statement_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
    pub warnings: u16,
}

/// Parse a COM_STMT_PREPARE_OK payload.
///
/// Layout: 0x00, statement id (4), columns (2), params (2), filler (1),
/// warnings (2).
pub fn parse_prepare_ok(data: &[u8]) -> Result<StmtPrepareOk> {
    let malformed = || Error::malformed("truncated COM_STMT_PREPARE_OK");
    let mut reader = PacketReader::new(data);
    if reader.read_u8() != Some(0x00) {
        return Err(Error::malformed("COM_STMT_PREPARE_OK must start with 0x00"));
    }
    let statement_id = reader.read_u32_le().ok_or_else(malformed)?;
    let num_columns = reader.read_u16_le().ok_or_else(malformed)?;
    let num_params = reader.read_u16_le().ok_or_else(malformed)?;
    reader.skip(1);
    let warnings = reader.read_u16_le().unwrap_or(0);
    Ok(StmtPrepareOk {
        statement_id,
        num_columns,
        num_params,
        warnings,
    })
}

/// Wire type and unsigned flag announced for a parameter.
pub fn param_type(value: &Value) -> (FieldType, bool) {
    let field_type = match value {
        Value::Null => FieldType::Null,
        Value::Bool(_) | Value::TinyInt(_) => FieldType::Tiny,
        Value::SmallInt(_) => FieldType::Short,
        Value::Int(_) => FieldType::Long,
        Value::BigInt(_) | Value::UnsignedBigInt(_) => FieldType::LongLong,
        Value::Float(_) => FieldType::Float,
        Value::Double(_) => FieldType::Double,
        Value::Decimal(_) => FieldType::NewDecimal,
        Value::Text(_) | Value::Array(_) => FieldType::VarString,
        Value::Bytes(_) | Value::Uuid(_) => FieldType::Blob,
        Value::Json(_) => FieldType::Json,
        Value::Date(_) => FieldType::Date,
        Value::Time(_) => FieldType::Time,
        Value::Timestamp(_) => FieldType::DateTime,
    };
    (field_type, matches!(value, Value::UnsignedBigInt(_)))
}

/// Whether a parameter is sent through COM_STMT_SEND_LONG_DATA.
pub fn is_long_data(value: &Value) -> bool {
    match value {
        Value::Bytes(b) => b.len() >= LONG_DATA_THRESHOLD,
        Value::Text(s) => s.len() >= LONG_DATA_THRESHOLD,
        _ => false,
    }
}

/// Raw bytes of a long-data parameter.
pub fn long_data_bytes(value: &Value) -> &[u8] {
    match value {
        Value::Bytes(b) => b,
        Value::Text(s) => s.as_bytes(),
        _ => &[],
    }
}

/// One COM_STMT_SEND_LONG_DATA chunk. The server sends no response.
pub fn encode_long_data(statement_id: u32, param_index: u16, chunk: &[u8]) -> Vec<u8> {
    let mut w = PacketWriter::with_capacity(7 + chunk.len());
    w.write_u8(Command::StmtSendLongData as u8);
    w.write_u32_le(statement_id);
    w.write_u16_le(param_index);
    w.write_bytes(chunk);
    w.into_bytes()
}

/// Build a COM_STMT_EXECUTE payload.
///
/// Parameters that were streamed as long data keep their type entry but
/// contribute no value bytes.
pub fn encode_execute(statement_id: u32, params: &[Value]) -> Vec<u8> {
    let mut w = PacketWriter::with_capacity(16 + params.len() * 16);
    w.write_u8(Command::StmtExecute as u8);
    w.write_u32_le(statement_id);
    w.write_u8(CURSOR_TYPE_NO_CURSOR);
    w.write_u32_le(1);

    if params.is_empty() {
        return w.into_bytes();
    }

    let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
    for (i, param) in params.iter().enumerate() {
        if param.is_null() {
            null_bitmap[i / 8] |= 1 << (i % 8);
        }
    }
    w.write_bytes(&null_bitmap);

    // new-params-bound: types follow
    w.write_u8(1);
    for param in params {
        let (field_type, unsigned) = param_type(param);
        w.write_u8(field_type as u8);
        w.write_u8(if unsigned { 0x80 } else { 0x00 });
    }

    for param in params {
        if !param.is_null() && !is_long_data(param) {
            encode_binary_param(&mut w, param);
        }
    }
    w.into_bytes()
}

/// COM_STMT_CLOSE payload. The server sends no response.
pub fn encode_stmt_close(statement_id: u32) -> Vec<u8> {
    let mut w = PacketWriter::command(Command::StmtClose);
    w.write_u32_le(statement_id);
    w.into_bytes()
}

fn encode_binary_param(w: &mut PacketWriter, value: &Value) {
    match value {
        Value::Null => {}
        Value::Bool(b) => w.write_u8(u8::from(*b)),
        Value::TinyInt(i) => w.write_u8(*i as u8),
        Value::SmallInt(i) => w.write_u16_le(*i as u16),
        Value::Int(i) => w.write_u32_le(*i as u32),
        Value::BigInt(i) => w.write_u64_le(*i as u64),
        Value::UnsignedBigInt(u) => w.write_u64_le(*u),
        Value::Float(f) => w.write_bytes(&f.to_le_bytes()),
        Value::Double(f) => w.write_bytes(&f.to_le_bytes()),
        Value::Decimal(s) | Value::Text(s) => w.write_lenenc_string(s),
        Value::Bytes(b) => w.write_lenenc_bytes(b),
        Value::Uuid(u) => w.write_lenenc_bytes(u),
        Value::Json(j) => w.write_lenenc_string(&j.to_string()),
        Value::Array(items) => w.write_lenenc_string(&array_literal(items)),
        Value::Date(days) => {
            let mut out = Vec::with_capacity(5);
            DateTime {
                date: Date::from_days_since_epoch(*days),
                hour: 0,
                minute: 0,
                second: 0,
                micros: 0,
            }
            .write_binary(&mut out);
            w.write_bytes(&out);
        }
        Value::Time(micros) => {
            let mut out = Vec::with_capacity(13);
            Time::from_micros(*micros).write_binary(&mut out);
            w.write_bytes(&out);
        }
        Value::Timestamp(micros) => {
            let mut out = Vec::with_capacity(12);
            DateTime::from_micros_since_epoch(*micros).write_binary(&mut out);
            w.write_bytes(&out);
        }
    }
}

/// Text form of an array parameter: `[1,2.5,3]` for numeric arrays (the
/// VECTOR literal), JSON otherwise.
fn array_literal(items: &[Value]) -> String {
    let numeric: Option<Vec<String>> = items
        .iter()
        .map(|v| match v {
            Value::TinyInt(_) | Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_) => {
                v.as_i64().map(|i| i.to_string())
            }
            Value::UnsignedBigInt(u) => Some(u.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Double(f) => Some(f.to_string()),
            _ => None,
        })
        .collect();
    match numeric {
        Some(parts) => format!("[{}]", parts.join(",")),
        None => serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string()),
    }
}

/// Quote and escape a string literal.
fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        match ch {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x1a' => out.push_str("\\Z"),
            _ => out.push(ch),
        }
    }
    out.push('\'');
    out
}

fn escape_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2 + 3);
    out.push_str("X'");
    for byte in data {
        out.push_str(&format!("{byte:02X}"));
    }
    out.push('\'');
    out
}

fn float_literal(v: f64) -> String {
    if v.is_nan() {
        "NULL".to_string()
    } else if v.is_infinite() {
        if v.is_sign_positive() { "1e308" } else { "-1e308" }.to_string()
    } else {
        v.to_string()
    }
}

/// Render a value as a SQL literal.
pub fn format_value_for_sql(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::TinyInt(i) => i.to_string(),
        Value::SmallInt(i) => i.to_string(),
        Value::Int(i) => i.to_string(),
        Value::BigInt(i) => i.to_string(),
        Value::UnsignedBigInt(u) => u.to_string(),
        Value::Float(f) => float_literal(f64::from(*f)),
        Value::Double(f) => float_literal(*f),
        Value::Decimal(s) => escape_string(s),
        Value::Text(s) => escape_string(s),
        Value::Bytes(b) => escape_bytes(b),
        Value::Uuid(u) => escape_bytes(u),
        Value::Json(j) => escape_string(&j.to_string()),
        Value::Array(items) => escape_string(&array_literal(items)),
        Value::Date(days) => format!("'{}'", Date::from_days_since_epoch(*days)),
        Value::Time(micros) => format!("'{}'", Time::from_micros(*micros)),
        Value::Timestamp(micros) => format!("'{}'", DateTime::from_micros_since_epoch(*micros)),
    }
}

/// Walk `sql`, handing each `?` placeholder outside quoted strings, quoted
/// identifiers and comments to `placeholder` along with its index.
fn scan_placeholders<F>(sql: &str, mut placeholder: F) -> Result<(String, usize)>
where
    F: FnMut(usize, &mut String) -> Result<()>,
{
    let mut out = String::with_capacity(sql.len() + 16);
    let mut chars = sql.chars().peekable();
    let mut count = 0;

    while let Some(ch) = chars.next() {
        match ch {
            '?' => {
                placeholder(count, &mut out)?;
                count += 1;
            }
            '\'' | '"' | '`' => {
                out.push(ch);
                while let Some(c) = chars.next() {
                    out.push(c);
                    if c == '\\' && ch != '`' {
                        if let Some(escaped) = chars.next() {
                            out.push(escaped);
                        }
                    } else if c == ch {
                        if chars.peek() == Some(&ch) {
                            out.push(ch);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
            }
            '#' => {
                out.push(ch);
                for c in chars.by_ref() {
                    out.push(c);
                    if c == '\n' {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                out.push(ch);
                for c in chars.by_ref() {
                    out.push(c);
                    if c == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                out.push(ch);
                let mut prev = '\0';
                for c in chars.by_ref() {
                    out.push(c);
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            _ => out.push(ch),
        }
    }
    Ok((out, count))
}

/// Replace `?` placeholders with escaped literals. The number of
/// placeholders must match `params`.
pub fn interpolate_params(sql: &str, params: &[Value]) -> Result<String> {
    let (out, count) = scan_placeholders(sql, |i, out| {
        let value = params.get(i).ok_or_else(|| {
            Error::Custom(format!(
                "statement has more placeholders than the {} supplied parameters",
                params.len()
            ))
        })?;
        out.push_str(&format_value_for_sql(value));
        Ok(())
    })?;
    if count != params.len() {
        return Err(Error::Custom(format!(
            "statement has {} placeholders but {} parameters were supplied",
            count,
            params.len()
        )));
    }
    Ok(out)
}

/// Count `?` placeholders outside literals and comments.
pub fn count_placeholders(sql: &str) -> usize {
    scan_placeholders(sql, |_, _| Ok(())).map_or(0, |(_, count)| count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_ok_parses() {
        let data = [0x00, 7, 0, 0, 0, 2, 0, 3, 0, 0, 1, 0];
        let ok = parse_prepare_ok(&data).unwrap();
        assert_eq!(ok.statement_id, 7);
        assert_eq!(ok.num_columns, 2);
        assert_eq!(ok.num_params, 3);
        assert_eq!(ok.warnings, 1);
        assert!(parse_prepare_ok(&data[..4]).is_err());
        assert!(parse_prepare_ok(&[0xFF]).is_err());
    }

    #[test]
    fn execute_packet_layout() {
        let params = vec![Value::Int(5), Value::Null, Value::UnsignedBigInt(u64::MAX)];
        let p = encode_execute(42, &params);
        assert_eq!(p[0], Command::StmtExecute as u8);
        assert_eq!(&p[1..5], &42u32.to_le_bytes());
        assert_eq!(p[5], 0);
        assert_eq!(&p[6..10], &1u32.to_le_bytes());
        assert_eq!(p[10], 0b010);
        assert_eq!(p[11], 1);
        assert_eq!(
            &p[12..18],
            &[
                FieldType::Long as u8,
                0,
                FieldType::Null as u8,
                0,
                FieldType::LongLong as u8,
                0x80
            ]
        );
        assert_eq!(&p[18..22], &5i32.to_le_bytes());
        assert_eq!(&p[22..30], &u64::MAX.to_le_bytes());
        assert_eq!(p.len(), 30);
    }

    #[test]
    fn execute_without_params_has_no_bitmap() {
        assert_eq!(encode_execute(1, &[]).len(), 10);
    }

    #[test]
    fn long_data_values_are_left_out_of_execute() {
        let big = Value::Bytes(vec![1u8; LONG_DATA_THRESHOLD]);
        assert!(is_long_data(&big));
        let p = encode_execute(3, &[big, Value::TinyInt(9)]);
        assert_eq!(&p[12..16], &[FieldType::Blob as u8, 0, FieldType::Tiny as u8, 0]);
        assert_eq!(&p[16..], &[9]);

        let chunk = encode_long_data(3, 0, b"abc");
        assert_eq!(chunk, vec![0x18, 3, 0, 0, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn temporal_params_use_binary_layouts() {
        let mut w = PacketWriter::new();
        encode_binary_param(&mut w, &Value::Date(0));
        assert_eq!(w.as_bytes(), &[4, 0xB2, 0x07, 1, 1]);

        let mut w = PacketWriter::new();
        encode_binary_param(&mut w, &Value::Time(-3_600_000_000));
        assert_eq!(w.as_bytes(), &[8, 1, 0, 0, 0, 0, 1, 0, 0]);
    }

    #[test]
    fn vector_params_are_text_literals() {
        let v = Value::from(vec![1.5f32, -2.0]);
        assert_eq!(param_type(&v).0, FieldType::VarString);
        let mut w = PacketWriter::new();
        encode_binary_param(&mut w, &v);
        assert_eq!(w.as_bytes(), b"\x08[1.5,-2]");
    }

    #[test]
    fn escaping() {
        assert_eq!(escape_string("it's"), "'it''s'");
        assert_eq!(escape_string("a\\b\n"), "'a\\\\b\\n'");
        assert_eq!(escape_bytes(&[0xDE, 0xAD]), "X'DEAD'");
        assert_eq!(format_value_for_sql(&Value::Bool(true)), "TRUE");
        assert_eq!(format_value_for_sql(&Value::Double(f64::NAN)), "NULL");
        assert_eq!(format_value_for_sql(&Value::Date(0)), "'1970-01-01'");
    }

    #[test]
    fn interpolation_skips_literals_and_comments() {
        let sql = "SELECT '?', `a?`, \"?\" FROM t -- ?\nWHERE a = ? /* ? */ AND b = ?";
        let out = interpolate_params(sql, &[Value::Int(1), Value::Text("x'y".into())]).unwrap();
        assert_eq!(
            out,
            "SELECT '?', `a?`, \"?\" FROM t -- ?\nWHERE a = 1 /* ? */ AND b = 'x''y'"
        );
    }

    #[test]
    fn placeholder_count_ignores_literals() {
        assert_eq!(count_placeholders("INSERT INTO t VALUES (?,?)"), 2);
        assert_eq!(count_placeholders("SELECT '?' # ?\n, ?"), 1);
    }

    #[test]
    fn interpolation_checks_parameter_count() {
        assert!(interpolate_params("SELECT ?", &[]).is_err());
        assert!(interpolate_params("SELECT 1", &[Value::Int(1)]).is_err());
        assert_eq!(
            interpolate_params("INSERT INTO t VALUES ('it\\'s ?', ?)", &[Value::Int(2)]).unwrap(),
            "INSERT INTO t VALUES ('it\\'s ?', 2)"
        );
    }
}
