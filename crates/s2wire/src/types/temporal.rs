//! Calendar values and their text / binary wire layouts.
//!
//! Binary layouts (value preceded by a length byte):
//! - DATE / DATETIME / TIMESTAMP: 0, 4 (date), 7 (+ h:m:s), 11 (+ micros)
//! - TIME: 0, 8 (sign, days, h:m:s), 12 (+ micros)
//!
//! A zero DATE or DATETIME (`0000-00-00`) has no calendar meaning and
//! decodes to `None`.

use std::fmt;

/// A calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Date {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

/// A signed time of day or duration (MySQL TIME spans -838:59:59..838:59:59).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Time {
    pub negative: bool,
    /// Total hours, including whole days
    pub hours: u32,
    pub minutes: u8,
    pub seconds: u8,
    pub micros: u32,
}

/// A date and time without zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DateTime {
    pub date: Date,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub micros: u32,
}

impl Date {
    pub fn new(year: u16, month: u8, day: u8) -> Self {
        Self { year, month, day }
    }

    pub fn is_zero(&self) -> bool {
        self.year == 0 && self.month == 0 && self.day == 0
    }

    /// Days since 1970-01-01.
    pub fn days_since_epoch(&self) -> i32 {
        ymd_to_days(i32::from(self.year), u32::from(self.month), u32::from(self.day))
    }

    pub fn from_days_since_epoch(days: i32) -> Self {
        let (y, m, d) = days_to_ymd(days);
        Self {
            year: y.clamp(0, 9999) as u16,
            month: m as u8,
            day: d as u8,
        }
    }

    /// Parse `YYYY-MM-DD`. Returns `Ok(None)` for the zero date.
    pub fn parse(text: &str) -> Result<Option<Self>, String> {
        let mut parts = text.trim().splitn(3, '-');
        let (Some(y), Some(m), Some(d)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(format!("invalid date '{}'", text));
        };
        let date = Date {
            year: parse_num(y, text)?,
            month: parse_num(m, text)?,
            day: parse_num(d, text)?,
        };
        if date.is_zero() {
            return Ok(None);
        }
        date.validate(text)?;
        Ok(Some(date))
    }

    fn validate(&self, source: &str) -> Result<(), String> {
        if !(1..=12).contains(&self.month) || self.day == 0 || self.day > 31 {
            return Err(format!("invalid date '{}'", source));
        }
        Ok(())
    }
}

impl Time {
    /// Signed microseconds.
    pub fn total_micros(&self) -> i64 {
        let magnitude = (i64::from(self.hours) * 3600
            + i64::from(self.minutes) * 60
            + i64::from(self.seconds))
            * 1_000_000
            + i64::from(self.micros);
        if self.negative { -magnitude } else { magnitude }
    }

    pub fn from_micros(micros: i64) -> Self {
        let negative = micros < 0;
        let abs = micros.unsigned_abs();
        let total_seconds = abs / 1_000_000;
        Self {
            negative,
            hours: (total_seconds / 3600) as u32,
            minutes: ((total_seconds % 3600) / 60) as u8,
            seconds: (total_seconds % 60) as u8,
            micros: (abs % 1_000_000) as u32,
        }
    }

    /// Parse `[-]H+:MM:SS[.ffffff]`.
    pub fn parse(text: &str) -> Result<Self, String> {
        let trimmed = text.trim();
        let (negative, body) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (hms, frac) = split_fraction(body);
        let mut parts = hms.splitn(3, ':');
        let (Some(h), Some(m), Some(s)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(format!("invalid time '{}'", text));
        };
        let time = Time {
            negative,
            hours: parse_num(h, text)?,
            minutes: parse_num(m, text)?,
            seconds: parse_num(s, text)?,
            micros: parse_fraction(frac, text)?,
        };
        if time.minutes > 59 || time.seconds > 59 {
            return Err(format!("invalid time '{}'", text));
        }
        Ok(time)
    }

    /// Decode the binary layout (bytes after the length byte).
    pub fn from_binary(data: &[u8]) -> Result<Self, String> {
        match data.len() {
            0 => Ok(Time::from_micros(0)),
            8 | 12 => {
                let days = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
                Ok(Time {
                    negative: data[0] != 0,
                    hours: days * 24 + u32::from(data[5]),
                    minutes: data[6],
                    seconds: data[7],
                    micros: if data.len() == 12 {
                        u32::from_le_bytes([data[8], data[9], data[10], data[11]])
                    } else {
                        0
                    },
                })
            }
            n => Err(format!("invalid binary TIME length {}", n)),
        }
    }
}

impl DateTime {
    pub fn is_zero(&self) -> bool {
        self.date.is_zero()
            && self.hour == 0
            && self.minute == 0
            && self.second == 0
            && self.micros == 0
    }

    /// Microseconds since 1970-01-01 00:00:00.
    pub fn micros_since_epoch(&self) -> i64 {
        let days = i64::from(self.date.days_since_epoch());
        let secs = days * 86_400
            + i64::from(self.hour) * 3600
            + i64::from(self.minute) * 60
            + i64::from(self.second);
        secs * 1_000_000 + i64::from(self.micros)
    }

    pub fn from_micros_since_epoch(micros: i64) -> Self {
        let secs = micros.div_euclid(1_000_000);
        let sub = micros.rem_euclid(1_000_000) as u32;
        let days = secs.div_euclid(86_400) as i32;
        let tod = secs.rem_euclid(86_400) as u32;
        Self {
            date: Date::from_days_since_epoch(days),
            hour: (tod / 3600) as u8,
            minute: ((tod % 3600) / 60) as u8,
            second: (tod % 60) as u8,
            micros: sub,
        }
    }

    /// Parse `YYYY-MM-DD[ HH:MM:SS[.ffffff]]`. Returns `Ok(None)` for zero.
    pub fn parse(text: &str) -> Result<Option<Self>, String> {
        let trimmed = text.trim();
        let (date_part, time_part) = match trimmed.split_once([' ', 'T']) {
            Some((d, t)) => (d, Some(t)),
            None => (trimmed, None),
        };
        let mut parts = date_part.splitn(3, '-');
        let (Some(y), Some(m), Some(d)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(format!("invalid datetime '{}'", text));
        };
        let date = Date {
            year: parse_num(y, text)?,
            month: parse_num(m, text)?,
            day: parse_num(d, text)?,
        };
        let mut dt = DateTime {
            date,
            hour: 0,
            minute: 0,
            second: 0,
            micros: 0,
        };
        if let Some(t) = time_part {
            let time = Time::parse(t)?;
            if time.negative || time.hours > 23 {
                return Err(format!("invalid datetime '{}'", text));
            }
            dt.hour = time.hours as u8;
            dt.minute = time.minutes;
            dt.second = time.seconds;
            dt.micros = time.micros;
        }
        if dt.is_zero() || date.is_zero() {
            return Ok(None);
        }
        date.validate(text)?;
        Ok(Some(dt))
    }

    /// Decode the binary layout (bytes after the length byte).
    /// Returns `Ok(None)` for zero values.
    pub fn from_binary(data: &[u8]) -> Result<Option<Self>, String> {
        if !matches!(data.len(), 0 | 4 | 7 | 11) {
            return Err(format!("invalid binary DATETIME length {}", data.len()));
        }
        if data.is_empty() {
            return Ok(None);
        }
        let mut dt = DateTime {
            date: Date {
                year: u16::from_le_bytes([data[0], data[1]]),
                month: data[2],
                day: data[3],
            },
            hour: 0,
            minute: 0,
            second: 0,
            micros: 0,
        };
        if data.len() >= 7 {
            dt.hour = data[4];
            dt.minute = data[5];
            dt.second = data[6];
        }
        if data.len() == 11 {
            dt.micros = u32::from_le_bytes([data[7], data[8], data[9], data[10]]);
        }
        if dt.date.is_zero() {
            return Ok(None);
        }
        Ok(Some(dt))
    }

    /// Encode as a length-prefixed binary value, using the shortest layout.
    pub fn write_binary(&self, out: &mut Vec<u8>) {
        let has_time = self.hour != 0 || self.minute != 0 || self.second != 0;
        let len: u8 = if self.micros != 0 {
            11
        } else if has_time {
            7
        } else {
            4
        };
        out.push(len);
        out.extend_from_slice(&self.date.year.to_le_bytes());
        out.push(self.date.month);
        out.push(self.date.day);
        if len >= 7 {
            out.extend_from_slice(&[self.hour, self.minute, self.second]);
        }
        if len == 11 {
            out.extend_from_slice(&self.micros.to_le_bytes());
        }
    }
}

impl Time {
    /// Encode as a length-prefixed binary value.
    pub fn write_binary(&self, out: &mut Vec<u8>) {
        if self.total_micros() == 0 {
            out.push(0);
            return;
        }
        out.push(if self.micros == 0 { 8 } else { 12 });
        out.push(u8::from(self.negative));
        out.extend_from_slice(&(self.hours / 24).to_le_bytes());
        out.extend_from_slice(&[(self.hours % 24) as u8, self.minutes, self.seconds]);
        if self.micros != 0 {
            out.extend_from_slice(&self.micros.to_le_bytes());
        }
    }
}

impl fmt::Display for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.negative { "-" } else { "" };
        write!(
            f,
            "{}{:02}:{:02}:{:02}",
            sign, self.hours, self.minutes, self.seconds
        )?;
        if self.micros != 0 {
            write!(f, ".{:06}", self.micros)?;
        }
        Ok(())
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:02}:{:02}:{:02}",
            self.date, self.hour, self.minute, self.second
        )?;
        if self.micros != 0 {
            write!(f, ".{:06}", self.micros)?;
        }
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(part: &str, source: &str) -> Result<T, String> {
    part.trim()
        .parse()
        .map_err(|_| format!("invalid temporal value '{}'", source))
}

fn split_fraction(s: &str) -> (&str, &str) {
    s.split_once('.').unwrap_or((s, ""))
}

/// Fractional seconds, right-padded to six digits.
fn parse_fraction(frac: &str, source: &str) -> Result<u32, String> {
    if frac.is_empty() {
        return Ok(0);
    }
    if frac.len() > 6 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid fractional seconds in '{}'", source));
    }
    let value: u32 = parse_num(frac, source)?;
    Ok(value * 10u32.pow(6 - frac.len() as u32))
}

/// Convert days since Unix epoch to (year, month, day).
///
/// Civil-from-days algorithm (Howard Hinnant). Day 0 is 1970-01-01.
pub fn days_to_ymd(days: i32) -> (i32, u32, u32) {
    let z = days + 719_468;
    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = (z - era * 146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = yoe as i32 + era * 400 + i32::from(m <= 2);
    (y, m, d)
}

/// Convert (year, month, day) to days since Unix epoch.
pub fn ymd_to_days(year: i32, month: u32, day: u32) -> i32 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = (if y >= 0 { y } else { y - 399 }) / 400;
    let yoe = (y - era * 400) as u32;
    let mp = if month > 2 { month - 3 } else { month + 9 };
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe as i32 - 719_468
}
