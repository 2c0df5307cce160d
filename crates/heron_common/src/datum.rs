use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::DataType;
use serde_json::Value as JsonValue;

/// Days between 1970-01-01 and the PostgreSQL epoch 2000-01-01.
const PG_EPOCH_DAYS: i32 = 10_957;
/// Microseconds between the Unix epoch and the PostgreSQL epoch.
const PG_EPOCH_MICROS: i64 = 946_684_800_000_000;

/// A single scalar value as produced by cursors and consumed by Bind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Boolean(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    /// Fixed-point decimal: mantissa × 10^(-scale).
    Decimal(i128, u8),
    Text(String),
    Bytea(Vec<u8>),
    /// Days since 1970-01-01.
    Date(i32),
    /// Microseconds since midnight.
    Time(i64),
    /// Microseconds since the Unix epoch.
    Timestamp(i64),
    Json(JsonValue),
}

fn unix_epoch() -> chrono::NaiveDate {
    chrono::NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(chrono::NaiveDate::MIN)
}

impl Datum {
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Datum::Null => None,
            Datum::Boolean(_) => Some(DataType::Boolean),
            Datum::Int16(_) => Some(DataType::Int16),
            Datum::Int32(_) => Some(DataType::Int32),
            Datum::Int64(_) => Some(DataType::Int64),
            Datum::Float32(_) => Some(DataType::Float32),
            Datum::Float64(_) => Some(DataType::Float64),
            Datum::Decimal(_, _) => Some(DataType::Decimal),
            Datum::Text(_) => Some(DataType::Text),
            Datum::Bytea(_) => Some(DataType::Bytea),
            Datum::Date(_) => Some(DataType::Date),
            Datum::Time(_) => Some(DataType::Time),
            Datum::Timestamp(_) => Some(DataType::Timestamp),
            Datum::Json(_) => Some(DataType::Jsonb),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int16(v) => Some(*v as i64),
            Datum::Int32(v) => Some(*v as i64),
            Datum::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Encode to PG text format. `None` is SQL NULL.
    pub fn to_pg_text(&self) -> Option<String> {
        match self {
            Datum::Null => None,
            Datum::Boolean(b) => Some(if *b { "t".into() } else { "f".into() }),
            Datum::Int16(v) => Some(v.to_string()),
            Datum::Int32(v) => Some(v.to_string()),
            Datum::Int64(v) => Some(v.to_string()),
            Datum::Float32(v) => Some(float_to_pg_text(*v as f64)),
            Datum::Float64(v) => Some(float_to_pg_text(*v)),
            Datum::Decimal(m, s) => Some(decimal_to_string(*m, *s)),
            Datum::Text(s) => Some(s.clone()),
            Datum::Bytea(bytes) => {
                // PG hex format: \x followed by hex-encoded bytes
                let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
                Some(format!("\\x{}", hex))
            }
            Datum::Date(days) => {
                match unix_epoch().checked_add_signed(chrono::Duration::days(*days as i64)) {
                    Some(d) => Some(d.format("%Y-%m-%d").to_string()),
                    None => Some(days.to_string()),
                }
            }
            Datum::Time(us) => {
                let secs = us.div_euclid(1_000_000) as u32;
                let nanos = (us.rem_euclid(1_000_000) * 1000) as u32;
                match chrono::NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos) {
                    Some(t) => Some(t.format("%H:%M:%S%.f").to_string()),
                    None => Some(us.to_string()),
                }
            }
            Datum::Timestamp(us) => {
                let secs = us.div_euclid(1_000_000);
                let nanos = (us.rem_euclid(1_000_000) * 1000) as u32;
                match chrono::DateTime::from_timestamp(secs, nanos) {
                    Some(dt) => Some(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
                    None => Some(us.to_string()),
                }
            }
            Datum::Json(v) => Some(v.to_string()),
        }
    }

    /// Encode to PG binary format as the column type `ty`.
    ///
    /// Integer values widen or narrow to the column width when they fit.
    /// Returns `Err` with a human-readable reason when the value cannot be
    /// represented; callers degrade that to a warning plus NULL.
    pub fn to_pg_binary(&self, ty: DataType) -> Result<Option<Vec<u8>>, String> {
        if self.is_null() {
            return Ok(None);
        }
        let bytes = match (ty, self) {
            (DataType::Boolean, Datum::Boolean(b)) => vec![u8::from(*b)],
            (DataType::Int16, v) => {
                let n = v.as_i64().ok_or_else(|| mismatch(ty, v))?;
                let n = i16::try_from(n).map_err(|_| format!("{n} out of range for smallint"))?;
                n.to_be_bytes().to_vec()
            }
            (DataType::Int32, v) => {
                let n = v.as_i64().ok_or_else(|| mismatch(ty, v))?;
                let n = i32::try_from(n).map_err(|_| format!("{n} out of range for integer"))?;
                n.to_be_bytes().to_vec()
            }
            (DataType::Int64, v) => {
                let n = v.as_i64().ok_or_else(|| mismatch(ty, v))?;
                n.to_be_bytes().to_vec()
            }
            (DataType::Float32, Datum::Float32(f)) => f.to_be_bytes().to_vec(),
            (DataType::Float64, Datum::Float64(f)) => f.to_be_bytes().to_vec(),
            (DataType::Float64, Datum::Float32(f)) => (*f as f64).to_be_bytes().to_vec(),
            (DataType::Bytea, Datum::Bytea(b)) => b.clone(),
            (DataType::Date, Datum::Date(days)) => days
                .checked_sub(PG_EPOCH_DAYS)
                .ok_or_else(|| "date out of range".to_string())?
                .to_be_bytes()
                .to_vec(),
            (DataType::Time, Datum::Time(us)) => us.to_be_bytes().to_vec(),
            (DataType::Timestamp, Datum::Timestamp(us)) => us
                .checked_sub(PG_EPOCH_MICROS)
                .ok_or_else(|| "timestamp out of range".to_string())?
                .to_be_bytes()
                .to_vec(),
            (DataType::Jsonb, Datum::Json(v)) => {
                let mut out = vec![1u8];
                out.extend_from_slice(v.to_string().as_bytes());
                out
            }
            (DataType::Decimal, _) => {
                return Err("binary format is not supported for numeric".to_string());
            }
            (DataType::Text | DataType::Varchar | DataType::Json | DataType::Unknown, v) => v
                .to_pg_text()
                .map(String::into_bytes)
                .unwrap_or_default(),
            (_, v) => return Err(mismatch(ty, v)),
        };
        Ok(Some(bytes))
    }

    /// Serialize as a JSON value for the JSON outputters.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Datum::Null => JsonValue::Null,
            Datum::Boolean(b) => JsonValue::Bool(*b),
            Datum::Int16(v) => JsonValue::from(*v),
            Datum::Int32(v) => JsonValue::from(*v),
            Datum::Int64(v) => JsonValue::from(*v),
            Datum::Float32(v) => serde_json::Number::from_f64(*v as f64)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Datum::Float64(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Datum::Json(v) => v.clone(),
            other => other
                .to_pg_text()
                .map(JsonValue::String)
                .unwrap_or(JsonValue::Null),
        }
    }

    /// Decode a text-format parameter or COPY field as `ty`.
    pub fn from_pg_text(s: &str, ty: DataType) -> Result<Datum, String> {
        let bad = || format!("invalid input syntax for type {}: \"{}\"", ty.name(), s);
        let d = match ty {
            DataType::Boolean => match s.trim().to_ascii_lowercase().as_str() {
                "t" | "true" | "yes" | "on" | "1" => Datum::Boolean(true),
                "f" | "false" | "no" | "off" | "0" => Datum::Boolean(false),
                _ => return Err(bad()),
            },
            DataType::Int16 => Datum::Int16(s.trim().parse().map_err(|_| bad())?),
            DataType::Int32 => Datum::Int32(s.trim().parse().map_err(|_| bad())?),
            DataType::Int64 => Datum::Int64(s.trim().parse().map_err(|_| bad())?),
            DataType::Float32 => Datum::Float32(parse_float(s).ok_or_else(bad)? as f32),
            DataType::Float64 => Datum::Float64(parse_float(s).ok_or_else(bad)?),
            DataType::Decimal => Datum::parse_decimal(s).ok_or_else(bad)?,
            DataType::Text | DataType::Varchar | DataType::Unknown => Datum::Text(s.to_string()),
            DataType::Bytea => match s.strip_prefix("\\x") {
                Some(hex) => Datum::Bytea(decode_hex(hex).ok_or_else(bad)?),
                None => Datum::Bytea(s.as_bytes().to_vec()),
            },
            DataType::Date => {
                let d = chrono::NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| bad())?;
                Datum::Date(d.signed_duration_since(unix_epoch()).num_days() as i32)
            }
            DataType::Time => {
                let t = chrono::NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f")
                    .map_err(|_| bad())?;
                let since = t.signed_duration_since(chrono::NaiveTime::MIN);
                Datum::Time(since.num_microseconds().ok_or_else(bad)?)
            }
            DataType::Timestamp => {
                let s = s.trim();
                let ts = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                    .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
                    .map_err(|_| bad())?;
                Datum::Timestamp(ts.and_utc().timestamp_micros())
            }
            DataType::Json | DataType::Jsonb => {
                Datum::Json(serde_json::from_str(s).map_err(|_| bad())?)
            }
        };
        Ok(d)
    }

    /// Decode a binary-format parameter as `ty`.
    pub fn from_pg_binary(bytes: &[u8], ty: DataType) -> Result<Datum, String> {
        fn fixed<const N: usize>(bytes: &[u8], ty: DataType) -> Result<[u8; N], String> {
            bytes.try_into().map_err(|_| {
                format!("incorrect binary data length {} for type {}", bytes.len(), ty.name())
            })
        }
        let d = match ty {
            DataType::Boolean => Datum::Boolean(fixed::<1>(bytes, ty)?[0] != 0),
            DataType::Int16 => Datum::Int16(i16::from_be_bytes(fixed(bytes, ty)?)),
            DataType::Int32 => Datum::Int32(i32::from_be_bytes(fixed(bytes, ty)?)),
            DataType::Int64 => Datum::Int64(i64::from_be_bytes(fixed(bytes, ty)?)),
            DataType::Float32 => Datum::Float32(f32::from_be_bytes(fixed(bytes, ty)?)),
            DataType::Float64 => Datum::Float64(f64::from_be_bytes(fixed(bytes, ty)?)),
            DataType::Bytea => Datum::Bytea(bytes.to_vec()),
            DataType::Date => Datum::Date(
                i32::from_be_bytes(fixed(bytes, ty)?)
                    .checked_add(PG_EPOCH_DAYS)
                    .ok_or_else(|| "date out of range".to_string())?,
            ),
            DataType::Time => Datum::Time(i64::from_be_bytes(fixed(bytes, ty)?)),
            DataType::Timestamp => Datum::Timestamp(
                i64::from_be_bytes(fixed(bytes, ty)?)
                    .checked_add(PG_EPOCH_MICROS)
                    .ok_or_else(|| "timestamp out of range".to_string())?,
            ),
            DataType::Jsonb => {
                let body = match bytes.split_first() {
                    Some((1, rest)) => rest,
                    _ => return Err("unsupported jsonb version".to_string()),
                };
                let text = std::str::from_utf8(body).map_err(|e| e.to_string())?;
                Datum::from_pg_text(text, ty)?
            }
            DataType::Decimal => {
                return Err("binary format is not supported for numeric".to_string());
            }
            DataType::Text | DataType::Varchar | DataType::Json | DataType::Unknown => {
                let text = std::str::from_utf8(bytes).map_err(|e| e.to_string())?;
                Datum::from_pg_text(text, ty)?
            }
        };
        Ok(d)
    }

    /// Create a Decimal from a string like "123.45" or "-0.001".
    pub fn parse_decimal(s: &str) -> Option<Datum> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        let (int_part, frac_part) = match s.find('.') {
            Some(dot) => (&s[..dot], &s[dot + 1..]),
            None => (s, ""),
        };
        if !frac_part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let scale = u8::try_from(frac_part.len()).ok()?;
        let mantissa: i128 = format!("{}{}", int_part, frac_part).parse().ok()?;
        Some(Datum::Decimal(mantissa, scale))
    }
}

fn mismatch(ty: DataType, v: &Datum) -> String {
    let got = v.data_type().map(|t| t.name()).unwrap_or("null");
    format!("cannot encode {} value as {}", got, ty.name())
}

fn float_to_pg_text(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        v.to_string()
    }
}

fn parse_float(s: &str) -> Option<f64> {
    match s.trim() {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_pg_text() {
            Some(s) => f.write_str(&s),
            None => f.write_str("NULL"),
        }
    }
}

/// A row as produced by a cursor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Datum>,
}

impl Row {
    pub fn new(values: Vec<Datum>) -> Self {
        Self { values }
    }

    pub fn get(&self, idx: usize) -> Option<&Datum> {
        self.values.get(idx)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<Vec<Datum>> for Row {
    fn from(values: Vec<Datum>) -> Self {
        Row::new(values)
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

/// Convert a (mantissa, scale) decimal to its string representation.
/// e.g. (12345, 2) → "123.45", (-1, 3) → "-0.001", (100, 0) → "100"
pub fn decimal_to_string(mantissa: i128, scale: u8) -> String {
    if scale == 0 {
        return mantissa.to_string();
    }
    let digits = mantissa.unsigned_abs().to_string();
    let scale = scale as usize;
    let body = if digits.len() <= scale {
        format!("0.{}{}", "0".repeat(scale - digits.len()), digits)
    } else {
        let (int_part, frac_part) = digits.split_at(digits.len() - scale);
        format!("{}.{}", int_part, frac_part)
    };
    if mantissa < 0 {
        format!("-{}", body)
    } else {
        body
    }
}
