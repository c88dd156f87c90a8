//! Typed register values as they travel in B524 register replies.
//!
//! Wire types are named by their ebusd schema tags (`EXP`, `UIN`, `UCH`, ...). All multi-byte
//! integers and floats are little-endian. Date and time values are three BCD bytes each.

use std::fmt::Write as _;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WireType {
    /// IEEE-754 single precision float. NaN decodes to [`Value::Absent`].
    Float32,
    U8,
    U16,
    I8,
    I16,
    U32,
    I32,
    /// A single byte, non-zero meaning `true`.
    Bool,
    /// Latin-1 text terminated by the first NUL byte.
    CString,
    /// Opaque bytes of a fixed length.
    Hex(usize),
    /// `DD MM YY`, BCD per byte, year relative to 2000.
    Date,
    /// `HH MM SS`, BCD per byte.
    Time,
}

impl WireType {
    /// The exact number of value bytes this type occupies, if fixed.
    pub const fn width(&self) -> Option<usize> {
        Some(match self {
            Self::Float32 | Self::U32 | Self::I32 => 4,
            Self::U16 | Self::I16 => 2,
            Self::U8 | Self::I8 | Self::Bool => 1,
            Self::Date | Self::Time => 3,
            Self::Hex(n) => *n,
            Self::CString => return None,
        })
    }

    pub const fn is_integer(&self) -> bool {
        matches!(self, Self::U8 | Self::U16 | Self::I8 | Self::I16 | Self::U32 | Self::I32)
    }
}

impl std::fmt::Display for WireType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float32 => f.write_str("EXP"),
            Self::U8 => f.write_str("UCH"),
            Self::U16 => f.write_str("UIN"),
            Self::I8 => f.write_str("I8"),
            Self::I16 => f.write_str("I16"),
            Self::U32 => f.write_str("U32"),
            Self::I32 => f.write_str("I32"),
            Self::Bool => f.write_str("BOOL"),
            Self::CString => f.write_str("STR:*"),
            Self::Hex(n) => write!(f, "HEX:{n}"),
            Self::Date => f.write_str("HDA:3"),
            Self::Time => f.write_str("HTI"),
        }
    }
}

impl serde::Serialize for WireType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("`{0}` is not a supported wire type")]
pub struct UnknownWireType(pub String);

impl std::str::FromStr for WireType {
    type Err = UnknownWireType;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        if normalized.starts_with("STR:") {
            return Ok(Self::CString);
        }
        if let Some(length) = normalized.strip_prefix("HEX:") {
            return length
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .map(Self::Hex)
                .ok_or_else(|| UnknownWireType(s.to_string()));
        }
        Ok(match &*normalized {
            "EXP" => Self::Float32,
            "UCH" => Self::U8,
            "UIN" => Self::U16,
            "I8" => Self::I8,
            "I16" => Self::I16,
            "U32" => Self::U32,
            "I32" => Self::I32,
            "BOOL" => Self::Bool,
            "HDA:3" => Self::Date,
            "HTI" => Self::Time,
            _ => return Err(UnknownWireType(s.to_string())),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// A float register holding NaN: the device has no value to report.
    Absent,
    Float(f32),
    Integer(i64),
    Bool(bool),
    Text(String),
    Hex(Vec<u8>),
    Date(jiff::civil::Date),
    Time(jiff::civil::Time),
}

impl Value {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// The integral value, used for enum label resolution.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => f.write_str("absent"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
            Self::Hex(v) => f.write_str(&hex_string(v)),
            Self::Date(v) => write!(f, "{v}"),
            Self::Time(v) => write!(f, "{:02}:{:02}:{:02}", v.hour(), v.minute(), v.second()),
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Absent => serializer.serialize_none(),
            Self::Float(v) if v.is_finite() => serializer.serialize_f32(*v),
            Self::Float(_) => serializer.serialize_none(),
            Self::Integer(v) => serializer.serialize_i64(*v),
            Self::Bool(v) => serializer.serialize_bool(*v),
            Self::Text(_) | Self::Hex(_) | Self::Date(_) | Self::Time(_) => {
                serializer.collect_str(self)
            }
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{0} expects {1} bytes, got {2} bytes")]
    Length(WireType, usize, usize),
    #[error("{0} has invalid BCD for the {1}: {2:#04x}")]
    Bcd(WireType, &'static str, u8),
    #[error("{0} {1} is out of range: {2}")]
    Range(WireType, &'static str, u8),
    #[error("{0} is not a calendar date (DDMMYY={1:02}{2:02}{3:02})")]
    Date(WireType, u8, u8, u8),
}

fn expect_width<const N: usize>(wire_type: WireType, data: &[u8]) -> Result<[u8; N], DecodeError> {
    <[u8; N]>::try_from(data).map_err(|_| DecodeError::Length(wire_type, N, data.len()))
}

fn decode_bcd(wire_type: WireType, field: &'static str, byte: u8) -> Result<u8, DecodeError> {
    let (high, low) = (byte >> 4, byte & 0x0F);
    if high > 9 || low > 9 {
        return Err(DecodeError::Bcd(wire_type, field, byte));
    }
    Ok(high * 10 + low)
}

/// Decode the value tail of a register reply according to its declared wire type.
pub fn decode(wire_type: WireType, data: &[u8]) -> Result<Value, DecodeError> {
    let wt = wire_type;
    Ok(match wire_type {
        WireType::Float32 => {
            let v = f32::from_le_bytes(expect_width(wt, data)?);
            if v.is_nan() { Value::Absent } else { Value::Float(v) }
        }
        WireType::U8 => Value::Integer(expect_width::<1>(wt, data)?[0].into()),
        WireType::I8 => Value::Integer(i8::from_le_bytes(expect_width(wt, data)?).into()),
        WireType::U16 => Value::Integer(u16::from_le_bytes(expect_width(wt, data)?).into()),
        WireType::I16 => Value::Integer(i16::from_le_bytes(expect_width(wt, data)?).into()),
        WireType::U32 => Value::Integer(u32::from_le_bytes(expect_width(wt, data)?).into()),
        WireType::I32 => Value::Integer(i32::from_le_bytes(expect_width(wt, data)?).into()),
        WireType::Bool => Value::Bool(expect_width::<1>(wt, data)?[0] != 0),
        WireType::CString => {
            let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
            // Latin-1 maps every byte onto the code point of the same value.
            Value::Text(data[..end].iter().map(|b| char::from(*b)).collect())
        }
        WireType::Hex(n) => {
            if data.len() != n {
                return Err(DecodeError::Length(wt, n, data.len()));
            }
            Value::Hex(data.to_vec())
        }
        WireType::Date => {
            let [d, m, y] = expect_width(wt, data)?;
            let day = decode_bcd(wt, "day", d)?;
            let month = decode_bcd(wt, "month", m)?;
            let year = decode_bcd(wt, "year", y)?;
            let date = jiff::civil::Date::new(2000 + i16::from(year), month as i8, day as i8)
                .map_err(|_| DecodeError::Date(wt, day, month, year))?;
            Value::Date(date)
        }
        WireType::Time => {
            let [h, m, s] = expect_width(wt, data)?;
            let hour = decode_bcd(wt, "hour", h)?;
            let minute = decode_bcd(wt, "minute", m)?;
            let second = decode_bcd(wt, "second", s)?;
            if hour > 23 {
                return Err(DecodeError::Range(wt, "hour", hour));
            }
            if minute > 59 {
                return Err(DecodeError::Range(wt, "minute", minute));
            }
            if second > 59 {
                return Err(DecodeError::Range(wt, "second", second));
            }
            let time = jiff::civil::Time::new(hour as i8, minute as i8, second as i8, 0)
                .map_err(|_| DecodeError::Range(wt, "time", hour))?;
            Value::Time(time)
        }
    })
}

fn looks_like_cstring(data: &[u8]) -> bool {
    let Some(nul) = data.iter().position(|b| *b == 0) else {
        return false;
    };
    let (text, padding) = data.split_at(nul);
    !text.is_empty()
        && padding.iter().all(|b| *b == 0)
        && text.iter().all(|b| matches!(b, 0x20..=0x7E | 0xA0..=0xFF))
}

/// Guess a wire type for a register that has no schema entry, based on the reply length.
///
/// Returns `None` for an empty value tail. Anything that fails to decode under the guessed
/// type falls back to opaque `HEX:n` so the bytes are always represented.
pub fn infer(data: &[u8]) -> Option<(WireType, Value)> {
    if data.is_empty() {
        return None;
    }
    let candidates: &[WireType] = match data.len() {
        4 => &[WireType::Float32],
        2 => &[WireType::U16],
        1 => &[WireType::U8],
        3 => &[WireType::Date, WireType::Time],
        _ if looks_like_cstring(data) => &[WireType::CString],
        _ => &[],
    };
    for wire_type in candidates {
        if let Ok(value) = decode(*wire_type, data) {
            return Some((*wire_type, value));
        }
    }
    Some((WireType::Hex(data.len()), Value::Hex(data.to_vec())))
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("`{1}` is not a valid {0} value")]
    Parse(WireType, String),
    #[error("{1} is out of range for {0}")]
    Range(WireType, String),
    #[error("{0} cannot encode NaN")]
    NaN(WireType),
    #[error("{0} expects {1} bytes, got {2} bytes")]
    Length(WireType, usize, usize),
    #[error("{0} text contains characters outside of latin-1")]
    NotLatin1(WireType),
}

fn parse_integer(wire_type: WireType, literal: &str) -> Result<i64, EncodeError> {
    let literal = literal.trim();
    let (negative, digits) = match literal.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, literal),
    };
    let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => digits.parse::<i64>(),
    }
    .map_err(|_| EncodeError::Parse(wire_type, literal.to_string()))?;
    Ok(if negative { -magnitude } else { magnitude })
}

fn ranged<T: TryFrom<i64>>(wire_type: WireType, literal: &str) -> Result<T, EncodeError> {
    let value = parse_integer(wire_type, literal)?;
    T::try_from(value).map_err(|_| EncodeError::Range(wire_type, value.to_string()))
}

fn encode_bcd(wire_type: WireType, value: i8) -> Result<u8, EncodeError> {
    let value = u8::try_from(value)
        .ok()
        .filter(|v| *v <= 99)
        .ok_or_else(|| EncodeError::Range(wire_type, value.to_string()))?;
    Ok((value / 10) << 4 | (value % 10))
}

fn parse_hex_bytes(wire_type: WireType, literal: &str) -> Result<Vec<u8>, EncodeError> {
    let text = literal.trim();
    let text = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")).unwrap_or(text);
    let invalid = || EncodeError::Parse(wire_type, literal.to_string());
    if text.len() % 2 != 0 || !text.is_ascii() {
        return Err(invalid());
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).map_err(|_| invalid()))
        .collect()
}

/// Encode a textual literal into the wire representation of `wire_type`.
pub fn encode(wire_type: WireType, literal: &str) -> Result<Vec<u8>, EncodeError> {
    let wt = wire_type;
    Ok(match wire_type {
        WireType::Float32 => {
            let v = literal
                .trim()
                .parse::<f32>()
                .map_err(|_| EncodeError::Parse(wt, literal.to_string()))?;
            if v.is_nan() {
                return Err(EncodeError::NaN(wt));
            }
            v.to_le_bytes().to_vec()
        }
        WireType::U8 => ranged::<u8>(wt, literal)?.to_le_bytes().to_vec(),
        WireType::I8 => ranged::<i8>(wt, literal)?.to_le_bytes().to_vec(),
        WireType::U16 => ranged::<u16>(wt, literal)?.to_le_bytes().to_vec(),
        WireType::I16 => ranged::<i16>(wt, literal)?.to_le_bytes().to_vec(),
        WireType::U32 => ranged::<u32>(wt, literal)?.to_le_bytes().to_vec(),
        WireType::I32 => ranged::<i32>(wt, literal)?.to_le_bytes().to_vec(),
        WireType::Bool => match &*literal.trim().to_ascii_lowercase() {
            "1" | "true" | "on" | "yes" => vec![1],
            "0" | "false" | "off" | "no" => vec![0],
            _ => return Err(EncodeError::Parse(wt, literal.to_string())),
        },
        WireType::CString => {
            let mut bytes = literal
                .chars()
                .map(|c| u8::try_from(u32::from(c)).map_err(|_| EncodeError::NotLatin1(wt)))
                .collect::<Result<Vec<u8>, _>>()?;
            bytes.push(0);
            bytes
        }
        WireType::Hex(n) => {
            let bytes = parse_hex_bytes(wt, literal)?;
            if bytes.len() != n {
                return Err(EncodeError::Length(wt, n, bytes.len()));
            }
            bytes
        }
        WireType::Date => {
            let date = literal
                .trim()
                .parse::<jiff::civil::Date>()
                .map_err(|_| EncodeError::Parse(wt, literal.to_string()))?;
            if !(2000..=2099).contains(&date.year()) {
                return Err(EncodeError::Range(wt, date.year().to_string()));
            }
            let year = (date.year() - 2000) as i8;
            vec![encode_bcd(wt, date.day())?, encode_bcd(wt, date.month())?, encode_bcd(wt, year)?]
        }
        WireType::Time => {
            let time = literal
                .trim()
                .parse::<jiff::civil::Time>()
                .map_err(|_| EncodeError::Parse(wt, literal.to_string()))?;
            if time.subsec_nanosecond() != 0 {
                return Err(EncodeError::Parse(wt, literal.to_string()));
            }
            vec![
                encode_bcd(wt, time.hour())?,
                encode_bcd(wt, time.minute())?,
                encode_bcd(wt, time.second())?,
            ]
        }
    })
}
