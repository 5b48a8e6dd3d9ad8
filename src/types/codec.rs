//! Byte-level encoding and decoding of server types.
//!
//! Each supported [`TypeTag`] maps to exactly one [`CodecEntry`]. The entry
//! fixes the payload size, the framing used for parameters and bound
//! columns, and the category whose rules convert between [`Value`] and
//! bytes. Scalars are little-endian throughout.
//!
//! Layouts:
//! - integers, floats: native width
//! - MONEY: high `i32` then low `u32` of an `i64` in 1/10000 units; MONEY4: `i32`
//! - DATETIME: `i32` days since 1900-01-01, `u32` 1/300 second ticks
//! - DATETIME4: `u16` days since 1900-01-01, `u16` minutes
//! - DATE: `i32` days; TIME: `i32` ticks
//! - BIGDATETIME: `u64` microseconds since 0000-01-01; BIGTIME: `u64` microseconds
//! - DECIMAL/NUMERIC: precision byte, scale byte, 33 byte digit array
//! - VARCHAR/VARBINARY: `i16` length followed by a 256 byte array
//! - CHAR: padded with NUL to 256 bytes; TEXT family: NUL terminated
//! - UNICHAR/UNITEXT: UTF-16LE, NUL terminated

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use super::decimal::{self, Decimal, MAX_NUMLEN};
use super::{TypeTag, Value};
use crate::error::{DriverError, Result};
use crate::transport::{DataFormat, FormatFlag, ParamData, StatusFlags};

/// Capacity of CHAR, VARCHAR and VARBINARY values (`CS_MAX_CHAR`).
pub const MAX_CHAR: usize = 256;

/// Ticks per second of DATETIME and TIME values.
const TICKS_PER_SECOND: u64 = 300;
const TICKS_PER_DAY: u64 = TICKS_PER_SECOND * 86_400;
const MICROS_PER_DAY: u64 = 86_400_000_000;

// ============================================================================
// Codec entries
// ============================================================================

/// Rule family shared by several type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    FixedNumeric,
    Money,
    ShortDateTime,
    BigDateTime,
    Decimal,
    Char,
    VarChar,
    Text,
    Binary,
    VarBinary,
    Image,
    Unicode,
    Bit,
}

/// Size, framing and conversion rule of one type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecEntry {
    pub tag: TypeTag,
    pub category: Category,
    /// Payload size of fixed-size types.
    pub byte_size: Option<usize>,
    /// Framing requested when the type is bound as a result column.
    pub column_format: FormatFlag,
}

impl CodecEntry {
    const fn new(tag: TypeTag, category: Category, byte_size: Option<usize>) -> Self {
        let column_format = match tag {
            TypeTag::Char | TypeTag::Binary | TypeTag::LongBinary => FormatFlag::PadNull,
            TypeTag::Text
            | TypeTag::LongChar
            | TypeTag::Xml
            | TypeTag::UniChar
            | TypeTag::UniText => FormatFlag::NullTerm,
            _ => FormatFlag::Unused,
        };
        Self {
            tag,
            category,
            byte_size,
            column_format,
        }
    }

    /// Size of the receive buffer for a column declaring `maxlength` bytes.
    pub fn buffer_len(&self, maxlength: i32) -> usize {
        let declared = usize::try_from(maxlength).unwrap_or(0);
        declared.max(self.byte_size.unwrap_or(0))
    }

    /// Encode a value into the parameter form sent to the server.
    pub fn encode_param(&self, value: &Value) -> Result<ParamData> {
        encode_param(self.tag, value)
    }

    /// Decode a payload received for this type.
    pub fn decode(&self, data: &[u8]) -> Result<Value> {
        decode(self.tag, data)
    }
}

/// Look up the codec entry of a type tag.
pub fn entry(tag: TypeTag) -> Result<CodecEntry> {
    use Category::*;

    let entry = match tag {
        TypeTag::TinyInt | TypeTag::Bit => {
            let category = if tag == TypeTag::Bit { Bit } else { FixedNumeric };
            CodecEntry::new(tag, category, Some(1))
        }
        TypeTag::SmallInt | TypeTag::USmallInt | TypeTag::UShort => {
            CodecEntry::new(tag, FixedNumeric, Some(2))
        }
        TypeTag::Int | TypeTag::UInt | TypeTag::Real => CodecEntry::new(tag, FixedNumeric, Some(4)),
        TypeTag::BigInt | TypeTag::Long | TypeTag::UBigInt | TypeTag::Float => {
            CodecEntry::new(tag, FixedNumeric, Some(8))
        }
        TypeTag::Money => CodecEntry::new(tag, Money, Some(8)),
        TypeTag::Money4 => CodecEntry::new(tag, Money, Some(4)),
        TypeTag::DateTime => CodecEntry::new(tag, ShortDateTime, Some(8)),
        TypeTag::DateTime4 | TypeTag::Date | TypeTag::Time => {
            CodecEntry::new(tag, ShortDateTime, Some(4))
        }
        TypeTag::BigDateTime | TypeTag::BigTime => CodecEntry::new(tag, BigDateTime, Some(8)),
        TypeTag::Decimal | TypeTag::Numeric => {
            CodecEntry::new(tag, Decimal, Some(2 + MAX_NUMLEN))
        }
        TypeTag::Char => CodecEntry::new(tag, Char, None),
        TypeTag::VarChar => CodecEntry::new(tag, VarChar, Some(2 + MAX_CHAR)),
        TypeTag::Text | TypeTag::LongChar | TypeTag::Xml => CodecEntry::new(tag, Text, None),
        TypeTag::Binary | TypeTag::LongBinary => CodecEntry::new(tag, Binary, None),
        TypeTag::VarBinary => CodecEntry::new(tag, VarBinary, Some(2 + MAX_CHAR)),
        TypeTag::Image => CodecEntry::new(tag, Image, None),
        TypeTag::UniChar | TypeTag::UniText => CodecEntry::new(tag, Unicode, None),
        TypeTag::Sensitivity
        | TypeTag::Boundary
        | TypeTag::Void
        | TypeTag::Blob
        | TypeTag::TextLocator
        | TypeTag::ImageLocator
        | TypeTag::UniTextLocator
        | TypeTag::User => {
            return Err(DriverError::UnsupportedType(format!(
                "no codec for {} ({})",
                tag,
                tag.code()
            )))
        }
    };
    Ok(entry)
}

/// Look up the codec entry of a raw type code.
pub fn entry_for_code(code: i32) -> Result<CodecEntry> {
    let tag = TypeTag::from_code(code)
        .ok_or_else(|| DriverError::UnsupportedType(format!("unknown type code {}", code)))?;
    entry(tag)
}

// ============================================================================
// Value conversion
// ============================================================================

/// Convert an application value to the canonical value of `tag`.
///
/// The result is what decoding the encoded value yields again.
pub fn convert(tag: TypeTag, value: Value) -> Result<Value> {
    let entry = entry(tag)?;
    if value.is_null() {
        return Ok(Value::Null);
    }
    let mismatch = |value: &Value| {
        DriverError::conversion(tag, format!("cannot use a {} value", value.kind()))
    };

    match entry.category {
        Category::Bit => match value {
            Value::Bool(b) => Ok(Value::Bool(b)),
            Value::Int(0) | Value::UInt(0) => Ok(Value::Bool(false)),
            Value::Int(1) | Value::UInt(1) => Ok(Value::Bool(true)),
            other => Err(mismatch(&other)),
        },
        Category::FixedNumeric => match tag {
            TypeTag::Real => match value {
                Value::Float(f) => Ok(Value::Float(f as f32 as f64)),
                Value::Int(i) => Ok(Value::Float(i as f32 as f64)),
                Value::UInt(u) => Ok(Value::Float(u as f32 as f64)),
                other => Err(mismatch(&other)),
            },
            TypeTag::Float => match value {
                Value::Float(f) => Ok(Value::Float(f)),
                Value::Int(i) => Ok(Value::Float(i as f64)),
                Value::UInt(u) => Ok(Value::Float(u as f64)),
                other => Err(mismatch(&other)),
            },
            _ => convert_integer(tag, value),
        },
        Category::Money | Category::Decimal => {
            let dec = match value {
                Value::Decimal(d) => d,
                Value::Int(i) => i.to_string().parse()?,
                Value::UInt(u) => u.to_string().parse()?,
                Value::Text(s) => s.parse()?,
                other => return Err(mismatch(&other)),
            };
            match tag {
                TypeTag::Money => {
                    let units = money_units(tag, &dec)?;
                    Ok(Value::Decimal(money_decimal(units, 19)?))
                }
                TypeTag::Money4 => {
                    let units = money_units(tag, &dec)?;
                    let units = i32::try_from(units)
                        .map_err(|_| DriverError::conversion(tag, "value exceeds MONEY4 range"))?;
                    Ok(Value::Decimal(money_decimal(units as i64, 10)?))
                }
                _ => Ok(Value::Decimal(dec)),
            }
        }
        Category::ShortDateTime | Category::BigDateTime => match (tag, value) {
            (TypeTag::Date, Value::Date(d)) => Ok(Value::Date(d)),
            (TypeTag::Date, Value::DateTime(dt)) => Ok(Value::Date(dt.date())),
            (TypeTag::Time, Value::Time(t)) => Ok(Value::Time(round_ticks_time(t))),
            (TypeTag::Time, Value::DateTime(dt)) => Ok(Value::Time(round_ticks_time(dt.time()))),
            (TypeTag::BigTime, Value::Time(t)) => Ok(Value::Time(truncate_micros(t))),
            (TypeTag::BigTime, Value::DateTime(dt)) => Ok(Value::Time(truncate_micros(dt.time()))),
            (TypeTag::DateTime | TypeTag::DateTime4 | TypeTag::BigDateTime, Value::Date(d)) => {
                Ok(Value::DateTime(d.and_time(NaiveTime::MIN)))
            }
            (TypeTag::DateTime | TypeTag::DateTime4 | TypeTag::BigDateTime, Value::DateTime(dt)) => {
                let bytes = encode_payload(tag, &Value::DateTime(dt))?;
                decode(tag, &bytes)
            }
            (_, other) => Err(mismatch(&other)),
        },
        Category::Char | Category::VarChar | Category::Text | Category::Unicode => match value {
            Value::Text(s) => Ok(Value::Text(s)),
            Value::Bytes(b) => String::from_utf8(b)
                .map(Value::Text)
                .map_err(|e| DriverError::conversion(tag, format!("invalid UTF-8: {}", e))),
            other => Err(mismatch(&other)),
        },
        Category::Binary | Category::VarBinary | Category::Image => match value {
            Value::Bytes(b) => Ok(Value::Bytes(b)),
            Value::Text(s) => Ok(Value::Bytes(s.into_bytes())),
            other => Err(mismatch(&other)),
        },
    }
}

fn convert_integer(tag: TypeTag, value: Value) -> Result<Value> {
    let (min, max): (i128, i128) = match tag {
        TypeTag::TinyInt => (0, u8::MAX as i128),
        TypeTag::SmallInt => (i16::MIN as i128, i16::MAX as i128),
        TypeTag::Int => (i32::MIN as i128, i32::MAX as i128),
        TypeTag::BigInt | TypeTag::Long => (i64::MIN as i128, i64::MAX as i128),
        TypeTag::USmallInt | TypeTag::UShort => (0, u16::MAX as i128),
        TypeTag::UInt => (0, u32::MAX as i128),
        TypeTag::UBigInt => (0, u64::MAX as i128),
        _ => return Err(DriverError::conversion(tag, "not an integer type")),
    };
    let wide: i128 = match value {
        Value::Int(i) => i as i128,
        Value::UInt(u) => u as i128,
        Value::Bool(b) => b as i128,
        other => {
            return Err(DriverError::conversion(
                tag,
                format!("cannot use a {} value", other.kind()),
            ))
        }
    };
    if wide < min || wide > max {
        return Err(DriverError::conversion(
            tag,
            format!("{} outside {}..={}", wide, min, max),
        ));
    }
    if is_unsigned(tag) {
        Ok(Value::UInt(wide as u64))
    } else {
        Ok(Value::Int(wide as i64))
    }
}

/// Unsigned server types decode to `Value::UInt`.
fn is_unsigned(tag: TypeTag) -> bool {
    matches!(
        tag,
        TypeTag::USmallInt | TypeTag::UShort | TypeTag::UInt | TypeTag::UBigInt
    )
}

fn money_units(tag: TypeTag, dec: &Decimal) -> Result<i64> {
    let units = dec
        .mantissa_at_scale(4)
        .ok_or_else(|| DriverError::conversion(tag, format!("{} has more than 4 decimals", dec)))?;
    i64::try_from(units).map_err(|_| DriverError::conversion(tag, "value exceeds MONEY range"))
}

fn money_decimal(units: i64, precision: u8) -> Result<Decimal> {
    Decimal::new(units as i128, precision, 4)
}

fn round_ticks_time(t: NaiveTime) -> NaiveTime {
    let ticks = ticks_of(t);
    time_from_ticks(ticks.min(TICKS_PER_DAY - 1) as u32).unwrap_or(t)
}

fn truncate_micros(t: NaiveTime) -> NaiveTime {
    t.with_nanosecond(t.nanosecond() / 1_000 * 1_000).unwrap_or(t)
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a value as a parameter of type `tag`.
pub fn encode_param(tag: TypeTag, value: &Value) -> Result<ParamData> {
    let entry = entry(tag)?;
    let value = convert(tag, value.clone())?;

    let datatype = match tag {
        // IMAGE parameters travel as BINARY.
        TypeTag::Image => TypeTag::Binary.code(),
        other => other.code(),
    };
    let mut format = DataFormat {
        datatype,
        status: StatusFlags::INPUT_VALUE,
        maxlength: entry.byte_size.unwrap_or(0) as i32,
        ..DataFormat::default()
    };

    if value.is_null() {
        return Ok(ParamData {
            format,
            data: None,
            datalen: None,
        });
    }

    let data = encode_payload(tag, &value)?;
    let mut datalen = None;

    match entry.category {
        Category::Char => {
            format.format = FormatFlag::PadNull;
            format.maxlength = MAX_CHAR as i32;
            datalen = value.as_str().map(str::len);
        }
        Category::Text | Category::Unicode => {
            // Payload carries a NUL terminator which is not part of the data.
            let terminator = if entry.category == Category::Unicode { 2 } else { 1 };
            let len = data.len() - terminator;
            format.format = FormatFlag::NullTerm;
            format.maxlength = len as i32;
            datalen = Some(len);
        }
        Category::Binary | Category::Image => {
            if entry.category == Category::Binary {
                format.format = FormatFlag::PadNull;
            }
            format.maxlength = i32::MAX;
            datalen = Some(data.len());
        }
        Category::Bit => datalen = Some(1),
        Category::Decimal => {
            if let Value::Decimal(dec) = &value {
                format.precision = dec.precision() as i32;
                format.scale = dec.scale() as i32;
            }
        }
        _ => {}
    }

    Ok(ParamData {
        format,
        data: Some(data),
        datalen,
    })
}

/// Encode the payload bytes of a canonical value.
pub fn encode_payload(tag: TypeTag, value: &Value) -> Result<Bytes> {
    let entry = entry(tag)?;
    let mut buf = BytesMut::with_capacity(entry.byte_size.unwrap_or(16));
    let mismatch =
        || DriverError::conversion(tag, format!("cannot encode a {} value", value.kind()));

    match (tag, value) {
        (TypeTag::Bit, Value::Bool(b)) => buf.put_u8(u8::from(*b)),
        (TypeTag::TinyInt, v) => buf.put_u8(int_of::<u8>(tag, v)?),
        (TypeTag::SmallInt, v) => buf.put_i16_le(int_of::<i16>(tag, v)?),
        (TypeTag::Int, v) => buf.put_i32_le(int_of::<i32>(tag, v)?),
        (TypeTag::BigInt | TypeTag::Long, v) => buf.put_i64_le(int_of::<i64>(tag, v)?),
        (TypeTag::USmallInt | TypeTag::UShort, v) => buf.put_u16_le(int_of::<u16>(tag, v)?),
        (TypeTag::UInt, v) => buf.put_u32_le(int_of::<u32>(tag, v)?),
        (TypeTag::UBigInt, v) => buf.put_u64_le(int_of::<u64>(tag, v)?),
        (TypeTag::Real, Value::Float(f)) => buf.put_f32_le(*f as f32),
        (TypeTag::Float, Value::Float(f)) => buf.put_f64_le(*f),

        (TypeTag::Money, Value::Decimal(dec)) => {
            let units = money_units(tag, dec)?;
            buf.put_i32_le((units >> 32) as i32);
            buf.put_u32_le(units as u32);
        }
        (TypeTag::Money4, Value::Decimal(dec)) => {
            let units = i32::try_from(money_units(tag, dec)?)
                .map_err(|_| DriverError::conversion(tag, "value exceeds MONEY4 range"))?;
            buf.put_i32_le(units);
        }

        (TypeTag::DateTime, Value::DateTime(dt)) => {
            let mut ticks = ticks_of(dt.time());
            let mut days = days_since_1900(tag, dt.date())?;
            if ticks >= TICKS_PER_DAY {
                ticks -= TICKS_PER_DAY;
                days += 1;
            }
            let days = i32::try_from(days)
                .map_err(|_| DriverError::conversion(tag, "date outside DATETIME range"))?;
            buf.put_i32_le(days);
            buf.put_u32_le(ticks as u32);
        }
        (TypeTag::DateTime4, Value::DateTime(dt)) => {
            let seconds = dt.time().num_seconds_from_midnight() as i64;
            let mut minutes = (seconds + 30) / 60;
            let mut days = days_since_1900(tag, dt.date())?;
            if minutes >= 1440 {
                minutes -= 1440;
                days += 1;
            }
            let days = u16::try_from(days)
                .map_err(|_| DriverError::conversion(tag, "date outside DATETIME4 range"))?;
            buf.put_u16_le(days);
            buf.put_u16_le(minutes as u16);
        }
        (TypeTag::Date, Value::Date(d)) => {
            let days = i32::try_from(days_since_1900(tag, *d)?)
                .map_err(|_| DriverError::conversion(tag, "date outside DATE range"))?;
            buf.put_i32_le(days);
        }
        (TypeTag::Time, Value::Time(t)) => {
            let ticks = ticks_of(*t);
            buf.put_i32_le(ticks.min(TICKS_PER_DAY - 1) as i32);
        }
        (TypeTag::BigDateTime, Value::DateTime(dt)) => {
            let micros = (*dt - big_epoch())
                .num_microseconds()
                .and_then(|m| u64::try_from(m).ok())
                .ok_or_else(|| DriverError::conversion(tag, "timestamp outside BIGDATETIME range"))?;
            buf.put_u64_le(micros);
        }
        (TypeTag::BigTime, Value::Time(t)) => {
            let micros = t.num_seconds_from_midnight() as u64 * 1_000_000
                + (t.nanosecond() as u64 / 1_000).min(999_999);
            buf.put_u64_le(micros);
        }

        (TypeTag::Decimal | TypeTag::Numeric, Value::Decimal(dec)) => {
            buf.put_u8(dec.precision());
            buf.put_u8(dec.scale());
            let digits = dec.to_digit_bytes();
            buf.put_slice(&digits);
            buf.put_bytes(0, MAX_NUMLEN - digits.len());
        }

        (TypeTag::Char, Value::Text(s)) => {
            ensure_capacity(tag, s.len())?;
            buf.put_slice(s.as_bytes());
            buf.put_bytes(0, MAX_CHAR - s.len());
        }
        (TypeTag::VarChar, Value::Text(s)) => put_length_prefixed(tag, &mut buf, s.as_bytes())?,
        (TypeTag::Text | TypeTag::LongChar | TypeTag::Xml, Value::Text(s)) => {
            buf.put_slice(s.as_bytes());
            buf.put_u8(0);
        }
        (TypeTag::UniChar | TypeTag::UniText, Value::Text(s)) => {
            for unit in s.encode_utf16() {
                buf.put_u16_le(unit);
            }
            buf.put_u16_le(0);
        }

        (TypeTag::Binary | TypeTag::LongBinary | TypeTag::Image, Value::Bytes(b)) => {
            buf.put_slice(b)
        }
        (TypeTag::VarBinary, Value::Bytes(b)) => put_length_prefixed(tag, &mut buf, b)?,

        _ => return Err(mismatch()),
    }

    Ok(buf.freeze())
}

fn int_of<T: TryFrom<i128>>(tag: TypeTag, value: &Value) -> Result<T> {
    let wide: i128 = match value {
        Value::Int(i) => *i as i128,
        Value::UInt(u) => *u as i128,
        other => {
            return Err(DriverError::conversion(
                tag,
                format!("cannot encode a {} value", other.kind()),
            ))
        }
    };
    T::try_from(wide).map_err(|_| DriverError::conversion(tag, format!("{} out of range", wide)))
}

fn ensure_capacity(tag: TypeTag, len: usize) -> Result<()> {
    if len > MAX_CHAR {
        return Err(DriverError::conversion(
            tag,
            format!("{} bytes exceed the maximum of {}", len, MAX_CHAR),
        ));
    }
    Ok(())
}

fn put_length_prefixed(tag: TypeTag, buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    ensure_capacity(tag, data.len())?;
    buf.put_i16_le(data.len() as i16);
    buf.put_slice(data);
    buf.put_bytes(0, MAX_CHAR - data.len());
    Ok(())
}

fn date_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1900, 1, 1).unwrap_or(NaiveDate::MIN)
}

fn big_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(0, 1, 1)
        .unwrap_or(NaiveDate::MIN)
        .and_time(NaiveTime::MIN)
}

fn days_since_1900(tag: TypeTag, date: NaiveDate) -> Result<i64> {
    let days = (date - date_epoch()).num_days();
    if tag == TypeTag::DateTime4 && days < 0 {
        return Err(DriverError::conversion(tag, "date before 1900-01-01"));
    }
    Ok(days)
}

/// 1/300 second ticks since midnight, rounded to the nearest tick. May
/// equal `TICKS_PER_DAY` for the last instant of a day.
fn ticks_of(t: NaiveTime) -> u64 {
    let seconds = t.num_seconds_from_midnight() as u64;
    let nanos = t.nanosecond().min(999_999_999) as u64;
    seconds * TICKS_PER_SECOND + (nanos * TICKS_PER_SECOND + 500_000_000) / 1_000_000_000
}

fn date_from_days(tag: TypeTag, days: i64) -> Result<NaiveDate> {
    date_epoch()
        .checked_add_signed(Duration::days(days))
        .ok_or_else(|| DriverError::conversion(tag, format!("day {} out of range", days)))
}

fn time_from_ticks(ticks: u32) -> Option<NaiveTime> {
    let ticks = ticks as u64;
    let seconds = (ticks / TICKS_PER_SECOND) as u32;
    let nanos = ((ticks % TICKS_PER_SECOND) * 10_000_000 / 3) as u32;
    NaiveTime::from_num_seconds_from_midnight_opt(seconds, nanos)
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a payload of type `tag` into a value.
///
/// Unknown and unsupported tags fail with `UnsupportedType`; a payload
/// shorter than the type requires fails with `Conversion`.
pub fn decode(tag: TypeTag, data: &[u8]) -> Result<Value> {
    let entry = entry(tag)?;
    if let Some(size) = entry.byte_size {
        if data.len() < size {
            return Err(DriverError::conversion(
                tag,
                format!("expected {} bytes, got {}", size, data.len()),
            ));
        }
    }
    let mut buf = data;

    let value = match tag {
        TypeTag::Bit => Value::Bool(buf.get_u8() != 0),
        TypeTag::TinyInt => Value::Int(buf.get_u8() as i64),
        TypeTag::SmallInt => Value::Int(buf.get_i16_le() as i64),
        TypeTag::Int => Value::Int(buf.get_i32_le() as i64),
        TypeTag::BigInt | TypeTag::Long => Value::Int(buf.get_i64_le()),
        TypeTag::USmallInt | TypeTag::UShort => Value::UInt(buf.get_u16_le() as u64),
        TypeTag::UInt => Value::UInt(buf.get_u32_le() as u64),
        TypeTag::UBigInt => Value::UInt(buf.get_u64_le()),
        TypeTag::Real => Value::Float(buf.get_f32_le() as f64),
        TypeTag::Float => Value::Float(buf.get_f64_le()),

        TypeTag::Money => {
            let high = buf.get_i32_le() as i64;
            let low = buf.get_u32_le() as i64;
            Value::Decimal(money_decimal((high << 32) | low, 19)?)
        }
        TypeTag::Money4 => Value::Decimal(money_decimal(buf.get_i32_le() as i64, 10)?),

        TypeTag::DateTime => {
            let days = buf.get_i32_le() as i64;
            let ticks = buf.get_u32_le();
            if ticks as u64 >= TICKS_PER_DAY {
                return Err(DriverError::conversion(tag, format!("invalid tick count {}", ticks)));
            }
            let date = date_from_days(tag, days)?;
            let time = time_from_ticks(ticks)
                .ok_or_else(|| DriverError::conversion(tag, "invalid time of day"))?;
            Value::DateTime(date.and_time(time))
        }
        TypeTag::DateTime4 => {
            let days = buf.get_u16_le() as i64;
            let minutes = buf.get_u16_le() as u32;
            let time = NaiveTime::from_num_seconds_from_midnight_opt(minutes * 60, 0)
                .ok_or_else(|| DriverError::conversion(tag, format!("invalid minutes {}", minutes)))?;
            Value::DateTime(date_from_days(tag, days)?.and_time(time))
        }
        TypeTag::Date => Value::Date(date_from_days(tag, buf.get_i32_le() as i64)?),
        TypeTag::Time => {
            let ticks = u32::try_from(buf.get_i32_le())
                .map_err(|_| DriverError::conversion(tag, "negative tick count"))?;
            Value::Time(
                time_from_ticks(ticks)
                    .ok_or_else(|| DriverError::conversion(tag, "invalid time of day"))?,
            )
        }
        TypeTag::BigDateTime => {
            let micros = i64::try_from(buf.get_u64_le())
                .map_err(|_| DriverError::conversion(tag, "timestamp out of range"))?;
            Value::DateTime(
                big_epoch()
                    .checked_add_signed(Duration::microseconds(micros))
                    .ok_or_else(|| DriverError::conversion(tag, "timestamp out of range"))?,
            )
        }
        TypeTag::BigTime => {
            let micros = buf.get_u64_le();
            if micros >= MICROS_PER_DAY {
                return Err(DriverError::conversion(tag, format!("invalid time {}", micros)));
            }
            let time = NaiveTime::from_num_seconds_from_midnight_opt(
                (micros / 1_000_000) as u32,
                ((micros % 1_000_000) * 1_000) as u32,
            )
            .ok_or_else(|| DriverError::conversion(tag, "invalid time of day"))?;
            Value::Time(time)
        }

        TypeTag::Decimal | TypeTag::Numeric => {
            let precision = buf.get_u8();
            let scale = buf.get_u8();
            Value::Decimal(Decimal::from_digit_bytes(buf, precision, scale).map_err(|e| {
                DriverError::conversion(tag, format!("malformed decimal payload: {}", e))
            })?)
        }

        TypeTag::Char | TypeTag::Text | TypeTag::LongChar | TypeTag::Xml => {
            Value::Text(utf8(tag, until_nul(data))?)
        }
        TypeTag::VarChar => Value::Text(utf8(tag, length_prefixed(tag, buf)?)?),
        TypeTag::UniChar | TypeTag::UniText => Value::Text(utf16(tag, data)?),

        TypeTag::Binary | TypeTag::LongBinary | TypeTag::Image => Value::Bytes(data.to_vec()),
        TypeTag::VarBinary => Value::Bytes(length_prefixed(tag, buf)?.to_vec()),

        other => {
            return Err(DriverError::UnsupportedType(format!(
                "no decoder for {}",
                other
            )))
        }
    };

    Ok(value)
}

fn until_nul(data: &[u8]) -> &[u8] {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    &data[..end]
}

fn utf8(tag: TypeTag, data: &[u8]) -> Result<String> {
    std::str::from_utf8(data)
        .map(str::to_string)
        .map_err(|e| DriverError::conversion(tag, format!("invalid UTF-8: {}", e)))
}

fn utf16(tag: TypeTag, data: &[u8]) -> Result<String> {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|unit| *unit != 0)
        .collect();
    String::from_utf16(&units).map_err(|e| DriverError::conversion(tag, format!("invalid UTF-16: {}", e)))
}

fn length_prefixed(tag: TypeTag, mut buf: &[u8]) -> Result<&[u8]> {
    let len = buf.get_i16_le();
    let len = usize::try_from(len)
        .ok()
        .filter(|len| *len <= MAX_CHAR && *len <= buf.len())
        .ok_or_else(|| DriverError::conversion(tag, format!("invalid length prefix {}", len)))?;
    Ok(&buf[..len])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(tag: TypeTag, value: Value) {
        let canonical = convert(tag, value).unwrap();
        let bytes = encode_payload(tag, &canonical).unwrap();
        let decoded = decode(tag, &bytes).unwrap();
        assert_eq!(decoded, canonical, "roundtrip failed for {}", tag);
    }

    fn datetime(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn test_integer_boundaries() {
        roundtrip(TypeTag::TinyInt, Value::Int(0));
        roundtrip(TypeTag::TinyInt, Value::Int(255));
        roundtrip(TypeTag::SmallInt, Value::Int(i16::MIN as i64));
        roundtrip(TypeTag::SmallInt, Value::Int(i16::MAX as i64));
        roundtrip(TypeTag::Int, Value::Int(i32::MIN as i64));
        roundtrip(TypeTag::Int, Value::Int(i32::MAX as i64));
        roundtrip(TypeTag::BigInt, Value::Int(i64::MIN));
        roundtrip(TypeTag::BigInt, Value::Int(i64::MAX));
        roundtrip(TypeTag::Long, Value::Int(-1));
        roundtrip(TypeTag::USmallInt, Value::UInt(u16::MAX as u64));
        roundtrip(TypeTag::UShort, Value::UInt(0));
        roundtrip(TypeTag::UInt, Value::UInt(u32::MAX as u64));
        roundtrip(TypeTag::UBigInt, Value::UInt(u64::MAX));
    }

    #[test]
    fn test_integer_out_of_range_is_rejected() {
        assert!(convert(TypeTag::TinyInt, Value::Int(256)).is_err());
        assert!(convert(TypeTag::TinyInt, Value::Int(-1)).is_err());
        assert!(convert(TypeTag::Int, Value::Int(i32::MAX as i64 + 1)).is_err());
        assert!(convert(TypeTag::UInt, Value::Int(-5)).is_err());
        assert!(convert(TypeTag::Int, Value::Text("1".into())).is_err());
    }

    #[test]
    fn test_integers_are_little_endian() {
        let bytes = encode_payload(TypeTag::Int, &Value::Int(1)).unwrap();
        assert_eq!(&bytes[..], &[1, 0, 0, 0]);
        let bytes = encode_payload(TypeTag::SmallInt, &Value::Int(-2)).unwrap();
        assert_eq!(&bytes[..], &[0xfe, 0xff]);
    }

    #[test]
    fn test_floats() {
        roundtrip(TypeTag::Float, Value::Float(f64::MAX));
        roundtrip(TypeTag::Float, Value::Float(-0.125));
        roundtrip(TypeTag::Real, Value::Float(1.5));
        roundtrip(TypeTag::Real, Value::Float(f32::MIN as f64));
        // REAL narrows to single precision.
        assert_eq!(
            convert(TypeTag::Real, Value::Float(0.1)).unwrap(),
            Value::Float(0.1f32 as f64)
        );
    }

    #[test]
    fn test_bit() {
        roundtrip(TypeTag::Bit, Value::Bool(true));
        roundtrip(TypeTag::Bit, Value::Bool(false));
        assert_eq!(convert(TypeTag::Bit, Value::Int(1)).unwrap(), Value::Bool(true));
        assert!(convert(TypeTag::Bit, Value::Int(2)).is_err());
    }

    #[test]
    fn test_money() {
        let money: Decimal = "922337203685477.5807".parse().unwrap();
        roundtrip(TypeTag::Money, Value::Decimal(money));
        roundtrip(TypeTag::Money, Value::Decimal("-0.0001".parse().unwrap()));
        roundtrip(TypeTag::Money4, Value::Decimal("214748.3647".parse().unwrap()));
        roundtrip(TypeTag::Money4, Value::Int(-12));

        let decoded = decode(
            TypeTag::Money,
            &encode_payload(TypeTag::Money, &convert(TypeTag::Money, Value::Int(5)).unwrap())
                .unwrap(),
        )
        .unwrap();
        assert_eq!(decoded.clone(), Value::Decimal(Decimal::new(50000, 19, 4).unwrap()));
        if let Value::Decimal(d) = decoded {
            assert_eq!(d.to_string(), "5.0000");
        }

        assert!(convert(TypeTag::Money4, Value::Decimal("1.00001".parse().unwrap())).is_err());
        assert!(convert(TypeTag::Money4, Value::Int(300_000)).is_err());
    }

    #[test]
    fn test_money_layout_high_then_low() {
        let value = convert(TypeTag::Money, Value::Decimal(Decimal::new(1 << 32, 19, 4).unwrap()))
            .unwrap();
        let bytes = encode_payload(TypeTag::Money, &value).unwrap();
        assert_eq!(&bytes[..], &[1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_decimal_boundaries() {
        let max: Decimal = "99999999999999999999999999999999999999".parse().unwrap();
        assert_eq!(max.precision(), 38);
        roundtrip(TypeTag::Decimal, Value::Decimal(max));

        let all_scale = Decimal::new(-(10i128.pow(38) - 1), 38, 38).unwrap();
        roundtrip(TypeTag::Numeric, Value::Decimal(all_scale));
        roundtrip(TypeTag::Numeric, Value::Decimal("0.5".parse().unwrap()));
        roundtrip(TypeTag::Decimal, Value::Int(42));
    }

    #[test]
    fn test_decimal_param_carries_precision_and_scale() {
        let param = encode_param(TypeTag::Decimal, &Value::Decimal("12.345".parse().unwrap()))
            .unwrap();
        assert_eq!(param.format.precision, 5);
        assert_eq!(param.format.scale, 3);
        let data = param.data.unwrap();
        assert_eq!(data.len(), 2 + MAX_NUMLEN);
        assert_eq!(data[0], 5);
        assert_eq!(data[1], 3);
    }

    #[test]
    fn test_decimal_malformed_precision_fails() {
        let mut bytes = vec![0u8; 2 + MAX_NUMLEN];
        bytes[0] = 40;
        assert!(matches!(
            decode(TypeTag::Decimal, &bytes),
            Err(DriverError::Conversion { .. })
        ));
        bytes[0] = 5;
        bytes[1] = 6;
        assert!(decode(TypeTag::Decimal, &bytes).is_err());
    }

    #[test]
    fn test_short_datetimes() {
        roundtrip(TypeTag::DateTime, Value::DateTime(datetime(2024, 2, 29, 23, 59, 59)));
        roundtrip(TypeTag::DateTime, Value::DateTime(datetime(1753, 1, 1, 0, 0, 0)));
        roundtrip(TypeTag::DateTime4, Value::DateTime(datetime(2079, 6, 6, 23, 59, 0)));
        roundtrip(TypeTag::DateTime4, Value::DateTime(datetime(1900, 1, 1, 0, 0, 0)));
        roundtrip(
            TypeTag::Date,
            Value::Date(NaiveDate::from_ymd_opt(1, 1, 1).unwrap()),
        );
        roundtrip(
            TypeTag::Time,
            Value::Time(NaiveTime::from_hms_milli_opt(13, 14, 15, 100).unwrap()),
        );
    }

    #[test]
    fn test_datetime_layout() {
        let value = Value::DateTime(datetime(1900, 1, 2, 0, 0, 1));
        let bytes = encode_payload(TypeTag::DateTime, &value).unwrap();
        assert_eq!(&bytes[..], &[1, 0, 0, 0, 44, 1, 0, 0]);
    }

    #[test]
    fn test_datetime4_rounds_to_minutes() {
        let value = convert(TypeTag::DateTime4, Value::DateTime(datetime(2000, 1, 1, 10, 0, 45)))
            .unwrap();
        assert_eq!(value, Value::DateTime(datetime(2000, 1, 1, 10, 1, 0)));
        assert!(convert(TypeTag::DateTime4, Value::DateTime(datetime(1899, 12, 31, 0, 0, 0)))
            .is_err());
    }

    #[test]
    fn test_big_datetimes() {
        let precise = NaiveDate::from_ymd_opt(9999, 12, 31)
            .unwrap()
            .and_hms_micro_opt(23, 59, 59, 999_999)
            .unwrap();
        roundtrip(TypeTag::BigDateTime, Value::DateTime(precise));
        roundtrip(TypeTag::BigDateTime, Value::DateTime(datetime(1, 1, 1, 0, 0, 0)));
        roundtrip(
            TypeTag::BigTime,
            Value::Time(NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999).unwrap()),
        );
        let bytes = encode_payload(TypeTag::BigTime, &Value::Time(NaiveTime::MIN)).unwrap();
        assert_eq!(bytes.len(), 8);
    }

    #[test]
    fn test_character_types() {
        let max = "x".repeat(MAX_CHAR);
        roundtrip(TypeTag::Char, Value::Text(max.clone()));
        roundtrip(TypeTag::VarChar, Value::Text(max.clone()));
        roundtrip(TypeTag::VarChar, Value::Text(String::new()));
        roundtrip(TypeTag::Text, Value::Text("a much longer text ".repeat(100)));
        roundtrip(TypeTag::LongChar, Value::Text("long".into()));
        roundtrip(TypeTag::Xml, Value::Text("<a/>".into()));

        assert!(encode_payload(TypeTag::Char, &Value::Text("y".repeat(MAX_CHAR + 1))).is_err());
        assert!(encode_payload(TypeTag::VarChar, &Value::Text("y".repeat(MAX_CHAR + 1))).is_err());
    }

    #[test]
    fn test_char_is_null_padded() {
        let bytes = encode_payload(TypeTag::Char, &Value::Text("ab".into())).unwrap();
        assert_eq!(bytes.len(), MAX_CHAR);
        assert_eq!(&bytes[..3], b"ab\0");
        let param = encode_param(TypeTag::Char, &Value::Text("ab".into())).unwrap();
        assert_eq!(param.format.format, FormatFlag::PadNull);
        assert_eq!(param.datalen, Some(2));
    }

    #[test]
    fn test_varchar_length_prefix() {
        let bytes = encode_payload(TypeTag::VarChar, &Value::Text("abc".into())).unwrap();
        assert_eq!(&bytes[..5], &[3, 0, b'a', b'b', b'c']);
        let mut broken = bytes.to_vec();
        broken[0] = 0xff;
        broken[1] = 0x7f;
        assert!(decode(TypeTag::VarChar, &broken).is_err());
    }

    #[test]
    fn test_text_param_is_null_terminated() {
        let param = encode_param(TypeTag::Text, &Value::Text("hello".into())).unwrap();
        assert_eq!(param.format.format, FormatFlag::NullTerm);
        assert_eq!(param.datalen, Some(5));
        assert_eq!(param.format.maxlength, 5);
        assert_eq!(param.data.unwrap().last(), Some(&0));
    }

    #[test]
    fn test_unicode_types() {
        roundtrip(TypeTag::UniChar, Value::Text("grüße, 世界".into()));
        roundtrip(TypeTag::UniText, Value::Text("🦀".into()));
        roundtrip(TypeTag::UniText, Value::Text(String::new()));
        let param = encode_param(TypeTag::UniText, &Value::Text("ab".into())).unwrap();
        assert_eq!(param.datalen, Some(4));
        assert_eq!(param.format.format, FormatFlag::NullTerm);
    }

    #[test]
    fn test_binary_types() {
        roundtrip(TypeTag::Binary, Value::Bytes(vec![0xde, 0xad]));
        roundtrip(TypeTag::VarBinary, Value::Bytes(Vec::new()));
        roundtrip(TypeTag::VarBinary, Value::Bytes(vec![7u8; MAX_CHAR]));
        roundtrip(TypeTag::Image, Value::Bytes(Vec::new()));
        roundtrip(TypeTag::Image, Value::Bytes(vec![1u8; 100_000]));
        roundtrip(TypeTag::LongBinary, Value::Bytes(vec![0, 1, 2]));
    }

    #[test]
    fn test_image_param_travels_as_binary_without_padding() {
        let param = encode_param(TypeTag::Image, &Value::Bytes(vec![1, 2, 3])).unwrap();
        assert_eq!(param.format.datatype, TypeTag::Binary.code());
        assert_eq!(param.format.format, FormatFlag::Unused);
        assert_eq!(param.format.maxlength, i32::MAX);

        let param = encode_param(TypeTag::Binary, &Value::Bytes(vec![1])).unwrap();
        assert_eq!(param.format.format, FormatFlag::PadNull);
    }

    #[test]
    fn test_null_param_has_no_data() {
        let param = encode_param(TypeTag::Int, &Value::Null).unwrap();
        assert!(param.data.is_none());
        assert_eq!(param.format.status, StatusFlags::INPUT_VALUE);
    }

    #[test]
    fn test_unsupported_tags_fail_loudly() {
        for tag in [TypeTag::Void, TypeTag::Blob, TypeTag::User, TypeTag::TextLocator] {
            assert!(matches!(entry(tag), Err(DriverError::UnsupportedType(_))));
            assert!(matches!(decode(tag, &[0u8; 8]), Err(DriverError::UnsupportedType(_))));
        }
        assert!(matches!(entry_for_code(99), Err(DriverError::UnsupportedType(_))));
    }

    #[test]
    fn test_short_payload_is_rejected() {
        assert!(matches!(
            decode(TypeTag::BigInt, &[1, 2, 3]),
            Err(DriverError::Conversion { .. })
        ));
    }

    #[test]
    fn test_column_formats() {
        assert_eq!(entry(TypeTag::Char).unwrap().column_format, FormatFlag::PadNull);
        assert_eq!(entry(TypeTag::Binary).unwrap().column_format, FormatFlag::PadNull);
        assert_eq!(entry(TypeTag::Text).unwrap().column_format, FormatFlag::NullTerm);
        assert_eq!(entry(TypeTag::Xml).unwrap().column_format, FormatFlag::NullTerm);
        assert_eq!(entry(TypeTag::UniText).unwrap().column_format, FormatFlag::NullTerm);
        assert_eq!(entry(TypeTag::Int).unwrap().column_format, FormatFlag::Unused);
        assert_eq!(entry(TypeTag::Int).unwrap().buffer_len(0), 4);
        assert_eq!(entry(TypeTag::Text).unwrap().buffer_len(1024), 1024);
    }
}
