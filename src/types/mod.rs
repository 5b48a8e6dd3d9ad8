//! Server type tags and the generic value model.
//!
//! - `TypeTag`: enumerated identifier of a server-native type
//! - `Value`: the driver's generic value, independent of the server type
//! - `decimal`: fixed precision decimal used for NUMERIC, DECIMAL and MONEY
//! - `codec`: byte-level encode/decode rules per type tag

pub mod codec;
pub mod decimal;

use std::collections::HashMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use once_cell::sync::Lazy;

pub use codec::{Category, CodecEntry};
pub use decimal::Decimal;

// ============================================================================
// Type tags
// ============================================================================

/// Server-native type identifiers (`CS_*_TYPE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum TypeTag {
    Char = 0,
    Binary = 1,
    LongChar = 2,
    LongBinary = 3,
    Text = 4,
    Image = 5,
    TinyInt = 6,
    SmallInt = 7,
    Int = 8,
    Real = 9,
    Float = 10,
    Bit = 11,
    DateTime = 12,
    DateTime4 = 13,
    Money = 14,
    Money4 = 15,
    Numeric = 16,
    Decimal = 17,
    VarChar = 18,
    VarBinary = 19,
    Long = 20,
    Sensitivity = 21,
    Boundary = 22,
    Void = 23,
    UShort = 24,
    UniChar = 25,
    Blob = 26,
    Date = 27,
    Time = 28,
    UniText = 29,
    BigInt = 30,
    USmallInt = 31,
    UInt = 32,
    UBigInt = 33,
    Xml = 34,
    BigDateTime = 35,
    BigTime = 36,
    TextLocator = 37,
    ImageLocator = 38,
    UniTextLocator = 39,
    User = 100,
}

const ALL_TAGS: [TypeTag; 41] = [
    TypeTag::Char,
    TypeTag::Binary,
    TypeTag::LongChar,
    TypeTag::LongBinary,
    TypeTag::Text,
    TypeTag::Image,
    TypeTag::TinyInt,
    TypeTag::SmallInt,
    TypeTag::Int,
    TypeTag::Real,
    TypeTag::Float,
    TypeTag::Bit,
    TypeTag::DateTime,
    TypeTag::DateTime4,
    TypeTag::Money,
    TypeTag::Money4,
    TypeTag::Numeric,
    TypeTag::Decimal,
    TypeTag::VarChar,
    TypeTag::VarBinary,
    TypeTag::Long,
    TypeTag::Sensitivity,
    TypeTag::Boundary,
    TypeTag::Void,
    TypeTag::UShort,
    TypeTag::UniChar,
    TypeTag::Blob,
    TypeTag::Date,
    TypeTag::Time,
    TypeTag::UniText,
    TypeTag::BigInt,
    TypeTag::USmallInt,
    TypeTag::UInt,
    TypeTag::UBigInt,
    TypeTag::Xml,
    TypeTag::BigDateTime,
    TypeTag::BigTime,
    TypeTag::TextLocator,
    TypeTag::ImageLocator,
    TypeTag::UniTextLocator,
    TypeTag::User,
];

static TAGS_BY_NAME: Lazy<HashMap<&'static str, TypeTag>> =
    Lazy::new(|| ALL_TAGS.iter().map(|tag| (tag.name(), *tag)).collect());

impl TypeTag {
    /// Resolve a raw type code reported by the library.
    pub fn from_code(code: i32) -> Option<Self> {
        ALL_TAGS.iter().copied().find(|tag| tag.code() == code)
    }

    /// Resolve a native type name, case-insensitive.
    pub fn from_name(name: &str) -> Option<Self> {
        TAGS_BY_NAME.get(name.to_ascii_uppercase().as_str()).copied()
    }

    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Native type name as reported to applications.
    pub fn name(self) -> &'static str {
        match self {
            TypeTag::Char => "CHAR",
            TypeTag::Binary => "BINARY",
            TypeTag::LongChar => "LONGCHAR",
            TypeTag::LongBinary => "LONGBINARY",
            TypeTag::Text => "TEXT",
            TypeTag::Image => "IMAGE",
            TypeTag::TinyInt => "TINYINT",
            TypeTag::SmallInt => "SMALLINT",
            TypeTag::Int => "INT",
            TypeTag::Real => "REAL",
            TypeTag::Float => "FLOAT",
            TypeTag::Bit => "BIT",
            TypeTag::DateTime => "DATETIME",
            TypeTag::DateTime4 => "DATETIME4",
            TypeTag::Money => "MONEY",
            TypeTag::Money4 => "MONEY4",
            TypeTag::Numeric => "NUMERIC",
            TypeTag::Decimal => "DECIMAL",
            TypeTag::VarChar => "VARCHAR",
            TypeTag::VarBinary => "VARBINARY",
            TypeTag::Long => "LONG",
            TypeTag::Sensitivity => "SENSITIVITY",
            TypeTag::Boundary => "BOUNDARY",
            TypeTag::Void => "VOID",
            TypeTag::UShort => "USHORT",
            TypeTag::UniChar => "UNICHAR",
            TypeTag::Blob => "BLOB",
            TypeTag::Date => "DATE",
            TypeTag::Time => "TIME",
            TypeTag::UniText => "UNITEXT",
            TypeTag::BigInt => "BIGINT",
            TypeTag::USmallInt => "USMALLINT",
            TypeTag::UInt => "UINT",
            TypeTag::UBigInt => "UBIGINT",
            TypeTag::Xml => "XML",
            TypeTag::BigDateTime => "BIGDATETIME",
            TypeTag::BigTime => "BIGTIME",
            TypeTag::TextLocator => "TEXTLOCATOR",
            TypeTag::ImageLocator => "IMAGELOCATOR",
            TypeTag::UniTextLocator => "UNITEXTLOCATOR",
            TypeTag::User => "USER",
        }
    }

    /// Check if this is a character type (single byte or unicode).
    pub fn is_character(self) -> bool {
        matches!(
            self,
            TypeTag::Char
                | TypeTag::VarChar
                | TypeTag::Text
                | TypeTag::LongChar
                | TypeTag::Xml
                | TypeTag::UniChar
                | TypeTag::UniText
        )
    }

    /// Check if this is a binary type.
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            TypeTag::Binary | TypeTag::VarBinary | TypeTag::LongBinary | TypeTag::Image
        )
    }

    /// Check if this is an exact decimal type.
    pub fn is_decimal(self) -> bool {
        matches!(self, TypeTag::Decimal | TypeTag::Numeric)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Values
// ============================================================================

/// A driver value, independent of the server type it travels as.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short name of the variant, used in conversion errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::Decimal(_) => "decimal",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Date(_) => "date",
            Value::Time(_) => "time",
            Value::DateTime(_) => "datetime",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
