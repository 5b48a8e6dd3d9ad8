//! Fixed precision decimal carried by NUMERIC, DECIMAL and MONEY columns.
//!
//! The value is kept as a scaled integer. Precision is at most 38 digits,
//! which always fits an `i128` mantissa.

use std::fmt;
use std::str::FromStr;

use crate::error::{DriverError, Result};
use crate::types::TypeTag;

/// Largest supported precision.
pub const MAX_PRECISION: u8 = 38;

/// Capacity of the digit array in a native decimal (`CS_MAX_NUMLEN`).
pub const MAX_NUMLEN: usize = 33;

/// A decimal number: `mantissa * 10^-scale` with `precision` significant digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Decimal {
    mantissa: i128,
    precision: u8,
    scale: u8,
}

impl Decimal {
    /// Create a decimal, validating precision, scale and magnitude.
    pub fn new(mantissa: i128, precision: u8, scale: u8) -> Result<Self> {
        if precision == 0 || precision > MAX_PRECISION {
            return Err(DriverError::conversion(
                TypeTag::Decimal,
                format!("precision {} outside 1..={}", precision, MAX_PRECISION),
            ));
        }
        if scale > precision {
            return Err(DriverError::conversion(
                TypeTag::Decimal,
                format!("scale {} exceeds precision {}", scale, precision),
            ));
        }
        if mantissa.unsigned_abs() >= pow10(precision) {
            return Err(DriverError::conversion(
                TypeTag::Decimal,
                format!("{} does not fit precision {}", mantissa, precision),
            ));
        }
        Ok(Self {
            mantissa,
            precision,
            scale,
        })
    }

    #[inline]
    pub fn mantissa(&self) -> i128 {
        self.mantissa
    }

    #[inline]
    pub fn precision(&self) -> u8 {
        self.precision
    }

    #[inline]
    pub fn scale(&self) -> u8 {
        self.scale
    }

    pub fn is_negative(&self) -> bool {
        self.mantissa < 0
    }

    /// Mantissa expressed with `scale` fractional digits, if no digits are lost.
    pub fn mantissa_at_scale(&self, scale: u8) -> Option<i128> {
        if scale >= self.scale {
            let factor = i128::try_from(pow10(scale - self.scale)).ok()?;
            self.mantissa.checked_mul(factor)
        } else {
            let factor = i128::try_from(pow10(self.scale - scale)).ok()?;
            if self.mantissa % factor != 0 {
                return None;
            }
            Some(self.mantissa / factor)
        }
    }

    /// Sign byte followed by the big-endian magnitude, `byte_size(precision)` long.
    pub fn to_digit_bytes(&self) -> Vec<u8> {
        let size = byte_size(self.precision);
        let mut out = Vec::with_capacity(size);
        out.push(u8::from(self.is_negative()));
        let magnitude = self.mantissa.unsigned_abs().to_be_bytes();
        out.extend_from_slice(&magnitude[magnitude.len() - (size - 1)..]);
        out
    }

    /// Inverse of [`Decimal::to_digit_bytes`] with precision and scale
    /// supplied out of band.
    pub fn from_digit_bytes(bytes: &[u8], precision: u8, scale: u8) -> Result<Self> {
        if precision == 0 || precision > MAX_PRECISION {
            return Err(DriverError::conversion(
                TypeTag::Decimal,
                format!("invalid precision {}", precision),
            ));
        }
        let size = byte_size(precision);
        if bytes.len() < size {
            return Err(DriverError::conversion(
                TypeTag::Decimal,
                format!("expected {} digit bytes, got {}", size, bytes.len()),
            ));
        }
        let negative = match bytes[0] {
            0 => false,
            1 => true,
            other => {
                return Err(DriverError::conversion(
                    TypeTag::Decimal,
                    format!("invalid sign byte {}", other),
                ))
            }
        };
        let mut magnitude = [0u8; 16];
        magnitude[16 - (size - 1)..].copy_from_slice(&bytes[1..size]);
        let magnitude = u128::from_be_bytes(magnitude);
        let mantissa = i128::try_from(magnitude).map_err(|_| {
            DriverError::conversion(TypeTag::Decimal, "magnitude exceeds 128 bits")
        })?;
        Self::new(if negative { -mantissa } else { mantissa }, precision, scale)
    }
}

/// Number of payload bytes for a decimal of the given precision: one sign
/// byte plus the bytes needed to hold `10^precision - 1`.
pub fn byte_size(precision: u8) -> usize {
    let limit = pow10(precision.clamp(1, MAX_PRECISION));
    let mut bytes = 1usize;
    while bytes < 16 && (1u128 << (8 * bytes)) < limit {
        bytes += 1;
    }
    bytes + 1
}

#[inline]
fn pow10(exp: u8) -> u128 {
    10u128.pow(exp as u32)
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.mantissa.unsigned_abs().to_string();
        let sign = if self.is_negative() { "-" } else { "" };
        let scale = self.scale as usize;
        if scale == 0 {
            return write!(f, "{}{}", sign, digits);
        }
        let padded = format!("{:0>width$}", digits, width = scale + 1);
        let (int_part, frac_part) = padded.split_at(padded.len() - scale);
        write!(f, "{}{}.{}", sign, int_part, frac_part)
    }
}

impl FromStr for Decimal {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || DriverError::conversion(TypeTag::Decimal, format!("invalid decimal '{}'", s));
        let s = s.trim();
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));
        if (int_part.is_empty() && frac_part.is_empty())
            || !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }

        let int_digits = int_part.trim_start_matches('0');
        let scale = u8::try_from(frac_part.len()).map_err(|_| invalid())?;
        let precision = u8::try_from((int_digits.len() + frac_part.len()).max(1))
            .map_err(|_| invalid())?
            .max(scale)
            .max(1);

        let combined = format!("{}{}", int_digits, frac_part);
        let magnitude: i128 = if combined.is_empty() {
            0
        } else {
            combined.parse().map_err(|_| invalid())?
        };
        Decimal::new(if negative { -magnitude } else { magnitude }, precision, scale)
    }
}
