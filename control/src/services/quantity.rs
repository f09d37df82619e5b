//! Resource quantity grammar ("512Mi", "500m", "1.5", "2G", "1e3").
//!
//! Values are held as an integer count of nano-units so requests and limits
//! can be compared exactly.

use std::cmp::Ordering;
use std::fmt;

const NANO: i128 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quantity {
    nanos: i128,
}

impl Quantity {
    pub fn nanos(&self) -> i128 {
        self.nanos
    }

    pub fn is_zero(&self) -> bool {
        self.nanos == 0
    }

    /// Whole base units, rounded up (bytes for memory, cores for cpu).
    pub fn ceil_units(&self) -> i128 {
        (self.nanos + NANO - 1) / NANO
    }

    /// Milli-units, rounded up (millicores for cpu).
    pub fn ceil_millis(&self) -> i128 {
        (self.nanos + 999_999) / 1_000_000
    }
}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quantity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.nanos.cmp(&other.nanos)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantityError(String);

impl fmt::Display for QuantityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for QuantityError {}

fn err(input: &str, why: &str) -> QuantityError {
    QuantityError(format!("invalid quantity '{}': {}", input, why))
}

/// Multiplier in nano-units for a suffix.
fn suffix_multiplier(suffix: &str) -> Option<i128> {
    let m = match suffix {
        "" => NANO,
        "n" => 1,
        "u" => 1_000,
        "m" => 1_000_000,
        "k" => NANO * 1_000,
        "M" => NANO * 1_000_000,
        "G" => NANO * 1_000_000_000,
        "T" => NANO * 1_000_000_000_000,
        "P" => NANO * 1_000_000_000_000_000,
        "E" => NANO * 1_000_000_000_000_000_000,
        "Ki" => NANO << 10,
        "Mi" => NANO << 20,
        "Gi" => NANO << 30,
        "Ti" => NANO << 40,
        "Pi" => NANO << 50,
        "Ei" => NANO << 60,
        _ => return None,
    };
    Some(m)
}

pub fn parse_quantity(input: &str) -> Result<Quantity, QuantityError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(err(input, "empty"));
    }
    if s.starts_with('-') {
        return Err(err(input, "must not be negative"));
    }
    let s = s.strip_prefix('+').unwrap_or(s);

    let number_end = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(number_end);

    if number.is_empty() || number == "." {
        return Err(err(input, "missing numeric value"));
    }
    let mut parts = number.splitn(2, '.');
    let whole = parts.next().unwrap_or("");
    let frac = parts.next().unwrap_or("");
    if frac.contains('.') {
        return Err(err(input, "more than one decimal point"));
    }

    let digits = format!("{}{}", whole, frac);
    let mantissa: i128 = digits
        .parse()
        .map_err(|_| err(input, "numeric value out of range"))?;
    let mut scale_down: u32 = frac.len() as u32;

    let multiplier = match suffix_multiplier(suffix) {
        Some(m) => m,
        None => {
            // Decimal exponent form: 1e3, 2E-2
            let exp = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))
                .ok_or_else(|| err(input, "unknown unit suffix"))?;
            let exp: i32 = exp.parse().map_err(|_| err(input, "unknown unit suffix"))?;
            if exp >= 0 {
                10i128
                    .checked_pow(exp as u32)
                    .and_then(|p| p.checked_mul(NANO))
                    .ok_or_else(|| err(input, "exponent out of range"))?
            } else {
                scale_down += exp.unsigned_abs();
                NANO
            }
        }
    };

    let scaled = mantissa
        .checked_mul(multiplier)
        .ok_or_else(|| err(input, "value out of range"))?;
    let divisor = 10i128
        .checked_pow(scale_down)
        .ok_or_else(|| err(input, "too many decimal places"))?;

    Ok(Quantity {
        nanos: scaled / divisor,
    })
}
