//! # Value Codec
//!
//! Converts raw register values (a fixed-width unsigned integer) to and from
//! the text representation published for a channel.
//!
//! ## Formats
//!
//! | Format | Width | Text |
//! |--------|-------|------|
//! | U8..U64 | 8-64 | unsigned decimal |
//! | S8..S64 | 8-64 | signed decimal, sign-extended from the width |
//! | BCD8..BCD32 | 8-32 | decimal digits, two per byte, unscaled |
//! | Float | 32 | IEEE-754 single |
//! | Double | 64 | IEEE-754 double |
//! | Char8 | 8 | one character |
//!
//! ## Scaling
//!
//! Numeric formats (except BCD) are published as `raw * scale + offset`,
//! rounded to the nearest multiple of `round_to` when it is positive. With
//! the identity scaling no floating point is involved, so every raw value
//! survives `decode(encode(raw))`.

use std::fmt;

use crate::error::{FatalError, SerialError, SerialResult};

/// Value format of a channel.
///
/// # Example
///
/// ```rust
/// use voltage_serial::{decode, encode, Scaling, ValueFormat};
///
/// let text = encode(0xFFFE, ValueFormat::S16, &Scaling::default());
/// assert_eq!(text, "-2");
/// assert_eq!(decode("-2", ValueFormat::S16, &Scaling::default()).unwrap(), 0xFFFE);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueFormat {
    U8,
    U16,
    U24,
    U32,
    U64,
    S8,
    S16,
    S24,
    S32,
    S64,
    Bcd8,
    Bcd16,
    Bcd24,
    Bcd32,
    Float,
    Double,
    Char8,
}

impl ValueFormat {
    /// All supported formats.
    pub const ALL: [ValueFormat; 17] = [
        ValueFormat::U8,
        ValueFormat::U16,
        ValueFormat::U24,
        ValueFormat::U32,
        ValueFormat::U64,
        ValueFormat::S8,
        ValueFormat::S16,
        ValueFormat::S24,
        ValueFormat::S32,
        ValueFormat::S64,
        ValueFormat::Bcd8,
        ValueFormat::Bcd16,
        ValueFormat::Bcd24,
        ValueFormat::Bcd32,
        ValueFormat::Float,
        ValueFormat::Double,
        ValueFormat::Char8,
    ];

    /// Parse a format name ("u16", "s32", "bcd24", "float", ...).
    ///
    /// Unknown names are a configuration error.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(name: &str) -> SerialResult<Self> {
        let format = match name.to_ascii_lowercase().as_str() {
            "u8" => Self::U8,
            "u16" => Self::U16,
            "u24" => Self::U24,
            "u32" => Self::U32,
            "u64" => Self::U64,
            "s8" => Self::S8,
            "s16" => Self::S16,
            "s24" => Self::S24,
            "s32" => Self::S32,
            "s64" => Self::S64,
            "bcd8" => Self::Bcd8,
            "bcd16" => Self::Bcd16,
            "bcd24" => Self::Bcd24,
            "bcd32" => Self::Bcd32,
            "float" => Self::Float,
            "double" => Self::Double,
            "char8" => Self::Char8,
            _ => {
                return Err(FatalError::UnsupportedFormat {
                    name: name.to_string(),
                }
                .into())
            }
        };
        Ok(format)
    }

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U24 => "u24",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::S8 => "s8",
            Self::S16 => "s16",
            Self::S24 => "s24",
            Self::S32 => "s32",
            Self::S64 => "s64",
            Self::Bcd8 => "bcd8",
            Self::Bcd16 => "bcd16",
            Self::Bcd24 => "bcd24",
            Self::Bcd32 => "bcd32",
            Self::Float => "float",
            Self::Double => "double",
            Self::Char8 => "char8",
        }
    }

    /// Width of the raw value in bits.
    #[inline]
    pub fn width_bits(&self) -> u16 {
        match self {
            Self::U8 | Self::S8 | Self::Bcd8 | Self::Char8 => 8,
            Self::U16 | Self::S16 | Self::Bcd16 => 16,
            Self::U24 | Self::S24 | Self::Bcd24 => 24,
            Self::U32 | Self::S32 | Self::Bcd32 | Self::Float => 32,
            Self::U64 | Self::S64 | Self::Double => 64,
        }
    }

    /// Check if the format is a signed integer.
    #[inline]
    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            Self::S8 | Self::S16 | Self::S24 | Self::S32 | Self::S64
        )
    }

    /// Check if the format is packed BCD.
    #[inline]
    pub fn is_bcd(&self) -> bool {
        matches!(self, Self::Bcd8 | Self::Bcd16 | Self::Bcd24 | Self::Bcd32)
    }

    /// Check if the format is IEEE-754.
    #[inline]
    pub fn is_float(&self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }
}

impl fmt::Display for ValueFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Linear transform applied between raw and published values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scaling {
    /// Multiplier applied to the raw value
    pub scale: f64,
    /// Added after scaling
    pub offset: f64,
    /// Round the scaled value to a multiple of this; 0 disables rounding
    pub round_to: f64,
}

impl Default for Scaling {
    fn default() -> Self {
        Self {
            scale: 1.0,
            offset: 0.0,
            round_to: 0.0,
        }
    }
}

impl Scaling {
    /// Create scaling with the given multiplier.
    pub fn new(scale: f64) -> Self {
        Self {
            scale,
            ..Self::default()
        }
    }

    /// Set offset.
    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    /// Set rounding step.
    pub fn with_round_to(mut self, round_to: f64) -> Self {
        self.round_to = round_to;
        self
    }

    /// Check if values pass through unchanged.
    #[inline]
    pub fn is_identity(&self) -> bool {
        self.scale == 1.0 && self.offset == 0.0 && self.round_to == 0.0
    }

    /// Raw → published.
    #[inline]
    pub fn apply(&self, value: f64) -> f64 {
        round_value(value * self.scale + self.offset, self.round_to)
    }

    /// Published → raw (before integer rounding).
    #[inline]
    pub fn unapply(&self, value: f64) -> f64 {
        (value - self.offset) / self.scale
    }
}

/// Round to the nearest multiple of `round_to`; non-positive steps disable rounding.
#[inline]
pub fn round_value(value: f64, round_to: f64) -> f64 {
    if round_to > 0.0 {
        (value / round_to).round() * round_to
    } else {
        value
    }
}

/// Bit mask covering the low `width_bits` bits.
#[inline]
pub fn mask(width_bits: u16) -> u64 {
    if width_bits >= 64 {
        u64::MAX
    } else {
        (1u64 << width_bits) - 1
    }
}

/// Sign-extend the low `width_bits` bits of `raw`.
#[inline]
pub fn sign_extend(raw: u64, width_bits: u16) -> i64 {
    if width_bits == 0 {
        return 0;
    }
    if width_bits >= 64 {
        return raw as i64;
    }
    let shift = 64 - u32::from(width_bits);
    ((raw << shift) as i64) >> shift
}

// ============================================================================
// BCD
// ============================================================================

/// Decode packed BCD: per byte, low nibble × 1 and high nibble × 10, bytes
/// weighted by increasing powers of 100.
pub fn packed_bcd_to_int(raw: u64, bytes: usize) -> u64 {
    let mut result = 0u64;
    let mut weight = 1u64;
    for i in 0..bytes {
        let byte = (raw >> (i * 8)) & 0xFF;
        result += (byte & 0x0F) * weight;
        result += (byte >> 4) * weight * 10;
        weight *= 100;
    }
    result
}

/// Encode a decimal integer as packed BCD of `bytes` bytes.
///
/// Returns `None` if the number has more digits than fit.
pub fn int_to_packed_bcd(mut value: u64, bytes: usize) -> Option<u64> {
    let mut result = 0u64;
    for i in 0..bytes {
        let low = value % 10;
        value /= 10;
        let high = value % 10;
        value /= 10;
        result |= ((high << 4) | low) << (i * 8);
    }
    if value != 0 {
        None
    } else {
        Some(result)
    }
}

// ============================================================================
// Encode / Decode
// ============================================================================

/// Format a raw value as text.
pub fn encode(raw: u64, format: ValueFormat, scaling: &Scaling) -> String {
    let width = format.width_bits();
    match format {
        ValueFormat::Char8 => char::from((raw & 0xFF) as u8).to_string(),
        ValueFormat::Bcd8 | ValueFormat::Bcd16 | ValueFormat::Bcd24 | ValueFormat::Bcd32 => {
            packed_bcd_to_int(raw & mask(width), usize::from(width / 8)).to_string()
        }
        ValueFormat::Float => {
            let value = f32::from_bits((raw & 0xFFFF_FFFF) as u32);
            if scaling.is_identity() {
                value.to_string()
            } else {
                format_significant(scaling.apply(f64::from(value)), 7)
            }
        }
        ValueFormat::Double => {
            let value = f64::from_bits(raw);
            if scaling.is_identity() {
                value.to_string()
            } else {
                format_significant(scaling.apply(value), 15)
            }
        }
        _ if format.is_signed() => {
            let value = sign_extend(raw, width);
            if scaling.is_identity() {
                value.to_string()
            } else {
                format_significant(scaling.apply(value as f64), 15)
            }
        }
        _ => {
            let value = raw & mask(width);
            if scaling.is_identity() {
                value.to_string()
            } else {
                format_significant(scaling.apply(value as f64), 15)
            }
        }
    }
}

/// Parse text into a raw value.
///
/// The identity scaling parses integers directly. Values wider than the
/// format are truncated to its width.
pub fn decode(text: &str, format: ValueFormat, scaling: &Scaling) -> SerialResult<u64> {
    let width = format.width_bits();
    if format == ValueFormat::Char8 {
        // whitespace is a valid character here, so no trimming
        let mut chars = text.chars();
        return match (chars.next(), chars.next()) {
            (Some(c), None) if u32::from(c) < 0x100 => Ok(u64::from(u32::from(c))),
            _ => Err(SerialError::invalid_value(
                text,
                format,
                "expected a single character",
            )),
        };
    }

    let text = text.trim();
    match format {
        ValueFormat::Bcd8 | ValueFormat::Bcd16 | ValueFormat::Bcd24 | ValueFormat::Bcd32 => {
            let value: u64 = text
                .parse()
                .map_err(|e| SerialError::invalid_value(text, format, format!("{e}")))?;
            int_to_packed_bcd(value, usize::from(width / 8))
                .ok_or_else(|| SerialError::invalid_value(text, format, "too many digits"))
        }
        ValueFormat::Float => {
            let value = if scaling.is_identity() {
                text.parse::<f32>()
                    .map_err(|e| SerialError::invalid_value(text, format, format!("{e}")))?
            } else {
                scaling.unapply(parse_f64(text, format)?) as f32
            };
            Ok(u64::from(value.to_bits()))
        }
        ValueFormat::Double => {
            let value = parse_f64(text, format)?;
            let value = if scaling.is_identity() {
                value
            } else {
                scaling.unapply(value)
            };
            Ok(value.to_bits())
        }
        _ if scaling.is_identity() => {
            let value = if format.is_signed() {
                text.parse::<i64>()
                    .map(|v| v as u64)
                    .map_err(|e| SerialError::invalid_value(text, format, format!("{e}")))?
            } else {
                text.parse::<u64>()
                    .map_err(|e| SerialError::invalid_value(text, format, format!("{e}")))?
            };
            Ok(value & mask(width))
        }
        _ => {
            let value = scaling.unapply(parse_f64(text, format)?).round();
            if !value.is_finite() {
                return Err(SerialError::invalid_value(text, format, "not a finite number"));
            }
            let raw = if value < 0.0 {
                (value as i64) as u64
            } else {
                value as u64
            };
            Ok(raw & mask(width))
        }
    }
}

fn parse_f64(text: &str, format: ValueFormat) -> SerialResult<f64> {
    text.parse::<f64>()
        .map_err(|e| SerialError::invalid_value(text, format, format!("{e}")))
}

/// Format with `precision` significant digits, the way C's `%g` does:
/// fixed notation for moderate exponents, scientific otherwise, trailing
/// zeros removed.
pub fn format_significant(value: f64, precision: usize) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }
    let precision = precision.max(1);
    let scientific = format!("{:.*e}", precision - 1, value);
    let (mantissa, exponent) = match scientific.rsplit_once('e') {
        Some((m, e)) => (m.to_string(), e.parse::<i32>().unwrap_or(0)),
        None => return scientific,
    };

    if exponent < -4 || exponent >= precision as i32 {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!(
            "{}e{}{:02}",
            trim_fraction(&mantissa),
            sign,
            exponent.abs()
        )
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        trim_fraction(&format!("{:.*}", decimals, value))
    }
}

fn trim_fraction(s: &str) -> String {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_format_names() {
        for format in ValueFormat::ALL {
            assert_eq!(ValueFormat::from_str(format.as_str()).unwrap(), format);
        }
        let err = ValueFormat::from_str("u128").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_signed_encoding() {
        let s = Scaling::default();
        assert_eq!(encode(0xFF, ValueFormat::S8, &s), "-1");
        assert_eq!(encode(0x7FFF, ValueFormat::S16, &s), "32767");
        assert_eq!(encode(0x80_0000, ValueFormat::S24, &s), "-8388608");
        assert_eq!(encode(0xFFFF_FFFE, ValueFormat::S32, &s), "-2");
        assert_eq!(encode(u64::MAX, ValueFormat::S64, &s), "-1");
        // bits above the width are ignored
        assert_eq!(encode(0x1_0005, ValueFormat::U16, &s), "5");
    }

    #[test]
    fn test_scaled_encoding() {
        let s = Scaling::new(0.1);
        assert_eq!(encode(123, ValueFormat::U16, &s), "12.3");

        let s = Scaling::new(0.1).with_offset(-1.0);
        assert_eq!(encode(0xFFF6, ValueFormat::S16, &s), "-2");

        let s = Scaling::new(0.01).with_round_to(0.5);
        assert_eq!(encode(123, ValueFormat::U16, &s), "1");
        assert_eq!(encode(130, ValueFormat::U16, &s), "1.5");
    }

    #[test]
    fn test_float_encoding() {
        let pi = u64::from(std::f32::consts::PI.to_bits());
        assert_eq!(encode(pi, ValueFormat::Float, &Scaling::default()), "3.1415927");
        assert_eq!(encode(pi, ValueFormat::Float, &Scaling::new(2.0)), "6.283185");

        let e = std::f64::consts::E.to_bits();
        assert_eq!(
            encode(e, ValueFormat::Double, &Scaling::new(1.0).with_offset(1.0)),
            "3.71828182845905"
        );
    }

    #[test]
    fn test_bcd() {
        assert_eq!(packed_bcd_to_int(0x1234, 2), 1234);
        assert_eq!(packed_bcd_to_int(0x0099_9999, 3), 999_999);
        assert_eq!(int_to_packed_bcd(87_654_321, 4), Some(0x8765_4321));
        assert_eq!(int_to_packed_bcd(100, 1), None);

        // BCD ignores scaling
        assert_eq!(encode(0x1234, ValueFormat::Bcd16, &Scaling::new(10.0)), "1234");
        assert_eq!(
            decode("1234", ValueFormat::Bcd16, &Scaling::default()).unwrap(),
            0x1234
        );
        assert!(decode("12345", ValueFormat::Bcd16, &Scaling::default()).is_err());
    }

    #[test]
    fn test_char8() {
        let s = Scaling::default();
        assert_eq!(encode(0x41, ValueFormat::Char8, &s), "A");
        assert_eq!(decode("A", ValueFormat::Char8, &s).unwrap(), 0x41);
        assert!(decode("AB", ValueFormat::Char8, &s).is_err());
    }

    #[test]
    fn test_scaled_decoding() {
        let s = Scaling::new(0.1);
        assert_eq!(decode("12.3", ValueFormat::U16, &s).unwrap(), 123);
        assert_eq!(decode("-0.5", ValueFormat::S16, &s).unwrap(), 0xFFFB);

        let s = Scaling::new(2.0).with_offset(1.0);
        let raw = decode("7", ValueFormat::Float, &s).unwrap();
        assert_eq!(f32::from_bits(raw as u32), 3.0);
    }

    #[test]
    fn test_malformed_text() {
        let s = Scaling::default();
        for (text, format) in [
            ("abc", ValueFormat::U16),
            ("1.5", ValueFormat::U32),
            ("", ValueFormat::S8),
            ("x", ValueFormat::Float),
            ("nan?", ValueFormat::Double),
        ] {
            let err = decode(text, format, &s).unwrap_err();
            assert!(matches!(err, SerialError::InvalidValue { .. }), "{text}");
        }
    }

    #[test]
    fn test_format_significant() {
        assert_eq!(format_significant(0.0, 7), "0");
        assert_eq!(format_significant(100.0, 7), "100");
        assert_eq!(format_significant(1234567.0, 7), "1234567");
        assert_eq!(format_significant(12345678.0, 7), "1.234568e+07");
        assert_eq!(format_significant(0.0001, 7), "0.0001");
        assert_eq!(format_significant(0.00001234, 7), "1.234e-05");
        assert_eq!(format_significant(-2.5, 15), "-2.5");
    }

    fn raw_for(format: ValueFormat) -> BoxedStrategy<u64> {
        match format {
            ValueFormat::Bcd8 | ValueFormat::Bcd16 | ValueFormat::Bcd24 | ValueFormat::Bcd32 => {
                let bytes = usize::from(format.width_bits() / 8);
                (0..10u64.pow(2 * bytes as u32))
                    .prop_map(move |v| int_to_packed_bcd(v, bytes).unwrap_or(0))
                    .boxed()
            }
            ValueFormat::Float => any::<u32>()
                .prop_filter("nan", |b| !f32::from_bits(*b).is_nan())
                .prop_map(u64::from)
                .boxed(),
            ValueFormat::Double => any::<u64>()
                .prop_filter("nan", |b| !f64::from_bits(*b).is_nan())
                .boxed(),
            _ => {
                let m = mask(format.width_bits());
                any::<u64>().prop_map(move |v| v & m).boxed()
            }
        }
    }

    proptest! {
        #[test]
        fn prop_identity_round_trip(
            (format, raw) in proptest::sample::select(ValueFormat::ALL.to_vec())
                .prop_flat_map(|f| (Just(f), raw_for(f)))
        ) {
            let scaling = Scaling::default();
            let text = encode(raw, format, &scaling);
            prop_assert_eq!(decode(&text, format, &scaling).unwrap(), raw);
        }
    }
}
