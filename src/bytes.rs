//! # Word Order Handling
//!
//! Multi-word device values come in two layouts:
//!
//! - **BigEndian**: the most significant 16-bit word sits at the lowest address
//! - **LittleEndian**: the least significant word sits at the lowest address
//!
//! For a value spread over several protocol registers the order is applied
//! while binding (see [`crate::bind`]). For a single protocol register wider
//! than 16 bits the value is word-swapped instead, see [`WordOrder::apply`].
//!
//! For the 32-bit value `0x12345678`:
//! - `BigEndian`: words \[0x1234, 0x5678\]
//! - `LittleEndian`: words \[0x5678, 0x1234\]

use std::fmt;

/// Order of 16-bit words in a multi-word value.
///
/// # Example
///
/// ```rust
/// use voltage_serial::WordOrder;
///
/// let order = WordOrder::from_str("little_endian").unwrap();
/// assert_eq!(order, WordOrder::LittleEndian);
/// assert_eq!(order.apply(0x1234_5678, 32), 0x5678_1234);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WordOrder {
    /// Most significant word first (ABCD)
    #[default]
    BigEndian,

    /// Least significant word first (CDAB)
    LittleEndian,
}

impl WordOrder {
    /// Parse common string representations.
    ///
    /// - "big_endian", "BE", "ABCD" → BigEndian
    /// - "little_endian", "LE", "CDAB" → LittleEndian
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        match normalized.as_str() {
            "BIGENDIAN" | "BE" | "ABCD" => Some(Self::BigEndian),
            "LITTLEENDIAN" | "LE" | "CDAB" => Some(Self::LittleEndian),
            _ => None,
        }
    }

    /// Get descriptive name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BigEndian => "big_endian",
            Self::LittleEndian => "little_endian",
        }
    }

    /// Convert a raw value between device and host word order.
    ///
    /// `LittleEndian` reverses the 16-bit words of a `width_bits` wide value;
    /// `BigEndian` is the identity. Widths that are not a multiple of 16 bits,
    /// or fit a single word, are returned unchanged. The operation is its own
    /// inverse.
    #[inline]
    pub fn apply(&self, raw: u64, width_bits: u16) -> u64 {
        match self {
            Self::BigEndian => raw,
            Self::LittleEndian => swap_words(raw, width_bits),
        }
    }
}

impl fmt::Display for WordOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reverse the order of the 16-bit words of a `width_bits` wide value.
#[inline]
pub fn swap_words(raw: u64, width_bits: u16) -> u64 {
    if width_bits <= 16 || width_bits > 64 || width_bits % 16 != 0 {
        return raw;
    }
    let words = usize::from(width_bits / 16);
    let mut result = 0u64;
    for i in 0..words {
        let word = (raw >> (i * 16)) & 0xFFFF;
        result |= word << ((words - 1 - i) * 16);
    }
    result
}
