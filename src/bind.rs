//! Bit-level binding of channels onto protocol registers.
//!
//! A channel of `format_width` bits may use only the bits
//! `[bit_offset, bit_offset + bit_count)` of that width. The width is laid
//! out over a block of consecutive protocol registers; [`bind`] computes which
//! registers of the block carry those bits and which window of each.
//!
//! Bindings are returned least significant first, and the channel value is
//! the concatenation of their windows in that order.

use crate::bytes::WordOrder;
use crate::error::{SerialError, SerialResult};
use crate::value::mask;

/// Bit window `[bit_start, bit_end)` of one protocol register, in
/// register-local coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindInfo {
    pub bit_start: u16,
    pub bit_end: u16,
    /// Cleared once the register was read in the current cycle
    pub needs_read: bool,
}

impl BindInfo {
    /// Create a window that still needs a read.
    pub fn new(bit_start: u16, bit_end: u16) -> Self {
        Self {
            bit_start,
            bit_end,
            needs_read: true,
        }
    }

    /// Number of bits in the window.
    #[inline]
    pub fn bit_count(&self) -> u16 {
        self.bit_end - self.bit_start
    }

    /// Mask of the window inside the register.
    #[inline]
    pub fn mask(&self) -> u64 {
        if self.bit_start >= 64 {
            return 0;
        }
        mask(self.bit_count()) << self.bit_start
    }

    /// Extract the window from a register value.
    #[inline]
    pub fn extract(&self, register_value: u64) -> u64 {
        if self.bit_start >= 64 {
            return 0;
        }
        (register_value >> self.bit_start) & mask(self.bit_count())
    }

    /// Replace the window in `cached` with `field`, keeping all other bits.
    #[inline]
    pub fn merge(&self, cached: u64, field: u64) -> u64 {
        if self.bit_start >= 64 {
            return cached;
        }
        (cached & !self.mask()) | ((field & mask(self.bit_count())) << self.bit_start)
    }
}

/// A window together with the register's position in the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitBinding {
    /// Offset from the channel's base address
    pub address_offset: u32,
    pub info: BindInfo,
}

/// Allocate the bit windows of a channel.
///
/// # Arguments
/// * `format_width` - width of the channel's value format in bits
/// * `bit_offset` - first used bit of that width
/// * `bit_count` - number of used bits
/// * `register_width` - width of one protocol register in bits
/// * `word_order` - `BigEndian` puts the most significant register at the
///   lowest address, `LittleEndian` the least significant one
///
/// # Example
///
/// ```rust
/// use voltage_serial::{bind, WordOrder};
///
/// // 32-bit value over two 16-bit registers, high word first
/// let bindings = bind(32, 0, 32, 16, WordOrder::BigEndian).unwrap();
/// assert_eq!(bindings.len(), 2);
/// assert_eq!(bindings[0].address_offset, 1); // low word
/// assert_eq!(bindings[1].address_offset, 0); // high word
/// ```
pub fn bind(
    format_width: u16,
    bit_offset: u16,
    bit_count: u16,
    register_width: u16,
    word_order: WordOrder,
) -> SerialResult<Vec<BitBinding>> {
    if register_width == 0 || format_width == 0 {
        return Err(SerialError::bit_layout("zero register or format width"));
    }
    if bit_count == 0 {
        return Err(SerialError::bit_layout("bit width must be positive"));
    }
    if bit_offset >= format_width {
        return Err(SerialError::bit_layout(format!(
            "bit offset {bit_offset} outside of {format_width}-bit value"
        )));
    }
    if u32::from(bit_offset) + u32::from(bit_count) > u32::from(format_width) {
        return Err(SerialError::bit_layout(format!(
            "bits {}..{} exceed {format_width}-bit value",
            bit_offset,
            u32::from(bit_offset) + u32::from(bit_count)
        )));
    }

    let block_len = u32::from(format_width.div_ceil(register_width));
    let begin = u32::from(bit_offset);
    let end = begin + u32::from(bit_count);
    let width = u32::from(register_width);

    let mut bindings = Vec::new();
    let mut index = begin / width;
    let mut allocated = 0u32;
    while allocated < u32::from(bit_count) {
        let register_begin = index * width;
        let register_end = register_begin + width;
        let start = begin.max(register_begin) - register_begin;
        let stop = end.min(register_end) - register_begin;

        let address_offset = match word_order {
            WordOrder::BigEndian => block_len - 1 - index,
            WordOrder::LittleEndian => index,
        };
        bindings.push(BitBinding {
            address_offset,
            info: BindInfo::new(start as u16, stop as u16),
        });
        allocated += stop - start;
        index += 1;
    }
    Ok(bindings)
}

/// Concatenate windows (least significant first) into one value.
pub fn compose_value<'a, I>(parts: I) -> u64
where
    I: IntoIterator<Item = (u64, &'a BindInfo)>,
{
    let mut value = 0u64;
    let mut shift = 0u32;
    for (register_value, info) in parts {
        if shift < 64 {
            value |= info.extract(register_value) << shift;
        }
        shift += u32::from(info.bit_count());
    }
    value
}

/// Cut a value into the fields of its windows (least significant first).
pub fn split_value<'a, I>(value: u64, infos: I) -> Vec<u64>
where
    I: IntoIterator<Item = &'a BindInfo>,
{
    let mut shift = 0u32;
    infos
        .into_iter()
        .map(|info| {
            let field = if shift < 64 {
                (value >> shift) & mask(info.bit_count())
            } else {
                0
            };
            shift += u32::from(info.bit_count());
            field
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_register() {
        let bindings = bind(16, 0, 16, 16, WordOrder::BigEndian).unwrap();
        assert_eq!(
            bindings,
            vec![BitBinding {
                address_offset: 0,
                info: BindInfo::new(0, 16)
            }]
        );
    }

    #[test]
    fn test_word_order() {
        let be = bind(64, 0, 64, 16, WordOrder::BigEndian).unwrap();
        let offsets: Vec<u32> = be.iter().map(|b| b.address_offset).collect();
        assert_eq!(offsets, vec![3, 2, 1, 0]);

        let le = bind(64, 0, 64, 16, WordOrder::LittleEndian).unwrap();
        let offsets: Vec<u32> = le.iter().map(|b| b.address_offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_window_crossing_registers() {
        // bits 12..20 of a 32-bit big-endian value
        let bindings = bind(32, 12, 8, 16, WordOrder::BigEndian).unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].address_offset, 1);
        assert_eq!((bindings[0].info.bit_start, bindings[0].info.bit_end), (12, 16));
        assert_eq!(bindings[1].address_offset, 0);
        assert_eq!((bindings[1].info.bit_start, bindings[1].info.bit_end), (0, 4));
    }

    #[test]
    fn test_skips_unused_registers() {
        // upper word only
        let bindings = bind(32, 16, 16, 16, WordOrder::LittleEndian).unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].address_offset, 1);
        assert_eq!(bindings[0].info.bit_count(), 16);
    }

    #[test]
    fn test_rejects_bad_layout() {
        assert!(bind(16, 16, 1, 16, WordOrder::BigEndian).unwrap_err().is_fatal());
        assert!(bind(16, 8, 9, 16, WordOrder::BigEndian).unwrap_err().is_fatal());
        assert!(bind(16, 0, 0, 16, WordOrder::BigEndian).unwrap_err().is_fatal());
    }

    #[test]
    fn test_merge_keeps_sibling_bits() {
        let info = BindInfo::new(4, 8);
        assert_eq!(info.merge(0xFFFF, 0x0), 0xFF0F);
        assert_eq!(info.merge(0x0000, 0xA), 0x00A0);
        assert_eq!(info.extract(0x00A0), 0xA);
    }

    #[test]
    fn test_compose_and_split() {
        let low = BindInfo::new(8, 16);
        let high = BindInfo::new(0, 4);
        let value = compose_value([(0xAB00, &low), (0x000C, &high)]);
        assert_eq!(value, 0xCAB);
        assert_eq!(split_value(0xCAB, [&low, &high]), vec![0xAB, 0xC]);
    }
}
