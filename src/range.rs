//! # Register Ranges
//!
//! Groups the protocol registers of one device into ranges, each read by a
//! single wire transaction.
//!
//! Registers are sorted by `(kind, address)`. A new range starts when
//!
//! - the register kind changes,
//! - the poll interval changes,
//! - more than `max_hole` unrequested addresses would separate the register
//!   from the current range, or
//! - the range would exceed the device's read limit for the kind.
//!
//! Unrequested addresses inside a range are read and ignored.

use std::fmt;
use std::time::Duration;

use crate::device_limits::DeviceLimits;
use crate::register::{DeviceId, RegisterId, RegisterKind};

/// A protocol register offered for polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeCandidate {
    pub register: RegisterId,
    pub kind: RegisterKind,
    pub address: u32,
    pub poll_interval: Duration,
}

/// A span of addresses read in one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRange {
    pub device: DeviceId,
    pub kind: RegisterKind,
    pub start_address: u32,
    pub count: u16,
    pub poll_interval: Duration,
    /// Requested registers, by ascending address
    pub registers: Vec<RangeCandidate>,
}

impl RegisterRange {
    /// Range holding exactly one register.
    pub fn single(device: DeviceId, candidate: RangeCandidate) -> Self {
        Self {
            device,
            kind: candidate.kind,
            start_address: candidate.address,
            count: 1,
            poll_interval: candidate.poll_interval,
            registers: vec![candidate],
        }
    }

    /// First address past the range.
    #[inline]
    pub fn end(&self) -> u32 {
        self.start_address + u32::from(self.count)
    }

    /// Position of `address` inside the range.
    #[inline]
    pub fn offset_of(&self, address: u32) -> Option<usize> {
        (address >= self.start_address && address < self.end())
            .then(|| (address - self.start_address) as usize)
    }

    /// Split into one range per requested register.
    pub fn split_singles(&self) -> Vec<RegisterRange> {
        self.registers
            .iter()
            .map(|&candidate| Self::single(self.device, candidate))
            .collect()
    }

    fn accepts(&self, candidate: &RangeCandidate, limits: &DeviceLimits) -> bool {
        if candidate.kind != self.kind || candidate.poll_interval != self.poll_interval {
            return false;
        }
        let hole = u32::from(limits.max_hole_for(self.kind));
        if candidate.address > self.end() + hole {
            return false;
        }
        let size = candidate.address - self.start_address + 1;
        size <= u32::from(limits.max_read_for(self.kind))
    }

    fn extend(&mut self, candidate: RangeCandidate) {
        // sorted input: address >= start
        let size = candidate.address - self.start_address + 1;
        if size > u32::from(self.count) {
            self.count = size as u16;
        }
        self.registers.push(candidate);
    }
}

impl fmt::Display for RegisterRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}..{})",
            self.device,
            self.kind,
            self.start_address,
            self.end()
        )
    }
}

/// Split the registers of one device into read ranges.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use voltage_serial::{split_register_list, DeviceId, DeviceLimits, RangeCandidate, RegisterId, RegisterKind};
///
/// let candidates: Vec<RangeCandidate> = [0, 1, 2, 10]
///     .into_iter()
///     .map(|address| RangeCandidate {
///         register: RegisterId(address),
///         kind: RegisterKind::HOLDING,
///         address,
///         poll_interval: Duration::from_millis(100),
///     })
///     .collect();
///
/// let limits = DeviceLimits::new().with_max_reg_hole(5);
/// let ranges = split_register_list(DeviceId(0), candidates, &limits);
/// assert_eq!(ranges.len(), 2);
/// assert_eq!((ranges[0].start_address, ranges[0].end()), (0, 3));
/// assert_eq!((ranges[1].start_address, ranges[1].end()), (10, 11));
/// ```
pub fn split_register_list(
    device: DeviceId,
    mut candidates: Vec<RangeCandidate>,
    limits: &DeviceLimits,
) -> Vec<RegisterRange> {
    candidates.sort_by_key(|c| (c.kind, c.address));
    candidates.dedup_by_key(|c| c.register);

    let mut ranges: Vec<RegisterRange> = Vec::new();
    for candidate in candidates {
        match ranges.last_mut() {
            Some(current) if current.accepts(&candidate, limits) => current.extend(candidate),
            _ => ranges.push(RegisterRange::single(device, candidate)),
        }
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(100);

    fn candidates(kind: RegisterKind, addresses: &[u32]) -> Vec<RangeCandidate> {
        addresses
            .iter()
            .map(|&address| RangeCandidate {
                register: RegisterId(address + if kind.is_bit() { 10_000 } else { 0 }),
                kind,
                address,
                poll_interval: INTERVAL,
            })
            .collect()
    }

    fn spans(ranges: &[RegisterRange]) -> Vec<(u32, u32)> {
        ranges.iter().map(|r| (r.start_address, r.end())).collect()
    }

    #[test]
    fn test_hole_bounds() {
        let input = candidates(RegisterKind::HOLDING, &[0, 1, 2, 10]);

        let limits = DeviceLimits::new().with_max_reg_hole(5);
        let ranges = split_register_list(DeviceId(0), input.clone(), &limits);
        assert_eq!(spans(&ranges), vec![(0, 3), (10, 11)]);

        let limits = DeviceLimits::new().with_max_reg_hole(10);
        let ranges = split_register_list(DeviceId(0), input, &limits);
        assert_eq!(spans(&ranges), vec![(0, 11)]);
        assert_eq!(ranges[0].registers.len(), 4);
    }

    #[test]
    fn test_no_hole_by_default() {
        let ranges = split_register_list(
            DeviceId(0),
            candidates(RegisterKind::INPUT, &[5, 3, 4, 7]),
            &DeviceLimits::new(),
        );
        assert_eq!(spans(&ranges), vec![(3, 6), (7, 8)]);
    }

    #[test]
    fn test_kind_change_splits() {
        let mut input = candidates(RegisterKind::HOLDING, &[0, 1]);
        input.extend(candidates(RegisterKind::COIL, &[0, 1]));

        let ranges = split_register_list(DeviceId(0), input, &DeviceLimits::new());
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].kind, RegisterKind::COIL);
        assert_eq!(ranges[1].kind, RegisterKind::HOLDING);
    }

    #[test]
    fn test_interval_change_splits() {
        let mut input = candidates(RegisterKind::HOLDING, &[0, 1, 2]);
        input[1].poll_interval = Duration::from_secs(1);

        let ranges = split_register_list(DeviceId(0), input, &DeviceLimits::new());
        assert_eq!(spans(&ranges), vec![(0, 1), (1, 2), (2, 3)]);
    }

    #[test]
    fn test_device_limit_caps_range() {
        let addresses: Vec<u32> = (0..10).collect();
        let limits = DeviceLimits::new().with_max_read_registers(4);
        let ranges = split_register_list(
            DeviceId(0),
            candidates(RegisterKind::HOLDING, &addresses),
            &limits,
        );
        assert_eq!(spans(&ranges), vec![(0, 4), (4, 8), (8, 10)]);
    }

    #[test]
    fn test_protocol_limit_caps_range() {
        let addresses: Vec<u32> = (0..300).collect();
        let ranges = split_register_list(
            DeviceId(0),
            candidates(RegisterKind::HOLDING, &addresses),
            &DeviceLimits::new(),
        );
        assert_eq!(spans(&ranges), vec![(0, 125), (125, 250), (250, 300)]);

        let bits: Vec<u32> = (0..2500).collect();
        let ranges = split_register_list(
            DeviceId(0),
            candidates(RegisterKind::COIL, &bits),
            &DeviceLimits::new(),
        );
        assert_eq!(spans(&ranges), vec![(0, 2000), (2000, 2500)]);
    }

    #[test]
    fn test_split_singles() {
        let limits = DeviceLimits::new().with_max_reg_hole(3);
        let ranges = split_register_list(
            DeviceId(1),
            candidates(RegisterKind::HOLDING, &[0, 2, 4]),
            &limits,
        );
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].offset_of(4), Some(4));
        assert_eq!(ranges[0].offset_of(5), None);

        let singles = ranges[0].split_singles();
        assert_eq!(spans(&singles), vec![(0, 1), (2, 3), (4, 5)]);
        assert!(singles.iter().all(|r| r.device == DeviceId(1)));
    }
}
