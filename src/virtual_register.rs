//! # Virtual Registers
//!
//! A virtual register is one published channel: a typed, scaled value whose
//! raw bits are spread over one or more protocol registers.
//!
//! ## Reading
//!
//! Each binding carries a `needs_read` flag. The scheduler raises the flags
//! before polling the registers and clears them as ranges arrive; only when
//! all are clear is [`VirtualRegister::read_value`] meaningful.
//!
//! ## Writing
//!
//! [`VirtualRegister::write_value`] performs a read-modify-write on the
//! cached value of each bound register, so a channel that uses a few bits of
//! a shared word never clobbers its neighbours.
//!
//! ## Error state
//!
//! Read and write outcomes are tracked on independent axes, see
//! [`ErrorState`].

use std::fmt;
use std::time::Duration;

use crate::bind::{bind, compose_value, split_value, BindInfo};
use crate::bytes::WordOrder;
use crate::config::RegisterConfig;
use crate::error::{SerialError, SerialResult};
use crate::register::{DeviceId, RegisterArena, RegisterId, RegisterKind};
use crate::value::{decode, encode, Scaling, ValueFormat};

/// Index of a virtual register inside a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualRegisterId(pub u32);

impl fmt::Display for VirtualRegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vreg#{}", self.0)
    }
}

// ============================================================================
// Error state
// ============================================================================

/// Combined read/write error state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorState {
    NoError,
    ReadError,
    WriteError,
    ReadWriteError,
    /// Nothing happened yet
    #[default]
    Unknown,
}

impl ErrorState {
    /// State after a read attempt; the write axis is kept.
    pub fn after_read(self, failed: bool) -> Self {
        let write_failed = self.has_write_error();
        match (failed, write_failed) {
            (true, true) => Self::ReadWriteError,
            (true, false) => Self::ReadError,
            (false, true) => Self::WriteError,
            (false, false) => Self::NoError,
        }
    }

    /// State after a write attempt; the read axis is kept.
    pub fn after_write(self, failed: bool) -> Self {
        let read_failed = self.has_read_error();
        match (read_failed, failed) {
            (true, true) => Self::ReadWriteError,
            (true, false) => Self::ReadError,
            (false, true) => Self::WriteError,
            (false, false) => Self::NoError,
        }
    }

    #[inline]
    pub fn has_read_error(&self) -> bool {
        matches!(self, Self::ReadError | Self::ReadWriteError)
    }

    #[inline]
    pub fn has_write_error(&self) -> bool {
        matches!(self, Self::WriteError | Self::ReadWriteError)
    }
}

// ============================================================================
// Value spec
// ============================================================================

/// Everything needed to convert between text and the raw channel value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueSpec {
    pub format: ValueFormat,
    pub scaling: Scaling,
    pub word_order: WordOrder,
    /// The whole value sits in one register wider than a word, so word
    /// order is applied to the value itself
    pub swap_words: bool,
}

impl ValueSpec {
    /// Raw channel value → text.
    pub fn encode(&self, raw: u64) -> String {
        encode(self.host_order(raw), self.format, &self.scaling)
    }

    /// Text → raw channel value.
    pub fn decode(&self, text: &str) -> SerialResult<u64> {
        decode(text, self.format, &self.scaling).map(|raw| self.host_order(raw))
    }

    #[inline]
    fn host_order(&self, raw: u64) -> u64 {
        if self.swap_words {
            self.word_order.apply(raw, self.format.width_bits())
        } else {
            raw
        }
    }
}

// ============================================================================
// Virtual register
// ============================================================================

/// A protocol register together with the window the channel uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub register: RegisterId,
    pub address: u32,
    pub info: BindInfo,
}

/// A logical channel bound to protocol-register bit windows.
#[derive(Debug, Clone)]
pub struct VirtualRegister {
    id: VirtualRegisterId,
    name: String,
    device: DeviceId,
    kind: RegisterKind,
    address: u32,
    /// Least significant first
    bindings: Vec<Binding>,
    spec: ValueSpec,
    error_value: Option<u64>,
    poll: bool,
    poll_interval: Duration,
    readonly: bool,
    last_read: Option<u64>,
    error_state: ErrorState,
}

impl VirtualRegister {
    /// Build a channel and intern its protocol registers.
    ///
    /// Fails with a fatal error when the layout does not fit the format or
    /// the format does not fit the register type.
    pub fn from_config(
        id: VirtualRegisterId,
        device: DeviceId,
        kind: RegisterKind,
        config: &RegisterConfig,
        default_interval: Duration,
        arena: &mut RegisterArena,
    ) -> SerialResult<Self> {
        let format = config.format.unwrap_or_else(|| kind.default_format());
        if config.scaling.scale == 0.0 || !config.scaling.scale.is_finite() {
            return Err(SerialError::config(format!(
                "register '{}': scale must be a non-zero number",
                config.name
            )));
        }

        let (format_width, bit_offset, bit_count) = if kind.is_bit() {
            if format.is_float() || format == ValueFormat::Char8 {
                return Err(SerialError::config(format!(
                    "register '{}': format {} is not valid for {} registers",
                    config.name, format, kind
                )));
            }
            if config.bit_offset != 0 || config.bit_width.is_some_and(|w| w != 1) {
                return Err(SerialError::bit_layout(format!(
                    "register '{}': {} registers hold a single bit",
                    config.name, kind
                )));
            }
            (1, 0, 1)
        } else {
            let width = format.width_bits();
            let count = config
                .bit_width
                .unwrap_or_else(|| width.saturating_sub(config.bit_offset));
            (width, config.bit_offset, count)
        };

        let layout = bind(
            format_width,
            bit_offset,
            bit_count,
            kind.width_bits(),
            config.word_order,
        )?;

        let bindings: Vec<Binding> = layout
            .iter()
            .map(|b| {
                let address = config.address + b.address_offset;
                Binding {
                    register: arena.intern(device, kind, address),
                    address,
                    info: b.info,
                }
            })
            .collect();

        let swap_words = bindings.len() == 1 && kind.width_bits() > 16;

        Ok(Self {
            id,
            name: config.name.clone(),
            device,
            kind,
            address: config.address,
            bindings,
            spec: ValueSpec {
                format,
                scaling: config.scaling,
                word_order: config.word_order,
                swap_words,
            },
            error_value: config.error_value,
            poll: config.poll,
            poll_interval: config.poll_interval.unwrap_or(default_interval),
            readonly: config.readonly || kind.is_read_only(),
            last_read: None,
            error_state: ErrorState::Unknown,
        })
    }

    #[inline]
    pub fn id(&self) -> VirtualRegisterId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    #[inline]
    pub fn kind(&self) -> RegisterKind {
        self.kind
    }

    #[inline]
    pub fn address(&self) -> u32 {
        self.address
    }

    #[inline]
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    #[inline]
    pub fn spec(&self) -> &ValueSpec {
        &self.spec
    }

    #[inline]
    pub fn error_state(&self) -> ErrorState {
        self.error_state
    }

    #[inline]
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    #[inline]
    pub fn is_polled(&self) -> bool {
        self.poll
    }

    #[inline]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Last raw value accepted from the device.
    #[inline]
    pub fn raw_value(&self) -> Option<u64> {
        self.last_read
    }

    /// Last value as published text.
    pub fn text_value(&self) -> Option<String> {
        self.last_read.map(|raw| self.spec.encode(raw))
    }

    /// Check if the channel uses this protocol register.
    pub fn uses(&self, register: RegisterId) -> bool {
        self.bindings.iter().any(|b| b.register == register)
    }

    // ------------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------------

    /// Raise all `needs_read` flags before the bound registers are polled.
    pub fn begin_read(&mut self) {
        for binding in &mut self.bindings {
            binding.info.needs_read = true;
        }
    }

    /// Note that a bound register was read.
    pub fn accept_read(&mut self, register: RegisterId) {
        for binding in self.bindings.iter_mut().filter(|b| b.register == register) {
            binding.info.needs_read = false;
        }
    }

    /// Check if every bound register was read.
    pub fn is_ready(&self) -> bool {
        self.bindings.iter().all(|b| !b.info.needs_read)
    }

    /// Reassemble the raw channel value from the arena.
    ///
    /// Returns `None` while some bound register still needs a read.
    pub fn read_value(&self, arena: &RegisterArena) -> Option<u64> {
        if !self.is_ready() {
            return None;
        }
        Some(compose_value(
            self.bindings
                .iter()
                .map(|b| (arena.value(b.register), &b.info)),
        ))
    }

    /// Check if a raw value is the configured error marker.
    #[inline]
    pub fn is_error_value(&self, raw: u64) -> bool {
        self.error_value == Some(raw)
    }

    /// Store a value read from the device; returns `true` if it changed.
    pub fn accept_value(&mut self, raw: u64) -> bool {
        let changed = self.last_read != Some(raw);
        self.last_read = Some(raw);
        changed
    }

    // ------------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------------

    /// New values of the bound registers after writing `value`.
    ///
    /// Bits outside each window keep their cached value. The result is
    /// ordered by ascending address.
    pub fn write_value(&self, arena: &RegisterArena, value: u64) -> Vec<(RegisterId, u32, u64)> {
        let fields = split_value(value, self.bindings.iter().map(|b| &b.info));
        let mut writes: Vec<(RegisterId, u32, u64)> = self
            .bindings
            .iter()
            .zip(fields)
            .map(|(b, field)| {
                let cached = arena.value(b.register);
                (b.register, b.address, b.info.merge(cached, field))
            })
            .collect();
        writes.sort_by_key(|&(_, address, _)| address);
        writes
    }

    // ------------------------------------------------------------------------
    // Error state
    // ------------------------------------------------------------------------

    /// Apply a read outcome; returns the new state if it changed.
    pub fn update_read_error(&mut self, failed: bool) -> Option<ErrorState> {
        self.transition(self.error_state.after_read(failed))
    }

    /// Apply a write outcome; returns the new state if it changed.
    pub fn update_write_error(&mut self, failed: bool) -> Option<ErrorState> {
        self.transition(self.error_state.after_write(failed))
    }

    fn transition(&mut self, next: ErrorState) -> Option<ErrorState> {
        if next == self.error_state {
            return None;
        }
        self.error_state = next;
        Some(next)
    }
}

impl fmt::Display for VirtualRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' ({} {}@{} {})",
            self.name, self.device, self.kind, self.address, self.spec.format
        )
    }
}
