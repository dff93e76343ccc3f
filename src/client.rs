//! # Serial Client
//!
//! [`SerialClient`] owns one port, the devices behind it and every channel
//! configured on them. A single task drives it; nothing else touches the
//! port.
//!
//! # Architecture
//!
//! ```text
//!  producers ──set_text_value──► FlushQueue ──notify──┐
//!                                                      ▼
//!  PollPlan ──due entry──► SerialClient::cycle ──► Device ──► Port
//!                                │
//!                                └──► value / error callbacks
//! ```
//!
//! Each [`SerialClient::cycle`] waits for the next due poll entry. While
//! waiting it flushes pending writes, at most [`MAX_FLUSHES_PER_WAKE`] before
//! looking at the clock again, then polls the entry's ranges and publishes
//! the channels that changed. A due entry still lets one batch of writes
//! through before and after it.
//!
//! A device that is offline when an entry starts gets one failing range per
//! entry; the rest of its ranges wait until it answers again.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use voltage_serial::{
//!     DeviceConfig, PortConfig, ProtocolRegistry, RegisterConfig, SerialClient, TcpPort,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = PortConfig::new().with_device(
//!         DeviceConfig::new("io1", 1, "modbus")
//!             .with_register(RegisterConfig::new("temperature", "input", 10).with_scale(0.1)),
//!     );
//!
//!     let registry = ProtocolRegistry::with_builtin();
//!     let mut client = SerialClient::new(TcpPort::new("10.0.0.5:4001"), &config, &registry);
//!     client.on_value(|channel, text| println!("{} = {}", channel.name(), text));
//!
//!     client.run().await;
//! }
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{DeviceConfig, PortConfig};
use crate::constants::MAX_FLUSHES_PER_WAKE;
use crate::device::{ConnectionState, Device};
use crate::error::{PermanentError, SerialError, SerialResult};
use crate::poll_plan::PollPlan;
use crate::port::Port;
use crate::range::{split_register_list, RangeCandidate, RegisterRange};
use crate::register::{DeviceId, RegisterArena, RegisterId};
use crate::registry::ProtocolRegistry;
use crate::virtual_register::{ErrorState, ValueSpec, VirtualRegister, VirtualRegisterId};

/// Called with a channel and its new published value.
pub type ValueCallback = Box<dyn FnMut(&VirtualRegister, &str) + Send>;

/// Called with a channel and its new error state.
pub type ErrorCallback = Box<dyn FnMut(&VirtualRegister, ErrorState) + Send>;

/// Scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub cycles: u64,
    pub ranges_read: u64,
    pub range_errors: u64,
    pub flushes: u64,
    pub write_errors: u64,
}

// ============================================================================
// Write path shared with producers
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct WriteSlot {
    dirty: bool,
    pending: u64,
}

/// Pending writes, one slot per channel.
#[derive(Debug, Default)]
struct FlushQueue {
    slots: Mutex<Vec<WriteSlot>>,
    notify: Notify,
}

impl FlushQueue {
    fn with_len(len: usize) -> Self {
        Self {
            slots: Mutex::new(vec![WriteSlot::default(); len]),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<WriteSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark(&self, index: usize, raw: u64) {
        if let Some(slot) = self.lock().get_mut(index) {
            slot.dirty = true;
            slot.pending = raw;
        }
        self.notify.notify_one();
    }

    fn is_dirty(&self, index: usize) -> bool {
        self.lock().get(index).is_some_and(|slot| slot.dirty)
    }

    /// Clear and return up to `limit` dirty slots.
    fn take(&self, limit: usize) -> Vec<(usize, u64)> {
        self.lock()
            .iter_mut()
            .enumerate()
            .filter(|(_, slot)| slot.dirty)
            .take(limit)
            .map(|(index, slot)| {
                slot.dirty = false;
                (index, slot.pending)
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
struct ChannelInfo {
    name: String,
    spec: ValueSpec,
    readonly: bool,
}

/// Cloneable handle for setting channel values from other tasks.
///
/// Setting a value only marks the channel dirty and wakes the scheduler;
/// the write itself happens on the scheduler's task.
#[derive(Debug, Clone)]
pub struct WriteHandle {
    queue: Arc<FlushQueue>,
    channels: Arc<[ChannelInfo]>,
}

impl WriteHandle {
    /// Find a channel by name.
    pub fn find(&self, name: &str) -> Option<VirtualRegisterId> {
        self.channels
            .iter()
            .position(|c| c.name == name)
            .map(|index| VirtualRegisterId(index as u32))
    }

    /// Queue a write of a published-form value.
    ///
    /// Fails with [`SerialError::InvalidValue`] if the text does not fit the
    /// channel's format.
    pub fn set_text_value(&self, id: VirtualRegisterId, text: &str) -> SerialResult<()> {
        let channel = self.writable(id)?;
        let raw = channel.spec.decode(text)?;
        debug!("channel '{}' set to {} (raw {:#X})", channel.name, text, raw);
        self.queue.mark(id.0 as usize, raw);
        Ok(())
    }

    /// Queue a write of a raw channel value.
    pub fn set_raw_value(&self, id: VirtualRegisterId, raw: u64) -> SerialResult<()> {
        self.writable(id)?;
        self.queue.mark(id.0 as usize, raw);
        Ok(())
    }

    fn writable(&self, id: VirtualRegisterId) -> SerialResult<&ChannelInfo> {
        let channel = self
            .channels
            .get(id.0 as usize)
            .ok_or_else(|| SerialError::config(format!("unknown channel {id}")))?;
        if channel.readonly {
            return Err(PermanentError::Unsupported {
                operation: format!("write to read-only channel '{}'", channel.name),
            }
            .into());
        }
        Ok(channel)
    }
}

#[derive(Default)]
struct Callbacks {
    on_value: Option<ValueCallback>,
    on_error: Option<ErrorCallback>,
}

impl Callbacks {
    fn value(&mut self, channel: &VirtualRegister, text: &str) {
        if let Some(callback) = self.on_value.as_mut() {
            callback(channel, text);
        }
    }

    fn error(&mut self, channel: &VirtualRegister, state: Option<ErrorState>) {
        let Some(state) = state else {
            return;
        };
        debug!("channel '{}': {:?}", channel.name(), state);
        if let Some(callback) = self.on_error.as_mut() {
            callback(channel, state);
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Polling scheduler of one port.
pub struct SerialClient<P: Port> {
    port: P,
    poll_interval: Duration,
    devices: Vec<Device>,
    arena: RegisterArena,
    registers: Vec<VirtualRegister>,
    /// Polled channels by protocol register
    dependents: HashMap<RegisterId, Vec<usize>>,
    plan: PollPlan,
    queue: Arc<FlushQueue>,
    handle: WriteHandle,
    last_accessed: Option<DeviceId>,
    callbacks: Callbacks,
    stats: ClientStats,
}

impl<P: Port> SerialClient<P> {
    /// Build devices and channels from the configuration.
    ///
    /// A device whose configuration is invalid is logged and left out; the
    /// other devices are unaffected.
    pub fn new(port: P, config: &PortConfig, registry: &ProtocolRegistry) -> Self {
        let mut devices = Vec::new();
        let mut arena = RegisterArena::new();
        let mut registers = Vec::new();

        for (index, device_config) in config.devices.iter().enumerate() {
            let id = DeviceId(index as u16);
            match build_device(id, config, device_config, registry, &mut arena, registers.len()) {
                Ok((device, channels)) => {
                    info!(
                        "device {} ready with {} channels",
                        device,
                        channels.len()
                    );
                    devices.push(device);
                    registers.extend(channels);
                }
                Err(e) => error!("device '{}': initialization failed: {}", device_config.name, e),
            }
        }

        let mut dependents: HashMap<RegisterId, Vec<usize>> = HashMap::new();
        for (index, channel) in registers.iter().enumerate() {
            if channel.is_polled() {
                for binding in channel.bindings() {
                    dependents.entry(binding.register).or_default().push(index);
                }
            }
        }

        let plan = PollPlan::new(build_ranges(&devices, &registers), Instant::now());
        let queue = Arc::new(FlushQueue::with_len(registers.len()));
        let handle = WriteHandle {
            queue: Arc::clone(&queue),
            channels: registers
                .iter()
                .map(|r| ChannelInfo {
                    name: r.name().to_string(),
                    spec: *r.spec(),
                    readonly: r.is_readonly(),
                })
                .collect(),
        };

        Self {
            port,
            poll_interval: config.poll_interval,
            devices,
            arena,
            registers,
            dependents,
            plan,
            queue,
            handle,
            last_accessed: None,
            callbacks: Callbacks::default(),
            stats: ClientStats::default(),
        }
    }

    /// Set the callback for changed channel values.
    pub fn on_value<F>(&mut self, callback: F)
    where
        F: FnMut(&VirtualRegister, &str) + Send + 'static,
    {
        self.callbacks.on_value = Some(Box::new(callback));
    }

    /// Set the callback for changed channel error states.
    pub fn on_error<F>(&mut self, callback: F)
    where
        F: FnMut(&VirtualRegister, ErrorState) + Send + 'static,
    {
        self.callbacks.on_error = Some(Box::new(callback));
    }

    /// Handle for queueing writes from other tasks.
    pub fn write_handle(&self) -> WriteHandle {
        self.handle.clone()
    }

    /// Queue a write of a published-form value.
    pub fn set_text_value(&self, id: VirtualRegisterId, text: &str) -> SerialResult<()> {
        self.handle.set_text_value(id, text)
    }

    /// Find a channel by name.
    pub fn find(&self, name: &str) -> Option<VirtualRegisterId> {
        self.handle.find(name)
    }

    pub fn virtual_register(&self, id: VirtualRegisterId) -> Option<&VirtualRegister> {
        self.registers.get(id.0 as usize)
    }

    pub fn virtual_registers(&self) -> &[VirtualRegister] {
        &self.registers
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn arena(&self) -> &RegisterArena {
        &self.arena
    }

    pub fn plan(&self) -> &PollPlan {
        &self.plan
    }

    pub fn stats(&self) -> ClientStats {
        self.stats
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    /// Open the port unless it is open already.
    pub async fn connect(&mut self) -> SerialResult<()> {
        if self.port.is_open() {
            return Ok(());
        }
        self.port.open().await?;
        self.last_accessed = None;
        info!("port opened");
        Ok(())
    }

    /// Close the port.
    pub async fn close(&mut self) -> SerialResult<()> {
        self.last_accessed = None;
        self.port.close().await
    }

    /// Poll forever. Cycle failures are logged and retried after the
    /// poll interval.
    pub async fn run(&mut self) {
        loop {
            if let Err(e) = self.cycle().await {
                warn!("poll cycle failed: {}", e);
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }

    /// Run one scheduling step.
    ///
    /// Waits for the next due entry while flushing pending writes, then
    /// polls that entry. Up to [`MAX_FLUSHES_PER_WAKE`] writes also go out
    /// before and after every poll, so overdue polls do not starve writers.
    /// Returns after the idle wait when nothing is scheduled.
    pub async fn cycle(&mut self) -> SerialResult<()> {
        self.connect().await?;

        if let Some(index) = self.wait_for_due().await {
            self.arena.begin_cycle();
            self.poll_entry(index).await;
            self.plan.reschedule(index, Instant::now());
            self.flush(MAX_FLUSHES_PER_WAKE).await;
        }

        let now = Instant::now();
        for device in &mut self.devices {
            device.end_poll_cycle(now);
        }
        self.stats.cycles += 1;
        Ok(())
    }

    async fn wait_for_due(&mut self) -> Option<usize> {
        let idle_deadline = Instant::now() + self.poll_interval;
        loop {
            let now = Instant::now();
            if let Some(index) = self.plan.pop_due(now) {
                self.flush(MAX_FLUSHES_PER_WAKE).await;
                return Some(index);
            }
            let deadline = self.plan.next_due().unwrap_or(idle_deadline);
            if deadline <= now {
                return None;
            }
            if self.flush(MAX_FLUSHES_PER_WAKE).await > 0 {
                continue;
            }

            let queue = Arc::clone(&self.queue);
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = queue.notify.notified() => {}
            }
        }
    }

    fn device_index(&self, id: DeviceId) -> Option<usize> {
        self.devices.iter().position(|d| d.id() == id)
    }

    /// Run the device's prepare hook when the bus moves to it.
    async fn switch_to(&mut self, index: usize) -> SerialResult<()> {
        let id = self.devices[index].id();
        if self.last_accessed == Some(id) {
            return Ok(());
        }
        self.last_accessed = Some(id);
        let result = self.devices[index].prepare(&mut self.port).await;
        if result.is_err() {
            self.last_accessed = None;
        }
        result
    }

    // ------------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------------

    /// Write up to `limit` dirty channels; returns how many were taken.
    async fn flush(&mut self, limit: usize) -> usize {
        let pending = self.queue.take(limit);
        for &(index, raw) in &pending {
            self.flush_channel(index, raw).await;
        }
        pending.len()
    }

    async fn flush_channel(&mut self, index: usize, raw: u64) {
        let Some(channel) = self.registers.get(index) else {
            return;
        };
        let kind = channel.kind();
        let writes = channel.write_value(&self.arena, raw);
        let Some(device) = self.device_index(channel.device()) else {
            return;
        };
        self.stats.flushes += 1;

        let mut result = self.switch_to(device).await;
        let mut start = 0;
        while result.is_ok() && start < writes.len() {
            let mut end = start + 1;
            while end < writes.len() && writes[end].1 == writes[end - 1].1 + 1 {
                end += 1;
            }
            let run = &writes[start..end];
            let values: Vec<u64> = run.iter().map(|&(_, _, value)| value).collect();
            result = self.devices[device]
                .write_registers(&mut self.port, kind, run[0].1, &values)
                .await;
            if result.is_ok() {
                for &(register, _, value) in run {
                    self.arena.set_written_value(register, value);
                }
            }
            start = end;
        }

        let channel = &mut self.registers[index];
        match result {
            Ok(()) => {
                let state = channel.update_write_error(false);
                self.callbacks.error(channel, state);
                if channel.accept_value(raw) {
                    let text = channel.spec().encode(raw);
                    self.callbacks.value(channel, &text);
                }
            }
            Err(e) => {
                self.stats.write_errors += 1;
                warn!("write to {} failed: {}", channel, e);
                let state = channel.update_write_error(true);
                self.callbacks.error(channel, state);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------------

    async fn poll_entry(&mut self, index: usize) {
        let ranges = match self.plan.entry(index) {
            Some(entry) => entry.ranges.clone(),
            None => return,
        };

        let in_entry: HashSet<RegisterId> = ranges
            .iter()
            .flat_map(|r| r.registers.iter().map(|c| c.register))
            .collect();
        let affected: BTreeSet<usize> = in_entry
            .iter()
            .filter_map(|register| self.dependents.get(register))
            .flatten()
            .copied()
            .collect();
        // registers polled by other entries count once they hold a value
        let arena = &self.arena;
        for &i in &affected {
            let channel = &mut self.registers[i];
            channel.begin_read();
            let outside: Vec<RegisterId> = channel
                .bindings()
                .iter()
                .map(|b| b.register)
                .filter(|register| !in_entry.contains(register) && arena.has_value(*register))
                .collect();
            for register in outside {
                channel.accept_read(register);
            }
        }

        // Devices offline at the start of the entry get one range per entry
        // until something answers.
        let offline: HashSet<DeviceId> = self
            .devices
            .iter()
            .filter(|d| d.connection_state() == ConnectionState::Disconnected)
            .map(|d| d.id())
            .collect();
        let mut answered: HashMap<DeviceId, bool> = HashMap::new();

        let mut replacements = Vec::new();
        let mut published = HashSet::new();
        for (position, range) in ranges.iter().enumerate() {
            let Some(device) = self.device_index(range.device) else {
                continue;
            };
            if offline.contains(&range.device) && answered.get(&range.device) == Some(&false) {
                debug!("{}: offline, {} skipped", self.devices[device], range);
                continue;
            }
            let result = match self.switch_to(device).await {
                Ok(()) => {
                    self.devices[device]
                        .read_range(&mut self.port, range, &mut self.arena)
                        .await
                }
                Err(e) => Err(e),
            };

            let alive = match &result {
                Ok(()) => true,
                Err(e) => e.is_permanent(),
            };
            *answered.entry(range.device).or_insert(false) |= alive;

            match result {
                Ok(()) => {
                    self.stats.ranges_read += 1;
                    self.accept_range(range, &mut published);
                }
                Err(e) => {
                    self.stats.range_errors += 1;
                    self.fail_range(range);
                    match e {
                        SerialError::Permanent(_) => {
                            warn!("{}: {} unavailable: {}", self.devices[device], range, e);
                            replacements.push((position, unavailable(range)));
                        }
                        SerialError::Fatal(_) => {
                            error!("{}: {} dropped: {}", self.devices[device], range, e);
                            replacements.push((position, Vec::new()));
                        }
                        _ => warn!("{}: failed to read {}: {}", self.devices[device], range, e),
                    }
                }
            }
        }

        for (position, replacement) in replacements.into_iter().rev() {
            self.plan.replace_range(index, position, replacement);
        }
    }

    fn accept_range(&mut self, range: &RegisterRange, published: &mut HashSet<usize>) {
        let mut ready = BTreeSet::new();
        for candidate in &range.registers {
            if !self.arena.was_read(candidate.register) {
                continue;
            }
            for &i in self.dependents.get(&candidate.register).into_iter().flatten() {
                self.registers[i].accept_read(candidate.register);
                ready.insert(i);
            }
        }
        for i in ready {
            if self.registers[i].is_ready() && published.insert(i) {
                self.publish(i);
            }
        }
    }

    fn publish(&mut self, index: usize) {
        let channel = &mut self.registers[index];
        let Some(raw) = channel.read_value(&self.arena) else {
            return;
        };
        if channel.is_error_value(raw) {
            debug!("{} reported its error value {:#X}", channel, raw);
            let state = channel.update_read_error(true);
            self.callbacks.error(channel, state);
            return;
        }

        let state = channel.update_read_error(false);
        self.callbacks.error(channel, state);

        if self.queue.is_dirty(index) {
            debug!("{}: write pending, read value {:#X} ignored", channel, raw);
            return;
        }
        if channel.accept_value(raw) {
            let text = channel.spec().encode(raw);
            self.callbacks.value(channel, &text);
        }
    }

    fn fail_range(&mut self, range: &RegisterRange) {
        let failed: BTreeSet<usize> = range
            .registers
            .iter()
            .filter_map(|c| self.dependents.get(&c.register))
            .flatten()
            .copied()
            .collect();
        for i in failed {
            let channel = &mut self.registers[i];
            let state = channel.update_read_error(true);
            self.callbacks.error(channel, state);
        }
    }
}

/// Replacement for a range the device refused: single registers, or nothing
/// when it already was one.
fn unavailable(range: &RegisterRange) -> Vec<RegisterRange> {
    if range.registers.len() > 1 {
        info!("{} split into single registers", range);
        range.split_singles()
    } else {
        warn!("{} disabled until reconfiguration", range);
        Vec::new()
    }
}

fn build_device(
    id: DeviceId,
    port: &PortConfig,
    config: &DeviceConfig,
    registry: &ProtocolRegistry,
    arena: &mut RegisterArena,
    first_channel: usize,
) -> SerialResult<(Device, Vec<VirtualRegister>)> {
    let descriptor = registry.get(&config.protocol)?;
    let device = descriptor.create(id, port, config)?;

    let mut channels = Vec::with_capacity(config.registers.len());
    for register in &config.registers {
        let kind = descriptor.kind(&register.kind)?;
        let channel_id = VirtualRegisterId((first_channel + channels.len()) as u32);
        channels.push(VirtualRegister::from_config(
            channel_id,
            id,
            kind,
            register,
            port.poll_interval,
            arena,
        )?);
    }
    Ok((device, channels))
}

/// Read ranges of all devices. A register shared by channels with different
/// intervals is polled at the fastest one.
fn build_ranges(devices: &[Device], registers: &[VirtualRegister]) -> Vec<RegisterRange> {
    let mut ranges = Vec::new();
    for device in devices {
        let mut candidates: HashMap<RegisterId, RangeCandidate> = HashMap::new();
        for channel in registers
            .iter()
            .filter(|c| c.device() == device.id() && c.is_polled())
        {
            for binding in channel.bindings() {
                candidates
                    .entry(binding.register)
                    .and_modify(|c| c.poll_interval = c.poll_interval.min(channel.poll_interval()))
                    .or_insert(RangeCandidate {
                        register: binding.register,
                        kind: channel.kind(),
                        address: binding.address,
                        poll_interval: channel.poll_interval(),
                    });
            }
        }
        ranges.extend(split_register_list(
            device.id(),
            candidates.into_values().collect(),
            device.limits(),
        ));
    }
    ranges
}
