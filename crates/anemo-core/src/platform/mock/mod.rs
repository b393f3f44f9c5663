//! Simulated board for host tests and the desktop simulator.
//!
//! Time is virtual: it only moves when the scheduler parks in
//! [`Platform::wait_for_event`] (jumping to the next timer deadline) or when
//! a driver busy-waits with [`Platform::delay_us`]. Bus operations complete
//! immediately with a queued event, against either a modelled transducer
//! chip or a plain register-memory device. Faults can be injected per
//! address and occurrence.

mod chip;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::cell::RefCell;

use embassy_time::Duration;
use log::trace;

pub use chip::{AcousticPath, SimChip};

use super::{
    BusOp, BusRequest, Edge, HwEvent, Level, PinId, PinMode, Platform, PlatformError, Pull,
    TimerId, TransactionId,
};
use crate::asic::firmware::IMAGE_LEN;
use crate::asic::OpMode;
use crate::bus::{BusAddress, BusFlags, BusStatus};
use crate::config::AnemometerConfig;

/// Delay between a capture and the receiver raising its data-ready line.
const DATA_READY_DELAY_US: u64 = 12_000;

/// Oscillator frequencies of the two modelled chips.
pub const CHIP_A_CLOCK_KHZ: f64 = 301.25;
pub const CHIP_B_CLOCK_KHZ: f64 = 298.5;

/// A deterministic firmware image for tests and the simulator.
pub fn test_firmware() -> Vec<u8> {
    (0..IMAGE_LEN).map(|n| (n * 7 + 3) as u8).collect()
}

/// Complete the `occurrence`-th operation of kind `op` to `address`
/// (counting from zero) with `status` instead of performing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusFault {
    pub address: BusAddress,
    pub op: BusOp,
    pub occurrence: usize,
    pub status: BusStatus,
}

/// One bus operation as seen by the simulated hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRecord {
    pub id: TransactionId,
    pub address: BusAddress,
    pub flags: BusFlags,
    pub op: BusOp,
    /// Payload written, or bytes returned by a read.
    pub data: Vec<u8>,
    pub status: BusStatus,
}

#[derive(Debug, Clone, Copy)]
struct PinState {
    mode: PinMode,
    level: Level,
    pull: Pull,
    irq: Option<Edge>,
}

impl Default for PinState {
    fn default() -> Self {
        Self {
            mode: PinMode::Input,
            level: Level::Low,
            pull: Pull::None,
            irq: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ArmedTimer {
    deadline_us: u64,
    period_us: Option<u64>,
}

/// Register file answering at one bus address.
struct MemoryDevice {
    bytes: [u8; 256],
    pointer: u8,
}

impl MemoryDevice {
    fn transfer(&mut self, op: BusOp, mut buffer: Vec<u8>) -> (BusStatus, Vec<u8>) {
        match op {
            BusOp::Write => {
                if let Some((&register, data)) = buffer.split_first() {
                    self.pointer = register;
                    for (n, byte) in data.iter().enumerate() {
                        self.bytes[(register as usize + n) % 256] = *byte;
                    }
                }
            }
            BusOp::Read => {
                for (n, byte) in buffer.iter_mut().enumerate() {
                    *byte = self.bytes[(self.pointer as usize + n) % 256];
                }
            }
        }
        (BusStatus::Ok, buffer)
    }
}

struct MockState {
    now_us: u64,
    pins: BTreeMap<PinId, PinState>,
    timers: BTreeMap<TimerId, ArmedTimer>,
    /// Pending data-ready edges: (due time, chip index).
    data_ready: Vec<(u64, usize)>,
    events: VecDeque<HwEvent>,
    chips: Vec<SimChip>,
    memories: BTreeMap<BusAddress, MemoryDevice>,
    acoustic: AcousticPath,
    log: Vec<BusRecord>,
    faults: Vec<BusFault>,
    op_counts: BTreeMap<(BusAddress, bool), usize>,
    auto_complete: bool,
    held: Vec<(TransactionId, BusRequest)>,
    reject_next: bool,
    watchdog_kicks: u32,
}

pub struct MockPlatform {
    state: RefCell<MockState>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(MockState {
                now_us: 0,
                pins: BTreeMap::new(),
                timers: BTreeMap::new(),
                data_ready: Vec::new(),
                events: VecDeque::new(),
                chips: Vec::new(),
                memories: BTreeMap::new(),
                acoustic: AcousticPath::default(),
                log: Vec::new(),
                faults: Vec::new(),
                op_counts: BTreeMap::new(),
                auto_complete: true,
                held: Vec::new(),
                reject_next: false,
                watchdog_kicks: 0,
            }),
        }
    }

    /// Board with both transducer chips wired as in `config`, expecting
    /// `firmware`, facing each other across `path`.
    pub fn anemometer(config: &AnemometerConfig, firmware: &[u8], path: AcousticPath) -> Self {
        Self::new()
            .with_chip(SimChip::new(config.asic_a.pins, CHIP_A_CLOCK_KHZ, firmware.to_vec()))
            .with_chip(SimChip::new(config.asic_b.pins, CHIP_B_CLOCK_KHZ, firmware.to_vec()))
            .with_acoustic_path(path)
    }

    /// Add a chip. Chips added earlier sit at the A end of the path.
    pub fn with_chip(self, chip: SimChip) -> Self {
        self.state.borrow_mut().chips.push(chip);
        self
    }

    pub fn with_acoustic_path(self, path: AcousticPath) -> Self {
        self.state.borrow_mut().acoustic = path;
        self
    }

    pub fn set_wind(&self, wind_mps: f64) {
        self.state.borrow_mut().acoustic.wind_mps = wind_mps;
    }

    /// Attach a register-memory device at `address` (if absent) and store
    /// `bytes` from `start`.
    pub fn set_memory(&self, address: BusAddress, start: u8, bytes: &[u8]) {
        let mut state = self.state.borrow_mut();
        let device = state.memories.entry(address).or_insert(MemoryDevice {
            bytes: [0; 256],
            pointer: 0,
        });
        for (n, byte) in bytes.iter().enumerate() {
            device.bytes[(start as usize + n) % 256] = *byte;
        }
    }

    pub fn inject_fault(&self, fault: BusFault) {
        self.state.borrow_mut().faults.push(fault);
    }

    /// The next `bus_issue` hands its request straight back.
    pub fn reject_next_issue(&self) {
        self.state.borrow_mut().reject_next = true;
    }

    /// When disabled, issued requests are held until [`Self::complete`].
    pub fn set_auto_complete(&self, enabled: bool) {
        self.state.borrow_mut().auto_complete = enabled;
    }

    pub fn held_requests(&self) -> Vec<(TransactionId, BusRequest)> {
        self.state.borrow().held.clone()
    }

    /// Queue a completion event for `id`, held or not.
    pub fn complete(&self, id: TransactionId, status: BusStatus, buffer: Vec<u8>) {
        let mut state = self.state.borrow_mut();
        state.held.retain(|(held, _)| *held != id);
        state.events.push_back(HwEvent::BusComplete { id, status, buffer });
    }

    pub fn bus_log(&self) -> Vec<BusRecord> {
        self.state.borrow().log.clone()
    }

    pub fn watchdog_kicks(&self) -> u32 {
        self.state.borrow().watchdog_kicks
    }

    pub fn armed_timers(&self) -> usize {
        self.state.borrow().timers.len()
    }

    pub fn level(&self, pin: PinId) -> Level {
        self.state
            .borrow()
            .pins
            .get(&pin)
            .map(|p| p.level)
            .unwrap_or(Level::Low)
    }

    pub fn pull(&self, pin: PinId) -> Pull {
        self.state
            .borrow()
            .pins
            .get(&pin)
            .map(|p| p.pull)
            .unwrap_or(Pull::None)
    }

    pub fn irq_enabled(&self, pin: PinId) -> bool {
        self.state
            .borrow()
            .pins
            .get(&pin)
            .is_some_and(|p| p.irq.is_some())
    }

    /// Drive an input pin from outside, raising its interrupt if enabled.
    pub fn drive_input(&self, pin: PinId, level: Level) {
        let mut state = self.state.borrow_mut();
        state.drive_input(pin, level);
    }

    pub fn chip_firmware_received(&self, index: usize) -> usize {
        self.state
            .borrow()
            .chips
            .get(index)
            .map(|c| c.image.len())
            .unwrap_or(0)
    }

    pub fn chip_address(&self, index: usize) -> Option<u8> {
        self.state.borrow().chips.get(index).and_then(|c| c.address)
    }

    pub fn chip_opmode(&self, index: usize) -> Option<OpMode> {
        self.state.borrow().chips.get(index).map(|c| c.opmode())
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockState {
    fn pin(&mut self, pin: PinId) -> &mut PinState {
        self.pins.entry(pin).or_default()
    }

    fn drive_input(&mut self, pin: PinId, level: Level) {
        let state = self.pin(pin);
        if state.mode != PinMode::Input || state.level == level {
            return;
        }
        state.level = level;
        if state.irq.is_some_and(|edge| edge.matches(level)) {
            self.events.push_back(HwEvent::PinEdge(pin));
        }
    }

    /// Let the chips react to output pins that just switched to `level`.
    fn pins_changed(&mut self, changed: &[PinId], level: Level) {
        let now = self.now_us;
        let mut bursting = Vec::new();

        for (index, chip) in self.chips.iter_mut().enumerate() {
            let program = self
                .pins
                .get(&chip.pins.program)
                .map(|p| p.level)
                .unwrap_or(Level::Low);
            for &pin in changed {
                if pin == chip.pins.reset {
                    chip.on_reset(level, program);
                }
                if pin == chip.pins.program {
                    chip.on_program(level);
                }
                if pin == chip.pins.trigger && chip.on_trigger(level, now) {
                    bursting.push(index);
                }
            }
        }

        if !bursting.is_empty() {
            self.burst(&bursting);
        }
    }

    /// One trigger edge reached every chip in `fired` at once.
    fn burst(&mut self, fired: &[usize]) {
        let Some(&tx) = fired
            .iter()
            .find(|&&index| self.chips[index].opmode() == OpMode::TxRx)
        else {
            return;
        };

        for &rx in fired {
            if self.chips[rx].opmode() != OpMode::Rx {
                continue;
            }
            let tof_us = self.acoustic.tof_us(tx < rx);
            trace!("mock: burst {} -> {}, tof {:.3} us", tx, rx, tof_us);
            self.chips[rx].capture(tof_us);
            self.data_ready.push((self.now_us + DATA_READY_DELAY_US, rx));
        }
    }

    fn execute(&mut self, request: BusRequest) -> (BusStatus, Vec<u8>) {
        let is_read = request.op == BusOp::Read;
        let counter = self.op_counts.entry((request.address, is_read)).or_insert(0);
        let occurrence = *counter;
        *counter += 1;

        if let Some(fault) = self.faults.iter().find(|f| {
            f.address == request.address && f.op == request.op && f.occurrence == occurrence
        }) {
            return (fault.status, request.buffer);
        }

        if let BusAddress::External(device) = request.address {
            if let Some(chip) = self.chips.iter_mut().find(|c| c.responds_to(device)) {
                return chip.transfer(request.flags, request.op, request.buffer);
            }
        }
        if let Some(memory) = self.memories.get_mut(&request.address) {
            return memory.transfer(request.op, request.buffer);
        }
        (BusStatus::AddressNak, request.buffer)
    }

    fn next_deadline(&self) -> Option<u64> {
        let timer = self.timers.values().map(|t| t.deadline_us).min();
        let ready = self.data_ready.iter().map(|(due, _)| *due).min();
        match (timer, ready) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Queue everything due at or before the current time.
    fn expire(&mut self) {
        let now = self.now_us;

        let mut due: Vec<(u64, TimerId)> = self
            .timers
            .iter()
            .filter(|(_, t)| t.deadline_us <= now)
            .map(|(id, t)| (t.deadline_us, *id))
            .collect();
        due.sort();
        for (_, id) in due {
            self.events.push_back(HwEvent::TimerFired(id));
            let remove = match self.timers.get_mut(&id) {
                Some(timer) => match timer.period_us {
                    Some(period) => {
                        timer.deadline_us += period.max(1);
                        false
                    }
                    None => true,
                },
                None => false,
            };
            if remove {
                self.timers.remove(&id);
            }
        }

        let (ready, waiting): (Vec<_>, Vec<_>) = core::mem::take(&mut self.data_ready)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        self.data_ready = waiting;
        for (_, chip) in ready {
            let pin = self.chips[chip].pins.trigger;
            self.drive_input(pin, Level::High);
        }
    }
}

impl Platform for MockPlatform {
    fn pin_configure(&self, pin: PinId, mode: PinMode) -> Result<(), PlatformError> {
        let mut state = self.state.borrow_mut();
        let pin = state.pin(pin);
        pin.mode = mode;
        if mode == PinMode::Input {
            pin.level = Level::Low;
        }
        Ok(())
    }

    fn pin_set(&self, pin: PinId, level: Level) -> Result<(), PlatformError> {
        self.pin_set_group(&[pin], level)
    }

    fn pin_set_group(&self, pins: &[PinId], level: Level) -> Result<(), PlatformError> {
        let mut state = self.state.borrow_mut();
        let mut changed = Vec::new();
        for &pin in pins {
            let entry = state.pin(pin);
            if entry.mode != PinMode::Output {
                return Err(PlatformError::NotOutput(pin));
            }
            if entry.level != level {
                entry.level = level;
                changed.push(pin);
            }
        }
        if !changed.is_empty() {
            state.pins_changed(&changed, level);
        }
        Ok(())
    }

    fn pin_get(&self, pin: PinId) -> Result<Level, PlatformError> {
        Ok(self.level(pin))
    }

    fn pin_set_pull(&self, pin: PinId, pull: Pull) -> Result<(), PlatformError> {
        self.state.borrow_mut().pin(pin).pull = pull;
        Ok(())
    }

    fn pin_enable_irq(&self, pin: PinId, edge: Edge) -> Result<(), PlatformError> {
        self.state.borrow_mut().pin(pin).irq = Some(edge);
        Ok(())
    }

    fn pin_disable_irq(&self, pin: PinId) {
        self.state.borrow_mut().pin(pin).irq = None;
    }

    fn bus_issue(&self, id: TransactionId, request: BusRequest) -> Result<(), BusRequest> {
        let mut state = self.state.borrow_mut();
        if state.reject_next {
            state.reject_next = false;
            return Err(request);
        }
        if !state.auto_complete {
            state.held.push((id, request));
            return Ok(());
        }

        let (address, flags, op) = (request.address, request.flags, request.op);
        let (status, buffer) = state.execute(request);
        state.log.push(BusRecord {
            id,
            address,
            flags,
            op,
            data: buffer.clone(),
            status,
        });
        state
            .events
            .push_back(HwEvent::BusComplete { id, status, buffer });
        Ok(())
    }

    fn timer_arm(&self, id: TimerId, delay: Duration, periodic: bool) -> Result<(), PlatformError> {
        let mut state = self.state.borrow_mut();
        let delay_us = delay.as_micros();
        let deadline_us = state.now_us + delay_us;
        state.timers.insert(
            id,
            ArmedTimer {
                deadline_us,
                period_us: periodic.then_some(delay_us),
            },
        );
        Ok(())
    }

    fn timer_cancel(&self, id: TimerId) {
        self.state.borrow_mut().timers.remove(&id);
    }

    fn take_event(&self) -> Option<HwEvent> {
        self.state.borrow_mut().events.pop_front()
    }

    fn wait_for_event(&self) {
        let mut state = self.state.borrow_mut();
        if !state.events.is_empty() {
            return;
        }
        let Some(deadline) = state.next_deadline() else {
            return;
        };
        state.now_us = state.now_us.max(deadline);
        state.expire();
    }

    fn delay_us(&self, us: u32) {
        self.state.borrow_mut().now_us += us as u64;
    }

    fn now_us(&self) -> u64 {
        self.state.borrow().now_us
    }

    fn kick_watchdog(&self) {
        self.state.borrow_mut().watchdog_kicks += 1;
    }
}
