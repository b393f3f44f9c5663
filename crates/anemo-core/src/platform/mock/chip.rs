//! Behavioural model of one transducer chip and the air path between two.

use alloc::vec::Vec;

use crate::asic::registers::*;
use crate::asic::sample::{BLOCK_LEN, SAMPLE_COUNT};
use crate::asic::{IqSample, SampleBlock};
use crate::bus::{BusFlags, BusStatus};
use crate::config::AsicPins;
use crate::platform::{BusOp, Level};

const CYCLES_PER_SAMPLE: f64 = 8.0;
const TX_OFFSET_SAMPLES: f64 = 4.0;
/// Samples over which the echo envelope rises from zero to full amplitude.
const RAMP_SAMPLES: f64 = 2.0;
const PEAK_AMPLITUDE: f64 = 2000.0;
const TICK_INTERVAL_VALUE: u16 = 100;

/// Straight acoustic path between chip A and chip B.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcousticPath {
    pub length_m: f64,
    pub sound_speed_mps: f64,
    /// Air speed along A to B. Negative values blow from B to A.
    pub wind_mps: f64,
}

impl AcousticPath {
    pub fn tof_us(&self, a_to_b: bool) -> f64 {
        let speed = if a_to_b {
            self.sound_speed_mps + self.wind_mps
        } else {
            self.sound_speed_mps - self.wind_mps
        };
        self.length_m / speed * 1e6
    }
}

impl Default for AcousticPath {
    fn default() -> Self {
        Self {
            length_m: 0.06,
            sound_speed_mps: 343.0,
            wind_mps: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimChip {
    pub(super) pins: AsicPins,
    clock_khz: f64,
    scale_factor: u16,
    expected_image: Vec<u8>,
    boots: bool,

    // Program mode
    pub(super) program_mode: bool,
    streaming: bool,
    prog_pointer: u16,
    prog_count: u16,
    prog_data: Option<u8>,
    load_address: u16,
    pub(super) image: Vec<u8>,
    assigned_address: Option<u8>,
    cpu_started: bool,

    // Runtime
    running: bool,
    pub(super) address: Option<u8>,
    pointer: u8,
    opmode: u8,
    max_range: u8,
    cal_armed: bool,
    cal_started_us: Option<u64>,
    cal_result: u16,
    block: [u8; BLOCK_LEN],
}

impl SimChip {
    /// A chip wired to `pins` whose oscillator runs at `clock_khz` and which
    /// reports ready only if it receives exactly `expected_image`.
    pub fn new(pins: AsicPins, clock_khz: f64, expected_image: Vec<u8>) -> Self {
        Self {
            pins,
            clock_khz,
            scale_factor: 2048,
            expected_image,
            boots: true,
            program_mode: false,
            streaming: false,
            prog_pointer: 0,
            prog_count: 0,
            prog_data: None,
            load_address: 0,
            image: Vec::new(),
            assigned_address: None,
            cpu_started: false,
            running: false,
            address: None,
            pointer: 0,
            opmode: OpMode::Idle as u8,
            max_range: 0,
            cal_armed: false,
            cal_started_us: None,
            cal_result: 0,
            block: [0; BLOCK_LEN],
        }
    }

    /// The firmware never comes up; READY stays 0.
    pub fn failing_boot(mut self) -> Self {
        self.boots = false;
        self
    }

    pub fn with_scale_factor(mut self, scale_factor: u16) -> Self {
        self.scale_factor = scale_factor;
        self
    }

    fn firmware_ok(&self) -> bool {
        self.load_address == FIRMWARE_LOAD_ADDRESS
            && self.image == self.expected_image
            && self.prog_count as usize + 1 == self.image.len()
    }

    fn ready_value(&self) -> u8 {
        if self.running && self.boots && self.firmware_ok() {
            READY_VALUE
        } else {
            0
        }
    }

    pub(super) fn responds_to(&self, device: u8) -> bool {
        if self.program_mode {
            device == FACTORY_ADDRESS
        } else {
            self.running && self.address == Some(device)
        }
    }

    // -------------------------------------------------------------------------
    // Pins
    // -------------------------------------------------------------------------

    pub(super) fn on_reset(&mut self, level: Level, program: Level) {
        match level {
            Level::Low => {
                let pins = self.pins;
                let clock = self.clock_khz;
                let scale = self.scale_factor;
                let image = core::mem::take(&mut self.expected_image);
                let boots = self.boots;
                *self = SimChip::new(pins, clock, image).with_scale_factor(scale);
                self.boots = boots;
            }
            Level::High => {
                if program == Level::High {
                    self.program_mode = true;
                }
            }
        }
    }

    pub(super) fn on_program(&mut self, level: Level) {
        if level == Level::Low && self.program_mode {
            self.program_mode = false;
            self.streaming = false;
            if self.cpu_started {
                self.running = true;
                self.address = self.assigned_address;
            }
        }
    }

    /// Returns `true` if this edge fires a burst or starts a capture.
    pub(super) fn on_trigger(&mut self, level: Level, now_us: u64) -> bool {
        if self.cal_armed {
            match level {
                Level::High => self.cal_started_us = Some(now_us),
                Level::Low => {
                    if let Some(start) = self.cal_started_us.take() {
                        let cycles = (now_us - start) as f64 * self.clock_khz / 1000.0;
                        self.cal_result = libm::round(cycles).min(u16::MAX as f64) as u16;
                        self.cal_armed = false;
                    }
                }
            }
            return false;
        }
        level == Level::High && self.running && self.opmode() != OpMode::Idle
    }

    pub(super) fn opmode(&self) -> OpMode {
        OpMode::from_raw(self.opmode).unwrap_or(OpMode::Idle)
    }

    /// Record the echo of a burst that took `tof_us` to arrive.
    pub(super) fn capture(&mut self, tof_us: f64) {
        let sample_period_us = CYCLES_PER_SAMPLE * 1000.0 / self.clock_khz;
        let arrival = tof_us / sample_period_us + TX_OFFSET_SAMPLES;

        let mut samples = [IqSample::default(); SAMPLE_COUNT];
        for (n, sample) in samples.iter_mut().enumerate() {
            let envelope = ((n as f64 - arrival) / RAMP_SAMPLES + 0.5).clamp(0.0, 1.0);
            let amplitude = PEAK_AMPLITUDE * envelope;
            sample.q = libm::round(amplitude * 0.6) as i16;
            sample.i = libm::round(amplitude * 0.8) as i16;
        }

        self.block = SampleBlock {
            scale_factor: self.scale_factor,
            chip_tof: libm::round(arrival * CYCLES_PER_SAMPLE) as u16,
            intensity: PEAK_AMPLITUDE as u16,
            samples,
        }
        .to_bytes();
    }

    // -------------------------------------------------------------------------
    // Bus
    // -------------------------------------------------------------------------

    pub(super) fn transfer(&mut self, flags: BusFlags, op: BusOp, buffer: Vec<u8>) -> (BusStatus, Vec<u8>) {
        if self.program_mode {
            return self.program_transfer(flags, op, buffer);
        }
        match op {
            BusOp::Write => {
                if let Some((&register, contents)) = buffer.split_first() {
                    self.pointer = register;
                    if let Some((&size, data)) = contents.split_first() {
                        let len = (size as usize).min(data.len());
                        self.write_register(register, &data[..len]);
                    }
                }
                (BusStatus::Ok, buffer)
            }
            BusOp::Read => {
                let map = self.register_map();
                let mut buffer = buffer;
                for (n, byte) in buffer.iter_mut().enumerate() {
                    *byte = map.get(self.pointer as usize + n).copied().unwrap_or(0);
                }
                (BusStatus::Ok, buffer)
            }
        }
    }

    fn program_transfer(&mut self, flags: BusFlags, op: BusOp, buffer: Vec<u8>) -> (BusStatus, Vec<u8>) {
        if op == BusOp::Read {
            return (BusStatus::Ok, buffer);
        }
        if self.streaming {
            self.image.extend_from_slice(&buffer);
            if flags.contains(BusFlags::STOP) {
                self.streaming = false;
            }
            return (BusStatus::Ok, buffer);
        }

        match buffer.as_slice() {
            [PROG_ADDR, lo, hi] => self.prog_pointer = u16::from_le_bytes([*lo, *hi]),
            [PROG_CNT, lo, hi] => self.prog_count = u16::from_le_bytes([*lo, *hi]),
            [PROG_DATA, value] => self.prog_data = Some(*value),
            [PROG_CTL, PROG_CTL_EXECUTE] => {
                if flags.contains(BusFlags::STOP) {
                    if self.prog_pointer == BUS_ADDRESS_LOCATION {
                        self.assigned_address = self.prog_data.map(|v| v << 1);
                    }
                } else {
                    self.streaming = true;
                    self.load_address = self.prog_pointer;
                    self.image.clear();
                }
            }
            [PROG_CPU, PROG_CPU_RUN] => self.cpu_started = true,
            _ => return (BusStatus::DataNak, buffer),
        }
        (BusStatus::Ok, buffer)
    }

    fn write_register(&mut self, register: u8, data: &[u8]) {
        let Some(&value) = data.first() else {
            return;
        };
        match register {
            OPMODE => self.opmode = value,
            MAX_RANGE => self.max_range = value,
            CAL_TRIG => {
                self.cal_armed = value == 1;
                self.cal_started_us = None;
            }
            _ => {}
        }
    }

    fn register_map(&self) -> [u8; 256] {
        let mut map = [0u8; 256];
        map[OPMODE as usize] = self.opmode;
        map[TICK_INTERVAL as usize..TICK_INTERVAL as usize + 2]
            .copy_from_slice(&TICK_INTERVAL_VALUE.to_le_bytes());
        map[CAL_TRIG as usize] = self.cal_armed as u8;
        map[MAX_RANGE as usize] = self.max_range;
        map[CAL_RESULT as usize..CAL_RESULT as usize + 2].copy_from_slice(&self.cal_result.to_le_bytes());
        map[READY as usize] = self.ready_value();
        map[TOF_SF as usize..TOF_SF as usize + BLOCK_LEN].copy_from_slice(&self.block);
        map
    }
}
