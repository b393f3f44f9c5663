use embassy_time::Duration;
use serde::{Deserialize, Serialize};

use crate::platform::PinId;

/// Board wiring of one transducer chip.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsicPins {
    pub program: PinId,
    pub reset: PinId,
    /// Shared trigger line input; doubles as the chip's data-ready output.
    pub trigger: PinId,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsicConfig {
    /// Runtime bus address assigned during programming (8-bit form).
    pub bus_address: u8,
    pub pins: AsicPins,
}

/// Protocol timings of the transducer chips.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsicTiming {
    pub reset_hold_ms: u32,
    pub program_entry_ms: u32,
    pub program_settle_ms: u32,
    pub ready_settle_ms: u32,
    /// Length of the trigger pulse the chips measure during calibration.
    pub calibration_window_ms: u32,
    pub acquisition_window_ms: u32,
    pub trigger_pulse_us: u32,
}

impl AsicTiming {
    pub fn reset_hold(&self) -> Duration {
        Duration::from_millis(self.reset_hold_ms as u64)
    }

    pub fn program_entry(&self) -> Duration {
        Duration::from_millis(self.program_entry_ms as u64)
    }

    pub fn program_settle(&self) -> Duration {
        Duration::from_millis(self.program_settle_ms as u64)
    }

    pub fn ready_settle(&self) -> Duration {
        Duration::from_millis(self.ready_settle_ms as u64)
    }

    pub fn calibration_window(&self) -> Duration {
        Duration::from_millis(self.calibration_window_ms as u64)
    }

    pub fn acquisition_window(&self) -> Duration {
        Duration::from_millis(self.acquisition_window_ms as u64)
    }
}

impl Default for AsicTiming {
    fn default() -> Self {
        Self {
            reset_hold_ms: 100,
            program_entry_ms: 100,
            program_settle_ms: 100,
            ready_settle_ms: 60,
            calibration_window_ms: 160,
            acquisition_window_ms: 15,
            trigger_pulse_us: 5,
        }
    }
}

/// How the end of an acquisition is detected.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionGate {
    /// Wait a fixed acquisition window.
    Window,
    /// Wait for the receiver to raise its data-ready line.
    Interrupt,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangingConfig {
    pub max_range: u8,
    /// Calibration pulse length in the units the chips report against.
    pub calibration_pulse_length: u32,
    pub gate: AcquisitionGate,
    /// Spacing between ranging cycles started by `Anemometer::run`.
    pub cycle_period_ms: u32,
    /// Transducer separation. Enables the wind estimate when set.
    pub path_length_mm: Option<u32>,
}

impl RangingConfig {
    pub fn cycle_period(&self) -> Duration {
        Duration::from_millis(self.cycle_period_ms as u64)
    }

    pub fn path_length_m(&self) -> Option<f64> {
        self.path_length_mm.map(|mm| mm as f64 / 1000.0)
    }
}

impl Default for RangingConfig {
    fn default() -> Self {
        Self {
            max_range: 0x10,
            calibration_pulse_length: 160,
            gate: AcquisitionGate::Window,
            cycle_period_ms: 1000,
            path_length_mm: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnemometerConfig {
    pub asic_a: AsicConfig,
    pub asic_b: AsicConfig,
    pub timing: AsicTiming,
    pub ranging: RangingConfig,
    pub watchdog_period_ms: u32,
}

impl AnemometerConfig {
    pub fn watchdog_period(&self) -> Duration {
        Duration::from_millis(self.watchdog_period_ms as u64)
    }
}

impl Default for AnemometerConfig {
    fn default() -> Self {
        Self {
            asic_a: AsicConfig {
                bus_address: 0x30,
                pins: AsicPins {
                    program: PinId(16),
                    reset: PinId(6),
                    trigger: PinId(14),
                },
            },
            asic_b: AsicConfig {
                bus_address: 0x40,
                pins: AsicPins {
                    program: PinId(17),
                    reset: PinId(7),
                    trigger: PinId(15),
                },
            },
            timing: AsicTiming::default(),
            ranging: RangingConfig::default(),
            watchdog_period_ms: 1000,
        }
    }
}
