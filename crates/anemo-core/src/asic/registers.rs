//! Register map of the time-of-flight transducer chip.

/// Address the chip answers on while in program mode (8-bit form).
pub const FACTORY_ADDRESS: u8 = 0x8A;

// Program-mode registers
pub const PROG_ADDR: u8 = 0x85;
pub const PROG_CNT: u8 = 0x87;
pub const PROG_CTL: u8 = 0xC4;
pub const PROG_DATA: u8 = 0xC6;
pub const PROG_CPU: u8 = 0xC2;

/// Value written to `PROG_CTL` to execute the staged memory transfer.
pub const PROG_CTL_EXECUTE: u8 = 0x0B;
/// Value written to `PROG_CPU` to release the chip CPU.
pub const PROG_CPU_RUN: u8 = 0x02;
/// Program memory address the firmware image is loaded at.
pub const FIRMWARE_LOAD_ADDRESS: u16 = 0xF800;
/// RAM location holding the runtime bus address.
pub const BUS_ADDRESS_LOCATION: u16 = 0x01C5;

// Runtime registers
pub const OPMODE: u8 = 0x01;
pub const TICK_INTERVAL: u8 = 0x02;
pub const CAL_TRIG: u8 = 0x06;
pub const MAX_RANGE: u8 = 0x07;
pub const CAL_RESULT: u8 = 0x0A;
pub const READY: u8 = 0x14;
/// Start of the waveform block: scale factor, TOF, intensity, IQ samples.
pub const TOF_SF: u8 = 0x16;

/// `READY` reads back this value once the firmware is running.
pub const READY_VALUE: u8 = 0x02;

/// Operating mode written to `OPMODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpMode {
    Idle = 0x00,
    /// Transmit a burst, then listen.
    TxRx = 0x10,
    /// Listen only.
    Rx = 0x20,
}

impl OpMode {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x00 => Some(OpMode::Idle),
            0x10 => Some(OpMode::TxRx),
            0x20 => Some(OpMode::Rx),
            _ => None,
        }
    }
}
