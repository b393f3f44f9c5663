//! Driver for the ultrasonic time-of-flight transducer chips.
//!
//! Each chip boots without firmware. [`ChirpAsic::program`] uploads the image
//! over the bus at the factory address, moves the chip to its runtime
//! address and starts its CPU. After a readiness check the chip is
//! calibrated against a trigger pulse of known length and can then take part
//! in pitch/catch sampling with its partner.

mod driver;
pub mod firmware;
pub mod registers;
pub mod sample;

use thiserror_no_std::Error;

pub use driver::{AsicState, ChirpAsic};
pub use firmware::FirmwareImage;
pub use registers::OpMode;
pub use sample::{IqSample, SampleBlock};

use crate::bus::BusError;
use crate::gpio::GpioError;
use crate::platform::PlatformError;

/// Lifecycle of one chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Unprogrammed,
    Programming,
    Ready,
    Calibrating,
    Calibrated,
    Sampling,
    /// Failed its readiness check. Terminal.
    Faulted,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AsicError {
    #[error("bus error: {0}")]
    Bus(BusError),
    #[error("gpio error: {0}")]
    Gpio(GpioError),
    #[error("platform error: {0}")]
    Platform(PlatformError),
    #[error("chip at {address:#04x} not ready (READY = {value:#04x})")]
    NotReady { address: u8, value: u8 },
    #[error("operation needs stage {expected:?}, chip is {actual:?}")]
    InvalidStage { expected: Stage, actual: Stage },
    #[error("chip is faulted")]
    Faulted,
    #[error("firmware image must be {expected} bytes, got {actual}")]
    FirmwareSize { expected: usize, actual: usize },
    #[error("short register read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
}

impl From<BusError> for AsicError {
    fn from(error: BusError) -> Self {
        AsicError::Bus(error)
    }
}

impl From<GpioError> for AsicError {
    fn from(error: GpioError) -> Self {
        AsicError::Gpio(error)
    }
}

impl From<PlatformError> for AsicError {
    fn from(error: PlatformError) -> Self {
        AsicError::Platform(error)
    }
}
